//! Package installer.
//!
//! Writes a descriptor's archive into a target directory. Stale root `.dll`
//! files from a previous version are recycled first; every other member is
//! then extracted, and the main entry is written last so a host watching
//! for it never sees it before its dependencies.
//!
//! Installation is best effort: per-member failures are collected and the
//! pass continues. There is no rollback and no cancellation.

use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::archive::{ArchiveMember, PLUGIN_EXTENSION, PackageArchive};
use super::descriptor::PackageDescriptor;
use super::error::{InstallError, PackageError};
use super::gate::OperationGate;
use super::recycle::{RecycleBin, Recycler};

/// What went wrong with one member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// A stale file could not be recycled.
    Recycle,
    /// A member could not be written.
    Extract,
    /// The main entry is absent from the archive.
    MainEntryMissing,
}

/// A non-fatal failure for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberFailure {
    pub name: String,
    pub kind: FailureKind,
    pub message: String,
}

impl fmt::Display for MemberFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FailureKind::Recycle => write!(f, "Failed to delete {}: {}", self.name, self.message),
            FailureKind::Extract => write!(f, "Failed to extract {}: {}", self.name, self.message),
            FailureKind::MainEntryMissing => {
                write!(f, "Main plugin DLL {} not found in archive.", self.name)
            }
        }
    }
}

/// What an install pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    /// Original paths of recycled files.
    pub recycled: Vec<PathBuf>,
    /// Member names in the order they were written.
    pub written: Vec<String>,
    pub failures: Vec<MemberFailure>,
}

/// Result of [`PackageInstaller::install`].
#[derive(Debug)]
pub enum InstallOutcome {
    /// Every step succeeded.
    Installed(InstallReport),
    /// The pass ran but some files failed.
    Partial(InstallReport),
    /// Nothing was attempted.
    Rejected(InstallError),
}

impl InstallOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Installed(_))
    }

    #[must_use]
    pub fn report(&self) -> Option<&InstallReport> {
        match self {
            Self::Installed(report) | Self::Partial(report) => Some(report),
            Self::Rejected(_) => None,
        }
    }
}

/// Installs descriptors into directories, one at a time.
pub struct PackageInstaller {
    gate: OperationGate,
    recycler: Arc<dyn Recycler>,
}

impl Default for PackageInstaller {
    fn default() -> Self {
        Self::new(Arc::new(RecycleBin::default()))
    }
}

impl PackageInstaller {
    #[must_use]
    pub fn new(recycler: Arc<dyn Recycler>) -> Self {
        Self {
            gate: OperationGate::new(),
            recycler,
        }
    }

    /// Returns true while an install is running.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.gate.is_busy()
    }

    /// Installs `descriptor` into `target`.
    pub fn install(&self, descriptor: &PackageDescriptor, target: &Path) -> InstallOutcome {
        self.install_with(descriptor, target, |_| {})
    }

    /// Installs `descriptor` into `target`, reporting each failure message
    /// to `on_error` as it happens.
    pub fn install_with<F>(&self, descriptor: &PackageDescriptor, target: &Path, mut on_error: F) -> InstallOutcome
    where
        F: FnMut(&str),
    {
        let Some(_pass) = self.gate.try_enter() else {
            let error = InstallError::Busy;
            warn!("[PKG-INSTALL] Rejected: {}", error);
            on_error(&error.to_string());
            return InstallOutcome::Rejected(error);
        };

        info!(
            "[PKG-INSTALL] Installing {} into {}",
            descriptor.main_member_name(),
            target.display()
        );

        match self.run(descriptor, target, &mut on_error) {
            Ok(report) if report.failures.is_empty() => {
                info!("[PKG-INSTALL] Installed {} files", report.written.len());
                InstallOutcome::Installed(report)
            }
            Ok(report) => {
                warn!(
                    "[PKG-INSTALL] Installed {} files with {} failures",
                    report.written.len(),
                    report.failures.len()
                );
                InstallOutcome::Partial(report)
            }
            Err(error) => {
                warn!("[PKG-INSTALL] Install failed: {}", error);
                on_error(&error.to_string());
                InstallOutcome::Rejected(error)
            }
        }
    }

    fn run(
        &self,
        descriptor: &PackageDescriptor,
        target: &Path,
        on_error: &mut dyn FnMut(&str),
    ) -> Result<InstallReport, InstallError> {
        if descriptor.raw_archive().is_empty() {
            return Err(InstallError::MissingArchive);
        }
        if target.to_string_lossy().trim().is_empty() {
            return Err(InstallError::InvalidTarget);
        }

        fs::create_dir_all(target)?;
        let mut archive = PackageArchive::open(descriptor.raw_archive())?;
        let mut report = InstallReport::default();

        self.reconcile(&archive, target, &mut report, on_error)?;

        let main = descriptor.main_member_name();
        let main_member = archive
            .member(main)
            .or_else(|| {
                archive
                    .members()
                    .iter()
                    .find(|member| member.name().eq_ignore_ascii_case(main))
            })
            .cloned();

        let members: Vec<ArchiveMember> = archive
            .members()
            .iter()
            .filter(|member| !member.is_dir() && !member.file_name().is_empty())
            .filter(|member| !member.name().eq_ignore_ascii_case(main))
            .cloned()
            .collect();

        for member in &members {
            extract(&mut archive, member, target, &mut report, on_error);
        }

        match main_member {
            Some(member) => extract(&mut archive, &member, target, &mut report, on_error),
            None => record(
                &mut report,
                on_error,
                MemberFailure {
                    name: main.to_string(),
                    kind: FailureKind::MainEntryMissing,
                    message: String::new(),
                },
            ),
        }

        Ok(report)
    }

    /// Recycles root `.dll` files the new package does not ship.
    fn reconcile(
        &self,
        archive: &PackageArchive<'_>,
        target: &Path,
        report: &mut InstallReport,
        on_error: &mut dyn FnMut(&str),
    ) -> Result<(), InstallError> {
        let incoming: HashSet<String> = archive
            .top_level_members()
            .filter(|member| member.has_extension(PLUGIN_EXTENSION))
            .map(|member| member.file_name().to_lowercase())
            .collect();

        // snapshot before touching anything
        let existing = root_plugin_files(target)?;

        for path in existing {
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            if incoming.contains(&name.to_lowercase()) {
                continue;
            }

            match self.recycler.recycle(&path) {
                Ok(destination) => {
                    debug!("[PKG-INSTALL] Recycled stale {} to {}", name, destination.display());
                    report.recycled.push(path);
                }
                Err(e) => record(
                    report,
                    on_error,
                    MemberFailure {
                        name,
                        kind: FailureKind::Recycle,
                        message: e.to_string(),
                    },
                ),
            }
        }

        Ok(())
    }
}

/// Root-level `.dll` files currently in `dir`.
fn root_plugin_files(dir: &Path) -> Result<Vec<PathBuf>, InstallError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_plugin = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(PLUGIN_EXTENSION));
        if is_plugin && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn extract(
    archive: &mut PackageArchive<'_>,
    member: &ArchiveMember,
    target: &Path,
    report: &mut InstallReport,
    on_error: &mut dyn FnMut(&str),
) {
    let result = match member.enclosed_path() {
        Some(relative) => write_member(archive, member, &target.join(relative)),
        None => Err(PackageError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "path escapes the target directory",
        ))),
    };

    match result {
        Ok(()) => {
            debug!("[PKG-INSTALL] Wrote {}", member.name());
            report.written.push(member.name().to_string());
        }
        Err(e) => record(
            report,
            on_error,
            MemberFailure {
                name: member.name().to_string(),
                kind: FailureKind::Extract,
                message: e.to_string(),
            },
        ),
    }
}

fn write_member(archive: &mut PackageArchive<'_>, member: &ArchiveMember, destination: &Path) -> Result<(), PackageError> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(destination)?;
    archive.copy_member(member, &mut file)?;
    Ok(())
}

fn record(report: &mut InstallReport, on_error: &mut dyn FnMut(&str), failure: MemberFailure) {
    let message = failure.to_string();
    warn!("[PKG-INSTALL] {}", message);
    on_error(&message);
    report.failures.push(failure);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Inspector;
    use crate::test_support::{AssemblyFixture, zip_archive};
    use tempfile::TempDir;

    /// Recycler that deletes outright, for tests.
    struct Shredder;

    impl Recycler for Shredder {
        fn recycle(&self, path: &Path) -> std::io::Result<PathBuf> {
            fs::remove_file(path)?;
            Ok(path.to_path_buf())
        }
    }

    fn installer() -> PackageInstaller {
        PackageInstaller::new(Arc::new(Shredder))
    }

    fn descriptor(members: &[(&str, &[u8])]) -> PackageDescriptor {
        PackageDescriptor::from_archive(zip_archive(members), &Inspector::default())
            .expect("descriptor")
    }

    fn plugin() -> Vec<u8> {
        AssemblyFixture::plugin("MyPlugin").build()
    }

    #[test]
    fn test_install_writes_members() {
        let target = TempDir::new().expect("temp dir");
        let plugin = plugin();
        let descriptor = descriptor(&[
            ("MyPlugin.dll", &plugin),
            ("assets/", b""),
            ("assets/icon.png", b"png"),
            ("MyPlugin.json", b"{}"),
        ]);

        let outcome = installer().install(&descriptor, target.path());

        assert!(outcome.is_success(), "{:?}", outcome);
        let report = outcome.report().expect("report");
        assert_eq!(report.written, ["assets/icon.png", "MyPlugin.json", "MyPlugin.dll"]);
        assert_eq!(fs::read(target.path().join("assets/icon.png")).expect("read"), b"png");
        assert_eq!(fs::read(target.path().join("MyPlugin.dll")).expect("read"), plugin);
    }

    #[test]
    fn test_creates_target() {
        let root = TempDir::new().expect("temp dir");
        let target = root.path().join("a/b/MyPlugin");
        let descriptor = descriptor(&[("MyPlugin.dll", &plugin())]);

        assert!(installer().install(&descriptor, &target).is_success());
        assert!(target.join("MyPlugin.dll").is_file());
    }

    #[test]
    fn test_invalid_target() {
        let descriptor = descriptor(&[("MyPlugin.dll", &plugin())]);
        let mut messages = Vec::new();

        let outcome = installer().install_with(&descriptor, Path::new("  "), |m| {
            messages.push(m.to_string());
        });

        assert!(matches!(outcome, InstallOutcome::Rejected(InstallError::InvalidTarget)));
        assert_eq!(messages, ["Target directory is invalid."]);
        assert!(!Path::new("  ").exists());
    }

    #[test]
    fn test_busy() {
        let target = TempDir::new().expect("temp dir");
        let descriptor = descriptor(&[("MyPlugin.dll", &plugin())]);
        let installer = installer();

        let _held = installer.gate.try_enter().expect("enter");
        let outcome = installer.install(&descriptor, target.path());

        assert!(matches!(outcome, InstallOutcome::Rejected(InstallError::Busy)));
        assert!(!target.path().join("MyPlugin.dll").exists());
    }

    #[test]
    fn test_refuses_escaping_member() {
        let root = TempDir::new().expect("temp dir");
        let target = root.path().join("plugin");
        let descriptor = descriptor(&[("MyPlugin.dll", &plugin()), ("../evil.txt", b"x")]);

        let outcome = installer().install(&descriptor, &target);

        let report = match outcome {
            InstallOutcome::Partial(report) => report,
            other => panic!("expected partial install, got {:?}", other),
        };
        assert_eq!(report.written, ["MyPlugin.dll"]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].kind, FailureKind::Extract);
        assert!(!root.path().join("evil.txt").exists());
    }

    #[test]
    fn test_failure_display() {
        let failure = |kind| MemberFailure {
            name: "A.dll".to_string(),
            kind,
            message: "denied".to_string(),
        };

        assert_eq!(failure(FailureKind::Recycle).to_string(), "Failed to delete A.dll: denied");
        assert_eq!(failure(FailureKind::Extract).to_string(), "Failed to extract A.dll: denied");
        assert_eq!(
            failure(FailureKind::MainEntryMissing).to_string(),
            "Main plugin DLL A.dll not found in archive."
        );
    }
}
