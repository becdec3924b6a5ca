//! Result of a successful fetch: the archive plus everything learned from it.

use std::path::Path;

use tracing::{debug, info, warn};

use super::archive::PackageArchive;
use super::error::PackageError;
use super::manifest::PluginManifest;
use crate::metadata::{Inspector, Platform};

/// Display metadata for one archive member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Member name as stored in the archive.
    pub name: String,
    /// Uncompressed size.
    pub size_bytes: u64,
    pub version: Option<String>,
    /// Absent for non-binary members and unreadable images.
    pub platform: Option<Platform>,
}

/// A downloaded package with exactly one plugin entry point.
///
/// Only [`PackageDescriptor::from_archive`] creates one, so holding a
/// descriptor means the archive has been scanned and accepted.
#[derive(Debug, Clone)]
pub struct PackageDescriptor {
    raw_archive: Vec<u8>,
    source_url: Option<String>,
    main_member_name: String,
    main_file_info: FileInfo,
    other_files: Vec<FileInfo>,
    manifest: Option<PluginManifest>,
}

impl PackageDescriptor {
    /// Scans `raw_archive` and builds a descriptor.
    ///
    /// Fails unless exactly one top-level DLL implements the entry-point
    /// contract. A missing or malformed manifest is not an error.
    pub fn from_archive(raw_archive: Vec<u8>, inspector: &Inspector) -> Result<Self, PackageError> {
        let (main_member_name, main_file_info, other_files, manifest) = {
            let mut archive = PackageArchive::open(&raw_archive)?;
            let main = archive.find_main_entry(inspector)?;
            info!("[PKG-SCAN] Main entry: {}", main);

            let main_info = archive.file_info(&main, inspector)?;

            let others: Vec<String> = archive
                .members()
                .iter()
                .filter(|member| !member.is_dir() && !member.file_name().is_empty())
                .filter(|member| member.name() != main)
                .map(|member| member.name().to_string())
                .collect();
            let mut other_files = Vec::with_capacity(others.len());
            for name in &others {
                other_files.push(archive.file_info(name, inspector)?);
            }

            let manifest_name = archive
                .find_manifest_member(&main)
                .map(|member| member.name().to_string());
            let manifest = match manifest_name {
                Some(name) => read_manifest(&mut archive, &name),
                None => {
                    debug!("[PKG-SCAN] No manifest next to {}", main);
                    None
                }
            };

            (main, main_info, other_files, manifest)
        };

        Ok(Self {
            raw_archive,
            source_url: None,
            main_member_name,
            main_file_info,
            other_files,
            manifest,
        })
    }

    /// Records where the archive was downloaded from.
    #[must_use]
    pub fn with_source_url(mut self, url: impl Into<String>) -> Self {
        self.source_url = Some(url.into());
        self
    }

    /// Complete archive bytes.
    #[must_use]
    pub fn raw_archive(&self) -> &[u8] {
        &self.raw_archive
    }

    #[must_use]
    pub fn source_url(&self) -> Option<&str> {
        self.source_url.as_deref()
    }

    /// Name of the member that passed the entry-point test.
    #[must_use]
    pub fn main_member_name(&self) -> &str {
        &self.main_member_name
    }

    #[must_use]
    pub fn main_file_info(&self) -> &FileInfo {
        &self.main_file_info
    }

    /// Every other non-directory member, in archive order.
    #[must_use]
    pub fn other_files(&self) -> &[FileInfo] {
        &self.other_files
    }

    #[must_use]
    pub fn manifest(&self) -> Option<&PluginManifest> {
        self.manifest.as_ref()
    }

    /// Main entry first, then the other members.
    pub fn files(&self) -> impl Iterator<Item = &FileInfo> {
        std::iter::once(&self.main_file_info).chain(self.other_files.iter())
    }

    /// Manifest name, falling back to the main member name.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.manifest
            .as_ref()
            .and_then(|manifest| manifest.name.as_deref())
            .unwrap_or(self.main_member_name.as_str())
    }

    /// Manifest internal name, falling back to the main member's stem.
    #[must_use]
    pub fn internal_name(&self) -> &str {
        self.manifest
            .as_ref()
            .and_then(|manifest| manifest.internal_name.as_deref())
            .unwrap_or_else(|| main_stem(&self.main_member_name))
    }
}

/// File stem of a top-level member name.
pub(crate) fn main_stem(name: &str) -> &str {
    Path::new(name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(name)
}

fn read_manifest(archive: &mut PackageArchive<'_>, name: &str) -> Option<PluginManifest> {
    let bytes = match archive.extract_member(name) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("[PKG-SCAN] Failed to read manifest {}: {}", name, e);
            return None;
        }
    };

    match PluginManifest::from_slice(&bytes) {
        Ok(manifest) => Some(manifest),
        Err(e) => {
            warn!("[PKG-SCAN] Ignoring malformed manifest {}: {}", name, e);
            None
        }
    }
}
