//! In-memory ZIP package scanning.
//!
//! Members are fully materialised before any sniffing; nothing here touches
//! the filesystem.

use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};

use tracing::debug;
use zip::ZipArchive;

use super::descriptor::FileInfo;
use super::error::PackageError;
use crate::config::DEFAULT_MAX_ARCHIVE_BYTES;
use crate::metadata::Inspector;

/// Extension of loadable plugin binaries.
pub const PLUGIN_EXTENSION: &str = "dll";

/// Extensions whose members get version/platform inspection.
const INSPECTED_EXTENSIONS: [&str; 2] = ["dll", "exe"];

/// Extension of the sidecar manifest.
const MANIFEST_EXTENSION: &str = "json";

/// Largest uncompressed member accepted by default.
pub const DEFAULT_MAX_MEMBER_BYTES: u64 = DEFAULT_MAX_ARCHIVE_BYTES;

/// One entry of the archive's central directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveMember {
    index: usize,
    name: String,
    size: u64,
    is_dir: bool,
    enclosed: Option<PathBuf>,
}

impl ArchiveMember {
    /// Full member name as stored in the archive.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Uncompressed size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    /// Last path component; empty for directory entries.
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.name.rsplit(['/', '\\']).next().unwrap_or_default()
    }

    /// Relative path safe to join onto a target directory, if any.
    #[must_use]
    pub fn enclosed_path(&self) -> Option<&Path> {
        self.enclosed.as_deref()
    }

    /// True if the member sits at the archive root.
    #[must_use]
    pub fn is_top_level(&self) -> bool {
        !self.is_dir && !self.name.contains(['/', '\\'])
    }

    /// Case-insensitive extension check.
    #[must_use]
    pub fn has_extension(&self, extension: &str) -> bool {
        Path::new(self.file_name())
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(extension))
    }

    /// File name without its final extension.
    #[must_use]
    pub fn stem(&self) -> &str {
        let name = self.file_name();
        Path::new(name)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or(name)
    }
}

/// A ZIP archive opened over borrowed bytes.
pub struct PackageArchive<'a> {
    zip: ZipArchive<Cursor<&'a [u8]>>,
    members: Vec<ArchiveMember>,
    member_limit: u64,
}

impl<'a> PackageArchive<'a> {
    /// Opens `bytes` and reads the member table once, in archive order.
    pub fn open(bytes: &'a [u8]) -> Result<Self, PackageError> {
        let mut zip = ZipArchive::new(Cursor::new(bytes))?;
        let mut members = Vec::with_capacity(zip.len());

        for index in 0..zip.len() {
            let entry = zip.by_index_raw(index)?;
            members.push(ArchiveMember {
                index,
                name: entry.name().to_string(),
                size: entry.size(),
                is_dir: entry.is_dir(),
                enclosed: entry.enclosed_name(),
            });
        }

        Ok(Self {
            zip,
            members,
            member_limit: DEFAULT_MAX_MEMBER_BYTES,
        })
    }

    /// Caps the uncompressed size of any single member.
    #[must_use]
    pub fn with_member_limit(mut self, limit: u64) -> Self {
        self.member_limit = limit;
        self
    }

    /// Every member, in archive order.
    #[must_use]
    pub fn members(&self) -> &[ArchiveMember] {
        &self.members
    }

    /// Non-directory members with no path separator in their name.
    pub fn top_level_members(&self) -> impl Iterator<Item = &ArchiveMember> {
        self.members.iter().filter(|member| member.is_top_level())
    }

    /// Looks a member up by its exact name.
    #[must_use]
    pub fn member(&self, name: &str) -> Option<&ArchiveMember> {
        self.members.iter().find(|member| member.name == name)
    }

    /// Decompresses a member into memory.
    ///
    /// The declared size is only trusted to reject a member up front; the
    /// read itself is capped, so a member that inflates past the limit fails
    /// instead of exhausting memory.
    pub fn extract_member(&mut self, name: &str) -> Result<Vec<u8>, PackageError> {
        let member = self
            .member(name)
            .cloned()
            .ok_or_else(|| PackageError::MemberNotFound(name.to_string()))?;
        self.check_declared_size(&member)?;

        let entry = self.zip.by_index(member.index)?;
        let mut data = Vec::new();
        entry
            .take(self.member_limit.saturating_add(1))
            .read_to_end(&mut data)?;

        if data.len() as u64 > self.member_limit {
            return Err(self.too_large(&member));
        }
        Ok(data)
    }

    /// Streams a member into `writer`, under the same cap as
    /// [`extract_member`](Self::extract_member).
    pub fn copy_member(&mut self, member: &ArchiveMember, writer: &mut dyn Write) -> Result<u64, PackageError> {
        self.check_declared_size(member)?;

        let limit = self.member_limit;
        let entry = self.zip.by_index(member.index)?;
        let copied = io::copy(&mut entry.take(limit.saturating_add(1)), writer)?;

        if copied > limit {
            return Err(self.too_large(member));
        }
        Ok(copied)
    }

    fn check_declared_size(&self, member: &ArchiveMember) -> Result<(), PackageError> {
        if member.size > self.member_limit {
            debug!(
                "[PKG-SCAN] {} declares {} bytes, over the {} byte limit",
                member.name, member.size, self.member_limit
            );
            return Err(self.too_large(member));
        }
        Ok(())
    }

    fn too_large(&self, member: &ArchiveMember) -> PackageError {
        PackageError::MemberTooLarge {
            name: member.name.clone(),
            limit: self.member_limit,
        }
    }

    /// Builds display metadata for a member.
    ///
    /// Only `.dll` and `.exe` members are inspected.
    pub fn file_info(&mut self, name: &str, inspector: &Inspector) -> Result<FileInfo, PackageError> {
        let member = self
            .member(name)
            .cloned()
            .ok_or_else(|| PackageError::MemberNotFound(name.to_string()))?;

        let mut info = FileInfo {
            name: member.name.clone(),
            size_bytes: member.size,
            version: None,
            platform: None,
        };

        if INSPECTED_EXTENSIONS
            .iter()
            .any(|extension| member.has_extension(extension))
        {
            let data = self.extract_member(name)?;
            let binary = inspector.inspect(&data);
            info.version = binary.version;
            info.platform = binary.platform;
        }

        Ok(info)
    }

    /// Finds the single top-level `.dll` that implements the entry-point
    /// contract.
    pub fn find_main_entry(&mut self, inspector: &Inspector) -> Result<String, PackageError> {
        let candidates: Vec<String> = self
            .top_level_members()
            .filter(|member| member.has_extension(PLUGIN_EXTENSION))
            .map(|member| member.name.clone())
            .collect();

        let mut matches = Vec::new();
        for name in candidates {
            let data = self.extract_member(&name)?;
            if inspector.is_plugin_entry_point(&data) {
                debug!("[PKG-SCAN] Entry point candidate: {}", name);
                matches.push(name);
            } else {
                debug!("[PKG-SCAN] Not an entry point: {}", name);
            }
        }

        if matches.len() > 1 {
            return Err(PackageError::MultipleCandidates(matches));
        }
        matches.pop().ok_or(PackageError::NoPluginFound)
    }

    /// Finds the top-level `<stem>.json` sidecar of `main_entry`.
    #[must_use]
    pub fn find_manifest_member(&self, main_entry: &str) -> Option<&ArchiveMember> {
        let stem = self.member(main_entry)?.stem().to_string();
        let expected = format!("{}.{}", stem, MANIFEST_EXTENSION);

        self.top_level_members()
            .find(|member| member.name.eq_ignore_ascii_case(&expected))
    }
}
