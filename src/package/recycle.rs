//! Recoverable deletion of superseded files.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::spm_dir;

/// Moves a file somewhere it can be recovered from.
pub trait Recycler: Send + Sync {
    /// Recycles `path`, returning where it went.
    fn recycle(&self, path: &Path) -> io::Result<PathBuf>;
}

/// Timestamped recycle directory under `~/.spm/recycle`.
#[derive(Debug, Clone)]
pub struct RecycleBin {
    root: PathBuf,
}

impl Default for RecycleBin {
    fn default() -> Self {
        Self::new(spm_dir().join("recycle"))
    }
}

impl RecycleBin {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Picks a free destination for `file_name` inside `dir`.
    fn destination(dir: &Path, file_name: &std::ffi::OsStr) -> PathBuf {
        let candidate = dir.join(file_name);
        if !candidate.exists() {
            return candidate;
        }
        let name = file_name.to_string_lossy();
        (1..)
            .map(|n| dir.join(format!("{}.{}", name, n)))
            .find(|path| !path.exists())
            .unwrap_or(candidate)
    }
}

impl Recycler for RecycleBin {
    fn recycle(&self, path: &Path) -> io::Result<PathBuf> {
        let file_name = path
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;

        let stamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S%.3f").to_string();
        let dir = self.root.join(stamp);
        fs::create_dir_all(&dir)?;

        let destination = Self::destination(&dir, file_name);
        if fs::rename(path, &destination).is_err() {
            // rename fails across filesystems
            fs::copy(path, &destination)?;
            fs::remove_file(path)?;
        }

        debug!(
            "[PKG-INSTALL] Recycled {} -> {}",
            path.display(),
            destination.display()
        );
        Ok(destination)
    }
}
