//! spm
//!
//! Standalone plugin package manager: downloads a ZIP package, finds the
//! plugin entry point by reading .NET metadata, and installs the package
//! into a directory while recycling stale binaries.
//!
//! # Architecture
//!
//! - **Metadata Module**: PE and ECMA-335 metadata reader, plugin detection
//! - **Package Module**: Archive scanning, download, install, readiness checks
//! - **Config Module**: `~/.spm/config.toml`
//! - **Logging Module**: File logging under `~/.spm/logs`
//!
//! # Usage
//!
//! ```no_run
//! use spm::config::Config;
//! use spm::metadata::Inspector;
//! use spm::package::{PackageDownloader, PackageInstaller};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load()?;
//! let downloader = PackageDownloader::new(config.download, Inspector::new(config.plugin.contract()));
//! let descriptor = downloader.try_fetch("https://example.com/MyPlugin.zip").await?;
//! let outcome = PackageInstaller::default().install(&descriptor, std::path::Path::new("plugins/MyPlugin"));
//! # Ok(())
//! # }
//! ```

// Clippy configuration - allow common patterns
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]

pub mod config;
pub mod logging;
pub mod metadata;
pub mod package;

#[cfg(test)]
mod test_support;

// Re-export main types
pub use config::Config;
pub use metadata::{EntryPointContract, Inspector, Platform};
pub use package::{InstallOutcome, PackageDescriptor, PackageDownloader, PackageError, PackageInstaller};
