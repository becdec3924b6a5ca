//! Plugin package acquisition and installation.
//!
//! # Architecture
//!
//! - **archive**: ZIP member table, entry-point selection, manifest lookup
//! - **descriptor**: Scanned package, the hand-off between fetch and install
//! - **downloader**: Capped, cancellable HTTP fetch
//! - **installer**: Reconcile, extract, main entry last
//! - **recycle**: Recoverable deletion of stale files
//! - **gate**: Single-flight guard shared by downloader and installer
//! - **readiness**: Pre-install checks for display
//!
//! The downloader never writes to disk and the installer never touches the
//! network; a [`PackageDescriptor`] is the only thing passed between them.

pub mod archive;
pub mod descriptor;
pub mod downloader;
mod error;
pub mod gate;
pub mod installer;
pub mod manifest;
pub mod readiness;
pub mod recycle;

pub use archive::{ArchiveMember, PackageArchive};
pub use descriptor::{FileInfo, PackageDescriptor};
pub use downloader::PackageDownloader;
pub use error::{InstallError, PackageError};
pub use gate::{GateState, OperationGate};
pub use installer::{FailureKind, InstallOutcome, InstallReport, MemberFailure, PackageInstaller};
pub use manifest::{AssemblyVersion, PluginManifest};
pub use readiness::{ReadinessIssue, assess, format_size};
pub use recycle::{RecycleBin, Recycler};
