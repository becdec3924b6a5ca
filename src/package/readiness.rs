//! Pre-install checks on a fetched package.

use std::fmt;

use super::descriptor::{PackageDescriptor, main_stem};

const SIZE_UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

/// Something that will likely stop the host from loading the plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessIssue {
    MissingManifest,
    /// Manifest lacks an internal name or an assembly version.
    NotLoadable,
    ApiLevelTooLow { plugin: i32, host: i32 },
    /// Usually a plugin built for a different regional client.
    ApiLevelTooHigh { plugin: i32, host: i32 },
    InternalNameMismatch { internal_name: String, file_stem: String },
}

impl fmt::Display for ReadinessIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingManifest => write!(
                f,
                "Manifest is missing. You can still try to load the plugin, but it may malfunction."
            ),
            Self::NotLoadable => write!(
                f,
                "Manifest has no internal name or assembly version. Plugin will likely fail to load."
            ),
            Self::ApiLevelTooLow { plugin, host } => write!(
                f,
                "API level {} is less than required ({}). Plugin will likely fail to load.",
                plugin, host
            ),
            Self::ApiLevelTooHigh { plugin, host } => write!(
                f,
                "API level {} is more than required ({}). The plugin may target a different client version and will likely fail to load.",
                plugin, host
            ),
            Self::InternalNameMismatch {
                internal_name,
                file_stem,
            } => write!(
                f,
                "Internal name {} differs from DLL name {}. Plugin will likely fail to load.",
                internal_name, file_stem
            ),
        }
    }
}

/// Lists everything that would likely stop `descriptor` from loading.
///
/// API level checks are skipped when `host_api_level` is unknown.
#[must_use]
pub fn assess(descriptor: &PackageDescriptor, host_api_level: Option<i32>) -> Vec<ReadinessIssue> {
    let Some(manifest) = descriptor.manifest() else {
        return vec![ReadinessIssue::MissingManifest];
    };

    let mut issues = Vec::new();
    if !manifest.is_loadable() {
        issues.push(ReadinessIssue::NotLoadable);
    }

    if let Some(host) = host_api_level {
        let plugin = manifest.api_level;
        if plugin < host {
            issues.push(ReadinessIssue::ApiLevelTooLow { plugin, host });
        } else if plugin > host {
            issues.push(ReadinessIssue::ApiLevelTooHigh { plugin, host });
        }
    }

    if let Some(internal_name) = manifest.internal_name.as_deref() {
        let file_stem = main_stem(descriptor.main_member_name());
        if !internal_name.eq_ignore_ascii_case(file_stem) {
            issues.push(ReadinessIssue::InternalNameMismatch {
                internal_name: internal_name.to_string(),
                file_stem: file_stem.to_string(),
            });
        }
    }

    issues
}

/// Formats a byte count with binary units, e.g. `1.5 KB`.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < SIZE_UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let formatted = format!("{:.2}", value);
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    format!("{} {}", trimmed, SIZE_UNITS[unit])
}
