//! Sidecar plugin manifest (`<PluginName>.json`).

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

/// UTF-8 byte order mark some editors prepend.
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// A version string that is not 2-4 dot-separated integers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid version string: {0:?}")]
pub struct VersionParseError(String);

/// A `major.minor[.build[.revision]]` assembly version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct AssemblyVersion {
    pub major: u32,
    pub minor: u32,
    pub build: Option<u32>,
    pub revision: Option<u32>,
}

impl FromStr for AssemblyVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || VersionParseError(s.to_string());

        let parts = s
            .trim()
            .split('.')
            .map(|part| part.parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| invalid())?;

        match parts[..] {
            [major, minor] => Ok(Self {
                major,
                minor,
                build: None,
                revision: None,
            }),
            [major, minor, build] => Ok(Self {
                major,
                minor,
                build: Some(build),
                revision: None,
            }),
            [major, minor, build, revision] => Ok(Self {
                major,
                minor,
                build: Some(build),
                revision: Some(revision),
            }),
            _ => Err(invalid()),
        }
    }
}

impl TryFrom<String> for AssemblyVersion {
    type Error = VersionParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for AssemblyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)?;
        if let Some(build) = self.build {
            write!(f, ".{}", build)?;
            if let Some(revision) = self.revision {
                write!(f, ".{}", revision)?;
            }
        }
        Ok(())
    }
}

/// Plugin manifest shipped next to the main DLL.
///
/// Unknown fields are ignored; absent fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PluginManifest {
    pub author: Option<String>,
    pub name: Option<String>,
    pub punchline: Option<String>,
    pub description: Option<String>,
    pub changelog: Option<String>,
    pub tags: Option<Vec<String>>,
    pub category_tags: Option<Vec<String>>,
    pub is_hide: bool,
    pub internal_name: Option<String>,
    pub assembly_version: Option<AssemblyVersion>,
    pub testing_assembly_version: Option<AssemblyVersion>,
    pub is_testing_exclusive: bool,
    pub repo_url: Option<String>,
    /// Minimum host framework version.
    #[serde(rename = "MinimumDalamudVersion")]
    pub minimum_host_version: Option<AssemblyVersion>,
    /// Host API level the plugin was built against.
    #[serde(rename = "DalamudApiLevel")]
    pub api_level: i32,
    #[serde(rename = "TestingDalamudApiLevel")]
    pub testing_api_level: Option<i32>,
    pub download_count: i64,
    pub last_update: i64,
    pub download_link_install: Option<String>,
    pub download_link_update: Option<String>,
    pub download_link_testing: Option<String>,
    pub load_required_state: i32,
    pub load_sync: bool,
    pub load_priority: i32,
    pub can_unload_async: bool,
    pub supports_profiles: bool,
    pub image_urls: Option<Vec<String>>,
    pub icon_url: Option<String>,
    pub accepts_feedback: bool,
    pub feedback_message: Option<String>,
    #[serde(rename = "_Dip17Channel")]
    pub dip17_channel: Option<String>,
}

impl Default for PluginManifest {
    fn default() -> Self {
        Self {
            author: None,
            name: None,
            punchline: None,
            description: None,
            changelog: None,
            tags: None,
            category_tags: None,
            is_hide: false,
            internal_name: None,
            assembly_version: None,
            testing_assembly_version: None,
            is_testing_exclusive: false,
            repo_url: None,
            minimum_host_version: None,
            api_level: 0,
            testing_api_level: None,
            download_count: 0,
            last_update: 0,
            download_link_install: None,
            download_link_update: None,
            download_link_testing: None,
            load_required_state: 0,
            load_sync: false,
            load_priority: 0,
            can_unload_async: false,
            supports_profiles: true,
            image_urls: None,
            icon_url: None,
            accepts_feedback: true,
            feedback_message: None,
            dip17_channel: None,
        }
    }
}

impl PluginManifest {
    /// Parses manifest JSON, tolerating a leading BOM.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
        serde_json::from_slice(bytes)
    }

    /// A manifest the host can load needs an internal name and a version.
    #[must_use]
    pub fn is_loadable(&self) -> bool {
        self.internal_name.is_some() && self.assembly_version.is_some()
    }
}
