//! Binary metadata inspection.
//!
//! Decides whether a binary is a loadable plugin by walking its ECMA-335
//! metadata tables, and extracts the assembly version and target framework
//! for display. Nothing here executes or loads the binary.
//!
//! # Architecture
//!
//! - **pe**: Portable Executable headers, sections and the CLI header
//! - **tables**: Metadata root, heaps and typed table rows
//!
//! Parse failures never leave this module: a malformed image is simply
//! "not a plugin" and carries no version information.

pub mod pe;
pub mod tables;

use std::fmt;

use thiserror::Error;
use tracing::debug;

use pe::PeImage;
use tables::{MetadataReader, RowRef, read_ser_string, table};

/// Namespace of the interface every plugin entry type implements.
pub const DEFAULT_INTERFACE_NAMESPACE: &str = "Dalamud.Plugin";

/// Name of the interface every plugin entry type implements.
pub const DEFAULT_INTERFACE_NAME: &str = "IDalamudPlugin";

/// Namespace of the assembly-level target framework attribute.
const TARGET_FRAMEWORK_NAMESPACE: &str = "System.Runtime.Versioning";

/// Name of the assembly-level target framework attribute.
const TARGET_FRAMEWORK_NAME: &str = "TargetFrameworkAttribute";

/// Every serialized custom attribute value starts with this prolog.
const CUSTOM_ATTRIBUTE_PROLOG: u16 = 0x0001;

/// Errors raised while reading an image.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ImageError {
    /// Data ended before a structure was complete.
    #[error("Image truncated at offset {offset}")]
    Truncated { offset: usize },

    /// Missing `MZ` / `PE\0\0` signatures.
    #[error("Not a Portable Executable image")]
    NotPortableExecutable,

    /// Optional header magic other than PE32 or PE32+.
    #[error("Unsupported optional header magic {0:#06x}")]
    UnsupportedOptionalHeader(u16),

    /// Implausible section count.
    #[error("Too many sections: {0}")]
    TooManySections(usize),

    /// An RVA that no section maps.
    #[error("RVA {0:#x} is not mapped by any section")]
    UnmappedRva(u32),

    /// CLI header present but it has no metadata directory.
    #[error("CLI header has no metadata directory")]
    MissingMetadata,

    /// Metadata root signature mismatch.
    #[error("Bad metadata signature")]
    BadMetadataSignature,

    /// Required metadata stream absent.
    #[error("Missing metadata stream {0}")]
    MissingStream(&'static str),

    /// Table id outside the known schema.
    #[error("Unknown metadata table {0:#04x}")]
    UnknownTable(usize),

    /// Row index outside its table.
    #[error("Row {row} out of range for table {table:#04x}")]
    RowOutOfRange { table: usize, row: u32 },

    /// Coded index with an unused tag.
    #[error("Invalid coded index tag {0}")]
    InvalidCodedIndex(u32),

    /// Malformed compressed integer.
    #[error("Invalid compressed integer")]
    InvalidCompressedInteger,

    /// Heap string is not UTF-8.
    #[error("Invalid UTF-8 in heap string at {0}")]
    InvalidUtf8(u32),
}

/// Reads `N` bytes at `offset` without panicking on short input.
pub(crate) fn read_array<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ImageError> {
    offset
        .checked_add(N)
        .and_then(|end| data.get(offset..end))
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(ImageError::Truncated { offset })
}

pub(crate) fn read_u8(data: &[u8], offset: usize) -> Result<u8, ImageError> {
    data.get(offset)
        .copied()
        .ok_or(ImageError::Truncated { offset })
}

pub(crate) fn read_u16(data: &[u8], offset: usize) -> Result<u16, ImageError> {
    read_array(data, offset).map(u16::from_le_bytes)
}

pub(crate) fn read_u32(data: &[u8], offset: usize) -> Result<u32, ImageError> {
    read_array(data, offset).map(u32::from_le_bytes)
}

pub(crate) fn read_u64(data: &[u8], offset: usize) -> Result<u64, ImageError> {
    read_array(data, offset).map(u64::from_le_bytes)
}

/// The (namespace, name) pair identifying the plugin interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPointContract {
    /// Interface namespace, e.g. `Dalamud.Plugin`.
    pub namespace: String,
    /// Interface short name, e.g. `IDalamudPlugin`.
    pub name: String,
}

impl EntryPointContract {
    /// Creates a contract for the given interface.
    #[must_use]
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl Default for EntryPointContract {
    fn default() -> Self {
        Self::new(DEFAULT_INTERFACE_NAMESPACE, DEFAULT_INTERFACE_NAME)
    }
}

impl fmt::Display for EntryPointContract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

/// Runtime a binary targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Platform {
    /// Carries CLI metadata; `framework` is the declared target framework.
    Managed { framework: Option<String> },
    /// Plain native image.
    Native,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Managed {
                framework: Some(framework),
            } => write!(f, "Managed .NET ({})", framework),
            Platform::Managed { framework: None } => write!(f, "Managed .NET"),
            Platform::Native => write!(f, "Native/Unmanaged"),
        }
    }
}

/// Version and platform details of one binary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BinaryInfo {
    /// Declared assembly version (`major.minor.build.revision`).
    pub version: Option<String>,
    /// Platform, absent when the image could not be read.
    pub platform: Option<Platform>,
}

/// Structural inspector for plugin binaries.
#[derive(Debug, Clone, Default)]
pub struct Inspector {
    contract: EntryPointContract,
}

impl Inspector {
    /// Creates an inspector that looks for `contract`.
    #[must_use]
    pub fn new(contract: EntryPointContract) -> Self {
        Self { contract }
    }

    /// Returns the interface this inspector looks for.
    #[must_use]
    pub fn contract(&self) -> &EntryPointContract {
        &self.contract
    }

    /// Returns true if a type in `bytes` implements the entry-point interface.
    ///
    /// Only the InterfaceImpl table is consulted; matching text elsewhere in
    /// the file is irrelevant.
    #[must_use]
    pub fn is_plugin_entry_point(&self, bytes: &[u8]) -> bool {
        match self.find_contract(bytes) {
            Ok(found) => found,
            Err(err) => {
                debug!("Entry point check failed: {}", err);
                false
            }
        }
    }

    fn find_contract(&self, bytes: &[u8]) -> Result<bool, ImageError> {
        let image = PeImage::parse(bytes)?;
        let Some(metadata) = image.metadata()? else {
            return Ok(false);
        };
        let reader = MetadataReader::parse(metadata)?;
        let type_defs = reader.row_count(table::TYPE_DEF);

        for implementation in reader.interface_impls() {
            let implementation = implementation?;
            if implementation.class == 0 || implementation.class > type_defs {
                continue;
            }
            if implementation.interface.table != table::TYPE_REF {
                continue;
            }
            let interface = reader.type_ref(implementation.interface.row)?;
            if interface.namespace == self.contract.namespace
                && interface.name == self.contract.name
            {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Extracts version and platform details from `bytes`.
    #[must_use]
    pub fn inspect(&self, bytes: &[u8]) -> BinaryInfo {
        let image = match PeImage::parse(bytes) {
            Ok(image) => image,
            Err(err) => {
                debug!("Not a readable image: {}", err);
                return BinaryInfo::default();
            }
        };

        if !image.has_cli_header() {
            return BinaryInfo {
                version: None,
                platform: Some(Platform::Native),
            };
        }

        let mut info = BinaryInfo {
            version: None,
            platform: Some(Platform::Managed { framework: None }),
        };

        let reader = match image
            .metadata()
            .and_then(|metadata| metadata.ok_or(ImageError::MissingMetadata))
            .and_then(MetadataReader::parse)
        {
            Ok(reader) => reader,
            Err(err) => {
                debug!("Unreadable CLI metadata: {}", err);
                return info;
            }
        };

        match reader.assembly() {
            Ok(Some(assembly)) => info.version = Some(assembly.version_string()),
            Ok(None) => {}
            Err(err) => debug!("Unreadable assembly row: {}", err),
        }

        match target_framework(&reader) {
            Ok(Some(framework)) => {
                info.platform = Some(Platform::Managed {
                    framework: Some(framework),
                });
            }
            Ok(None) => {}
            Err(err) => debug!("Unreadable target framework attribute: {}", err),
        }

        info
    }
}

/// Finds the target framework declared on the assembly definition.
fn target_framework(reader: &MetadataReader<'_>) -> Result<Option<String>, ImageError> {
    let assembly = RowRef {
        table: table::ASSEMBLY,
        row: 1,
    };

    for attribute in reader.custom_attributes() {
        let attribute = attribute?;
        if attribute.parent != assembly || attribute.constructor.table != table::MEMBER_REF {
            continue;
        }

        let constructor = reader.member_ref(attribute.constructor.row)?;
        if constructor.parent.table != table::TYPE_REF {
            continue;
        }

        let attribute_type = reader.type_ref(constructor.parent.row)?;
        if attribute_type.namespace != TARGET_FRAMEWORK_NAMESPACE
            || attribute_type.name != TARGET_FRAMEWORK_NAME
        {
            continue;
        }

        let value = reader.blob(attribute.value)?;
        if read_u16(value, 0)? != CUSTOM_ATTRIBUTE_PROLOG {
            continue;
        }
        let (framework, _) = read_ser_string(value.get(2..).unwrap_or_default())?;
        if let Some(framework) = framework.filter(|f| !f.is_empty()) {
            return Ok(Some(framework.to_string()));
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{AssemblyFixture, native_image};
    use proptest::prelude::*;

    #[test]
    fn test_detects_plugin_interface() {
        let image = AssemblyFixture::plugin("SamplePlugin").build();
        let inspector = Inspector::default();

        assert!(inspector.is_plugin_entry_point(&image));
    }

    #[test]
    fn test_rejects_other_interfaces() {
        let image = AssemblyFixture::new("Helpers")
            .implementing("System", "IDisposable")
            .implementing("Dalamud.Plugin", "IDalamudPluginInterface")
            .build();

        assert!(!Inspector::default().is_plugin_entry_point(&image));
    }

    #[test]
    fn test_reference_without_implementation_is_not_a_plugin() {
        let image = AssemblyFixture::new("Library")
            .referencing(DEFAULT_INTERFACE_NAMESPACE, DEFAULT_INTERFACE_NAME)
            .build();

        assert!(!Inspector::default().is_plugin_entry_point(&image));
    }

    #[test]
    fn test_text_in_native_image_is_not_a_plugin() {
        let image = native_image(b"Dalamud.Plugin IDalamudPlugin Dalamud.Plugin.IDalamudPlugin");

        assert!(!Inspector::default().is_plugin_entry_point(&image));
    }

    #[test]
    fn test_contract_match_is_exact() {
        let image = AssemblyFixture::new("Impostor")
            .implementing("Dalamud.Plugins", "IDalamudPlugin")
            .implementing("Dalamud.Plugin", "idalamudplugin")
            .build();

        assert!(!Inspector::default().is_plugin_entry_point(&image));
    }

    #[test]
    fn test_custom_contract() {
        let image = AssemblyFixture::new("Other")
            .implementing("Host.Api", "IHostPlugin")
            .build();
        let inspector = Inspector::new(EntryPointContract::new("Host.Api", "IHostPlugin"));

        assert!(inspector.is_plugin_entry_point(&image));
        assert!(!Inspector::default().is_plugin_entry_point(&image));
    }

    #[test]
    fn test_inspect_managed_with_framework() {
        let image = AssemblyFixture::plugin("SamplePlugin")
            .version([1, 2, 3, 4])
            .target_framework(".NETCoreApp,Version=v8.0")
            .build();

        let info = Inspector::default().inspect(&image);

        assert_eq!(info.version.as_deref(), Some("1.2.3.4"));
        assert_eq!(
            info.platform.map(|p| p.to_string()).as_deref(),
            Some("Managed .NET (.NETCoreApp,Version=v8.0)")
        );
    }

    #[test]
    fn test_inspect_managed_without_framework() {
        let image = AssemblyFixture::new("Library").version([2, 0, 0, 0]).build();

        let info = Inspector::default().inspect(&image);

        assert_eq!(info.version.as_deref(), Some("2.0.0.0"));
        assert_eq!(info.platform, Some(Platform::Managed { framework: None }));
    }

    #[test]
    fn test_inspect_native() {
        let info = Inspector::default().inspect(&native_image(b"payload"));

        assert_eq!(info.version, None);
        assert_eq!(info.platform, Some(Platform::Native));
        assert_eq!(Platform::Native.to_string(), "Native/Unmanaged");
    }

    #[test]
    fn test_inspect_garbage() {
        let inspector = Inspector::default();

        assert_eq!(inspector.inspect(b"not a binary"), BinaryInfo::default());
        assert_eq!(inspector.inspect(&[]), BinaryInfo::default());
        assert!(!inspector.is_plugin_entry_point(b"MZ"));
    }

    #[test]
    fn test_truncated_image() {
        let image = AssemblyFixture::plugin("SamplePlugin").build();
        let inspector = Inspector::default();

        for len in [0x40, 0x100, 0x200, 0x220, 0x250, 0x280] {
            let truncated = &image[..len];
            assert!(
                !inspector.is_plugin_entry_point(truncated),
                "truncated at {} should not pass",
                len
            );
        }
    }

    proptest! {
        #[test]
        fn test_inspect_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let inspector = Inspector::default();
            let _ = inspector.inspect(&bytes);
            let _ = inspector.is_plugin_entry_point(&bytes);
        }

        #[test]
        fn test_corrupted_image_never_panics(index in 0usize..4096, value in any::<u8>()) {
            let mut image = AssemblyFixture::plugin("SamplePlugin")
                .target_framework(".NETCoreApp,Version=v8.0")
                .build();
            let index = index % image.len();
            image[index] = value;
            let inspector = Inspector::default();
            let _ = inspector.inspect(&image);
            let _ = inspector.is_plugin_entry_point(&image);
        }
    }
}
