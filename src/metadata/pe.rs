//! Portable Executable image reader.
//!
//! Reads just enough of the headers to locate the CLI metadata: the COFF
//! header, the PE32/PE32+ data directories and the section table that maps
//! RVAs to file offsets.

use super::{ImageError, read_u16, read_u32};

/// `MZ`.
const DOS_MAGIC: u16 = 0x5A4D;

/// Offset of `e_lfanew` in the DOS header.
const PE_POINTER_OFFSET: usize = 0x3C;

/// `PE\0\0`.
const PE_SIGNATURE: u32 = 0x0000_4550;

const COFF_HEADER_SIZE: usize = 20;
const PE32_MAGIC: u16 = 0x10B;
const PE32_PLUS_MAGIC: u16 = 0x20B;
const SECTION_HEADER_SIZE: usize = 40;
const DATA_DIRECTORY_SIZE: usize = 8;

/// Index of the CLI (COM descriptor) data directory.
const CLI_HEADER_DIRECTORY: usize = 14;

/// Offset of the metadata directory inside the CLI header.
const CLI_METADATA_OFFSET: usize = 8;

/// Windows loader limit.
const MAX_SECTIONS: usize = 96;

/// An (RVA, size) pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataDirectory {
    pub rva: u32,
    pub size: u32,
}

impl DataDirectory {
    /// Returns true if the directory points anywhere.
    #[must_use]
    pub fn is_present(&self) -> bool {
        self.rva != 0 && self.size != 0
    }
}

#[derive(Debug, Clone, Copy)]
struct Section {
    virtual_address: u32,
    virtual_size: u32,
    raw_offset: u32,
    raw_size: u32,
}

/// A parsed PE image borrowing the file bytes.
#[derive(Debug)]
pub struct PeImage<'a> {
    data: &'a [u8],
    sections: Vec<Section>,
    cli_header: DataDirectory,
}

impl<'a> PeImage<'a> {
    /// Parses the headers of `data`.
    pub fn parse(data: &'a [u8]) -> Result<Self, ImageError> {
        if read_u16(data, 0)? != DOS_MAGIC {
            return Err(ImageError::NotPortableExecutable);
        }

        let pe_offset = read_u32(data, PE_POINTER_OFFSET)? as usize;
        if read_u32(data, pe_offset)? != PE_SIGNATURE {
            return Err(ImageError::NotPortableExecutable);
        }

        let coff = pe_offset + 4;
        let section_count = usize::from(read_u16(data, coff + 2)?);
        let optional_size = usize::from(read_u16(data, coff + 16)?);
        let optional = coff + COFF_HEADER_SIZE;

        if section_count > MAX_SECTIONS {
            return Err(ImageError::TooManySections(section_count));
        }

        // (NumberOfRvaAndSizes, first data directory) relative to the optional header
        let (count_offset, directories_offset) = match read_u16(data, optional)? {
            PE32_MAGIC => (92, 96),
            PE32_PLUS_MAGIC => (108, 112),
            other => return Err(ImageError::UnsupportedOptionalHeader(other)),
        };

        let directory_count = read_u32(data, optional + count_offset)? as usize;
        let cli_entry = directories_offset + CLI_HEADER_DIRECTORY * DATA_DIRECTORY_SIZE;
        let cli_header = if directory_count > CLI_HEADER_DIRECTORY
            && cli_entry + DATA_DIRECTORY_SIZE <= optional_size
        {
            DataDirectory {
                rva: read_u32(data, optional + cli_entry)?,
                size: read_u32(data, optional + cli_entry + 4)?,
            }
        } else {
            DataDirectory::default()
        };

        let table = optional + optional_size;
        let mut sections = Vec::with_capacity(section_count);
        for index in 0..section_count {
            let at = table + index * SECTION_HEADER_SIZE;
            sections.push(Section {
                virtual_size: read_u32(data, at + 8)?,
                virtual_address: read_u32(data, at + 12)?,
                raw_size: read_u32(data, at + 16)?,
                raw_offset: read_u32(data, at + 20)?,
            });
        }

        Ok(Self {
            data,
            sections,
            cli_header,
        })
    }

    /// Returns true if the image carries a CLI header, i.e. is managed.
    #[must_use]
    pub fn has_cli_header(&self) -> bool {
        self.cli_header.is_present()
    }

    /// Maps an RVA to a file offset through the section table.
    #[must_use]
    pub fn rva_to_offset(&self, rva: u32) -> Option<usize> {
        self.sections.iter().find_map(|section| {
            let delta = rva.checked_sub(section.virtual_address)?;
            let span = section.virtual_size.max(section.raw_size);
            (delta < span && delta < section.raw_size)
                .then(|| section.raw_offset as usize + delta as usize)
        })
    }

    fn directory_bytes(&self, directory: DataDirectory) -> Result<&'a [u8], ImageError> {
        let start = self
            .rva_to_offset(directory.rva)
            .ok_or(ImageError::UnmappedRva(directory.rva))?;
        start
            .checked_add(directory.size as usize)
            .and_then(|end| self.data.get(start..end))
            .ok_or(ImageError::Truncated { offset: start })
    }

    /// Returns the CLI metadata block, or `None` for native images.
    pub fn metadata(&self) -> Result<Option<&'a [u8]>, ImageError> {
        if !self.has_cli_header() {
            return Ok(None);
        }

        let header = self.directory_bytes(self.cli_header)?;
        let metadata = DataDirectory {
            rva: read_u32(header, CLI_METADATA_OFFSET)?,
            size: read_u32(header, CLI_METADATA_OFFSET + 4)?,
        };
        if !metadata.is_present() {
            return Err(ImageError::MissingMetadata);
        }

        self.directory_bytes(metadata).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{AssemblyFixture, native_image};

    #[test]
    fn test_parse_managed_image() {
        let image = AssemblyFixture::plugin("SamplePlugin").build();
        let pe = PeImage::parse(&image).expect("valid image");

        assert!(pe.has_cli_header());
        let metadata = pe.metadata().expect("metadata").expect("present");
        assert_eq!(&metadata[..4], b"BSJB");
    }

    #[test]
    fn test_parse_native_image() {
        let image = native_image(b"hello");
        let pe = PeImage::parse(&image).expect("valid image");

        assert!(!pe.has_cli_header());
        assert_eq!(pe.metadata(), Ok(None));
    }

    #[test]
    fn test_rva_to_offset() {
        let image = native_image(b"hello");
        let pe = PeImage::parse(&image).expect("valid image");

        assert_eq!(pe.rva_to_offset(0x2000), Some(0x200));
        assert_eq!(pe.rva_to_offset(0x2004), Some(0x204));
        assert_eq!(pe.rva_to_offset(0x1000), None);
        assert_eq!(pe.rva_to_offset(0x9000), None);
    }

    #[test]
    fn test_rejects_non_pe() {
        assert_eq!(
            PeImage::parse(b"PK\x03\x04rest").err(),
            Some(ImageError::NotPortableExecutable)
        );
        assert!(matches!(
            PeImage::parse(b"MZ").err(),
            Some(ImageError::Truncated { .. })
        ));

        let mut image = native_image(b"");
        image[0x80] = b'X';
        assert_eq!(
            PeImage::parse(&image).err(),
            Some(ImageError::NotPortableExecutable)
        );
    }
}
