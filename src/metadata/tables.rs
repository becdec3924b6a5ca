//! ECMA-335 metadata root, heaps and table stream.
//!
//! Row layouts depend on heap-size flags and on the row counts of every
//! table, so the full schema is kept even though only a handful of tables
//! are ever read.

use super::{ImageError, read_u8, read_u16, read_u32, read_u64};

/// `BSJB`.
const METADATA_SIGNATURE: u32 = 0x424A_5342;

/// Tables defined by ECMA-335 partition II (0x00..=0x2C).
const KNOWN_TABLES: usize = 0x2D;

/// Heap-size flag bits in the `#~` header.
const WIDE_STRINGS: u8 = 0x01;
const WIDE_GUIDS: u8 = 0x02;
const WIDE_BLOBS: u8 = 0x04;
const EXTRA_DATA: u8 = 0x40;

/// Offset of the row counts in the `#~` stream.
const ROW_COUNTS_OFFSET: usize = 24;

/// Longest stream name including its terminator.
const MAX_STREAM_NAME: usize = 32;

/// Table ids.
pub mod table {
    pub const MODULE: usize = 0x00;
    pub const TYPE_REF: usize = 0x01;
    pub const TYPE_DEF: usize = 0x02;
    pub const FIELD: usize = 0x04;
    pub const METHOD_DEF: usize = 0x06;
    pub const PARAM: usize = 0x08;
    pub const INTERFACE_IMPL: usize = 0x09;
    pub const MEMBER_REF: usize = 0x0A;
    pub const CUSTOM_ATTRIBUTE: usize = 0x0C;
    pub const DECL_SECURITY: usize = 0x0E;
    pub const STAND_ALONE_SIG: usize = 0x11;
    pub const EVENT: usize = 0x14;
    pub const PROPERTY: usize = 0x17;
    pub const MODULE_REF: usize = 0x1A;
    pub const TYPE_SPEC: usize = 0x1B;
    pub const ASSEMBLY: usize = 0x20;
    pub const ASSEMBLY_REF: usize = 0x23;
    pub const FILE: usize = 0x26;
    pub const EXPORTED_TYPE: usize = 0x27;
    pub const MANIFEST_RESOURCE: usize = 0x28;
    pub const GENERIC_PARAM: usize = 0x2A;
    pub const METHOD_SPEC: usize = 0x2B;
    pub const GENERIC_PARAM_CONSTRAINT: usize = 0x2C;
}

/// Placeholder for coded-index tags that map to no table.
const UNUSED: usize = usize::MAX;

/// Coded index kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodedIndex {
    TypeDefOrRef,
    HasConstant,
    HasCustomAttribute,
    HasFieldMarshal,
    HasDeclSecurity,
    MemberRefParent,
    HasSemantics,
    MethodDefOrRef,
    MemberForwarded,
    Implementation,
    CustomAttributeType,
    ResolutionScope,
    TypeOrMethodDef,
}

impl CodedIndex {
    fn tag_bits(self) -> u32 {
        match self {
            Self::HasCustomAttribute => 5,
            Self::MemberRefParent | Self::CustomAttributeType => 3,
            Self::TypeDefOrRef
            | Self::HasConstant
            | Self::HasDeclSecurity
            | Self::Implementation
            | Self::ResolutionScope => 2,
            Self::HasFieldMarshal
            | Self::HasSemantics
            | Self::MethodDefOrRef
            | Self::MemberForwarded
            | Self::TypeOrMethodDef => 1,
        }
    }

    /// Tables addressed by each tag value.
    fn tables(self) -> &'static [usize] {
        use table::*;
        match self {
            Self::TypeDefOrRef => &[TYPE_DEF, TYPE_REF, TYPE_SPEC],
            Self::HasConstant => &[FIELD, PARAM, PROPERTY],
            Self::HasCustomAttribute => &[
                METHOD_DEF,
                FIELD,
                TYPE_REF,
                TYPE_DEF,
                PARAM,
                INTERFACE_IMPL,
                MEMBER_REF,
                MODULE,
                DECL_SECURITY,
                PROPERTY,
                EVENT,
                STAND_ALONE_SIG,
                MODULE_REF,
                TYPE_SPEC,
                ASSEMBLY,
                ASSEMBLY_REF,
                FILE,
                EXPORTED_TYPE,
                MANIFEST_RESOURCE,
                GENERIC_PARAM,
                GENERIC_PARAM_CONSTRAINT,
                METHOD_SPEC,
            ],
            Self::HasFieldMarshal => &[FIELD, PARAM],
            Self::HasDeclSecurity => &[TYPE_DEF, METHOD_DEF, ASSEMBLY],
            Self::MemberRefParent => &[TYPE_DEF, TYPE_REF, MODULE_REF, METHOD_DEF, TYPE_SPEC],
            Self::HasSemantics => &[EVENT, PROPERTY],
            Self::MethodDefOrRef => &[METHOD_DEF, MEMBER_REF],
            Self::MemberForwarded => &[FIELD, METHOD_DEF],
            Self::Implementation => &[FILE, ASSEMBLY_REF, EXPORTED_TYPE],
            Self::CustomAttributeType => &[UNUSED, UNUSED, METHOD_DEF, MEMBER_REF, UNUSED],
            Self::ResolutionScope => &[MODULE, MODULE_REF, ASSEMBLY_REF, TYPE_REF],
            Self::TypeOrMethodDef => &[TYPE_DEF, METHOD_DEF],
        }
    }

    /// Splits a raw value into (table, row).
    fn decode(self, value: u32) -> Result<RowRef, ImageError> {
        let bits = self.tag_bits();
        let tag = value & ((1 << bits) - 1);
        let table = self
            .tables()
            .get(tag as usize)
            .copied()
            .filter(|table| *table != UNUSED)
            .ok_or(ImageError::InvalidCodedIndex(tag))?;
        Ok(RowRef {
            table,
            row: value >> bits,
        })
    }
}

/// Column kinds.
#[derive(Debug, Clone, Copy)]
enum Column {
    U16,
    U32,
    Str,
    Guid,
    Blob,
    Index(usize),
    Coded(CodedIndex),
}

use CodedIndex::{
    CustomAttributeType, HasConstant, HasCustomAttribute, HasDeclSecurity, HasFieldMarshal,
    HasSemantics, Implementation, MemberForwarded, MemberRefParent, MethodDefOrRef,
    ResolutionScope, TypeDefOrRef, TypeOrMethodDef,
};
use Column::{Blob, Coded, Guid, Index, Str, U16, U32};

/// Column layout of every known table, indexed by table id.
const SCHEMA: [&[Column]; KNOWN_TABLES] = [
    // 0x00 Module
    &[U16, Str, Guid, Guid, Guid],
    // 0x01 TypeRef
    &[Coded(ResolutionScope), Str, Str],
    // 0x02 TypeDef
    &[U32, Str, Str, Coded(TypeDefOrRef), Index(table::FIELD), Index(table::METHOD_DEF)],
    // 0x03 FieldPtr
    &[Index(table::FIELD)],
    // 0x04 Field
    &[U16, Str, Blob],
    // 0x05 MethodPtr
    &[Index(table::METHOD_DEF)],
    // 0x06 MethodDef
    &[U32, U16, U16, Str, Blob, Index(table::PARAM)],
    // 0x07 ParamPtr
    &[Index(table::PARAM)],
    // 0x08 Param
    &[U16, U16, Str],
    // 0x09 InterfaceImpl
    &[Index(table::TYPE_DEF), Coded(TypeDefOrRef)],
    // 0x0A MemberRef
    &[Coded(MemberRefParent), Str, Blob],
    // 0x0B Constant (type byte + padding byte)
    &[U16, Coded(HasConstant), Blob],
    // 0x0C CustomAttribute
    &[Coded(HasCustomAttribute), Coded(CustomAttributeType), Blob],
    // 0x0D FieldMarshal
    &[Coded(HasFieldMarshal), Blob],
    // 0x0E DeclSecurity
    &[U16, Coded(HasDeclSecurity), Blob],
    // 0x0F ClassLayout
    &[U16, U32, Index(table::TYPE_DEF)],
    // 0x10 FieldLayout
    &[U32, Index(table::FIELD)],
    // 0x11 StandAloneSig
    &[Blob],
    // 0x12 EventMap
    &[Index(table::TYPE_DEF), Index(table::EVENT)],
    // 0x13 EventPtr
    &[Index(table::EVENT)],
    // 0x14 Event
    &[U16, Str, Coded(TypeDefOrRef)],
    // 0x15 PropertyMap
    &[Index(table::TYPE_DEF), Index(table::PROPERTY)],
    // 0x16 PropertyPtr
    &[Index(table::PROPERTY)],
    // 0x17 Property
    &[U16, Str, Blob],
    // 0x18 MethodSemantics
    &[U16, Index(table::METHOD_DEF), Coded(HasSemantics)],
    // 0x19 MethodImpl
    &[Index(table::TYPE_DEF), Coded(MethodDefOrRef), Coded(MethodDefOrRef)],
    // 0x1A ModuleRef
    &[Str],
    // 0x1B TypeSpec
    &[Blob],
    // 0x1C ImplMap
    &[U16, Coded(MemberForwarded), Str, Index(table::MODULE_REF)],
    // 0x1D FieldRVA
    &[U32, Index(table::FIELD)],
    // 0x1E EncLog
    &[U32, U32],
    // 0x1F EncMap
    &[U32],
    // 0x20 Assembly
    &[U32, U16, U16, U16, U16, U32, Blob, Str, Str],
    // 0x21 AssemblyProcessor
    &[U32],
    // 0x22 AssemblyOS
    &[U32, U32, U32],
    // 0x23 AssemblyRef
    &[U16, U16, U16, U16, U32, Blob, Str, Str, Blob],
    // 0x24 AssemblyRefProcessor
    &[U32, Index(table::ASSEMBLY_REF)],
    // 0x25 AssemblyRefOS
    &[U32, U32, U32, Index(table::ASSEMBLY_REF)],
    // 0x26 File
    &[U32, Str, Blob],
    // 0x27 ExportedType
    &[U32, U32, Str, Str, Coded(Implementation)],
    // 0x28 ManifestResource
    &[U32, U32, Str, Coded(Implementation)],
    // 0x29 NestedClass
    &[Index(table::TYPE_DEF), Index(table::TYPE_DEF)],
    // 0x2A GenericParam
    &[U16, U16, Coded(TypeOrMethodDef), Str],
    // 0x2B MethodSpec
    &[Coded(MethodDefOrRef), Blob],
    // 0x2C GenericParamConstraint
    &[Index(table::GENERIC_PARAM), Coded(TypeDefOrRef)],
];

/// A (table, 1-based row) reference; row 0 is the null reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowRef {
    pub table: usize,
    pub row: u32,
}

/// TypeRef row with resolved names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeRefRow<'a> {
    pub namespace: &'a str,
    pub name: &'a str,
}

/// InterfaceImpl row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceImplRow {
    /// TypeDef row of the implementing type.
    pub class: u32,
    pub interface: RowRef,
}

/// MemberRef row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberRefRow<'a> {
    pub parent: RowRef,
    pub name: &'a str,
}

/// CustomAttribute row; `value` is a blob heap index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CustomAttributeRow {
    pub parent: RowRef,
    pub constructor: RowRef,
    pub value: u32,
}

/// Assembly definition row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssemblyRow<'a> {
    pub version: [u16; 4],
    pub name: &'a str,
}

impl AssemblyRow<'_> {
    /// Formats the version as `major.minor.build.revision`.
    #[must_use]
    pub fn version_string(&self) -> String {
        let [major, minor, build, revision] = self.version;
        format!("{}.{}.{}.{}", major, minor, build, revision)
    }
}

/// Row counts, sizes and offsets of the table stream.
#[derive(Debug, Clone)]
struct TableLayout {
    rows: [u32; KNOWN_TABLES],
    offsets: [usize; KNOWN_TABLES],
    row_sizes: [usize; KNOWN_TABLES],
    wide_strings: bool,
    wide_guids: bool,
    wide_blobs: bool,
}

impl TableLayout {
    fn parse(stream: &[u8]) -> Result<Self, ImageError> {
        let heap_sizes = read_u8(stream, 6)?;
        let valid = read_u64(stream, 8)?;

        let mut layout = Self {
            rows: [0; KNOWN_TABLES],
            offsets: [0; KNOWN_TABLES],
            row_sizes: [0; KNOWN_TABLES],
            wide_strings: heap_sizes & WIDE_STRINGS != 0,
            wide_guids: heap_sizes & WIDE_GUIDS != 0,
            wide_blobs: heap_sizes & WIDE_BLOBS != 0,
        };

        let mut cursor = ROW_COUNTS_OFFSET;
        for id in 0..64 {
            if valid & (1u64 << id) == 0 {
                continue;
            }
            if id >= KNOWN_TABLES {
                return Err(ImageError::UnknownTable(id));
            }
            layout.rows[id] = read_u32(stream, cursor)?;
            cursor += 4;
        }
        if heap_sizes & EXTRA_DATA != 0 {
            cursor += 4;
        }

        for id in 0..KNOWN_TABLES {
            let row_size = SCHEMA[id].iter().map(|c| layout.width(*c)).sum();
            layout.row_sizes[id] = row_size;
            layout.offsets[id] = cursor;
            cursor = (layout.rows[id] as usize)
                .checked_mul(row_size)
                .and_then(|size| cursor.checked_add(size))
                .ok_or(ImageError::Truncated { offset: cursor })?;
        }
        if cursor > stream.len() {
            return Err(ImageError::Truncated {
                offset: stream.len(),
            });
        }

        Ok(layout)
    }

    fn index_width(&self, table: usize) -> usize {
        if self.rows[table] > 0xFFFF { 4 } else { 2 }
    }

    fn width(&self, column: Column) -> usize {
        match column {
            Column::U16 => 2,
            Column::U32 => 4,
            Column::Str => heap_width(self.wide_strings),
            Column::Guid => heap_width(self.wide_guids),
            Column::Blob => heap_width(self.wide_blobs),
            Column::Index(table) => self.index_width(table),
            Column::Coded(coded) => {
                let largest = coded
                    .tables()
                    .iter()
                    .filter(|table| **table != UNUSED)
                    .map(|table| self.rows[*table])
                    .max()
                    .unwrap_or(0);
                if largest < (1 << (16 - coded.tag_bits())) { 2 } else { 4 }
            }
        }
    }
}

fn heap_width(wide: bool) -> usize {
    if wide { 4 } else { 2 }
}

/// Read-only view over a metadata block.
#[derive(Debug, Clone)]
pub struct MetadataReader<'a> {
    tables: &'a [u8],
    strings: &'a [u8],
    blobs: &'a [u8],
    layout: TableLayout,
}

impl<'a> MetadataReader<'a> {
    /// Parses the metadata root and its stream headers.
    pub fn parse(metadata: &'a [u8]) -> Result<Self, ImageError> {
        if read_u32(metadata, 0)? != METADATA_SIGNATURE {
            return Err(ImageError::BadMetadataSignature);
        }

        let version_length = read_u32(metadata, 12)? as usize;
        let mut cursor = 16usize
            .checked_add(version_length)
            .map(align4)
            .ok_or(ImageError::Truncated { offset: 16 })?;
        let stream_count = read_u16(metadata, cursor + 2)?;
        cursor += 4;

        let mut tables = None;
        let mut strings: &[u8] = &[];
        let mut blobs: &[u8] = &[];

        for _ in 0..stream_count {
            let offset = read_u32(metadata, cursor)? as usize;
            let size = read_u32(metadata, cursor + 4)? as usize;
            cursor += 8;

            let name_area = metadata
                .get(cursor..)
                .ok_or(ImageError::Truncated { offset: cursor })?;
            let name_length = name_area
                .iter()
                .take(MAX_STREAM_NAME)
                .position(|b| *b == 0)
                .ok_or(ImageError::Truncated { offset: cursor })?;
            let name = &name_area[..name_length];
            cursor += align4(name_length + 1);

            let body = offset
                .checked_add(size)
                .and_then(|end| metadata.get(offset..end))
                .ok_or(ImageError::Truncated { offset })?;

            match name {
                b"#~" | b"#-" => tables = Some(body),
                b"#Strings" => strings = body,
                b"#Blob" => blobs = body,
                _ => {}
            }
        }

        let tables = tables.ok_or(ImageError::MissingStream("#~"))?;
        let layout = TableLayout::parse(tables)?;

        Ok(Self {
            tables,
            strings,
            blobs,
            layout,
        })
    }

    /// Returns the number of rows in `table`.
    #[must_use]
    pub fn row_count(&self, table: usize) -> u32 {
        self.layout.rows.get(table).copied().unwrap_or(0)
    }

    /// Reads one cell of a 1-based row.
    fn cell(&self, table: usize, row: u32, column: usize) -> Result<u32, ImageError> {
        if row == 0 || row > self.row_count(table) {
            return Err(ImageError::RowOutOfRange { table, row });
        }

        let schema = SCHEMA[table];
        let mut offset = self.layout.offsets[table] + (row as usize - 1) * self.layout.row_sizes[table];
        for preceding in &schema[..column] {
            offset += self.layout.width(*preceding);
        }

        match self.layout.width(schema[column]) {
            2 => read_u16(self.tables, offset).map(u32::from),
            _ => read_u32(self.tables, offset),
        }
    }

    fn coded(&self, table: usize, row: u32, column: usize, kind: CodedIndex) -> Result<RowRef, ImageError> {
        kind.decode(self.cell(table, row, column)?)
    }

    /// Returns a NUL-terminated string from the `#Strings` heap.
    pub fn string(&self, index: u32) -> Result<&'a str, ImageError> {
        if index == 0 {
            return Ok("");
        }
        let start = index as usize;
        let tail = self
            .strings
            .get(start..)
            .ok_or(ImageError::Truncated { offset: start })?;
        let end = tail
            .iter()
            .position(|b| *b == 0)
            .ok_or(ImageError::Truncated { offset: start })?;
        std::str::from_utf8(&tail[..end]).map_err(|_| ImageError::InvalidUtf8(index))
    }

    /// Returns a length-prefixed entry from the `#Blob` heap.
    pub fn blob(&self, index: u32) -> Result<&'a [u8], ImageError> {
        let start = index as usize;
        let tail = self
            .blobs
            .get(start..)
            .ok_or(ImageError::Truncated { offset: start })?;
        let (length, prefix) = read_compressed_u32(tail)?;
        prefix
            .checked_add(length as usize)
            .and_then(|end| tail.get(prefix..end))
            .ok_or(ImageError::Truncated { offset: start })
    }

    /// Reads a TypeRef row.
    pub fn type_ref(&self, row: u32) -> Result<TypeRefRow<'a>, ImageError> {
        Ok(TypeRefRow {
            name: self.string(self.cell(table::TYPE_REF, row, 1)?)?,
            namespace: self.string(self.cell(table::TYPE_REF, row, 2)?)?,
        })
    }

    /// Reads an InterfaceImpl row.
    pub fn interface_impl(&self, row: u32) -> Result<InterfaceImplRow, ImageError> {
        Ok(InterfaceImplRow {
            class: self.cell(table::INTERFACE_IMPL, row, 0)?,
            interface: self.coded(table::INTERFACE_IMPL, row, 1, TypeDefOrRef)?,
        })
    }

    /// Iterates the InterfaceImpl table.
    pub fn interface_impls(&self) -> impl Iterator<Item = Result<InterfaceImplRow, ImageError>> + '_ {
        (1..=self.row_count(table::INTERFACE_IMPL)).map(move |row| self.interface_impl(row))
    }

    /// Reads a MemberRef row.
    pub fn member_ref(&self, row: u32) -> Result<MemberRefRow<'a>, ImageError> {
        Ok(MemberRefRow {
            parent: self.coded(table::MEMBER_REF, row, 0, MemberRefParent)?,
            name: self.string(self.cell(table::MEMBER_REF, row, 1)?)?,
        })
    }

    /// Reads a CustomAttribute row.
    pub fn custom_attribute(&self, row: u32) -> Result<CustomAttributeRow, ImageError> {
        Ok(CustomAttributeRow {
            parent: self.coded(table::CUSTOM_ATTRIBUTE, row, 0, HasCustomAttribute)?,
            constructor: self.coded(table::CUSTOM_ATTRIBUTE, row, 1, CustomAttributeType)?,
            value: self.cell(table::CUSTOM_ATTRIBUTE, row, 2)?,
        })
    }

    /// Iterates the CustomAttribute table.
    pub fn custom_attributes(&self) -> impl Iterator<Item = Result<CustomAttributeRow, ImageError>> + '_ {
        (1..=self.row_count(table::CUSTOM_ATTRIBUTE)).map(move |row| self.custom_attribute(row))
    }

    /// Reads the assembly definition, if the module has one.
    pub fn assembly(&self) -> Result<Option<AssemblyRow<'a>>, ImageError> {
        if self.row_count(table::ASSEMBLY) == 0 {
            return Ok(None);
        }
        let column = |index| self.cell(table::ASSEMBLY, 1, index);
        let version = [column(1)?, column(2)?, column(3)?, column(4)?].map(|part| part as u16);
        Ok(Some(AssemblyRow {
            version,
            name: self.string(column(7)?)?,
        }))
    }
}

fn align4(value: usize) -> usize {
    (value + 3) & !3
}

/// Decodes an ECMA-335 compressed unsigned integer, returning (value, bytes used).
pub fn read_compressed_u32(data: &[u8]) -> Result<(u32, usize), ImageError> {
    let first = read_u8(data, 0)?;
    if first & 0x80 == 0 {
        Ok((u32::from(first), 1))
    } else if first & 0xC0 == 0x80 {
        let second = read_u8(data, 1)?;
        Ok(((u32::from(first & 0x3F) << 8) | u32::from(second), 2))
    } else if first & 0xE0 == 0xC0 {
        let rest = [read_u8(data, 1)?, read_u8(data, 2)?, read_u8(data, 3)?];
        let value = (u32::from(first & 0x1F) << 24)
            | (u32::from(rest[0]) << 16)
            | (u32::from(rest[1]) << 8)
            | u32::from(rest[2]);
        Ok((value, 4))
    } else {
        Err(ImageError::InvalidCompressedInteger)
    }
}

/// Decodes a serialized string from a custom attribute blob.
///
/// `0xFF` encodes null. Returns (string, bytes used).
pub fn read_ser_string(data: &[u8]) -> Result<(Option<&str>, usize), ImageError> {
    if data.first() == Some(&0xFF) {
        return Ok((None, 1));
    }
    let (length, prefix) = read_compressed_u32(data)?;
    let end = prefix
        .checked_add(length as usize)
        .ok_or(ImageError::Truncated { offset: prefix })?;
    let bytes = data
        .get(prefix..end)
        .ok_or(ImageError::Truncated { offset: prefix })?;
    let text = std::str::from_utf8(bytes).map_err(|_| ImageError::InvalidUtf8(0))?;
    Ok((Some(text), end))
}
