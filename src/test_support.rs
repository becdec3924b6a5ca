//! Builders for synthetic plugin binaries, ZIP packages and a local HTTP
//! server, shared by unit and integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::io::{Cursor, Write};
use std::net::SocketAddr;

use axum::Router;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

pub const PLUGIN_NAMESPACE: &str = "Dalamud.Plugin";
pub const PLUGIN_INTERFACE: &str = "IDalamudPlugin";

const HEADER_AREA: usize = 0x200;
const PE_OFFSET: usize = 0x80;
const OPTIONAL_HEADER: usize = PE_OFFSET + 4 + 20;
const OPTIONAL_HEADER_SIZE: usize = 0xE0;
const SECTION_TABLE: usize = OPTIONAL_HEADER + OPTIONAL_HEADER_SIZE;
const SECTION_RVA: u32 = 0x2000;
const FILE_ALIGNMENT: usize = 0x200;
const CLI_HEADER_SIZE: usize = 72;

const TABLE_MODULE: usize = 0x00;
const TABLE_TYPE_REF: usize = 0x01;
const TABLE_TYPE_DEF: usize = 0x02;
const TABLE_INTERFACE_IMPL: usize = 0x09;
const TABLE_MEMBER_REF: usize = 0x0A;
const TABLE_CUSTOM_ATTRIBUTE: usize = 0x0C;
const TABLE_ASSEMBLY: usize = 0x20;

/// Builds a minimal managed PE32 image with real metadata tables.
#[derive(Debug, Clone)]
pub struct AssemblyFixture {
    name: String,
    version: [u16; 4],
    implemented: Vec<(String, String)>,
    referenced: Vec<(String, String)>,
    framework: Option<String>,
}

impl AssemblyFixture {
    /// An assembly with no interfaces.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            version: [1, 0, 0, 0],
            implemented: Vec::new(),
            referenced: Vec::new(),
            framework: None,
        }
    }

    /// An assembly whose entry type implements the plugin interface.
    pub fn plugin(name: &str) -> Self {
        Self::new(name).implementing(PLUGIN_NAMESPACE, PLUGIN_INTERFACE)
    }

    pub fn version(mut self, version: [u16; 4]) -> Self {
        self.version = version;
        self
    }

    /// Adds an InterfaceImpl row on the entry type.
    pub fn implementing(mut self, namespace: &str, name: &str) -> Self {
        self.implemented
            .push((namespace.to_string(), name.to_string()));
        self
    }

    /// Adds a TypeRef row that nothing implements.
    pub fn referencing(mut self, namespace: &str, name: &str) -> Self {
        self.referenced
            .push((namespace.to_string(), name.to_string()));
        self
    }

    /// Declares an assembly-level TargetFrameworkAttribute.
    pub fn target_framework(mut self, framework: &str) -> Self {
        self.framework = Some(framework.to_string());
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let metadata = self.metadata();
        let mut content = Vec::new();

        // CLI header
        put_u32(&mut content, CLI_HEADER_SIZE as u32);
        put_u16(&mut content, 2);
        put_u16(&mut content, 5);
        put_u32(&mut content, SECTION_RVA + CLI_HEADER_SIZE as u32);
        put_u32(&mut content, metadata.len() as u32);
        put_u32(&mut content, 1);
        content.resize(CLI_HEADER_SIZE, 0);
        content.extend_from_slice(&metadata);

        pe_image(&content, true)
    }

    fn metadata(&self) -> Vec<u8> {
        let mut strings = vec![0u8];
        let mut blobs = vec![0u8];
        let mut rows: [Vec<u8>; 0x2D] = std::array::from_fn(|_| Vec::new());
        let mut counts = [0u32; 0x2D];

        // Module
        let module_name = intern(&mut strings, &format!("{}.dll", self.name));
        let module = &mut rows[TABLE_MODULE];
        put_u16(module, 0);
        put_u16(module, module_name);
        put_u16(module, 1);
        put_u16(module, 0);
        put_u16(module, 0);
        counts[TABLE_MODULE] = 1;

        // TypeRef: implemented, then referenced, then the framework attribute
        let mut type_refs: Vec<(String, String)> = self.implemented.clone();
        type_refs.extend(self.referenced.iter().cloned());
        let framework_type = self.framework.as_ref().map(|_| {
            type_refs.push((
                "System.Runtime.Versioning".to_string(),
                "TargetFrameworkAttribute".to_string(),
            ));
            type_refs.len() as u16
        });
        for (namespace, name) in &type_refs {
            let name = intern(&mut strings, name);
            let namespace = intern(&mut strings, namespace);
            let row = &mut rows[TABLE_TYPE_REF];
            // ResolutionScope -> Module row 1
            put_u16(row, 1 << 2);
            put_u16(row, name);
            put_u16(row, namespace);
        }
        counts[TABLE_TYPE_REF] = type_refs.len() as u32;

        // TypeDef: <Module> and the entry type
        let module_type = intern(&mut strings, "<Module>");
        let entry_type = intern(&mut strings, "Plugin");
        let entry_namespace = intern(&mut strings, &self.name);
        for (flags, name, namespace) in [(0u32, module_type, 0u16), (0x0010_0001, entry_type, entry_namespace)] {
            let row = &mut rows[TABLE_TYPE_DEF];
            put_u32(row, flags);
            put_u16(row, name);
            put_u16(row, namespace);
            put_u16(row, 0);
            put_u16(row, 1);
            put_u16(row, 1);
        }
        counts[TABLE_TYPE_DEF] = 2;

        // InterfaceImpl: class 2 implements TypeRef rows 1..=n
        for index in 0..self.implemented.len() {
            let row = &mut rows[TABLE_INTERFACE_IMPL];
            put_u16(row, 2);
            put_u16(row, (((index + 1) as u16) << 2) | 1);
        }
        counts[TABLE_INTERFACE_IMPL] = self.implemented.len() as u32;

        if let (Some(framework), Some(type_row)) = (&self.framework, framework_type) {
            let constructor = intern(&mut strings, ".ctor");
            let signature = blob(&mut blobs, &[0x20, 0x01, 0x01, 0x0E]);
            let member = &mut rows[TABLE_MEMBER_REF];
            put_u16(member, (type_row << 3) | 1);
            put_u16(member, constructor);
            put_u16(member, signature);
            counts[TABLE_MEMBER_REF] = 1;

            let mut value = vec![0x01, 0x00, framework.len() as u8];
            value.extend_from_slice(framework.as_bytes());
            value.extend_from_slice(&[0x00, 0x00]);
            let value = blob(&mut blobs, &value);
            let attribute = &mut rows[TABLE_CUSTOM_ATTRIBUTE];
            // HasCustomAttribute -> Assembly row 1, CustomAttributeType -> MemberRef row 1
            put_u16(attribute, (1 << 5) | 14);
            put_u16(attribute, (1 << 3) | 3);
            put_u16(attribute, value);
            counts[TABLE_CUSTOM_ATTRIBUTE] = 1;
        }

        // Assembly
        let assembly_name = intern(&mut strings, &self.name);
        let assembly = &mut rows[TABLE_ASSEMBLY];
        put_u32(assembly, 0x8004);
        for part in self.version {
            put_u16(assembly, part);
        }
        put_u32(assembly, 0);
        put_u16(assembly, 0);
        put_u16(assembly, assembly_name);
        put_u16(assembly, 0);
        counts[TABLE_ASSEMBLY] = 1;

        let mut valid = 0u64;
        for (id, count) in counts.iter().enumerate() {
            if *count > 0 {
                valid |= 1 << id;
            }
        }

        let mut tables = Vec::new();
        put_u32(&mut tables, 0);
        tables.extend_from_slice(&[2, 0, 0, 1]);
        tables.extend_from_slice(&valid.to_le_bytes());
        tables.extend_from_slice(&0u64.to_le_bytes());
        for count in counts.iter().filter(|count| **count > 0) {
            put_u32(&mut tables, *count);
        }
        for (id, data) in rows.iter().enumerate() {
            if counts[id] > 0 {
                tables.extend_from_slice(data);
            }
        }

        let guids = vec![0x11u8; 16];
        pad4(&mut tables);
        pad4(&mut strings);
        pad4(&mut blobs);

        metadata_root(&[
            ("#~", &tables),
            ("#Strings", &strings),
            ("#GUID", &guids),
            ("#Blob", &blobs),
        ])
    }
}

/// Builds a PE32 image without a CLI header, carrying `payload` in `.text`.
pub fn native_image(payload: &[u8]) -> Vec<u8> {
    pe_image(payload, false)
}

/// Builds a ZIP archive; names ending in `/` become directory entries.
pub fn zip_archive(members: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();

    for (name, data) in members {
        if name.ends_with('/') {
            writer.add_directory(*name, options).expect("add directory");
        } else {
            writer.start_file(*name, options).expect("start file");
            writer.write_all(data).expect("write member");
        }
    }

    writer.finish().expect("finish archive").into_inner()
}

/// Overwrites the uncompressed size of every member in both the local and
/// central directory headers. Returns how many headers were patched.
///
/// Member data must not contain header signatures.
pub fn forge_declared_size(archive: &mut [u8], size: u32) -> usize {
    const LOCAL_HEADER: &[u8] = b"PK\x03\x04";
    const CENTRAL_HEADER: &[u8] = b"PK\x01\x02";

    let mut patched = 0;
    for offset in 0..archive.len().saturating_sub(4) {
        let field = match &archive[offset..offset + 4] {
            sig if sig == LOCAL_HEADER => offset + 22,
            sig if sig == CENTRAL_HEADER => offset + 24,
            _ => continue,
        };
        write_u32(archive, field, size);
        patched += 1;
    }
    patched
}

/// Local HTTP server bound to an ephemeral port, stopped on drop.
pub struct TestServer {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TestServer {
    pub async fn start(app: Router) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test server");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            tokio::select! {
                _ = axum::serve(listener, app) => {}
                _ = shutdown_rx => {}
            }
        });

        Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Serves `body` at `/plugin.zip`.
    pub async fn serving(body: Vec<u8>) -> Self {
        let app = Router::new().route("/plugin.zip", get(move || async move { body }));
        Self::start(app).await
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn pe_image(content: &[u8], managed: bool) -> Vec<u8> {
    let mut image = vec![0u8; HEADER_AREA];

    image[0..2].copy_from_slice(b"MZ");
    image[0x3C..0x40].copy_from_slice(&(PE_OFFSET as u32).to_le_bytes());
    image[PE_OFFSET..PE_OFFSET + 4].copy_from_slice(b"PE\0\0");

    let coff = PE_OFFSET + 4;
    write_u16(&mut image, coff, 0x014C);
    write_u16(&mut image, coff + 2, 1);
    write_u16(&mut image, coff + 16, OPTIONAL_HEADER_SIZE as u16);
    write_u16(&mut image, coff + 18, 0x2102);

    write_u16(&mut image, OPTIONAL_HEADER, 0x10B);
    write_u32(&mut image, OPTIONAL_HEADER + 92, 16);
    if managed {
        let cli_directory = OPTIONAL_HEADER + 96 + 14 * 8;
        write_u32(&mut image, cli_directory, SECTION_RVA);
        write_u32(&mut image, cli_directory + 4, CLI_HEADER_SIZE as u32);
    }

    let raw_size = content.len().max(1).div_ceil(FILE_ALIGNMENT) * FILE_ALIGNMENT;
    image[SECTION_TABLE..SECTION_TABLE + 5].copy_from_slice(b".text");
    write_u32(&mut image, SECTION_TABLE + 8, content.len() as u32);
    write_u32(&mut image, SECTION_TABLE + 12, SECTION_RVA);
    write_u32(&mut image, SECTION_TABLE + 16, raw_size as u32);
    write_u32(&mut image, SECTION_TABLE + 20, HEADER_AREA as u32);
    write_u32(&mut image, SECTION_TABLE + 36, 0x6000_0020);

    image.extend_from_slice(content);
    image.resize(HEADER_AREA + raw_size, 0);
    image
}

fn metadata_root(streams: &[(&str, &[u8])]) -> Vec<u8> {
    let version = b"v4.0.30319\0\0";
    let headers_size: usize = streams
        .iter()
        .map(|(name, _)| 8 + (name.len() + 1).div_ceil(4) * 4)
        .sum();
    let mut offset = 16 + version.len() + 4 + headers_size;

    let mut root = Vec::new();
    root.extend_from_slice(b"BSJB");
    put_u16(&mut root, 1);
    put_u16(&mut root, 1);
    put_u32(&mut root, 0);
    put_u32(&mut root, version.len() as u32);
    root.extend_from_slice(version);
    put_u16(&mut root, 0);
    put_u16(&mut root, streams.len() as u16);

    for (name, data) in streams {
        put_u32(&mut root, offset as u32);
        put_u32(&mut root, data.len() as u32);
        root.extend_from_slice(name.as_bytes());
        root.push(0);
        pad4(&mut root);
        offset += data.len();
    }
    for (_, data) in streams {
        root.extend_from_slice(data);
    }
    root
}

fn intern(heap: &mut Vec<u8>, value: &str) -> u16 {
    if value.is_empty() {
        return 0;
    }
    let index = heap.len() as u16;
    heap.extend_from_slice(value.as_bytes());
    heap.push(0);
    index
}

fn blob(heap: &mut Vec<u8>, value: &[u8]) -> u16 {
    let index = heap.len() as u16;
    heap.push(value.len() as u8);
    heap.extend_from_slice(value);
    index
}

fn pad4(data: &mut Vec<u8>) {
    while data.len() % 4 != 0 {
        data.push(0);
    }
}

fn put_u16(data: &mut Vec<u8>, value: u16) {
    data.extend_from_slice(&value.to_le_bytes());
}

fn put_u32(data: &mut Vec<u8>, value: u32) {
    data.extend_from_slice(&value.to_le_bytes());
}

fn write_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn write_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}
