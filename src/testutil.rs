//! Minimal PE images for tests
//!
//! One `.idata` section holds the import descriptors, delay-load descriptors, names and thunks.
//! Function names starting with `#` are emitted as ordinal imports.

use std::path::{Path, PathBuf};

pub(crate) const MACHINE_I386: u16 = 0x14c;
pub(crate) const MACHINE_AMD64: u16 = 0x8664;

const PE_OFFSET: usize = 0x80;
const HEADERS_SIZE: usize = 0x400;
const SECTION_RVA: usize = 0x1000;
const SECTION_ALIGNMENT: usize = 0x1000;
const FILE_ALIGNMENT: usize = 0x200;
pub(crate) const IMAGE_BASE: u64 = 0x40_0000;

struct Library {
    name: Vec<u8>,
    functions: Vec<Vec<u8>>,
}

pub(crate) struct PeBuilder {
    machine: u16,
    pe64: bool,
    imports: Vec<Library>,
    delay_imports: Vec<Library>,
    legacy_delay: bool,
}

fn put_u16(buf: &mut [u8], at: usize, v: u16) {
    buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut [u8], at: usize, v: u64) {
    buf[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

impl PeBuilder {
    pub(crate) fn pe32() -> Self {
        Self {
            machine: MACHINE_I386,
            pe64: false,
            imports: Vec::new(),
            delay_imports: Vec::new(),
            legacy_delay: false,
        }
    }

    pub(crate) fn pe64() -> Self {
        Self {
            machine: MACHINE_AMD64,
            pe64: true,
            ..Self::pe32()
        }
    }

    pub(crate) fn machine(mut self, machine: u16) -> Self {
        self.machine = machine;
        self
    }

    pub(crate) fn import(self, library: &str, functions: &[&str]) -> Self {
        let functions: Vec<&[u8]> = functions.iter().map(|f| f.as_bytes()).collect();
        self.import_bytes(library.as_bytes(), &functions)
    }

    /// Import with names given as raw bytes, which need not be valid UTF-8
    pub(crate) fn import_bytes(mut self, library: &[u8], functions: &[&[u8]]) -> Self {
        self.imports.push(Library {
            name: library.to_vec(),
            functions: functions.iter().map(|f| f.to_vec()).collect(),
        });
        self
    }

    pub(crate) fn delay_import(mut self, library: &str, functions: &[&str]) -> Self {
        self.delay_imports.push(Library {
            name: library.as_bytes().to_vec(),
            functions: functions.iter().map(|f| f.as_bytes().to_vec()).collect(),
        });
        self
    }

    /// Emit delay-load descriptors with virtual addresses instead of RVAs
    pub(crate) fn legacy_delay(mut self) -> Self {
        self.legacy_delay = true;
        self
    }

    fn ordinal_flag(&self) -> u64 {
        if self.pe64 {
            1 << 63
        } else {
            1 << 31
        }
    }

    /// Append name and thunks of a library; returns the RVAs of its name and of its thunk array
    ///
    /// Thunks pointing at names are offset by `base`, so that they can hold virtual addresses.
    fn emit_library(&self, data: &mut Vec<u8>, lib: &Library, base: u64) -> (u32, u32) {
        let rva = |off: usize| (SECTION_RVA + off) as u32;

        let name_rva = rva(data.len());
        data.extend_from_slice(&lib.name);
        data.push(0);

        let mut thunks = Vec::new();
        for f in &lib.functions {
            if let Some(ordinal) = f.strip_prefix(b"#") {
                let ordinal: u64 = std::str::from_utf8(ordinal).unwrap().parse().unwrap();
                thunks.push(self.ordinal_flag() | ordinal);
            } else {
                if data.len() % 2 == 1 {
                    data.push(0);
                }
                thunks.push(base + rva(data.len()) as u64);
                data.extend_from_slice(&[0, 0]); // hint
                data.extend_from_slice(f);
                data.push(0);
            }
        }

        while data.len() % 8 != 0 {
            data.push(0);
        }
        let thunks_rva = rva(data.len());
        for t in thunks.into_iter().chain(std::iter::once(0)) {
            if self.pe64 {
                data.extend_from_slice(&t.to_le_bytes());
            } else {
                data.extend_from_slice(&(t as u32).to_le_bytes());
            }
        }
        (name_rva, thunks_rva)
    }

    pub(crate) fn build(&self) -> Vec<u8> {
        let import_table = (self.imports.len() + 1) * 20;
        let delay_table = (self.delay_imports.len() + 1) * 32;
        let mut data = vec![0u8; import_table + delay_table];

        for (i, lib) in self.imports.iter().enumerate() {
            let (name_rva, thunks_rva) = self.emit_library(&mut data, lib, 0);
            let d = i * 20;
            put_u32(&mut data, d, thunks_rva);
            put_u32(&mut data, d + 12, name_rva);
            put_u32(&mut data, d + 16, thunks_rva);
        }
        for (i, lib) in self.delay_imports.iter().enumerate() {
            let base = if self.legacy_delay { IMAGE_BASE } else { 0 };
            let (mut name_rva, mut thunks_rva) = self.emit_library(&mut data, lib, base);
            let d = import_table + i * 32;
            if self.legacy_delay {
                name_rva += IMAGE_BASE as u32;
                thunks_rva += IMAGE_BASE as u32;
            } else {
                put_u32(&mut data, d, 1);
            }
            put_u32(&mut data, d + 4, name_rva);
            put_u32(&mut data, d + 16, thunks_rva);
        }

        let mut image = vec![0u8; HEADERS_SIZE];
        image[0..2].copy_from_slice(b"MZ");
        put_u32(&mut image, 0x3c, PE_OFFSET as u32);
        image[PE_OFFSET..PE_OFFSET + 4].copy_from_slice(b"PE\0\0");

        let fh = PE_OFFSET + 4;
        let opt_size: u16 = if self.pe64 { 240 } else { 224 };
        put_u16(&mut image, fh, self.machine);
        put_u16(&mut image, fh + 2, 1);
        put_u16(&mut image, fh + 16, opt_size);

        let opt = fh + 20;
        let dirs = if self.pe64 {
            put_u16(&mut image, opt, 0x20b);
            put_u64(&mut image, opt + 24, IMAGE_BASE);
            put_u32(&mut image, opt + 108, 16);
            opt + 112
        } else {
            put_u16(&mut image, opt, 0x10b);
            put_u32(&mut image, opt + 28, IMAGE_BASE as u32);
            put_u32(&mut image, opt + 92, 16);
            opt + 96
        };
        put_u32(&mut image, opt + 32, SECTION_ALIGNMENT as u32);
        put_u32(&mut image, opt + 36, FILE_ALIGNMENT as u32);
        let image_size = SECTION_RVA + data.len().div_ceil(SECTION_ALIGNMENT) * SECTION_ALIGNMENT;
        put_u32(&mut image, opt + 56, image_size.max(SECTION_RVA + SECTION_ALIGNMENT) as u32);
        put_u32(&mut image, opt + 60, HEADERS_SIZE as u32);
        if !self.imports.is_empty() {
            put_u32(&mut image, dirs + 8, SECTION_RVA as u32);
            put_u32(&mut image, dirs + 12, import_table as u32);
        }
        if !self.delay_imports.is_empty() {
            put_u32(&mut image, dirs + 13 * 8, (SECTION_RVA + import_table) as u32);
            put_u32(&mut image, dirs + 13 * 8 + 4, delay_table as u32);
        }

        let section = opt + opt_size as usize;
        image[section..section + 6].copy_from_slice(b".idata");
        put_u32(&mut image, section + 8, data.len() as u32);
        put_u32(&mut image, section + 12, SECTION_RVA as u32);
        put_u32(&mut image, section + 16, data.len() as u32);
        put_u32(&mut image, section + 20, HEADERS_SIZE as u32);
        // initialized data, readable
        put_u32(&mut image, section + 36, 0x4000_0040);

        image.extend_from_slice(&data);
        image
    }

    pub(crate) fn write<P: AsRef<Path>>(&self, dir: P, file_name: &str) -> PathBuf {
        let path = dir.as_ref().join(file_name);
        std::fs::write(&path, self.build()).unwrap();
        path
    }
}

/// File offset of the first import descriptor in images produced by `PeBuilder`
pub(crate) const FIRST_IMPORT_DESCRIPTOR: usize = HEADERS_SIZE;
