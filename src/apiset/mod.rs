/*!
API set schema: the table the Windows loader uses to redirect virtual library names
(`api-ms-win-*`, `ext-ms-*`) to the library that implements them.

Resources:

* https://blog.quarkslab.com/runtime-dll-name-resolution-apisetschema-part-i.html
* https://lucasg.github.io/2017/10/15/Api-set-resolution/
* https://www.geoffchappell.com/studies/windows/win32/apisetschema/index.htm

Only the version 6 layout (Windows 10 and later) is understood.
 */

mod resolver;

pub use resolver::ApiSetResolver;

use crate::common::WalkError;
use crate::layout::{offset_of, Reader};
use std::path::Path;

const SCHEMA_VERSION: u32 = 6;
const NAMESPACE_HEADER_SIZE: usize = 28;
const NAMESPACE_ENTRY_SIZE: usize = 24;
const VALUE_ENTRY_SIZE: usize = 20;

/// One virtual name and the libraries that can host it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApisetEntry {
    /// e.g. `api-ms-win-core-file-l1-2-2` (no extension)
    pub name: String,
    /// host library names, in schema order; may contain empty names
    pub hosts: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApisetNamespace {
    entries: Vec<ApisetEntry>,
}

impl ApisetNamespace {
    pub fn from_entries(entries: Vec<ApisetEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[ApisetEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decode the content of the `.apiset` section
    pub fn parse(schema: &[u8]) -> Result<Self, WalkError> {
        let r = Reader::new(schema, "API set schema");
        let version = r.u32(0)?;
        if version != SCHEMA_VERSION {
            return Err(WalkError::Validation(format!(
                "unsupported API set schema version {}",
                version
            )));
        }
        if r.len() < NAMESPACE_HEADER_SIZE {
            return Err(WalkError::Validation("truncated API set schema".to_owned()));
        }
        let count = r.u32(12)? as usize;
        let entries_offset = r.u32(16)? as usize;

        let mut entries = Vec::new();
        for i in 0..count {
            let e = offset_of(entries_offset, i, NAMESPACE_ENTRY_SIZE)?;
            let name_offset = r.u32(e + 4)? as usize;
            let name_length = r.u32(e + 8)? as usize;
            if name_length == 0 {
                continue;
            }
            let name = r.utf16(name_offset, name_length)?;

            let values_offset = r.u32(e + 16)? as usize;
            let values_count = r.u32(e + 20)? as usize;
            let hosts = (0..values_count)
                .map(|j| {
                    let v = offset_of(values_offset, j, VALUE_ENTRY_SIZE)?;
                    let host_offset = r.u32(v + 12)? as usize;
                    let host_length = r.u32(v + 16)? as usize;
                    r.utf16(host_offset, host_length)
                })
                .collect::<Result<Vec<String>, WalkError>>()?;

            entries.push(ApisetEntry {
                name: name.to_lowercase(),
                hosts,
            });
        }

        Ok(Self { entries })
    }
}

/// Read the namespace out of the `.apiset` section of `apisetschema.dll`
///
/// A schema DLL without such section yields an empty namespace
pub fn parse_apiset<P: AsRef<Path>>(apisetschema_path: P) -> Result<ApisetNamespace, WalkError> {
    let filemap = pelite::FileMap::open(apisetschema_path.as_ref())?;
    let pefile = pelite::PeFile::from_bytes(&filemap)?;
    if let Some(section) = pefile.section_headers().by_name(".apiset") {
        ApisetNamespace::parse(pefile.get_section_bytes(section)?)
    } else {
        Ok(ApisetNamespace::default())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn push_utf16(buf: &mut Vec<u8>, s: &str) -> (u32, u32) {
        let offset = buf.len() as u32;
        for u in s.encode_utf16() {
            buf.extend_from_slice(&u.to_le_bytes());
        }
        (offset, buf.len() as u32 - offset)
    }

    /// Serialize entries in the version 6 layout
    pub(crate) fn build_schema(entries: &[(&str, &[&str])]) -> Vec<u8> {
        let entries_offset = NAMESPACE_HEADER_SIZE;
        let values_offset = entries_offset + entries.len() * NAMESPACE_ENTRY_SIZE;
        let value_count: usize = entries.iter().map(|(_, h)| h.len()).sum();
        let strings_offset = values_offset + value_count * VALUE_ENTRY_SIZE;

        let mut header = Vec::new();
        let mut entry_table = Vec::new();
        let mut value_table = Vec::new();
        let mut strings = vec![0u8; strings_offset];

        for w in [SCHEMA_VERSION, 0, 0, entries.len() as u32, entries_offset as u32, 0, 0] {
            header.extend_from_slice(&w.to_le_bytes());
        }

        let mut next_value = values_offset;
        for (name, hosts) in entries {
            let (name_offset, name_length) = push_utf16(&mut strings, name);
            for w in [
                0,
                name_offset,
                name_length,
                name_length,
                next_value as u32,
                hosts.len() as u32,
            ] {
                entry_table.extend_from_slice(&w.to_le_bytes());
            }
            for host in hosts.iter() {
                let (host_offset, host_length) = push_utf16(&mut strings, host);
                for w in [0, 0, 0, host_offset, host_length] {
                    value_table.extend_from_slice(&w.to_le_bytes());
                }
                next_value += VALUE_ENTRY_SIZE;
            }
        }

        strings[..NAMESPACE_HEADER_SIZE].copy_from_slice(&header);
        strings[entries_offset..values_offset].copy_from_slice(&entry_table);
        strings[values_offset..strings_offset].copy_from_slice(&value_table);
        strings
    }

    #[test]
    fn parse_schema_v6() -> Result<(), WalkError> {
        let schema = build_schema(&[
            ("api-ms-win-core-file-l1-2-2", &["kernel32.dll", "kernelbase.dll"]),
            ("EXT-MS-WIN-GDI-DRAW-L1-1-0", &["gdi32full.dll"]),
            ("api-ms-win-empty-l1-1-0", &[]),
        ]);
        let ns = ApisetNamespace::parse(&schema)?;
        assert_eq!(ns.entries().len(), 3);
        assert_eq!(
            ns.entries()[0],
            ApisetEntry {
                name: "api-ms-win-core-file-l1-2-2".to_owned(),
                hosts: vec!["kernel32.dll".to_owned(), "kernelbase.dll".to_owned()],
            }
        );
        assert_eq!(ns.entries()[1].name, "ext-ms-win-gdi-draw-l1-1-0");
        assert!(ns.entries()[2].hosts.is_empty());
        Ok(())
    }

    #[test]
    fn reject_other_versions() {
        let mut schema = build_schema(&[]);
        schema[0] = 4;
        assert!(matches!(
            ApisetNamespace::parse(&schema),
            Err(WalkError::Validation(_))
        ));
    }

    #[test]
    fn truncated_schema_is_validation_error() {
        let schema = build_schema(&[("api-ms-win-core-file-l1-2-2", &["kernelbase.dll"])]);
        assert!(matches!(
            ApisetNamespace::parse(&schema[..40]),
            Err(WalkError::Validation(_))
        ));
    }

    #[test]
    fn missing_schema_file() {
        assert!(parse_apiset("/nonexistent/apisetschema.dll").is_err());
    }
}
