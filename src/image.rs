//! Locating a module on disk and reading its import and delay-load import tables
//!
//! The file is mapped read-only and never loaded or executed. Headers and tables are read through
//! pelite, so every offset taken from the file is bounds checked.

use crate::apiset::ApiSetResolver;
use crate::common::{lower, path_to_string, WalkError};
use crate::context::{Import, Module};
use crate::lookup_path::LookupPath;
use crate::query::LookupQuery;
use pelite::image::{
    IMAGE_DIRECTORY_ENTRY_DELAY_IMPORT, IMAGE_DIRECTORY_ENTRY_IMPORT, IMAGE_FILE_MACHINE_AMD64,
    IMAGE_FILE_MACHINE_I386, IMAGE_ORDINAL_FLAG32, IMAGE_ORDINAL_FLAG64,
};
use pelite::pe64::imports::Import as Symbol;
use pelite::util::CStr;
use pelite::{PeFile, Wrap};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

// missing from pelite::image
const IMAGE_FILE_MACHINE_ARMNT: u16 = 0x01c4;
const IMAGE_FILE_MACHINE_ARM64: u16 = 0xaa64;

/// Anything that can turn a module name into its parsed import information
pub trait ImageParser {
    /// Parse a module named in an import table
    fn parse(&self, name: &str) -> Result<Module, WalkError>;

    /// Parse the module a walk starts from, which may be given as a path
    fn parse_root(&self, target: &str) -> Result<Module, WalkError> {
        self.parse(target)
    }
}

/// `IMAGE_DELAYLOAD_DESCRIPTOR`
#[allow(non_snake_case, dead_code)]
#[derive(Copy, Clone, Debug)]
#[repr(C)]
struct ImageDelayloadDescriptor {
    Attributes: u32,
    DllNameRVA: u32,
    ModuleHandleRVA: u32,
    ImportAddressTableRVA: u32,
    ImportNameTableRVA: u32,
    BoundImportAddressTableRVA: u32,
    UnloadInformationTableRVA: u32,
    TimeDateStamp: u32,
}

unsafe impl dataview::Pod for ImageDelayloadDescriptor {}

fn invalid(image: &str, e: pelite::Error) -> WalkError {
    match e {
        pelite::Error::BadMagic | pelite::Error::PeMagic => {
            WalkError::Validation(format!("Image '{}' is not executable", image))
        }
        pelite::Error::Encoding => WalkError::Encoding(format!("Image '{}': {}", image, e)),
        _ => WalkError::Validation(format!("Image '{}' is malformed: {}", image, e)),
    }
}

/// Check the headers of a mapped file and pick the 32 or 64 bit reader for it
fn open_image<'a>(bytes: &'a [u8], image: &str) -> Result<PeFile<'a>, WalkError> {
    let pe = PeFile::from_bytes(bytes).map_err(|e| invalid(image, e))?;
    let machine = pe.file_header().Machine;
    let pe64 = match machine {
        IMAGE_FILE_MACHINE_I386 | IMAGE_FILE_MACHINE_ARMNT => false,
        IMAGE_FILE_MACHINE_AMD64 | IMAGE_FILE_MACHINE_ARM64 => true,
        _ => {
            return Err(WalkError::Validation(format!(
                "Image '{}' has unsupported architecture {:#06x}",
                image, machine
            )))
        }
    };
    if pe64 != matches!(pe, Wrap::T64(_)) {
        return Err(WalkError::Validation(format!(
            "Image '{}' optional header magic does not match architecture {:#06x}",
            image, machine
        )));
    }
    Ok(pe)
}

/// RVA of a present, non empty data directory
fn directory(pe: PeFile<'_>, index: usize) -> Option<u32> {
    pe.data_directory()
        .get(index)
        .filter(|d| d.VirtualAddress != 0 && d.Size != 0)
        .map(|d| d.VirtualAddress)
}

/// Names are read as UTF-8; anything else is reported and left out
fn utf8<'a>(name: &'a CStr, image: &str, what: &str) -> Option<&'a str> {
    match name.to_str() {
        Ok(name) => Some(name),
        Err(_) => {
            warn!(
                "{} {:?} in {} is not valid UTF-8, skipped",
                what,
                String::from_utf8_lossy(name.as_ref()),
                image
            );
            None
        }
    }
}

/// Last component of a name that may contain a directory
fn file_name_of(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

/// Parses PE files found through a `LookupPath`, resolving API set names on the way
pub struct PeImageParser {
    lookup: LookupPath,
    resolver: ApiSetResolver,
    delayed: bool,
}

impl PeImageParser {
    pub fn new(lookup: LookupPath, resolver: ApiSetResolver, delayed: bool) -> Self {
        Self {
            lookup,
            resolver,
            delayed,
        }
    }

    /// Parser for the search path and the API set schema of the system described by the query
    pub fn from_query(query: &LookupQuery) -> Self {
        let namespace = query.system.as_ref().and_then(|s| s.apiset_namespace());
        Self::new(
            LookupPath::deduce(query),
            ApiSetResolver::new(namespace),
            query.parameters.delayed,
        )
    }

    pub fn resolver(&self) -> &ApiSetResolver {
        &self.resolver
    }

    /// Find the file of a module on the lookup path
    ///
    /// Only the file name is looked up: a directory in an import name is never followed.
    fn locate(&self, name: &str) -> Result<PathBuf, WalkError> {
        self.lookup
            .search_dll(file_name_of(name))?
            .map(|r| r.fullpath)
            .ok_or_else(|| WalkError::NotFound(format!("Cannot open '{}' image", name)))
    }

    /// Parse the file at `path` as the module called `name`
    pub fn parse_file(&self, name: &str, path: &Path) -> Result<Module, WalkError> {
        let mut module = Module::new(file_name_of(name));

        let size = fs_err::metadata(path)
            .map_err(|e| WalkError::NotFound(format!("Cannot open '{}' image: {}", name, e)))?
            .len();
        if size == 0 {
            return Err(WalkError::Validation(format!(
                "Image '{}' is not executable",
                name
            )));
        }
        // unmapped when dropped, on every path out of this function
        let filemap = pelite::FileMap::open(path)
            .map_err(|e| WalkError::NotFound(format!("Cannot open '{}' image: {}", name, e)))?;
        let display_name = path_to_string(path);
        let pe = open_image(filemap.as_ref(), &display_name)?;

        let mut imports = self.parse_imports(pe, &display_name)?;
        if self.delayed {
            imports.extend(self.parse_delayed_imports(pe, &display_name)?);
        }
        module.set_imports(imports);
        module.set_path(path);

        debug!(
            "parsed {} ({}-bit): {} imports, {} functions",
            module.name(),
            if matches!(pe, Wrap::T64(_)) { 64 } else { 32 },
            module.import_count(),
            module.function_count()
        );
        Ok(module)
    }

    fn parse_imports(&self, pe: PeFile<'_>, image: &str) -> Result<Vec<Import>, WalkError> {
        let mut imports = Vec::new();
        if directory(pe, IMAGE_DIRECTORY_ENTRY_IMPORT).is_none() {
            return Ok(imports);
        }
        let err = |e: pelite::Error| invalid(image, e);
        for desc in pe.imports().map_err(err)? {
            let original_first_thunk = desc.image().OriginalFirstThunk;
            if original_first_thunk == 0 || original_first_thunk & 1 != 0 {
                break;
            }
            if desc.image().Name == 0 {
                continue;
            }
            let Some(library) = utf8(desc.dll_name().map_err(err)?, image, "library") else {
                continue;
            };
            let symbols = desc.int().map_err(err)?.map(|s| s.map_err(err));
            imports.push(self.read_import(image, library, symbols)?);
        }
        Ok(imports)
    }

    fn parse_delayed_imports(&self, pe: PeFile<'_>, image: &str) -> Result<Vec<Import>, WalkError> {
        let mut imports = Vec::new();
        let Some(table) = directory(pe, IMAGE_DIRECTORY_ENTRY_DELAY_IMPORT) else {
            return Ok(imports);
        };
        let err = |e: pelite::Error| invalid(image, e);
        let descriptors = pe
            .derva_slice_f(table, |d: &ImageDelayloadDescriptor| d.DllNameRVA == 0)
            .map_err(err)?;
        let image_base = match pe.optional_header() {
            Wrap::T32(header) => u64::from(header.ImageBase),
            Wrap::T64(header) => header.ImageBase,
        };

        for descriptor in descriptors {
            // descriptors without the RVA attribute hold virtual addresses
            let legacy = descriptor.Attributes & 1 == 0;
            let to_rva = |address: u64| {
                let rva = if legacy {
                    address.checked_sub(image_base)
                } else {
                    Some(address)
                };
                rva.and_then(|rva| u32::try_from(rva).ok())
                    .ok_or_else(|| {
                        WalkError::Validation(format!(
                            "Image '{}' has delay-load address {:#x} outside of the image",
                            image, address
                        ))
                    })
            };

            let name = pe
                .derva_c_str(to_rva(descriptor.DllNameRVA.into())?)
                .map_err(err)?;
            let Some(library) = utf8(name, image, "library") else {
                continue;
            };
            let thunks: Vec<(u64, bool)> = match descriptor.ImportNameTableRVA {
                0 => Vec::new(),
                rva => match pe {
                    Wrap::T32(_) => pe
                        .derva_slice_s::<u32>(to_rva(rva.into())?, 0)
                        .map_err(err)?
                        .iter()
                        .map(|&t| (u64::from(t), t & IMAGE_ORDINAL_FLAG32 != 0))
                        .collect(),
                    Wrap::T64(_) => pe
                        .derva_slice_s::<u64>(to_rva(rva.into())?, 0)
                        .map_err(err)?
                        .iter()
                        .map(|&t| (t, t & IMAGE_ORDINAL_FLAG64 != 0))
                        .collect(),
                },
            };
            let symbols = thunks.into_iter().map(|(thunk, by_ordinal)| -> Result<Symbol, WalkError> {
                if by_ordinal {
                    return Ok(Symbol::ByOrdinal { ord: thunk as u16 });
                }
                // IMAGE_IMPORT_BY_NAME: a 16 bit hint, then the name
                let hint_rva = to_rva(thunk)?;
                let hint = pe.derva_copy::<u16>(hint_rva).map_err(err)?;
                let name = hint_rva
                    .checked_add(2)
                    .ok_or(pelite::Error::Overflow)
                    .and_then(|rva| pe.derva_c_str(rva))
                    .map_err(err)?;
                Ok(Symbol::ByName {
                    hint: hint.into(),
                    name,
                })
            });
            imports.push(self.read_import(image, library, symbols)?);
        }
        Ok(imports)
    }

    /// Build the Import of `library` with the functions it is asked for by name
    fn read_import<'a>(
        &self,
        image: &str,
        library: &str,
        symbols: impl Iterator<Item = Result<Symbol<'a>, WalkError>>,
    ) -> Result<Import, WalkError> {
        let logical_name = self.resolver.resolve(library);
        let mut import = Import::new(&logical_name, library);
        for symbol in symbols {
            match symbol? {
                Symbol::ByName { name, .. } => {
                    if let Some(function) = utf8(name, image, "function") {
                        import.add_function(function);
                    }
                }
                // imported by ordinal only, no name to report
                Symbol::ByOrdinal { .. } => {}
            }
        }
        Ok(import)
    }
}

impl ImageParser for PeImageParser {
    fn parse(&self, name: &str) -> Result<Module, WalkError> {
        let path = self.locate(name)?;
        debug!("parsing {} from {}", lower(name), path_to_string(&path));
        self.parse_file(name, &path)
    }

    /// An existing file is opened as is; other targets are searched like imports
    fn parse_root(&self, target: &str) -> Result<Module, WalkError> {
        let path = Path::new(target);
        if path.is_file() {
            debug!("parsing {}", target);
            self.parse_file(target, path)
        } else if target.contains(['/', '\\']) {
            Err(WalkError::NotFound(format!("Cannot open '{}' image", target)))
        } else {
            self.parse(target)
        }
    }
}
