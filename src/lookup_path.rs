use crate::common::WalkError;
use crate::query::LookupQuery;
use crate::system::WinFileSystemCache;
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Directory to be searched, and relative metadata
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum LookupPathEntry {
    /// Directory where the root executable sits
    ExecutableDir(PathBuf),
    /// Windows System directory (typically C:\Windows\System32)
    SystemDir(PathBuf),
    // SystemDir16, // ignored
    /// Windows directory (typically C:\Windows)
    WindowsDir(PathBuf),
    /// Working directory of the (virtual) process whose DLL lookup we are simulating
    WorkingDir(PathBuf),
    /// PATH as specified by the system (value PATH variable in the shell executing the process)
    SystemPath(PathBuf),
    /// Additional path entries specified by the user
    UserPath(PathBuf),
}

impl LookupPathEntry {
    pub fn is_system(&self) -> bool {
        matches!(self, Self::WindowsDir(_) | Self::SystemDir(_))
    }

    pub fn get_path(&self) -> &Path {
        match self {
            Self::ExecutableDir(p)
            | Self::SystemDir(p)
            | Self::WindowsDir(p)
            | Self::WorkingDir(p)
            | Self::SystemPath(p)
            | Self::UserPath(p) => p,
        }
    }
}

/// Full location of a module found during lookup
#[derive(Debug, Clone)]
pub struct LookupResult {
    pub location: LookupPathEntry,
    pub fullpath: PathBuf,
}

/// Sorted list of directories to be looked up when searching for a module by name
///
/// Standard search order for desktop applications (safe mode):
/// https://docs.microsoft.com/en-us/windows/win32/dlls/dynamic-link-library-search-order#standard-search-order-for-desktop-applications
pub struct LookupPath {
    pub entries: Vec<LookupPathEntry>,
    fs_cache: RefCell<WinFileSystemCache>,
}

impl LookupPath {
    pub fn new(entries: Vec<LookupPathEntry>) -> Self {
        Self {
            entries,
            fs_cache: RefCell::new(WinFileSystemCache::new()),
        }
    }

    /// Build the search path for the given query
    pub fn deduce(query: &LookupQuery) -> Self {
        let system_entries = if let Some(system) = &query.system {
            vec![
                LookupPathEntry::SystemDir(system.sys_dir.clone()),
                // 16-bit system directory ignored
                LookupPathEntry::WindowsDir(system.win_dir.clone()),
            ]
        } else {
            Vec::new()
        };

        let entries = [
            vec![LookupPathEntry::ExecutableDir(query.target.app_dir.clone())],
            system_entries,
            vec![LookupPathEntry::WorkingDir(
                query.target.working_dir.clone(),
            )],
            Self::system_path_entries(query),
            Self::user_path_entries(query),
        ]
        .concat();

        Self::new(entries)
    }

    /// Get the PATH entries specified by the system
    fn system_path_entries(q: &LookupQuery) -> Vec<LookupPathEntry> {
        q.system
            .as_ref()
            .and_then(|s| s.system_path.as_ref())
            .map(|p| {
                p.iter()
                    .map(|s| LookupPathEntry::SystemPath(s.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Get the PATH entries that were provided by the user when running the program
    fn user_path_entries(q: &LookupQuery) -> Vec<LookupPathEntry> {
        q.target
            .user_path
            .iter()
            .map(|s| LookupPathEntry::UserPath(s.clone()))
            .collect()
    }

    // linearize the lookup path into a single vector of directories
    pub fn search_path(&self) -> Vec<PathBuf> {
        self.entries.iter().map(|e| e.get_path().to_owned()).collect()
    }

    /// Look for a module by name, in search path order
    ///
    /// Directories that can't be read are skipped
    pub fn search_dll(&self, library: &str) -> Result<Option<LookupResult>, WalkError> {
        for e in &self.entries {
            match self.search_file_in_folder(library, e.get_path()) {
                Ok(Some(fullpath)) => {
                    debug!("found {} in {:?}", library, e);
                    return Ok(Some(LookupResult {
                        location: e.clone(),
                        fullpath,
                    }));
                }
                Ok(None) => {}
                Err(err) => debug!("skipping {:?}: {}", e.get_path(), err),
            }
        }
        Ok(None)
    }

    fn search_file_in_folder<P: AsRef<Path>>(
        &self,
        filename: &str,
        p: P,
    ) -> Result<Option<PathBuf>, WalkError> {
        self.fs_cache
            .borrow_mut()
            .test_file_in_folder_case_insensitive(filename, p.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::{LookupPath, LookupPathEntry};
    use crate::common::WalkError;
    use crate::query::LookupQuery;
    use crate::system::WindowsSystem;

    #[test]
    fn search_order() -> Result<(), WalkError> {
        let root = tempfile::tempdir()?;
        let app_dir = root.path().join("app");
        let sys_dir = root.path().join("Windows").join("System32");
        std::fs::create_dir_all(&app_dir)?;
        std::fs::create_dir_all(&sys_dir)?;
        std::fs::write(app_dir.join("Shared.dll"), b"app")?;
        std::fs::write(sys_dir.join("shared.dll"), b"sys")?;
        std::fs::write(sys_dir.join("kernel32.dll"), b"sys")?;

        let mut query = LookupQuery::deduce_from_executable_location(app_dir.join("app.exe"))?;
        query.system = WindowsSystem::from_root(root.path());
        query.target.user_path.push(root.path().join("extra"));
        let lookup = LookupPath::deduce(&query);

        assert_eq!(
            lookup.entries,
            vec![
                LookupPathEntry::ExecutableDir(app_dir.clone()),
                LookupPathEntry::SystemDir(sys_dir.clone()),
                LookupPathEntry::WindowsDir(root.path().join("Windows")),
                LookupPathEntry::WorkingDir(app_dir.clone()),
                LookupPathEntry::UserPath(root.path().join("extra")),
            ]
        );

        let shared = lookup.search_dll("SHARED.DLL")?.unwrap();
        assert_eq!(shared.fullpath, app_dir.join("Shared.dll"));
        assert!(!shared.location.is_system());

        let kernel32 = lookup.search_dll("KERNEL32.dll")?.unwrap();
        assert_eq!(kernel32.fullpath, sys_dir.join("kernel32.dll"));
        assert!(kernel32.location.is_system());

        // the missing "extra" directory does not make the search fail
        assert!(lookup.search_dll("missing.dll")?.is_none());
        Ok(())
    }
}
