//! Data structures that must be filled with the input and the parameters for the dependency walk

use crate::common::{path_to_string, WalkError};
use crate::system::WindowsSystem;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug)]
pub struct LookupTarget {
    /// Path to the target executable
    pub target_exe: PathBuf,
    /// Parent directory of target_exe, cached for performance purposes
    pub app_dir: PathBuf,
    /// Working directory as it should appear in the search path
    pub working_dir: PathBuf,
    /// Additional executable search path set by the user
    pub user_path: Vec<PathBuf>,
}

#[derive(Clone, Debug, Default)]
pub struct LookupParameters {
    /// Also walk the delay-load import directory
    pub delayed: bool,
    /// Maximum library recursion depth for the walk
    pub max_depth: Option<usize>,
}

/// Complete specification of a walk
#[derive(Clone, Debug)]
pub struct LookupQuery {
    pub system: Option<WindowsSystem>,
    pub target: LookupTarget,
    pub parameters: LookupParameters,
}

impl LookupQuery {
    /// autodetects the settings with sensible defaults
    ///
    /// The working directory will be set to the one containing the executable (i.e. the app_dir)
    pub fn deduce_from_executable_location<P: AsRef<Path>>(
        target_exe: P,
    ) -> Result<Self, WalkError> {
        let target_exe = target_exe.as_ref();
        let app_dir = match target_exe.parent() {
            Some(p) if p.as_os_str().is_empty() => PathBuf::from("."),
            Some(p) => p.to_owned(),
            None => {
                return Err(WalkError::NotFound(format!(
                    "Could not find application directory for given executable {}",
                    path_to_string(target_exe)
                )))
            }
        };

        #[cfg(windows)]
        let system = Some(WindowsSystem::current()?);
        #[cfg(not(windows))]
        let system = WindowsSystem::from_exe_location(target_exe);

        Ok(Self {
            system,
            target: LookupTarget {
                target_exe: target_exe.to_owned(),
                app_dir: app_dir.clone(),
                working_dir: app_dir,
                user_path: Vec::new(),
            },
            parameters: LookupParameters::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::common::WalkError;
    use crate::query::LookupQuery;

    #[test]
    fn build_query() -> Result<(), WalkError> {
        let dir = tempfile::tempdir()?;
        let exe_path = dir.path().join("bin").join("App.exe");

        let query = LookupQuery::deduce_from_executable_location(&exe_path)?;
        assert_eq!(query.target.target_exe, exe_path);
        assert_eq!(query.target.app_dir, dir.path().join("bin"));
        assert_eq!(query.target.working_dir, query.target.app_dir);
        assert!(query.target.user_path.is_empty());
        assert!(query.parameters.max_depth.is_none());
        assert!(!query.parameters.delayed);
        #[cfg(not(windows))]
        assert!(query.system.is_none());

        Ok(())
    }

    #[test]
    fn bare_file_name_uses_current_dir() -> Result<(), WalkError> {
        let query = LookupQuery::deduce_from_executable_location("app.exe")?;
        assert_eq!(query.target.app_dir, std::path::PathBuf::from("."));
        Ok(())
    }
}
