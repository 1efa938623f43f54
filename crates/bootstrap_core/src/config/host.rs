//! Host process identity: executable location, data directory heuristics and
//! preload-environment cleanup.

use std::path::{Path, PathBuf};

/// Environment variable that injected this module into the host.
#[cfg(target_os = "macos")]
pub const PRELOAD_ENV: &str = "DYLD_INSERT_LIBRARIES";
#[cfg(not(target_os = "macos"))]
pub const PRELOAD_ENV: &str = "LD_PRELOAD";

/// Library search path variable that may point at the loader directory.
#[cfg(target_os = "macos")]
pub const LIBRARY_PATH_ENV: &str = "DYLD_LIBRARY_PATH";
#[cfg(not(target_os = "macos"))]
pub const LIBRARY_PATH_ENV: &str = "LD_LIBRARY_PATH";

/// Executable path and directory of the host process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPaths {
    pub executable: PathBuf,
    pub directory: PathBuf,
}

impl HostPaths {
    /// Resolves the running process' executable.
    pub fn current() -> Option<Self> {
        std::env::current_exe()
            .ok()
            .and_then(|path| Self::from_executable(path))
    }

    pub fn from_executable(executable: impl Into<PathBuf>) -> Option<Self> {
        let executable = executable.into();
        let directory = executable.parent()?.to_path_buf();
        Some(Self {
            executable,
            directory,
        })
    }

    /// Returns the host's data directory when one exists.
    ///
    /// Checked in order: `<exe>_Data`, `Data` next to the executable, then the
    /// bundle layout `../Resources/Data`.
    pub fn data_directory(&self) -> Option<PathBuf> {
        let stem = self.executable.file_stem()?.to_string_lossy();
        let candidates = [
            self.directory.join(format!("{stem}_Data")),
            self.directory.join("Data"),
            self.directory.join("..").join("Resources").join("Data"),
        ];
        candidates.into_iter().find(|candidate| candidate.is_dir())
    }

    /// Heuristic guard against injecting into processes the host spawns.
    pub fn is_likely_host(&self) -> bool {
        self.data_directory().is_some()
    }

    /// Returns the runtime configuration file path `<exe>.config`.
    pub fn config_file(&self) -> PathBuf {
        let mut name = self.executable.as_os_str().to_os_string();
        name.push(".config");
        PathBuf::from(name)
    }
}

/// Removes `library_file` from a colon-separated preload list.
pub fn strip_preload_entry(value: &str, library_file: &str) -> String {
    value
        .split(':')
        .filter(|entry| {
            !entry.is_empty()
                && Path::new(entry)
                    .file_name()
                    .map_or(true, |name| name.to_string_lossy() != library_file)
        })
        .collect::<Vec<_>>()
        .join(":")
}

/// Removes every entry resolving to `directory` from a colon-separated path list.
pub fn strip_library_path(value: &str, directory: &Path) -> String {
    let expected = trim_separator(directory);
    value
        .split(':')
        .filter(|entry| !entry.is_empty() && trim_separator(Path::new(entry)) != expected)
        .collect::<Vec<_>>()
        .join(":")
}

fn trim_separator(path: &Path) -> PathBuf {
    let text = path.to_string_lossy();
    let trimmed = text.trim_end_matches(['/', '\\']);
    if trimmed.is_empty() {
        PathBuf::from(text.as_ref())
    } else {
        PathBuf::from(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::{strip_library_path, strip_preload_entry, HostPaths};
    use std::path::Path;

    #[test]
    fn preload_list_drops_only_this_library() {
        let value = "/opt/other/libfps.so:/games/host/libbootstrap_ffi.so:libmangohud.so";
        assert_eq!(
            strip_preload_entry(value, "libbootstrap_ffi.so"),
            "/opt/other/libfps.so:libmangohud.so"
        );
    }

    #[test]
    fn library_path_drops_host_directory_with_trailing_slash() {
        let value = "/usr/lib:/games/host/:/games/host/lib";
        assert_eq!(
            strip_library_path(value, Path::new("/games/host")),
            "/usr/lib:/games/host/lib"
        );
    }

    #[test]
    fn config_file_appends_suffix() {
        let paths = HostPaths::from_executable("/games/host/Host.x86_64").expect("has parent");
        assert_eq!(
            paths.config_file(),
            Path::new("/games/host/Host.x86_64.config")
        );
    }

    #[test]
    fn data_directory_prefers_executable_stem() {
        let root = tempfile::tempdir().expect("temp dir");
        std::fs::create_dir(root.path().join("Host_Data")).expect("data dir");
        let paths = HostPaths::from_executable(root.path().join("Host.exe")).expect("has parent");
        assert_eq!(paths.data_directory(), Some(root.path().join("Host_Data")));
        assert!(paths.is_likely_host());
    }

    #[test]
    fn missing_data_directory_is_not_a_host() {
        let root = tempfile::tempdir().expect("temp dir");
        let paths = HostPaths::from_executable(root.path().join("tool")).expect("has parent");
        assert!(!paths.is_likely_host());
    }
}
