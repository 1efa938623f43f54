//! Resolved loader configuration.
//!
//! # Responsibility
//! - Hold the read-only snapshot of launch options the loader consumes.
//! - Derive fixed filesystem locations beneath the loader base directory.
//!
//! # Invariants
//! - The snapshot is resolved once, before any hook is installed.
//! - Structured configuration files are owned by an external collaborator;
//!   only launch options are read here.

pub mod host;
pub mod options;

pub use host::HostPaths;
pub use options::LaunchOptions;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const OPTION_BASE_DIR: &str = "melonloader.basedir";
pub const OPTION_DEBUG: &str = "melonloader.debug";
pub const OPTION_DISABLE: &str = "no-mods";
pub const OPTION_DEBUG_SUSPEND: &str = "melonloader.debugsuspend";
pub const OPTION_DEBUG_IP: &str = "melonloader.debugipaddress";
pub const OPTION_DEBUG_PORT: &str = "melonloader.debugport";
pub const OPTION_SEARCH_PATH_OVERRIDE: &str = "melonloader.monosearchpathoverride";
pub const OPTION_LOG_LEVEL: &str = "melonloader.loglevel";
pub const OPTION_HIDE_WARNINGS: &str = "melonloader.hidewarnings";
pub const OPTION_HIDE_CONSOLE: &str = "melonloader.hideconsole";

/// Environment variable whose value replaces the synthesized debugger argument.
pub const DEBUGGER_ENV_OVERRIDE: &str = "DNSPY_UNITY_DBG2";

pub const DEFAULT_DEBUG_IP: &str = "127.0.0.1";
pub const DEFAULT_DEBUG_PORT: u16 = 55555;

/// Loader directory name beneath the base directory.
pub const LOADER_DIR_NAME: &str = "MelonLoader";

/// Debugger agent endpoint consumed during the one-shot runtime init.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugAgentConfig {
    pub ip_address: String,
    pub port: u16,
    pub suspend: bool,
}

impl Default for DebugAgentConfig {
    fn default() -> Self {
        Self {
            ip_address: DEFAULT_DEBUG_IP.to_string(),
            port: DEFAULT_DEBUG_PORT,
            suspend: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderSection {
    pub base_directory: PathBuf,
    pub debug_mode: bool,
    pub disable: bool,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnityEngineSection {
    /// Path-list of directories searched before the runtime's own assemblies.
    pub mono_search_path_override: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleSection {
    /// Never allocate a console window for the loader.
    pub hide: bool,
    pub hide_warnings: bool,
}

/// Read-only loader configuration snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub loader: LoaderSection,
    pub debug_server: DebugAgentConfig,
    pub unity_engine: UnityEngineSection,
    pub console: ConsoleSection,
}

impl LoaderConfig {
    /// Resolves the snapshot from launch options for the given host.
    ///
    /// `melonloader.basedir` only applies when it names an existing directory;
    /// otherwise the host executable's directory is the base.
    pub fn resolve(options: &LaunchOptions, host: &HostPaths) -> Self {
        let mut config = LoaderConfig::default();

        config.loader.base_directory = options
            .value(OPTION_BASE_DIR)
            .map(PathBuf::from)
            .filter(|dir| dir.is_dir())
            .map(|dir| std::fs::canonicalize(&dir).unwrap_or(dir))
            .unwrap_or_else(|| host.directory.clone());

        config.loader.debug_mode = options.is_defined(OPTION_DEBUG);
        config.loader.disable = options.is_defined(OPTION_DISABLE);
        // Unknown levels are dropped so the default applies.
        config.loader.log_level = options
            .value(OPTION_LOG_LEVEL)
            .and_then(crate::logging::normalize_level)
            .map(str::to_string);
        config.console.hide = options.is_defined(OPTION_HIDE_CONSOLE);
        config.console.hide_warnings = options.is_defined(OPTION_HIDE_WARNINGS);

        if options.is_defined(OPTION_DEBUG_SUSPEND) {
            config.debug_server.suspend = true;
        }
        if let Some(ip) = options.value(OPTION_DEBUG_IP) {
            config.debug_server.ip_address = ip.trim().to_string();
        }
        if let Some(port) = options.parsed::<u16>(OPTION_DEBUG_PORT) {
            config.debug_server.port = port;
        }

        config.unity_engine.mono_search_path_override = options
            .value(OPTION_SEARCH_PATH_OVERRIDE)
            .filter(|value| !value.trim().is_empty())
            .map(str::to_string);

        config
    }

    pub fn base_dir(&self) -> &Path {
        &self.loader.base_directory
    }

    /// `<base>/MelonLoader`
    pub fn loader_dir(&self) -> PathBuf {
        self.base_dir().join(LOADER_DIR_NAME)
    }

    /// `<base>/MelonLoader/Logs`
    pub fn log_dir(&self) -> PathBuf {
        self.loader_dir().join("Logs")
    }

    /// Effective log level: explicit option first, then debug mode.
    pub fn log_level(&self) -> &str {
        self.loader
            .log_level
            .as_deref()
            .unwrap_or_else(|| crate::logging::default_log_level(self.loader.debug_mode))
    }

    /// JSON snapshot served to collaborators at the process boundary.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::{HostPaths, LaunchOptions, LoaderConfig, DEFAULT_DEBUG_PORT};

    fn host() -> HostPaths {
        HostPaths::from_executable("/games/host/Host.x86_64").expect("has parent")
    }

    #[test]
    fn defaults_without_options() {
        let config = LoaderConfig::resolve(&LaunchOptions::default(), &host());
        assert_eq!(config.base_dir(), std::path::Path::new("/games/host"));
        assert!(!config.loader.debug_mode);
        assert_eq!(config.debug_server.ip_address, "127.0.0.1");
        assert_eq!(config.debug_server.port, DEFAULT_DEBUG_PORT);
        assert_eq!(config.unity_engine.mono_search_path_override, None);
    }

    #[test]
    fn nonexistent_base_dir_option_is_ignored() {
        let options = LaunchOptions::parse(["--melonloader.basedir=/definitely/not/here/4711"]);
        let config = LoaderConfig::resolve(&options, &host());
        assert_eq!(config.base_dir(), std::path::Path::new("/games/host"));
    }

    #[test]
    fn existing_base_dir_option_wins() {
        let dir = tempfile::tempdir().expect("temp dir");
        let arg = format!("--melonloader.basedir={}", dir.path().display());
        let config = LoaderConfig::resolve(&LaunchOptions::parse([arg]), &host());
        let expected = std::fs::canonicalize(dir.path()).expect("canonical");
        assert_eq!(config.base_dir(), expected.as_path());
        assert_eq!(config.log_dir(), expected.join("MelonLoader").join("Logs"));
    }

    #[test]
    fn json_snapshot_round_trips_debug_server() {
        let options = LaunchOptions::parse(["--melonloader.debug", "--melonloader.debugport=4000"]);
        let config = LoaderConfig::resolve(&options, &host());
        let json = config.to_json();
        let decoded: LoaderConfig = serde_json::from_str(&json).expect("valid json");
        assert_eq!(decoded.debug_server.port, 4000);
        assert!(decoded.loader.debug_mode);
        assert_eq!(decoded.log_level(), "debug");
    }
}
