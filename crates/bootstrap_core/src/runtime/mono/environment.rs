//! Scripting VM environment overrides: debugger agent argument, runtime
//! version compatibility and assembly search path composition.

use crate::config::DebugAgentConfig;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};

/// Separator of the runtime's assembly search path list.
#[cfg(windows)]
pub const PATH_LIST_SEPARATOR: char = ';';
#[cfg(not(windows))]
pub const PATH_LIST_SEPARATOR: char = ':';

const DEBUGGER_AGENT_PREFIX: &str = "--debugger-agent=transport=dt_socket,server=y,address=";
const NO_SUSPEND: &str = ",suspend=n";
const NO_SUSPEND_LEGACY: &str = ",suspend=n,defer=y";

/// Runtime versions look like `v4.0.30319`; the major digit follows the prefix.
static RUNTIME_MAJOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^.(\d)").expect("valid runtime version regex"));

/// Synthesizes the debugger agent launch argument.
///
/// Nothing is appended for suspend-on-start; the agent suspends by default.
pub fn debugger_argument(config: &DebugAgentConfig, legacy_runtime: bool) -> String {
    let mut argument = format!(
        "{DEBUGGER_AGENT_PREFIX}{}:{}",
        config.ip_address, config.port
    );
    if !config.suspend {
        argument.push_str(if legacy_runtime {
            NO_SUSPEND_LEGACY
        } else {
            NO_SUSPEND
        });
    }
    argument
}

/// Whether `version` names a runtime profile of major version 3 or older.
///
/// Strings of two characters or less, or without a digit in second position,
/// are treated as modern.
pub fn is_legacy_runtime_version(version: &str) -> bool {
    if version.chars().count() <= 2 {
        return false;
    }
    RUNTIME_MAJOR_RE
        .captures(version)
        .and_then(|captures| captures.get(1))
        .and_then(|major| major.as_str().parse::<u8>().ok())
        .is_some_and(|major| major <= 3)
}

/// Splits a configured override path-list into absolute directories,
/// resolving relative entries against `base_dir`.
pub fn override_directories(search_override: Option<&str>, base_dir: &Path) -> Vec<PathBuf> {
    search_override
        .unwrap_or_default()
        .split(PATH_LIST_SEPARATOR)
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| base_dir.join(entry))
        .collect()
}

/// Compatibility shim directory consulted only by legacy runtimes.
pub fn compatibility_shim_dir(base_dir: &Path) -> PathBuf {
    base_dir
        .join(crate::config::LOADER_DIR_NAME)
        .join("Dependencies")
        .join("NetStandardPatches")
}

/// `[overrides...] + [shim dir, legacy only] + [runtime root]`.
pub fn compose_assemblies_path(
    search_override: Option<&str>,
    base_dir: &Path,
    legacy_runtime: bool,
    runtime_root: Option<&str>,
) -> String {
    let mut entries = override_directories(search_override, base_dir)
        .into_iter()
        .map(|dir| dir.to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    if legacy_runtime {
        entries.push(compatibility_shim_dir(base_dir).to_string_lossy().into_owned());
    }
    if let Some(root) = runtime_root.filter(|root| !root.is_empty()) {
        entries.push(root.to_string());
    }
    entries.join(&PATH_LIST_SEPARATOR.to_string())
}

/// First override directory holding a file named `file_name`.
pub fn find_override_file(
    search_override: Option<&str>,
    base_dir: &Path,
    file_name: &str,
) -> Option<PathBuf> {
    if file_name.is_empty() {
        return None;
    }
    override_directories(search_override, base_dir)
        .into_iter()
        .map(|dir| dir.join(file_name))
        .find(|candidate| candidate.is_file())
}
