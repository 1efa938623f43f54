//! Loader-wide error umbrella.
//!
//! Each subsystem owns its own error enum; this module folds them into one
//! type so hook bodies and the coordinator can classify failures uniformly.

use crate::hook::import::ImportPatchError;
use crate::hook::trampoline::HookError;
use crate::launcher::LaunchError;
use crate::runtime::BackendError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type BootstrapResult<T> = Result<T, BootstrapError>;

/// Stable failure classification used for logging and policy decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    MissingExport,
    HookInstallation,
    HookTeardown,
    ImportPatch,
    ConfigFileMissing,
    HostBinaryMissing,
    ManagedLaunch,
    RedirectedCallFailure,
    InvalidArgument,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingExport => "missing_export",
            Self::HookInstallation => "hook_installation",
            Self::HookTeardown => "hook_teardown",
            Self::ImportPatch => "import_patch",
            Self::ConfigFileMissing => "config_file_missing",
            Self::HostBinaryMissing => "host_binary_missing",
            Self::ManagedLaunch => "managed_launch",
            Self::RedirectedCallFailure => "redirected_call_failure",
            Self::InvalidArgument => "invalid_argument",
        }
    }
}

#[derive(Debug)]
pub enum BootstrapError {
    Hook(HookError),
    ImportPatch(ImportPatchError),
    Backend(BackendError),
    Launch(LaunchError),
    RedirectedCallFailure { hook: String, reason: String },
}

impl BootstrapError {
    pub fn redirected_call(hook: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::RedirectedCallFailure {
            hook: hook.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Hook(HookError::Installation { .. }) => ErrorKind::HookInstallation,
            Self::Hook(HookError::Teardown { .. }) => ErrorKind::HookTeardown,
            Self::ImportPatch(_) => ErrorKind::ImportPatch,
            Self::Backend(BackendError::MissingExport { .. }) => ErrorKind::MissingExport,
            Self::Backend(_) => ErrorKind::InvalidArgument,
            Self::Launch(LaunchError::ConfigFileMissing(_)) => ErrorKind::ConfigFileMissing,
            Self::Launch(LaunchError::HostBinaryMissing(_)) => ErrorKind::HostBinaryMissing,
            Self::Launch(_) => ErrorKind::ManagedLaunch,
            Self::RedirectedCallFailure { .. } => ErrorKind::RedirectedCallFailure,
        }
    }
}

impl Display for BootstrapError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hook(err) => write!(f, "{err}"),
            Self::ImportPatch(err) => write!(f, "{err}"),
            Self::Backend(err) => write!(f, "{err}"),
            Self::Launch(err) => write!(f, "{err}"),
            Self::RedirectedCallFailure { hook, reason } => {
                write!(f, "redirected call `{hook}` failed: {reason}")
            }
        }
    }
}

impl Error for BootstrapError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Hook(err) => Some(err),
            Self::ImportPatch(err) => Some(err),
            Self::Backend(err) => Some(err),
            Self::Launch(err) => Some(err),
            Self::RedirectedCallFailure { .. } => None,
        }
    }
}

impl From<HookError> for BootstrapError {
    fn from(value: HookError) -> Self {
        Self::Hook(value)
    }
}

impl From<ImportPatchError> for BootstrapError {
    fn from(value: ImportPatchError) -> Self {
        Self::ImportPatch(value)
    }
}

impl From<BackendError> for BootstrapError {
    fn from(value: BackendError) -> Self {
        Self::Backend(value)
    }
}

impl From<LaunchError> for BootstrapError {
    fn from(value: LaunchError) -> Self {
        Self::Launch(value)
    }
}

#[cfg(test)]
mod tests {
    use super::{BootstrapError, ErrorKind};
    use crate::launcher::LaunchError;
    use crate::runtime::BackendError;
    use std::path::PathBuf;

    #[test]
    fn classifies_wrapped_errors() {
        let missing = BootstrapError::from(BackendError::MissingExport {
            symbol: "il2cpp_init".to_string(),
        });
        assert_eq!(missing.kind(), ErrorKind::MissingExport);

        let config = BootstrapError::from(LaunchError::ConfigFileMissing(PathBuf::from(
            "/game/MelonLoader/net6/MelonLoader.runtimeconfig.json",
        )));
        assert_eq!(config.kind(), ErrorKind::ConfigFileMissing);
        assert_eq!(config.kind().as_str(), "config_file_missing");
    }

    #[test]
    fn redirected_call_failure_names_the_hook() {
        let err = BootstrapError::redirected_call("mono_jit_init_version", "boom");
        assert_eq!(err.kind(), ErrorKind::RedirectedCallFailure);
        assert!(err.to_string().contains("mono_jit_init_version"));
    }
}
