//! Managed host startup.
//!
//! # Responsibility
//! - Start the externally-built managed host that matches the detected
//!   backend, exactly once.
//! - Resolve every required file relative to the loader base directory.
//!
//! # Invariants
//! - A launcher yields zero or one entry point to invoke later; an in-runtime
//!   launcher yields zero or one assembly-search method instead.
//! - Missing files are reported as errors, never panics; callers treat every
//!   launch error as "mod support disabled" and keep the host running.
//!
//! # See also
//! - `launcher::legacy` for the in-runtime assembly strategy.
//! - `launcher::hostfxr` for the hosted modern runtime strategy.

pub mod hostfxr;
pub mod legacy;

pub use hostfxr::HostfxrLauncher;
pub use legacy::LegacyAssemblyLauncher;

use crate::config::LOADER_DIR_NAME;
use crate::native::ModuleHandle;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

/// Inputs every launch strategy receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchContext {
    pub base_dir: PathBuf,
    /// Handle of the module hosting this loader, handed to managed code.
    pub bootstrap_module: ModuleHandle,
}

impl LaunchContext {
    pub fn new(base_dir: impl Into<PathBuf>, bootstrap_module: ModuleHandle) -> Self {
        Self {
            base_dir: base_dir.into(),
            bootstrap_module,
        }
    }
}

/// Parameterless managed start function handed back by the managed host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagedEntryPoint(usize);

impl ManagedEntryPoint {
    pub fn from_addr(addr: usize) -> Option<Self> {
        (addr != 0).then_some(Self(addr))
    }

    pub fn addr(self) -> usize {
        self.0
    }

    /// # Safety
    /// The address must be a live parameterless function produced by managed
    /// code, using the platform's default unmanaged calling convention.
    pub unsafe fn invoke(self) {
        let start: extern "system" fn() = std::mem::transmute(self.0);
        start();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchError {
    ConfigFileMissing(PathBuf),
    HostBinaryMissing(PathBuf),
    InvalidRuntimeConfig { path: PathBuf, reason: String },
    HostingComponentUnavailable(String),
    HostingCall { call: &'static str, status: i32 },
    ManagedMemberMissing(String),
    ManagedEntryFailed(String),
}

impl Display for LaunchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConfigFileMissing(path) => {
                write!(f, "runtime config not found at `{}`", path.display())
            }
            Self::HostBinaryMissing(path) => {
                write!(f, "managed host binary not found at `{}`", path.display())
            }
            Self::InvalidRuntimeConfig { path, reason } => {
                write!(f, "invalid runtime config `{}`: {reason}", path.display())
            }
            Self::HostingComponentUnavailable(reason) => {
                write!(f, "hosting component unavailable: {reason}")
            }
            Self::HostingCall { call, status } => {
                write!(f, "{call} failed with status {status:#x}")
            }
            Self::ManagedMemberMissing(member) => write!(f, "managed member `{member}` not found"),
            Self::ManagedEntryFailed(reason) => write!(f, "managed entry failed: {reason}"),
        }
    }
}

impl Error for LaunchError {}

/// One managed host start strategy.
pub trait ManagedHostLauncher {
    fn name(&self) -> &'static str;

    /// Starts the managed host; `Ok(None)` when it needs no later entry call.
    fn launch(&self, context: &LaunchContext) -> Result<Option<ManagedEntryPoint>, LaunchError>;
}

/// Managed host start strategy that runs inside an initialized scripting VM
/// domain rather than hosting its own runtime.
pub trait InRuntimeLauncher<R: ?Sized>: Send + Sync {
    fn name(&self) -> &'static str;

    /// Starts the managed host in `domain`; yields the managed assembly-search
    /// method when the host exposes one.
    fn launch(&self, runtime: &R, domain: usize, context: &LaunchContext) -> Result<Option<usize>, LaunchError>;
}

/// `<base>/MelonLoader/net35/MelonLoader.dll`
pub fn legacy_assembly_path(base_dir: &Path) -> PathBuf {
    base_dir.join(LOADER_DIR_NAME).join("net35").join("MelonLoader.dll")
}

/// `<base>/MelonLoader/net6`
pub fn modern_host_dir(base_dir: &Path) -> PathBuf {
    base_dir.join(LOADER_DIR_NAME).join("net6")
}

/// `<base>/MelonLoader/net6/MelonLoader.runtimeconfig.json`
pub fn runtime_config_path(base_dir: &Path) -> PathBuf {
    modern_host_dir(base_dir).join("MelonLoader.runtimeconfig.json")
}

/// `<base>/MelonLoader/net6/MelonLoader.NativeHost.dll`
pub fn native_host_path(base_dir: &Path) -> PathBuf {
    modern_host_dir(base_dir).join("MelonLoader.NativeHost.dll")
}

/// `<base>/MelonLoader/Dependencies/dotnet`
pub fn bundled_dotnet_root(base_dir: &Path) -> PathBuf {
    base_dir
        .join(LOADER_DIR_NAME)
        .join("Dependencies")
        .join("dotnet")
}
