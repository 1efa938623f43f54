//! Core logic of the native bootstrap loader.
//! Interception primitives, backend handlers and launch strategies live here;
//! the injected module only wires them to process entry points.

pub mod config;
pub mod console;
pub mod error;
pub mod guard;
pub mod hook;
pub mod launcher;
pub mod logging;
pub mod native;
pub mod runtime;

pub use config::{DebugAgentConfig, HostPaths, LaunchOptions, LoaderConfig};
pub use console::{ConsoleGuard, StdHandleRestore};
pub use error::{BootstrapError, BootstrapResult, ErrorKind};
pub use guard::shielded;
pub use hook::{
    DetourRecord, HookError, ImportPatchError, ImportPatchReport, ImportTablePatcher,
    InlineHookPrimitive, ModuleSelector, RedirectTable, SymbolRedirectEntry,
    SymbolResolutionInterceptor, TrampolineDetourManager,
};
pub use launcher::{
    HostfxrLauncher, InRuntimeLauncher, LaunchContext, LaunchError, LegacyAssemblyLauncher,
    ManagedEntryPoint, ManagedHostLauncher,
};
pub use logging::{default_log_level, init_logging, logging_status, LogSettings};
pub use native::{ExportLookup, ModuleHandle, NativeExportTable};
pub use runtime::il2cpp::{Il2CppHandler, Il2CppLib, Il2CppPhase, Il2CppRuntime};
pub use runtime::mono::{MonoHandler, MonoLib, MonoPhase, MonoRuntime, MonoSettings};
pub use runtime::{BackendError, BackendKind, RuntimeInitializationState};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::core_version;

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
