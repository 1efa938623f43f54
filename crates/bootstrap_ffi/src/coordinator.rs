//! Process-wide owner of the loader state.
//!
//! # Responsibility
//! - Resolve the configuration, start logging and the console, build both
//!   backend handlers and the redirect table, then install the resolver hook.
//!
//! # Invariants
//! - [`Bootstrap`] is created at most once and lives for the process.
//! - Redirect init callbacks only run after the global is published, so they
//!   always find it.

use crate::detours;
use bootstrap_core::config::{HostPaths, LaunchOptions, LoaderConfig};
use bootstrap_core::console::ConsoleGuard;
use bootstrap_core::hook::ImportTablePatcher;
use bootstrap_core::launcher::{HostfxrLauncher, LaunchContext, LegacyAssemblyLauncher};
use bootstrap_core::native::{ModuleHandle, NativeExportTable};
use bootstrap_core::runtime::il2cpp::{Il2CppHandler, Il2CppLib};
use bootstrap_core::runtime::mono::{MonoHandler, MonoLib, MonoSettings};
use bootstrap_core::runtime::BackendKind;
use bootstrap_core::{
    core_version, init_logging, shielded, BootstrapError, BootstrapResult, LogSettings,
    RedirectTable, SymbolRedirectEntry, SymbolResolutionInterceptor, TrampolineDetourManager,
};
use log::{error, info, warn};
use once_cell::sync::OnceCell;
use std::ffi::CString;
use std::sync::Arc;

static BOOTSTRAP: OnceCell<Bootstrap> = OnceCell::new();

pub struct Bootstrap {
    pub config: LoaderConfig,
    /// JSON snapshot handed out by `GetLoaderConfig`.
    pub config_json: CString,
    pub host: HostPaths,
    pub module: ModuleHandle,
    pub console: Arc<ConsoleGuard>,
    pub detours: TrampolineDetourManager,
    pub mono: MonoHandler<MonoLib>,
    pub il2cpp: Il2CppHandler<Il2CppLib>,
    pub interceptor: SymbolResolutionInterceptor,
}

/// The live loader state, once [`start`] published it.
pub fn bootstrap() -> Option<&'static Bootstrap> {
    BOOTSTRAP.get()
}

pub(crate) fn require() -> BootstrapResult<&'static Bootstrap> {
    bootstrap().ok_or_else(|| BootstrapError::redirected_call("bootstrap", "loader is not initialized"))
}

/// Runs the one-time bootstrap for `host`; returns whether interception is live.
pub fn start(host: HostPaths, module: ModuleHandle) -> bool {
    if BOOTSTRAP.get().is_some() {
        return true;
    }
    shielded("bootstrap_start", || try_start(host, module)).unwrap_or(false)
}

fn try_start(host: HostPaths, module: ModuleHandle) -> BootstrapResult<bool> {
    if host.data_directory().is_none() {
        return Ok(false);
    }

    let options = LaunchOptions::from_env();
    let config = LoaderConfig::resolve(&options, &host);
    if config.loader.disable {
        return Ok(false);
    }

    if let Err(err) = LogSettings::for_config(&config).and_then(|settings| init_logging(&settings)) {
        eprintln!("bootstrap: file logging unavailable: {err}");
    }
    info!(
        "event=bootstrap_start module=coordinator status=start version={} host={} base_dir={}",
        core_version(),
        host.executable.display(),
        config.base_dir().display()
    );

    let console = Arc::new(ConsoleGuard::new());
    console.open(!config.console.hide);

    let state = build(config, host, module, console)?;
    let bootstrap = BOOTSTRAP.get_or_init(|| state);

    let patcher = ImportTablePatcher::for_host_player();
    match bootstrap
        .console
        .install_close_guard(&patcher, detours::close_guard_address())
    {
        Ok(report) if !report.patched.is_empty() => {}
        Ok(report) => warn!(
            "event=close_guard module=coordinator status=skip image={}",
            report.module
        ),
        Err(err) => warn!(
            "event=close_guard module=coordinator status=error error={}",
            err
        ),
    }

    if let Err(err) = bootstrap
        .interceptor
        .install(&patcher, detours::resolver_address())
    {
        error!(
            "event=bootstrap_start module=coordinator status=error stage=resolver_hook error={}",
            err
        );
        return Err(err);
    }

    bootstrap.console.null_handles();
    info!(
        "event=bootstrap_start module=coordinator status=ok redirects={}",
        bootstrap.interceptor.table().len()
    );
    Ok(true)
}

fn build(
    config: LoaderConfig,
    host: HostPaths,
    module: ModuleHandle,
    console: Arc<ConsoleGuard>,
) -> BootstrapResult<Bootstrap> {
    let config_json = CString::new(config.to_json())
        .map_err(|err| BootstrapError::redirected_call("bootstrap", err.to_string()))?;

    let mono = MonoHandler::new(
        MonoSettings::from_config(&config, &host, module),
        Box::new(LegacyAssemblyLauncher),
        Some(console.clone()),
    );
    let il2cpp = Il2CppHandler::new(
        LaunchContext::new(config.base_dir(), module),
        Box::new(HostfxrLauncher::new()),
        Some(console.clone()),
    );

    Ok(Bootstrap {
        config,
        config_json,
        host,
        module,
        console,
        detours: TrampolineDetourManager::native(),
        mono,
        il2cpp,
        interceptor: SymbolResolutionInterceptor::new(redirect_table()?),
    })
}

fn redirect_table() -> BootstrapResult<RedirectTable> {
    let mut table = RedirectTable::new();
    for (symbol, backend, detour) in detours::redirects() {
        let init = match backend {
            BackendKind::NativeAot => init_native_aot,
            BackendKind::ScriptingVm => init_scripting_vm,
        };
        table.register(SymbolRedirectEntry::new(symbol, backend, detour, init))?;
    }
    Ok(table)
}

fn init_native_aot(module: ModuleHandle) -> BootstrapResult<()> {
    require()?.il2cpp.resolve_exports(&NativeExportTable, module)?;
    Ok(())
}

fn init_scripting_vm(module: ModuleHandle) -> BootstrapResult<()> {
    require()?.mono.resolve_exports(&NativeExportTable, module)?;
    Ok(())
}
