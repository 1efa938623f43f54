//! Scripting VM (Mono family) backend handler.
//!
//! # Responsibility
//! - Bind the runtime's exports from the module handle captured on the first
//!   redirect hit.
//! - Inject debugger-agent options, compose the assembly search path and run
//!   the one-shot bootstrap inside the runtime-init detour.
//! - Substitute override images and forward assembly-search misses into the
//!   managed resolver.
//!
//! # Invariants
//! - Phases only advance:
//!   Unloaded -> ExportsResolved -> OptionsParsed -> DebugConfigured -> JitInitialized.
//! - The real runtime initializer runs the bootstrap exactly once; every later
//!   call is a pure passthrough.
//! - After `JitInitialized` the options detour never rewrites arguments.
//! - No lock is held while forwarding into the runtime.
//!
//! # See also
//! - `launcher::legacy` for the default managed initializer call.

pub mod bindings;
pub mod environment;

pub use bindings::{
    AssemblyIdentity, AssemblySearchHookFn, MonoAssemblyName, MonoLib, MonoReflectionAssembly,
    MonoRuntime, DEBUG_FORMAT_MONO,
};

use crate::config::{DebugAgentConfig, HostPaths, LoaderConfig, DEBUGGER_ENV_OVERRIDE};
use crate::console::StdHandleRestore;
use crate::launcher::{InRuntimeLauncher, LaunchContext};
use crate::native::{ExportLookup, ModuleHandle};
use crate::runtime::{BackendError, BackendKind, Phase, PhaseTracker, RuntimeInitializationState};
use log::{debug, error, info, warn};
use once_cell::sync::OnceCell;
use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonoPhase {
    Unloaded,
    ExportsResolved,
    OptionsParsed,
    DebugConfigured,
    JitInitialized,
}

impl Phase for MonoPhase {
    fn ordinal(self) -> u8 {
        self as u8
    }

    fn from_ordinal(ordinal: u8) -> Self {
        match ordinal {
            0 => Self::Unloaded,
            1 => Self::ExportsResolved,
            2 => Self::OptionsParsed,
            3 => Self::DebugConfigured,
            _ => Self::JitInitialized,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Unloaded => "unloaded",
            Self::ExportsResolved => "exports_resolved",
            Self::OptionsParsed => "options_parsed",
            Self::DebugConfigured => "debug_configured",
            Self::JitInitialized => "jit_initialized",
        }
    }
}

/// Read-only inputs of the scripting VM bootstrap.
#[derive(Debug, Clone)]
pub struct MonoSettings {
    pub base_dir: PathBuf,
    pub host: HostPaths,
    pub bootstrap_module: ModuleHandle,
    /// Debugger agent endpoint; `None` when debug mode is off.
    pub debug_agent: Option<DebugAgentConfig>,
    /// Verbatim replacement for the synthesized debugger argument.
    pub debugger_override: Option<String>,
    pub search_path_override: Option<String>,
}

impl MonoSettings {
    /// Builds the settings from the resolved snapshot; the debugger override
    /// is read from [`DEBUGGER_ENV_OVERRIDE`] when debugging.
    pub fn from_config(config: &LoaderConfig, host: &HostPaths, bootstrap_module: ModuleHandle) -> Self {
        let debug_agent = config
            .loader
            .debug_mode
            .then(|| config.debug_server.clone());
        let debugger_override = debug_agent
            .as_ref()
            .and_then(|_| std::env::var(DEBUGGER_ENV_OVERRIDE).ok())
            .filter(|value| !value.trim().is_empty());
        Self {
            base_dir: config.base_dir().to_path_buf(),
            host: host.clone(),
            bootstrap_module,
            debug_agent,
            debugger_override,
            search_path_override: config.unity_engine.mono_search_path_override.clone(),
        }
    }
}

pub struct MonoHandler<R: MonoRuntime> {
    settings: MonoSettings,
    state: RuntimeInitializationState,
    phase: PhaseTracker<MonoPhase>,
    runtime: OnceCell<R>,
    launcher: Box<dyn InRuntimeLauncher<R>>,
    console: Option<Arc<dyn StdHandleRestore>>,
    legacy: AtomicBool,
    host_debug_initialized: AtomicBool,
    domain: AtomicUsize,
    resolver_method: AtomicUsize,
    search_hook_installed: AtomicBool,
    /// Injected launch arguments stay alive for the process; the runtime may
    /// keep pointers into them.
    retained_arguments: Mutex<Vec<CString>>,
}

impl<R: MonoRuntime> MonoHandler<R> {
    pub fn new(
        settings: MonoSettings,
        launcher: Box<dyn InRuntimeLauncher<R>>,
        console: Option<Arc<dyn StdHandleRestore>>,
    ) -> Self {
        Self {
            settings,
            state: RuntimeInitializationState::new(BackendKind::ScriptingVm),
            phase: PhaseTracker::new(MonoPhase::Unloaded),
            runtime: OnceCell::new(),
            launcher,
            console,
            legacy: AtomicBool::new(false),
            host_debug_initialized: AtomicBool::new(false),
            domain: AtomicUsize::new(0),
            resolver_method: AtomicUsize::new(0),
            search_hook_installed: AtomicBool::new(false),
            retained_arguments: Mutex::new(Vec::new()),
        }
    }

    /// Binds an already resolved runtime; a second runtime is rejected.
    pub fn attach_runtime(&self, runtime: R) -> Result<(), BackendError> {
        let module = runtime.module();
        self.runtime.set(runtime).map_err(|_| {
            BackendError::InvalidArgument("scripting VM runtime already attached".to_string())
        })?;
        self.state.set_module(module);
        self.phase.advance(MonoPhase::ExportsResolved);
        info!(
            "event=exports_resolved module=mono status=ok handle={:#x}",
            module.addr()
        );
        Ok(())
    }

    pub fn runtime(&self) -> Result<&R, BackendError> {
        self.runtime
            .get()
            .ok_or(BackendError::NotResolved(BackendKind::ScriptingVm))
    }

    pub fn state(&self) -> &RuntimeInitializationState {
        &self.state
    }

    pub fn phase(&self) -> MonoPhase {
        self.phase.current()
    }

    pub fn settings(&self) -> &MonoSettings {
        &self.settings
    }

    /// Runtime domain created by the bootstrap; 0 before it ran.
    pub fn domain(&self) -> usize {
        self.domain.load(Ordering::Relaxed)
    }

    /// Handle of the runtime library; null before exports are bound.
    pub fn runtime_handle(&self) -> ModuleHandle {
        self.state.module()
    }

    pub fn is_legacy_runtime(&self) -> bool {
        self.legacy.load(Ordering::Relaxed)
    }

    /// Argument appended to the runtime's launch options, if debugging.
    pub fn debugger_argument(&self) -> Option<String> {
        let agent = self.settings.debug_agent.as_ref()?;
        Some(match &self.settings.debugger_override {
            Some(verbatim) => verbatim.clone(),
            None => environment::debugger_argument(agent, self.is_legacy_runtime()),
        })
    }

    /// Options-parse detour body.
    ///
    /// # Safety
    /// `argv` must hold `argc` valid C strings (or be null with `argc == 0`).
    pub unsafe fn on_jit_parse_options(&self, argc: c_int, argv: *mut *mut c_char) -> Result<(), BackendError> {
        let runtime = self.runtime()?;
        if self.state.is_initialized() {
            runtime.jit_parse_options(argc, argv);
            return Ok(());
        }
        self.phase.advance(MonoPhase::OptionsParsed);

        let Some(argument) = self.debugger_argument() else {
            runtime.jit_parse_options(argc, argv);
            return Ok(());
        };
        let argument = CString::new(argument)
            .map_err(|err| BackendError::InvalidArgument(err.to_string()))?;

        let existing = usize::try_from(argc).unwrap_or(0);
        let mut extended = Vec::with_capacity(existing + 2);
        if !argv.is_null() {
            extended.extend_from_slice(std::slice::from_raw_parts(argv, existing));
        }
        extended.push(argument.as_ptr() as *mut c_char);
        extended.push(std::ptr::null_mut());

        info!(
            "event=jit_option_added module=mono status=ok option={}",
            argument.to_string_lossy()
        );
        self.retained_arguments
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(argument);
        runtime.jit_parse_options((existing + 1) as c_int, extended.as_mut_ptr());
        Ok(())
    }

    /// Debug-init detour body: remembers the host's own debugger setup.
    pub fn on_debug_init(&self, format: c_int) -> Result<(), BackendError> {
        let runtime = self.runtime()?;
        self.host_debug_initialized.store(true, Ordering::Relaxed);
        debug!("event=debug_init module=mono status=host format={}", format);
        runtime.debug_init(format);
        Ok(())
    }

    /// Runtime-init detour body; the one-shot bootstrap gate.
    ///
    /// # Safety
    /// Both arguments must be null or valid C strings.
    pub unsafe fn on_jit_init_version(
        &self,
        domain_name: *const c_char,
        runtime_version: *const c_char,
    ) -> Result<usize, BackendError> {
        let runtime = self.runtime()?;
        if self.state.is_initialized() {
            return Ok(runtime.jit_init_version(domain_name, runtime_version));
        }

        if let Some(console) = &self.console {
            console.reset_handles();
        }

        let version = c_str_lossy(runtime_version);
        let legacy = environment::is_legacy_runtime_version(&version);
        self.legacy.store(legacy, Ordering::Relaxed);
        info!(
            "event=jit_init module=mono status=start domain={} runtime_version={} legacy={}",
            c_str_lossy(domain_name),
            version,
            legacy
        );

        let search_path = environment::compose_assemblies_path(
            self.settings.search_path_override.as_deref(),
            &self.settings.base_dir,
            legacy,
            runtime.assembly_root_dir().as_deref(),
        );
        debug!(
            "event=assemblies_path module=mono status=ok path={}",
            search_path
        );
        let search_path = CString::new(search_path)
            .map_err(|err| BackendError::InvalidArgument(err.to_string()))?;
        runtime.set_assemblies_path(&search_path);

        if !self.phase.has_reached(MonoPhase::OptionsParsed) {
            self.on_jit_parse_options(0, std::ptr::null_mut())?;
        }

        let debugger_active =
            self.host_debug_initialized.load(Ordering::Relaxed) || runtime.debug_enabled();
        if self.settings.debug_agent.is_some() && !debugger_active {
            debug!("event=debug_init module=mono status=loader");
            runtime.debug_init(DEBUG_FORMAT_MONO);
        }
        self.phase.advance(MonoPhase::DebugConfigured);

        let domain = runtime.jit_init_version(domain_name, runtime_version);
        self.domain.store(domain, Ordering::Relaxed);
        runtime.thread_set_main(runtime.thread_current());

        if !legacy {
            self.apply_domain_config(runtime, domain);
        }
        runtime.config_parse();

        self.launch_managed(runtime, domain);

        self.state.mark_initialized();
        self.phase.advance(MonoPhase::JitInitialized);
        info!(
            "event=jit_init module=mono status=ok domain_ptr={:#x}",
            domain
        );
        Ok(domain)
    }

    /// Image-open detour body: swaps in an override file's bytes when one
    /// with the same file name exists.
    ///
    /// # Safety
    /// Arguments must satisfy the runtime's image-open contract.
    pub unsafe fn on_image_open_from_data_with_name(
        &self,
        data: *mut c_char,
        data_len: u32,
        need_copy: c_int,
        status: *mut c_int,
        refonly: c_int,
        name: *const c_char,
    ) -> Result<usize, BackendError> {
        let runtime = self.runtime()?;
        let forward = || runtime.image_open_from_data_with_name(data, data_len, need_copy, status, refonly, name);

        let Some(search_override) = self.settings.search_path_override.as_deref() else {
            return Ok(forward());
        };
        let requested = c_str_lossy(name);
        let Some(file_name) = Path::new(&requested).file_name().map(|name| name.to_string_lossy()) else {
            return Ok(forward());
        };
        let Some(override_file) =
            environment::find_override_file(Some(search_override), &self.settings.base_dir, &file_name)
        else {
            return Ok(forward());
        };

        let mut bytes = match std::fs::read(&override_file) {
            Ok(bytes) if !bytes.is_empty() && u32::try_from(bytes.len()).is_ok() => bytes,
            Ok(_) => {
                warn!(
                    "event=image_override module=mono status=skip path={} reason=unusable_size",
                    override_file.display()
                );
                return Ok(forward());
            }
            Err(err) => {
                warn!(
                    "event=image_override module=mono status=skip path={} error={}",
                    override_file.display(),
                    err
                );
                return Ok(forward());
            }
        };
        debug!(
            "event=image_override module=mono status=ok image={} path={}",
            requested,
            override_file.display()
        );
        // The runtime must copy: `bytes` is released when this call returns.
        Ok(runtime.image_open_from_data_with_name(
            bytes.as_mut_ptr() as *mut c_char,
            bytes.len() as u32,
            1,
            status,
            refonly,
            name,
        ))
    }

    /// Registers `hook` as the runtime's assembly-search fallback, once.
    pub fn install_assembly_hooks(&self, hook: AssemblySearchHookFn) -> Result<bool, BackendError> {
        let runtime = self.runtime()?;
        if self.search_hook_installed.swap(true, Ordering::Relaxed) {
            return Ok(false);
        }
        runtime.install_assembly_search_hook(hook, 0);
        info!("event=assembly_search_hook module=mono status=ok");
        Ok(true)
    }

    /// Assembly-search hook body for a raw runtime request.
    ///
    /// # Safety
    /// `name` must be null or point to a live assembly name.
    pub unsafe fn on_assembly_search(&self, name: *const MonoAssemblyName) -> Result<usize, BackendError> {
        match AssemblyIdentity::from_raw(name) {
            Some(identity) => self.search_assembly(&identity),
            None => Ok(0),
        }
    }

    /// Asks the managed resolver for `identity`; 0 when it has nothing.
    pub fn search_assembly(&self, identity: &AssemblyIdentity) -> Result<usize, BackendError> {
        let runtime = self.runtime()?;
        let method = self.resolver_method.load(Ordering::Relaxed);
        if method == 0 {
            return Ok(0);
        }

        let name = CString::new(identity.name.as_str())
            .map_err(|err| BackendError::InvalidArgument(err.to_string()))?;
        let managed_name = runtime.string_new(self.domain(), &name);
        let [mut major, mut minor, mut build, mut revision] = identity.version;
        let mut params = [
            managed_name as *mut c_void,
            &mut major as *mut u16 as *mut c_void,
            &mut minor as *mut u16 as *mut c_void,
            &mut build as *mut u16 as *mut c_void,
            &mut revision as *mut u16 as *mut c_void,
        ];

        // SAFETY: the resolver takes (string, ushort&, ushort&, ushort&, ushort&).
        match unsafe { runtime.runtime_invoke(method, 0, params.as_mut_ptr()) } {
            Ok(0) => Ok(0),
            Ok(reflection) => {
                // SAFETY: the resolver returns a managed Assembly object.
                let assembly = unsafe { (*(reflection as *const MonoReflectionAssembly)).assembly };
                debug!(
                    "event=assembly_search module=mono status=ok name={} assembly={:#x}",
                    identity.name, assembly
                );
                Ok(assembly)
            }
            Err(exception) => {
                warn!(
                    "event=assembly_search module=mono status=error name={} exception={:#x}",
                    identity.name, exception
                );
                Ok(0)
            }
        }
    }

    fn apply_domain_config(&self, runtime: &R, domain: usize) {
        let base_dir = CString::new(self.settings.host.directory.to_string_lossy().into_owned());
        let config_file = CString::new(self.settings.host.config_file().to_string_lossy().into_owned());
        let (Ok(base_dir), Ok(config_file)) = (base_dir, config_file) else {
            warn!("event=domain_config module=mono status=skip reason=nul_in_path");
            return;
        };
        if runtime.domain_set_config(domain, &base_dir, &config_file) {
            debug!(
                "event=domain_config module=mono status=ok config_file={}",
                config_file.to_string_lossy()
            );
        }
    }

    fn launch_managed(&self, runtime: &R, domain: usize) {
        let context = LaunchContext::new(&self.settings.base_dir, self.settings.bootstrap_module);
        match self.launcher.launch(runtime, domain, &context) {
            Ok(Some(method)) => {
                self.resolver_method.store(method, Ordering::Relaxed);
                info!(
                    "event=managed_launch module=mono status=ok launcher={} resolver={:#x}",
                    self.launcher.name(),
                    method
                );
            }
            Ok(None) => info!(
                "event=managed_launch module=mono status=ok launcher={} resolver=none",
                self.launcher.name()
            ),
            Err(err) => error!(
                "event=managed_launch module=mono status=error launcher={} error={} mod_support=disabled",
                self.launcher.name(),
                err
            ),
        }
    }
}

impl MonoHandler<MonoLib> {
    /// Init callback body: binds the runtime exports of `module`.
    ///
    /// # Errors
    /// - `MissingExport` when a required export is absent; the backend stays
    ///   unresolved and the host continues unmanaged.
    pub fn resolve_exports(&self, lookup: &dyn ExportLookup, module: ModuleHandle) -> Result<(), BackendError> {
        if self.runtime.get().is_some() {
            return Ok(());
        }
        let runtime = MonoLib::resolve(lookup, module).map_err(|err| {
            error!(
                "event=exports_resolved module=mono status=error handle={:#x} error={}",
                module.addr(),
                err
            );
            err
        })?;
        self.attach_runtime(runtime)
    }
}

unsafe fn c_str_lossy(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    CStr::from_ptr(ptr).to_string_lossy().into_owned()
}
