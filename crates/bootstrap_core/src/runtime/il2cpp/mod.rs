//! Native AOT (Il2Cpp family) backend handler.
//!
//! # Responsibility
//! - Start the modern managed host from the runtime-init detour, once.
//! - Watch generic invokes for the first lifecycle call and hand control to
//!   the managed start function exactly then.
//!
//! # Invariants
//! - Phases only advance: Unloaded -> Located -> FirstInitDone -> ManagedStartInvoked.
//! - The managed start function runs at most once per process.
//! - Invokes are always forwarded before any inspection.
//!
//! # See also
//! - `launcher::hostfxr` for the default managed host strategy.

pub mod bindings;

pub use bindings::{Il2CppLib, Il2CppRuntime};

use crate::console::StdHandleRestore;
use crate::launcher::{LaunchContext, ManagedEntryPoint, ManagedHostLauncher};
use crate::native::{ExportLookup, ModuleHandle};
use crate::runtime::{BackendError, BackendKind, Phase, PhaseTracker, RuntimeInitializationState};
use log::{debug, error, info};
use once_cell::sync::OnceCell;
use std::ffi::{c_char, c_void};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Name fragment of the first engine callback that runs with managed code
/// fully usable. A heuristic: engines may rename it.
pub const LIFECYCLE_METHOD: &str = "Internal_ActiveSceneChanged";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Il2CppPhase {
    Unloaded,
    Located,
    FirstInitDone,
    ManagedStartInvoked,
}

impl Phase for Il2CppPhase {
    fn ordinal(self) -> u8 {
        self as u8
    }

    fn from_ordinal(ordinal: u8) -> Self {
        match ordinal {
            0 => Self::Unloaded,
            1 => Self::Located,
            2 => Self::FirstInitDone,
            _ => Self::ManagedStartInvoked,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Unloaded => "unloaded",
            Self::Located => "located",
            Self::FirstInitDone => "first_init_done",
            Self::ManagedStartInvoked => "managed_start_invoked",
        }
    }
}

pub fn is_lifecycle_method(name: &str) -> bool {
    name.contains(LIFECYCLE_METHOD)
}

pub struct Il2CppHandler<R: Il2CppRuntime> {
    context: LaunchContext,
    launcher: Box<dyn ManagedHostLauncher + Send + Sync>,
    console: Option<Arc<dyn StdHandleRestore>>,
    state: RuntimeInitializationState,
    phase: PhaseTracker<Il2CppPhase>,
    runtime: OnceCell<R>,
    entry_point: OnceCell<ManagedEntryPoint>,
    start_invoked: AtomicBool,
}

impl<R: Il2CppRuntime> Il2CppHandler<R> {
    pub fn new(
        context: LaunchContext,
        launcher: Box<dyn ManagedHostLauncher + Send + Sync>,
        console: Option<Arc<dyn StdHandleRestore>>,
    ) -> Self {
        Self {
            context,
            launcher,
            console,
            state: RuntimeInitializationState::new(BackendKind::NativeAot),
            phase: PhaseTracker::new(Il2CppPhase::Unloaded),
            runtime: OnceCell::new(),
            entry_point: OnceCell::new(),
            start_invoked: AtomicBool::new(false),
        }
    }

    pub fn attach_runtime(&self, runtime: R) -> Result<(), BackendError> {
        let module = runtime.module();
        self.runtime.set(runtime).map_err(|_| {
            BackendError::InvalidArgument("native AOT runtime already attached".to_string())
        })?;
        self.state.set_module(module);
        self.phase.advance(Il2CppPhase::Located);
        info!(
            "event=exports_resolved module=il2cpp status=ok handle={:#x}",
            module.addr()
        );
        Ok(())
    }

    pub fn runtime(&self) -> Result<&R, BackendError> {
        self.runtime
            .get()
            .ok_or(BackendError::NotResolved(BackendKind::NativeAot))
    }

    pub fn state(&self) -> &RuntimeInitializationState {
        &self.state
    }

    pub fn phase(&self) -> Il2CppPhase {
        self.phase.current()
    }

    /// Start function captured from the managed host, if the launch succeeded.
    pub fn entry_point(&self) -> Option<ManagedEntryPoint> {
        self.entry_point.get().copied()
    }

    pub fn start_invoked(&self) -> bool {
        self.start_invoked.load(Ordering::Relaxed)
    }

    /// Init detour body.
    ///
    /// # Safety
    /// `domain_name` must be null or a valid C string.
    pub unsafe fn on_init(&self, domain_name: *const c_char) -> Result<usize, BackendError> {
        let runtime = self.runtime()?;
        if self.state.is_initialized() {
            return Ok(runtime.init(domain_name));
        }

        if let Some(console) = &self.console {
            console.reset_handles();
        }
        let domain = runtime.init(domain_name);
        info!(
            "event=runtime_init module=il2cpp status=ok domain_ptr={:#x}",
            domain
        );

        match self.launcher.launch(&self.context) {
            Ok(Some(entry)) => {
                if self.entry_point.set(entry).is_err() {
                    debug!(
                        "event=managed_launch module=il2cpp status=skip reason=entry_already_set entry={:#x}",
                        entry.addr()
                    );
                }
                info!(
                    "event=managed_launch module=il2cpp status=ok launcher={} entry={:#x}",
                    self.launcher.name(),
                    entry.addr()
                );
            }
            Ok(None) => debug!(
                "event=managed_launch module=il2cpp status=ok launcher={} entry=none",
                self.launcher.name()
            ),
            Err(err) => error!(
                "event=managed_launch module=il2cpp status=error launcher={} error={} mod_support=disabled",
                self.launcher.name(),
                err
            ),
        }

        self.state.mark_initialized();
        self.phase.advance(Il2CppPhase::FirstInitDone);
        Ok(domain)
    }

    /// Generic-invoke detour body.
    ///
    /// # Safety
    /// Arguments must satisfy the runtime's invoke contract for `method`.
    pub unsafe fn on_runtime_invoke(
        &self,
        method: usize,
        obj: usize,
        params: *mut *mut c_void,
        exception: *mut *mut c_void,
    ) -> Result<usize, BackendError> {
        let runtime = self.runtime()?;
        let result = runtime.runtime_invoke(method, obj, params, exception);
        if self.start_invoked.load(Ordering::Relaxed) {
            return Ok(result);
        }

        let Some(name) = runtime.method_name(method) else {
            return Ok(result);
        };
        if !is_lifecycle_method(&name) {
            return Ok(result);
        }

        self.start_invoked.store(true, Ordering::Relaxed);
        match self.entry_point() {
            Some(entry) => {
                info!(
                    "event=managed_start module=il2cpp status=start trigger={}",
                    name
                );
                entry.invoke();
                self.phase.advance(Il2CppPhase::ManagedStartInvoked);
                info!("event=managed_start module=il2cpp status=ok");
            }
            None => debug!(
                "event=managed_start module=il2cpp status=skip trigger={} reason=no_entry_point",
                name
            ),
        }
        Ok(result)
    }
}

impl Il2CppHandler<Il2CppLib> {
    /// Init callback body: binds the runtime exports of `module`.
    pub fn resolve_exports(&self, lookup: &dyn ExportLookup, module: ModuleHandle) -> Result<(), BackendError> {
        if self.runtime.get().is_some() {
            return Ok(());
        }
        let runtime = Il2CppLib::resolve(lookup, module).map_err(|err| {
            error!(
                "event=exports_resolved module=il2cpp status=error handle={:#x} error={}",
                module.addr(),
                err
            );
            err
        })?;
        self.attach_runtime(runtime)
    }
}

#[cfg(test)]
mod tests {
    use super::{is_lifecycle_method, Il2CppPhase};
    use crate::runtime::Phase;

    #[test]
    fn lifecycle_match_is_a_substring_match() {
        assert!(is_lifecycle_method("Internal_ActiveSceneChanged"));
        assert!(is_lifecycle_method("SceneManager.Internal_ActiveSceneChanged"));
        assert!(!is_lifecycle_method("Internal_SceneLoaded"));
    }

    #[test]
    fn phase_ordinals_round_trip() {
        for phase in [
            Il2CppPhase::Unloaded,
            Il2CppPhase::Located,
            Il2CppPhase::FirstInitDone,
            Il2CppPhase::ManagedStartInvoked,
        ] {
            assert_eq!(Il2CppPhase::from_ordinal(phase.ordinal()), phase);
        }
    }
}
