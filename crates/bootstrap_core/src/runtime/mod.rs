//! Embedded runtime backends and their one-shot bootstrap state.
//!
//! # Responsibility
//! - Name the supported backend families.
//! - Own the per-backend [`RuntimeInitializationState`] and monotonic phase
//!   tracking used by the handlers.
//!
//! # Invariants
//! - `initialized` flips false -> true at most once and is never reset.
//! - Phases only move forward.
//!
//! # See also
//! - `runtime::mono` and `runtime::il2cpp` for the two handler variants.

pub mod il2cpp;
pub mod mono;

use crate::native::{ExportLookup, ModuleHandle};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Interpreted / JIT virtual machine (Mono family).
    ScriptingVm,
    /// Ahead-of-time compiled runtime (Il2Cpp family).
    NativeAot,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ScriptingVm => "scripting_vm",
            Self::NativeAot => "native_aot",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    MissingExport { symbol: String },
    /// The handler was invoked before its runtime exports were bound.
    NotResolved(BackendKind),
    InvalidArgument(String),
}

impl Display for BackendError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingExport { symbol } => write!(f, "required export `{symbol}` is missing"),
            Self::NotResolved(kind) => {
                write!(f, "{} runtime exports are not resolved", kind.as_str())
            }
            Self::InvalidArgument(message) => write!(f, "invalid argument: {message}"),
        }
    }
}

impl Error for BackendError {}

/// Looks up `symbol` in `module`, failing with `MissingExport` when absent.
pub fn require_export(
    lookup: &dyn ExportLookup,
    module: ModuleHandle,
    symbol: &str,
) -> Result<usize, BackendError> {
    lookup
        .find_export(module, symbol)
        .ok_or_else(|| BackendError::MissingExport {
            symbol: symbol.to_string(),
        })
}

/// One per backend per process, owned by the coordinator.
#[derive(Debug)]
pub struct RuntimeInitializationState {
    backend: BackendKind,
    initialized: AtomicBool,
    module: AtomicUsize,
}

impl RuntimeInitializationState {
    pub fn new(backend: BackendKind) -> Self {
        Self {
            backend,
            initialized: AtomicBool::new(false),
            module: AtomicUsize::new(0),
        }
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Relaxed)
    }

    /// Flips `initialized`; returns false when it was already set.
    pub fn mark_initialized(&self) -> bool {
        if self.is_initialized() {
            return false;
        }
        self.initialized.store(true, Ordering::Relaxed);
        true
    }

    pub fn module(&self) -> ModuleHandle {
        ModuleHandle::from_addr(self.module.load(Ordering::Relaxed))
    }

    pub fn set_module(&self, module: ModuleHandle) {
        self.module.store(module.addr(), Ordering::Relaxed);
    }
}

/// Ordered bootstrap phase of one backend.
pub trait Phase: Copy + Eq + std::fmt::Debug {
    fn ordinal(self) -> u8;
    fn from_ordinal(ordinal: u8) -> Self;
    fn name(self) -> &'static str;
}

/// Monotonic phase cell.
#[derive(Debug)]
pub struct PhaseTracker<P: Phase> {
    current: AtomicU8,
    _phase: PhantomData<P>,
}

impl<P: Phase> PhaseTracker<P> {
    pub fn new(initial: P) -> Self {
        Self {
            current: AtomicU8::new(initial.ordinal()),
            _phase: PhantomData,
        }
    }

    pub fn current(&self) -> P {
        P::from_ordinal(self.current.load(Ordering::Relaxed))
    }

    pub fn has_reached(&self, phase: P) -> bool {
        self.current.load(Ordering::Relaxed) >= phase.ordinal()
    }

    /// Moves forward to `phase`; earlier phases are ignored. Returns whether
    /// this call advanced the tracker.
    pub fn advance(&self, phase: P) -> bool {
        self.current.fetch_max(phase.ordinal(), Ordering::Relaxed) < phase.ordinal()
    }
}

#[cfg(test)]
mod tests {
    use super::{require_export, BackendError, BackendKind, RuntimeInitializationState};
    use crate::native::{ExportLookup, ModuleHandle};

    struct OneExport;

    impl ExportLookup for OneExport {
        fn find_export(&self, _module: ModuleHandle, name: &str) -> Option<usize> {
            (name == "il2cpp_init").then_some(0x1234)
        }
    }

    #[test]
    fn initialized_flips_once() {
        let state = RuntimeInitializationState::new(BackendKind::NativeAot);
        assert!(!state.is_initialized());
        assert!(state.mark_initialized());
        assert!(!state.mark_initialized());
        assert!(state.is_initialized());
    }

    #[test]
    fn require_export_names_missing_symbol() {
        let handle = ModuleHandle::from_addr(0x10);
        assert_eq!(require_export(&OneExport, handle, "il2cpp_init"), Ok(0x1234));
        assert_eq!(
            require_export(&OneExport, handle, "il2cpp_runtime_invoke"),
            Err(BackendError::MissingExport {
                symbol: "il2cpp_runtime_invoke".to_string()
            })
        );
    }
}
