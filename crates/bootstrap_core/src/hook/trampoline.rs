//! Inline detour bookkeeping over an external hooking primitive.
//!
//! # Responsibility
//! - Attach a detour to a function entry and hand back the trampoline that
//!   still runs the original body.
//! - Detach by target (or by the trampoline a caller was handed).
//!
//! # Invariants
//! - At most one live record per target; a second attach is rejected.
//! - Records live until explicitly detached; detour addresses must stay valid
//!   for as long as the record exists.
//!
//! # See also
//! - `hook::symbol` for name-level redirection.

use log::{info, warn};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Mutex;

/// Patch engine that rewrites a function entry into a jump to a detour.
pub trait InlineHookPrimitive: Send + Sync {
    /// Patches `target` and returns the trampoline address.
    ///
    /// # Safety
    /// `target` must be the entry of executable code and `detour` a function
    /// with an identical ABI that outlives the patch.
    unsafe fn install(&self, target: usize, detour: usize) -> Result<usize, String>;

    /// Reverts the patch previously applied to `target`.
    ///
    /// # Safety
    /// No thread may be executing the trampoline being released.
    unsafe fn remove(&self, target: usize) -> Result<(), String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetourRecord {
    pub target: usize,
    pub detour: usize,
    pub trampoline: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookError {
    Installation { target: usize, reason: String },
    Teardown { target: usize, reason: String },
}

impl Display for HookError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Installation { target, reason } => {
                write!(f, "failed to install hook at {target:#x}: {reason}")
            }
            Self::Teardown { target, reason } => {
                write!(f, "failed to remove hook at {target:#x}: {reason}")
            }
        }
    }
}

impl Error for HookError {}

/// Owns every inline detour applied through this loader.
pub struct TrampolineDetourManager {
    primitive: Box<dyn InlineHookPrimitive>,
    records: Mutex<BTreeMap<usize, DetourRecord>>,
}

impl TrampolineDetourManager {
    pub fn new(primitive: Box<dyn InlineHookPrimitive>) -> Self {
        Self {
            primitive,
            records: Mutex::new(BTreeMap::new()),
        }
    }

    /// Manager backed by the platform's native patch engine.
    pub fn native() -> Self {
        Self::new(Box::new(NativePrimitive::default()))
    }

    /// Attaches `detour` to `target` and returns the original trampoline.
    ///
    /// # Errors
    /// - `Installation` when either address is null, `target` is already
    ///   hooked, or the primitive cannot apply the patch.
    ///
    /// # Safety
    /// See [`InlineHookPrimitive::install`].
    pub unsafe fn attach(&self, target: usize, detour: usize) -> Result<usize, HookError> {
        if target == 0 || detour == 0 {
            return Err(HookError::Installation {
                target,
                reason: "null target or detour".to_string(),
            });
        }

        let mut records = self.lock();
        if records.contains_key(&target) {
            return Err(HookError::Installation {
                target,
                reason: "target is already hooked".to_string(),
            });
        }

        let trampoline = self
            .primitive
            .install(target, detour)
            .map_err(|reason| HookError::Installation { target, reason })?;
        records.insert(
            target,
            DetourRecord {
                target,
                detour,
                trampoline,
            },
        );
        info!(
            "event=hook_attach module=trampoline status=ok target={:#x} detour={:#x} trampoline={:#x}",
            target, detour, trampoline
        );
        Ok(trampoline)
    }

    /// Removes the detour identified by its target or by its trampoline.
    ///
    /// # Errors
    /// - `Teardown` when no matching record exists or the primitive fails; the
    ///   record is kept in the failure case.
    ///
    /// # Safety
    /// See [`InlineHookPrimitive::remove`].
    pub unsafe fn detach(&self, address: usize) -> Result<DetourRecord, HookError> {
        let mut records = self.lock();
        let Some(record) = find_record(&records, address) else {
            return Err(HookError::Teardown {
                target: address,
                reason: "no hook attached".to_string(),
            });
        };

        if let Err(reason) = self.primitive.remove(record.target) {
            warn!(
                "event=hook_detach module=trampoline status=error target={:#x} reason={}",
                record.target, reason
            );
            return Err(HookError::Teardown {
                target: record.target,
                reason,
            });
        }
        records.remove(&record.target);
        info!(
            "event=hook_detach module=trampoline status=ok target={:#x}",
            record.target
        );
        Ok(record)
    }

    /// Returns the record whose target or trampoline equals `address`.
    pub fn record(&self, address: usize) -> Option<DetourRecord> {
        find_record(&self.lock(), address)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<usize, DetourRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn find_record(records: &BTreeMap<usize, DetourRecord>, address: usize) -> Option<DetourRecord> {
    records.get(&address).copied().or_else(|| {
        records
            .values()
            .find(|record| record.trampoline == address)
            .copied()
    })
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub use self::retour_engine::RetourPrimitive as NativePrimitive;

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
pub use self::UnsupportedPrimitive as NativePrimitive;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
mod retour_engine {
    use super::InlineHookPrimitive;
    use retour::RawDetour;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct LiveDetour(RawDetour);

    // SAFETY: the detour is only touched under the primitive's mutex.
    unsafe impl Send for LiveDetour {}

    /// x86 / x86-64 patch engine backed by `retour`.
    #[derive(Default)]
    pub struct RetourPrimitive {
        live: Mutex<HashMap<usize, LiveDetour>>,
    }

    impl InlineHookPrimitive for RetourPrimitive {
        unsafe fn install(&self, target: usize, detour: usize) -> Result<usize, String> {
            let raw = RawDetour::new(target as *const (), detour as *const ())
                .map_err(|err| err.to_string())?;
            raw.enable().map_err(|err| err.to_string())?;
            let trampoline = raw.trampoline() as *const () as usize;
            self.live
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(target, LiveDetour(raw));
            Ok(trampoline)
        }

        unsafe fn remove(&self, target: usize) -> Result<(), String> {
            let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
            let Some(entry) = live.get(&target) else {
                return Err("primitive holds no patch for target".to_string());
            };
            entry.0.disable().map_err(|err| err.to_string())?;
            live.remove(&target);
            Ok(())
        }
    }
}

/// Patch engine for architectures without an inline hooking backend.
#[derive(Debug, Default)]
pub struct UnsupportedPrimitive;

impl InlineHookPrimitive for UnsupportedPrimitive {
    unsafe fn install(&self, _target: usize, _detour: usize) -> Result<usize, String> {
        Err(format!(
            "inline hooking is not supported on {}",
            std::env::consts::ARCH
        ))
    }

    unsafe fn remove(&self, _target: usize) -> Result<(), String> {
        Err(format!(
            "inline hooking is not supported on {}",
            std::env::consts::ARCH
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::{HookError, InlineHookPrimitive, TrampolineDetourManager, UnsupportedPrimitive};

    struct OffsetPrimitive;

    impl InlineHookPrimitive for OffsetPrimitive {
        unsafe fn install(&self, target: usize, _detour: usize) -> Result<usize, String> {
            Ok(target + 0x1000)
        }

        unsafe fn remove(&self, _target: usize) -> Result<(), String> {
            Ok(())
        }
    }

    #[test]
    fn detach_accepts_trampoline_address() {
        let manager = TrampolineDetourManager::new(Box::new(OffsetPrimitive));
        let trampoline = unsafe { manager.attach(0x4000, 0x9000) }.expect("attach");
        assert_eq!(trampoline, 0x5000);

        let record = unsafe { manager.detach(trampoline) }.expect("detach by trampoline");
        assert_eq!(record.target, 0x4000);
        assert!(manager.is_empty());
    }

    #[test]
    fn null_addresses_are_rejected() {
        let manager = TrampolineDetourManager::new(Box::new(OffsetPrimitive));
        let err = unsafe { manager.attach(0, 0x9000) }.expect_err("null target");
        assert!(matches!(err, HookError::Installation { .. }));
    }

    #[test]
    fn unsupported_primitive_reports_installation_error() {
        let manager = TrampolineDetourManager::new(Box::new(UnsupportedPrimitive));
        let err = unsafe { manager.attach(0x4000, 0x9000) }.expect_err("unsupported");
        assert!(err.to_string().contains("not supported"));
        assert!(manager.is_empty());
    }
}
