use bootstrap_core::{HookError, InlineHookPrimitive, TrampolineDetourManager};
use std::sync::{Arc, Mutex};

/// Primitive double that records patches and can be told to fail removal.
#[derive(Default)]
struct RecordingPrimitive {
    patched: Arc<Mutex<Vec<usize>>>,
    refuse_removal: bool,
}

impl InlineHookPrimitive for RecordingPrimitive {
    unsafe fn install(&self, target: usize, _detour: usize) -> Result<usize, String> {
        self.patched.lock().unwrap().push(target);
        Ok(target | 0x8000_0000)
    }

    unsafe fn remove(&self, target: usize) -> Result<(), String> {
        if self.refuse_removal {
            return Err("page is not writable".to_string());
        }
        self.patched.lock().unwrap().retain(|patched| *patched != target);
        Ok(())
    }
}

#[test]
fn attach_returns_trampoline_and_records_detour() {
    let patched = Arc::new(Mutex::new(Vec::new()));
    let manager = TrampolineDetourManager::new(Box::new(RecordingPrimitive {
        patched: patched.clone(),
        refuse_removal: false,
    }));

    let trampoline = unsafe { manager.attach(0x1000, 0x2000) }.unwrap();
    assert_eq!(trampoline, 0x8000_1000);
    let record = manager.record(0x1000).unwrap();
    assert_eq!(record.detour, 0x2000);
    assert_eq!(record.trampoline, trampoline);
    assert_eq!(*patched.lock().unwrap(), vec![0x1000]);
}

#[test]
fn attaching_an_already_hooked_target_fails() {
    let manager = TrampolineDetourManager::new(Box::new(RecordingPrimitive::default()));
    unsafe { manager.attach(0x1000, 0x2000) }.unwrap();

    let err = unsafe { manager.attach(0x1000, 0x3000) }.unwrap_err();
    assert!(matches!(err, HookError::Installation { target: 0x1000, .. }));
    assert_eq!(manager.len(), 1);
    assert_eq!(manager.record(0x1000).unwrap().detour, 0x2000);
}

#[test]
fn detach_without_attach_is_a_teardown_error() {
    let manager = TrampolineDetourManager::new(Box::new(RecordingPrimitive::default()));
    let err = unsafe { manager.detach(0x1000) }.unwrap_err();
    assert!(matches!(err, HookError::Teardown { .. }));
}

#[test]
fn failed_removal_keeps_the_record() {
    let manager = TrampolineDetourManager::new(Box::new(RecordingPrimitive {
        patched: Arc::default(),
        refuse_removal: true,
    }));
    unsafe { manager.attach(0x1000, 0x2000) }.unwrap();

    let err = unsafe { manager.detach(0x1000) }.unwrap_err();
    assert!(err.to_string().contains("page is not writable"));
    assert!(manager.record(0x1000).is_some());
}

#[test]
fn target_can_be_hooked_again_after_detach() {
    let manager = TrampolineDetourManager::new(Box::new(RecordingPrimitive::default()));
    unsafe { manager.attach(0x1000, 0x2000) }.unwrap();
    unsafe { manager.detach(0x1000) }.unwrap();
    assert!(manager.is_empty());

    unsafe { manager.attach(0x1000, 0x3000) }.unwrap();
    assert_eq!(manager.record(0x1000).unwrap().detour, 0x3000);
}
