use bootstrap_core::{
    BackendError, BackendKind, BootstrapError, ModuleHandle, RedirectTable, SymbolRedirectEntry,
    SymbolResolutionInterceptor,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const INIT_DETOUR: usize = 0x1_0000;
const INVOKE_DETOUR: usize = 0x2_0000;

fn counting_table(seen: Arc<Mutex<Vec<ModuleHandle>>>) -> RedirectTable {
    let mut table = RedirectTable::new();
    for (symbol, detour) in [
        ("il2cpp_init", INIT_DETOUR),
        ("il2cpp_runtime_invoke", INVOKE_DETOUR),
    ] {
        let seen = seen.clone();
        table
            .register(SymbolRedirectEntry::new(
                symbol,
                BackendKind::NativeAot,
                detour,
                move |module| {
                    seen.lock().unwrap().push(module);
                    Ok(())
                },
            ))
            .unwrap();
    }
    table
}

#[test]
fn unrelated_symbols_pass_through_without_side_effects() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let interceptor = SymbolResolutionInterceptor::new(counting_table(seen.clone()));
    let module = ModuleHandle::from_addr(0x7000);

    assert_eq!(interceptor.resolve(module, "malloc", 0x1234), 0x1234);
    assert_eq!(interceptor.resolve(module, "pthread_create", 0), 0);
    assert!(!interceptor.init_fired());
    assert!(seen.lock().unwrap().is_empty());
}

#[test]
fn registered_symbol_missing_from_module_is_not_redirected() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let interceptor = SymbolResolutionInterceptor::new(counting_table(seen.clone()));
    let unrelated = ModuleHandle::from_addr(0x6000);
    let runtime = ModuleHandle::from_addr(0x7000);

    // A module lacking the export keeps reporting it absent and is never
    // mistaken for the runtime.
    assert_eq!(interceptor.resolve(unrelated, "il2cpp_init", 0), 0);
    assert!(!interceptor.init_fired());
    assert!(seen.lock().unwrap().is_empty());

    assert_eq!(interceptor.resolve(runtime, "il2cpp_init", 0x10), INIT_DETOUR);
    assert_eq!(*seen.lock().unwrap(), vec![runtime]);
}

#[test]
fn first_redirect_fires_init_once_and_stays_idempotent() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let interceptor = SymbolResolutionInterceptor::new(counting_table(seen.clone()));
    let runtime = ModuleHandle::from_addr(0x7000);

    assert_eq!(interceptor.resolve(runtime, "il2cpp_init", 0x10), INIT_DETOUR);
    assert_eq!(interceptor.resolve(runtime, "il2cpp_init", 0x10), INIT_DETOUR);
    assert_eq!(
        interceptor.resolve(runtime, "il2cpp_runtime_invoke", 0x20),
        INVOKE_DETOUR
    );

    assert!(interceptor.init_fired());
    assert!(interceptor.redirects_live());
    assert_eq!(*seen.lock().unwrap(), vec![runtime]);
}

#[test]
fn failed_init_callback_degrades_to_pass_through() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut table = RedirectTable::new();
    let counter = calls.clone();
    table
        .register(SymbolRedirectEntry::new(
            "mono_jit_init_version",
            BackendKind::ScriptingVm,
            INIT_DETOUR,
            move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
                Err(BootstrapError::from(BackendError::MissingExport {
                    symbol: "mono_runtime_invoke".to_string(),
                }))
            },
        ))
        .unwrap();
    let interceptor = SymbolResolutionInterceptor::new(table);
    let module = ModuleHandle::from_addr(0x7000);

    assert_eq!(interceptor.resolve(module, "mono_jit_init_version", 0x44), 0x44);
    assert_eq!(interceptor.resolve(module, "mono_jit_init_version", 0x44), 0x44);
    assert_eq!(calls.load(Ordering::Relaxed), 1);
    assert!(!interceptor.redirects_live());
}

#[test]
fn panicking_init_callback_never_escapes() {
    let mut table = RedirectTable::new();
    table
        .register(SymbolRedirectEntry::new(
            "il2cpp_init",
            BackendKind::NativeAot,
            INIT_DETOUR,
            |_| panic!("export table unreadable"),
        ))
        .unwrap();
    let interceptor = SymbolResolutionInterceptor::new(table);

    let resolved = interceptor.resolve(ModuleHandle::from_addr(0x7000), "il2cpp_init", 0x55);
    assert_eq!(resolved, 0x55);
    assert!(!interceptor.redirects_live());
}

#[test]
fn null_detours_are_rejected_at_registration() {
    let mut table = RedirectTable::new();
    let err = table
        .register(SymbolRedirectEntry::new(
            "il2cpp_init",
            BackendKind::NativeAot,
            0,
            |_| Ok(()),
        ))
        .unwrap_err();
    assert!(matches!(err, bootstrap_core::HookError::Installation { .. }));
    assert!(table.is_empty());
}
