use bootstrap_core::{
    Il2CppHandler, Il2CppPhase, Il2CppRuntime, LaunchContext, LaunchError, ManagedEntryPoint,
    ManagedHostLauncher, ModuleHandle, StdHandleRestore,
};
use std::ffi::{c_char, c_void};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};

const SCENE_CHANGED: usize = 0x51;
const UPDATE: usize = 0x52;

struct FakeAotRuntime {
    inits: Arc<AtomicUsize>,
    invokes: Arc<Mutex<Vec<usize>>>,
}

impl Il2CppRuntime for FakeAotRuntime {
    fn module(&self) -> ModuleHandle {
        ModuleHandle::from_addr(0x9000)
    }

    unsafe fn init(&self, _domain_name: *const c_char) -> usize {
        self.inits.fetch_add(1, Ordering::Relaxed);
        0xD0
    }

    unsafe fn runtime_invoke(
        &self,
        method: usize,
        _obj: usize,
        _params: *mut *mut c_void,
        _exception: *mut *mut c_void,
    ) -> usize {
        self.invokes.lock().unwrap().push(method);
        method + 1
    }

    fn method_name(&self, method: usize) -> Option<String> {
        match method {
            SCENE_CHANGED => Some("Internal_ActiveSceneChanged".to_string()),
            UPDATE => Some("Update".to_string()),
            _ => None,
        }
    }
}

/// Launcher double counting launches and handing back a fixed entry.
struct CountingLauncher {
    launches: Arc<AtomicUsize>,
    entry: Option<usize>,
    fail: bool,
}

impl ManagedHostLauncher for CountingLauncher {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn launch(&self, context: &LaunchContext) -> Result<Option<ManagedEntryPoint>, LaunchError> {
        self.launches.fetch_add(1, Ordering::Relaxed);
        assert_eq!(context.bootstrap_module, ModuleHandle::from_addr(0xB00));
        if self.fail {
            return Err(LaunchError::HostBinaryMissing(context.base_dir.join("missing")));
        }
        Ok(self.entry.and_then(ManagedEntryPoint::from_addr))
    }
}

#[derive(Default)]
struct CountingConsole(AtomicUsize);

impl StdHandleRestore for CountingConsole {
    fn reset_handles(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

static MATCHING_STARTS: AtomicUsize = AtomicUsize::new(0);
static FAILED_LAUNCH_STARTS: AtomicUsize = AtomicUsize::new(0);

extern "system" fn matching_start() {
    MATCHING_STARTS.fetch_add(1, Ordering::Relaxed);
}

extern "system" fn failed_launch_start() {
    FAILED_LAUNCH_STARTS.fetch_add(1, Ordering::Relaxed);
}

struct Fixture {
    handler: Il2CppHandler<FakeAotRuntime>,
    inits: Arc<AtomicUsize>,
    invokes: Arc<Mutex<Vec<usize>>>,
    launches: Arc<AtomicUsize>,
    console: Arc<CountingConsole>,
}

fn fixture(entry: Option<usize>, fail: bool) -> Fixture {
    let inits = Arc::new(AtomicUsize::new(0));
    let invokes = Arc::new(Mutex::new(Vec::new()));
    let launches = Arc::new(AtomicUsize::new(0));
    let console = Arc::new(CountingConsole::default());
    let handler = Il2CppHandler::new(
        LaunchContext::new("/games/host", ModuleHandle::from_addr(0xB00)),
        Box::new(CountingLauncher {
            launches: launches.clone(),
            entry,
            fail,
        }),
        Some(console.clone()),
    );
    handler
        .attach_runtime(FakeAotRuntime {
            inits: inits.clone(),
            invokes: invokes.clone(),
        })
        .unwrap();
    Fixture {
        handler,
        inits,
        invokes,
        launches,
        console,
    }
}

fn invoke(handler: &Il2CppHandler<FakeAotRuntime>, method: usize) -> usize {
    unsafe {
        handler.on_runtime_invoke(method, 0, std::ptr::null_mut(), std::ptr::null_mut())
    }
    .unwrap()
}

#[test]
fn init_launches_managed_host_once() {
    let fx = fixture(None, false);
    assert_eq!(fx.handler.phase(), Il2CppPhase::Located);

    for _ in 0..3 {
        let domain = unsafe { fx.handler.on_init(std::ptr::null()) }.unwrap();
        assert_eq!(domain, 0xD0);
    }

    assert_eq!(fx.inits.load(Ordering::Relaxed), 3);
    assert_eq!(fx.launches.load(Ordering::Relaxed), 1);
    assert_eq!(fx.console.0.load(Ordering::Relaxed), 1);
    assert!(fx.handler.state().is_initialized());
    assert_eq!(fx.handler.phase(), Il2CppPhase::FirstInitDone);
    assert_eq!(fx.handler.entry_point(), None);
}

#[test]
fn entry_point_runs_once_on_first_lifecycle_invoke() {
    let fx = fixture(Some(matching_start as extern "system" fn() as usize), false);
    unsafe { fx.handler.on_init(std::ptr::null()) }.unwrap();

    assert_eq!(invoke(&fx.handler, UPDATE), UPDATE + 1);
    assert_eq!(invoke(&fx.handler, 0x99), 0x9A);
    assert_eq!(MATCHING_STARTS.load(Ordering::Relaxed), 0);
    assert!(!fx.handler.start_invoked());

    assert_eq!(invoke(&fx.handler, SCENE_CHANGED), SCENE_CHANGED + 1);
    assert_eq!(MATCHING_STARTS.load(Ordering::Relaxed), 1);
    assert_eq!(fx.handler.phase(), Il2CppPhase::ManagedStartInvoked);

    invoke(&fx.handler, SCENE_CHANGED);
    invoke(&fx.handler, UPDATE);
    assert_eq!(MATCHING_STARTS.load(Ordering::Relaxed), 1);
    assert_eq!(
        *fx.invokes.lock().unwrap(),
        vec![UPDATE, 0x99, SCENE_CHANGED, SCENE_CHANGED, UPDATE]
    );
}

#[test]
fn failed_launch_keeps_host_running() {
    let fx = fixture(Some(failed_launch_start as extern "system" fn() as usize), true);
    let domain = unsafe { fx.handler.on_init(std::ptr::null()) }.unwrap();
    assert_eq!(domain, 0xD0);
    assert!(fx.handler.state().is_initialized());
    assert_eq!(fx.handler.entry_point(), None);

    assert_eq!(invoke(&fx.handler, SCENE_CHANGED), SCENE_CHANGED + 1);
    assert_eq!(FAILED_LAUNCH_STARTS.load(Ordering::Relaxed), 0);
    assert!(fx.handler.start_invoked());
    assert_eq!(fx.handler.phase(), Il2CppPhase::FirstInitDone);
}

#[test]
fn unbound_handler_rejects_calls() {
    let handler: Il2CppHandler<FakeAotRuntime> = Il2CppHandler::new(
        LaunchContext::new("/games/host", ModuleHandle::from_addr(0xB00)),
        Box::new(CountingLauncher {
            launches: Arc::new(AtomicUsize::new(0)),
            entry: None,
            fail: false,
        }),
        None,
    );
    assert_eq!(handler.phase(), Il2CppPhase::Unloaded);
    assert!(unsafe { handler.on_init(std::ptr::null()) }.is_err());
}

/// Launcher double that holds every caller until two launches overlap, then
/// hands each a distinct entry.
struct OverlappingLauncher {
    barrier: Barrier,
    launches: AtomicUsize,
}

impl ManagedHostLauncher for OverlappingLauncher {
    fn name(&self) -> &'static str {
        "overlapping"
    }

    fn launch(&self, _context: &LaunchContext) -> Result<Option<ManagedEntryPoint>, LaunchError> {
        self.barrier.wait();
        let nth = self.launches.fetch_add(1, Ordering::Relaxed);
        Ok(ManagedEntryPoint::from_addr(0x7000 + nth))
    }
}

#[test]
fn racing_first_inits_keep_the_first_recorded_entry() {
    let handler = Il2CppHandler::new(
        LaunchContext::new("/games/host", ModuleHandle::from_addr(0xB00)),
        Box::new(OverlappingLauncher {
            barrier: Barrier::new(2),
            launches: AtomicUsize::new(0),
        }),
        None,
    );
    handler
        .attach_runtime(FakeAotRuntime {
            inits: Arc::new(AtomicUsize::new(0)),
            invokes: Arc::new(Mutex::new(Vec::new())),
        })
        .unwrap();

    std::thread::scope(|scope| {
        for _ in 0..2 {
            scope.spawn(|| unsafe { handler.on_init(std::ptr::null()) }.unwrap());
        }
    });

    let entry = handler.entry_point().expect("one entry recorded").addr();
    assert!(entry == 0x7000 || entry == 0x7001);
    assert!(handler.state().is_initialized());
    assert_eq!(handler.entry_point().map(ManagedEntryPoint::addr), Some(entry));
}
