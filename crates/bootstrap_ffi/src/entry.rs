//! Load-time entry: runs the bootstrap as soon as the host maps this module.

use crate::coordinator;
use bootstrap_core::config::HostPaths;
use bootstrap_core::native::ModuleHandle;

#[cfg(unix)]
#[ctor::ctor]
fn on_load() {
    let Some(host) = HostPaths::current() else {
        return;
    };
    // Child processes of the host inherit the preload variables.
    scrub_preload_environment(&host);
    if !host.is_likely_host() {
        return;
    }
    let module = bootstrap_core::native::current_module_handle().unwrap_or(ModuleHandle::NULL);
    coordinator::start(host, module);
}

#[cfg(unix)]
fn scrub_preload_environment(host: &HostPaths) {
    use bootstrap_core::config::host::{
        strip_library_path, strip_preload_entry, LIBRARY_PATH_ENV, PRELOAD_ENV,
    };

    let library_file = bootstrap_core::native::current_module_path()
        .and_then(|path| path.file_name().map(|name| name.to_string_lossy().into_owned()));
    if let (Some(library_file), Ok(value)) = (library_file, std::env::var(PRELOAD_ENV)) {
        std::env::set_var(PRELOAD_ENV, strip_preload_entry(&value, &library_file));
    }
    if let Ok(value) = std::env::var(LIBRARY_PATH_ENV) {
        std::env::set_var(LIBRARY_PATH_ENV, strip_library_path(&value, &host.directory));
    }
}

#[cfg(windows)]
#[no_mangle]
extern "system" fn DllMain(
    module: windows_sys::Win32::Foundation::HINSTANCE,
    reason: u32,
    _reserved: *mut std::ffi::c_void,
) -> windows_sys::Win32::Foundation::BOOL {
    use windows_sys::Win32::System::SystemServices::DLL_PROCESS_ATTACH;

    if reason == DLL_PROCESS_ATTACH {
        if let Some(host) = HostPaths::current() {
            coordinator::start(host, ModuleHandle::from_ptr(module as *mut std::ffi::c_void));
        }
    }
    1
}
