//! `extern` thunks installed in place of resolver, runtime and stream-close
//! entry points.
//!
//! Every thunk routes through [`shielded`]; on any failure it falls back to
//! the real function when one is bound, otherwise to a neutral value.

use crate::coordinator::{bootstrap, require};
use bootstrap_core::runtime::mono::MonoAssemblyName;
use bootstrap_core::runtime::{il2cpp::Il2CppRuntime, mono::MonoRuntime, BackendKind};
use bootstrap_core::{shielded, BootstrapError};
use log::debug;
use std::convert::Infallible;
use std::ffi::{c_char, c_int, c_void};

/// `(symbol, backend, detour)` for every redirected runtime export.
pub fn redirects() -> [(&'static str, BackendKind, usize); 6] {
    [
        ("il2cpp_init", BackendKind::NativeAot, il2cpp_init as usize),
        (
            "il2cpp_runtime_invoke",
            BackendKind::NativeAot,
            il2cpp_runtime_invoke as usize,
        ),
        (
            "mono_jit_init_version",
            BackendKind::ScriptingVm,
            mono_jit_init_version as usize,
        ),
        (
            "mono_jit_parse_options",
            BackendKind::ScriptingVm,
            mono_jit_parse_options as usize,
        ),
        ("mono_debug_init", BackendKind::ScriptingVm, mono_debug_init as usize),
        (
            "mono_image_open_from_data_with_name",
            BackendKind::ScriptingVm,
            mono_image_open_from_data_with_name as usize,
        ),
    ]
}

#[cfg(unix)]
pub fn resolver_address() -> usize {
    hook_dlsym as usize
}

#[cfg(windows)]
pub fn resolver_address() -> usize {
    hook_get_proc_address as usize
}

#[cfg(unix)]
pub fn close_guard_address() -> usize {
    hook_fclose as usize
}

#[cfg(windows)]
pub fn close_guard_address() -> usize {
    hook_close_handle as usize
}

#[cfg(unix)]
pub unsafe extern "C" fn hook_dlsym(handle: *mut c_void, symbol: *const c_char) -> *mut c_void {
    let real = libc::dlsym(handle, symbol) as usize;
    let Some(state) = bootstrap() else {
        return real as *mut c_void;
    };
    let module = bootstrap_core::ModuleHandle::from_ptr(handle);
    shielded("dlsym", || {
        Ok::<_, Infallible>(state.interceptor.resolve_raw(module, symbol, real))
    })
    .unwrap_or(real) as *mut c_void
}

#[cfg(windows)]
pub unsafe extern "system" fn hook_get_proc_address(
    module: windows_sys::Win32::Foundation::HMODULE,
    name: windows_sys::core::PCSTR,
) -> windows_sys::Win32::Foundation::FARPROC {
    use windows_sys::Win32::System::LibraryLoader::GetProcAddress;

    let real = GetProcAddress(module, name).map_or(0, |function| function as usize);
    let resolved = match bootstrap() {
        Some(state) => {
            let handle = bootstrap_core::ModuleHandle::from_ptr(module as *mut c_void);
            shielded("GetProcAddress", || {
                Ok::<_, Infallible>(state.interceptor.resolve_raw(handle, name as *const c_char, real))
            })
            .unwrap_or(real)
        }
        None => real,
    };
    // SAFETY: `FARPROC` is a nullable function pointer of pointer size.
    std::mem::transmute::<usize, windows_sys::Win32::Foundation::FARPROC>(resolved)
}

pub unsafe extern "C" fn mono_jit_init_version(
    domain_name: *const c_char,
    runtime_version: *const c_char,
) -> *mut c_void {
    shielded("mono_jit_init_version", || {
        require()?
            .mono
            .on_jit_init_version(domain_name, runtime_version)
            .map_err(Into::<BootstrapError>::into)
    })
    .or_else(|| {
        let runtime = require().ok()?.mono.runtime().ok()?;
        Some(runtime.jit_init_version(domain_name, runtime_version))
    })
    .unwrap_or(0) as *mut c_void
}

pub unsafe extern "C" fn mono_jit_parse_options(argc: c_int, argv: *mut *mut c_char) {
    let handled = shielded("mono_jit_parse_options", || {
        require()?
            .mono
            .on_jit_parse_options(argc, argv)
            .map_err(Into::<BootstrapError>::into)
    });
    if handled.is_none() {
        if let Some(runtime) = require().ok().and_then(|state| state.mono.runtime().ok()) {
            runtime.jit_parse_options(argc, argv);
        }
    }
}

pub unsafe extern "C" fn mono_debug_init(format: c_int) {
    let handled = shielded("mono_debug_init", || {
        require()?
            .mono
            .on_debug_init(format)
            .map_err(Into::<BootstrapError>::into)
    });
    if handled.is_none() {
        if let Some(runtime) = require().ok().and_then(|state| state.mono.runtime().ok()) {
            runtime.debug_init(format);
        }
    }
}

pub unsafe extern "C" fn mono_image_open_from_data_with_name(
    data: *mut c_char,
    data_len: u32,
    need_copy: c_int,
    status: *mut c_int,
    refonly: c_int,
    name: *const c_char,
) -> *mut c_void {
    shielded("mono_image_open_from_data_with_name", || {
        require()?
            .mono
            .on_image_open_from_data_with_name(data, data_len, need_copy, status, refonly, name)
            .map_err(Into::<BootstrapError>::into)
    })
    .or_else(|| {
        let runtime = require().ok()?.mono.runtime().ok()?;
        Some(runtime.image_open_from_data_with_name(data, data_len, need_copy, status, refonly, name))
    })
    .unwrap_or(0) as *mut c_void
}

/// Assembly-search hook registered through `MonoInstallHooks`.
pub unsafe extern "C" fn mono_assembly_search(
    name: *mut MonoAssemblyName,
    _user_data: *mut c_void,
) -> *mut c_void {
    shielded("mono_assembly_search", || {
        require()?
            .mono
            .on_assembly_search(name)
            .map_err(Into::<BootstrapError>::into)
    })
    .unwrap_or(0) as *mut c_void
}

pub unsafe extern "C" fn il2cpp_init(domain_name: *const c_char) -> *mut c_void {
    shielded("il2cpp_init", || {
        require()?
            .il2cpp
            .on_init(domain_name)
            .map_err(Into::<BootstrapError>::into)
    })
    .or_else(|| {
        let runtime = require().ok()?.il2cpp.runtime().ok()?;
        Some(runtime.init(domain_name))
    })
    .unwrap_or(0) as *mut c_void
}

pub unsafe extern "C" fn il2cpp_runtime_invoke(
    method: *mut c_void,
    obj: *mut c_void,
    params: *mut *mut c_void,
    exception: *mut *mut c_void,
) -> *mut c_void {
    let (method, obj) = (method as usize, obj as usize);
    shielded("il2cpp_runtime_invoke", || {
        require()?
            .il2cpp
            .on_runtime_invoke(method, obj, params, exception)
            .map_err(Into::<BootstrapError>::into)
    })
    .or_else(|| {
        let runtime = require().ok()?.il2cpp.runtime().ok()?;
        Some(runtime.runtime_invoke(method, obj, params, exception))
    })
    .unwrap_or(0) as *mut c_void
}

/// Keeps the host from closing standard output and error.
#[cfg(unix)]
pub unsafe extern "C" fn hook_fclose(stream: *mut libc::FILE) -> c_int {
    let fd = libc::fileno(stream);
    if bootstrap_core::console::is_std_stream_fd(fd) {
        debug!("event=close_guard module=detours status=blocked fd={}", fd);
        return 0;
    }
    libc::fclose(stream)
}

#[cfg(windows)]
pub unsafe extern "system" fn hook_close_handle(
    handle: windows_sys::Win32::Foundation::HANDLE,
) -> windows_sys::Win32::Foundation::BOOL {
    let protected = bootstrap().is_some_and(|state| state.console.is_protected_handle(handle as usize));
    if protected {
        debug!(
            "event=close_guard module=detours status=blocked handle={:#x}",
            handle as usize
        );
        return 1;
    }
    windows_sys::Win32::Foundation::CloseHandle(handle)
}
