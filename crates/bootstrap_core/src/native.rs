//! Loaded-module handles and export lookup.
//!
//! # Responsibility
//! - Name native modules by an opaque, thread-safe handle.
//! - Resolve exported function addresses by name inside a loaded module.
//!
//! # Invariants
//! - Lookups go through the platform resolver directly, never through an
//!   import slot this loader may have patched.

use std::ffi::{c_void, CString};
use std::path::{Path, PathBuf};

/// Opaque handle of a loaded native module (`dlopen` handle / `HMODULE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ModuleHandle(usize);

impl ModuleHandle {
    pub const NULL: ModuleHandle = ModuleHandle(0);

    pub fn from_ptr(ptr: *mut c_void) -> Self {
        Self(ptr as usize)
    }

    pub fn from_addr(addr: usize) -> Self {
        Self(addr)
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0 as *mut c_void
    }

    pub fn addr(self) -> usize {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Export lookup seam used by backend handlers to bind runtime entry points.
pub trait ExportLookup {
    /// Returns the address of `name` inside `module`, or `None` when absent.
    fn find_export(&self, module: ModuleHandle, name: &str) -> Option<usize>;
}

/// Platform export table backed by `dlsym` / `GetProcAddress`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeExportTable;

impl ExportLookup for NativeExportTable {
    fn find_export(&self, module: ModuleHandle, name: &str) -> Option<usize> {
        if module.is_null() {
            return None;
        }
        let symbol = CString::new(name).ok()?;
        let addr = platform::symbol_address(module, &symbol);
        (addr != 0).then_some(addr)
    }
}

/// Loads (or re-references) a native library by path or file name.
pub fn load_library(path: &Path) -> Option<ModuleHandle> {
    let handle = platform::load_library(path)?;
    (!handle.is_null()).then_some(handle)
}

/// Returns the handle of the module that contains this crate's code.
pub fn current_module_handle() -> Option<ModuleHandle> {
    platform::current_module_handle()
}

/// Returns the on-disk path of the module that contains this crate's code.
pub fn current_module_path() -> Option<PathBuf> {
    platform::current_module_path()
}

#[cfg(unix)]
mod platform {
    use super::ModuleHandle;
    use std::ffi::{c_void, CStr, CString, OsStr};
    use std::os::unix::ffi::OsStrExt;
    use std::path::{Path, PathBuf};

    pub(super) fn symbol_address(module: ModuleHandle, symbol: &CStr) -> usize {
        // SAFETY: `module` came from the dynamic loader and `symbol` is NUL-terminated.
        unsafe { libc::dlsym(module.as_ptr(), symbol.as_ptr()) as usize }
    }

    pub(super) fn load_library(path: &Path) -> Option<ModuleHandle> {
        let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
        // SAFETY: `c_path` is a valid NUL-terminated path.
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        Some(ModuleHandle::from_ptr(handle))
    }

    fn self_info() -> Option<libc::Dl_info> {
        let anchor = self_info as fn() -> Option<libc::Dl_info> as *const c_void;
        let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
        // SAFETY: `anchor` points into this module's text and `info` is writable.
        let found = unsafe { libc::dladdr(anchor, &mut info) };
        (found != 0 && !info.dli_fname.is_null()).then_some(info)
    }

    pub(super) fn current_module_path() -> Option<PathBuf> {
        let info = self_info()?;
        // SAFETY: `dli_fname` is a NUL-terminated string owned by the loader.
        let name = unsafe { CStr::from_ptr(info.dli_fname) };
        Some(PathBuf::from(OsStr::from_bytes(name.to_bytes())))
    }

    pub(super) fn current_module_handle() -> Option<ModuleHandle> {
        let info = self_info()?;
        // SAFETY: RTLD_NOLOAD only returns a handle to an already-mapped module.
        let handle = unsafe { libc::dlopen(info.dli_fname, libc::RTLD_LAZY | libc::RTLD_NOLOAD) };
        (!handle.is_null()).then(|| ModuleHandle::from_ptr(handle))
    }
}

#[cfg(windows)]
mod platform {
    use super::ModuleHandle;
    use std::ffi::{c_void, CStr};
    use std::path::{Path, PathBuf};
    use widestring::U16CString;
    use windows_sys::Win32::Foundation::HMODULE;
    use windows_sys::Win32::System::LibraryLoader::{
        GetModuleFileNameW, GetModuleHandleExW, GetProcAddress, LoadLibraryW,
        GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS, GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
    };

    const MAX_MODULE_PATH: usize = 32 * 1024;

    pub(super) fn symbol_address(module: ModuleHandle, symbol: &CStr) -> usize {
        // SAFETY: `module` is a loaded module and `symbol` is NUL-terminated.
        unsafe { GetProcAddress(module.as_ptr() as HMODULE, symbol.as_ptr() as *const u8) }
            .map_or(0, |function| function as usize)
    }

    pub(super) fn load_library(path: &Path) -> Option<ModuleHandle> {
        let wide = U16CString::from_os_str(path.as_os_str()).ok()?;
        // SAFETY: `wide` is a valid NUL-terminated UTF-16 path.
        let handle = unsafe { LoadLibraryW(wide.as_ptr()) };
        Some(ModuleHandle::from_ptr(handle as *mut c_void))
    }

    pub(super) fn current_module_handle() -> Option<ModuleHandle> {
        let anchor = current_module_handle as fn() -> Option<ModuleHandle> as *const u16;
        let mut module: HMODULE = std::ptr::null_mut();
        // SAFETY: `anchor` points into this module's text and `module` is writable.
        let found = unsafe {
            GetModuleHandleExW(
                GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS
                    | GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
                anchor,
                &mut module,
            )
        };
        (found != 0 && !module.is_null()).then(|| ModuleHandle::from_ptr(module as *mut c_void))
    }

    pub(super) fn current_module_path() -> Option<PathBuf> {
        let module = current_module_handle()?;
        let mut buffer = vec![0_u16; MAX_MODULE_PATH];
        // SAFETY: `buffer` holds `MAX_MODULE_PATH` writable UTF-16 units.
        let len = unsafe {
            GetModuleFileNameW(
                module.as_ptr() as HMODULE,
                buffer.as_mut_ptr(),
                MAX_MODULE_PATH as u32,
            )
        } as usize;
        if len == 0 {
            return None;
        }
        let wide = widestring::U16Str::from_slice(&buffer[..len]);
        Some(PathBuf::from(wide.to_os_string()))
    }
}
