//! Native AOT runtime surface: the [`Il2CppRuntime`] seam and [`Il2CppLib`].

use crate::native::{ExportLookup, ModuleHandle};
use crate::runtime::{require_export, BackendError};
use std::ffi::{c_char, c_void, CStr};

pub trait Il2CppRuntime: Send + Sync {
    fn module(&self) -> ModuleHandle;

    /// # Safety
    /// `domain_name` must be null or a valid C string.
    unsafe fn init(&self, domain_name: *const c_char) -> usize;

    /// # Safety
    /// Arguments must satisfy the runtime's invoke contract for `method`.
    unsafe fn runtime_invoke(
        &self,
        method: usize,
        obj: usize,
        params: *mut *mut c_void,
        exception: *mut *mut c_void,
    ) -> usize;

    fn method_name(&self, method: usize) -> Option<String>;
}

type InitFn = unsafe extern "C" fn(*const c_char) -> *mut c_void;
type RuntimeInvokeFn =
    unsafe extern "C" fn(*mut c_void, *mut c_void, *mut *mut c_void, *mut *mut c_void) -> *mut c_void;
type MethodGetNameFn = unsafe extern "C" fn(*mut c_void) -> *const c_char;

#[derive(Debug, Clone, Copy)]
pub struct Il2CppLib {
    module: ModuleHandle,
    init: InitFn,
    runtime_invoke: RuntimeInvokeFn,
    method_get_name: MethodGetNameFn,
}

impl Il2CppLib {
    /// # Errors
    /// - `MissingExport` naming the first required symbol not found.
    pub fn resolve(lookup: &dyn ExportLookup, module: ModuleHandle) -> Result<Self, BackendError> {
        let init = require_export(lookup, module, "il2cpp_init")?;
        let runtime_invoke = require_export(lookup, module, "il2cpp_runtime_invoke")?;
        let method_get_name = require_export(lookup, module, "il2cpp_method_get_name")?;
        // SAFETY: each export has the C signature of the matching field type.
        unsafe {
            Ok(Self {
                module,
                init: std::mem::transmute::<usize, InitFn>(init),
                runtime_invoke: std::mem::transmute::<usize, RuntimeInvokeFn>(runtime_invoke),
                method_get_name: std::mem::transmute::<usize, MethodGetNameFn>(method_get_name),
            })
        }
    }
}

impl Il2CppRuntime for Il2CppLib {
    fn module(&self) -> ModuleHandle {
        self.module
    }

    unsafe fn init(&self, domain_name: *const c_char) -> usize {
        (self.init)(domain_name) as usize
    }

    unsafe fn runtime_invoke(
        &self,
        method: usize,
        obj: usize,
        params: *mut *mut c_void,
        exception: *mut *mut c_void,
    ) -> usize {
        (self.runtime_invoke)(method as *mut c_void, obj as *mut c_void, params, exception) as usize
    }

    fn method_name(&self, method: usize) -> Option<String> {
        if method == 0 {
            return None;
        }
        // SAFETY: `method` is a runtime method handle; the name is runtime-owned.
        let name = unsafe { (self.method_get_name)(method as *mut c_void) };
        (!name.is_null()).then(|| unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned())
    }
}
