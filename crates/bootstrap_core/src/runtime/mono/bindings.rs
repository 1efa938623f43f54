//! Scripting VM native surface: the [`MonoRuntime`] seam and its export-table
//! implementation [`MonoLib`].

use crate::native::{ExportLookup, ModuleHandle};
use crate::runtime::{require_export, BackendError};
use std::ffi::{c_char, c_int, c_void, CStr};

/// `MONO_DEBUG_FORMAT_MONO`
pub const DEBUG_FORMAT_MONO: c_int = 1;

/// Assembly reference as passed to search hooks.
#[repr(C)]
#[derive(Debug)]
pub struct MonoAssemblyName {
    pub name: *const c_char,
    pub culture: *const c_char,
    pub hash_value: *const c_char,
    pub public_key: *const u8,
    pub public_key_token: [u8; 17],
    pub hash_alg: u32,
    pub hash_len: u32,
    pub flags: u32,
    pub major: u16,
    pub minor: u16,
    pub build: u16,
    pub revision: u16,
    pub arch: u32,
}

/// Managed `System.Reflection.Assembly` object header.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MonoReflectionAssembly {
    pub vtable: usize,
    pub sync: usize,
    pub assembly: usize,
    pub evidence: usize,
}

pub type AssemblySearchHookFn =
    unsafe extern "C" fn(name: *mut MonoAssemblyName, user_data: *mut c_void) -> *mut c_void;

/// Requested assembly: simple name plus major/minor/build/revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyIdentity {
    pub name: String,
    pub version: [u16; 4],
}

impl AssemblyIdentity {
    /// # Safety
    /// `raw` must be null or point to a live assembly name.
    pub unsafe fn from_raw(raw: *const MonoAssemblyName) -> Option<Self> {
        let raw = raw.as_ref()?;
        if raw.name.is_null() {
            return None;
        }
        Some(Self {
            name: CStr::from_ptr(raw.name).to_string_lossy().into_owned(),
            version: [raw.major, raw.minor, raw.build, raw.revision],
        })
    }
}

/// Runtime entry points the scripting VM handler drives.
///
/// Pointer-typed values (`usize`) are opaque runtime objects.
pub trait MonoRuntime: Send + Sync {
    fn module(&self) -> ModuleHandle;

    /// # Safety
    /// `argv` must hold `argc` valid C strings.
    unsafe fn jit_parse_options(&self, argc: c_int, argv: *mut *mut c_char);
    fn debug_init(&self, format: c_int);
    /// False when the runtime lacks the query.
    fn debug_enabled(&self) -> bool;

    /// # Safety
    /// Both arguments must be null or valid C strings.
    unsafe fn jit_init_version(&self, domain_name: *const c_char, runtime_version: *const c_char) -> usize;

    /// # Safety
    /// Arguments must satisfy the runtime's image-open contract.
    unsafe fn image_open_from_data_with_name(
        &self,
        data: *mut c_char,
        data_len: u32,
        need_copy: c_int,
        status: *mut c_int,
        refonly: c_int,
        name: *const c_char,
    ) -> usize;

    fn set_assemblies_path(&self, path: &CStr);
    fn assembly_root_dir(&self) -> Option<String>;
    fn thread_current(&self) -> usize;
    fn thread_set_main(&self, thread: usize);
    /// Returns false when the runtime lacks domain configuration.
    fn domain_set_config(&self, domain: usize, base_dir: &CStr, config_file: &CStr) -> bool;
    fn config_parse(&self);

    fn domain_assembly_open(&self, domain: usize, path: &CStr) -> usize;
    fn assembly_get_image(&self, assembly: usize) -> usize;
    fn class_from_name(&self, image: usize, namespace: &CStr, name: &CStr) -> usize;
    fn class_get_method_from_name(&self, class: usize, name: &CStr, param_count: c_int) -> usize;
    fn method_name(&self, method: usize) -> Option<String>;
    fn string_new(&self, domain: usize, text: &CStr) -> usize;

    /// Invokes `method`; `Err` carries the thrown exception object.
    ///
    /// # Safety
    /// `params` must match the method's parameter list.
    unsafe fn runtime_invoke(&self, method: usize, obj: usize, params: *mut *mut c_void) -> Result<usize, usize>;

    fn install_assembly_search_hook(&self, hook: AssemblySearchHookFn, user_data: usize);
}

type JitParseOptionsFn = unsafe extern "C" fn(c_int, *mut *mut c_char);
type DebugInitFn = unsafe extern "C" fn(c_int);
type DebugEnabledFn = unsafe extern "C" fn() -> c_int;
type JitInitVersionFn = unsafe extern "C" fn(*const c_char, *const c_char) -> *mut c_void;
type ImageOpenFromDataWithNameFn =
    unsafe extern "C" fn(*mut c_char, u32, c_int, *mut c_int, c_int, *const c_char) -> *mut c_void;
type SetAssembliesPathFn = unsafe extern "C" fn(*const c_char);
type AssemblyGetRootDirFn = unsafe extern "C" fn() -> *const c_char;
type ThreadCurrentFn = unsafe extern "C" fn() -> *mut c_void;
type ThreadSetMainFn = unsafe extern "C" fn(*mut c_void);
type DomainSetConfigFn = unsafe extern "C" fn(*mut c_void, *const c_char, *const c_char);
type ConfigParseFn = unsafe extern "C" fn(*const c_char);
type DomainAssemblyOpenFn = unsafe extern "C" fn(*mut c_void, *const c_char) -> *mut c_void;
type AssemblyGetImageFn = unsafe extern "C" fn(*mut c_void) -> *mut c_void;
type ClassFromNameFn = unsafe extern "C" fn(*mut c_void, *const c_char, *const c_char) -> *mut c_void;
type ClassGetMethodFromNameFn = unsafe extern "C" fn(*mut c_void, *const c_char, c_int) -> *mut c_void;
type MethodGetNameFn = unsafe extern "C" fn(*mut c_void) -> *const c_char;
type StringNewFn = unsafe extern "C" fn(*mut c_void, *const c_char) -> *mut c_void;
type RuntimeInvokeFn =
    unsafe extern "C" fn(*mut c_void, *mut c_void, *mut *mut c_void, *mut *mut c_void) -> *mut c_void;
type InstallAssemblySearchHookFn = unsafe extern "C" fn(AssemblySearchHookFn, *mut c_void);

/// Binds a required export to the function-pointer type of the receiving field.
macro_rules! bind_export {
    ($lookup:expr, $module:expr, $symbol:literal) => {{
        let address = require_export($lookup, $module, $symbol)?;
        // SAFETY: the runtime exports `$symbol` with the C signature of the field.
        unsafe { std::mem::transmute::<usize, _>(address) }
    }};
}

/// Export table of a loaded scripting VM library.
#[derive(Debug, Clone, Copy)]
pub struct MonoLib {
    module: ModuleHandle,
    jit_parse_options: JitParseOptionsFn,
    debug_init: DebugInitFn,
    jit_init_version: JitInitVersionFn,
    image_open_from_data_with_name: ImageOpenFromDataWithNameFn,
    set_assemblies_path: SetAssembliesPathFn,
    assembly_getrootdir: AssemblyGetRootDirFn,
    thread_current: ThreadCurrentFn,
    thread_set_main: ThreadSetMainFn,
    config_parse: ConfigParseFn,
    domain_assembly_open: DomainAssemblyOpenFn,
    assembly_get_image: AssemblyGetImageFn,
    class_from_name: ClassFromNameFn,
    class_get_method_from_name: ClassGetMethodFromNameFn,
    method_get_name: MethodGetNameFn,
    string_new: StringNewFn,
    runtime_invoke: RuntimeInvokeFn,
    install_assembly_search_hook: InstallAssemblySearchHookFn,
    debug_enabled: Option<DebugEnabledFn>,
    domain_set_config: Option<DomainSetConfigFn>,
}

impl MonoLib {
    /// Binds every required export of `module`; optional ones may be absent.
    ///
    /// # Errors
    /// - `MissingExport` naming the first required symbol not found.
    pub fn resolve(lookup: &dyn ExportLookup, module: ModuleHandle) -> Result<Self, BackendError> {
        let debug_enabled = lookup
            .find_export(module, "mono_debug_enabled")
            // SAFETY: `mono_debug_enabled` is `mono_bool (void)`.
            .map(|address| unsafe { std::mem::transmute::<usize, DebugEnabledFn>(address) });
        let domain_set_config = lookup
            .find_export(module, "mono_domain_set_config")
            // SAFETY: `mono_domain_set_config` is `void (MonoDomain*, const char*, const char*)`.
            .map(|address| unsafe { std::mem::transmute::<usize, DomainSetConfigFn>(address) });

        Ok(Self {
            module,
            jit_init_version: bind_export!(lookup, module, "mono_jit_init_version"),
            runtime_invoke: bind_export!(lookup, module, "mono_runtime_invoke"),
            jit_parse_options: bind_export!(lookup, module, "mono_jit_parse_options"),
            debug_init: bind_export!(lookup, module, "mono_debug_init"),
            image_open_from_data_with_name: bind_export!(
                lookup,
                module,
                "mono_image_open_from_data_with_name"
            ),
            config_parse: bind_export!(lookup, module, "mono_config_parse"),
            thread_current: bind_export!(lookup, module, "mono_thread_current"),
            thread_set_main: bind_export!(lookup, module, "mono_thread_set_main"),
            string_new: bind_export!(lookup, module, "mono_string_new"),
            method_get_name: bind_export!(lookup, module, "mono_method_get_name"),
            set_assemblies_path: bind_export!(lookup, module, "mono_set_assemblies_path"),
            assembly_getrootdir: bind_export!(lookup, module, "mono_assembly_getrootdir"),
            domain_assembly_open: bind_export!(lookup, module, "mono_domain_assembly_open"),
            assembly_get_image: bind_export!(lookup, module, "mono_assembly_get_image"),
            class_from_name: bind_export!(lookup, module, "mono_class_from_name"),
            class_get_method_from_name: bind_export!(
                lookup,
                module,
                "mono_class_get_method_from_name"
            ),
            install_assembly_search_hook: bind_export!(
                lookup,
                module,
                "mono_install_assembly_search_hook"
            ),
            debug_enabled,
            domain_set_config,
        })
    }
}

unsafe fn owned_c_string(ptr: *const c_char) -> Option<String> {
    (!ptr.is_null()).then(|| CStr::from_ptr(ptr).to_string_lossy().into_owned())
}

// SAFETY (all calls below): every pointer was bound from the runtime's export
// table with its documented C signature; object arguments originate from the
// same runtime.
impl MonoRuntime for MonoLib {
    fn module(&self) -> ModuleHandle {
        self.module
    }

    unsafe fn jit_parse_options(&self, argc: c_int, argv: *mut *mut c_char) {
        (self.jit_parse_options)(argc, argv)
    }

    fn debug_init(&self, format: c_int) {
        unsafe { (self.debug_init)(format) }
    }

    fn debug_enabled(&self) -> bool {
        self.debug_enabled
            .is_some_and(|debug_enabled| unsafe { debug_enabled() } != 0)
    }

    unsafe fn jit_init_version(&self, domain_name: *const c_char, runtime_version: *const c_char) -> usize {
        (self.jit_init_version)(domain_name, runtime_version) as usize
    }

    unsafe fn image_open_from_data_with_name(
        &self,
        data: *mut c_char,
        data_len: u32,
        need_copy: c_int,
        status: *mut c_int,
        refonly: c_int,
        name: *const c_char,
    ) -> usize {
        (self.image_open_from_data_with_name)(data, data_len, need_copy, status, refonly, name) as usize
    }

    fn set_assemblies_path(&self, path: &CStr) {
        unsafe { (self.set_assemblies_path)(path.as_ptr()) }
    }

    fn assembly_root_dir(&self) -> Option<String> {
        unsafe { owned_c_string((self.assembly_getrootdir)()) }
    }

    fn thread_current(&self) -> usize {
        unsafe { (self.thread_current)() as usize }
    }

    fn thread_set_main(&self, thread: usize) {
        unsafe { (self.thread_set_main)(thread as *mut c_void) }
    }

    fn domain_set_config(&self, domain: usize, base_dir: &CStr, config_file: &CStr) -> bool {
        let Some(domain_set_config) = self.domain_set_config else {
            return false;
        };
        unsafe { domain_set_config(domain as *mut c_void, base_dir.as_ptr(), config_file.as_ptr()) };
        true
    }

    fn config_parse(&self) {
        unsafe { (self.config_parse)(std::ptr::null()) }
    }

    fn domain_assembly_open(&self, domain: usize, path: &CStr) -> usize {
        unsafe { (self.domain_assembly_open)(domain as *mut c_void, path.as_ptr()) as usize }
    }

    fn assembly_get_image(&self, assembly: usize) -> usize {
        if assembly == 0 {
            return 0;
        }
        unsafe { (self.assembly_get_image)(assembly as *mut c_void) as usize }
    }

    fn class_from_name(&self, image: usize, namespace: &CStr, name: &CStr) -> usize {
        if image == 0 {
            return 0;
        }
        unsafe { (self.class_from_name)(image as *mut c_void, namespace.as_ptr(), name.as_ptr()) as usize }
    }

    fn class_get_method_from_name(&self, class: usize, name: &CStr, param_count: c_int) -> usize {
        if class == 0 {
            return 0;
        }
        unsafe {
            (self.class_get_method_from_name)(class as *mut c_void, name.as_ptr(), param_count) as usize
        }
    }

    fn method_name(&self, method: usize) -> Option<String> {
        if method == 0 {
            return None;
        }
        unsafe { owned_c_string((self.method_get_name)(method as *mut c_void)) }
    }

    fn string_new(&self, domain: usize, text: &CStr) -> usize {
        unsafe { (self.string_new)(domain as *mut c_void, text.as_ptr()) as usize }
    }

    unsafe fn runtime_invoke(&self, method: usize, obj: usize, params: *mut *mut c_void) -> Result<usize, usize> {
        let mut exception: *mut c_void = std::ptr::null_mut();
        let result = (self.runtime_invoke)(method as *mut c_void, obj as *mut c_void, params, &mut exception);
        if exception.is_null() {
            Ok(result as usize)
        } else {
            Err(exception as usize)
        }
    }

    fn install_assembly_search_hook(&self, hook: AssemblySearchHookFn, user_data: usize) {
        unsafe { (self.install_assembly_search_hook)(hook, user_data as *mut c_void) }
    }
}

#[cfg(test)]
mod tests {
    use super::{AssemblyIdentity, MonoAssemblyName, MonoLib};
    use crate::native::{ExportLookup, ModuleHandle};
    use crate::runtime::BackendError;
    use std::ffi::CString;

    struct Exports(&'static [&'static str]);

    impl ExportLookup for Exports {
        fn find_export(&self, _module: ModuleHandle, name: &str) -> Option<usize> {
            self.0.contains(&name).then_some(0x1000)
        }
    }

    #[test]
    fn resolve_reports_first_missing_required_export() {
        let lookup = Exports(&["mono_jit_init_version", "mono_debug_enabled"]);
        let err = MonoLib::resolve(&lookup, ModuleHandle::from_addr(1)).expect_err("incomplete runtime");
        assert_eq!(
            err,
            BackendError::MissingExport {
                symbol: "mono_runtime_invoke".to_string()
            }
        );
    }

    #[test]
    fn identity_reads_name_and_version() {
        let name = CString::new("System.Core").expect("c string");
        let raw = MonoAssemblyName {
            name: name.as_ptr(),
            culture: std::ptr::null(),
            hash_value: std::ptr::null(),
            public_key: std::ptr::null(),
            public_key_token: [0; 17],
            hash_alg: 0,
            hash_len: 0,
            flags: 0,
            major: 3,
            minor: 5,
            build: 0,
            revision: 0,
            arch: 0,
        };
        let identity = unsafe { AssemblyIdentity::from_raw(&raw) }.expect("identity");
        assert_eq!(identity.name, "System.Core");
        assert_eq!(identity.version, [3, 5, 0, 0]);
        assert_eq!(unsafe { AssemblyIdentity::from_raw(std::ptr::null()) }, None);
    }
}
