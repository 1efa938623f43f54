//! Modern strategy: start a hosted managed runtime through the native hosting
//! component (`hostfxr`) and retrieve the managed start function.
//!
//! # Invariants
//! - The runtime config and managed host binary must exist before the hosting
//!   component is even looked up.
//! - The managed entry receives a slot pre-filled with the bootstrap module
//!   handle; an untouched or zeroed slot is a failed launch.

use super::{
    bundled_dotnet_root, native_host_path, runtime_config_path, LaunchContext, LaunchError,
    ManagedEntryPoint, ManagedHostLauncher,
};
use crate::native::{load_library, ExportLookup, NativeExportTable};
use log::{debug, info, warn};
use serde::Deserialize;
use std::ffi::c_void;
use std::path::{Path, PathBuf};

const NATIVE_ENTRY_TYPE: &str = "MelonLoader.NativeHost.NativeEntryPoint, MelonLoader.NativeHost";
const NATIVE_ENTRY_METHOD: &str = "NativeEntry";
/// `hdt_load_assembly_and_get_function_pointer`
const DELEGATE_LOAD_ASSEMBLY_AND_GET_FUNCTION_POINTER: i32 = 5;

#[cfg(windows)]
const HOSTFXR_FILE_NAME: &str = "hostfxr.dll";
#[cfg(target_os = "macos")]
const HOSTFXR_FILE_NAME: &str = "libhostfxr.dylib";
#[cfg(all(unix, not(target_os = "macos")))]
const HOSTFXR_FILE_NAME: &str = "libhostfxr.so";

#[cfg(windows)]
type CharT = u16;
#[cfg(not(windows))]
type CharT = std::ffi::c_char;

type InitializeForRuntimeConfigFn =
    unsafe extern "C" fn(*const CharT, *const c_void, *mut *mut c_void) -> i32;
type GetRuntimeDelegateFn = unsafe extern "C" fn(*mut c_void, i32, *mut *mut c_void) -> i32;
type CloseFn = unsafe extern "C" fn(*mut c_void) -> i32;
type LoadAssemblyAndGetFunctionPointerFn = unsafe extern "system" fn(
    *const CharT,
    *const CharT,
    *const CharT,
    *const CharT,
    *mut c_void,
    *mut *mut c_void,
) -> i32;
type NativeEntryFn = unsafe extern "system" fn(*mut usize);

/// Shape of `*.runtimeconfig.json` this launcher relies on.
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfigFile {
    #[serde(rename = "runtimeOptions")]
    pub runtime_options: RuntimeOptions,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeOptions {
    #[serde(default)]
    pub tfm: Option<String>,
    #[serde(default)]
    pub framework: Option<FrameworkReference>,
    #[serde(default)]
    pub frameworks: Vec<FrameworkReference>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FrameworkReference {
    pub name: String,
    pub version: String,
}

impl RuntimeOptions {
    pub fn framework_references(&self) -> impl Iterator<Item = &FrameworkReference> {
        self.framework.iter().chain(self.frameworks.iter())
    }
}

/// Parses and validates a runtime config file.
pub fn read_runtime_config(path: &Path) -> Result<RuntimeConfigFile, LaunchError> {
    let invalid = |reason: String| LaunchError::InvalidRuntimeConfig {
        path: path.to_path_buf(),
        reason,
    };
    let text = std::fs::read_to_string(path).map_err(|err| invalid(err.to_string()))?;
    serde_json::from_str(&text).map_err(|err| invalid(err.to_string()))
}

/// Finds the hosting component under `roots`, picking the highest
/// `host/fxr/<version>` directory of the first root that has one.
pub fn locate_hostfxr(roots: &[PathBuf]) -> Option<PathBuf> {
    roots.iter().find_map(|root| {
        let fxr_dir = root.join("host").join("fxr");
        let entries = std::fs::read_dir(&fxr_dir).ok()?;
        entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                let version = parse_version(&name)?;
                let candidate = entry.path().join(HOSTFXR_FILE_NAME);
                candidate.is_file().then_some((version, candidate))
            })
            .max_by(|left, right| left.0.cmp(&right.0))
            .map(|(_, path)| path)
    })
}

/// `8.0.11` -> `[8, 0, 11]`; prerelease suffixes are ignored.
fn parse_version(name: &str) -> Option<Vec<u64>> {
    let release = name.split('-').next()?;
    release
        .split('.')
        .map(|part| part.parse::<u64>().ok())
        .collect::<Option<Vec<_>>>()
        .filter(|parts| !parts.is_empty())
}

/// Platform install locations consulted after the bundled runtime.
pub fn default_dotnet_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if let Some(root) = std::env::var_os("DOTNET_ROOT").filter(|value| !value.is_empty()) {
        roots.push(PathBuf::from(root));
    }
    #[cfg(windows)]
    {
        let program_files = std::env::var_os("ProgramFiles")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(r"C:\Program Files"));
        roots.push(program_files.join("dotnet"));
    }
    #[cfg(target_os = "macos")]
    roots.push(PathBuf::from("/usr/local/share/dotnet"));
    #[cfg(all(unix, not(target_os = "macos")))]
    {
        roots.push(PathBuf::from("/usr/share/dotnet"));
        roots.push(PathBuf::from("/usr/lib/dotnet"));
    }
    roots
}

/// NUL-terminated string in the hosting component's native character type.
struct HostString(Vec<CharT>);

impl HostString {
    #[cfg(windows)]
    fn new(text: &str) -> Result<Self, LaunchError> {
        let wide = widestring::U16CString::from_str(text)
            .map_err(|err| LaunchError::ManagedEntryFailed(err.to_string()))?;
        Ok(Self(wide.into_vec_with_nul()))
    }

    #[cfg(not(windows))]
    fn new(text: &str) -> Result<Self, LaunchError> {
        let narrow = std::ffi::CString::new(text)
            .map_err(|err| LaunchError::ManagedEntryFailed(err.to_string()))?;
        Ok(Self(
            narrow
                .into_bytes_with_nul()
                .into_iter()
                .map(|byte| byte as CharT)
                .collect(),
        ))
    }

    fn from_path(path: &Path) -> Result<Self, LaunchError> {
        Self::new(&path.to_string_lossy())
    }

    fn as_ptr(&self) -> *const CharT {
        self.0.as_ptr()
    }
}

struct HostingComponent {
    initialize: InitializeForRuntimeConfigFn,
    get_delegate: GetRuntimeDelegateFn,
    close: CloseFn,
}

impl HostingComponent {
    fn load(path: &Path) -> Result<Self, LaunchError> {
        let module = load_library(path).ok_or_else(|| {
            LaunchError::HostingComponentUnavailable(format!("cannot load `{}`", path.display()))
        })?;
        let bind = |symbol: &str| {
            NativeExportTable.find_export(module, symbol).ok_or_else(|| {
                LaunchError::HostingComponentUnavailable(format!("`{symbol}` is not exported"))
            })
        };
        let initialize = bind("hostfxr_initialize_for_runtime_config")?;
        let get_delegate = bind("hostfxr_get_runtime_delegate")?;
        let close = bind("hostfxr_close")?;
        // SAFETY: the addresses are the hosting component's documented C exports.
        unsafe {
            Ok(Self {
                initialize: std::mem::transmute::<usize, InitializeForRuntimeConfigFn>(initialize),
                get_delegate: std::mem::transmute::<usize, GetRuntimeDelegateFn>(get_delegate),
                close: std::mem::transmute::<usize, CloseFn>(close),
            })
        }
    }

    /// Initializes a host context and returns the load-assembly delegate.
    fn load_assembly_delegate(
        &self,
        runtime_config: &HostString,
    ) -> Result<LoadAssemblyAndGetFunctionPointerFn, LaunchError> {
        let mut context: *mut c_void = std::ptr::null_mut();
        // SAFETY: the config path is NUL-terminated and `context` is writable.
        let status = unsafe { (self.initialize)(runtime_config.as_ptr(), std::ptr::null(), &mut context) };
        if status < 0 || context.is_null() {
            return Err(LaunchError::HostingCall {
                call: "hostfxr_initialize_for_runtime_config",
                status,
            });
        }

        let mut delegate: *mut c_void = std::ptr::null_mut();
        // SAFETY: `context` is the live handle returned above.
        let status = unsafe {
            (self.get_delegate)(
                context,
                DELEGATE_LOAD_ASSEMBLY_AND_GET_FUNCTION_POINTER,
                &mut delegate,
            )
        };
        // SAFETY: the delegate outlives the context handle once retrieved.
        unsafe { (self.close)(context) };
        if status < 0 || delegate.is_null() {
            return Err(LaunchError::HostingCall {
                call: "hostfxr_get_runtime_delegate",
                status,
            });
        }
        // SAFETY: delegate type 5 has the load-assembly-and-get-function-pointer signature.
        Ok(unsafe { std::mem::transmute::<*mut c_void, LoadAssemblyAndGetFunctionPointerFn>(delegate) })
    }
}

#[derive(Debug, Clone, Default)]
pub struct HostfxrLauncher {
    search_roots: Option<Vec<PathBuf>>,
}

impl HostfxrLauncher {
    /// Searches the bundled runtime, then `DOTNET_ROOT`, then platform defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Searches the bundled runtime, then only `roots`.
    pub fn with_search_roots(roots: Vec<PathBuf>) -> Self {
        Self {
            search_roots: Some(roots),
        }
    }

    fn roots(&self, base_dir: &Path) -> Vec<PathBuf> {
        let mut roots = vec![bundled_dotnet_root(base_dir)];
        match &self.search_roots {
            Some(explicit) => roots.extend(explicit.iter().cloned()),
            None => roots.extend(default_dotnet_roots()),
        }
        roots
    }
}

impl ManagedHostLauncher for HostfxrLauncher {
    fn name(&self) -> &'static str {
        "hostfxr"
    }

    fn launch(&self, context: &LaunchContext) -> Result<Option<ManagedEntryPoint>, LaunchError> {
        let config_path = runtime_config_path(&context.base_dir);
        let host_path = native_host_path(&context.base_dir);
        if !config_path.is_file() {
            return Err(LaunchError::ConfigFileMissing(config_path));
        }
        if !host_path.is_file() {
            return Err(LaunchError::HostBinaryMissing(host_path));
        }

        let config = read_runtime_config(&config_path)?;
        for framework in config.runtime_options.framework_references() {
            debug!(
                "event=runtime_config module=launcher status=ok framework={} version={}",
                framework.name, framework.version
            );
        }

        let fxr_path = locate_hostfxr(&self.roots(&context.base_dir)).ok_or_else(|| {
            LaunchError::HostingComponentUnavailable(format!("no {HOSTFXR_FILE_NAME} found"))
        })?;
        info!(
            "event=hostfxr_load module=launcher status=start path={}",
            fxr_path.display()
        );
        let hosting = HostingComponent::load(&fxr_path)?;
        let load_assembly = hosting.load_assembly_delegate(&HostString::from_path(&config_path)?)?;

        let assembly = HostString::from_path(&host_path)?;
        let type_name = HostString::new(NATIVE_ENTRY_TYPE)?;
        let method_name = HostString::new(NATIVE_ENTRY_METHOD)?;
        // `UNMANAGEDCALLERSONLY_METHOD`
        let unmanaged_callers_only = usize::MAX as *const CharT;
        let mut entry: *mut c_void = std::ptr::null_mut();
        // SAFETY: every string is NUL-terminated and `entry` is writable.
        let status = unsafe {
            load_assembly(
                assembly.as_ptr(),
                type_name.as_ptr(),
                method_name.as_ptr(),
                unmanaged_callers_only,
                std::ptr::null_mut(),
                &mut entry,
            )
        };
        if status < 0 || entry.is_null() {
            return Err(LaunchError::HostingCall {
                call: "load_assembly_and_get_function_pointer",
                status,
            });
        }

        let bootstrap = context.bootstrap_module.addr();
        let mut start = bootstrap;
        // SAFETY: `NativeEntry` is an unmanaged-callers-only `void (ref nint)`.
        unsafe {
            let native_entry = std::mem::transmute::<*mut c_void, NativeEntryFn>(entry);
            native_entry(&mut start);
        }
        if start == 0 || start == bootstrap {
            warn!("event=managed_entry module=launcher status=error reason=no_start_function");
            return Err(LaunchError::ManagedEntryFailed(
                "managed entry did not return a start function".to_string(),
            ));
        }

        info!(
            "event=managed_entry module=launcher status=ok start={:#x}",
            start
        );
        Ok(ManagedEntryPoint::from_addr(start))
    }
}
