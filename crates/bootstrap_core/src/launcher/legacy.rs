//! Legacy strategy: open the managed assembly inside the already running
//! scripting VM and call its initializer by name.

use super::{legacy_assembly_path, InRuntimeLauncher, LaunchContext, LaunchError};
use crate::runtime::mono::MonoRuntime;
use log::{debug, info, warn};
use std::ffi::{c_void, CStr, CString};

const INTEROP_NAMESPACE: &CStr = c"MelonLoader.InternalUtils";
const INTEROP_CLASS: &CStr = c"BootstrapInterop";
const INITIALIZE_METHOD: &CStr = c"Initialize";
const RESOLVER_NAMESPACE: &CStr = c"MelonLoader.Resolver";
const RESOLVER_CLASS: &CStr = c"AssemblyManager";
const SEARCH_METHOD: &CStr = c"SearchAssembly";
const SEARCH_METHOD_PARAMS: i32 = 5;

#[derive(Debug, Default, Clone, Copy)]
pub struct LegacyAssemblyLauncher;

impl LegacyAssemblyLauncher {
    fn lookup_method<R: MonoRuntime + ?Sized>(
        runtime: &R,
        image: usize,
        namespace: &CStr,
        class: &CStr,
        method: &CStr,
        params: i32,
    ) -> Result<usize, LaunchError> {
        let missing = || {
            LaunchError::ManagedMemberMissing(format!(
                "{}.{}::{}",
                namespace.to_string_lossy(),
                class.to_string_lossy(),
                method.to_string_lossy()
            ))
        };
        let class = runtime.class_from_name(image, namespace, class);
        if class == 0 {
            return Err(missing());
        }
        match runtime.class_get_method_from_name(class, method, params) {
            0 => Err(missing()),
            found => Ok(found),
        }
    }
}

impl<R: MonoRuntime + ?Sized> InRuntimeLauncher<R> for LegacyAssemblyLauncher {
    fn name(&self) -> &'static str {
        "legacy_assembly"
    }

    fn launch(&self, runtime: &R, domain: usize, context: &LaunchContext) -> Result<Option<usize>, LaunchError> {
        let path = legacy_assembly_path(&context.base_dir);
        if !path.is_file() {
            return Err(LaunchError::HostBinaryMissing(path));
        }
        let c_path = CString::new(path.to_string_lossy().into_owned())
            .map_err(|err| LaunchError::ManagedEntryFailed(err.to_string()))?;

        debug!(
            "event=managed_assembly_open module=launcher status=start path={}",
            path.display()
        );
        let assembly = runtime.domain_assembly_open(domain, &c_path);
        if assembly == 0 {
            return Err(LaunchError::ManagedEntryFailed(format!(
                "runtime refused to load `{}`",
                path.display()
            )));
        }
        let image = runtime.assembly_get_image(assembly);

        let initialize =
            Self::lookup_method(runtime, image, INTEROP_NAMESPACE, INTEROP_CLASS, INITIALIZE_METHOD, 1)?;
        let resolver = match Self::lookup_method(
            runtime,
            image,
            RESOLVER_NAMESPACE,
            RESOLVER_CLASS,
            SEARCH_METHOD,
            SEARCH_METHOD_PARAMS,
        ) {
            Ok(search) => Some(search),
            Err(err) => {
                warn!(
                    "event=managed_resolver module=launcher status=skip error={}",
                    err
                );
                None
            }
        };

        let mut bootstrap_handle = context.bootstrap_module.addr();
        let mut params = [&mut bootstrap_handle as *mut usize as *mut c_void];
        info!(
            "event=managed_initialize module=launcher status=start method={}",
            runtime
                .method_name(initialize)
                .unwrap_or_else(|| "Initialize".to_string())
        );
        // SAFETY: `Initialize` takes a single by-ref native handle.
        unsafe { runtime.runtime_invoke(initialize, 0, params.as_mut_ptr()) }.map_err(
            |exception| {
                LaunchError::ManagedEntryFailed(format!(
                    "Initialize threw exception object {exception:#x}"
                ))
            },
        )?;
        info!("event=managed_initialize module=launcher status=ok");
        Ok(resolver)
    }
}
