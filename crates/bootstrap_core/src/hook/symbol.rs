//! Redirection of the process-wide dynamic symbol resolver.
//!
//! # Responsibility
//! - Hold the immutable redirect table (symbol name -> init callback, detour).
//! - Decide, for every resolver call, whether to hand back the real address or
//!   a registered detour.
//! - Install the resolver hook itself, once per process.
//!
//! # Invariants
//! - Names absent from the table always resolve to the real address with no
//!   side effects.
//! - The init callback runs at most once per process, on the first redirect
//!   hit of any registered name, with the module handle of that lookup.
//! - A failing init callback disables redirection for the rest of the process;
//!   every later lookup is pass-through.
//! - No failure escapes [`SymbolResolutionInterceptor::resolve`].
//!
//! # See also
//! - `hook::import` for the slot rewrite that installs the resolver hook.
//! - `runtime` for the callbacks and detours registered here.

use crate::error::{BootstrapError, BootstrapResult};
use crate::guard::shielded;
use crate::hook::import::{ImportPatchReport, ImportTablePatcher};
use crate::hook::trampoline::HookError;
use crate::native::ModuleHandle;
use crate::runtime::BackendKind;
use log::{error, info, warn};
use once_cell::sync::OnceCell;
use std::collections::BTreeMap;
use std::ffi::{c_char, CStr};
use std::sync::atomic::{AtomicBool, Ordering};

/// Import name of the platform's dynamic symbol resolver.
#[cfg(windows)]
pub const RESOLVER_IMPORT: &str = "GetProcAddress";
#[cfg(not(windows))]
pub const RESOLVER_IMPORT: &str = "dlsym";

pub type InitCallback = Box<dyn Fn(ModuleHandle) -> BootstrapResult<()> + Send + Sync>;

/// One registered redirect.
pub struct SymbolRedirectEntry {
    symbol: String,
    backend: BackendKind,
    init: InitCallback,
    detour: usize,
}

impl SymbolRedirectEntry {
    pub fn new(
        symbol: impl Into<String>,
        backend: BackendKind,
        detour: usize,
        init: impl Fn(ModuleHandle) -> BootstrapResult<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            backend,
            init: Box::new(init),
            detour,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn detour(&self) -> usize {
        self.detour
    }
}

impl std::fmt::Debug for SymbolRedirectEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolRedirectEntry")
            .field("symbol", &self.symbol)
            .field("backend", &self.backend)
            .field("detour", &format_args!("{:#x}", self.detour))
            .finish_non_exhaustive()
    }
}

/// Redirect entries keyed by exported symbol name.
#[derive(Debug, Default)]
pub struct RedirectTable {
    entries: BTreeMap<String, SymbolRedirectEntry>,
}

impl RedirectTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one entry.
    ///
    /// # Errors
    /// - `Installation` when the symbol is already registered or the detour is
    ///   null.
    pub fn register(&mut self, entry: SymbolRedirectEntry) -> Result<(), HookError> {
        if entry.detour == 0 {
            return Err(HookError::Installation {
                target: 0,
                reason: format!("null detour for `{}`", entry.symbol),
            });
        }
        if self.entries.contains_key(&entry.symbol) {
            return Err(HookError::Installation {
                target: entry.detour,
                reason: format!("`{}` is already redirected", entry.symbol),
            });
        }
        self.entries.insert(entry.symbol.clone(), entry);
        Ok(())
    }

    pub fn get(&self, symbol: &str) -> Option<&SymbolRedirectEntry> {
        self.entries.get(symbol)
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Decides what every intercepted resolver call returns.
#[derive(Debug)]
pub struct SymbolResolutionInterceptor {
    table: RedirectTable,
    init_fired: AtomicBool,
    disabled: AtomicBool,
    installed: OnceCell<ImportPatchReport>,
}

impl SymbolResolutionInterceptor {
    pub fn new(table: RedirectTable) -> Self {
        Self {
            table,
            init_fired: AtomicBool::new(false),
            disabled: AtomicBool::new(false),
            installed: OnceCell::new(),
        }
    }

    pub fn table(&self) -> &RedirectTable {
        &self.table
    }

    /// Returns the address handed back to the caller for `symbol`.
    ///
    /// `real` is what the underlying resolver produced for the same request.
    /// A symbol the module does not actually export (`real == 0`) is never
    /// redirected: the host looks up optional runtime exports by name and
    /// treats null as "absent", and a detour for an absent export would
    /// forward into a runtime function that cannot be bound. Redirecting on
    /// the name alone would also fire the backend init callback against a
    /// module that is not the runtime.
    pub fn resolve(&self, module: ModuleHandle, symbol: &str, real: usize) -> usize {
        let Some(entry) = self.table.get(symbol) else {
            return real;
        };
        if real == 0 || self.disabled.load(Ordering::Relaxed) {
            return real;
        }

        // Plain load/store: concurrent first entry is an accepted race.
        if !self.init_fired.load(Ordering::Relaxed) {
            self.init_fired.store(true, Ordering::Relaxed);
            info!(
                "event=runtime_located module=symbol status=start symbol={} backend={} handle={:#x}",
                entry.symbol,
                entry.backend.as_str(),
                module.addr()
            );
            if shielded(&entry.symbol, || (entry.init)(module)).is_none() {
                self.disabled.store(true, Ordering::Relaxed);
                error!(
                    "event=backend_disabled module=symbol status=error backend={} reason=init_callback_failed",
                    entry.backend.as_str()
                );
                return real;
            }
        }

        info!(
            "event=symbol_redirect module=symbol status=ok symbol={} detour={:#x}",
            entry.symbol, entry.detour
        );
        entry.detour
    }

    /// [`Self::resolve`] for a raw C name pointer as passed to the resolver.
    ///
    /// Null names, names that are not UTF-8 and ordinal lookups pass through.
    ///
    /// # Safety
    /// `name` must be null, an ordinal below `0x10000`, or a NUL-terminated
    /// string valid for the duration of the call.
    pub unsafe fn resolve_raw(&self, module: ModuleHandle, name: *const c_char, real: usize) -> usize {
        if (name as usize) < 0x10000 {
            return real;
        }
        match CStr::from_ptr(name).to_str() {
            Ok(symbol) => self.resolve(module, symbol, real),
            Err(_) => real,
        }
    }

    /// Points the host player's resolver import at `detour`. One-time.
    ///
    /// # Errors
    /// - `Installation` when called twice or when the resolver import could
    ///   not be replaced.
    /// - `ImportPatch` when the host image cannot be opened.
    pub fn install(
        &self,
        patcher: &ImportTablePatcher,
        detour: usize,
    ) -> Result<&ImportPatchReport, BootstrapError> {
        if self.installed.get().is_some() {
            return Err(HookError::Installation {
                target: detour,
                reason: "resolver hook already installed".to_string(),
            }
            .into());
        }

        let report = patcher.install_hooks(&[(RESOLVER_IMPORT, detour)])?;
        if !report.is_patched(RESOLVER_IMPORT) {
            warn!(
                "event=resolver_hook module=symbol status=error image={} import={}",
                report.module, RESOLVER_IMPORT
            );
            return Err(HookError::Installation {
                target: detour,
                reason: format!("`{RESOLVER_IMPORT}` is not imported by {}", report.module),
            }
            .into());
        }

        info!(
            "event=resolver_hook module=symbol status=ok image={} redirects={}",
            report.module,
            self.table.len()
        );
        Ok(self.installed.get_or_init(|| report))
    }

    pub fn is_installed(&self) -> bool {
        self.installed.get().is_some()
    }

    pub fn init_fired(&self) -> bool {
        self.init_fired.load(Ordering::Relaxed)
    }

    /// False once a failed init callback disabled redirection.
    pub fn redirects_live(&self) -> bool {
        !self.disabled.load(Ordering::Relaxed)
    }
}
