//! Address-level interception: resolver redirects, import slot patching and
//! inline detours.

pub mod import;
pub mod symbol;
pub mod trampoline;

pub use import::{ImportPatchError, ImportPatchReport, ImportTablePatcher, ModuleSelector};
pub use symbol::{RedirectTable, SymbolRedirectEntry, SymbolResolutionInterceptor};
pub use trampoline::{DetourRecord, HookError, InlineHookPrimitive, TrampolineDetourManager};
