//! Import-table patching for calls a module already resolved statically.
//!
//! # Responsibility
//! - Locate one loaded module image (by file-name hint, else the main
//!   program) and rewrite selected import slots to caller-supplied detours.
//!
//! # Invariants
//! - Each replacement is attempted independently; a failed entry is logged
//!   and skipped, never rolled back.
//! - The opened image is always released (page protections restored) when a
//!   session ends, whatever the per-entry outcome.

#[cfg(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
mod elf;
#[cfg(windows)]
mod pe;

#[cfg(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
use self::elf::Image;
#[cfg(windows)]
use self::pe::Image;

use log::{info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// File-name fragment of the host's main native library.
pub const HOST_PLAYER_MODULE: &str = "UnityPlayer";

/// Chooses which loaded module a session opens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleSelector {
    name_hint: Option<String>,
}

impl ModuleSelector {
    /// First module whose file name contains `hint`, else the main program.
    pub fn containing(hint: impl Into<String>) -> Self {
        Self {
            name_hint: Some(hint.into()),
        }
    }

    /// The main program image.
    pub fn main_program() -> Self {
        Self { name_hint: None }
    }

    pub fn name_hint(&self) -> Option<&str> {
        self.name_hint.as_deref()
    }

    /// Whether `file_name` satisfies the hint; no hint matches nothing.
    pub fn matches(&self, file_name: &str) -> bool {
        self.name_hint
            .as_deref()
            .is_some_and(|hint| !hint.is_empty() && file_name.contains(hint))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportPatchError {
    ModuleNotFound(String),
    MalformedImage(String),
    ImportNotFound(String),
    Protection { import: String, reason: String },
    Unsupported(&'static str),
}

impl Display for ImportPatchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ModuleNotFound(module) => write!(f, "module `{module}` is not loaded"),
            Self::MalformedImage(reason) => write!(f, "malformed module image: {reason}"),
            Self::ImportNotFound(import) => write!(f, "import `{import}` not found"),
            Self::Protection { import, reason } => {
                write!(f, "cannot make import slot `{import}` writable: {reason}")
            }
            Self::Unsupported(platform) => {
                write!(f, "import patching is not supported on {platform}")
            }
        }
    }
}

impl Error for ImportPatchError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchedImport {
    pub name: String,
    /// Address of the first rewritten slot.
    pub slot: usize,
    /// Slot value before patching (the previously resolved target).
    pub previous: usize,
}

/// Outcome of one `install_hooks` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportPatchReport {
    pub module: String,
    pub patched: Vec<PatchedImport>,
    pub skipped: Vec<(String, String)>,
}

impl ImportPatchReport {
    pub fn is_patched(&self, name: &str) -> bool {
        self.patched.iter().any(|entry| entry.name == name)
    }

    pub fn previous(&self, name: &str) -> Option<usize> {
        self.patched
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.previous)
    }
}

/// Rewrites import slots of one selected module.
#[derive(Debug, Clone)]
pub struct ImportTablePatcher {
    selector: ModuleSelector,
}

impl ImportTablePatcher {
    pub fn new(selector: ModuleSelector) -> Self {
        Self { selector }
    }

    /// Patcher targeting the host's player library, falling back to the
    /// main program when that library is not loaded separately.
    pub fn for_host_player() -> Self {
        Self::new(ModuleSelector::containing(HOST_PLAYER_MODULE))
    }

    pub fn selector(&self) -> &ModuleSelector {
        &self.selector
    }

    /// Replaces each `(imported name, detour)` pair in the selected module.
    ///
    /// # Errors
    /// - Only when the module image cannot be opened at all. Per-entry
    ///   failures land in [`ImportPatchReport::skipped`].
    pub fn install_hooks(&self, hooks: &[(&str, usize)]) -> Result<ImportPatchReport, ImportPatchError> {
        let mut session = ImportPatchSession::open(&self.selector)?;
        let mut report = ImportPatchReport {
            module: session.module_name().to_string(),
            ..ImportPatchReport::default()
        };

        for &(name, detour) in hooks {
            // SAFETY: detours handed to the patcher are process-lifetime functions
            // with the ABI of the import they replace.
            match unsafe { session.replace(name, detour) } {
                Ok((slot, previous)) => {
                    info!(
                        "event=import_patch module=import status=ok image={} import={} previous={:#x}",
                        report.module, name, previous
                    );
                    report.patched.push(PatchedImport {
                        name: name.to_string(),
                        slot,
                        previous,
                    });
                }
                Err(err) => {
                    warn!(
                        "event=import_patch module=import status=skip image={} import={} error={}",
                        report.module, name, err
                    );
                    report.skipped.push((name.to_string(), err.to_string()));
                }
            }
        }
        Ok(report)
    }
}

/// An opened module image; released on drop.
pub struct ImportPatchSession {
    image: Image,
}

impl ImportPatchSession {
    pub fn open(selector: &ModuleSelector) -> Result<Self, ImportPatchError> {
        Ok(Self {
            image: Image::open(selector)?,
        })
    }

    pub fn module_name(&self) -> &str {
        self.image.name()
    }

    /// Points every slot importing `name` at `detour`; returns the first
    /// slot's address and the value it held before.
    ///
    /// # Safety
    /// `detour` must match the ABI of the replaced import and stay valid for
    /// the process lifetime.
    pub unsafe fn replace(
        &mut self,
        name: &str,
        detour: usize,
    ) -> Result<(usize, usize), ImportPatchError> {
        let slots = self.image.slots(name)?;
        let Some(&first) = slots.first() else {
            return Err(ImportPatchError::ImportNotFound(name.to_string()));
        };
        let previous = std::ptr::read_volatile(first as *const usize);
        for slot in slots {
            self.image.write_slot(name, slot, detour)?;
        }
        Ok((first, previous))
    }
}

impl Drop for ImportPatchSession {
    fn drop(&mut self) {
        self.image.release();
    }
}

#[cfg(not(any(
    windows,
    all(
        target_os = "linux",
        any(target_arch = "x86_64", target_arch = "aarch64")
    )
)))]
struct Image;

#[cfg(not(any(
    windows,
    all(
        target_os = "linux",
        any(target_arch = "x86_64", target_arch = "aarch64")
    )
)))]
impl Image {
    fn open(_selector: &ModuleSelector) -> Result<Self, ImportPatchError> {
        Err(ImportPatchError::Unsupported(std::env::consts::OS))
    }

    fn name(&self) -> &str {
        ""
    }

    unsafe fn slots(&self, name: &str) -> Result<Vec<usize>, ImportPatchError> {
        Err(ImportPatchError::ImportNotFound(name.to_string()))
    }

    unsafe fn write_slot(&mut self, _name: &str, _slot: usize, _value: usize) -> Result<(), ImportPatchError> {
        Err(ImportPatchError::Unsupported(std::env::consts::OS))
    }

    fn release(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::{ImportPatchError, ImportPatchReport, ModuleSelector, PatchedImport};

    #[test]
    fn selector_matches_file_name_fragment() {
        let selector = ModuleSelector::containing("UnityPlayer");
        assert!(selector.matches("/games/host/UnityPlayer.so"));
        assert!(!selector.matches("/usr/lib/libc.so.6"));
        assert!(!ModuleSelector::main_program().matches("UnityPlayer.so"));
    }

    #[test]
    fn report_looks_up_previous_targets() {
        let report = ImportPatchReport {
            module: "UnityPlayer.so".to_string(),
            patched: vec![PatchedImport {
                name: "fclose".to_string(),
                slot: 0x5ff8,
                previous: 0x7000,
            }],
            skipped: vec![("CloseHandle".to_string(), "import `CloseHandle` not found".to_string())],
        };
        assert!(report.is_patched("fclose"));
        assert_eq!(report.previous("fclose"), Some(0x7000));
        assert_eq!(report.previous("CloseHandle"), None);
    }

    #[test]
    fn errors_render_the_import_name() {
        let err = ImportPatchError::ImportNotFound("dlsym".to_string());
        assert_eq!(err.to_string(), "import `dlsym` not found");
    }
}
