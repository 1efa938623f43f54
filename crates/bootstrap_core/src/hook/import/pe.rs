//! In-memory PE image: import address table slots found through the import
//! directory.

use super::{ImportPatchError, ModuleSelector};
use goblin::pe::header::Header;
use goblin::pe::options::ParseOptions;
use goblin::pe::PE;
use log::debug;
use std::ffi::c_void;
use std::mem::size_of;
use widestring::U16CString;
use windows_sys::Win32::System::LibraryLoader::GetModuleHandleW;
use windows_sys::Win32::System::Memory::{VirtualProtect, PAGE_PROTECTION_FLAGS, PAGE_READWRITE};

/// The mapped header page; DOS, COFF and optional headers always fit in it.
const HEADER_PAGE_SIZE: usize = 0x1000;

pub(super) struct Image {
    name: String,
    base: usize,
    /// `(imported name, IAT slot RVA)` for every by-name import.
    imports: Vec<(String, usize)>,
    /// Slot address -> protection before this session touched it.
    unlocked: Vec<(usize, PAGE_PROTECTION_FLAGS)>,
}

impl Image {
    pub(super) fn open(selector: &ModuleSelector) -> Result<Self, ImportPatchError> {
        let by_hint = selector
            .name_hint()
            .and_then(|hint| U16CString::from_str(format!("{hint}.dll")).ok())
            .map(|wide| {
                // SAFETY: `wide` is a NUL-terminated module name.
                unsafe { GetModuleHandleW(wide.as_ptr()) } as usize
            })
            .filter(|module| *module != 0);

        let (name, base) = match by_hint {
            Some(module) => (
                format!("{}.dll", selector.name_hint().unwrap_or_default()),
                module,
            ),
            None => {
                // SAFETY: a null name returns the main program module.
                let module = unsafe { GetModuleHandleW(std::ptr::null()) } as usize;
                if module == 0 {
                    return Err(ImportPatchError::ModuleNotFound("<main>".to_string()));
                }
                ("<main>".to_string(), module)
            }
        };

        // SAFETY: `base` is the start of a module mapped by the loader.
        let imports = unsafe { mapped_imports(base)? };
        debug!(
            "event=import_image_open module=import status=ok image={} base={:#x} imports={}",
            name,
            base,
            imports.len()
        );
        Ok(Self {
            name,
            base,
            imports,
            unlocked: Vec::new(),
        })
    }

    pub(super) fn name(&self) -> &str {
        &self.name
    }

    pub(super) unsafe fn slots(&self, name: &str) -> Result<Vec<usize>, ImportPatchError> {
        Ok(self
            .imports
            .iter()
            .filter(|(imported, _)| imported == name)
            .map(|(_, slot_rva)| self.base + slot_rva)
            .collect())
    }

    pub(super) unsafe fn write_slot(
        &mut self,
        name: &str,
        slot: usize,
        value: usize,
    ) -> Result<(), ImportPatchError> {
        let mut previous: PAGE_PROTECTION_FLAGS = 0;
        let status = VirtualProtect(
            slot as *const c_void,
            size_of::<usize>(),
            PAGE_READWRITE,
            &mut previous,
        );
        if status == 0 {
            return Err(ImportPatchError::Protection {
                import: name.to_string(),
                reason: std::io::Error::last_os_error().to_string(),
            });
        }
        self.unlocked.push((slot, previous));
        std::ptr::write_volatile(slot as *mut usize, value);
        Ok(())
    }

    pub(super) fn release(&mut self) {
        for (slot, protection) in self.unlocked.drain(..).rev() {
            let mut ignored: PAGE_PROTECTION_FLAGS = 0;
            // SAFETY: the slot belongs to a loaded module that is never unloaded.
            unsafe {
                VirtualProtect(
                    slot as *const c_void,
                    size_of::<usize>(),
                    protection,
                    &mut ignored,
                )
            };
        }
    }
}

/// Parses the import directory of the image mapped at `base`.
///
/// The view spans `SizeOfImage` bytes and is parsed without RVA resolution,
/// so every offset goblin reports is an RVA into the mapping.
unsafe fn mapped_imports(base: usize) -> Result<Vec<(String, usize)>, ImportPatchError> {
    let malformed = |err: goblin::error::Error| ImportPatchError::MalformedImage(err.to_string());

    let header_page = std::slice::from_raw_parts(base as *const u8, HEADER_PAGE_SIZE);
    let size_of_image = Header::parse(header_page)
        .map_err(malformed)?
        .optional_header
        .ok_or_else(|| ImportPatchError::MalformedImage("missing optional header".to_string()))?
        .windows_fields
        .size_of_image as usize;

    let image = std::slice::from_raw_parts(base as *const u8, size_of_image.max(HEADER_PAGE_SIZE));
    let mut options = ParseOptions::default();
    options.resolve_rva = false;
    options.parse_attribute_certificates = false;
    options.parse_tls_data = false;
    options.parse_resources = false;
    let pe = PE::parse_with_opts(image, &options).map_err(malformed)?;
    Ok(pe
        .imports
        .iter()
        // Ordinal-only imports have no name to match.
        .filter(|import| import.rva != 0)
        .map(|import| (import.name.to_string(), import.offset))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::Image;
    use crate::hook::import::ModuleSelector;

    #[test]
    fn main_program_import_slots_come_from_the_import_directory() {
        let image = Image::open(&ModuleSelector::main_program()).expect("main program image");
        let slots = unsafe { image.slots("GetModuleHandleW") }.expect("slot scan");
        assert!(!slots.is_empty());
        assert!(slots.iter().all(|slot| *slot > image.base));
        assert!(unsafe { image.slots("definitely_not_imported_4711") }
            .expect("slot scan")
            .is_empty());
    }
}
