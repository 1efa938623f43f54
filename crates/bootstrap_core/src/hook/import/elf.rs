//! In-memory ELF image: PLT/GOT slots found through the dynamic section.

use super::{ImportPatchError, ModuleSelector};
use goblin::elf::dynamic::dyn64::Dyn;
use goblin::elf::dynamic::{DT_JMPREL, DT_NULL, DT_PLTRELSZ, DT_RELA, DT_RELASZ, DT_STRTAB, DT_SYMTAB};
use goblin::elf::program_header::PT_DYNAMIC;
use goblin::elf::reloc::reloc64::{r_sym, r_type, Rela};
use goblin::elf::sym::sym64::Sym;
use log::debug;
use std::collections::BTreeMap;
use std::ffi::{c_int, c_void, CStr};
use std::mem::size_of;
use std::path::Path;

#[cfg(target_arch = "x86_64")]
const SLOT_RELOCATIONS: [u32; 2] = [
    goblin::elf::reloc::R_X86_64_JUMP_SLOT,
    goblin::elf::reloc::R_X86_64_GLOB_DAT,
];
#[cfg(target_arch = "aarch64")]
const SLOT_RELOCATIONS: [u32; 2] = [
    goblin::elf::reloc::R_AARCH64_JUMP_SLOT,
    goblin::elf::reloc::R_AARCH64_GLOB_DAT,
];

struct LoadedObject {
    base: usize,
    path: String,
    phdr: *const libc::Elf64_Phdr,
    phnum: u16,
}

#[derive(Default)]
struct DynamicInfo {
    strtab: usize,
    symtab: usize,
    jmprel: usize,
    pltrelsz: usize,
    rela: usize,
    relasz: usize,
}

pub(super) struct Image {
    name: String,
    base: usize,
    dynamic: DynamicInfo,
    page_size: usize,
    /// Page start -> protection before this session touched it.
    unlocked: BTreeMap<usize, c_int>,
}

impl Image {
    pub(super) fn open(selector: &ModuleSelector) -> Result<Self, ImportPatchError> {
        let objects = loaded_objects();
        let chosen = objects
            .iter()
            .find(|object| selector.matches(file_name(&object.path)))
            .or_else(|| objects.iter().find(|object| object.path.is_empty()))
            .or_else(|| objects.first())
            .ok_or_else(|| {
                ImportPatchError::ModuleNotFound(
                    selector.name_hint().unwrap_or("<main>").to_string(),
                )
            })?;

        // SAFETY: the program headers belong to a mapped object reported by the loader.
        let phdrs = unsafe { std::slice::from_raw_parts(chosen.phdr, usize::from(chosen.phnum)) };
        let dynamic_header = phdrs
            .iter()
            .find(|header| header.p_type == PT_DYNAMIC)
            .ok_or_else(|| ImportPatchError::MalformedImage("no PT_DYNAMIC segment".to_string()))?;
        let dynamic_addr = chosen.base + dynamic_header.p_vaddr as usize;
        // SAFETY: PT_DYNAMIC points at the mapped, DT_NULL-terminated dynamic array.
        let dynamic = unsafe { read_dynamic(dynamic_addr, chosen.base) };
        if dynamic.strtab == 0 || dynamic.symtab == 0 {
            return Err(ImportPatchError::MalformedImage(
                "dynamic section lacks DT_STRTAB or DT_SYMTAB".to_string(),
            ));
        }

        let name = if chosen.path.is_empty() {
            "<main>".to_string()
        } else {
            chosen.path.clone()
        };
        debug!(
            "event=import_image_open module=import status=ok image={} base={:#x}",
            name, chosen.base
        );

        // SAFETY: sysconf has no preconditions.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        Ok(Self {
            name,
            base: chosen.base,
            dynamic,
            page_size: if page_size > 0 { page_size as usize } else { 4096 },
            unlocked: BTreeMap::new(),
        })
    }

    pub(super) fn name(&self) -> &str {
        &self.name
    }

    pub(super) unsafe fn slots(&self, name: &str) -> Result<Vec<usize>, ImportPatchError> {
        let mut slots = Vec::new();
        let tables = [
            (self.dynamic.jmprel, self.dynamic.pltrelsz),
            (self.dynamic.rela, self.dynamic.relasz),
        ];
        for (table, table_size) in tables {
            if table == 0 || table_size == 0 {
                continue;
            }
            for index in 0..table_size / size_of::<Rela>() {
                let reloc = std::ptr::read_unaligned((table as *const Rela).add(index));
                if !SLOT_RELOCATIONS.contains(&r_type(reloc.r_info)) {
                    continue;
                }
                let symbol_index = r_sym(reloc.r_info) as usize;
                if symbol_index == 0 || self.symbol_name(symbol_index) != Some(name.as_bytes()) {
                    continue;
                }
                let slot = self.base + reloc.r_offset as usize;
                if !slots.contains(&slot) {
                    slots.push(slot);
                }
            }
        }
        Ok(slots)
    }

    pub(super) unsafe fn write_slot(
        &mut self,
        name: &str,
        slot: usize,
        value: usize,
    ) -> Result<(), ImportPatchError> {
        let page = slot & !(self.page_size - 1);
        if !self.unlocked.contains_key(&page) {
            let original = region_protection(slot).ok_or_else(|| ImportPatchError::Protection {
                import: name.to_string(),
                reason: "slot is not inside a mapped region".to_string(),
            })?;
            if original & libc::PROT_WRITE == 0 {
                let status = libc::mprotect(
                    page as *mut c_void,
                    self.page_size,
                    libc::PROT_READ | libc::PROT_WRITE,
                );
                if status != 0 {
                    return Err(ImportPatchError::Protection {
                        import: name.to_string(),
                        reason: std::io::Error::last_os_error().to_string(),
                    });
                }
            }
            self.unlocked.insert(page, original);
        }
        std::ptr::write_volatile(slot as *mut usize, value);
        Ok(())
    }

    pub(super) fn release(&mut self) {
        for (page, protection) in std::mem::take(&mut self.unlocked) {
            if protection & libc::PROT_WRITE != 0 {
                continue;
            }
            // SAFETY: `page` was mapped when unlocked and the loader never unmaps it.
            unsafe { libc::mprotect(page as *mut c_void, self.page_size, protection) };
        }
    }

    unsafe fn symbol_name(&self, index: usize) -> Option<&[u8]> {
        let symbol = std::ptr::read_unaligned((self.dynamic.symtab as *const Sym).add(index));
        let name = (self.dynamic.strtab + symbol.st_name as usize) as *const libc::c_char;
        Some(CStr::from_ptr(name).to_bytes())
    }
}

/// Values below the load base are link-time offsets (musl, some arches) and
/// need rebasing; glibc hands back already relocated addresses.
fn rebase(value: u64, base: usize) -> usize {
    let value = value as usize;
    if value < base {
        value + base
    } else {
        value
    }
}

unsafe fn read_dynamic(address: usize, base: usize) -> DynamicInfo {
    let mut info = DynamicInfo::default();
    let mut entry = address as *const Dyn;
    loop {
        let current = std::ptr::read_unaligned(entry);
        match current.d_tag {
            DT_NULL => break,
            DT_STRTAB => info.strtab = rebase(current.d_val, base),
            DT_SYMTAB => info.symtab = rebase(current.d_val, base),
            DT_JMPREL => info.jmprel = rebase(current.d_val, base),
            DT_RELA => info.rela = rebase(current.d_val, base),
            DT_PLTRELSZ => info.pltrelsz = current.d_val as usize,
            DT_RELASZ => info.relasz = current.d_val as usize,
            _ => {}
        }
        entry = entry.add(1);
    }
    info
}

fn loaded_objects() -> Vec<LoadedObject> {
    unsafe extern "C" fn collect(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> c_int {
        let objects = &mut *(data as *mut Vec<LoadedObject>);
        let info = &*info;
        let path = if info.dlpi_name.is_null() {
            String::new()
        } else {
            CStr::from_ptr(info.dlpi_name).to_string_lossy().into_owned()
        };
        objects.push(LoadedObject {
            base: info.dlpi_addr as usize,
            path,
            phdr: info.dlpi_phdr,
            phnum: info.dlpi_phnum,
        });
        0
    }

    let mut objects: Vec<LoadedObject> = Vec::new();
    // SAFETY: the callback only appends to the vector passed through `data`.
    unsafe {
        libc::dl_iterate_phdr(Some(collect), &mut objects as *mut Vec<LoadedObject> as *mut c_void);
    }
    objects
}

fn file_name(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(path)
}

/// Protection of the mapping that contains `address`, from `/proc/self/maps`.
fn region_protection(address: usize) -> Option<c_int> {
    let maps = std::fs::read_to_string("/proc/self/maps").ok()?;
    maps.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let (start, end) = fields.next()?.split_once('-')?;
        let start = usize::from_str_radix(start, 16).ok()?;
        let end = usize::from_str_radix(end, 16).ok()?;
        if address < start || address >= end {
            return None;
        }
        Some(parse_permissions(fields.next()?))
    })
}

fn parse_permissions(perms: &str) -> c_int {
    let mut protection = libc::PROT_NONE;
    for flag in perms.chars() {
        match flag {
            'r' => protection |= libc::PROT_READ,
            'w' => protection |= libc::PROT_WRITE,
            'x' => protection |= libc::PROT_EXEC,
            _ => {}
        }
    }
    protection
}
