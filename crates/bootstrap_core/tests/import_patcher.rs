#![cfg(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
))]

use bootstrap_core::{ImportTablePatcher, ModuleSelector};

const FIXED_PARENT: libc::pid_t = 4242;

extern "C" fn fixed_parent_pid() -> libc::pid_t {
    FIXED_PARENT
}

/// `rwx` flags of the mapping holding `address`, from `/proc/self/maps`.
fn mapping_permissions(address: usize) -> String {
    let maps = std::fs::read_to_string("/proc/self/maps").expect("readable maps");
    maps.lines()
        .find_map(|line| {
            let mut fields = line.split_whitespace();
            let (start, end) = fields.next()?.split_once('-')?;
            let start = usize::from_str_radix(start, 16).ok()?;
            let end = usize::from_str_radix(end, 16).ok()?;
            (start..end)
                .contains(&address)
                .then(|| fields.next().map(|perms| perms[..3].to_string()))
                .flatten()
        })
        .expect("slot lies in a mapping")
}

#[test]
fn patches_present_imports_and_reports_missing_ones() {
    let real_parent = unsafe { libc::getppid() };
    let patcher = ImportTablePatcher::new(ModuleSelector::main_program());

    let report = patcher
        .install_hooks(&[
            ("loader_test_missing_import_4711", 0x1234),
            ("getppid", fixed_parent_pid as usize),
        ])
        .expect("main program opens");

    assert!(report.is_patched("getppid"));
    assert!(!report.is_patched("loader_test_missing_import_4711"));
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].0, "loader_test_missing_import_4711");
    assert!(report.skipped[0].1.contains("not found"));
    assert_eq!(unsafe { libc::getppid() }, FIXED_PARENT);

    let patched = &report.patched[0];
    let original = patched.previous;
    assert_ne!(original, 0);
    assert_ne!(original, fixed_parent_pid as usize);
    let protection_after_patch = mapping_permissions(patched.slot);

    let restored = patcher
        .install_hooks(&[("getppid", original)])
        .expect("main program opens");
    assert_eq!(restored.previous("getppid"), Some(fixed_parent_pid as usize));
    assert_eq!(unsafe { libc::getppid() }, real_parent);
    assert_eq!(
        unsafe { std::ptr::read_volatile(patched.slot as *const usize) },
        original
    );
    assert_eq!(mapping_permissions(patched.slot), protection_after_patch);
}
