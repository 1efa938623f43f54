//! Process-boundary exports consumed by the managed side.
//!
//! # Responsibility
//! - Expose hook attach/detach, log emission, backend handle getters, the
//!   console state and the loader config snapshot under stable C names.
//!
//! # Invariants
//! - Exports never panic across the boundary and tolerate null pointers.
//! - Before the bootstrap ran, getters return 0/false and actions are no-ops.

use crate::coordinator::require;
use crate::detours;
use bootstrap_core::{shielded, BootstrapError};
use log::{debug, error, info, warn};
use std::ffi::c_char;
use std::fmt::{Display, Formatter};
use widestring::U16Str;

/// Managed console color, one byte per channel.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorArgb {
    pub a: u8,
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Display for ColorArgb {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}{:02x}", self.a, self.r, self.g, self.b)
    }
}

/// Decodes a UTF-16 buffer of `len` code units; null or negative reads as empty.
///
/// # Safety
/// A non-null `ptr` must point to `len` readable code units.
pub unsafe fn utf16_lossy(ptr: *const u16, len: i32) -> String {
    match usize::try_from(len) {
        Ok(len) if !ptr.is_null() => U16Str::from_ptr(ptr, len).to_string_lossy(),
        _ => String::new(),
    }
}

/// Replaces `*target` with a trampoline to its original code and routes the
/// original entry to `detour`.
///
/// # FFI contract
/// - `target` points to a writable slot holding the function to hook.
/// - On failure the slot is left unchanged and the failure is logged.
#[no_mangle]
pub unsafe extern "C" fn NativeHookAttach(target: *mut usize, detour: usize) {
    if target.is_null() {
        return;
    }
    shielded("NativeHookAttach", || {
        let trampoline = require()?.detours.attach(*target, detour)?;
        *target = trampoline;
        Ok::<_, BootstrapError>(())
    });
}

/// Reverts a hook applied by [`NativeHookAttach`].
///
/// # FFI contract
/// - `target` holds either the hooked function or the trampoline returned by
///   the attach call; it is restored to the original function on success.
#[no_mangle]
pub unsafe extern "C" fn NativeHookDetach(target: *mut usize, _detour: usize) {
    if target.is_null() {
        return;
    }
    shielded("NativeHookDetach", || {
        let record = require()?.detours.detach(*target)?;
        *target = record.target;
        Ok::<_, BootstrapError>(())
    });
}

/// Emits one managed log line; a null message emits a spacer line.
///
/// # FFI contract
/// - Strings are UTF-16 with explicit lengths in code units.
#[no_mangle]
pub unsafe extern "C" fn LogMsg(
    msg_color: *const ColorArgb,
    msg: *const u16,
    msg_length: i32,
    section_color: *const ColorArgb,
    section: *const u16,
    section_length: i32,
) {
    if msg_color.is_null() || msg.is_null() {
        info!("");
        return;
    }
    let message = utf16_lossy(msg, msg_length);
    let color = *msg_color;
    if section_color.is_null() || section.is_null() {
        info!("event=managed_log module=ffi color={} message={}", color, message);
        return;
    }
    info!(
        "event=managed_log module=ffi section={} section_color={} color={} message={}",
        utf16_lossy(section, section_length),
        *section_color,
        color,
        message
    );
}

/// Emits a managed warning or error.
///
/// Warnings are demoted to debug output when the console hides warnings.
#[no_mangle]
pub unsafe extern "C" fn LogError(
    msg: *const u16,
    msg_length: i32,
    section: *const u16,
    section_length: i32,
    warning: bool,
) {
    let message = utf16_lossy(msg, msg_length);
    let section = utf16_lossy(section, section_length);
    let hide_warnings = require().is_ok_and(|state| state.config.console.hide_warnings);
    match (warning, hide_warnings) {
        (true, true) => debug!(
            "event=managed_warning module=ffi section={} message={}",
            section, message
        ),
        (true, false) => warn!(
            "event=managed_warning module=ffi section={} message={}",
            section, message
        ),
        (false, _) => error!(
            "event=managed_error module=ffi section={} message={}",
            section, message
        ),
    }
}

/// Logs the banner line of one loaded extension.
#[no_mangle]
pub unsafe extern "C" fn LogMelonInfo(
    name_color: *const ColorArgb,
    name: *const u16,
    name_length: i32,
    info: *const u16,
    info_length: i32,
) {
    let color = name_color.as_ref().copied().unwrap_or(ColorArgb {
        a: 0xff,
        r: 0xff,
        g: 0xff,
        b: 0xff,
    });
    info!(
        "event=melon_info module=ffi name={} color={} info={}",
        utf16_lossy(name, name_length),
        color,
        utf16_lossy(info, info_length)
    );
}

/// Registers the assembly-search fallback with the scripting runtime.
#[no_mangle]
pub extern "C" fn MonoInstallHooks() {
    shielded("MonoInstallHooks", || {
        require()?
            .mono
            .install_assembly_hooks(detours::mono_assembly_search)?;
        Ok::<_, BootstrapError>(())
    });
}

/// Scripting runtime domain created by the bootstrap; 0 before it ran.
#[no_mangle]
pub extern "C" fn MonoGetDomainPtr() -> usize {
    require().map_or(0, |state| state.mono.domain())
}

/// Handle of the scripting runtime library; 0 before it was located.
#[no_mangle]
pub extern "C" fn MonoGetRuntimeHandle() -> usize {
    require().map_or(0, |state| state.mono.runtime_handle().addr())
}

/// Whether the loader allocated its own console window.
#[no_mangle]
pub extern "C" fn IsConsoleOpen() -> bool {
    require().is_ok_and(|state| state.console.has_own_window())
}

/// Writes a pointer to the JSON loader configuration into `out`.
///
/// # FFI contract
/// - The string is NUL-terminated UTF-8 owned by the loader for the process
///   lifetime; callers must not free it.
/// - `out` receives null when the loader is not initialized.
#[no_mangle]
pub unsafe extern "C" fn GetLoaderConfig(out: *mut *const c_char) {
    if out.is_null() {
        return;
    }
    *out = require().map_or(std::ptr::null(), |state| state.config_json.as_ptr());
}
