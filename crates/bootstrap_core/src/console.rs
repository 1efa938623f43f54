//! Standard stream ownership between the loader and the host.
//!
//! # Responsibility
//! - Capture the process' standard output/error handles when the console is
//!   set up, null them while the host boots and restore them at runtime init.
//! - Keep the host from closing those streams through its own imports.
//!
//! # Invariants
//! - Console setup completes before any runtime-init detour can run, so the
//!   captured handles are always the ones restored.
//!
//! # See also
//! - `hook::import` for the slot rewrite that installs the close guard.

use crate::hook::import::{ImportPatchError, ImportPatchReport, ImportTablePatcher};
use log::{debug, info};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Import the host uses to close a standard stream.
#[cfg(windows)]
pub const CLOSE_IMPORT: &str = "CloseHandle";
#[cfg(not(windows))]
pub const CLOSE_IMPORT: &str = "fclose";

/// Restores standard handles nulled during early startup.
pub trait StdHandleRestore: Send + Sync {
    fn reset_handles(&self);
}

#[derive(Debug, Default)]
pub struct ConsoleGuard {
    output: AtomicUsize,
    error: AtomicUsize,
    open: AtomicBool,
    own_window: AtomicBool,
}

impl ConsoleGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the loader console and records the live standard handles.
    ///
    /// A window is allocated only when `allocate_window` is set and the
    /// process has neither a console nor redirected output.
    pub fn open(&self, allocate_window: bool) {
        if allocate_window && platform::allocate_console_window() {
            self.own_window.store(true, Ordering::Relaxed);
        }
        let (output, error) = platform::std_handles();
        self.output.store(output, Ordering::Relaxed);
        self.error.store(error, Ordering::Relaxed);
        self.open.store(true, Ordering::Relaxed);
        info!(
            "event=console_open module=console status=ok own_window={}",
            self.has_own_window()
        );
    }

    /// Points the host-side close import at `detour`.
    pub fn install_close_guard(
        &self,
        patcher: &ImportTablePatcher,
        detour: usize,
    ) -> Result<ImportPatchReport, ImportPatchError> {
        patcher.install_hooks(&[(CLOSE_IMPORT, detour)])
    }

    /// Detaches the standard handles while the host initializes.
    pub fn null_handles(&self) {
        platform::set_std_handles(0, 0);
        debug!("event=console_handles module=console status=nulled");
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    pub fn has_own_window(&self) -> bool {
        self.own_window.load(Ordering::Relaxed)
    }

    /// Whether `handle` is one of the captured standard stream handles.
    pub fn is_protected_handle(&self, handle: usize) -> bool {
        handle != 0
            && (handle == self.output.load(Ordering::Relaxed)
                || handle == self.error.load(Ordering::Relaxed))
    }
}

impl StdHandleRestore for ConsoleGuard {
    fn reset_handles(&self) {
        platform::set_std_handles(
            self.output.load(Ordering::Relaxed),
            self.error.load(Ordering::Relaxed),
        );
        debug!("event=console_handles module=console status=restored");
    }
}

/// Whether `fd` is standard output or standard error.
pub fn is_std_stream_fd(fd: i32) -> bool {
    fd == 1 || fd == 2
}

#[cfg(windows)]
mod platform {
    use windows_sys::Win32::System::Console::{
        AllocConsole, GetConsoleWindow, GetStdHandle, SetStdHandle, STD_ERROR_HANDLE,
        STD_OUTPUT_HANDLE,
    };

    pub(super) fn allocate_console_window() -> bool {
        // SAFETY: plain console queries with no pointer arguments.
        unsafe {
            if !GetConsoleWindow().is_null() || !GetStdHandle(STD_OUTPUT_HANDLE).is_null() {
                return false;
            }
            AllocConsole();
            !GetConsoleWindow().is_null()
        }
    }

    pub(super) fn std_handles() -> (usize, usize) {
        // SAFETY: GetStdHandle has no preconditions.
        unsafe {
            (
                GetStdHandle(STD_OUTPUT_HANDLE) as usize,
                GetStdHandle(STD_ERROR_HANDLE) as usize,
            )
        }
    }

    pub(super) fn set_std_handles(output: usize, error: usize) {
        // SAFETY: handles are either null or values previously returned by GetStdHandle.
        unsafe {
            SetStdHandle(STD_OUTPUT_HANDLE, output as _);
            SetStdHandle(STD_ERROR_HANDLE, error as _);
        }
    }
}

#[cfg(not(windows))]
mod platform {
    pub(super) fn allocate_console_window() -> bool {
        false
    }

    pub(super) fn std_handles() -> (usize, usize) {
        (libc::STDOUT_FILENO as usize, libc::STDERR_FILENO as usize)
    }

    /// Streams are file descriptors here; there is nothing to swap.
    pub(super) fn set_std_handles(_output: usize, _error: usize) {}
}

#[cfg(test)]
mod tests {
    use super::{is_std_stream_fd, ConsoleGuard, StdHandleRestore};

    #[test]
    fn only_stdout_and_stderr_are_guarded() {
        assert!(!is_std_stream_fd(0));
        assert!(is_std_stream_fd(1));
        assert!(is_std_stream_fd(2));
        assert!(!is_std_stream_fd(7));
    }

    #[cfg(unix)]
    #[test]
    fn open_captures_descriptor_handles() {
        let guard = ConsoleGuard::new();
        assert!(!guard.is_open());
        guard.open(false);
        assert!(guard.is_open());
        assert!(!guard.has_own_window());
        assert!(guard.is_protected_handle(1));
        assert!(!guard.is_protected_handle(0));
        guard.reset_handles();
    }
}
