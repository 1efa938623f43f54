//! Injected loader module.
//!
//! # Responsibility
//! - Run the bootstrap once when the host maps this module.
//! - Expose the `extern` detour thunks and the process-boundary exports.
//!
//! # Invariants
//! - No panic or error crosses a native boundary; every thunk and export
//!   degrades to pass-through or a neutral return value.
//!
//! # See also
//! - `bootstrap_core` for all interception and handler logic.

pub mod coordinator;
pub mod detours;
#[cfg(not(test))]
mod entry;
pub mod exports;

pub use coordinator::{bootstrap, Bootstrap};
