//! Catch-and-degrade shell for code running inside native hook bodies.
//!
//! # Invariants
//! - Neither an `Err` nor an unwinding panic escapes [`shielded`].
//! - Every swallowed failure is logged as `redirected_call_failure`.

use crate::logging::payload_message;
use log::error;
use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};

/// Runs `body`, converting failures into a logged `None`.
///
/// Callers fall back to pass-through behaviour when `None` is returned.
pub fn shielded<T, E, F>(hook: &str, body: F) -> Option<T>
where
    E: Display,
    F: FnOnce() -> Result<T, E>,
{
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(value)) => Some(value),
        Ok(Err(err)) => {
            error!(
                "event=redirected_call_failure module=guard status=error hook={} error={}",
                hook, err
            );
            None
        }
        Err(payload) => {
            error!(
                "event=redirected_call_failure module=guard status=panic hook={} payload={}",
                hook,
                payload_message(payload.as_ref())
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::shielded;

    #[test]
    fn passes_successful_values_through() {
        assert_eq!(shielded("ok", || Ok::<_, String>(7)), Some(7));
    }

    #[test]
    fn swallows_errors() {
        assert_eq!(shielded("err", || Err::<u8, _>("nope")), None);
    }

    #[test]
    fn swallows_panics() {
        let caught = shielded("panic", || -> Result<u8, String> { panic!("detour exploded") });
        assert_eq!(caught, None);
    }
}
