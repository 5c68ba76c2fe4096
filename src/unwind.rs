//! Unwinding recovery utilities taken from rayon.

use core::any::Any;
use core::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::thread::Result;

/// Executes `f` and captures any panic, translating that panic into an
/// `Err` result. Panicking tasks are reported and dropped rather than
/// propagated, so `f` can be treated as exception safe.
#[inline(always)]
pub(crate) fn halt_unwinding<F, R>(func: F) -> Result<R>
where
    F: FnOnce() -> R,
{
    catch_unwind(AssertUnwindSafe(func))
}

/// Renders a panic payload for the log line reporting it.
pub(crate) fn payload_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "opaque panic payload"
    }
}
