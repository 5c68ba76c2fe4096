//! The monotonic clock behind park deadlines and fairness intervals.

use std::sync::OnceLock;
use std::time::Instant;

fn anchor() -> Instant {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    *ANCHOR.get_or_init(Instant::now)
}

/// Returns the number of nanoseconds elapsed since a process-local anchor.
///
/// The value is non-decreasing across all threads. Deadlines throughout the
/// crate are expressed as absolute values of this clock, so a deadline for
/// "two milliseconds from now" is `nanotime() + 2_000_000`.
pub fn nanotime() -> u64 {
    anchor().elapsed().as_nanos() as u64
}
