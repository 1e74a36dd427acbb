// =============================================================================
// Tern OS - Bounded Spin-Wait
// =============================================================================
// No scheduler exists during bring-up, so waiting on hardware means busy
// polling. Every poll here has an iteration budget and reports a timeout
// instead of hanging when the bit never flips.
// =============================================================================

use crate::error::{BringupError, WaitFor};

/// Poll `done` up to `budget` times.
///
/// Returns the number of polls it took, or `Timeout(what)` once the budget is
/// spent. `done` is evaluated at least once, even with a zero budget.
pub fn spin_until(
    budget: u32,
    what: WaitFor,
    mut done: impl FnMut() -> bool,
) -> Result<u32, BringupError> {
    let mut polls = 0;
    loop {
        polls += 1;
        if done() {
            return Ok(polls);
        }
        if polls >= budget.max(1) {
            log::debug!("spin budget of {} exhausted waiting for {:?}", budget, what);
            return Err(BringupError::Timeout(what));
        }
        core::hint::spin_loop();
    }
}
