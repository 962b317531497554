//! Blocking waits with timeout

use embedded_hal::delay::DelayNs;

/// `timeout_ms` value that never expires
pub const WAIT_FOREVER: u32 = 0;

/// Poll `f` until it yields a value
///
/// Sleeps `step_us` between attempts. Fails with `timed_out` once
/// `timeout_ms` has elapsed; [`WAIT_FOREVER`] polls indefinitely. Errors
/// returned by `f` end the wait immediately.
pub fn poll_until<D, T, E, F>(
    delay: &mut D,
    timeout_ms: u32,
    step_us: u32,
    timed_out: E,
    mut f: F,
) -> Result<T, E>
where
    D: DelayNs,
    F: FnMut() -> Result<Option<T>, E>,
{
    let budget_us = u64::from(timeout_ms) * 1000;
    let mut waited_us: u64 = 0;

    loop {
        if let Some(value) = f()? {
            return Ok(value);
        }
        if timeout_ms != WAIT_FOREVER && waited_us >= budget_us {
            return Err(timed_out);
        }
        delay.delay_us(step_us);
        waited_us += u64::from(step_us.max(1));
    }
}
