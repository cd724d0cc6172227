use once_cell::sync::Lazy;
use quanta::Clock;

/// Global high-performance clock for hot-path timing.
/// Uses TSC (Time Stamp Counter) on x86/x86_64 for minimal overhead.
pub static CLOCK: Lazy<Clock> = Lazy::new(Clock::new);

/// Get current instant (precise, ~10ns overhead).
#[inline]
pub fn now() -> quanta::Instant {
    CLOCK.now()
}
