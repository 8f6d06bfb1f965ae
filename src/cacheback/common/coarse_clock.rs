use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering::Relaxed;
use std::time::Instant;

/// A global, shared atomic clock advanced by calling update_coarse_monotonic_clock.
static COARSE_CLOCK: AtomicU32 = AtomicU32::new(0);

/// Advances the stored clock value. Safe to call from multiple event threads;
/// at worst two threads race to compute nearly the same elapsed value.
pub fn update_coarse_monotonic_clock(start: Instant) {
    let now = start.elapsed().as_secs() as u32;
    COARSE_CLOCK.store(now, Relaxed);
}
