/// A source of frame timestamps.
///
/// Producer and consumers live in different processes, so the value must come
/// from a clock that every process on the host agrees on.
pub trait Clock: Send + Sync + 'static {
    /// Returns seconds since boot on the host-wide monotonic clock.
    fn monotonic_seconds(&self) -> f64;
}

/// A clock that reads `CLOCK_MONOTONIC` directly.
///
/// This is the default implementation. Every process sees the same epoch, so
/// latencies computed across the producer/consumer boundary are meaningful.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn monotonic_seconds(&self) -> f64 {
        monotonic_now()
    }
}

/// A clock that uses the CPU's Time-Stamp Counter (TSC) via the `quanta` crate.
///
/// Cheaper to read than a syscall. It anchors to `CLOCK_MONOTONIC` at
/// construction and then advances with TSC ticks, so values stay comparable
/// with [`MonotonicClock`] in other processes up to calibration drift.
#[derive(Debug, Clone)]
pub struct QuantaClock {
    clock: quanta::Clock,
    start_seconds: f64,
    start_instant: quanta::Instant,
}

impl Default for QuantaClock {
    fn default() -> Self {
        let clock = quanta::Clock::new();
        let start_instant = clock.now();
        let start_seconds = monotonic_now();
        Self {
            clock,
            start_seconds,
            start_instant,
        }
    }
}

impl QuantaClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for QuantaClock {
    fn monotonic_seconds(&self) -> f64 {
        let delta = self.clock.now().duration_since(self.start_instant);
        self.start_seconds + delta.as_secs_f64()
    }
}

fn monotonic_now() -> f64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // CLOCK_MONOTONIC with a valid out pointer cannot fail.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as f64 + ts.tv_nsec as f64 / 1_000_000_000.0
}
