//! Injectable time/randomness so chain retries, backoff and suffix
//! assignment stay deterministic under test.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use time::OffsetDateTime;

/// Source of wall-clock time and monotonic sleeps.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> OffsetDateTime;
    fn monotonic_millis(&self) -> u64;
}

/// Real system clock, backed by `time` and `std::time::Instant`.
pub struct SystemClock {
    start: std::time::Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self { start: std::time::Instant::now() }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    fn monotonic_millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Deterministic clock for tests: time advances only when [`FakeClock::advance`]
/// is called.
#[derive(Default)]
pub struct FakeClock {
    millis: AtomicU64,
}

impl FakeClock {
    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::from_millis(self.millis.load(Ordering::SeqCst))
    }

    fn monotonic_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// Source of randomness, used for backoff jitter and nothing
/// security-sensitive.
pub trait Random: Send + Sync + 'static {
    /// Uniform float in `[0, 1)`.
    fn unit(&self) -> f64;
}

pub struct SystemRandom;

impl Random for SystemRandom {
    fn unit(&self) -> f64 {
        use rand::Rng;
        rand::thread_rng().r#gen::<f64>()
    }
}

/// Deterministic generator for tests: cycles through a fixed sequence,
/// defaulting to `0.0` once exhausted.
pub struct FixedRandom {
    sequence: Vec<f64>,
    cursor: AtomicU64,
}

impl FixedRandom {
    pub fn new(sequence: Vec<f64>) -> Self {
        Self { sequence, cursor: AtomicU64::new(0) }
    }
}

impl Random for FixedRandom {
    fn unit(&self) -> f64 {
        let idx = self.cursor.fetch_add(1, Ordering::SeqCst) as usize;
        self.sequence.get(idx).copied().unwrap_or(0.0)
    }
}
