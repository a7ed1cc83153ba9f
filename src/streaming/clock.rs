//! Wall-clock abstraction
//!
//! Streams stamp their modification time and render rotated file names from
//! a clock. Production code uses real system time; tests use a simulated
//! clock that only moves when told to, so file names are reproducible.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, TimeZone, Utc};

/// Unix timestamp in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StreamingTimestamp(pub u64);

impl StreamingTimestamp {
    pub const ZERO: StreamingTimestamp = StreamingTimestamp(0);

    pub fn from_millis(ms: u64) -> Self {
        StreamingTimestamp(ms)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Whole seconds since the Unix epoch.
    pub fn as_secs(&self) -> u64 {
        self.0 / 1000
    }

    pub fn saturating_sub(&self, other: StreamingTimestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(other.0))
    }

    /// Calendar view in UTC. Out-of-range values clamp to the epoch.
    pub fn to_utc(&self) -> DateTime<Utc> {
        i64::try_from(self.0)
            .ok()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or(DateTime::UNIX_EPOCH)
    }
}

impl std::ops::Add<Duration> for StreamingTimestamp {
    type Output = StreamingTimestamp;

    fn add(self, rhs: Duration) -> Self::Output {
        StreamingTimestamp(self.0.saturating_add(rhs.as_millis() as u64))
    }
}

/// Clock trait for time operations
///
/// Object safe so streams can share one `Arc<dyn StreamingClock>`.
pub trait StreamingClock: Send + Sync + 'static {
    /// Get current time
    fn now(&self) -> StreamingTimestamp;

    /// Get elapsed time since a previous timestamp
    fn elapsed(&self, since: StreamingTimestamp) -> Duration {
        self.now().saturating_sub(since)
    }
}

/// Shared clock handle
pub type SharedClock = Arc<dyn StreamingClock>;

/// Production clock using real system time
#[derive(Debug, Clone)]
pub struct ProductionClock {
    start: Instant,
    start_millis: u64,
}

impl Default for ProductionClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ProductionClock {
    pub fn new() -> Self {
        // A host clock set before 1970 reads as the epoch.
        let start_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        ProductionClock {
            start: Instant::now(),
            start_millis,
        }
    }

    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl StreamingClock for ProductionClock {
    fn now(&self) -> StreamingTimestamp {
        let elapsed = self.start.elapsed().as_millis() as u64;
        StreamingTimestamp(self.start_millis + elapsed)
    }
}

/// Simulated clock for deterministic tests
///
/// Time only advances when explicitly told to via `advance()` or `set()`.
/// Clones share the same time.
#[derive(Debug, Clone)]
pub struct SimulatedClock {
    time_ms: Arc<AtomicU64>,
}

impl Default for SimulatedClock {
    fn default() -> Self {
        Self::new(0)
    }
}

impl SimulatedClock {
    pub fn new(start_ms: u64) -> Self {
        SimulatedClock {
            time_ms: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.time_ms.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, time_ms: u64) {
        self.time_ms.store(time_ms, Ordering::SeqCst);
    }

    pub fn current_ms(&self) -> u64 {
        self.time_ms.load(Ordering::SeqCst)
    }
}

impl StreamingClock for SimulatedClock {
    fn now(&self) -> StreamingTimestamp {
        StreamingTimestamp(self.time_ms.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_clock() {
        let clock = ProductionClock::new();
        let t1 = clock.now();
        std::thread::sleep(Duration::from_millis(10));
        let t2 = clock.now();

        assert!(t2.0 > t1.0, "Time should advance");
        assert!(t2.0 - t1.0 >= 10, "Should have elapsed at least 10ms");
        assert!(t1.as_secs() > 1_600_000_000, "Should be wall-clock time");
    }

    #[test]
    fn test_simulated_clock_deterministic() {
        let clock = SimulatedClock::new(1000);

        let t1 = clock.now();
        let t2 = clock.now();
        assert_eq!(t1, t2, "Time should not advance without explicit call");

        clock.advance_ms(100);
        assert_eq!(clock.now().0, 1100);

        clock.set(5000);
        assert_eq!(clock.now().0, 5000);
    }

    #[test]
    fn test_simulated_clock_shared() {
        let clock = SimulatedClock::new(0);
        let shared: SharedClock = Arc::new(clock.clone());

        clock.advance(Duration::from_secs(2));
        assert_eq!(shared.now().0, 2000, "Clones should share state");
        assert_eq!(shared.elapsed(StreamingTimestamp::ZERO), Duration::from_secs(2));
    }

    #[test]
    fn test_to_utc() {
        // 2024-03-05 07:08:09 UTC
        let ts = StreamingTimestamp::from_millis(1_709_622_489_000);
        let dt = ts.to_utc();
        assert_eq!(dt.format("%Y%m%d_%H%M%S").to_string(), "20240305_070809");
        assert_eq!(ts.as_secs(), 1_709_622_489);
    }

    #[test]
    fn test_timestamp_arithmetic() {
        let ts = StreamingTimestamp::from_millis(1000);
        let ts2 = ts + Duration::from_millis(500);
        assert_eq!(ts2.0, 1500);
        assert_eq!(ts2.saturating_sub(ts), Duration::from_millis(500));
        assert_eq!(ts.saturating_sub(ts2), Duration::ZERO);
    }
}
