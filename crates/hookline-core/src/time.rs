//! Clock abstraction for deterministic scheduling.
//!
//! Every timestamp the engine writes (record times, retry due times,
//! retention cutoffs) comes from an injected [`Clock`]. Production uses
//! [`RealClock`]; tests drive a [`TestClock`] forward by hand and call the
//! sweeps directly.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, TimeZone, Utc};

/// Source of time for the delivery engine.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic instant for measuring durations.
    fn now(&self) -> Instant;

    /// Wall-clock time used for record timestamps and scheduling.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Sleeps for the given duration.
    ///
    /// `TestClock` advances itself instead of waiting.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// System clock backed by `Instant`, `Utc::now` and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Manually advanced clock for tests.
///
/// Clones share the same underlying time, so a clock handed to the engine
/// can be advanced from the test body.
#[derive(Debug, Clone)]
pub struct TestClock {
    /// Monotonic nanoseconds elapsed since creation
    elapsed_ns: Arc<AtomicU64>,
    /// Wall-clock time as microseconds since the UNIX epoch
    wall_us: Arc<AtomicI64>,
    base_instant: Instant,
}

impl TestClock {
    /// Creates a test clock starting at the current wall-clock time.
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    /// Creates a test clock starting at `start`.
    pub fn at(start: DateTime<Utc>) -> Self {
        Self {
            elapsed_ns: Arc::new(AtomicU64::new(0)),
            wall_us: Arc::new(AtomicI64::new(start.timestamp_micros())),
            base_instant: Instant::now(),
        }
    }

    /// Moves both monotonic and wall-clock time forward.
    pub fn advance(&self, duration: Duration) {
        let ns = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        let us = i64::try_from(duration.as_micros()).unwrap_or(i64::MAX);

        self.elapsed_ns.fetch_add(ns, Ordering::AcqRel);
        self.wall_us.fetch_add(us, Ordering::AcqRel);
    }

    /// Sets wall-clock time. Monotonic time is unaffected.
    pub fn set(&self, time: DateTime<Utc>) {
        self.wall_us.store(time.timestamp_micros(), Ordering::Release);
    }

    /// Monotonic time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_ns.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base_instant + self.elapsed()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        let us = self.wall_us.load(Ordering::Acquire);
        Utc.timestamp_micros(us).single().unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_moves_both_clocks() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let clock = TestClock::at(start);
        let instant = clock.now();

        clock.advance(Duration::from_secs(90));

        assert_eq!(clock.now_utc(), start + chrono::Duration::seconds(90));
        assert_eq!(clock.now().duration_since(instant), Duration::from_secs(90));
    }

    #[test]
    fn clones_share_time() {
        let clock = TestClock::new();
        let handle = clock.clone();

        handle.advance(Duration::from_secs(60));

        assert_eq!(clock.elapsed(), Duration::from_secs(60));
        assert_eq!(clock.now_utc(), handle.now_utc());
    }

    #[test]
    fn set_changes_wall_time_only() {
        let clock = TestClock::new();
        let target = Utc.with_ymd_and_hms(2030, 6, 1, 0, 0, 0).unwrap();

        clock.set(target);

        assert_eq!(clock.now_utc(), target);
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn sleep_advances_instead_of_waiting() {
        let clock = TestClock::new();
        let before = clock.now_utc();

        clock.sleep(Duration::from_secs(3600)).await;

        assert_eq!(clock.now_utc() - before, chrono::Duration::hours(1));
    }
}
