//! Cycle cadence, time and stop control.
//!
//! The orchestrator never sleeps or reads the wall clock directly; it goes
//! through these seams so tests can drive it deterministically.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{interval, Interval, MissedTickBehavior};

/// Paces cycle starts.
#[async_trait]
pub trait Ticker: Send {
    /// Wait until the next cycle may start.
    async fn tick(&mut self);
}

/// Fixed-interval ticker on the tokio timer. The first tick is immediate.
pub struct IntervalTicker {
    interval: Interval,
}

impl IntervalTicker {
    pub fn new(period: Duration) -> Self {
        let mut interval = interval(period);
        // A slow cycle delays the next one instead of bursting to catch up
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }
}

#[async_trait]
impl Ticker for IntervalTicker {
    async fn tick(&mut self) {
        self.interval.tick().await;
    }
}

/// Ticker that never waits. Counts ticks; an optional clock is advanced by
/// `step` on each tick.
pub struct ManualTicker {
    ticks: u64,
    clock: Option<(ManualClock, Duration)>,
}

impl ManualTicker {
    pub fn new() -> Self {
        Self {
            ticks: 0,
            clock: None,
        }
    }

    /// Advance `clock` by `step` on every tick after the first.
    pub fn advancing(clock: ManualClock, step: Duration) -> Self {
        Self {
            ticks: 0,
            clock: Some((clock, step)),
        }
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}

impl Default for ManualTicker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Ticker for ManualTicker {
    async fn tick(&mut self) {
        if let Some((clock, step)) = &self.clock {
            if self.ticks > 0 {
                clock.advance(*step);
            }
        }
        self.ticks += 1;
        tokio::task::yield_now().await;
    }
}

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    millis: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: Arc::new(AtomicI64::new(start.timestamp_millis())),
        }
    }

    pub fn advance(&self, by: Duration) {
        let step = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.millis.fetch_add(step, Ordering::SeqCst);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        self.millis.store(to.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.millis.load(Ordering::SeqCst))
            .single()
            .unwrap_or_default()
    }
}

/// Cooperative stop request. Clones share the same flag.
///
/// The orchestrator checks it at every phase boundary, never mid-phase.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolve once the signal is triggered.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

/// When a run stops on its own. Unset fields do not limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunLimit {
    pub max_cycles: Option<u64>,
    pub max_duration: Option<Duration>,
}

impl RunLimit {
    /// Run until stopped.
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn cycles(max_cycles: u64) -> Self {
        Self {
            max_cycles: Some(max_cycles),
            max_duration: None,
        }
    }

    pub fn duration(max_duration: Duration) -> Self {
        Self {
            max_cycles: None,
            max_duration: Some(max_duration),
        }
    }

    pub fn reached(&self, cycles: u64, elapsed: ChronoDuration) -> bool {
        if self.max_cycles.is_some_and(|max| cycles >= max) {
            return true;
        }
        match (self.max_duration, elapsed.to_std()) {
            (Some(max), Ok(elapsed)) => elapsed >= max,
            _ => false,
        }
    }
}
