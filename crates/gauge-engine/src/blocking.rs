//! Heartbeat probe for catching async user code that blocks the runtime.
//!
//! A task that calls blocking I/O from an async context silently starves
//! every other task on the scheduler. The probe runs a ticker concurrently
//! with the user future and records the largest inter-tick gap: a future
//! that never yields freezes the ticker, so a large gap on a long call is a
//! reliable blocking signal. Detection is diagnostic only and never aborts
//! the call.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use tokio::time::Instant;

/// Probed calls before a clean function graduates out of probing.
pub const PROBE_INITIAL: u32 = 5;
/// After graduation, every Nth call is probed again to catch regressions.
pub const PROBE_INTERVAL: u32 = 50;

const HEARTBEAT_TICK: Duration = Duration::from_millis(200);
const GAP_THRESHOLD: Duration = Duration::from_secs(1);
const TOTAL_THRESHOLD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct HeartbeatReport {
    pub max_gap: Duration,
    pub elapsed: Duration,
}

impl HeartbeatReport {
    pub fn looks_blocking(&self) -> bool {
        self.max_gap > GAP_THRESHOLD && self.elapsed > TOTAL_THRESHOLD
    }
}

/// Per-function probe state. One warning per function, ever.
#[derive(Debug)]
pub struct BlockingMonitor {
    kind: &'static str,
    label: String,
    call_count: AtomicU32,
    clean_streak: AtomicU32,
    warned: AtomicBool,
    warn_count: AtomicU32,
}

impl BlockingMonitor {
    pub fn new(kind: &'static str, label: impl Into<String>) -> Self {
        Self {
            kind,
            label: label.into(),
            call_count: AtomicU32::new(0),
            clean_streak: AtomicU32::new(0),
            warned: AtomicBool::new(false),
            warn_count: AtomicU32::new(0),
        }
    }

    /// Counts the call and decides whether this one gets the heartbeat.
    pub fn should_probe(&self) -> bool {
        let count = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
        if self.clean_streak.load(Ordering::SeqCst) < PROBE_INITIAL {
            return true;
        }
        count % PROBE_INTERVAL == 0
    }

    /// Record a probed call. Returns true when this observation emitted the
    /// one-time warning.
    pub fn observe(&self, report: HeartbeatReport) -> bool {
        if report.looks_blocking() {
            self.clean_streak.store(0, Ordering::SeqCst);
            if !self.warned.swap(true, Ordering::SeqCst) {
                self.warn_count.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(
                    kind = self.kind,
                    label = %self.label,
                    max_gap_ms = report.max_gap.as_millis() as u64,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "async {} `{}` appears to block the event loop; move blocking work to a sync {} so it runs on the worker pool",
                    self.kind,
                    self.label,
                    self.kind,
                );
                return true;
            }
            return false;
        }
        self.clean_streak.fetch_add(1, Ordering::SeqCst);
        false
    }

    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn clean_streak(&self) -> u32 {
        self.clean_streak.load(Ordering::SeqCst)
    }

    pub fn warn_count(&self) -> u32 {
        self.warn_count.load(Ordering::SeqCst)
    }
}

/// Drive `fut` to completion while ticking every 200 ms, reporting the
/// largest observed gap between ticks.
pub async fn run_with_heartbeat<F: Future>(fut: F) -> (F::Output, HeartbeatReport) {
    let started = Instant::now();
    let mut last_tick = Instant::now();
    let mut max_gap = Duration::ZERO;
    tokio::pin!(fut);
    loop {
        tokio::select! {
            output = &mut fut => {
                max_gap = max_gap.max(last_tick.elapsed());
                let report = HeartbeatReport {
                    max_gap,
                    elapsed: started.elapsed(),
                };
                return (output, report);
            }
            _ = tokio::time::sleep(HEARTBEAT_TICK) => {
                max_gap = max_gap.max(last_tick.elapsed());
                last_tick = Instant::now();
            }
        }
    }
}
