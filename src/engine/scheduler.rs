// src/engine/scheduler.rs

use super::metrics::MetricsAggregator;
use crate::models::{EngineState, SharedState};
use crate::traits::RandomSource;
use log::{debug, info, warn};
use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// Profit of one trade: expected profit with ±20% jitter. `u` is in `[0, 1)`.
pub fn jittered_profit(expected: f64, u: f64) -> f64 {
    expected * (0.8 + 0.4 * u)
}

/// Per-window work queue.
///
/// Hands out batch sizes until `target` events have been dispatched for the
/// window. The last batch is truncated so the window never overshoots.
#[derive(Debug, Clone)]
pub struct WindowQuota {
    target: u64,
    batch_size: u64,
    dispatched: u64,
}

impl WindowQuota {
    pub fn new(target: u64, batch_size: u64) -> Self {
        Self {
            target,
            batch_size: batch_size.max(1),
            dispatched: 0,
        }
    }

    pub fn reset(&mut self) {
        self.dispatched = 0;
    }

    /// Size of the next batch, or `None` once the quota is met.
    pub fn next_batch(&mut self) -> Option<u64> {
        if self.dispatched >= self.target {
            return None;
        }
        let size = self.batch_size.min(self.target - self.dispatched);
        self.dispatched += size;
        Some(size)
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    pub fn is_met(&self) -> bool {
        self.dispatched >= self.target
    }

    pub fn target(&self) -> u64 {
        self.target
    }
}

/// What one window did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowReport {
    pub batches: u64,
    pub dispatched: u64,
    pub credited: u64,
}

/// Drives synthetic trades at a fixed rate per window.
///
/// Each window runs the quota in batches and yields to the runtime between
/// batches, so HTTP handlers and in-flight withdrawals keep making progress on
/// the same thread.
pub struct ThroughputScheduler {
    state: SharedState,
    rng: Box<dyn RandomSource>,
    quota: WindowQuota,
    window: Duration,
}

impl ThroughputScheduler {
    pub fn new(
        state: SharedState,
        target_per_window: u64,
        batch_size: u64,
        window: Duration,
        rng: Box<dyn RandomSource>,
    ) -> Self {
        Self {
            state,
            rng,
            quota: WindowQuota::new(target_per_window, batch_size),
            window,
        }
    }

    pub fn target(&self) -> u64 {
        self.quota.target()
    }

    /// Executes `size` trade events under one lock acquisition.
    /// Returns how many were credited (0 while trading is disabled).
    pub fn execute_batch(&mut self, size: u64) -> u64 {
        let mut guard = self.state.lock();
        let EngineState { global, book } = &mut *guard;
        if !global.trading_enabled {
            return 0;
        }

        let mut credited = 0;
        for _ in 0..size {
            let (id, expected) = match book.pick_for_execution(self.rng.as_mut()) {
                Some(s) => (s.id, s.profit_per_trade),
                None => break,
            };
            let profit = jittered_profit(expected, self.rng.next_unit());

            match book.credit(id, profit) {
                Ok(()) => {
                    global.record_trade(profit);
                    credited += 1;
                }
                Err(e) => warn!("Scheduler: {}", e),
            }
        }
        credited
    }

    /// Runs one window's quota to completion.
    pub async fn run_window(&mut self) -> WindowReport {
        self.quota.reset();
        let mut report = WindowReport {
            batches: 0,
            dispatched: 0,
            credited: 0,
        };

        while let Some(size) = self.quota.next_batch() {
            report.credited += self.execute_batch(size);
            report.batches += 1;
            tokio::task::yield_now().await;
        }

        report.dispatched = self.quota.dispatched();
        report
    }

    /// Runs windows forever. At every boundary `metrics` closes the previous
    /// window before the next one starts crediting.
    pub async fn run(mut self, metrics: MetricsAggregator) {
        info!(
            "Scheduler: Starting, {} trades per {:?} in batches of {}",
            self.quota.target(),
            self.window,
            self.quota.batch_size
        );

        let mut ticker = tokio::time::interval(self.window);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let sample = metrics.sample();
            let report = self.run_window().await;
            debug!(
                "Scheduler: Window done, {} credited in {} batches (last tps {}, peak {})",
                report.credited, report.batches, sample.tps, sample.peak_tps
            );
        }
    }
}
