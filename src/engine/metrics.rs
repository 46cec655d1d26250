// src/engine/metrics.rs

use crate::models::SharedState;
use crate::traits::RandomSource;
use log::info;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Lower bound of the flash-settlement yield on the notional.
const FLASH_BASE_YIELD: f64 = 0.002;
/// Width of the random band added on top of the base yield.
const FLASH_YIELD_BAND: f64 = 0.003;
/// Yield used for manually triggered settlements.
const FLASH_FIXED_YIELD: f64 = 0.003;

#[derive(Debug, Clone, Copy)]
pub struct FlashSettings {
    /// Notional of one flash settlement, in the reference asset.
    pub notional: f64,
    pub reference_price: f64,
    pub interval: Duration,
}

impl Default for FlashSettings {
    fn default() -> Self {
        Self {
            notional: 100.0,
            reference_price: 3450.0,
            interval: Duration::from_secs(5),
        }
    }
}

/// Throughput figures after a window closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThroughputSample {
    pub tps: u64,
    pub peak_tps: u64,
}

/// Samples window counters and books flash settlements.
#[derive(Clone)]
pub struct MetricsAggregator {
    state: SharedState,
    flash: FlashSettings,
}

impl MetricsAggregator {
    pub fn new(state: SharedState, flash: FlashSettings) -> Self {
        Self { state, flash }
    }

    pub fn flash_settings(&self) -> &FlashSettings {
        &self.flash
    }

    /// Closes the current window: publishes its count as the instantaneous
    /// throughput, raises the peak, and resets the counter. Read and reset
    /// happen under one lock.
    pub fn sample(&self) -> ThroughputSample {
        let mut guard = self.state.lock();
        let global = &mut guard.global;
        global.tps = global.window_trades;
        global.peak_tps = global.peak_tps.max(global.tps);
        global.window_trades = 0;
        ThroughputSample {
            tps: global.tps,
            peak_tps: global.peak_tps,
        }
    }

    /// Profit of a flash settlement for a uniform draw `u` in `[0, 1)`.
    pub fn flash_profit(&self, u: f64) -> f64 {
        self.flash.notional * (FLASH_BASE_YIELD + FLASH_YIELD_BAND * u) * self.flash.reference_price
    }

    /// Books one jittered flash settlement. Skipped while trading is disabled.
    pub fn flash_settle(&self, rng: &mut dyn RandomSource) -> Option<f64> {
        let profit = self.flash_profit(rng.next_unit());
        let mut guard = self.state.lock();
        let global = &mut guard.global;
        if !global.trading_enabled {
            return None;
        }
        global.record_flash(profit);

        info!(
            "Flash +${:.2} | TPS: {} | Total: ${:.2}",
            profit, global.tps, global.total_earned
        );
        Some(profit)
    }

    /// Books one settlement at the fixed yield, regardless of the trading flag.
    pub fn flash_credit_fixed(&self) -> f64 {
        let profit = self.flash.notional * FLASH_FIXED_YIELD * self.flash.reference_price;
        self.state.lock().global.record_flash(profit);
        profit
    }

    /// Books a flash settlement every `interval`, starting one interval from now.
    pub async fn run_flash_loop(self, mut rng: Box<dyn RandomSource>) {
        let mut ticker = interval_at(Instant::now() + self.flash.interval, self.flash.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.flash_settle(rng.as_mut());
        }
    }
}
