// src/models.rs

use crate::strategy::StrategyBook;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

// =============================================================================
// Strategies
// =============================================================================

/// A synthetic yield-generating unit.
#[derive(Debug, Clone, Serialize)]
pub struct Strategy {
    pub id: u32,
    pub protocol: String,
    pub name: String,
    /// Annualized yield in percent, fixed at creation.
    pub apy: f64,
    /// Expected profit of one trade, in quote currency.
    pub profit_per_trade: f64,
    pub executions: u64,
    pub pnl: f64,
    pub is_active: bool,
}

// =============================================================================
// Global State
// =============================================================================

/// Process-wide counters. Memory resident, reset on restart.
#[derive(Debug, Clone)]
pub struct GlobalState {
    pub trading_enabled: bool,
    pub total_trades: u64,
    /// Cumulative earnings in quote currency. Never negative.
    pub total_earned: f64,
    /// Trades credited in the current window.
    pub window_trades: u64,
    /// Trades credited in the last completed window.
    pub tps: u64,
    pub peak_tps: u64,
    pub started_at: DateTime<Utc>,
    pub flash_events: u64,
}

impl GlobalState {
    pub fn new(trading_enabled: bool) -> Self {
        Self {
            trading_enabled,
            total_trades: 0,
            total_earned: 0.0,
            window_trades: 0,
            tps: 0,
            peak_tps: 0,
            started_at: Utc::now(),
            flash_events: 0,
        }
    }

    pub fn record_trade(&mut self, profit: f64) {
        self.total_trades += 1;
        self.window_trades += 1;
        self.total_earned += profit;
    }

    pub fn record_flash(&mut self, profit: f64) {
        self.total_earned += profit;
        self.flash_events += 1;
    }

    /// Books funds leaving custody against earnings, clamped at zero.
    /// Returns the new total.
    pub fn debit_earnings(&mut self, value: f64) -> f64 {
        self.total_earned = (self.total_earned - value).max(0.0);
        self.total_earned
    }

    pub fn uptime_secs(&self, now: DateTime<Utc>) -> f64 {
        (now - self.started_at).num_milliseconds().max(0) as f64 / 1000.0
    }

    /// Average earnings per hour since start.
    pub fn hourly_rate(&self, now: DateTime<Utc>) -> f64 {
        let hours = self.uptime_secs(now) / 3600.0;
        if hours > 0.0 {
            self.total_earned / hours
        } else {
            0.0
        }
    }
}

/// Everything the trade loop and the metrics sampler mutate together.
#[derive(Debug)]
pub struct EngineState {
    pub global: GlobalState,
    pub book: StrategyBook,
}

impl EngineState {
    pub fn new(book: StrategyBook, trading_enabled: bool) -> Self {
        Self {
            global: GlobalState::new(trading_enabled),
            book,
        }
    }
}

/// Handle to the single `EngineState`, passed to every component.
///
/// The lock is never held across an `.await`, so a plain mutex is enough on
/// the single-threaded runtime.
#[derive(Debug, Clone)]
pub struct SharedState {
    inner: Arc<Mutex<EngineState>>,
}

impl SharedState {
    pub fn new(state: EngineState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the global counters.
    pub fn global(&self) -> GlobalState {
        self.lock().global.clone()
    }

    pub fn set_trading_enabled(&self, enabled: bool) {
        self.lock().global.trading_enabled = enabled;
    }
}

// =============================================================================
// Withdrawals
// =============================================================================

/// Amount as sent by clients: a JSON number, a decimal string, or anything
/// else (kept so it can be rejected as an invalid amount).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum AmountField {
    Number(f64),
    Text(String),
    Other(serde_json::Value),
}

impl AmountField {
    /// Zero, blank, null and false count as "not given".
    pub fn is_unset(&self) -> bool {
        match self {
            AmountField::Number(n) => *n == 0.0 || n.is_nan(),
            AmountField::Text(s) => s.trim().is_empty(),
            AmountField::Other(v) => v.is_null() || *v == serde_json::Value::Bool(false),
        }
    }
}

/// Raw withdrawal request body. Each field has a legacy alias.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WithdrawalRequest {
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default, rename = "toAddress")]
    pub to_address: Option<String>,
    #[serde(default)]
    pub amount: Option<AmountField>,
    #[serde(default, rename = "amountETH")]
    pub amount_eth: Option<AmountField>,
}

impl WithdrawalRequest {
    pub fn new(to: Option<&str>, amount: AmountField) -> Self {
        Self {
            to: to.map(str::to_string),
            amount: Some(amount),
            ..Default::default()
        }
    }

    /// `to`, then `toAddress`. Blank values count as absent.
    pub fn recipient(&self) -> Option<&str> {
        [&self.to, &self.to_address]
            .into_iter()
            .flatten()
            .map(|s| s.trim())
            .find(|s| !s.is_empty())
    }

    /// `amountETH` unless unset, then `amount`.
    pub fn requested_amount(&self) -> Option<&AmountField> {
        match &self.amount_eth {
            Some(a) if !a.is_unset() => Some(a),
            _ => self.amount.as_ref().or(self.amount_eth.as_ref()),
        }
    }
}

/// A confirmed withdrawal.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalReceipt {
    pub tx_hash: String,
    pub explorer_url: String,
    pub recipient: String,
    pub amount_eth: f64,
    pub block_number: u64,
}
