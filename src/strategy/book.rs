// src/strategy/book.rs

use crate::models::Strategy;
use crate::traits::RandomSource;
use std::collections::HashMap;
use thiserror::Error;

/// Seconds in a 365-day year, used to de-annualize yields.
const SECONDS_PER_YEAR: f64 = 31_536_000.0;

/// Notional (in the reference asset) each synthetic trade is sized at.
const TRADE_NOTIONAL: f64 = 100.0;

/// Scales per-second notional yield down to a per-trade profit.
const PROFIT_NORMALIZER: f64 = 1000.0;

/// Fixed multipliers applied to every protocol's base rate.
const LEVERAGE_MULTIPLIER: f64 = 2.8;
const COMPOUNDING_MULTIPLIER: f64 = 4.5;

/// Base yield rates per protocol, in catalog cycling order.
pub const PROTOCOL_RATES: &[(&str, f64)] = &[
    ("uniswap", 45.8),
    ("sushi", 38.2),
    ("curve", 28.6),
    ("balancer", 32.1),
    ("gmx", 42.3),
    ("pendle", 38.9),
    ("convex", 25.4),
    ("yearn", 22.1),
    ("aave", 18.5),
    ("morpho", 19.8),
];

#[derive(Debug, Error, PartialEq)]
pub enum CatalogError {
    #[error("protocol rate table is empty")]
    EmptyProtocolTable,
    #[error("unknown strategy id {0}")]
    UnknownStrategy(u32),
}

/// Expected profit of a single trade for a strategy yielding `apy` percent.
pub fn expected_profit(apy: f64, reference_price: f64) -> f64 {
    (apy / SECONDS_PER_YEAR) * TRADE_NOTIONAL * reference_price / PROFIT_NORMALIZER
}

/// The fixed, ranked catalog of strategies.
///
/// Strategies are stored in rank order (highest yield first). An id index
/// makes `credit` O(1) so the scheduler can call it thousands of times a
/// second.
#[derive(Debug, Clone)]
pub struct StrategyBook {
    ranked: Vec<Strategy>,
    positions: HashMap<u32, usize>,
    top_n: usize,
}

impl StrategyBook {
    /// Builds `count` strategies by cycling through `protocols`.
    ///
    /// The result is sorted by yield descending. The sort is stable, so equal
    /// yields keep creation order.
    pub fn initialize(
        protocols: &[(&str, f64)],
        count: usize,
        reference_price: f64,
        top_n: usize,
    ) -> Result<Self, CatalogError> {
        if protocols.is_empty() {
            return Err(CatalogError::EmptyProtocolTable);
        }

        let mut ranked: Vec<Strategy> = (0..count)
            .map(|i| {
                let (protocol, base_rate) = protocols[i % protocols.len()];
                let apy = base_rate * LEVERAGE_MULTIPLIER * COMPOUNDING_MULTIPLIER;
                let id = (i + 1) as u32;
                Strategy {
                    id,
                    protocol: protocol.to_string(),
                    name: format!("{}-{}", protocol.to_uppercase(), id),
                    apy,
                    profit_per_trade: expected_profit(apy, reference_price),
                    executions: 0,
                    pnl: 0.0,
                    is_active: true,
                }
            })
            .collect();

        ranked.sort_by(|a, b| b.apy.total_cmp(&a.apy));

        let positions = ranked
            .iter()
            .enumerate()
            .map(|(pos, s)| (s.id, pos))
            .collect();

        Ok(Self {
            ranked,
            positions,
            top_n: top_n.max(1),
        })
    }

    /// The default catalog: every protocol in `PROTOCOL_RATES`.
    pub fn with_default_protocols(
        count: usize,
        reference_price: f64,
        top_n: usize,
    ) -> Result<Self, CatalogError> {
        Self::initialize(PROTOCOL_RATES, count, reference_price, top_n)
    }

    pub fn len(&self) -> usize {
        self.ranked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranked.is_empty()
    }

    /// Size of the high-yield subset trades are drawn from.
    pub fn execution_pool(&self) -> usize {
        self.top_n.min(self.ranked.len())
    }

    /// Uniformly picks one of the top-ranked strategies. Returns `None` only
    /// for an empty catalog.
    pub fn pick_for_execution(&self, rng: &mut dyn RandomSource) -> Option<&Strategy> {
        let pool = self.execution_pool();
        if pool == 0 {
            return None;
        }
        self.ranked.get(rng.next_index(pool))
    }

    pub fn credit(&mut self, id: u32, profit: f64) -> Result<(), CatalogError> {
        let pos = *self
            .positions
            .get(&id)
            .ok_or(CatalogError::UnknownStrategy(id))?;
        let strategy = &mut self.ranked[pos];
        strategy.executions += 1;
        strategy.pnl += profit;
        Ok(())
    }

    pub fn get(&self, id: u32) -> Option<&Strategy> {
        self.positions.get(&id).map(|&pos| &self.ranked[pos])
    }

    /// The first `n` strategies in rank order.
    pub fn top(&self, n: usize) -> &[Strategy] {
        &self.ranked[..n.min(self.ranked.len())]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Strategy> {
        self.ranked.iter()
    }

    pub fn total_executions(&self) -> u64 {
        self.ranked.iter().map(|s| s.executions).sum()
    }
}
