// src/traits.rs

use crate::connectors::{ChainError, ReceiptInfo};
use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use std::sync::Arc;

/// A single ledger-network endpoint.
///
/// This is the opaque connector capability the rest of the crate builds on:
/// liveness probe, balance and fee reads, raw transaction submission and
/// receipt lookup. Failover, signing and confirmation policy live one level up
/// in `ChainConnector`.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Human-readable endpoint identifier (URL or "simulated").
    fn endpoint(&self) -> &str;

    /// Current block height. Also used as the liveness probe.
    async fn block_number(&self) -> Result<u64, ChainError>;

    /// Balance of `address` in wei.
    async fn balance(&self, address: Address) -> Result<U256, ChainError>;

    /// Current gas price in wei.
    async fn gas_price(&self) -> Result<u128, ChainError>;

    /// Next nonce for `address`, including pending transactions.
    async fn transaction_count(&self, address: Address) -> Result<u64, ChainError>;

    /// Submits an EIP-2718 encoded signed transaction, returns its hash.
    async fn send_raw_transaction(&self, raw: Bytes) -> Result<B256, ChainError>;

    /// Receipt for `hash`, or `None` while the transaction is still pending.
    async fn transaction_receipt(&self, hash: B256) -> Result<Option<ReceiptInfo>, ChainError>;
}

/// Endpoints are shared between the connector and whoever built them.
pub type SharedLedgerClient = Arc<dyn LedgerClient>;

/// Source of uniform randomness for trade selection and profit jitter.
/// Tests substitute a fixed sequence to get exact profit values.
pub trait RandomSource: Send {
    /// Returns a value in `[0, 1)`.
    fn next_unit(&mut self) -> f64;

    /// Uniform index in `0..len`. `len` must be non-zero.
    fn next_index(&mut self, len: usize) -> usize {
        let idx = (self.next_unit() * len as f64) as usize;
        idx.min(len.saturating_sub(1))
    }
}
