// src/connectors/mod.rs

//! Ledger-network plumbing.
//!
//! `rpc` talks Ethereum JSON-RPC to a single endpoint. `chain` layers endpoint
//! failover, transaction signing and confirmation tracking on top of any
//! `LedgerClient`.

pub mod chain;
pub mod rpc;

pub use chain::{ChainConnector, TransferRequest, TRANSFER_GAS_LIMIT};
pub use rpc::RpcClient;

use thiserror::Error;

/// Errors raised by ledger endpoints and the connector.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ChainError {
    /// The endpoint could not be reached or answered garbage at the HTTP level.
    #[error("transport error: {0}")]
    Transport(String),
    /// The endpoint answered with a JSON-RPC error object.
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("decode error: {0}")]
    Decode(String),
    #[error("signing error: {0}")]
    Signing(String),
    /// No endpoint is currently bound.
    #[error("no ledger endpoint available")]
    Unavailable,
    #[error("transaction {0} reverted")]
    Reverted(String),
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl ChainError {
    /// Transport failures break the pinned connection; everything else is a
    /// per-call failure.
    pub fn is_transport(&self) -> bool {
        matches!(self, ChainError::Transport(_))
    }
}

/// The parts of a transaction receipt the withdrawal flow needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptInfo {
    pub block_number: u64,
    pub success: bool,
}
