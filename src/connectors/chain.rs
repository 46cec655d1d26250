// src/connectors/chain.rs
//
// Endpoint failover, signing identity and confirmation tracking.

use super::{ChainError, ReceiptInfo};
use crate::traits::SharedLedgerClient;
use alloy::consensus::{SignableTransaction, TxEnvelope, TxLegacy};
use alloy::eips::eip2718::Encodable2718;
use alloy::primitives::{hex, Address, Bytes, TxKind, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use log::{error, info, warn};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tokio::time::sleep;

/// Gas limit of a plain value transfer.
pub const TRANSFER_GAS_LIMIT: u64 = 21_000;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// A single-asset transfer waiting to be signed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferRequest {
    pub to: Address,
    pub value: U256,
    pub gas_price: u128,
}

/// A connection to exactly one ledger endpoint out of an ordered list.
///
/// `connect` probes candidates in order and pins the first one that answers.
/// The pin holds until a call on it fails at the transport level; after that
/// every call fails with `ChainError::Unavailable` until `connect` runs again.
/// There is no automatic failback.
pub struct ChainConnector {
    candidates: Vec<SharedLedgerClient>,
    signer: PrivateKeySigner,
    chain_id: u64,
    poll_interval: Duration,
    pinned: RwLock<Option<usize>>,
}

impl ChainConnector {
    /// Creates an unbound connector. Call `connect` before use.
    pub fn new(candidates: Vec<SharedLedgerClient>, signer: PrivateKeySigner, chain_id: u64) -> Self {
        Self {
            candidates,
            signer,
            chain_id,
            poll_interval: DEFAULT_POLL_INTERVAL,
            pinned: RwLock::new(None),
        }
    }

    /// Sets how often `wait_for_confirmation` polls for the receipt.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Address of the bound signing identity (the custodial account).
    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub fn is_connected(&self) -> bool {
        self.pinned.read().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Endpoint of the pinned candidate, if any.
    pub fn active_endpoint(&self) -> Option<String> {
        let pinned = *self.pinned.read().unwrap_or_else(PoisonError::into_inner);
        pinned.map(|idx| self.candidates[idx].endpoint().to_string())
    }

    /// Probes every candidate in order and pins the first live one.
    pub async fn connect(&self) -> Result<String, ChainError> {
        for (idx, candidate) in self.candidates.iter().enumerate() {
            match candidate.block_number().await {
                Ok(height) => {
                    info!(
                        "ChainConnector: Connected to {} at block {} as {}",
                        candidate.endpoint(),
                        height,
                        self.address()
                    );
                    self.set_pinned(Some(idx));
                    return Ok(candidate.endpoint().to_string());
                }
                Err(e) => {
                    warn!("ChainConnector: {} unreachable: {}", candidate.endpoint(), e);
                }
            }
        }

        error!(
            "ChainConnector: All {} endpoints failed, connector unavailable",
            self.candidates.len()
        );
        self.set_pinned(None);
        Err(ChainError::Unavailable)
    }

    /// Connects only if nothing is pinned.
    pub async fn ensure_connected(&self) -> Result<(), ChainError> {
        if self.is_connected() {
            return Ok(());
        }
        self.connect().await.map(|_| ())
    }

    fn set_pinned(&self, value: Option<usize>) {
        *self.pinned.write().unwrap_or_else(PoisonError::into_inner) = value;
    }

    fn client(&self) -> Result<(usize, SharedLedgerClient), ChainError> {
        let pinned = *self.pinned.read().unwrap_or_else(PoisonError::into_inner);
        let idx = pinned.ok_or(ChainError::Unavailable)?;
        Ok((idx, self.candidates[idx].clone()))
    }

    /// Unpins `idx` after a transport failure. A concurrent reconnect that
    /// already moved the pin elsewhere is left alone.
    fn observe<T>(&self, idx: usize, result: Result<T, ChainError>) -> Result<T, ChainError> {
        if let Err(e) = &result {
            if e.is_transport() {
                let mut pinned = self.pinned.write().unwrap_or_else(PoisonError::into_inner);
                if *pinned == Some(idx) {
                    warn!(
                        "ChainConnector: Dropping {} after transport error: {}",
                        self.candidates[idx].endpoint(),
                        e
                    );
                    *pinned = None;
                }
            }
        }
        result
    }

    pub async fn balance(&self, address: Address) -> Result<U256, ChainError> {
        let (idx, client) = self.client()?;
        let result = client.balance(address).await;
        self.observe(idx, result)
    }

    /// Balance of the custodial account in wei.
    pub async fn custodial_balance(&self) -> Result<U256, ChainError> {
        self.balance(self.address()).await
    }

    /// Current gas price in wei.
    pub async fn fee_estimate(&self) -> Result<u128, ChainError> {
        let (idx, client) = self.client()?;
        let result = client.gas_price().await;
        self.observe(idx, result)
    }

    pub async fn block_number(&self) -> Result<u64, ChainError> {
        let (idx, client) = self.client()?;
        let result = client.block_number().await;
        self.observe(idx, result)
    }

    /// Builds and signs an EIP-155 legacy transfer. Returns the transaction
    /// hash and its EIP-2718 encoding.
    pub fn sign_transfer(&self, nonce: u64, transfer: &TransferRequest) -> Result<(B256, Bytes), ChainError> {
        let tx = TxLegacy {
            chain_id: Some(self.chain_id),
            nonce,
            gas_price: transfer.gas_price,
            gas_limit: TRANSFER_GAS_LIMIT,
            to: TxKind::Call(transfer.to),
            value: transfer.value,
            input: Bytes::new(),
        };

        let signature = self
            .signer
            .sign_hash_sync(&tx.signature_hash())
            .map_err(|e| ChainError::Signing(e.to_string()))?;
        let signed = tx.into_signed(signature);
        let hash = *signed.hash();
        let envelope = TxEnvelope::from(signed);

        Ok((hash, Bytes::from(envelope.encoded_2718())))
    }

    /// Fetches the next nonce, signs `transfer` and submits it.
    pub async fn sign_and_broadcast(&self, transfer: &TransferRequest) -> Result<B256, ChainError> {
        let (idx, client) = self.client()?;

        let nonce = client.transaction_count(self.address()).await;
        let nonce = self.observe(idx, nonce)?;

        let (hash, raw) = self.sign_transfer(nonce, transfer)?;

        let submitted = client.send_raw_transaction(raw).await;
        let submitted = self.observe(idx, submitted)?;
        if submitted != hash {
            warn!(
                "ChainConnector: Endpoint reported hash {} for locally computed {}",
                hex::encode_prefixed(submitted),
                hex::encode_prefixed(hash)
            );
        }

        info!(
            "ChainConnector: Broadcast {} (nonce {}) via {}",
            hex::encode_prefixed(submitted),
            nonce,
            client.endpoint()
        );
        Ok(submitted)
    }

    /// Waits until `hash` has at least `confirmations` confirmations.
    /// Returns the inclusion block.
    pub async fn wait_for_confirmation(
        &self,
        hash: B256,
        confirmations: u64,
        timeout: Duration,
    ) -> Result<u64, ChainError> {
        match tokio::time::timeout(timeout, self.poll_confirmation(hash, confirmations.max(1))).await {
            Ok(result) => result,
            Err(_) => Err(ChainError::Timeout(timeout)),
        }
    }

    async fn poll_confirmation(&self, hash: B256, confirmations: u64) -> Result<u64, ChainError> {
        loop {
            let (idx, client) = self.client()?;

            let receipt = client.transaction_receipt(hash).await;
            if let Some(ReceiptInfo { block_number, success }) = self.observe(idx, receipt)? {
                if !success {
                    return Err(ChainError::Reverted(hex::encode_prefixed(hash)));
                }

                let head = client.block_number().await;
                let head = self.observe(idx, head)?;
                if head + 1 >= block_number + confirmations {
                    return Ok(block_number);
                }
            }

            sleep(self.poll_interval).await;
        }
    }
}
