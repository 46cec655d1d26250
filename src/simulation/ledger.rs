// src/simulation/ledger.rs

use crate::connectors::{ChainError, ReceiptInfo};
use crate::traits::LedgerClient;
use alloy::consensus::TxEnvelope;
use alloy::eips::eip2718::Decodable2718;
use alloy::primitives::{Address, Bytes, TxKind, B256, U256};
use async_trait::async_trait;
use log::info;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Default gas price of a fresh ledger (20 gwei).
const DEFAULT_GAS_PRICE: u128 = 20_000_000_000;

/// A transfer accepted by the simulated ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedTransfer {
    pub hash: B256,
    pub to: Address,
    pub value: U256,
    pub gas_price: u128,
    pub nonce: u64,
}

#[derive(Debug)]
struct LedgerState {
    reachable: bool,
    reject_broadcasts: bool,
    auto_confirm: bool,
    block: u64,
    gas_price: u128,
    balances: HashMap<Address, U256>,
    nonce: u64,
    receipts: HashMap<B256, ReceiptInfo>,
    pending: Vec<B256>,
    transfers: Vec<SimulatedTransfer>,
}

/// An in-memory ledger that accepts signed transfers from one custodial
/// account.
///
/// Transfers are decoded, debited from the custodian (value plus gas) and
/// credited to the recipient. With auto-confirm on (the default) each
/// accepted transfer is mined into its own block immediately.
pub struct SimulatedLedger {
    name: String,
    custodian: Address,
    state: Mutex<LedgerState>,
}

impl SimulatedLedger {
    pub fn new(custodian: Address) -> Self {
        Self::named("simulated", custodian)
    }

    pub fn named(name: impl Into<String>, custodian: Address) -> Self {
        Self {
            name: name.into(),
            custodian,
            state: Mutex::new(LedgerState {
                reachable: true,
                reject_broadcasts: false,
                auto_confirm: true,
                block: 1,
                gas_price: DEFAULT_GAS_PRICE,
                balances: HashMap::new(),
                nonce: 0,
                receipts: HashMap::new(),
                pending: Vec::new(),
                transfers: Vec::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_reachable(&self) -> Result<MutexGuard<'_, LedgerState>, ChainError> {
        let state = self.state();
        if !state.reachable {
            return Err(ChainError::Transport(format!("{} is unreachable", self.name)));
        }
        Ok(state)
    }

    /// Adds `amount` wei to `address`.
    pub fn fund(&self, address: Address, amount: U256) {
        let mut state = self.state();
        let balance = state.balances.entry(address).or_insert(U256::ZERO);
        *balance += amount;
    }

    /// Overwrites the balance of `address`.
    pub fn set_balance(&self, address: Address, amount: U256) {
        self.state().balances.insert(address, amount);
    }

    pub fn balance_of(&self, address: Address) -> U256 {
        self.state().balances.get(&address).copied().unwrap_or(U256::ZERO)
    }

    /// Simulates the endpoint going down (transport errors on every call).
    pub fn set_reachable(&self, reachable: bool) {
        self.state().reachable = reachable;
    }

    /// Makes `eth_sendRawTransaction` answer with an RPC error.
    pub fn set_reject_broadcasts(&self, reject: bool) {
        self.state().reject_broadcasts = reject;
    }

    pub fn set_auto_confirm(&self, auto_confirm: bool) {
        self.state().auto_confirm = auto_confirm;
    }

    pub fn set_gas_price(&self, gas_price: u128) {
        self.state().gas_price = gas_price;
    }

    /// Mines one block holding every pending transfer.
    pub fn mine_pending(&self) {
        let mut state = self.state();
        state.block += 1;
        let block = state.block;
        let pending = std::mem::take(&mut state.pending);
        for hash in pending {
            state.receipts.insert(
                hash,
                ReceiptInfo {
                    block_number: block,
                    success: true,
                },
            );
        }
    }

    /// Advances the chain head without including anything.
    pub fn advance_blocks(&self, count: u64) {
        self.state().block += count;
    }

    pub fn transfers(&self) -> Vec<SimulatedTransfer> {
        self.state().transfers.clone()
    }
}

#[async_trait]
impl LedgerClient for SimulatedLedger {
    fn endpoint(&self) -> &str {
        &self.name
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        Ok(self.check_reachable()?.block)
    }

    async fn balance(&self, address: Address) -> Result<U256, ChainError> {
        let state = self.check_reachable()?;
        Ok(state.balances.get(&address).copied().unwrap_or(U256::ZERO))
    }

    async fn gas_price(&self) -> Result<u128, ChainError> {
        Ok(self.check_reachable()?.gas_price)
    }

    async fn transaction_count(&self, address: Address) -> Result<u64, ChainError> {
        let state = self.check_reachable()?;
        Ok(if address == self.custodian { state.nonce } else { 0 })
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<B256, ChainError> {
        let mut state = self.check_reachable()?;
        if state.reject_broadcasts {
            return Err(ChainError::Rpc {
                code: -32000,
                message: "transaction rejected".to_string(),
            });
        }

        let mut buf: &[u8] = raw.as_ref();
        let envelope = TxEnvelope::decode_2718(&mut buf).map_err(|e| ChainError::Decode(e.to_string()))?;
        let TxEnvelope::Legacy(signed) = envelope else {
            return Err(ChainError::Decode("only legacy transfers are supported".to_string()));
        };

        let hash = *signed.hash();
        let tx = signed.tx();
        let to = match tx.to {
            TxKind::Call(to) => to,
            TxKind::Create => {
                return Err(ChainError::Rpc {
                    code: -32000,
                    message: "contract creation not supported".to_string(),
                })
            }
        };

        if tx.nonce != state.nonce {
            return Err(ChainError::Rpc {
                code: -32000,
                message: format!("nonce mismatch: expected {}, got {}", state.nonce, tx.nonce),
            });
        }

        let cost = tx.value + U256::from(tx.gas_price) * U256::from(tx.gas_limit);
        let available = state.balances.get(&self.custodian).copied().unwrap_or(U256::ZERO);
        if available < cost {
            return Err(ChainError::Rpc {
                code: -32000,
                message: "insufficient funds for gas * price + value".to_string(),
            });
        }

        state.balances.insert(self.custodian, available - cost);
        *state.balances.entry(to).or_insert(U256::ZERO) += tx.value;
        state.nonce += 1;
        state.transfers.push(SimulatedTransfer {
            hash,
            to,
            value: tx.value,
            gas_price: tx.gas_price,
            nonce: tx.nonce,
        });

        if state.auto_confirm {
            state.block += 1;
            let block = state.block;
            state.receipts.insert(
                hash,
                ReceiptInfo {
                    block_number: block,
                    success: true,
                },
            );
        } else {
            state.pending.push(hash);
        }

        info!("SimulatedLedger[{}]: Accepted transfer of {} wei to {}", self.name, tx.value, to);
        Ok(hash)
    }

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<ReceiptInfo>, ChainError> {
        Ok(self.check_reachable()?.receipts.get(&hash).copied())
    }
}
