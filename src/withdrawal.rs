// src/withdrawal.rs
//
// Custodial withdrawals: validate, check funds, sign, broadcast, confirm,
// reconcile earnings.

use crate::connectors::{ChainConnector, ChainError, TransferRequest};
use crate::models::{AmountField, SharedState, WithdrawalReceipt, WithdrawalRequest};
use alloy::primitives::utils::{format_ether, parse_ether};
use alloy::primitives::{address, hex, Address, U256};
use log::{debug, error, info, warn};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

/// Recipient used when a request names none.
pub const DEFAULT_RECIPIENT: Address = address!("89226fc817904c6e745df27802d0c9d4c94573f1");

/// Below this balance the custodial account needs funding (0.01 ETH).
pub const DEFAULT_MIN_RESERVE_WEI: u64 = 10_000_000_000_000_000;

/// Headroom kept for network fees on top of the requested amount (0.003 ETH).
pub const DEFAULT_FEE_BUFFER_WEI: u64 = 3_000_000_000_000_000;

#[derive(Debug, Error)]
pub enum WithdrawalError {
    #[error("ledger connector unavailable: {0}")]
    ConnectorUnavailable(#[source] ChainError),
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("invalid recipient address: {0}")]
    InvalidRecipient(String),
    #[error("treasury needs funding: balance {balance_eth} ETH is below the {reserve_eth} ETH reserve")]
    InsufficientReserve { balance_eth: String, reserve_eth: String },
    #[error("insufficient balance: {balance_eth} ETH available, {required_eth} ETH required")]
    InsufficientFunds { balance_eth: String, required_eth: String },
    #[error("transaction failed: {0}")]
    TransactionFailed(#[source] ChainError),
    #[error("transaction {tx_hash} not confirmed: {source}")]
    ConfirmationTimeout {
        tx_hash: String,
        #[source]
        source: ChainError,
    },
    #[error("another withdrawal is in progress")]
    WithdrawalInProgress,
    #[error("withdrawal task aborted: {0}")]
    Internal(String),
}

impl WithdrawalError {
    /// Stable machine-readable reason.
    pub fn code(&self) -> &'static str {
        match self {
            WithdrawalError::ConnectorUnavailable(_) => "connector_unavailable",
            WithdrawalError::InvalidAmount(_) => "invalid_amount",
            WithdrawalError::InvalidRecipient(_) => "invalid_recipient",
            WithdrawalError::InsufficientReserve { .. } => "insufficient_reserve",
            WithdrawalError::InsufficientFunds { .. } => "insufficient_funds",
            WithdrawalError::TransactionFailed(_) => "transaction_failed",
            WithdrawalError::ConfirmationTimeout { .. } => "confirmation_timeout",
            WithdrawalError::WithdrawalInProgress => "withdrawal_in_progress",
            WithdrawalError::Internal(_) => "internal_error",
        }
    }

    /// Hash of a broadcast transaction whose outcome is unknown.
    pub fn pending_tx_hash(&self) -> Option<&str> {
        match self {
            WithdrawalError::ConfirmationTimeout { tx_hash, .. } => Some(tx_hash),
            _ => None,
        }
    }
}

/// Steps of a withdrawal, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WithdrawalStage {
    Validate,
    CheckBalance,
    EstimateFee,
    BuildTransaction,
    Broadcast,
    AwaitConfirmation,
    Reconcile,
}

impl fmt::Display for WithdrawalStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WithdrawalStage::Validate => "validate",
            WithdrawalStage::CheckBalance => "check-balance",
            WithdrawalStage::EstimateFee => "estimate-fee",
            WithdrawalStage::BuildTransaction => "build-sign",
            WithdrawalStage::Broadcast => "broadcast",
            WithdrawalStage::AwaitConfirmation => "await-confirmation",
            WithdrawalStage::Reconcile => "reconcile",
        };
        write!(f, "{}", name)
    }
}

/// Fixed limits and constants applied to every withdrawal.
#[derive(Debug, Clone)]
pub struct WithdrawalPolicy {
    pub default_recipient: Address,
    pub min_reserve: U256,
    pub fee_buffer: U256,
    /// Quote-currency price of one unit of the withdrawn asset.
    pub reference_price: f64,
    pub confirmations: u64,
    pub confirmation_timeout: Duration,
    /// Prefix the transaction hash is appended to.
    pub explorer_tx_url: String,
}

impl Default for WithdrawalPolicy {
    fn default() -> Self {
        Self {
            default_recipient: DEFAULT_RECIPIENT,
            min_reserve: U256::from(DEFAULT_MIN_RESERVE_WEI),
            fee_buffer: U256::from(DEFAULT_FEE_BUFFER_WEI),
            reference_price: 3450.0,
            confirmations: 1,
            confirmation_timeout: Duration::from_secs(300),
            explorer_tx_url: "https://etherscan.io/tx/".to_string(),
        }
    }
}

/// A request that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedWithdrawal {
    pub recipient: Address,
    pub amount_eth: f64,
    pub value: U256,
}

/// Runs withdrawals against the custodial account.
///
/// At most one withdrawal runs at a time; a second request while one is in
/// flight fails with `WithdrawalInProgress` instead of racing on the nonce.
pub struct WithdrawalExecutor {
    connector: Arc<ChainConnector>,
    state: SharedState,
    policy: WithdrawalPolicy,
    in_flight: Mutex<()>,
}

impl WithdrawalExecutor {
    pub fn new(connector: Arc<ChainConnector>, state: SharedState, policy: WithdrawalPolicy) -> Self {
        Self {
            connector,
            state,
            policy,
            in_flight: Mutex::new(()),
        }
    }

    pub fn connector(&self) -> &Arc<ChainConnector> {
        &self.connector
    }

    /// Resolves defaults and checks recipient and amount. No side effects.
    pub fn validate(&self, request: &WithdrawalRequest) -> Result<ValidatedWithdrawal, WithdrawalError> {
        let recipient = match request.recipient() {
            Some(raw) => Address::from_str(raw).map_err(|_| WithdrawalError::InvalidRecipient(raw.to_string()))?,
            None => self.policy.default_recipient,
        };
        let (amount_eth, value) = parse_amount(request.requested_amount())?;

        Ok(ValidatedWithdrawal {
            recipient,
            amount_eth,
            value,
        })
    }

    /// Balance gate: reserve first, then amount plus fee buffer.
    pub fn check_balance(&self, balance: U256, value: U256) -> Result<(), WithdrawalError> {
        if balance < self.policy.min_reserve {
            return Err(WithdrawalError::InsufficientReserve {
                balance_eth: format_ether(balance),
                reserve_eth: format_ether(self.policy.min_reserve),
            });
        }

        let required = value.saturating_add(self.policy.fee_buffer);
        if balance < required {
            return Err(WithdrawalError::InsufficientFunds {
                balance_eth: format_ether(balance),
                required_eth: format_ether(required),
            });
        }
        Ok(())
    }

    /// Runs the full state machine for one request. No step is retried.
    pub async fn execute(&self, request: &WithdrawalRequest) -> Result<WithdrawalReceipt, WithdrawalError> {
        let withdrawal = self.validate(request).map_err(|e| {
            warn!("Withdrawal[{}]: {}", WithdrawalStage::Validate, e);
            e
        })?;

        let _in_flight = self
            .in_flight
            .try_lock()
            .map_err(|_| WithdrawalError::WithdrawalInProgress)?;

        info!(
            "Withdrawal: {} ETH to {} requested",
            withdrawal.amount_eth, withdrawal.recipient
        );

        let result = self.run(&withdrawal).await;
        if let Err(e) = &result {
            error!("Withdrawal: {} ETH to {} failed: {}", withdrawal.amount_eth, withdrawal.recipient, e);
        }
        result
    }

    /// Runs `execute` on its own task so that dropping the caller (e.g. a
    /// disconnected HTTP client) cannot cancel a broadcast transfer.
    pub async fn execute_detached(
        self: Arc<Self>,
        request: WithdrawalRequest,
    ) -> Result<WithdrawalReceipt, WithdrawalError> {
        tokio::spawn(async move { self.execute(&request).await })
            .await
            .map_err(|e| WithdrawalError::Internal(e.to_string()))?
    }

    async fn run(&self, withdrawal: &ValidatedWithdrawal) -> Result<WithdrawalReceipt, WithdrawalError> {
        debug!("Withdrawal[{}]", WithdrawalStage::CheckBalance);
        self.connector
            .ensure_connected()
            .await
            .map_err(WithdrawalError::ConnectorUnavailable)?;
        let balance = self
            .connector
            .custodial_balance()
            .await
            .map_err(WithdrawalError::ConnectorUnavailable)?;
        self.check_balance(balance, withdrawal.value)?;

        debug!("Withdrawal[{}]", WithdrawalStage::EstimateFee);
        let gas_price = self
            .connector
            .fee_estimate()
            .await
            .map_err(WithdrawalError::ConnectorUnavailable)?;

        debug!("Withdrawal[{}] gas price {} wei", WithdrawalStage::BuildTransaction, gas_price);
        let transfer = TransferRequest {
            to: withdrawal.recipient,
            value: withdrawal.value,
            gas_price,
        };

        debug!("Withdrawal[{}]", WithdrawalStage::Broadcast);
        let hash = self
            .connector
            .sign_and_broadcast(&transfer)
            .await
            .map_err(WithdrawalError::TransactionFailed)?;
        let tx_hash = hex::encode_prefixed(hash);

        // Past this point the transfer is out; only confirmation is awaited.
        debug!("Withdrawal[{}] {}", WithdrawalStage::AwaitConfirmation, tx_hash);
        let block_number = self
            .connector
            .wait_for_confirmation(hash, self.policy.confirmations, self.policy.confirmation_timeout)
            .await
            .map_err(|source| WithdrawalError::ConfirmationTimeout {
                tx_hash: tx_hash.clone(),
                source,
            })?;

        debug!("Withdrawal[{}]", WithdrawalStage::Reconcile);
        let debit = withdrawal.amount_eth * self.policy.reference_price;
        let remaining = self.state.lock().global.debit_earnings(debit);

        info!(
            "Withdrawal: {} ETH to {} confirmed in block {} ({}), earnings now ${:.2}",
            withdrawal.amount_eth, withdrawal.recipient, block_number, tx_hash, remaining
        );

        Ok(WithdrawalReceipt {
            explorer_url: format!("{}{}", self.policy.explorer_tx_url, tx_hash),
            tx_hash,
            recipient: withdrawal.recipient.to_string(),
            amount_eth: withdrawal.amount_eth,
            block_number,
        })
    }
}

/// Parses a positive, finite ether amount into (ether, wei).
fn parse_amount(field: Option<&AmountField>) -> Result<(f64, U256), WithdrawalError> {
    let amount = match field {
        None => return Err(WithdrawalError::InvalidAmount("missing amount".to_string())),
        Some(AmountField::Number(n)) => *n,
        Some(AmountField::Text(s)) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| WithdrawalError::InvalidAmount(format!("{:?} is not a number", s)))?,
        Some(AmountField::Other(v)) => {
            return Err(WithdrawalError::InvalidAmount(format!("{} is not a number", v)))
        }
    };

    if !amount.is_finite() || amount <= 0.0 {
        return Err(WithdrawalError::InvalidAmount(format!(
            "{} is not a positive amount",
            amount
        )));
    }

    let value = parse_ether(&amount.to_string())
        .map_err(|e| WithdrawalError::InvalidAmount(format!("{}: {}", amount, e)))?;
    if value.is_zero() {
        return Err(WithdrawalError::InvalidAmount(format!("{} rounds to zero wei", amount)));
    }
    Ok((amount, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ThroughputScheduler;
    use crate::models::EngineState;
    use crate::simulation::{SequenceRandom, SimulatedLedger};
    use crate::strategy::StrategyBook;
    use crate::traits::SharedLedgerClient;
    use alloy::signers::local::PrivateKeySigner;

    const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    struct Fixture {
        ledger: Arc<SimulatedLedger>,
        state: SharedState,
        executor: Arc<WithdrawalExecutor>,
        custodian: Address,
    }

    fn setup(balance_eth: &str) -> Fixture {
        let signer: PrivateKeySigner = TEST_KEY.parse().unwrap();
        let custodian = signer.address();
        let ledger = Arc::new(SimulatedLedger::new(custodian));
        ledger.set_balance(custodian, parse_ether(balance_eth).unwrap());
        ledger.set_gas_price(1);

        let connector = ChainConnector::new(vec![ledger.clone() as SharedLedgerClient], signer, 1)
            .with_poll_interval(Duration::from_millis(5));
        let book = StrategyBook::with_default_protocols(10, 3450.0, 5).unwrap();
        let state = SharedState::new(EngineState::new(book, true));
        let policy = WithdrawalPolicy {
            confirmation_timeout: Duration::from_millis(200),
            ..WithdrawalPolicy::default()
        };
        let executor = Arc::new(WithdrawalExecutor::new(Arc::new(connector), state.clone(), policy));

        Fixture {
            ledger,
            state,
            executor,
            custodian,
        }
    }

    fn request(amount: AmountField) -> WithdrawalRequest {
        WithdrawalRequest::new(Some("0x1111111111111111111111111111111111111111"), amount)
    }

    #[tokio::test]
    async fn test_invalid_amounts() {
        let fx = setup("1");
        // Unreachable ledger proves validation fails before any chain call.
        fx.ledger.set_reachable(false);

        for amount in [
            AmountField::Number(0.0),
            AmountField::Number(-1.0),
            AmountField::Text("abc".to_string()),
            AmountField::Text("NaN".to_string()),
            AmountField::Text("inf".to_string()),
            AmountField::Text("0.0000000000000000001".to_string()),
        ] {
            let err = fx.executor.execute(&request(amount.clone())).await.unwrap_err();
            assert_eq!(err.code(), "invalid_amount", "amount {:?}", amount);
        }

        let err = fx.executor.execute(&WithdrawalRequest::default()).await.unwrap_err();
        assert_eq!(err.code(), "invalid_amount");
    }

    #[tokio::test]
    async fn test_invalid_recipient() {
        let fx = setup("1");
        let req = WithdrawalRequest::new(Some("0xnot-an-address"), AmountField::Number(0.1));
        let err = fx.executor.execute(&req).await.unwrap_err();
        assert_eq!(err.code(), "invalid_recipient");
    }

    #[tokio::test]
    async fn test_reserve_checked_before_amount() {
        let fx = setup("0.005");
        let err = fx
            .executor
            .execute(&request(AmountField::Number(0.0001)))
            .await
            .unwrap_err();
        assert!(matches!(err, WithdrawalError::InsufficientReserve { .. }));
        assert!(fx.ledger.transfers().is_empty());
    }

    #[tokio::test]
    async fn test_fee_buffer_enforced() {
        let fx = setup("1");
        let err = fx
            .executor
            .execute(&request(AmountField::Number(0.998)))
            .await
            .unwrap_err();
        assert!(matches!(err, WithdrawalError::InsufficientFunds { .. }));

        // Exactly amount + buffer is enough.
        fx.executor
            .execute(&request(AmountField::Text("0.997".to_string())))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_success_reconciles_earnings() {
        let fx = setup("2");
        fx.state.lock().global.total_earned = 5000.0;

        let receipt = fx
            .executor
            .execute(&request(AmountField::Number(1.0)))
            .await
            .unwrap();

        assert!(receipt.tx_hash.starts_with("0x"));
        assert_eq!(receipt.explorer_url, format!("https://etherscan.io/tx/{}", receipt.tx_hash));
        assert!((fx.state.global().total_earned - 1550.0).abs() < 1e-9);

        let sent = fx.ledger.transfers();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, Address::repeat_byte(0x11));
        assert_eq!(sent[0].value, parse_ether("1").unwrap());
        assert_eq!(hex::encode_prefixed(sent[0].hash), receipt.tx_hash);

        // Second withdrawal exceeds remaining earnings: clamped at zero.
        fx.executor
            .execute(&request(AmountField::Number(0.5)))
            .await
            .unwrap();
        assert_eq!(fx.state.global().total_earned, 0.0);
        assert!(fx.ledger.balance_of(fx.custodian) < parse_ether("0.5").unwrap());
    }

    #[tokio::test]
    async fn test_default_recipient() {
        let fx = setup("1");
        let req = WithdrawalRequest {
            amount_eth: Some(AmountField::Text("0.1".to_string())),
            ..Default::default()
        };
        let receipt = fx.executor.execute(&req).await.unwrap();
        assert_eq!(receipt.recipient, DEFAULT_RECIPIENT.to_string());
        assert_eq!(fx.ledger.transfers()[0].to, DEFAULT_RECIPIENT);
    }

    #[tokio::test]
    async fn test_broadcast_rejection_is_transaction_failed() {
        let fx = setup("1");
        fx.state.lock().global.total_earned = 100.0;
        fx.ledger.set_reject_broadcasts(true);

        let err = fx
            .executor
            .execute(&request(AmountField::Number(0.1)))
            .await
            .unwrap_err();
        assert!(matches!(err, WithdrawalError::TransactionFailed(ChainError::Rpc { .. })));
        assert_eq!(fx.state.global().total_earned, 100.0);
    }

    #[tokio::test]
    async fn test_unconfirmed_is_timeout_not_revert() {
        let fx = setup("1");
        fx.state.lock().global.total_earned = 100.0;
        fx.ledger.set_auto_confirm(false);

        let err = fx
            .executor
            .execute(&request(AmountField::Number(0.1)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "confirmation_timeout");
        let hash = err.pending_tx_hash().unwrap();
        assert_eq!(hash, hex::encode_prefixed(fx.ledger.transfers()[0].hash));
        assert_eq!(fx.state.global().total_earned, 100.0);
    }

    #[tokio::test]
    async fn test_unreachable_ledger() {
        let fx = setup("1");
        fx.ledger.set_reachable(false);
        let err = fx
            .executor
            .execute(&request(AmountField::Number(0.1)))
            .await
            .unwrap_err();
        assert!(matches!(err, WithdrawalError::ConnectorUnavailable(ChainError::Unavailable)));
    }

    #[tokio::test]
    async fn test_concurrent_withdrawal_rejected() {
        let fx = setup("1");
        fx.ledger.set_auto_confirm(false);

        let first = tokio::spawn(fx.executor.clone().execute_detached(request(AmountField::Number(0.1))));
        tokio::time::sleep(Duration::from_millis(30)).await;

        let err = fx
            .executor
            .execute(&request(AmountField::Number(0.1)))
            .await
            .unwrap_err();
        assert!(matches!(err, WithdrawalError::WithdrawalInProgress));

        fx.ledger.mine_pending();
        first.await.unwrap().unwrap();
        assert_eq!(fx.ledger.transfers().len(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_reads_earnings_after_confirmation() {
        let fx = setup("2");
        fx.ledger.set_auto_confirm(false);
        fx.state.lock().global.total_earned = 5000.0;

        let pending = tokio::spawn(fx.executor.clone().execute_detached(request(AmountField::Number(1.0))));
        for _ in 0..100 {
            if !fx.ledger.transfers().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(fx.ledger.transfers().len(), 1);

        // The trade loop keeps crediting while the transfer waits for a block.
        let before = fx.state.global();
        let mut scheduler = ThroughputScheduler::new(
            fx.state.clone(),
            200,
            10,
            Duration::from_secs(1),
            Box::new(SequenceRandom::constant(0.5)),
        );
        let report = scheduler.run_window().await;
        assert_eq!(report.credited, 200);

        let during = fx.state.global();
        assert_eq!(during.total_trades, before.total_trades + 200);
        let credited = during.total_earned - before.total_earned;
        assert!(credited > 0.0);

        fx.ledger.mine_pending();
        pending.await.unwrap().unwrap();

        let expected = (5000.0 + credited - 3450.0_f64).max(0.0);
        assert!((fx.state.global().total_earned - expected).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_zero_amount_eth_falls_back_to_amount() {
        let fx = setup("1");
        let req = WithdrawalRequest {
            amount_eth: Some(AmountField::Number(0.0)),
            amount: Some(AmountField::Number(0.1)),
            ..Default::default()
        };
        let receipt = fx.executor.execute(&req).await.unwrap();
        assert_eq!(receipt.amount_eth, 0.1);
        assert_eq!(fx.ledger.transfers()[0].value, parse_ether("0.1").unwrap());
    }

    #[tokio::test]
    async fn test_non_numeric_amount_is_invalid() {
        let fx = setup("1");
        let err = fx
            .executor
            .execute(&request(AmountField::Other(serde_json::Value::Bool(true))))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_amount");
    }

    #[test]
    fn test_parse_amount() {
        let (eth, wei) = parse_amount(Some(&AmountField::Text(" 0.25 ".to_string()))).unwrap();
        assert_eq!(eth, 0.25);
        assert_eq!(wei, parse_ether("0.25").unwrap());
        assert!(parse_amount(None).is_err());
    }
}
