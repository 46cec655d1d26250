// src/config.rs
//
// Configuration file parsing. Every section is optional; missing values fall
// back to the defaults below. A few settings can be overridden from the
// environment so secrets stay out of the file.

use crate::engine::{EngineSettings, FlashSettings};
use crate::withdrawal::{WithdrawalPolicy, DEFAULT_RECIPIENT};
use alloy::primitives::utils::parse_ether;
use alloy::primitives::{Address, U256};
use alloy::signers::local::PrivateKeySigner;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

// =============================================================================
// Configuration Types
// =============================================================================

/// Root configuration structure.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default)]
    pub chain: ChainConfig,
}

/// HTTP listener and logging.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Default log filter when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            log_level: default_log_level(),
        }
    }
}

fn default_port() -> u16 {
    3001
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Trade loop and strategy catalog.
#[derive(Debug, Deserialize)]
pub struct TradingConfig {
    /// Trades per one-second window
    #[serde(default = "default_target_tps")]
    pub target_tps: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    #[serde(default = "default_strategy_count")]
    pub strategy_count: usize,
    /// Size of the execution pool (highest-APY strategies)
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    /// Quote-currency price of one ETH
    #[serde(default = "default_reference_price")]
    pub reference_price: f64,
    #[serde(default = "default_flash_interval_secs")]
    pub flash_interval_secs: u64,
    /// Flash settlement notional, in ETH
    #[serde(default = "default_flash_notional")]
    pub flash_notional: f64,
    /// Trading flag at startup
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            target_tps: default_target_tps(),
            batch_size: default_batch_size(),
            strategy_count: default_strategy_count(),
            top_n: default_top_n(),
            reference_price: default_reference_price(),
            flash_interval_secs: default_flash_interval_secs(),
            flash_notional: default_flash_notional(),
            enabled: default_true(),
        }
    }
}

fn default_target_tps() -> u64 {
    1000
}

fn default_batch_size() -> u64 {
    10
}

fn default_strategy_count() -> usize {
    450
}

fn default_top_n() -> usize {
    50
}

fn default_reference_price() -> f64 {
    3450.0
}

fn default_flash_interval_secs() -> u64 {
    5
}

fn default_flash_notional() -> f64 {
    100.0
}

fn default_true() -> bool {
    true
}

/// Ledger endpoints, custodial key and withdrawal limits.
#[derive(Debug, Deserialize)]
pub struct ChainConfig {
    /// Candidate JSON-RPC endpoints, tried in order
    #[serde(default = "default_rpc_urls")]
    pub rpc_urls: Vec<String>,
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
    /// Hex private key of the custodial account. Prefer TREASURY_PRIVATE_KEY.
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default = "default_recipient")]
    pub default_recipient: String,
    /// Address shown on the dashboard as the fee recipient
    #[serde(default = "default_recipient")]
    pub fee_recipient: String,
    #[serde(default = "default_min_reserve_eth")]
    pub min_reserve_eth: f64,
    #[serde(default = "default_fee_buffer_eth")]
    pub fee_buffer_eth: f64,
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_explorer_tx_url")]
    pub explorer_tx_url: String,
    /// Starting balance of the simulated custodial account (demo mode)
    #[serde(default = "default_demo_balance_eth")]
    pub demo_balance_eth: f64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_urls: default_rpc_urls(),
            chain_id: default_chain_id(),
            private_key: None,
            default_recipient: default_recipient(),
            fee_recipient: default_recipient(),
            min_reserve_eth: default_min_reserve_eth(),
            fee_buffer_eth: default_fee_buffer_eth(),
            confirmations: default_confirmations(),
            confirmation_timeout_secs: default_confirmation_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            explorer_tx_url: default_explorer_tx_url(),
            demo_balance_eth: default_demo_balance_eth(),
        }
    }
}

fn default_rpc_urls() -> Vec<String> {
    vec![
        "https://ethereum-rpc.publicnode.com".to_string(),
        "https://eth.drpc.org".to_string(),
        "https://rpc.ankr.com/eth".to_string(),
    ]
}

fn default_chain_id() -> u64 {
    1
}

fn default_recipient() -> String {
    DEFAULT_RECIPIENT.to_string()
}

fn default_min_reserve_eth() -> f64 {
    0.01
}

fn default_fee_buffer_eth() -> f64 {
    0.003
}

fn default_confirmations() -> u64 {
    1
}

fn default_confirmation_timeout_secs() -> u64 {
    300
}

fn default_poll_interval_ms() -> u64 {
    3000
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_explorer_tx_url() -> String {
    "https://etherscan.io/tx/".to_string()
}

fn default_demo_balance_eth() -> f64 {
    5.0
}

// =============================================================================
// Configuration Loading
// =============================================================================

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        Self::from_str(&contents)
    }

    /// Parse configuration from a TOML string.
    pub fn from_str(s: &str) -> Result<Self, String> {
        toml::from_str(s).map_err(|e| format!("Failed to parse config: {}", e))
    }

    /// Applies PORT, TREASURY_PRIVATE_KEY and RPC_URLS from the process
    /// environment.
    pub fn apply_env(&mut self) -> Result<(), String> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup`. Empty values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(port) = lookup("PORT") {
            self.server.port = port
                .trim()
                .parse()
                .map_err(|_| format!("Invalid PORT: {}", port))?;
        }
        if let Some(key) = lookup("TREASURY_PRIVATE_KEY") {
            self.chain.private_key = Some(key.trim().to_string());
        }
        if let Some(urls) = lookup("RPC_URLS") {
            self.chain.rpc_urls = urls
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(str::to_string)
                .collect();
        }
        Ok(())
    }

    /// Checks values that would otherwise fail at runtime. `require_rpc` is
    /// set in live mode, where at least one endpoint is needed.
    pub fn validate(&self, require_rpc: bool) -> Result<(), String> {
        if self.trading.target_tps == 0 {
            return Err("trading.target_tps must be positive".to_string());
        }
        if self.trading.batch_size == 0 {
            return Err("trading.batch_size must be positive".to_string());
        }
        if self.trading.strategy_count == 0 {
            return Err("trading.strategy_count must be positive".to_string());
        }
        if !(self.trading.reference_price.is_finite() && self.trading.reference_price > 0.0) {
            return Err("trading.reference_price must be positive".to_string());
        }
        if self.chain.confirmation_timeout_secs == 0 {
            return Err("chain.confirmation_timeout_secs must be positive".to_string());
        }
        if require_rpc && self.chain.rpc_urls.is_empty() {
            return Err("chain.rpc_urls must list at least one endpoint".to_string());
        }

        self.chain.default_recipient_address()?;
        self.chain.fee_recipient_address()?;
        self.chain.min_reserve_wei()?;
        self.chain.fee_buffer_wei()?;
        Ok(())
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            target_tps: self.trading.target_tps,
            batch_size: self.trading.batch_size,
            flash: FlashSettings {
                notional: self.trading.flash_notional,
                reference_price: self.trading.reference_price,
                interval: Duration::from_secs(self.trading.flash_interval_secs.max(1)),
            },
        }
    }

    pub fn withdrawal_policy(&self) -> Result<WithdrawalPolicy, String> {
        Ok(WithdrawalPolicy {
            default_recipient: self.chain.default_recipient_address()?,
            min_reserve: self.chain.min_reserve_wei()?,
            fee_buffer: self.chain.fee_buffer_wei()?,
            reference_price: self.trading.reference_price,
            confirmations: self.chain.confirmations.max(1),
            confirmation_timeout: Duration::from_secs(self.chain.confirmation_timeout_secs),
            explorer_tx_url: self.chain.explorer_tx_url.clone(),
        })
    }
}

impl ChainConfig {
    pub fn default_recipient_address(&self) -> Result<Address, String> {
        parse_address("chain.default_recipient", &self.default_recipient)
    }

    pub fn fee_recipient_address(&self) -> Result<Address, String> {
        parse_address("chain.fee_recipient", &self.fee_recipient)
    }

    pub fn min_reserve_wei(&self) -> Result<U256, String> {
        parse_eth_amount("chain.min_reserve_eth", self.min_reserve_eth)
    }

    pub fn fee_buffer_wei(&self) -> Result<U256, String> {
        parse_eth_amount("chain.fee_buffer_eth", self.fee_buffer_eth)
    }

    pub fn demo_balance_wei(&self) -> Result<U256, String> {
        parse_eth_amount("chain.demo_balance_eth", self.demo_balance_eth)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// Signing identity from `private_key`, if one is configured.
    pub fn signer(&self) -> Result<Option<PrivateKeySigner>, String> {
        match &self.private_key {
            Some(key) => key
                .trim()
                .parse::<PrivateKeySigner>()
                .map(Some)
                .map_err(|e| format!("Invalid private key: {}", e)),
            None => Ok(None),
        }
    }
}

fn parse_address(field: &str, value: &str) -> Result<Address, String> {
    Address::from_str(value.trim()).map_err(|_| format!("{} is not a valid address: {}", field, value))
}

fn parse_eth_amount(field: &str, value: f64) -> Result<U256, String> {
    if !value.is_finite() || value < 0.0 {
        return Err(format!("{} must be a non-negative number", field));
    }
    parse_ether(&value.to_string()).map_err(|e| format!("{}: {}", field, e))
}

// =============================================================================
// Default Configuration
// =============================================================================

/// Returns a default configuration string for documentation.
pub fn default_config_template() -> &'static str {
    r#"# Yield Engine Configuration
#
# Every section is optional. PORT, TREASURY_PRIVATE_KEY and RPC_URLS
# (comma separated) override the matching values below.

[server]
port = 3001
log_level = "info"

[trading]
# Trades per one-second window, executed in batches
target_tps = 1000
batch_size = 10
strategy_count = 450
# Trades are drawn from the top_n strategies by APY
top_n = 50
reference_price = 3450.0
flash_interval_secs = 5
flash_notional = 100.0
enabled = true

[chain]
rpc_urls = [
    "https://ethereum-rpc.publicnode.com",
    "https://eth.drpc.org",
    "https://rpc.ankr.com/eth",
]
chain_id = 1
# private_key = "0x..."
default_recipient = "0x89226Fc817904c6E745dF27802d0c9D4c94573F1"
fee_recipient = "0x89226Fc817904c6E745dF27802d0c9D4c94573F1"
min_reserve_eth = 0.01
fee_buffer_eth = 0.003
confirmations = 1
confirmation_timeout_secs = 300
poll_interval_ms = 3000
request_timeout_secs = 10
explorer_tx_url = "https://etherscan.io/tx/"

# Demo mode only
demo_balance_eth = 5.0
"#
}

// =============================================================================
// Tests
// =============================================================================
