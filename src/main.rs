// src/main.rs
//
// Yield engine: synthetic trade loop, earnings counters and a custodial
// withdrawal API over one HTTP server.

use alloy::signers::local::PrivateKeySigner;
use clap::Parser;
use log::{info, warn};
use std::sync::Arc;
use yield_engine::config::{default_config_template, Config};
use yield_engine::connectors::{ChainConnector, RpcClient};
use yield_engine::dashboard::{DashboardServer, DashboardSettings, DashboardState};
use yield_engine::engine::Engine;
use yield_engine::models::{EngineState, SharedState};
use yield_engine::simulation::SimulatedLedger;
use yield_engine::strategy::StrategyBook;
use yield_engine::traits::SharedLedgerClient;
use yield_engine::withdrawal::WithdrawalExecutor;

/// Well-known development key, only ever used against the simulated ledger.
const DEMO_PRIVATE_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

#[derive(Parser)]
#[command(name = "yield-engine")]
#[command(about = "Synthetic yield engine with a custodial withdrawal API")]
struct Args {
    /// Mode of operation: live (JSON-RPC endpoints) or demo (simulated ledger)
    #[arg(long, default_value = "live")]
    mode: String,

    /// Path to configuration file (TOML)
    #[arg(long, short)]
    config: Option<String>,

    /// HTTP port, overrides config and PORT
    #[arg(long)]
    port: Option<u16>,

    /// Generate a default configuration file
    #[arg(long)]
    generate_config: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();

    // Handle config generation
    if args.generate_config {
        println!("{}", default_config_template());
        return;
    }

    let demo = match args.mode.as_str() {
        "live" => false,
        "demo" => true,
        _ => {
            eprintln!("Unknown mode: {}. Use: live or demo", args.mode);
            std::process::exit(1);
        }
    };

    let mut config = match &args.config {
        Some(path) => match Config::from_file(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config: {}", e);
                eprintln!("Use --generate-config to create a template.");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    if let Err(e) = config.apply_env() {
        eprintln!("{}", e);
        std::process::exit(1);
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.server.log_level))
        .init();

    if let Err(e) = config.validate(!demo) {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = run(config, demo).await {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

async fn run(config: Config, demo: bool) -> Result<(), String> {
    let book = StrategyBook::with_default_protocols(
        config.trading.strategy_count,
        config.trading.reference_price,
        config.trading.top_n,
    )
    .map_err(|e| format!("Failed to build strategy catalog: {}", e))?;
    let state = SharedState::new(EngineState::new(book, config.trading.enabled));

    let signer = match config.chain.signer()? {
        Some(signer) => signer,
        None if demo => DEMO_PRIVATE_KEY
            .parse::<PrivateKeySigner>()
            .map_err(|e| format!("Invalid demo key: {}", e))?,
        None => return Err("TREASURY_PRIVATE_KEY (or chain.private_key) is required in live mode".to_string()),
    };

    let candidates: Vec<SharedLedgerClient> = if demo {
        let ledger = SimulatedLedger::named("simulated", signer.address());
        ledger.fund(signer.address(), config.chain.demo_balance_wei()?);
        vec![Arc::new(ledger) as SharedLedgerClient]
    } else {
        config
            .chain
            .rpc_urls
            .iter()
            .map(|url| {
                RpcClient::new(url, config.chain.request_timeout())
                    .map(|c| Arc::new(c) as SharedLedgerClient)
                    .map_err(|e| format!("Invalid RPC URL {}: {}", url, e))
            })
            .collect::<Result<_, _>>()?
    };

    let connector = Arc::new(
        ChainConnector::new(candidates, signer, config.chain.chain_id)
            .with_poll_interval(config.chain.poll_interval()),
    );
    if let Err(e) = connector.connect().await {
        warn!("Ledger unavailable at startup ({}), will retry on demand", e);
    }

    let withdrawals = Arc::new(WithdrawalExecutor::new(
        connector.clone(),
        state.clone(),
        config.withdrawal_policy()?,
    ));

    let engine = Engine::new(state.clone(), config.engine_settings());
    let metrics = engine.metrics();
    let handles = engine.spawn();

    let mode = if demo {
        format!("DEMO_{}TPS", config.trading.target_tps)
    } else {
        format!("ULTRA_HFT_{}TPS", config.trading.target_tps)
    };
    let fee_recipient = config.chain.fee_recipient_address()?;

    info!("===============================================================");
    info!("Yield engine | {} | {} strategies", mode, config.trading.strategy_count);
    info!("Treasury: {} | Fee recipient: {}", connector.address(), fee_recipient);
    info!("===============================================================");

    let dashboard_state = DashboardState::new(
        state,
        metrics,
        withdrawals,
        DashboardSettings {
            mode,
            target_tps: config.trading.target_tps,
            fee_recipient,
        },
    );

    let result = DashboardServer::new(dashboard_state, config.server.port)
        .run()
        .await
        .map_err(|e| format!("Server error: {}", e));

    handles.abort();
    result
}
