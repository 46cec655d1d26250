// src/dashboard/mod.rs

//! HTTP API for the yield engine.
//!
//! Provides a web server that:
//! - Exposes REST endpoints for counters, strategies and the custodial balance
//! - Accepts withdrawal, manual settlement and trading-toggle requests
//! - Pushes status snapshots to WebSocket clients every 500 ms

use crate::connectors::ChainConnector;
use crate::engine::MetricsAggregator;
use crate::models::{SharedState, WithdrawalReceipt, WithdrawalRequest};
use crate::withdrawal::{WithdrawalError, WithdrawalExecutor};
use alloy::primitives::utils::format_ether;
use alloy::primitives::{Address, U256};
use axum::{
    body::Bytes,
    extract::{
        rejection::JsonRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};

const SNAPSHOT_INTERVAL: Duration = Duration::from_millis(500);

/// Rows served by `/api/apex/strategies/live`, independent of the execution pool.
pub const LIVE_STRATEGY_ROWS: usize = 50;

/// Point-in-time view served by `/status` and pushed over `/ws`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub status: &'static str,
    pub mode: String,
    pub trading: bool,
    pub tps: u64,
    #[serde(rename = "targetTPS")]
    pub target_tps: u64,
    #[serde(rename = "peakTPS")]
    pub peak_tps: u64,
    pub total_trades: u64,
    pub total_earned: String,
    pub hourly_rate: String,
    pub flash_loans: u64,
    pub uptime_secs: u64,
    pub treasury_wallet: String,
    pub treasury_balance: String,
    pub balance_available: bool,
    pub fee_recipient: String,
}

/// Static values shown alongside the live counters.
#[derive(Debug, Clone)]
pub struct DashboardSettings {
    pub mode: String,
    pub target_tps: u64,
    pub fee_recipient: Address,
}

/// Shared state for the API handlers.
pub struct DashboardState {
    engine: SharedState,
    metrics: MetricsAggregator,
    withdrawals: Arc<WithdrawalExecutor>,
    settings: DashboardSettings,
    /// Last custodial balance read, reused by WebSocket snapshots.
    last_balance: Mutex<Option<U256>>,
    update_tx: broadcast::Sender<StatusSnapshot>,
}

impl DashboardState {
    pub fn new(
        engine: SharedState,
        metrics: MetricsAggregator,
        withdrawals: Arc<WithdrawalExecutor>,
        settings: DashboardSettings,
    ) -> Arc<Self> {
        let (update_tx, _) = broadcast::channel(100);
        Arc::new(Self {
            engine,
            metrics,
            withdrawals,
            settings,
            last_balance: Mutex::new(None),
            update_tx,
        })
    }

    fn connector(&self) -> &ChainConnector {
        self.withdrawals.connector()
    }

    /// Reads the custodial balance if a connector is bound. Never connects.
    async fn read_balance(&self) -> Option<U256> {
        let balance = if self.connector().is_connected() {
            match self.connector().custodial_balance().await {
                Ok(b) => Some(b),
                Err(e) => {
                    debug!("Dashboard: Balance unavailable: {}", e);
                    None
                }
            }
        } else {
            None
        };
        *self.last_balance.lock().unwrap_or_else(PoisonError::into_inner) = balance;
        balance
    }

    fn cached_balance(&self) -> Option<U256> {
        *self.last_balance.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self, balance: Option<U256>) -> StatusSnapshot {
        let global = self.engine.global();
        let now = Utc::now();

        StatusSnapshot {
            status: "online",
            mode: self.settings.mode.clone(),
            trading: global.trading_enabled,
            tps: global.tps,
            target_tps: self.settings.target_tps,
            peak_tps: global.peak_tps,
            total_trades: global.total_trades,
            total_earned: format!("{:.2}", global.total_earned),
            hourly_rate: format!("{:.2}", global.hourly_rate(now)),
            flash_loans: global.flash_events,
            uptime_secs: global.uptime_secs(now) as u64,
            treasury_wallet: self.connector().address().to_string(),
            treasury_balance: ether_6dp(balance.unwrap_or(U256::ZERO)),
            balance_available: balance.is_some(),
            fee_recipient: self.settings.fee_recipient.to_string(),
        }
    }
}

/// Formats a wei amount as ether with six decimals.
fn ether_6dp(wei: U256) -> String {
    let ether: f64 = format_ether(wei).parse().unwrap_or(0.0);
    format!("{:.6}", ether)
}

/// The API server.
pub struct DashboardServer {
    state: Arc<DashboardState>,
    port: u16,
}

impl DashboardServer {
    pub fn new(state: Arc<DashboardState>, port: u16) -> Self {
        Self { state, port }
    }

    /// Starts the web server and the snapshot broadcaster.
    /// This method runs until the server is shut down.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let poll_state = self.state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SNAPSHOT_INTERVAL);
            loop {
                interval.tick().await;
                if poll_state.update_tx.receiver_count() == 0 {
                    continue;
                }
                let snapshot = poll_state.snapshot(poll_state.cached_balance());
                // Ignore send errors (no receivers)
                let _ = poll_state.update_tx.send(snapshot);
            }
        });

        let app = router(self.state);

        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Dashboard server starting on http://{}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}

/// Builds the router with CORS open to any origin.
pub fn router(state: Arc<DashboardState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/status", get(get_status))
        .route("/earnings", get(get_earnings))
        .route("/balance", get(get_balance))
        .route("/health", get(get_health))
        .route("/api/apex/strategies/live", get(get_live_strategies))
        .route("/withdraw", post(post_withdraw))
        .route("/send-eth", post(post_withdraw))
        .route("/coinbase-withdraw", post(post_withdraw))
        .route("/execute", post(post_execute))
        .route("/trading", post(post_trading))
        .route("/ws", get(websocket_handler))
        .layer(cors)
        .with_state(state)
}

/// GET /status
async fn get_status(State(state): State<Arc<DashboardState>>) -> Json<StatusSnapshot> {
    let balance = state.read_balance().await;
    Json(state.snapshot(balance))
}

/// GET /earnings
async fn get_earnings(State(state): State<Arc<DashboardState>>) -> Json<serde_json::Value> {
    let global = state.engine.global();
    Json(json!({
        "totalEarned": global.total_earned,
        "totalTrades": global.total_trades,
        "tps": global.tps,
        "hourlyRate": global.hourly_rate(Utc::now()),
    }))
}

/// GET /balance - Connects on demand
async fn get_balance(State(state): State<Arc<DashboardState>>) -> Response {
    let connector = state.connector();
    let result = match connector.ensure_connected().await {
        Ok(()) => connector.custodial_balance().await,
        Err(e) => Err(e),
    };

    match result {
        Ok(balance) => {
            *state.last_balance.lock().unwrap_or_else(PoisonError::into_inner) = Some(balance);
            Json(json!({
                "balance": format_ether(balance),
                "treasuryWallet": connector.address().to_string(),
                "feeRecipient": state.settings.fee_recipient.to_string(),
            }))
            .into_response()
        }
        Err(e) => {
            error!("Dashboard: Balance read failed: {}", e);
            failure(
                StatusCode::SERVICE_UNAVAILABLE,
                "connector_unavailable",
                &e.to_string(),
            )
        }
    }
}

/// GET /health
async fn get_health(State(state): State<Arc<DashboardState>>) -> Json<serde_json::Value> {
    let global = state.engine.global();
    Json(json!({
        "status": "healthy",
        "tps": global.tps,
        "targetTPS": state.settings.target_tps,
    }))
}

/// One row of the live strategy table.
#[derive(Serialize)]
struct StrategyRow {
    id: u32,
    name: String,
    apy: String,
    pnl: String,
    executions: u64,
}

/// GET /api/apex/strategies/live - Top 50 strategies by APY
async fn get_live_strategies(State(state): State<Arc<DashboardState>>) -> Json<serde_json::Value> {
    // Read the balance first: the engine lock must not be held across it.
    let balance = state.read_balance().await;

    let guard = state.engine.lock();
    let rows: Vec<StrategyRow> = guard
        .book
        .top(LIVE_STRATEGY_ROWS)
        .iter()
        .map(|s| StrategyRow {
            id: s.id,
            name: s.name.clone(),
            apy: format!("{:.1}", s.apy),
            pnl: format!("{:.2}", s.pnl),
            executions: s.executions,
        })
        .collect();
    let global = &guard.global;

    Json(json!({
        "strategies": rows,
        "totalPnL": global.total_earned,
        "tps": global.tps,
        "targetTPS": state.settings.target_tps,
        "projectedHourly": format!("{:.2}", global.hourly_rate(Utc::now())),
        "totalTrades": global.total_trades,
        "totalExecuted": guard.book.total_executions(),
        "feeRecipient": state.settings.fee_recipient.to_string(),
        "treasuryBalance": ether_6dp(balance.unwrap_or(U256::ZERO)),
    }))
}

/// POST /withdraw, /send-eth, /coinbase-withdraw
async fn post_withdraw(
    State(state): State<Arc<DashboardState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = match withdrawal_request_from_body(&headers, &body) {
        Ok(request) => request,
        Err(message) => return failure(StatusCode::BAD_REQUEST, "invalid_request", &message),
    };

    match state.withdrawals.clone().execute_detached(request).await {
        Ok(receipt) => withdrawal_success(&receipt),
        Err(e) => withdrawal_failure(&state, &e),
    }
}

/// A missing or non-JSON body is an empty request, so it fails amount
/// validation like any other request without an amount.
fn withdrawal_request_from_body(headers: &HeaderMap, body: &[u8]) -> Result<WithdrawalRequest, String> {
    let is_json = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.trim_start().starts_with("application/json"))
        .unwrap_or(false);
    if !is_json || body.iter().all(u8::is_ascii_whitespace) {
        return Ok(WithdrawalRequest::default());
    }
    serde_json::from_slice(body).map_err(|e| format!("Failed to parse the request body as JSON: {}", e))
}

fn withdrawal_success(receipt: &WithdrawalReceipt) -> Response {
    Json(json!({
        "success": true,
        "txHash": receipt.tx_hash,
        "etherscanUrl": receipt.explorer_url,
        "to": receipt.recipient,
        "amountETH": receipt.amount_eth,
        "blockNumber": receipt.block_number,
    }))
    .into_response()
}

/// HTTP status for each withdrawal failure.
pub fn withdrawal_status(error: &WithdrawalError) -> StatusCode {
    match error {
        WithdrawalError::InvalidAmount(_)
        | WithdrawalError::InvalidRecipient(_)
        | WithdrawalError::InsufficientReserve { .. }
        | WithdrawalError::InsufficientFunds { .. } => StatusCode::BAD_REQUEST,
        WithdrawalError::WithdrawalInProgress => StatusCode::CONFLICT,
        WithdrawalError::TransactionFailed(_) => StatusCode::BAD_GATEWAY,
        WithdrawalError::ConnectorUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        WithdrawalError::ConfirmationTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        WithdrawalError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn withdrawal_failure(state: &DashboardState, error: &WithdrawalError) -> Response {
    let mut body = json!({
        "success": false,
        "error": error.code(),
        "message": error.to_string(),
    });
    if matches!(error, WithdrawalError::InsufficientReserve { .. }) {
        body["treasuryWallet"] = json!(state.connector().address().to_string());
    }
    if let Some(hash) = error.pending_tx_hash() {
        body["txHash"] = json!(hash);
    }
    (withdrawal_status(error), Json(body)).into_response()
}

fn failure(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(json!({
            "success": false,
            "error": code,
            "message": message,
        })),
    )
        .into_response()
}

/// POST /execute - Books one fixed-yield settlement
async fn post_execute(State(state): State<Arc<DashboardState>>) -> Json<serde_json::Value> {
    let profit = state.metrics.flash_credit_fixed();
    let tps = state.engine.global().tps;
    info!("Dashboard: Manual settlement +${:.2}", profit);
    Json(json!({
        "success": true,
        "profitUSD": format!("{:.2}", profit),
        "tps": tps,
    }))
}

#[derive(Deserialize)]
struct TradingToggle {
    enabled: bool,
}

/// POST /trading - Sets the trading flag
async fn post_trading(
    State(state): State<Arc<DashboardState>>,
    payload: Result<Json<TradingToggle>, JsonRejection>,
) -> Response {
    let toggle = match payload {
        Ok(Json(toggle)) => toggle,
        Err(rejection) => {
            return failure(StatusCode::BAD_REQUEST, "invalid_request", &rejection.body_text());
        }
    };

    state.engine.set_trading_enabled(toggle.enabled);
    info!(
        "Dashboard: Trading {}",
        if toggle.enabled { "enabled" } else { "disabled" }
    );
    Json(json!({ "success": true, "trading": toggle.enabled })).into_response()
}

/// GET /ws - WebSocket endpoint for real-time updates
async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<DashboardState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

async fn handle_websocket(mut socket: WebSocket, state: Arc<DashboardState>) {
    info!("WebSocket client connected");

    // Subscribe before the initial snapshot so no update is missed.
    let mut rx = state.update_tx.subscribe();

    let initial = state.snapshot(state.cached_balance());
    if let Ok(json) = serde_json::to_string(&initial) {
        if socket.send(Message::Text(json.into())).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(update) => {
                        if let Ok(json) = serde_json::to_string(&update) {
                            if socket.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        info!("WebSocket client lagged, skipped {} messages", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }

            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break;
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("WebSocket client disconnected");
}
