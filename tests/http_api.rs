use alloy::primitives::utils::parse_ether;
use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use yield_engine::connectors::ChainConnector;
use yield_engine::dashboard::{router, DashboardSettings, DashboardState};
use yield_engine::engine::{FlashSettings, MetricsAggregator};
use yield_engine::models::{EngineState, SharedState};
use yield_engine::simulation::SimulatedLedger;
use yield_engine::strategy::StrategyBook;
use yield_engine::traits::SharedLedgerClient;
use yield_engine::withdrawal::{WithdrawalExecutor, WithdrawalPolicy, DEFAULT_RECIPIENT};

const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

struct Fixture {
    app: Router,
    state: SharedState,
    ledger: Arc<SimulatedLedger>,
    connector: Arc<ChainConnector>,
}

fn fixture(balance_eth: &str) -> Fixture {
    fixture_with_pool(balance_eth, 50)
}

fn fixture_with_pool(balance_eth: &str, execution_pool: usize) -> Fixture {
    let signer: PrivateKeySigner = TEST_KEY.parse().unwrap();
    let ledger = Arc::new(SimulatedLedger::named("simulated", signer.address()));
    ledger.fund(signer.address(), parse_ether(balance_eth).unwrap());

    let connector = Arc::new(
        ChainConnector::new(vec![ledger.clone() as SharedLedgerClient], signer, 1)
            .with_poll_interval(Duration::from_millis(5)),
    );

    let book = StrategyBook::with_default_protocols(450, 3450.0, execution_pool).unwrap();
    let state = SharedState::new(EngineState::new(book, true));
    let metrics = MetricsAggregator::new(state.clone(), FlashSettings::default());

    let policy = WithdrawalPolicy {
        confirmation_timeout: Duration::from_millis(200),
        ..WithdrawalPolicy::default()
    };
    let withdrawals = Arc::new(WithdrawalExecutor::new(connector.clone(), state.clone(), policy));

    let dashboard = DashboardState::new(
        state.clone(),
        metrics,
        withdrawals,
        DashboardSettings {
            mode: "DEMO_1000TPS".to_string(),
            target_tps: 1000,
            fee_recipient: DEFAULT_RECIPIENT,
        },
    );

    Fixture {
        app: router(dashboard),
        state,
        ledger,
        connector,
    }
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(v) => builder
            .header("content-type", "application/json")
            .body(Body::from(v.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_status_and_health_do_not_mutate() {
    let fx = fixture("2");
    fx.connector.connect().await.unwrap();
    {
        let mut guard = fx.state.lock();
        guard.global.total_trades = 42;
        guard.global.total_earned = 12.3456;
        guard.global.tps = 7;
        guard.global.peak_tps = 9;
    }

    let (status, first) = call(&fx.app, Method::GET, "/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["status"], "online");
    assert_eq!(first["mode"], "DEMO_1000TPS");
    assert_eq!(first["trading"], true);
    assert_eq!(first["tps"], 7);
    assert_eq!(first["targetTPS"], 1000);
    assert_eq!(first["peakTPS"], 9);
    assert_eq!(first["totalTrades"], 42);
    assert_eq!(first["totalEarned"], "12.35");
    assert_eq!(first["treasuryBalance"], "2.000000");
    assert_eq!(first["balanceAvailable"], true);
    assert_eq!(first["feeRecipient"], DEFAULT_RECIPIENT.to_string());

    let (_, second) = call(&fx.app, Method::GET, "/status", None).await;
    assert_eq!(second["totalTrades"], first["totalTrades"]);
    assert_eq!(second["totalEarned"], first["totalEarned"]);

    let (status, health) = call(&fx.app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health, json!({ "status": "healthy", "tps": 7, "targetTPS": 1000 }));

    let global = fx.state.global();
    assert_eq!(global.total_trades, 42);
    assert_eq!(global.total_earned, 12.3456);
    assert_eq!(global.flash_events, 0);
}

#[tokio::test]
async fn test_status_degrades_without_connecting() {
    let fx = fixture("2");

    let (status, body) = call(&fx.app, Method::GET, "/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["treasuryBalance"], "0.000000");
    assert_eq!(body["balanceAvailable"], false);
    assert!(!fx.connector.is_connected());
}

#[tokio::test]
async fn test_balance_connects_on_demand() {
    let fx = fixture("2");
    assert!(!fx.connector.is_connected());

    let (status, body) = call(&fx.app, Method::GET, "/balance", None).await;
    assert_eq!(status, StatusCode::OK);
    let balance: f64 = body["balance"].as_str().unwrap().parse().unwrap();
    assert_eq!(balance, 2.0);
    assert_eq!(body["treasuryWallet"], fx.connector.address().to_string());
    assert!(fx.connector.is_connected());
}

#[tokio::test]
async fn test_balance_unavailable() {
    let fx = fixture("2");
    fx.ledger.set_reachable(false);

    let (status, body) = call(&fx.app, Method::GET, "/balance", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "connector_unavailable");
}

#[tokio::test]
async fn test_earnings_numbers() {
    let fx = fixture("2");
    fx.state.lock().global.total_earned = 99.5;

    let (status, body) = call(&fx.app, Method::GET, "/earnings", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["totalEarned"], 99.5);
    assert!(body["hourlyRate"].is_number());
}

#[tokio::test]
async fn test_withdraw_rejects_bad_input() {
    let fx = fixture("2");

    for amount in [json!(0), json!(-1), json!("abc"), json!("")] {
        let (status, body) = call(&fx.app, Method::POST, "/withdraw", Some(json!({ "amount": amount }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "amount {}", amount);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "invalid_amount");
    }

    let (status, body) = call(
        &fx.app,
        Method::POST,
        "/withdraw",
        Some(json!({ "to": "0x1234", "amount": 0.1 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_recipient");

    let request = Request::builder()
        .method(Method::POST)
        .uri("/withdraw")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = fx.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    assert!(fx.ledger.transfers().is_empty());
}

#[tokio::test]
async fn test_withdraw_reserve_and_funds() {
    let fx = fixture("0.005");
    let (status, body) = call(&fx.app, Method::POST, "/withdraw", Some(json!({ "amount": 0.0001 }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "insufficient_reserve");
    assert_eq!(body["treasuryWallet"], fx.connector.address().to_string());

    let fx = fixture("1");
    let (status, body) = call(&fx.app, Method::POST, "/withdraw", Some(json!({ "amount": 0.998 }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "insufficient_funds");
}

#[tokio::test]
async fn test_withdraw_success_via_alias() {
    let fx = fixture("2");
    fx.state.lock().global.total_earned = 5000.0;
    let recipient = "0x2222222222222222222222222222222222222222";

    let (status, body) = call(
        &fx.app,
        Method::POST,
        "/send-eth",
        Some(json!({ "toAddress": recipient, "amountETH": "1" })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    let tx_hash = body["txHash"].as_str().unwrap();
    assert_eq!(body["etherscanUrl"], format!("https://etherscan.io/tx/{}", tx_hash));
    assert_eq!(body["amountETH"], 1.0);
    assert!(body["blockNumber"].as_u64().unwrap() > 0);

    let sent = fx.ledger.transfers();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, Address::repeat_byte(0x22));
    assert!((fx.state.global().total_earned - 1550.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_withdraw_broadcast_failure() {
    let fx = fixture("2");
    fx.ledger.set_reject_broadcasts(true);

    let (status, body) = call(&fx.app, Method::POST, "/coinbase-withdraw", Some(json!({ "amount": 0.1 }))).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"], "transaction_failed");
}

#[tokio::test]
async fn test_withdraw_confirmation_timeout_reports_hash() {
    let fx = fixture("2");
    fx.ledger.set_auto_confirm(false);

    let (status, body) = call(&fx.app, Method::POST, "/withdraw", Some(json!({ "amount": 0.1 }))).await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["error"], "confirmation_timeout");
    assert!(body["txHash"].as_str().unwrap().starts_with("0x"));
}

#[tokio::test]
async fn test_execute_books_fixed_settlement() {
    let fx = fixture("2");
    fx.state.set_trading_enabled(false);

    let (status, body) = call(&fx.app, Method::POST, "/execute", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["profitUSD"], "1035.00");

    let global = fx.state.global();
    assert_eq!(global.flash_events, 1);
    assert!((global.total_earned - 1035.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_trading_toggle() {
    let fx = fixture("2");

    let (status, body) = call(&fx.app, Method::POST, "/trading", Some(json!({ "enabled": false }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["trading"], false);
    assert!(!fx.state.global().trading_enabled);

    let (_, status_body) = call(&fx.app, Method::GET, "/status", None).await;
    assert_eq!(status_body["trading"], false);

    let (status, _) = call(&fx.app, Method::POST, "/trading", Some(json!({ "enabled": "yes" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(!fx.state.global().trading_enabled);
}

#[tokio::test]
async fn test_live_strategies_top_fifty() {
    let fx = fixture("2");

    let (status, body) = call(&fx.app, Method::GET, "/api/apex/strategies/live", None).await;
    assert_eq!(status, StatusCode::OK);

    let rows = body["strategies"].as_array().unwrap();
    assert_eq!(rows.len(), 50);
    let apys: Vec<f64> = rows
        .iter()
        .map(|r| r["apy"].as_str().unwrap().parse().unwrap())
        .collect();
    assert!(apys.windows(2).all(|w| w[0] >= w[1]));
    assert_eq!(rows[0]["pnl"], "0.00");
    assert_eq!(body["targetTPS"], 1000);
    assert_eq!(body["totalExecuted"], 0);
}

#[tokio::test]
async fn test_withdraw_non_numeric_amount_is_invalid_amount() {
    let fx = fixture("2");

    for body in [json!({ "amount": true }), json!({ "amountETH": [1] }), json!({})] {
        let (status, response) = call(&fx.app, Method::POST, "/withdraw", Some(body.clone())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "body {}", body);
        assert_eq!(response["error"], "invalid_amount", "body {}", body);
    }
    assert!(fx.ledger.transfers().is_empty());
}

#[tokio::test]
async fn test_withdraw_without_json_body_is_invalid_amount() {
    let fx = fixture("2");

    // No body and no content type.
    let (status, body) = call(&fx.app, Method::POST, "/withdraw", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_amount");

    // JSON content type with an empty body.
    let request = Request::builder()
        .method(Method::POST)
        .uri("/send-eth")
        .header("content-type", "application/json")
        .body(Body::empty())
        .unwrap();
    let response = fx.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"], "invalid_amount");

    // A form body is not read as a request.
    let request = Request::builder()
        .method(Method::POST)
        .uri("/withdraw")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Body::from("amount=0.1"))
        .unwrap();
    let response = fx.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(fx.ledger.transfers().is_empty());
}

#[tokio::test]
async fn test_withdraw_zero_amount_eth_uses_amount() {
    let fx = fixture("2");

    let (status, body) = call(
        &fx.app,
        Method::POST,
        "/withdraw",
        Some(json!({ "amountETH": 0, "amount": 0.1 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["amountETH"], 0.1);
}

#[tokio::test]
async fn test_live_strategies_ignore_execution_pool_size() {
    let fx = fixture_with_pool("2", 10);

    let (status, body) = call(&fx.app, Method::GET, "/api/apex/strategies/live", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["strategies"].as_array().unwrap().len(), 50);
}
