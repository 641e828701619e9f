use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{Request, StatusCode},
    Router,
};
use futures::future::join_all;
use paygate_backend::{app_router, store::Store, AppState, ServiceConfig};
use paygate_chain::{ChainError, ChainObserver};
use paygate_oracle::{OracleError, RateSource};
use serde_json::{json, Value};
use tower::util::ServiceExt;
use uuid::Uuid;

const BODY_LIMIT: usize = usize::MAX;
const ADMIN_SECRET: &str = "test-admin-secret";
const RECIPIENT: &str = "7XSvJnS19TodrQJSbjUKkmCLz2GJ1c556Y4CSvMWpjTm";
const INSTALL_COMMAND: &str = "curl -fsSL https://get.paygate.dev/install.sh | sh";

struct FixedRate(f64);

#[async_trait]
impl RateSource for FixedRate {
    async fn rate_usd(&self, _asset_id: &str) -> Result<f64, OracleError> {
        Ok(self.0)
    }
}

struct OfflineOracle;

#[async_trait]
impl RateSource for OfflineOracle {
    async fn rate_usd(&self, _asset_id: &str) -> Result<f64, OracleError> {
        Err(OracleError::Malformed("oracle offline".to_string()))
    }
}

/// Observer whose answer is controlled by a shared flag, so a test can flip
/// "payment landed" between polls.
struct SwitchObserver(Arc<AtomicBool>);

#[async_trait]
impl ChainObserver for SwitchObserver {
    async fn find_transaction_by_marker(&self, _marker: &str) -> Result<bool, ChainError> {
        Ok(self.0.load(Ordering::SeqCst))
    }
}

struct OfflineObserver;

#[async_trait]
impl ChainObserver for OfflineObserver {
    async fn find_transaction_by_marker(&self, _marker: &str) -> Result<bool, ChainError> {
        Err(ChainError::Malformed("rpc offline".to_string()))
    }
}

fn test_config() -> ServiceConfig {
    ServiceConfig {
        price_usd: 125.0,
        recipient_address: RECIPIENT.to_string(),
        admin_secret: ADMIN_SECRET.to_string(),
        install_command: INSTALL_COMMAND.to_string(),
    }
}

fn test_app(
    store: Store,
    oracle: impl RateSource + 'static,
    chain: impl ChainObserver + 'static,
) -> Router {
    app_router(AppState::with_components(
        test_config(),
        store,
        Arc::new(oracle),
        Arc::new(chain),
    ))
}

async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
        )
        .await
        .expect("response");
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), BODY_LIMIT).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .expect("response");
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), BODY_LIMIT).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn create_referral(app: &Router, code: &str) {
    let (status, _) = post_json(
        app,
        "/referral",
        json!({ "secret": ADMIN_SECRET, "code": code }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

async fn create_session(app: &Router, referral_code: Option<&str>) -> Value {
    let body = match referral_code {
        Some(code) => json!({ "referralCode": code }),
        None => json!({}),
    };
    let (status, value) = post_json(app, "/session", body).await;
    assert_eq!(status, StatusCode::OK);
    value
}

async fn fetch_stats(app: &Router, code: &str) -> Value {
    let uri = format!("/referral/stats?code={code}&secret={ADMIN_SECRET}");
    let (status, value) = get_json(app, &uri).await;
    assert_eq!(status, StatusCode::OK);
    value
}

#[tokio::test]
async fn create_session_locks_price_at_creation() {
    let app = test_app(
        Store::in_memory(),
        FixedRate(50.0),
        SwitchObserver(Arc::new(AtomicBool::new(false))),
    );

    let session = create_session(&app, None).await;

    // 125 USD at 50 USD/token, rounded to four decimals.
    assert_eq!(session["tokenAmount"], json!(2.5));
    assert_eq!(session["recipientAddress"], RECIPIENT);

    let reference_key = session["referenceKey"].as_str().unwrap();
    assert_eq!(reference_key.len(), 64);
    assert!(reference_key.chars().all(|c| c.is_ascii_hexdigit()));

    let session_id = session["sessionId"].as_str().unwrap();
    assert!(Uuid::parse_str(session_id).is_ok());
}

#[tokio::test]
async fn create_session_fails_without_a_price() {
    let app = test_app(
        Store::in_memory(),
        OfflineOracle,
        SwitchObserver(Arc::new(AtomicBool::new(false))),
    );

    let (status, body) = post_json(&app, "/session", json!({})).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error_code"], "PRICING_UNAVAILABLE");
}

#[tokio::test]
async fn status_of_unknown_session_is_not_found() {
    let app = test_app(
        Store::in_memory(),
        FixedRate(50.0),
        SwitchObserver(Arc::new(AtomicBool::new(false))),
    );

    let uri = format!("/session/{}/status", Uuid::new_v4());
    let (status, body) = get_json(&app, &uri).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error_code"], "SESSION_NOT_FOUND");
}

#[tokio::test]
async fn pending_session_confirms_and_credits_referral_once() {
    let paid = Arc::new(AtomicBool::new(false));
    let app = test_app(
        Store::in_memory(),
        FixedRate(50.0),
        SwitchObserver(paid.clone()),
    );

    create_referral(&app, "AFF1").await;
    let session = create_session(&app, Some("AFF1")).await;
    let uri = format!("/session/{}/status", session["sessionId"].as_str().unwrap());

    // Nothing on-chain yet: early polling reports unconfirmed, not an error.
    let (status, body) = get_json(&app, &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["confirmed"], json!(false));
    assert!(body.get("installCommand").is_none());

    // The transfer lands.
    paid.store(true, Ordering::SeqCst);

    let (status, body) = get_json(&app, &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["confirmed"], json!(true));
    assert_eq!(body["installCommand"], INSTALL_COMMAND);

    let stats = fetch_stats(&app, "AFF1").await;
    assert_eq!(stats["conversions"], json!(1));

    // A repeat poll is idempotent: still confirmed, still one conversion.
    let (status, body) = get_json(&app, &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["confirmed"], json!(true));
    let stats = fetch_stats(&app, "AFF1").await;
    assert_eq!(stats["conversions"], json!(1));
}

#[tokio::test]
async fn concurrent_confirmation_checks_credit_at_most_once() {
    let app = test_app(
        Store::in_memory(),
        FixedRate(50.0),
        SwitchObserver(Arc::new(AtomicBool::new(true))),
    );

    create_referral(&app, "AFF1").await;
    let session = create_session(&app, Some("AFF1")).await;
    let uri = format!("/session/{}/status", session["sessionId"].as_str().unwrap());

    let polls = (0..8).map(|_| {
        let app = app.clone();
        let uri = uri.clone();
        async move {
            let response = app
                .oneshot(Request::builder().uri(&uri).body(Body::empty()).unwrap())
                .await
                .expect("response");
            let status = response.status();
            let bytes = body::to_bytes(response.into_body(), BODY_LIMIT).await.unwrap();
            let value: Value = serde_json::from_slice(&bytes).unwrap();
            (status, value)
        }
    });

    for (status, body) in join_all(polls).await {
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["confirmed"], json!(true));
    }

    let stats = fetch_stats(&app, "AFF1").await;
    assert_eq!(stats["conversions"], json!(1));
}

#[tokio::test]
async fn confirmation_skips_missing_referral_silently() {
    let app = test_app(
        Store::in_memory(),
        FixedRate(50.0),
        SwitchObserver(Arc::new(AtomicBool::new(true))),
    );

    // Session names a referral code that was never created.
    let session = create_session(&app, Some("GHOST")).await;
    let uri = format!("/session/{}/status", session["sessionId"].as_str().unwrap());

    let (status, body) = get_json(&app, &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["confirmed"], json!(true));
}

#[tokio::test]
async fn chain_outage_is_a_retryable_failure() {
    let app = test_app(Store::in_memory(), FixedRate(50.0), OfflineObserver);

    let session = create_session(&app, None).await;
    let uri = format!("/session/{}/status", session["sessionId"].as_str().unwrap());

    let (status, body) = get_json(&app, &uri).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error_code"], "CHAIN_UNAVAILABLE");
}

#[tokio::test]
async fn degraded_store_still_creates_sessions() {
    let app = test_app(
        Store::unavailable(),
        FixedRate(50.0),
        SwitchObserver(Arc::new(AtomicBool::new(false))),
    );

    // Creation is best-effort and succeeds without persistence.
    let session = create_session(&app, None).await;
    let uri = format!("/session/{}/status", session["sessionId"].as_str().unwrap());

    // Confirmation then reports the degraded store, distinguishable from
    // both success and an unknown session.
    let (status, body) = get_json(&app, &uri).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error_code"], "STORE_UNAVAILABLE");
}

#[tokio::test]
async fn referral_creation_requires_the_admin_secret() {
    let app = test_app(
        Store::in_memory(),
        FixedRate(50.0),
        SwitchObserver(Arc::new(AtomicBool::new(false))),
    );

    // Wrong secret, missing secret, and odd payload shapes all fail the
    // same way.
    for body in [
        json!({ "secret": "wrong", "code": "AFF1" }),
        json!({ "code": "AFF1" }),
        json!({}),
        json!({ "secret": "", "code": "AFF1", "name": "x" }),
    ] {
        let (status, value) = post_json(&app, "/referral", body).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(value["error_code"], "UNAUTHORIZED");
    }
}

#[tokio::test]
async fn referral_creation_rejects_an_empty_code() {
    let app = test_app(
        Store::in_memory(),
        FixedRate(50.0),
        SwitchObserver(Arc::new(AtomicBool::new(false))),
    );

    for body in [
        json!({ "secret": ADMIN_SECRET }),
        json!({ "secret": ADMIN_SECRET, "code": "" }),
        json!({ "secret": ADMIN_SECRET, "code": "   " }),
    ] {
        let (status, value) = post_json(&app, "/referral", body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(value["error_code"], "INVALID_INPUT");
    }
}

#[tokio::test]
async fn recreating_a_referral_resets_its_counters() {
    let app = test_app(
        Store::in_memory(),
        FixedRate(50.0),
        SwitchObserver(Arc::new(AtomicBool::new(false))),
    );

    create_referral(&app, "AFF1").await;
    let (status, _) = post_json(&app, "/referral/click", json!({ "code": "AFF1" })).await;
    assert_eq!(status, StatusCode::OK);

    let stats = fetch_stats(&app, "AFF1").await;
    assert_eq!(stats["clicks"], json!(1));

    create_referral(&app, "AFF1").await;
    let stats = fetch_stats(&app, "AFF1").await;
    assert_eq!(stats["clicks"], json!(0));
}

#[tokio::test]
async fn click_on_unknown_code_succeeds_without_state_change() {
    let app = test_app(
        Store::in_memory(),
        FixedRate(50.0),
        SwitchObserver(Arc::new(AtomicBool::new(false))),
    );

    create_referral(&app, "AFF1").await;

    let (status, body) = post_json(&app, "/referral/click", json!({ "code": "GHOST" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], json!(true));

    let stats = fetch_stats(&app, "AFF1").await;
    assert_eq!(stats["clicks"], json!(0));
    assert_eq!(stats["conversions"], json!(0));
}

#[tokio::test]
async fn click_with_missing_code_is_invalid_input() {
    let app = test_app(
        Store::in_memory(),
        FixedRate(50.0),
        SwitchObserver(Arc::new(AtomicBool::new(false))),
    );

    let (status, body) = post_json(&app, "/referral/click", json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "INVALID_INPUT");
}

#[tokio::test]
async fn stats_report_counters_and_estimated_earnings() {
    let app = test_app(
        Store::in_memory(),
        FixedRate(50.0),
        SwitchObserver(Arc::new(AtomicBool::new(true))),
    );

    create_referral(&app, "AFF1").await;

    for _ in 0..3 {
        let (status, _) = post_json(&app, "/referral/click", json!({ "code": "AFF1" })).await;
        assert_eq!(status, StatusCode::OK);
    }

    // Two separate sessions convert against the same code.
    for _ in 0..2 {
        let session = create_session(&app, Some("AFF1")).await;
        let uri = format!("/session/{}/status", session["sessionId"].as_str().unwrap());
        let (status, body) = get_json(&app, &uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["confirmed"], json!(true));
    }

    let stats = fetch_stats(&app, "AFF1").await;
    assert_eq!(stats["clicks"], json!(3));
    assert_eq!(stats["conversions"], json!(2));
    assert_eq!(stats["estimatedEarnings"], json!(50));
    assert_eq!(stats["code"], "AFF1");
}

#[tokio::test]
async fn stats_require_the_admin_secret_and_a_known_code() {
    let app = test_app(
        Store::in_memory(),
        FixedRate(50.0),
        SwitchObserver(Arc::new(AtomicBool::new(false))),
    );

    create_referral(&app, "AFF1").await;

    let (status, body) = get_json(&app, "/referral/stats?code=AFF1&secret=wrong").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error_code"], "UNAUTHORIZED");

    let (status, body) = get_json(&app, "/referral/stats?code=AFF1").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error_code"], "UNAUTHORIZED");

    let uri = format!("/referral/stats?code=GHOST&secret={ADMIN_SECRET}");
    let (status, body) = get_json(&app, &uri).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error_code"], "REFERRAL_NOT_FOUND");

    let uri = format!("/referral/stats?secret={ADMIN_SECRET}");
    let (status, body) = get_json(&app, &uri).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "INVALID_INPUT");
}
