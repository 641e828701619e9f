//! paygate backend service.
//!
//! Sells a product for an on-chain token transfer without webhooks: a buyer
//! opens a payment session, receives a quoted token amount and a unique
//! reference marker to embed in the transfer, and polls for confirmation.
//! The service checks the chain for evidence of the marker, flips the
//! session to confirmed exactly once, and credits the attributed referral
//! code at most once per session. Referral codes themselves are managed by
//! an admin-gated registry with public click tracking.
//!
//! All durable state lives in [`store::Store`]; request handling is
//! stateless and every operation may run concurrently with any other,
//! including itself for the same session.

pub mod store;

use std::{env, sync::Arc, time::Duration};

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use paygate_chain::{ChainConfig, ChainError, ChainObserver, SolanaRpcObserver};
use paygate_common::{token_amount, Referral, Session};
use paygate_oracle::{CoinGeckoOracle, OracleConfig, OracleError, RateSource};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::{ConfirmOutcome, Store, StoreError};

const PRICE_USD_ENV: &str = "PAYGATE_PRICE_USD";
const DEFAULT_PRICE_USD: f64 = 125.0;
const RECIPIENT_ADDRESS_ENV: &str = "PAYGATE_RECIPIENT_ADDRESS";
const ADMIN_SECRET_ENV: &str = "PAYGATE_ADMIN_SECRET";
const INSTALL_COMMAND_ENV: &str = "PAYGATE_INSTALL_COMMAND";
const DEFAULT_INSTALL_COMMAND: &str =
    "curl -fsSL https://get.paygate.dev/install.sh | sh";
const ORACLE_URL_ENV: &str = "PAYGATE_ORACLE_URL";
const RPC_URL_ENV: &str = "PAYGATE_RPC_URL";
const HTTP_TIMEOUT_ENV: &str = "PAYGATE_HTTP_TIMEOUT_SECS";
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;
const LISTEN_ADDR_ENV: &str = "PAYGATE_LISTEN_ADDR";
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:3000";

const CODE_INVALID_INPUT: &str = "INVALID_INPUT";
const CODE_UNAUTHORIZED: &str = "UNAUTHORIZED";
const CODE_SESSION_NOT_FOUND: &str = "SESSION_NOT_FOUND";
const CODE_REFERRAL_NOT_FOUND: &str = "REFERRAL_NOT_FOUND";
const CODE_PRICING_UNAVAILABLE: &str = "PRICING_UNAVAILABLE";
const CODE_CHAIN_UNAVAILABLE: &str = "CHAIN_UNAVAILABLE";
const CODE_STORE_UNAVAILABLE: &str = "STORE_UNAVAILABLE";
const CODE_INTERNAL: &str = "INTERNAL_SERVER_ERROR";

/// CoinGecko asset id of the payment token.
const TOKEN_ASSET_ID: &str = "solana";

/// Flat affiliate commission per confirmed conversion, in USD. Deliberately
/// not derived from individual sale amounts.
pub const COMMISSION_USD_PER_CONVERSION: u64 = 25;

/// Process-wide service configuration.
///
/// The fiat price is a server-side constant, never client input, so a buyer
/// cannot quote themselves a cheaper session.
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    /// Fixed fiat price of the product in USD.
    pub price_usd: f64,
    /// Public recipient wallet address the buyer pays to.
    pub recipient_address: String,
    /// Administrative secret gating referral management. Compared
    /// byte-for-byte; never logged, never echoed in responses.
    pub admin_secret: String,
    /// Follow-up action string returned once a session confirms.
    pub install_command: String,
}

impl ServiceConfig {
    /// Load configuration from environment variables. The recipient address
    /// and admin secret are required; everything else has a default.
    pub fn from_env() -> Self {
        let recipient_address = env::var(RECIPIENT_ADDRESS_ENV)
            .unwrap_or_else(|_| panic!("{RECIPIENT_ADDRESS_ENV} must be set"));
        let admin_secret = env::var(ADMIN_SECRET_ENV)
            .unwrap_or_else(|_| panic!("{ADMIN_SECRET_ENV} must be set"));

        Self {
            price_usd: env::var(PRICE_USD_ENV)
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(DEFAULT_PRICE_USD),
            recipient_address,
            admin_secret,
            install_command: env::var(INSTALL_COMMAND_ENV)
                .unwrap_or_else(|_| DEFAULT_INSTALL_COMMAND.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    config: Arc<ServiceConfig>,
    store: Store,
    oracle: Arc<dyn RateSource>,
    chain: Arc<dyn ChainObserver>,
}

impl AppState {
    /// Build state from the environment: persistent (or degraded) store and
    /// the real oracle/observer clients.
    pub fn from_env() -> Self {
        let timeout = Duration::from_secs(
            env::var(HTTP_TIMEOUT_ENV)
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS),
        );

        let mut oracle_config = OracleConfig::default().with_timeout(timeout);
        if let Ok(url) = env::var(ORACLE_URL_ENV) {
            oracle_config = oracle_config.with_base_url(url);
        }

        let mut chain_config = ChainConfig::default().with_timeout(timeout);
        if let Ok(url) = env::var(RPC_URL_ENV) {
            chain_config = chain_config.with_rpc_url(url);
        }

        Self::with_components(
            ServiceConfig::from_env(),
            Store::from_env(),
            Arc::new(CoinGeckoOracle::new(oracle_config)),
            Arc::new(SolanaRpcObserver::new(chain_config)),
        )
    }

    /// Assemble state from explicit components (used by tests to inject
    /// mock collaborators).
    pub fn with_components(
        config: ServiceConfig,
        store: Store,
        oracle: Arc<dyn RateSource>,
        chain: Arc<dyn ChainObserver>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            oracle,
            chain,
        }
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, CODE_INVALID_INPUT, message)
    }

    fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, CODE_UNAUTHORIZED, "unauthorized")
    }

    fn session_not_found(session_id: &Uuid) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            CODE_SESSION_NOT_FOUND,
            format!("session {session_id} not found"),
        )
    }

    fn referral_not_found(code: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            CODE_REFERRAL_NOT_FOUND,
            format!("referral code '{code}' not found"),
        )
    }

    fn pricing_unavailable(err: OracleError) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            CODE_PRICING_UNAVAILABLE,
            format!("price oracle unavailable: {err}"),
        )
    }

    fn chain_unavailable(err: ChainError) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            CODE_CHAIN_UNAVAILABLE,
            format!("chain observer unavailable: {err}"),
        )
    }

    fn store(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                CODE_STORE_UNAVAILABLE,
                "session store unavailable",
            ),
            other => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                CODE_INTERNAL,
                other.to_string(),
            ),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    error_code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.message,
            error_code: self.code,
        };
        (self.status, Json(body)).into_response()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest {
    #[serde(default)]
    referral_code: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionResponse {
    session_id: Uuid,
    reference_key: String,
    token_amount: f64,
    recipient_address: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionStatusResponse {
    confirmed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    install_command: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateReferralRequest {
    #[serde(default)]
    secret: String,
    #[serde(default)]
    code: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    contact_handle: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClickRequest {
    #[serde(default)]
    code: String,
}

#[derive(Serialize)]
struct ClickResponse {
    ok: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatsQuery {
    #[serde(default)]
    code: String,
    #[serde(default)]
    secret: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReferralStatsResponse {
    #[serde(flatten)]
    referral: Referral,
    estimated_earnings: u64,
}

/// Run the service with environment configuration.
pub async fn serve() {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let state = AppState::from_env();
    if state.store.is_degraded() {
        warn!("starting with a degraded session store; confirmations will be unavailable");
    }

    let addr = env::var(LISTEN_ADDR_ENV).unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_string());
    let app = app_router(state).layer(cors);
    let listener = TcpListener::bind(&addr).await.unwrap();
    info!(%addr, "paygate-backend listening");
    axum::serve(listener, app.into_make_service())
        .await
        .unwrap();
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/session", post(create_session))
        .route("/session/:session_id/status", get(session_status))
        .route("/referral", post(create_referral))
        .route("/referral/click", post(referral_click))
        .route("/referral/stats", get(referral_stats))
        .with_state(state)
}

async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>, ApiError> {
    let rate = state
        .oracle
        .rate_usd(TOKEN_ASSET_ID)
        .await
        .map_err(ApiError::pricing_unavailable)?;
    let amount = token_amount(state.config.price_usd, rate);

    let session_id = Uuid::new_v4();
    let reference_key = new_reference_key();
    let referral_code = req
        .referral_code
        .as_deref()
        .map(str::trim)
        .filter(|code| !code.is_empty())
        .map(str::to_string);

    let session = Session::new(reference_key.clone(), amount, referral_code);

    // Best-effort persistence: a session created while the store is down is
    // still handed to the buyer, and later confirmation checks surface the
    // store outage explicitly instead of silently losing the sale.
    if let Err(err) = state.store.put_session(&session_id.to_string(), &session) {
        warn!(%session_id, error = %err, "failed to persist session, continuing without persistence");
    }

    info!(%session_id, token_amount = amount, "created payment session");

    Ok(Json(CreateSessionResponse {
        session_id,
        reference_key,
        token_amount: amount,
        recipient_address: state.config.recipient_address.clone(),
    }))
}

async fn session_status(
    State(state): State<AppState>,
    AxumPath(session_id): AxumPath<Uuid>,
) -> Result<Json<SessionStatusResponse>, ApiError> {
    let key = session_id.to_string();
    let session = state
        .store
        .get_session(&key)
        .map_err(ApiError::store)?
        .ok_or_else(|| ApiError::session_not_found(&session_id))?;

    // Idempotent fast path: no chain query, no re-crediting.
    if session.status.is_confirmed() {
        return Ok(Json(confirmed_response(&state)));
    }

    let found = state
        .chain
        .find_transaction_by_marker(&session.reference_key)
        .await
        .map_err(ApiError::chain_unavailable)?;

    if !found {
        // Expected outcome of early polling, not an error.
        return Ok(Json(SessionStatusResponse {
            confirmed: false,
            install_command: None,
        }));
    }

    match state.store.confirm_session(&key).map_err(ApiError::store)? {
        ConfirmOutcome::Transitioned => {
            info!(%session_id, "payment confirmed");
            if let Some(code) = &session.referral_code {
                credit_conversion(&state, code, &session_id);
            }
        }
        // A concurrent check already applied the transition and credit.
        ConfirmOutcome::AlreadyConfirmed => {}
        ConfirmOutcome::Missing => return Err(ApiError::session_not_found(&session_id)),
    }

    Ok(Json(confirmed_response(&state)))
}

/// Credit a referral conversion for a freshly confirmed session. Failures
/// here must never reach the buyer: the confirmation already happened, and
/// referral bookkeeping is not allowed to block it.
fn credit_conversion(state: &AppState, code: &str, session_id: &Uuid) {
    match state.store.record_conversion(code) {
        Ok(true) => info!(%session_id, referral = code, "credited referral conversion"),
        Ok(false) => debug!(referral = code, "referral code unknown, conversion not credited"),
        Err(err) => warn!(%session_id, referral = code, error = %err, "failed to credit referral conversion"),
    }
}

fn confirmed_response(state: &AppState) -> SessionStatusResponse {
    SessionStatusResponse {
        confirmed: true,
        install_command: Some(state.config.install_command.clone()),
    }
}

async fn create_referral(
    State(state): State<AppState>,
    Json(req): Json<CreateReferralRequest>,
) -> Result<Json<Referral>, ApiError> {
    authorize_admin(&state, &req.secret)?;

    let code = req.code.trim();
    if code.is_empty() {
        return Err(ApiError::invalid_input("missing referral code"));
    }

    let referral = Referral::new(code, req.name, req.contact_handle);
    state.store.put_referral(&referral).map_err(ApiError::store)?;

    info!(referral = code, "created referral code");
    Ok(Json(referral))
}

async fn referral_click(
    State(state): State<AppState>,
    Json(req): Json<ClickRequest>,
) -> Result<Json<ClickResponse>, ApiError> {
    let code = req.code.trim();
    if code.is_empty() {
        return Err(ApiError::invalid_input("missing code"));
    }

    // Click tracking is best-effort: an unknown code or an unavailable
    // store must not error out the visiting page.
    match state.store.record_click(code) {
        Ok(true) => debug!(referral = code, "recorded referral click"),
        Ok(false) => debug!(referral = code, "click on unknown referral code ignored"),
        Err(err) => warn!(referral = code, error = %err, "failed to record referral click"),
    }

    Ok(Json(ClickResponse { ok: true }))
}

async fn referral_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<ReferralStatsResponse>, ApiError> {
    authorize_admin(&state, &query.secret)?;

    let code = query.code.trim();
    if code.is_empty() {
        return Err(ApiError::invalid_input("missing code"));
    }

    let referral = state
        .store
        .get_referral(code)
        .map_err(ApiError::store)?
        .ok_or_else(|| ApiError::referral_not_found(code))?;

    let estimated_earnings = referral.conversions * COMMISSION_USD_PER_CONVERSION;
    Ok(Json(ReferralStatsResponse {
        referral,
        estimated_earnings,
    }))
}

/// Gate an admin operation on the configured secret, compared
/// byte-for-byte. The same failure is returned for a missing and a wrong
/// secret, and the supplied value is never logged.
fn authorize_admin(state: &AppState, secret: &str) -> Result<(), ApiError> {
    if secret.is_empty() || secret.as_bytes() != state.config.admin_secret.as_bytes() {
        return Err(ApiError::unauthorized());
    }
    Ok(())
}

/// Fresh 256-bit reference marker, hex-encoded. Generated independently of
/// the session id so one is never derivable from the other.
fn new_reference_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
