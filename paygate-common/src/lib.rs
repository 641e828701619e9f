//! Shared domain types for the paygate workspace.
//!
//! A [`Session`] is one purchase attempt: the buyer is quoted a token amount
//! (price locked at creation) and a reference marker to embed in the on-chain
//! transfer. A [`Referral`] is one affiliate, identified by its code, with
//! click and conversion counters.
//!
//! These records are stored as JSON and served on the wire with the same
//! field names, so the serde attributes here define both formats.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Token amounts are quoted to four decimal places.
pub const TOKEN_AMOUNT_DECIMALS: u32 = 4;

const TOKEN_AMOUNT_SCALE: f64 = 10_000.0;

/// Status of a payment session. Monotonic: once confirmed, never reverts.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Confirmed,
}

impl SessionStatus {
    pub fn is_confirmed(self) -> bool {
        matches!(self, SessionStatus::Confirmed)
    }
}

/// One purchase attempt, keyed externally by its session id.
///
/// `reference_key` is the high-entropy marker the payer embeds in the
/// on-chain transaction; `token_amount` is locked at creation time and never
/// recomputed, so a late confirmation does not change the amount owed.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub reference_key: String,
    pub token_amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referral_code: Option<String>,
    pub created_at: u64,
    pub status: SessionStatus,
}

impl Session {
    /// Create a pending session stamped with the current time.
    pub fn new(
        reference_key: impl Into<String>,
        token_amount: f64,
        referral_code: Option<String>,
    ) -> Self {
        Self {
            reference_key: reference_key.into(),
            token_amount,
            referral_code,
            created_at: epoch_secs(),
            status: SessionStatus::Pending,
        }
    }
}

/// One affiliate. `code` is the primary key; counters only ever grow.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Referral {
    pub code: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub contact_handle: String,
    pub created_at: u64,
    pub clicks: u64,
    pub conversions: u64,
}

impl Referral {
    /// Create a fresh referral record with zeroed counters.
    pub fn new(
        code: impl Into<String>,
        name: impl Into<String>,
        contact_handle: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
            contact_handle: contact_handle.into(),
            created_at: epoch_secs(),
            clicks: 0,
            conversions: 0,
        }
    }
}

/// Convert a fiat price into a token amount at the given USD rate, rounded
/// to [`TOKEN_AMOUNT_DECIMALS`] decimal places.
pub fn token_amount(fiat_usd: f64, rate_usd: f64) -> f64 {
    round_token_amount(fiat_usd / rate_usd)
}

/// Round a token amount to the quoted precision.
pub fn round_token_amount(value: f64) -> f64 {
    (value * TOKEN_AMOUNT_SCALE).round() / TOKEN_AMOUNT_SCALE
}

/// Current unix time in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}
