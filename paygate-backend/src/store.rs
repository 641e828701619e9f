//! Durable session and referral storage.
//!
//! The store is the single source of truth for all mutable state: handlers
//! re-read, mutate, and re-write full records through it on every call and
//! never cache a record across requests. Three backends sit behind one
//! interface:
//!
//! - `InMemory` — mutex-guarded maps, used by tests.
//! - `Persistent` — sled, one tree per record kind, JSON-encoded values.
//! - `Unavailable` — explicit degraded mode. Every operation returns
//!   [`StoreError::Unavailable`], so callers can tell degraded persistence
//!   apart from success instead of silently losing writes.
//!
//! The `pending -> confirmed` transition and the referral counters are
//! compare-and-swap operations keyed on the previously read record bytes, so
//! concurrent request handlers never double-apply a transition or lose a
//! counter increment.

use std::{
    collections::HashMap,
    env, fs,
    path::Path,
    sync::{Arc, Mutex},
};

use paygate_common::{Referral, Session, SessionStatus};
use thiserror::Error;
use tracing::warn;

/// Environment variable for the session database path.
pub const SESSION_DB_ENV: &str = "PAYGATE_SESSION_DB";
/// Default path for the session database.
pub const DEFAULT_SESSION_DB_PATH: &str = "data/paygate.db";

const SESSIONS_TREE: &str = "sessions";
const REFERRALS_TREE: &str = "referrals";

#[derive(Debug, Error)]
pub enum StoreError {
    /// The store is running in degraded mode and holds no data.
    #[error("session store is unavailable")]
    Unavailable,
    #[error("session store backend error: {0}")]
    Backend(String),
    #[error("stored record could not be encoded or decoded: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Result of attempting the `pending -> confirmed` transition.
///
/// Only [`ConfirmOutcome::Transitioned`] means this caller performed the
/// flip; followers racing on the same session observe `AlreadyConfirmed` and
/// must not re-apply side effects tied to the transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Transitioned,
    AlreadyConfirmed,
    Missing,
}

#[derive(Default)]
struct Tables {
    sessions: HashMap<String, Session>,
    referrals: HashMap<String, Referral>,
}

enum StoreBackend {
    InMemory(Mutex<Tables>),
    Persistent(sled::Db),
    Unavailable,
}

/// Session and referral store.
#[derive(Clone)]
pub struct Store {
    backend: Arc<StoreBackend>,
}

impl Store {
    /// In-memory store for tests.
    pub fn in_memory() -> Self {
        Self {
            backend: Arc::new(StoreBackend::InMemory(Mutex::new(Tables::default()))),
        }
    }

    /// Degraded store: reachable as a value, unusable as storage.
    pub fn unavailable() -> Self {
        Self {
            backend: Arc::new(StoreBackend::Unavailable),
        }
    }

    /// Persistent store at the given sled path.
    pub fn persistent(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| {
                    StoreError::Backend(format!(
                        "failed to create directory for session db at {}: {}",
                        path_ref.display(),
                        err
                    ))
                })?;
            }
        }
        let db = sled::open(path_ref)?;
        Ok(Self {
            backend: Arc::new(StoreBackend::Persistent(db)),
        })
    }

    /// Open the store configured by the environment, degrading with a
    /// warning instead of aborting when the database cannot be opened.
    /// Session creation stays available in that mode; confirmation checks
    /// against sessions created while degraded will report the store as
    /// unavailable.
    pub fn from_env() -> Self {
        let path = env::var(SESSION_DB_ENV).unwrap_or_else(|_| DEFAULT_SESSION_DB_PATH.to_string());
        match Self::persistent(&path) {
            Ok(store) => store,
            Err(err) => {
                warn!(%path, error = %err, "session db unavailable, continuing without persistence");
                Self::unavailable()
            }
        }
    }

    /// Whether the store is running in the degraded, no-persistence mode.
    pub fn is_degraded(&self) -> bool {
        matches!(*self.backend, StoreBackend::Unavailable)
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        match &*self.backend {
            StoreBackend::InMemory(tables) => {
                Ok(lock(tables).sessions.get(session_id).cloned())
            }
            StoreBackend::Persistent(db) => {
                let tree = db.open_tree(SESSIONS_TREE)?;
                match tree.get(session_id.as_bytes())? {
                    Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
                    None => Ok(None),
                }
            }
            StoreBackend::Unavailable => Err(StoreError::Unavailable),
        }
    }

    pub fn put_session(&self, session_id: &str, session: &Session) -> Result<(), StoreError> {
        match &*self.backend {
            StoreBackend::InMemory(tables) => {
                lock(tables)
                    .sessions
                    .insert(session_id.to_string(), session.clone());
                Ok(())
            }
            StoreBackend::Persistent(db) => {
                let tree = db.open_tree(SESSIONS_TREE)?;
                tree.insert(session_id.as_bytes(), serde_json::to_vec(session)?)?;
                Ok(())
            }
            StoreBackend::Unavailable => Err(StoreError::Unavailable),
        }
    }

    /// Flip a session to `confirmed`, exactly once.
    ///
    /// The persistent backend uses a compare-and-swap guarded by the
    /// previously read record bytes and retries on conflict, so N concurrent
    /// callers produce exactly one [`ConfirmOutcome::Transitioned`].
    pub fn confirm_session(&self, session_id: &str) -> Result<ConfirmOutcome, StoreError> {
        match &*self.backend {
            StoreBackend::InMemory(tables) => {
                let mut guard = lock(tables);
                match guard.sessions.get_mut(session_id) {
                    Some(session) if session.status.is_confirmed() => {
                        Ok(ConfirmOutcome::AlreadyConfirmed)
                    }
                    Some(session) => {
                        session.status = SessionStatus::Confirmed;
                        Ok(ConfirmOutcome::Transitioned)
                    }
                    None => Ok(ConfirmOutcome::Missing),
                }
            }
            StoreBackend::Persistent(db) => {
                let tree = db.open_tree(SESSIONS_TREE)?;
                loop {
                    let current = match tree.get(session_id.as_bytes())? {
                        Some(bytes) => bytes,
                        None => return Ok(ConfirmOutcome::Missing),
                    };
                    let mut session: Session = serde_json::from_slice(&current)?;
                    if session.status.is_confirmed() {
                        return Ok(ConfirmOutcome::AlreadyConfirmed);
                    }
                    session.status = SessionStatus::Confirmed;
                    let next = serde_json::to_vec(&session)?;
                    match tree.compare_and_swap(
                        session_id.as_bytes(),
                        Some(&current),
                        Some(next),
                    )? {
                        Ok(()) => return Ok(ConfirmOutcome::Transitioned),
                        // Lost the race; re-read and re-evaluate.
                        Err(_) => continue,
                    }
                }
            }
            StoreBackend::Unavailable => Err(StoreError::Unavailable),
        }
    }

    pub fn get_referral(&self, code: &str) -> Result<Option<Referral>, StoreError> {
        match &*self.backend {
            StoreBackend::InMemory(tables) => Ok(lock(tables).referrals.get(code).cloned()),
            StoreBackend::Persistent(db) => {
                let tree = db.open_tree(REFERRALS_TREE)?;
                match tree.get(code.as_bytes())? {
                    Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
                    None => Ok(None),
                }
            }
            StoreBackend::Unavailable => Err(StoreError::Unavailable),
        }
    }

    /// Write a referral record, overwriting any existing record with the
    /// same code. Counter-resetting overwrite is the intended creation
    /// semantics; callers wanting a merge must fetch first.
    pub fn put_referral(&self, referral: &Referral) -> Result<(), StoreError> {
        match &*self.backend {
            StoreBackend::InMemory(tables) => {
                lock(tables)
                    .referrals
                    .insert(referral.code.clone(), referral.clone());
                Ok(())
            }
            StoreBackend::Persistent(db) => {
                let tree = db.open_tree(REFERRALS_TREE)?;
                tree.insert(referral.code.as_bytes(), serde_json::to_vec(referral)?)?;
                Ok(())
            }
            StoreBackend::Unavailable => Err(StoreError::Unavailable),
        }
    }

    /// Increment the click counter. Returns `false` if the code is unknown.
    pub fn record_click(&self, code: &str) -> Result<bool, StoreError> {
        self.update_referral(code, |referral| referral.clicks += 1)
    }

    /// Increment the conversion counter. Returns `false` if the code is
    /// unknown.
    pub fn record_conversion(&self, code: &str) -> Result<bool, StoreError> {
        self.update_referral(code, |referral| referral.conversions += 1)
    }

    /// Read-modify-write a referral record under a CAS loop so concurrent
    /// increments on the same code never lose updates.
    fn update_referral<F>(&self, code: &str, apply: F) -> Result<bool, StoreError>
    where
        F: Fn(&mut Referral),
    {
        match &*self.backend {
            StoreBackend::InMemory(tables) => {
                let mut guard = lock(tables);
                match guard.referrals.get_mut(code) {
                    Some(referral) => {
                        apply(referral);
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
            StoreBackend::Persistent(db) => {
                let tree = db.open_tree(REFERRALS_TREE)?;
                loop {
                    let current = match tree.get(code.as_bytes())? {
                        Some(bytes) => bytes,
                        None => return Ok(false),
                    };
                    let mut referral: Referral = serde_json::from_slice(&current)?;
                    apply(&mut referral);
                    let next = serde_json::to_vec(&referral)?;
                    match tree.compare_and_swap(code.as_bytes(), Some(&current), Some(next))? {
                        Ok(()) => return Ok(true),
                        Err(_) => continue,
                    }
                }
            }
            StoreBackend::Unavailable => Err(StoreError::Unavailable),
        }
    }
}

fn lock(tables: &Mutex<Tables>) -> std::sync::MutexGuard<'_, Tables> {
    tables.lock().expect("store tables poisoned")
}
