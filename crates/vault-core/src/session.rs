//! Session registry
//!
//! The registry is the only owner of session keys. Callers get a
//! [`SessionInfo`] without key material, and reach the key through
//! [`SessionRegistry::with_key`], which lends a zeroizing snapshot for the
//! duration of one closure call.
//!
//! Expiry is checked on every access: a session whose idle time has reached
//! its timeout is removed (and its key zeroed) by the call that notices it.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::crypto::SessionKey;
use crate::error::SessionError;
use crate::principal::PrincipalId;

/// Handle presented by callers for every vault operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle position of a live session. Expired and terminated sessions are
/// no longer in the registry at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No activity recorded since creation
    Created,
    /// Touched at least once
    Active,
}

struct SessionRecord {
    session_id: SessionId,
    principal_id: PrincipalId,
    encryption_key: SessionKey,
    created_at: DateTime<Utc>,
    last_activity: Instant,
    timeout: Duration,
    state: SessionState,
}

impl SessionRecord {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_activity) >= self.timeout
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.session_id,
            principal_id: self.principal_id,
            created_at: self.created_at,
            timeout: self.timeout,
            state: self.state,
        }
    }
}

/// Session metadata without key material
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    session_id: SessionId,
    principal_id: PrincipalId,
    created_at: DateTime<Utc>,
    timeout: Duration,
    state: SessionState,
}

impl SessionInfo {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn principal_id(&self) -> PrincipalId {
        self.principal_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn state(&self) -> SessionState {
        self.state
    }
}

/// Keys held before a principal-wide key swap
#[must_use = "dropping the previous keys makes the swap permanent"]
pub struct PreviousKeys(Vec<(SessionId, SessionKey)>);

/// Owner of every live session and its key
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, SessionRecord>>,
}

/// Find a live session, evicting it if it has timed out
fn live_session(
    sessions: &mut HashMap<SessionId, SessionRecord>,
    session_id: SessionId,
    now: Instant,
) -> Result<&mut SessionRecord, SessionError> {
    let expired = sessions
        .get(&session_id)
        .ok_or(SessionError::NotFound)?
        .is_expired(now);

    if expired {
        if let Some(record) = sessions.remove(&session_id) {
            info!(
                "Session {} for principal {} expired",
                session_id, record.principal_id
            );
        }
        return Err(SessionError::Expired);
    }

    sessions.get_mut(&session_id).ok_or(SessionError::NotFound)
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, taking ownership of its key
    pub async fn create(
        &self,
        principal_id: PrincipalId,
        encryption_key: SessionKey,
        timeout: Duration,
    ) -> SessionInfo {
        let record = SessionRecord {
            session_id: SessionId::new(),
            principal_id,
            encryption_key,
            created_at: Utc::now(),
            last_activity: Instant::now(),
            timeout,
            state: SessionState::Created,
        };
        let info = record.info();

        self.sessions.lock().await.insert(record.session_id, record);

        debug!(
            "Created session {} for principal {} (timeout {:?})",
            info.session_id, principal_id, timeout
        );
        info
    }

    /// Check that a session is live. An expired session is evicted here.
    pub async fn validate(&self, session_id: SessionId) -> Result<SessionInfo, SessionError> {
        let mut sessions = self.sessions.lock().await;
        live_session(&mut sessions, session_id, Instant::now()).map(|record| record.info())
    }

    /// Record activity on a session, restarting its idle timer
    pub async fn touch(&self, session_id: SessionId) -> Result<(), SessionError> {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().await;
        let record = live_session(&mut sessions, session_id, now)?;
        record.last_activity = now;
        record.state = SessionState::Active;
        Ok(())
    }

    /// Lend the session key to `f`
    ///
    /// `f` receives a snapshot copied under the lock; the snapshot is zeroed
    /// when `f` returns. Terminating the session meanwhile does not affect a
    /// call already running, but no later call can obtain the key.
    pub async fn with_key<F, R>(&self, session_id: SessionId, f: F) -> Result<R, SessionError>
    where
        F: FnOnce(&SessionKey) -> R,
    {
        let snapshot = {
            let mut sessions = self.sessions.lock().await;
            live_session(&mut sessions, session_id, Instant::now())?
                .encryption_key
                .snapshot()
        };
        Ok(f(&snapshot))
    }

    /// Give every session of `principal_id` a copy of `key`, e.g. once the
    /// principal's secrets have been re-encrypted under it
    ///
    /// Sessions whose timeout has passed but that are not evicted yet are
    /// swapped too. The returned keys undo the swap through
    /// [`SessionRegistry::restore_keys`].
    pub async fn replace_principal_key(
        &self,
        principal_id: PrincipalId,
        key: &SessionKey,
    ) -> PreviousKeys {
        let mut sessions = self.sessions.lock().await;
        let previous: Vec<_> = sessions
            .values_mut()
            .filter(|record| record.principal_id == principal_id)
            .map(|record| {
                let old = std::mem::replace(&mut record.encryption_key, key.snapshot());
                (record.session_id, old)
            })
            .collect();
        debug!(
            "Replaced key of {} sessions of principal {}",
            previous.len(),
            principal_id
        );
        PreviousKeys(previous)
    }

    /// Put back keys swapped out by [`SessionRegistry::replace_principal_key`].
    /// Sessions terminated since are skipped.
    pub async fn restore_keys(&self, previous: PreviousKeys) {
        let mut sessions = self.sessions.lock().await;
        for (session_id, key) in previous.0 {
            if let Some(record) = sessions.get_mut(&session_id) {
                record.encryption_key = key;
            }
        }
    }

    /// Explicit logout. Returns whether a session was removed; calling it
    /// again is harmless.
    pub async fn terminate(&self, session_id: SessionId) -> bool {
        let removed = self.sessions.lock().await.remove(&session_id);
        match removed {
            Some(record) => {
                info!(
                    "Terminated session {} for principal {}",
                    session_id, record.principal_id
                );
                true
            }
            None => false,
        }
    }

    /// Terminate every session of a principal except `keep`
    pub async fn terminate_principal(
        &self,
        principal_id: PrincipalId,
        keep: Option<SessionId>,
    ) -> usize {
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|id, record| record.principal_id != principal_id || Some(*id) == keep);
        let removed = before - sessions.len();
        if removed > 0 {
            info!("Terminated {} sessions of principal {}", removed, principal_id);
        }
        removed
    }

    /// Evict every session that has timed out
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, record| !record.is_expired(now));
        let purged = before - sessions.len();
        if purged > 0 {
            debug!("Purged {} expired sessions", purged);
        }
        purged
    }

    /// Number of sessions currently held, expired or not
    pub async fn active_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Drop every session and zero every key
    pub async fn shutdown(&self) {
        let mut sessions = self.sessions.lock().await;
        let count = sessions.len();
        sessions.clear();
        info!("Session registry shut down ({} sessions cleared)", count);
    }
}
