//! Session manager: authenticated-user lifecycle.
//!
//! ARCHITECTURE
//! ============
//! The manager owns the bearer token and the confirmed user. A token alone is
//! never "authenticated": after login or at startup the session sits in
//! `Restoring` until the identity fetch succeeds. Snapshots are published on
//! a watch channel; the runtime reacts to them to connect or tear down the
//! realtime channel and conversation.
//!
//! DESIGN
//! ======
//! Every identity change bumps an epoch. An identity fetch captures the epoch
//! before suspending and is discarded on completion if the epoch moved (for
//! example because the user logged out meanwhile), so a late response can
//! never resurrect a cleared session.
//!
//! ERROR HANDLING
//! ==============
//! Rejected tokens (`TokenExpired`, `InvalidCredentials`) are terminal: the
//! token is wiped from memory and storage. Network failures during restore
//! leave the token in place with status `Error`; retrying is the caller's
//! decision.

pub mod http;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::storage::{Storage, StorageError, TabId, keys};

pub use http::HttpAuthService;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Customer,
    Provider,
    Admin,
    /// A role this client does not know about.
    #[serde(untagged)]
    Other(String),
}

/// Identity returned by the auth service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    pub role: Role,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
}

#[derive(Clone, Serialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Unauthenticated,
    Restoring,
    Authenticated,
    /// Identity fetch failed for non-auth reasons; the token is kept.
    Error,
}

/// Read-only view handed to consumers. Never carries the token itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub user: Option<User>,
    /// Identity generation. Moves on every login, logout and token
    /// rejection, so a consumer that skipped intermediate snapshots can still
    /// tell that the session behind an unchanged user id was replaced.
    pub epoch: u64,
}

impl SessionSnapshot {
    fn unauthenticated() -> Self {
        Self { status: SessionStatus::Unauthenticated, user: None, epoch: 0 }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("session token expired or revoked")]
    TokenExpired,
    #[error("auth service unreachable: {0}")]
    Network(String),
    #[error("token storage failed: {0}")]
    Storage(#[from] StorageError),
    #[error("session changed while the request was in flight")]
    Cancelled,
}

impl AuthError {
    /// Terminal errors force the session to `Unauthenticated`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::InvalidCredentials | Self::TokenExpired)
    }
}

/// External auth collaborator.
#[async_trait::async_trait]
pub trait AuthService: Send + Sync {
    /// Exchange credentials for a bearer token.
    async fn exchange_credentials(&self, credentials: &Credentials) -> Result<String, AuthError>;

    /// Fetch the identity behind `token`.
    async fn fetch_current_user(&self, token: &str) -> Result<User, AuthError>;

    /// Revoke `token` server-side. Best effort.
    async fn revoke(&self, _token: &str) -> Result<(), AuthError> {
        Ok(())
    }
}

// =============================================================================
// SESSION MANAGER
// =============================================================================

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Mutex<SessionInner>>,
    auth: Arc<dyn AuthService>,
    storage: Arc<dyn Storage>,
    tab: TabId,
    state_tx: watch::Sender<SessionSnapshot>,
}

struct SessionInner {
    token: Option<String>,
    user: Option<User>,
    status: SessionStatus,
    epoch: u64,
    /// Set once restore/login reached a terminal status.
    settled: bool,
}

impl SessionInner {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot { status: self.status, user: self.user.clone(), epoch: self.epoch }
    }
}

impl SessionManager {
    #[must_use]
    pub fn new(auth: Arc<dyn AuthService>, storage: Arc<dyn Storage>, tab: TabId) -> Self {
        let (state_tx, _) = watch::channel(SessionSnapshot::unauthenticated());
        Self {
            inner: Arc::new(Mutex::new(SessionInner {
                token: None,
                user: None,
                status: SessionStatus::Unauthenticated,
                epoch: 0,
                settled: false,
            })),
            auth,
            storage,
            tab,
            state_tx,
        }
    }

    /// Restore the persisted session, if any.
    ///
    /// Returns without I/O once a previous restore or login settled; retries
    /// only from `Error`.
    pub async fn restore(&self) -> SessionStatus {
        let (token, epoch) = {
            let mut inner = self.lock();
            if inner.status == SessionStatus::Restoring
                || (inner.settled && inner.status != SessionStatus::Error)
            {
                return inner.status;
            }

            let persisted = inner.token.clone().or_else(|| self.read_persisted_token());
            let Some(token) = persisted else {
                inner.status = SessionStatus::Unauthenticated;
                inner.settled = true;
                drop(inner);
                debug!("no persisted token; session unauthenticated");
                self.publish();
                return SessionStatus::Unauthenticated;
            };
            inner.token = Some(token.clone());
            inner.user = None;
            inner.status = SessionStatus::Restoring;
            (token, inner.epoch)
        };
        self.publish();

        let result = self.auth.fetch_current_user(&token).await;
        if let Err(e) = self.settle(epoch, result) {
            debug!(error = %e, "session restore did not authenticate");
        }
        self.status()
    }

    /// Log in with `credentials`.
    ///
    /// # Errors
    ///
    /// A failed credential exchange leaves the session untouched. A failed
    /// identity fetch after a successful exchange follows the restore rules.
    /// [`AuthError::Cancelled`] means a logout raced the login.
    pub async fn login(&self, credentials: &Credentials) -> Result<SessionSnapshot, AuthError> {
        let start_epoch = self.lock().epoch;
        let token = self.auth.exchange_credentials(credentials).await?;

        let epoch = {
            let mut inner = self.lock();
            if inner.epoch != start_epoch {
                return Err(AuthError::Cancelled);
            }
            inner.epoch += 1;
            inner.token = Some(token.clone());
            inner.user = None;
            inner.status = SessionStatus::Restoring;
            inner.epoch
        };
        if let Err(e) = self.storage.write(self.tab, keys::AUTH_TOKEN, &token) {
            warn!(error = %e, "token not persisted; session will not survive restart");
        }
        self.publish();

        let result = self.auth.fetch_current_user(&token).await;
        self.settle(epoch, result)?;
        Ok(self.snapshot())
    }

    /// Clear the session locally and durably, then revoke the token server-side.
    pub async fn logout(&self) {
        let token = self.clear(true);
        if let Some(token) = token {
            if let Err(e) = self.auth.revoke(&token).await {
                warn!(error = %e, "token revocation failed");
            }
        }
        info!("logged out");
    }

    /// Force `Unauthenticated` after the backend rejected the token elsewhere
    /// (for example on the realtime handshake).
    pub fn expire(&self) {
        if self.clear(true).is_some() {
            warn!("session token rejected; session expired");
        }
    }

    /// Drop the in-memory session because another tab logged out.
    pub(crate) fn forget(&self) {
        if self.clear(false).is_some() {
            info!("session cleared by another tab");
        }
    }

    fn clear(&self, remove_persisted: bool) -> Option<String> {
        let token = {
            let mut inner = self.lock();
            inner.epoch += 1;
            inner.user = None;
            inner.status = SessionStatus::Unauthenticated;
            inner.settled = true;
            inner.token.take()
        };
        if remove_persisted {
            if let Err(e) = self.storage.remove(self.tab, keys::AUTH_TOKEN) {
                warn!(error = %e, "persisted token could not be removed");
            }
        }
        self.publish();
        token
    }

    fn settle(&self, epoch: u64, result: Result<User, AuthError>) -> Result<(), AuthError> {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            debug!(epoch, current = inner.epoch, "discarding stale identity fetch");
            return Err(AuthError::Cancelled);
        }

        match result {
            Ok(user) => {
                info!(user_id = %user.id, role = ?user.role, "session authenticated");
                inner.user = Some(user);
                inner.status = SessionStatus::Authenticated;
                inner.settled = true;
                drop(inner);
                self.publish();
                Ok(())
            }
            Err(e) if e.is_terminal() => {
                inner.epoch += 1;
                inner.token = None;
                inner.user = None;
                inner.status = SessionStatus::Unauthenticated;
                inner.settled = true;
                drop(inner);
                if let Err(se) = self.storage.remove(self.tab, keys::AUTH_TOKEN) {
                    warn!(error = %se, "persisted token could not be removed");
                }
                self.publish();
                Err(e)
            }
            Err(e) => {
                warn!(error = %e, "identity fetch failed; keeping token for retry");
                inner.user = None;
                inner.status = SessionStatus::Error;
                drop(inner);
                self.publish();
                Err(e)
            }
        }
    }

    fn read_persisted_token(&self) -> Option<String> {
        match self.storage.read(keys::AUTH_TOKEN) {
            Ok(token) => token.filter(|t| !t.trim().is_empty()),
            Err(e) => {
                warn!(error = %e, "persisted token unreadable");
                None
            }
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Whether the authenticated user holds one of `roles`. `false` when not authenticated.
    #[must_use]
    pub fn has_role(&self, roles: &[Role]) -> bool {
        let inner = self.lock();
        inner.status == SessionStatus::Authenticated
            && inner
                .user
                .as_ref()
                .is_some_and(|u| roles.contains(&u.role))
    }

    /// Whether the authenticated user holds capability `name`.
    #[must_use]
    pub fn has_capability(&self, name: &str) -> bool {
        let inner = self.lock();
        inner.status == SessionStatus::Authenticated
            && inner
                .user
                .as_ref()
                .is_some_and(|u| u.capabilities.contains(name))
    }

    /// Bearer token, only while authenticated.
    #[must_use]
    pub fn token(&self) -> Option<String> {
        let inner = self.lock();
        if inner.status == SessionStatus::Authenticated {
            inner.token.clone()
        } else {
            None
        }
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.lock().status
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.lock().snapshot()
    }

    #[must_use]
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.state_tx.subscribe()
    }

    /// Sends while holding the session lock so concurrent publishers cannot
    /// reorder snapshots. Watch consumers must not call back into the manager
    /// from inside `wait_for` closures.
    fn publish(&self) {
        let inner = self.lock();
        let snapshot = inner.snapshot();
        self.state_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
