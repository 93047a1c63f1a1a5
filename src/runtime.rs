//! Runtime: composition root for one tab.
//!
//! ARCHITECTURE
//! ============
//! ```text
//!                  +-------------------+
//!  storage  <----> |  SessionManager   | --watch--> session task
//!     |            +-------------------+                |
//!     |                                    connect / disconnect / reset
//!     v                                                 v
//!  PreferenceSync     ConversationEngine <-- ConnectionManager --events--> events task
//!                              |                                              |
//!                              +---------------> Notifier <-------------------+
//! ```
//!
//! All services are constructed here and handed their collaborators; nothing
//! reaches for a global. `start` spawns the background reactions:
//!
//! - session task: connect on `authenticated`; tear down connection and
//!   conversation whenever the session epoch moves (logout, expiry, a new
//!   login even as the same user) or the session leaves `authenticated`
//! - events task: a rejected handshake expires the session, a lost connection
//!   raises an error toast
//! - storage task: another tab removing the auth token logs this tab out
//! - preference listener: cross-tab preference convergence

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{BotChannel, ConfigError, RuntimeConfig};
use crate::conversation::{ConversationEngine, HttpReplyChannel, RealtimeReplyChannel, ReplyChannel, ReplyError};
use crate::notify::Notifier;
use crate::prefs::PreferenceSync;
use crate::realtime::{Backoff, ConnectionEvent, ConnectionManager, Transport, WsTransport};
use crate::session::{AuthError, AuthService, Credentials, HttpAuthService, SessionManager, SessionSnapshot, SessionStatus};
use crate::storage::{FileStorage, Storage, StorageError, TabId, keys};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("preference store: {0}")]
    Storage(#[from] StorageError),
    #[error("auth client: {0}")]
    Auth(#[from] AuthError),
    #[error("chatbot client: {0}")]
    Reply(#[from] ReplyError),
}

pub struct Runtime {
    config: RuntimeConfig,
    tab: TabId,
    storage: Arc<dyn Storage>,
    session: SessionManager,
    connection: ConnectionManager,
    conversation: ConversationEngine,
    notifier: Notifier,
    prefs: PreferenceSync,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Wire the services around injected collaborators.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Reply`] if the HTTP chatbot client cannot be built.
    pub fn new(
        config: RuntimeConfig,
        storage: Arc<dyn Storage>,
        auth: Arc<dyn AuthService>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, RuntimeError> {
        let tab = TabId::new();
        let notifier = Notifier::new(config.notify);
        let session = SessionManager::new(auth, Arc::clone(&storage), tab);
        let connection = ConnectionManager::new(transport, Backoff::new(config.backoff));
        let channel: Arc<dyn ReplyChannel> = match config.bot_channel {
            BotChannel::Realtime => Arc::new(RealtimeReplyChannel::new(connection.clone())),
            BotChannel::Http => {
                Arc::new(HttpReplyChannel::new(config.api_url.clone(), config.http_timeout, session.clone())?)
            }
        };
        let conversation = ConversationEngine::new(channel, notifier.clone(), config.conversation);
        let prefs = PreferenceSync::new(Arc::clone(&storage), tab, notifier.clone(), config.supported_languages.clone());

        info!(%tab, bot_channel = ?config.bot_channel, "runtime assembled");
        Ok(Self {
            config,
            tab,
            storage,
            session,
            connection,
            conversation,
            notifier,
            prefs,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Production wiring: JSON-file storage, REST auth, WebSocket transport.
    ///
    /// # Errors
    ///
    /// Fails if the preference file is unreadable or an HTTP client cannot be built.
    pub fn from_config(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        let storage = Arc::new(FileStorage::open(&config.storage_path)?);
        let auth = Arc::new(HttpAuthService::new(config.api_url.clone(), config.http_timeout)?);
        let transport = Arc::new(WsTransport::new(config.ws_url.clone()));
        Self::new(config, storage, auth, transport)
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Spawn the background reactions. Call once, inside a tokio runtime.
    pub fn start(&self) {
        let mut tasks = vec![self.spawn_session_task(), self.spawn_connection_task(), self.spawn_storage_task()];
        if let Some(listener) = self.prefs.spawn_listener() {
            tasks.push(listener);
        }
        self.lock_tasks().extend(tasks);
    }

    /// Start and silently restore a persisted session.
    pub async fn boot(&self) -> SessionStatus {
        self.start();
        self.session.restore().await
    }

    /// Log in, reporting failure as an error toast.
    ///
    /// # Errors
    ///
    /// The [`AuthError`] from the credential exchange or identity fetch.
    pub async fn login(&self, credentials: &Credentials) -> Result<SessionSnapshot, AuthError> {
        match self.session.login(credentials).await {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                if !matches!(e, AuthError::Cancelled) {
                    self.notifier.error(format!("Sign-in failed: {e}"));
                }
                Err(e)
            }
        }
    }

    /// Tear down the conversation and connection, then end the session.
    pub async fn logout(&self) {
        self.conversation.reset();
        self.connection.disconnect();
        self.session.logout().await;
    }

    /// Reconnect after the connection was declared lost. Returns `false` when
    /// there is no authenticated session or a connection is already active.
    pub fn reconnect(&self) -> bool {
        match self.session.token() {
            Some(token) => self.connection.connect(&token),
            None => false,
        }
    }

    /// Stop background tasks and close the connection.
    pub fn shutdown(&self) {
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
        self.connection.disconnect();
        info!(tab = %self.tab, "runtime shut down");
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[must_use]
    pub fn tab(&self) -> TabId {
        self.tab
    }

    #[must_use]
    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    #[must_use]
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    #[must_use]
    pub fn conversation(&self) -> &ConversationEngine {
        &self.conversation
    }

    #[must_use]
    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    #[must_use]
    pub fn prefs(&self) -> &PreferenceSync {
        &self.prefs
    }

    // -------------------------------------------------------------------------
    // Background reactions
    // -------------------------------------------------------------------------

    fn spawn_session_task(&self) -> JoinHandle<()> {
        let session = self.session.clone();
        let connection = self.connection.clone();
        let conversation = self.conversation.clone();
        let mut rx = session.watch();

        tokio::spawn(async move {
            // Epoch of the session the live connection was opened for.
            let mut connected: Option<u64> = None;
            loop {
                // Clone out of the watch borrow before touching any service.
                let snapshot = rx.borrow_and_update().clone();
                let authenticated = snapshot.status == SessionStatus::Authenticated && snapshot.user.is_some();

                if connected.is_some_and(|epoch| !authenticated || epoch != snapshot.epoch) {
                    info!(
                        status = ?snapshot.status,
                        epoch = snapshot.epoch,
                        "session identity changed; closing realtime connection"
                    );
                    conversation.reset();
                    connection.disconnect();
                    connected = None;
                }
                if authenticated && connected.is_none() {
                    if let Some(token) = session.token() {
                        connection.connect(&token);
                        connected = Some(snapshot.epoch);
                    }
                }

                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    fn spawn_connection_task(&self) -> JoinHandle<()> {
        let session = self.session.clone();
        let notifier = self.notifier.clone();
        let mut events = self.connection.events();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ConnectionEvent::Lost { attempts }) => {
                        warn!(attempts, "realtime connection lost");
                        notifier.error("Connection lost. Live updates are paused.");
                    }
                    Ok(ConnectionEvent::Rejected { reason }) => {
                        warn!(%reason, "realtime connection rejected; expiring session");
                        session.expire();
                        notifier.error("Your session has expired. Please sign in again.");
                    }
                    Ok(ConnectionEvent::StateChanged { .. }) => {}
                    Err(RecvError::Lagged(n)) => debug!(skipped = n, "connection event consumer lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_storage_task(&self) -> JoinHandle<()> {
        let session = self.session.clone();
        let tab = self.tab;
        let mut changes = self.storage.subscribe();

        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(event) if event.key == keys::AUTH_TOKEN && event.origin != tab && event.value.is_none() => {
                        info!(origin = %event.origin, "auth token removed by another tab");
                        session.forget();
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => debug!(skipped = n, "storage event consumer lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
        self.connection.disconnect();
    }
}

#[cfg(test)]
#[path = "runtime_test.rs"]
mod tests;
