//! Realtime connection manager: one authenticated transport with reconnect.
//!
//! ARCHITECTURE
//! ============
//! `connect` spawns a single driver task that owns the transport for its
//! whole life: it performs the handshake, pumps inbound frames to listeners,
//! and on a drop walks the reconnect state machine:
//!
//! ```text
//! idle -> connecting -> open -> reconnecting -> connecting -> open ...
//!                                     ^              |
//!                                     +-- failure ---+
//! any -> closed   (disconnect, rejected handshake, or retries exhausted)
//! ```
//!
//! DESIGN
//! ======
//! - Listeners are stored on the manager, not on the transport, so they
//!   survive reconnects untouched.
//! - `emit` fails fast with `NotConnected` unless the state is `open`; there
//!   is no implicit outbound queue.
//! - Each driver carries the generation it was started with. Every state
//!   write checks it, so a driver superseded by `disconnect`/`connect` can
//!   never overwrite the state of its successor.
//! - `disconnect` aborts the driver, which also cancels a pending backoff sleep.

pub mod backoff;
pub mod ws;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use frames::Frame;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use backoff::Backoff;
pub use ws::WsTransport;

const EVENT_CHANNEL_CAPACITY: usize = 128;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Every state transition, in order.
    StateChanged { state: ConnectionState, attempt: u32 },
    /// Retries exhausted; the manager is `closed` until a fresh `connect`.
    Lost { attempts: u32 },
    /// The server refused the handshake (bad or expired token).
    Rejected { reason: String },
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    #[error("realtime connection is not open")]
    NotConnected,
    #[error("realtime handshake rejected: {0}")]
    Rejected(String),
    #[error("realtime transport failed: {0}")]
    Transport(String),
    #[error("realtime connection lost after {attempts} attempts")]
    Lost { attempts: u32 },
}

/// Both halves of an open transport. The link is dropped when `inbound` yields `None`.
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<Frame>,
    pub inbound: mpsc::UnboundedReceiver<Frame>,
}

/// Physical realtime channel.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open one authenticated link.
    ///
    /// Returns [`ConnectionError::Rejected`] when the server refuses the
    /// token; any other error is treated as transient.
    async fn open(&self, token: &str) -> Result<TransportLink, ConnectionError>;
}

pub type Listener = Arc<dyn Fn(&Frame) + Send + Sync>;

// =============================================================================
// CONNECTION MANAGER
// =============================================================================

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Mutex<ConnInner>>,
    transport: Arc<dyn Transport>,
    backoff: Backoff,
    state_tx: watch::Sender<ConnectionSnapshot>,
    events: broadcast::Sender<ConnectionEvent>,
}

struct ConnInner {
    state: ConnectionState,
    attempt: u32,
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<Frame>>,
    driver: Option<JoinHandle<()>>,
    subscriptions: HashMap<String, Vec<(u64, Listener)>>,
    next_listener_id: u64,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, backoff: Backoff) -> Self {
        let (state_tx, _) = watch::channel(ConnectionSnapshot { state: ConnectionState::Idle, attempt: 0 });
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(ConnInner {
                state: ConnectionState::Idle,
                attempt: 0,
                generation: 0,
                outbound: None,
                driver: None,
                subscriptions: HashMap::new(),
                next_listener_id: 0,
            })),
            transport,
            backoff,
            state_tx,
            events,
        }
    }

    /// Start connecting with `token`. Returns `false` (and does nothing) while
    /// a connection is already open or in flight.
    pub fn connect(&self, token: &str) -> bool {
        let mut inner = self.lock();
        if matches!(
            inner.state,
            ConnectionState::Connecting | ConnectionState::Open | ConnectionState::Reconnecting
        ) {
            debug!(state = ?inner.state, "connect ignored; connection already active");
            return false;
        }

        inner.generation += 1;
        let generation = inner.generation;
        self.set_state_locked(&mut inner, ConnectionState::Connecting, 0);

        let driver = tokio::spawn(self.clone().drive(generation, token.to_owned()));
        inner.driver = Some(driver);
        info!(generation, "realtime connect started");
        true
    }

    /// Close the transport and cancel any pending retry. Idempotent.
    pub fn disconnect(&self) {
        let driver = {
            let mut inner = self.lock();
            let driver = inner.driver.take();
            inner.outbound = None;
            if inner.state == ConnectionState::Closed && driver.is_none() {
                return;
            }
            inner.generation += 1;
            self.set_state_locked(&mut inner, ConnectionState::Closed, 0);
            driver
        };
        if let Some(driver) = driver {
            driver.abort();
        }
        info!("realtime disconnected");
    }

    /// Send `event` with `payload`. Returns the request frame id.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::NotConnected`] unless the connection is open.
    pub fn emit(&self, event: &str, payload: Value) -> Result<String, ConnectionError> {
        let frame = Frame::request(event, payload);
        let id = frame.id.clone();
        self.send_frame(frame)?;
        Ok(id)
    }

    /// Send a pre-built frame.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::NotConnected`] unless the connection is open.
    pub fn send_frame(&self, frame: Frame) -> Result<(), ConnectionError> {
        let inner = self.lock();
        if inner.state != ConnectionState::Open {
            return Err(ConnectionError::NotConnected);
        }
        let Some(tx) = &inner.outbound else {
            return Err(ConnectionError::NotConnected);
        };
        tx.send(frame).map_err(|_| ConnectionError::NotConnected)
    }

    /// Register `listener` for frames named `event`. Listeners run in
    /// registration order and survive reconnects.
    pub fn subscribe<F>(&self, event: &str, listener: F) -> Subscription
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        inner.next_listener_id += 1;
        let id = inner.next_listener_id;
        inner
            .subscriptions
            .entry(event.to_owned())
            .or_default()
            .push((id, Arc::new(listener)));
        Subscription { inner: Arc::downgrade(&self.inner), event: event.to_owned(), id }
    }

    /// Forward frames named `event` into a channel.
    pub fn subscribe_channel(&self, event: &str) -> (Subscription, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = self.subscribe(event, move |frame| {
            let _ = tx.send(frame.clone());
        });
        (sub, rx)
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.lock().attempt
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self, event: &str) -> usize {
        self.lock().subscriptions.get(event).map_or(0, Vec::len)
    }

    #[must_use]
    pub fn watch(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.state_tx.subscribe()
    }

    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    // -------------------------------------------------------------------------
    // Driver
    // -------------------------------------------------------------------------

    async fn drive(self, generation: u64, token: String) {
        let mut attempt: u32 = 0;
        let mut reconnecting = false;

        loop {
            if reconnecting {
                let delay = self.backoff.delay(attempt);
                info!(attempt, delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), "realtime reconnect scheduled");
                tokio::time::sleep(delay).await;
                if !self.transition(generation, ConnectionState::Connecting, attempt) {
                    return;
                }
            }

            match self.transport.open(&token).await {
                Ok(link) => {
                    if !self.on_open(generation, link.outbound) {
                        return;
                    }
                    attempt = 0;
                    self.pump(link.inbound).await;
                    warn!("realtime transport dropped");
                    if !self.transition(generation, ConnectionState::Reconnecting, 0) {
                        return;
                    }
                    reconnecting = true;
                }
                Err(ConnectionError::Rejected(reason)) => {
                    warn!(%reason, "realtime handshake rejected");
                    self.close(generation, ConnectionEvent::Rejected { reason });
                    return;
                }
                Err(e) => {
                    if reconnecting {
                        attempt = attempt.saturating_add(1);
                    }
                    warn!(error = %e, attempt, "realtime connect failed");
                    if attempt >= self.backoff.max_attempts() && reconnecting {
                        self.close(generation, ConnectionEvent::Lost { attempts: attempt });
                        return;
                    }
                    if !self.transition(generation, ConnectionState::Reconnecting, attempt) {
                        return;
                    }
                    reconnecting = true;
                }
            }
        }
    }

    async fn pump(&self, mut inbound: mpsc::UnboundedReceiver<Frame>) {
        while let Some(frame) = inbound.recv().await {
            self.dispatch(&frame);
        }
    }

    fn dispatch(&self, frame: &Frame) {
        let listeners: Vec<Listener> = {
            let inner = self.lock();
            inner
                .subscriptions
                .get(&frame.event)
                .map(|subs| subs.iter().map(|(_, l)| Arc::clone(l)).collect())
                .unwrap_or_default()
        };
        if listeners.is_empty() {
            debug!(event = %frame.event, "no listener for realtime frame");
        }
        for listener in listeners {
            listener(frame);
        }
    }

    fn on_open(&self, generation: u64, outbound: mpsc::UnboundedSender<Frame>) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation {
            return false;
        }
        inner.outbound = Some(outbound);
        self.set_state_locked(&mut inner, ConnectionState::Open, 0);
        info!("realtime connection open");
        true
    }

    fn transition(&self, generation: u64, state: ConnectionState, attempt: u32) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation {
            return false;
        }
        if state != ConnectionState::Open {
            inner.outbound = None;
        }
        self.set_state_locked(&mut inner, state, attempt);
        true
    }

    fn close(&self, generation: u64, event: ConnectionEvent) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        inner.outbound = None;
        // Detach our own handle; the task ends right after this.
        inner.driver = None;
        self.set_state_locked(&mut inner, ConnectionState::Closed, 0);
        let _ = self.events.send(event);
    }

    /// Publishes under the lock so watchers and event consumers see
    /// transitions in the order they happened.
    fn set_state_locked(&self, inner: &mut ConnInner, state: ConnectionState, attempt: u32) {
        inner.state = state;
        inner.attempt = attempt;
        self.state_tx.send_replace(ConnectionSnapshot { state, attempt });
        let _ = self.events.send(ConnectionEvent::StateChanged { state, attempt });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ConnInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// =============================================================================
// SUBSCRIPTION
// =============================================================================

/// Disposer returned by [`ConnectionManager::subscribe`].
#[must_use = "dropping a Subscription keeps the listener registered; call `unsubscribe` to remove it"]
pub struct Subscription {
    inner: Weak<Mutex<ConnInner>>,
    event: String,
    id: u64,
}

impl Subscription {
    /// Remove the listener. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(subs) = inner.subscriptions.get_mut(&self.event) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|(id, _)| *id != self.id);
        let removed = subs.len() != before;
        if subs.is_empty() {
            inner.subscriptions.remove(&self.event);
        }
        removed
    }
}

#[cfg(test)]
#[path = "realtime_test.rs"]
mod tests;
