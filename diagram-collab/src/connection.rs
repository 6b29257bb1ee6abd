//! Connection manager: one logical collaboration connection per session.
//!
//! ## State machine
//!
//! ```text
//! Disconnected ──connect──► Connecting ──open──► Connected
//!      ▲                        │                   │
//!      │                      error            close/error
//!      │                        ▼                   ▼
//!      └──────────────── Error / Disconnected ◄─────┘
//!                               │ backoff elapsed
//!                               ▼
//!                         Reconnecting ──open──► Connected
//!                               │ attempts exhausted or credentials rejected
//!                               ▼
//!                             Failed (until force_reconnect)
//! ```
//!
//! All shared state lives behind `std::sync::Mutex`es that are never held
//! across an `.await`. Each transport link carries a generation number so
//! events from a superseded link are ignored.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use diagram_core::current_timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use url::Url;
use uuid::Uuid;

use crate::auth::TokenProvider;
use crate::chunker::MessageChunker;
use crate::config::ConnectionConfig;
use crate::error::{SyncError, SyncResult};
use crate::message::{DomainMessage, InboundMessage, Message, MessageType};
use crate::metrics;
use crate::redact::redact_text;
use crate::transport::{
    is_auth_close_code, Connector, Frame, TransportEvent, TransportLink, WebSocketConnector,
    CLOSE_ABNORMAL, CLOSE_NORMAL,
};
use crate::validation::validate_message_size;

const EVENT_CAPACITY: usize = 256;
const MESSAGE_CAPACITY: usize = 1024;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No link and no retry pending.
    Disconnected,
    /// First attempt in progress.
    Connecting,
    /// Link open.
    Connected,
    /// Retry attempt in progress.
    Reconnecting,
    /// Last attempt failed; a retry may be scheduled.
    Error,
    /// Gave up; only `force_reconnect` leaves this state.
    Failed,
}

impl ConnectionState {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
            Self::Failed => "failed",
        }
    }

    /// Whether a transport open is in flight.
    #[must_use]
    pub const fn is_opening(self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting)
    }

    const fn code(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
            Self::Reconnecting => 3,
            Self::Error => 4,
            Self::Failed => 5,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How loudly an error should be surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Recovered automatically; observable through state only.
    Info,
    /// Dropped a message or a retry is pending.
    Warning,
    /// Needs the user (credentials, exhausted retries).
    Critical,
}

/// An error observed by the connection manager.
#[derive(Debug, Clone)]
pub struct ConnectionErrorEvent {
    /// What went wrong.
    pub error: SyncError,
    /// Whether the manager will retry on its own.
    pub retryable: bool,
    /// How loudly to surface it.
    pub severity: Severity,
}

/// Observable connection events.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The state changed.
    StateChanged {
        /// Previous state.
        from: ConnectionState,
        /// New state.
        to: ConnectionState,
    },
    /// A reconnection attempt was scheduled.
    ReconnectScheduled {
        /// 1-based attempt number.
        attempt: u32,
        /// Backoff before the attempt.
        delay: Duration,
    },
    /// An error occurred.
    Error(ConnectionErrorEvent),
}

struct PendingAck {
    responder: oneshot::Sender<SyncResult<()>>,
    deadline: Instant,
    // Distinguishes this waiter from a later one reusing the id.
    ticket: u64,
}

struct PendingResponse {
    expected: MessageType,
    responder: oneshot::Sender<SyncResult<Value>>,
}

struct Link {
    generation: u64,
    outbound: mpsc::UnboundedSender<Frame>,
    reader: JoinHandle<()>,
}

#[derive(Default)]
struct ReconnectTracker {
    attempts: u32,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    token_provider: Option<Arc<dyn TokenProvider>>,
    state: RwLock<ConnectionState>,
    url: Mutex<Option<Url>>,
    link: Mutex<Option<Link>>,
    generation: AtomicU64,
    // Bumped by connect, force_reconnect and disconnect; an open started
    // under an older value may not install its link.
    intent: AtomicU64,
    manual_disconnect: AtomicBool,
    reconnect: Mutex<ReconnectTracker>,
    pending_acks: Mutex<HashMap<String, PendingAck>>,
    ack_tickets: AtomicU64,
    pending_responses: Mutex<HashMap<String, PendingResponse>>,
    chunker: Mutex<MessageChunker>,
    chunk_send: tokio::sync::Mutex<()>,
    type_subscribers: Mutex<HashMap<MessageType, Vec<mpsc::UnboundedSender<Message>>>>,
    events: broadcast::Sender<ConnectionEvent>,
    messages: broadcast::Sender<Message>,
    domain: broadcast::Sender<DomainMessage>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Manages the collaboration connection.
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("generation", &self.inner.generation.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager over an arbitrary connector.
    #[must_use]
    pub fn new(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        token_provider: Option<Arc<dyn TokenProvider>>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (messages, _) = broadcast::channel(MESSAGE_CAPACITY);
        let (domain, _) = broadcast::channel(MESSAGE_CAPACITY);
        let chunker = MessageChunker::new(config.chunking.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                token_provider,
                state: RwLock::new(ConnectionState::Disconnected),
                url: Mutex::new(None),
                link: Mutex::new(None),
                generation: AtomicU64::new(0),
                intent: AtomicU64::new(0),
                manual_disconnect: AtomicBool::new(false),
                reconnect: Mutex::new(ReconnectTracker::default()),
                pending_acks: Mutex::new(HashMap::new()),
                ack_tickets: AtomicU64::new(0),
                pending_responses: Mutex::new(HashMap::new()),
                chunker: Mutex::new(chunker),
                chunk_send: tokio::sync::Mutex::new(()),
                type_subscribers: Mutex::new(HashMap::new()),
                events,
                messages,
                domain,
            }),
        }
    }

    /// Create a manager that connects over WebSocket.
    #[must_use]
    pub fn websocket(
        config: ConnectionConfig,
        token_provider: Option<Arc<dyn TokenProvider>>,
    ) -> Self {
        Self::new(config, Arc::new(WebSocketConnector), token_provider)
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self
            .inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the link is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Reconnection attempts made since the last successful open.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        lock(&self.inner.reconnect).attempts
    }

    /// Sends still waiting for an ACK.
    #[must_use]
    pub fn pending_ack_count(&self) -> usize {
        lock(&self.inner.pending_acks).len()
    }

    /// Incomplete inbound chunk sets.
    #[must_use]
    pub fn pending_chunk_sets(&self) -> usize {
        lock(&self.inner.chunker).pending_sets()
    }

    /// Observe state changes and errors.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Observe every inbound protocol message.
    #[must_use]
    pub fn subscribe_messages(&self) -> broadcast::Receiver<Message> {
        self.inner.messages.subscribe()
    }

    /// Observe validated (and reassembled) domain messages.
    #[must_use]
    pub fn subscribe_domain(&self) -> broadcast::Receiver<DomainMessage> {
        self.inner.domain.subscribe()
    }

    /// Observe inbound protocol messages of one type.
    ///
    /// The subscription ends when the receiver is dropped.
    #[must_use]
    pub fn subscribe_type(&self, message_type: MessageType) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.inner.type_subscribers)
            .entry(message_type)
            .or_default()
            .push(tx);
        rx
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.inner.events.send(event);
    }

    fn emit_error(&self, error: SyncError, severity: Severity) {
        let retryable = error.is_retryable() && self.inner.config.reconnect.enabled;
        self.emit(ConnectionEvent::Error(ConnectionErrorEvent {
            error,
            retryable,
            severity,
        }));
    }

    fn set_state(&self, to: ConnectionState) {
        self.transition(to, |_| true);
    }

    /// Move to `to` if `allow` accepts the current state. Returns whether
    /// the state is now `to`.
    fn transition(&self, to: ConnectionState, allow: impl FnOnce(ConnectionState) -> bool) -> bool {
        let from = {
            let mut state = self
                .inner
                .state
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let from = *state;
            if !allow(from) {
                return false;
            }
            if from == to {
                return true;
            }
            *state = to;
            from
        };
        match to {
            ConnectionState::Error | ConnectionState::Failed => {
                tracing::warn!(%from, %to, "Connection state changed");
            }
            _ => tracing::info!(%from, %to, "Connection state changed"),
        }
        metrics::record_state_transition(to.as_str(), to.code());
        self.emit(ConnectionEvent::StateChanged { from, to });
        true
    }

    fn next_intent(&self) -> u64 {
        self.inner.intent.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_intent(&self, intent: u64) -> bool {
        self.inner.intent.load(Ordering::SeqCst) == intent
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.generation.load(Ordering::SeqCst) == generation
    }

    /// Connect to `url`.
    ///
    /// Succeeds immediately if already connected. A call made while another
    /// open is in flight waits for that attempt instead of starting its own.
    /// On a retryable failure the state becomes `Error` and, when enabled, a
    /// reconnect task takes over; the error is still returned.
    ///
    /// # Errors
    ///
    /// Returns the classified connect failure, or
    /// [`SyncError::ConnectionClosed`] if `disconnect` ran before the open
    /// completed.
    pub async fn connect(&self, url: &str) -> SyncResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        let url = Url::parse(url).map_err(|e| SyncError::InvalidUrl(format!("{url}: {e}")))?;
        let mut events = self.subscribe_events();
        let mut intent = 0;
        let started = self.transition(ConnectionState::Connecting, |from| {
            let free = !from.is_opening() && from != ConnectionState::Connected;
            if free {
                intent = self.next_intent();
            }
            free
        });
        if !started {
            tracing::debug!("Connection attempt already in flight; waiting for it");
            return self.await_attempt(&mut events).await;
        }

        *lock(&self.inner.url) = Some(url.clone());
        self.inner.manual_disconnect.store(false, Ordering::SeqCst);
        self.cancel_reconnect();
        lock(&self.inner.reconnect).attempts = 0;

        match self.open(&url, intent).await {
            Ok(()) => Ok(()),
            Err(e) if !self.is_intent(intent) => {
                tracing::debug!(error = %e, "Connect superseded");
                Err(e)
            }
            Err(e) => {
                self.connect_failed(e.clone());
                Err(e)
            }
        }
    }

    /// Wait for an in-flight open to settle.
    async fn await_attempt(
        &self,
        events: &mut broadcast::Receiver<ConnectionEvent>,
    ) -> SyncResult<()> {
        loop {
            match self.state() {
                ConnectionState::Connected => return Ok(()),
                state if state.is_opening() => {}
                state => {
                    return Err(SyncError::ConnectionFailed(format!(
                        "concurrent connection attempt ended {state}"
                    )))
                }
            }
            if let Err(broadcast::error::RecvError::Closed) = events.recv().await {
                return Err(SyncError::ConnectionClosed);
            }
        }
    }

    /// Reset the attempt counter and reconnect to the last URL.
    ///
    /// The only way out of `Failed`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidUrl`] if `connect` was never called, or
    /// the classified connect failure.
    pub async fn force_reconnect(&self) -> SyncResult<()> {
        let url = lock(&self.inner.url)
            .clone()
            .ok_or_else(|| SyncError::InvalidUrl("no previous connection".to_string()))?;
        tracing::info!(url = %url, "Forcing reconnect");

        let intent = self.next_intent();
        self.cancel_reconnect();
        self.drop_link(CLOSE_NORMAL, "reconnecting");
        self.reject_pending(&SyncError::ConnectionClosed);
        self.inner.manual_disconnect.store(false, Ordering::SeqCst);
        lock(&self.inner.reconnect).attempts = 0;

        self.set_state(ConnectionState::Connecting);
        match self.open(&url, intent).await {
            Ok(()) => Ok(()),
            Err(e) if !self.is_intent(intent) => {
                tracing::debug!(error = %e, "Forced reconnect superseded");
                Err(e)
            }
            Err(e) => {
                self.connect_failed(e.clone());
                Err(e)
            }
        }
    }

    /// Close the link with a normal-closure code and stop retrying.
    ///
    /// Every pending ACK and response is rejected with
    /// [`SyncError::ConnectionClosed`].
    pub fn disconnect(&self) {
        self.next_intent();
        self.inner.manual_disconnect.store(true, Ordering::SeqCst);
        self.cancel_reconnect();
        self.drop_link(CLOSE_NORMAL, "client disconnect");
        self.reject_pending(&SyncError::ConnectionClosed);
        let discarded = lock(&self.inner.chunker).clear();
        if discarded > 0 {
            tracing::debug!(discarded, "Dropped incomplete chunk sets on disconnect");
        }
        lock(&self.inner.reconnect).attempts = 0;
        self.set_state(ConnectionState::Disconnected);
    }

    /// Open a link and install it unless `intent` was superseded meanwhile.
    async fn open(&self, url: &Url, intent: u64) -> SyncResult<()> {
        let token = match &self.inner.token_provider {
            Some(provider) => provider.access_token().await,
            None => None,
        };
        let opened = tokio::time::timeout(
            self.inner.config.connect_timeout(),
            self.inner.connector.open(url, token),
        )
        .await;

        match opened {
            Ok(Ok(link)) => self.install_link(link, intent),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(SyncError::Timeout(format!(
                "connect to {url} exceeded {}ms",
                self.inner.config.connect_timeout_ms
            ))),
        }
    }

    fn install_link(&self, link: TransportLink, intent: u64) -> SyncResult<()> {
        let TransportLink { outbound, inbound } = link;
        let mut slot = lock(&self.inner.link);
        if !self.is_intent(intent) {
            tracing::debug!(intent, "Discarding link opened for a superseded attempt");
            let _ = outbound.send(Frame::Close {
                code: CLOSE_NORMAL,
                reason: "superseded".to_string(),
            });
            return Err(SyncError::ConnectionClosed);
        }
        if let Some(previous) = slot.take() {
            previous.reader.abort();
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.inner.reconnect).attempts = 0;
        // State flips before the reader starts so a close can never be
        // observed ahead of the open.
        self.set_state(ConnectionState::Connected);

        let manager = self.clone();
        let reader = tokio::spawn(async move { manager.read_loop(generation, inbound).await });
        *slot = Some(Link {
            generation,
            outbound,
            reader,
        });
        tracing::debug!(generation, "Transport link installed");
        Ok(())
    }

    fn drop_link(&self, code: u16, reason: &str) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(link) = lock(&self.inner.link).take() {
            let _ = link.outbound.send(Frame::Close {
                code,
                reason: reason.to_string(),
            });
            link.reader.abort();
        }
    }

    fn connect_failed(&self, error: SyncError) {
        tracing::warn!(error = %error, "Connection attempt failed");
        let retryable = error.is_retryable();
        let severity = if retryable { Severity::Warning } else { Severity::Critical };
        self.emit_error(error, severity);
        self.set_state(ConnectionState::Error);
        if !retryable {
            self.set_state(ConnectionState::Failed);
        } else if self.inner.config.reconnect.enabled {
            self.schedule_reconnect();
        }
    }

    fn cancel_reconnect(&self) {
        if let Some(task) = lock(&self.inner.reconnect).task.take() {
            task.abort();
        }
    }

    fn schedule_reconnect(&self) {
        let manager = self.clone();
        let task = tokio::spawn(async move { manager.reconnect_loop().await });
        if let Some(previous) = lock(&self.inner.reconnect).task.replace(task) {
            previous.abort();
        }
    }

    async fn reconnect_loop(&self) {
        let policy = self.inner.config.reconnect.clone();
        let intent = self.inner.intent.load(Ordering::SeqCst);
        loop {
            let attempt = {
                let mut tracker = lock(&self.inner.reconnect);
                tracker.attempts += 1;
                tracker.attempts
            };
            if attempt > policy.max_attempts {
                tracing::error!(attempts = policy.max_attempts, "Reconnection attempts exhausted");
                self.emit_error(
                    SyncError::ConnectionFailed(format!(
                        "gave up after {} reconnection attempts",
                        policy.max_attempts
                    )),
                    Severity::Critical,
                );
                self.set_state(ConnectionState::Failed);
                return;
            }

            let delay = policy.delay_for_attempt(attempt);
            tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
            self.emit(ConnectionEvent::ReconnectScheduled { attempt, delay });
            tokio::time::sleep(delay).await;

            let Some(url) = lock(&self.inner.url).clone() else {
                return;
            };
            if !self.is_intent(intent)
                || !self.transition(ConnectionState::Reconnecting, |from| !from.is_opening())
            {
                tracing::debug!(attempt, "Reconnect superseded by an explicit connect");
                return;
            }
            metrics::record_reconnect_attempt();
            match self.open(&url, intent).await {
                Ok(()) => {
                    tracing::info!(attempt, "Reconnected");
                    return;
                }
                Err(_) if !self.is_intent(intent) => return,
                Err(e) if e.is_retryable() => {
                    tracing::warn!(attempt, error = %e, "Reconnect attempt failed");
                    self.emit_error(e, Severity::Warning);
                    self.set_state(ConnectionState::Error);
                }
                Err(e) => {
                    tracing::error!(attempt, error = %e, "Reconnect rejected");
                    self.emit_error(e, Severity::Critical);
                    self.set_state(ConnectionState::Failed);
                    return;
                }
            }
        }
    }

    async fn read_loop(&self, generation: u64, mut inbound: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = inbound.recv().await {
            if !self.is_current(generation) {
                tracing::debug!(generation, "Ignoring event from superseded link");
                return;
            }
            match event {
                TransportEvent::Text(text) => self.handle_inbound(&text),
                TransportEvent::Closed { code, reason } => {
                    self.link_lost(generation, code, &reason);
                    return;
                }
                TransportEvent::Error(message) => {
                    self.link_lost(generation, CLOSE_ABNORMAL, &message);
                    return;
                }
            }
        }
        self.link_lost(generation, CLOSE_ABNORMAL, "transport dropped");
    }

    fn link_lost(&self, generation: u64, code: u16, reason: &str) {
        {
            let mut slot = lock(&self.inner.link);
            if !slot.as_ref().is_some_and(|link| link.generation == generation) {
                return;
            }
            // We are running on this link's reader task, so no abort.
            slot.take();
        }
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.reject_pending(&SyncError::ConnectionClosed);

        if self.inner.manual_disconnect.load(Ordering::SeqCst) || code == CLOSE_NORMAL {
            tracing::info!(code, reason, "Connection closed");
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        let error = if is_auth_close_code(code) {
            SyncError::AuthenticationFailed(format!("server closed with {code}: {reason}"))
        } else {
            SyncError::ConnectionFailed(format!("connection lost ({code}): {reason}"))
        };
        tracing::warn!(code, reason, "Connection lost");
        let retryable = error.is_retryable();
        self.emit_error(
            error,
            if retryable { Severity::Info } else { Severity::Critical },
        );
        self.set_state(ConnectionState::Disconnected);
        if !retryable {
            self.set_state(ConnectionState::Failed);
        } else if self.inner.config.reconnect.enabled {
            self.schedule_reconnect();
        }
    }

    fn reject_pending(&self, error: &SyncError) {
        let acks: Vec<PendingAck> = lock(&self.inner.pending_acks).drain().map(|(_, a)| a).collect();
        let responses: Vec<PendingResponse> = lock(&self.inner.pending_responses)
            .drain()
            .map(|(_, r)| r)
            .collect();
        if !acks.is_empty() || !responses.is_empty() {
            tracing::debug!(
                acks = acks.len(),
                responses = responses.len(),
                "Rejecting pending requests"
            );
        }
        for ack in acks {
            let _ = ack.responder.send(Err(error.clone()));
        }
        for response in responses {
            let _ = response.responder.send(Err(error.clone()));
        }
    }

    fn ensure_connected(&self) -> SyncResult<()> {
        let state = self.state();
        if state == ConnectionState::Connected {
            Ok(())
        } else {
            Err(SyncError::NotConnected(state.to_string()))
        }
    }

    fn transmit(&self, text: String, label: &str) -> SyncResult<()> {
        let slot = lock(&self.inner.link);
        let link = slot
            .as_ref()
            .ok_or_else(|| SyncError::NotConnected(self.state().to_string()))?;
        if tracing::enabled!(tracing::Level::TRACE) {
            tracing::trace!(message_type = label, payload = %redact_text(&text), "Sending");
        }
        link.outbound
            .send(Frame::Text(text))
            .map_err(|_| SyncError::MessageSendFailed("transport closed".to_string()))?;
        metrics::record_ws_message("outbound", label);
        Ok(())
    }

    /// Send a protocol message.
    ///
    /// Fills in `id` and `timestamp` when absent. With `requires_ack` set,
    /// resolves once the peer acknowledges, or fails after the ACK timeout
    /// with the pending entry removed.
    ///
    /// # Errors
    ///
    /// [`SyncError::NotConnected`] immediately when not connected,
    /// [`SyncError::MessageSendFailed`] if a message with the same `id` is
    /// still awaiting its ACK, [`SyncError::Timeout`] when no ACK arrives,
    /// and [`SyncError::ConnectionClosed`] if the link drops first.
    pub async fn send(&self, mut message: Message) -> SyncResult<()> {
        self.ensure_connected()?;
        if message.id.is_empty() {
            message.id = Uuid::new_v4().to_string();
        }
        if message.timestamp == 0 {
            message.timestamp = current_timestamp();
        }
        let text = serde_json::to_string(&message)
            .map_err(|e| SyncError::MessageSendFailed(e.to_string()))?;

        if !message.requires_ack {
            return self.transmit(text, message.message_type.as_str());
        }

        let id = message.id.clone();
        let (tx, rx) = oneshot::channel();
        let deadline = Instant::now() + self.inner.config.ack_timeout();
        let ticket = self.inner.ack_tickets.fetch_add(1, Ordering::SeqCst);
        match lock(&self.inner.pending_acks).entry(id.clone()) {
            Entry::Occupied(_) => {
                return Err(SyncError::MessageSendFailed(format!(
                    "message {id} is already awaiting an ack"
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingAck {
                    responder: tx,
                    deadline,
                    ticket,
                });
            }
        }
        if let Err(e) = self.transmit(text, message.message_type.as_str()) {
            self.forget_ack(&id, ticket);
            return Err(e);
        }

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SyncError::ConnectionClosed),
            Err(_) => {
                self.forget_ack(&id, ticket);
                metrics::record_ack_timeout();
                tracing::warn!(message_id = %id, "No ACK before deadline");
                Err(SyncError::Timeout(format!(
                    "no ack for message {id} within {}ms",
                    self.inner.config.ack_timeout_ms
                )))
            }
        }
    }

    /// Drop the pending ACK for `id` if it still belongs to `ticket`.
    fn forget_ack(&self, id: &str, ticket: u64) {
        let mut pending = lock(&self.inner.pending_acks);
        if pending.get(id).is_some_and(|ack| ack.ticket == ticket) {
            pending.remove(id);
        }
    }

    /// Send a request and wait for the correlated reply.
    ///
    /// A fresh `request_id` is written into `data`; the first inbound
    /// message of `expected` type whose `data.request_id` matches resolves
    /// the call with that message's `data`.
    ///
    /// # Errors
    ///
    /// Any [`send`](Self::send) error, or [`SyncError::Timeout`].
    pub async fn send_and_await_response(
        &self,
        mut message: Message,
        expected: MessageType,
        timeout: Duration,
    ) -> SyncResult<Value> {
        self.ensure_connected()?;
        let request_id = Uuid::new_v4().to_string();
        match &mut message.data {
            Value::Object(map) => {
                map.insert("request_id".to_string(), Value::String(request_id.clone()));
            }
            other => {
                *other = serde_json::json!({ "request_id": request_id });
            }
        }

        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending_responses).insert(
            request_id.clone(),
            PendingResponse {
                expected,
                responder: tx,
            },
        );
        if let Err(e) = self.send(message).await {
            lock(&self.inner.pending_responses).remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SyncError::ConnectionClosed),
            Err(_) => {
                lock(&self.inner.pending_responses).remove(&request_id);
                Err(SyncError::Timeout(format!(
                    "no {expected} for request {request_id} within {}ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    /// Send a domain message, chunking it when oversized.
    ///
    /// Chunks of one message go out back to back under a send lock, with a
    /// short pause between them.
    ///
    /// # Errors
    ///
    /// [`SyncError::Validation`] for a structurally invalid message,
    /// [`SyncError::NotConnected`], or a transport failure.
    pub async fn send_domain(&self, message: DomainMessage) -> SyncResult<()> {
        self.ensure_connected()?;
        message
            .validate()
            .map_err(|e| SyncError::Validation(e.to_string()))?;

        let chunks = {
            let chunker = lock(&self.inner.chunker);
            if chunker.needs_chunking(&message)? {
                Some((chunker.chunk(&message)?, chunker.send_delay()))
            } else {
                None
            }
        };

        let Some((chunks, delay)) = chunks else {
            let text = serde_json::to_string(&message)
                .map_err(|e| SyncError::MessageSendFailed(e.to_string()))?;
            return self.transmit(text, message.message_type());
        };

        let _guard = self.inner.chunk_send.lock().await;
        let total = chunks.len();
        tracing::debug!(total, message_type = message.message_type(), "Sending chunked message");
        for (index, chunk) in chunks.into_iter().enumerate() {
            let text = serde_json::to_string(&DomainMessage::ChunkedMessage(chunk))
                .map_err(|e| SyncError::MessageSendFailed(e.to_string()))?;
            self.transmit(text, crate::chunker::CHUNKED_MESSAGE_TYPE)?;
            if index + 1 < total && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        metrics::record_chunks_sent(total);
        Ok(())
    }

    fn handle_inbound(&self, text: &str) {
        self.refresh_token();

        if let Err(e) = validate_message_size(text.len()) {
            self.reject_inbound(SyncError::Validation(e.to_string()), "oversized", text);
            return;
        }
        let decoded = match InboundMessage::decode(text) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.reject_inbound(e, "parse", text);
                return;
            }
        };
        match decoded {
            InboundMessage::Protocol(message) => {
                if let Err(e) = message.validate() {
                    self.reject_inbound(SyncError::Validation(e.to_string()), "validation", text);
                    return;
                }
                self.dispatch_protocol(message);
            }
            InboundMessage::Domain(DomainMessage::ChunkedMessage(chunk)) => {
                metrics::record_ws_message("inbound", crate::chunker::CHUNKED_MESSAGE_TYPE);
                let processed = lock(&self.inner.chunker).process_chunk(chunk);
                match processed {
                    Ok(Some(message)) => {
                        metrics::record_chunk_set("reassembled");
                        self.dispatch_domain(message);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        metrics::record_chunk_set("discarded");
                        self.emit_error(SyncError::Chunk(e), Severity::Warning);
                    }
                }
            }
            InboundMessage::Domain(message) => {
                metrics::record_ws_message("inbound", message.message_type());
                self.dispatch_domain(message);
            }
        }
    }

    fn reject_inbound(&self, error: SyncError, reason: &'static str, text: &str) {
        tracing::warn!(error = %error, payload = %redact_text(text), "Dropping inbound message");
        metrics::record_inbound_rejected(reason);
        self.emit_error(error, Severity::Warning);
    }

    fn dispatch_protocol(&self, message: Message) {
        metrics::record_ws_message("inbound", message.message_type.as_str());
        tracing::trace!(id = %message.id, message_type = %message.message_type, "Received");

        if message.requires_ack && message.message_type != MessageType::Ack {
            self.reply(Message::ack(&message.id));
        }

        match message.message_type {
            MessageType::Ack => self.resolve_ack(&message),
            MessageType::Ping => {
                let mut pong = Message::new(MessageType::Pong, message.data.clone());
                pong.session_id.clone_from(&message.session_id);
                self.reply(pong);
            }
            _ => {}
        }
        self.resolve_response(&message);

        let _ = self.inner.messages.send(message.clone());
        let mut subscribers = lock(&self.inner.type_subscribers);
        if let Some(list) = subscribers.get_mut(&message.message_type) {
            list.retain(|tx| tx.send(message.clone()).is_ok());
        }
    }

    fn reply(&self, mut message: Message) {
        message.id = Uuid::new_v4().to_string();
        message.timestamp = current_timestamp();
        let label = message.message_type.as_str();
        match serde_json::to_string(&message) {
            Ok(text) => {
                if let Err(e) = self.transmit(text, label) {
                    tracing::debug!(error = %e, message_type = label, "Could not send automatic reply");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Could not encode automatic reply"),
        }
    }

    fn resolve_ack(&self, message: &Message) {
        let Some(acked) = message.data_str("message_id") else {
            return;
        };
        match lock(&self.inner.pending_acks).remove(acked) {
            Some(pending) => {
                let remaining = pending.deadline.saturating_duration_since(Instant::now());
                tracing::trace!(message_id = acked, remaining_ms = remaining.as_millis() as u64, "ACK received");
                let _ = pending.responder.send(Ok(()));
            }
            None => tracing::debug!(message_id = acked, "ACK for unknown or expired message"),
        }
    }

    fn resolve_response(&self, message: &Message) {
        let Some(request_id) = message.data_str("request_id") else {
            return;
        };
        let mut pending = lock(&self.inner.pending_responses);
        if pending
            .get(request_id)
            .is_some_and(|p| p.expected == message.message_type)
        {
            if let Some(waiter) = pending.remove(request_id) {
                let _ = waiter.responder.send(Ok(message.data.clone()));
            }
        }
    }

    fn dispatch_domain(&self, message: DomainMessage) {
        if let Err(e) = message.validate() {
            tracing::warn!(
                message_type = message.message_type(),
                error = %e,
                "Dropping invalid domain message"
            );
            metrics::record_inbound_rejected("validation");
            self.emit_error(SyncError::Validation(e.to_string()), Severity::Warning);
            return;
        }
        tracing::debug!(message_type = message.message_type(), "Dispatching domain message");
        let _ = self.inner.domain.send(message);
    }

    fn refresh_token(&self) {
        let Some(provider) = self.inner.token_provider.clone() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = provider.refresh().await {
                tracing::warn!(error = %e, "Token refresh failed");
            }
        });
    }
}
