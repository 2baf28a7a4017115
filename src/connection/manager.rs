//! Connection manager actor
//!
//! # Lifecycle
//!
//! 1. `connect()` - open the transport, ping, wait for the first pong
//! 2. `send()` / `request()` - written at once while CONNECTED, queued otherwise
//! 3. Link lost - in-flight requests fail, the queue is kept, reconnect with backoff
//! 4. `disconnect()` - close the link, cancel everything outstanding; reusable
//! 5. `dispose()` (or dropping the last handle) - the same, then stop the actor

use futures_util::StreamExt;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::time::{delay_queue, DelayQueue};
use uuid::Uuid;

use super::backoff::ReconnectPolicy;
use super::envelope::{Envelope, InboundFrame, ResponseEnvelope};
use super::state::{reduce, ConnectionState, LinkEffect, LinkEvent};
use super::transport::{Link, Transport, TransportError, TransportEvent};
use super::ConnectionError;
use crate::config::{ConnectionConfig, CONNECTION_COLLABORATOR};
use crate::resilience::{EnhancedError, ErrorContext, ErrorHandler, RawError, RecoveryStrategy};

/// Callback for unsolicited inbound messages
pub type EventHandler = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Returned by [`ConnectionManager::add_event_listener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Options for [`ConnectionManager::send_with`]
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    /// Attach a correlation ID and wait for the matching response
    pub correlated: bool,
    /// Overrides the configured message timeout
    pub timeout: Option<Duration>,
}

impl SendOptions {
    pub fn correlated() -> Self {
        Self {
            correlated: true,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Diagnostics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub state: ConnectionState,
    pub pending_requests: usize,
    pub queued_messages: usize,
    pub reconnect_attempts: u32,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub last_round_trip_ms: Option<u64>,
}

// ============================================================================
// Listener registry
// ============================================================================

#[derive(Default)]
struct ListenerRegistry {
    next_id: AtomicU64,
    entries: Mutex<Vec<(ListenerId, String, EventHandler)>>,
}

impl ListenerRegistry {
    fn add(&self, action: String, handler: EventHandler) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, action, handler));
        id
    }

    fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = entries.len();
        entries.retain(|(entry_id, _, _)| *entry_id != id);
        entries.len() != before
    }

    /// Deliver to every handler for the action, in registration order.
    /// A panicking handler is logged and skipped.
    fn dispatch(&self, envelope: &Envelope) -> usize {
        let handlers: Vec<EventHandler> = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|(_, action, _)| *action == envelope.action)
            .map(|(_, _, handler)| handler.clone())
            .collect();

        for handler in &handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(envelope))).is_err() {
                log::error!(
                    "ConnectionManager: listener for '{}' panicked",
                    envelope.action
                );
            }
        }
        handlers.len()
    }
}

// ============================================================================
// Handle
// ============================================================================

enum Command {
    Connect(oneshot::Sender<Result<(), ConnectionError>>),
    Send {
        envelope: Envelope,
        done: oneshot::Sender<Result<(), ConnectionError>>,
    },
    Request {
        envelope: Envelope,
        timeout: Duration,
        reply: oneshot::Sender<Result<ResponseEnvelope, ConnectionError>>,
    },
    Disconnect(oneshot::Sender<()>),
    Stats(oneshot::Sender<ConnectionStats>),
}

struct Shared {
    commands: mpsc::UnboundedSender<Command>,
    listeners: Arc<ListenerRegistry>,
    status: watch::Receiver<ConnectionState>,
    shutdown: CancellationToken,
    actor: Mutex<Option<JoinHandle<()>>>,
    message_timeout: Duration,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Handle to one logical connection
///
/// Cheap to clone. The actor behind it stops when [`dispose`](Self::dispose)
/// is called or the last handle is dropped.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Spawn the connection actor; must be called inside a tokio runtime
    pub fn new(
        url: impl Into<String>,
        config: &ConnectionConfig,
        transport: Arc<dyn Transport>,
        errors: Arc<ErrorHandler>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionState::Disconnected);
        let listeners = Arc::new(ListenerRegistry::default());
        let shutdown = CancellationToken::new();

        let actor = Actor {
            url: url.into(),
            transport,
            errors,
            listeners: listeners.clone(),
            status: status_tx,
            commands: commands_rx,
            shutdown: shutdown.clone(),
            policy: ReconnectPolicy::from_config(config),
            heartbeat_every: config.heartbeat_interval().max(Duration::from_millis(1)),
            ready_timeout: config.connect_timeout(),
            max_queue: config.max_queue_size.max(1),
            state: ConnectionState::Disconnected,
            attempts: 0,
            opening: None,
            link: None,
            reconnect_at: None,
            heartbeat: None,
            pong_deadline: None,
            ping_sent_at: None,
            queue: VecDeque::new(),
            pending: HashMap::new(),
            timeouts: DelayQueue::new(),
            connect_waiters: Vec::new(),
            last_failure: String::new(),
            fatal: None,
            counters: Counters::default(),
        };
        let handle = tokio::spawn(actor.run());

        Self {
            shared: Arc::new(Shared {
                commands: commands_tx,
                listeners,
                status: status_rx,
                shutdown,
                actor: Mutex::new(Some(handle)),
                message_timeout: config.message_timeout(),
            }),
        }
    }

    fn command(&self, command: Command) -> Result<(), ConnectionError> {
        self.shared
            .commands
            .send(command)
            .map_err(|_| ConnectionError::Closed)
    }

    /// Resolves once the remote has answered the first heartbeat
    ///
    /// Fails with [`ConnectionError::Unavailable`] when the reconnect budget is
    /// used up, or [`ConnectionError::Cancelled`] on `disconnect()`.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Connect(tx))?;
        rx.await.map_err(|_| ConnectionError::Closed)?
    }

    /// Fire-and-forget send; queued while not connected
    pub async fn send(&self, envelope: Envelope) -> Result<(), ConnectionError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Send { envelope, done: tx })?;
        rx.await.map_err(|_| ConnectionError::Closed)?
    }

    /// Correlated send; resolves with the response carrying the same `requestId`
    ///
    /// Rejects exactly once on timeout, link loss or disconnect. A response
    /// arriving after that is ignored.
    pub async fn request(
        &self,
        envelope: Envelope,
        options: SendOptions,
    ) -> Result<ResponseEnvelope, ConnectionError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Request {
            envelope,
            timeout: options.timeout.unwrap_or(self.shared.message_timeout),
            reply: tx,
        })?;
        rx.await.map_err(|_| ConnectionError::Closed)?
    }

    /// `send` or `request` depending on `options.correlated`
    pub async fn send_with(
        &self,
        envelope: Envelope,
        options: SendOptions,
    ) -> Result<Option<ResponseEnvelope>, ConnectionError> {
        if options.correlated {
            self.request(envelope, options).await.map(Some)
        } else {
            self.send(envelope).await.map(|_| None)
        }
    }

    /// Close the link and cancel everything outstanding; `connect()` may be
    /// called again afterwards
    pub async fn disconnect(&self) {
        let (tx, rx) = oneshot::channel();
        if self.command(Command::Disconnect(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Disconnect and stop the actor; returns once it has exited
    pub async fn dispose(&self) {
        self.shared.shutdown.cancel();
        let handle = self
            .shared
            .actor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::warn!("ConnectionManager: actor ended abnormally: {}", e);
            }
        }
    }

    pub fn add_event_listener<F>(&self, action: impl Into<String>, handler: F) -> ListenerId
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.shared.listeners.add(action.into(), Arc::new(handler))
    }

    pub fn remove_event_listener(&self, id: ListenerId) -> bool {
        self.shared.listeners.remove(id)
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionState> {
        self.shared.status.clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.status.borrow()
    }

    pub async fn stats(&self) -> ConnectionStats {
        let (tx, rx) = oneshot::channel();
        if self.command(Command::Stats(tx)).is_err() {
            return ConnectionStats {
                state: self.state(),
                ..Default::default()
            };
        }
        rx.await.unwrap_or_else(|_| ConnectionStats {
            state: self.state(),
            ..Default::default()
        })
    }
}

// ============================================================================
// Actor
// ============================================================================

struct Queued {
    frame: String,
    action: String,
    request_id: Option<String>,
}

struct Pending {
    reply: oneshot::Sender<Result<ResponseEnvelope, ConnectionError>>,
    timeout_key: delay_queue::Key,
    timeout: Duration,
    /// Written to the current link (not just queued)
    written: bool,
}

#[derive(Default)]
struct Counters {
    sent: u64,
    received: u64,
    dropped: u64,
    last_round_trip_ms: Option<u64>,
}

enum Wake {
    Shutdown,
    Command(Command),
    Opened(Result<Link, TransportError>),
    Link(TransportEvent),
    RequestExpired(String),
    PongOverdue,
    RetryDue,
    Heartbeat,
}

struct Actor {
    url: String,
    transport: Arc<dyn Transport>,
    errors: Arc<ErrorHandler>,
    listeners: Arc<ListenerRegistry>,
    status: watch::Sender<ConnectionState>,
    commands: mpsc::UnboundedReceiver<Command>,
    shutdown: CancellationToken,
    policy: ReconnectPolicy,
    heartbeat_every: Duration,
    ready_timeout: Duration,
    max_queue: usize,

    state: ConnectionState,
    attempts: u32,
    opening: Option<JoinHandle<Result<Link, TransportError>>>,
    link: Option<Link>,
    reconnect_at: Option<Instant>,
    heartbeat: Option<Interval>,
    /// Set by the first unanswered ping
    pong_deadline: Option<Instant>,
    ping_sent_at: Option<Instant>,
    queue: VecDeque<Queued>,
    pending: HashMap<String, Pending>,
    timeouts: DelayQueue<String>,
    connect_waiters: Vec<oneshot::Sender<Result<(), ConnectionError>>>,
    last_failure: String,
    fatal: Option<EnhancedError>,
    counters: Counters,
}

async fn join_opening(
    opening: &mut Option<JoinHandle<Result<Link, TransportError>>>,
) -> Result<Link, TransportError> {
    match opening.as_mut() {
        Some(handle) => match handle.await {
            Ok(result) => result,
            Err(e) => Err(TransportError::Failed(e.to_string())),
        },
        None => std::future::pending().await,
    }
}

async fn recv_link(link: &mut Option<Link>) -> TransportEvent {
    match link.as_mut() {
        Some(link) => link.recv().await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval.as_mut() {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Actor {
    async fn run(mut self) {
        log::debug!("ConnectionManager: actor started for {}", self.url);

        loop {
            let wake = tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => Wake::Shutdown,
                command = self.commands.recv() => match command {
                    Some(command) => Wake::Command(command),
                    None => Wake::Shutdown,
                },
                opened = join_opening(&mut self.opening) => Wake::Opened(opened),
                event = recv_link(&mut self.link) => Wake::Link(event),
                Some(expired) = self.timeouts.next(), if !self.timeouts.is_empty() => {
                    Wake::RequestExpired(expired.into_inner())
                }
                _ = sleep_until(self.pong_deadline) => Wake::PongOverdue,
                _ = sleep_until(self.reconnect_at) => Wake::RetryDue,
                _ = tick(&mut self.heartbeat) => Wake::Heartbeat,
            };

            match wake {
                Wake::Shutdown => {
                    self.apply(LinkEvent::DisconnectRequested);
                    break;
                }
                Wake::Command(command) => self.on_command(command),
                Wake::Opened(result) => self.on_opened(result),
                Wake::Link(TransportEvent::Frame(text)) => self.on_frame(&text),
                Wake::Link(TransportEvent::Closed(reason)) => {
                    let reason = reason.unwrap_or_else(|| "closed without reason".to_string());
                    let raw = RawError::with_code(
                        "TRANSPORT_CLOSED",
                        format!("link closed: {}", reason),
                    );
                    self.on_link_failure(raw);
                }
                Wake::RequestExpired(request_id) => self.on_request_expired(request_id),
                Wake::PongOverdue => {
                    self.pong_deadline = None;
                    let raw = RawError::with_code("HEARTBEAT_TIMEOUT", "no pong received in time");
                    self.on_link_failure(raw);
                }
                Wake::RetryDue => {
                    self.reconnect_at = None;
                    self.apply(LinkEvent::RetryDue);
                }
                Wake::Heartbeat => self.send_ping(self.heartbeat_every * 2),
            }
        }

        log::debug!("ConnectionManager: actor stopped for {}", self.url);
    }

    fn apply(&mut self, event: LinkEvent) {
        let previous = self.state;
        let (next, effects) = reduce(previous, event.clone());
        if next != previous {
            log::info!("ConnectionManager: {} -> {} ({:?})", previous, next, event);
        }
        self.state = next;
        for effect in effects {
            self.run_effect(effect);
        }
    }

    fn run_effect(&mut self, effect: LinkEffect) {
        match effect {
            LinkEffect::OpenTransport => {
                if self.attempts > 0 {
                    log::info!(
                        "ConnectionManager: reconnect attempt {}/{}",
                        self.attempts,
                        self.policy.max_attempts()
                    );
                }
                self.opening = Some(tokio::spawn(self.transport.open(&self.url)));
            }
            LinkEffect::CloseTransport => {
                if let Some(opening) = self.opening.take() {
                    opening.abort();
                }
                self.link = None;
                self.pong_deadline = None;
                self.ping_sent_at = None;
            }
            LinkEffect::AwaitReady => self.send_ping(self.ready_timeout),
            LinkEffect::ScheduleReconnect => {
                self.attempts += 1;
                let delay = self.policy.delay_for(self.attempts);
                log::warn!(
                    "ConnectionManager: reconnecting in {:?} (attempt {}/{})",
                    delay,
                    self.attempts,
                    self.policy.max_attempts()
                );
                self.reconnect_at = Some(Instant::now() + delay);
            }
            LinkEffect::CancelReconnect => self.reconnect_at = None,
            LinkEffect::StartHeartbeat => {
                let mut interval =
                    tokio::time::interval_at(Instant::now() + self.heartbeat_every, self.heartbeat_every);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.heartbeat = Some(interval);
            }
            LinkEffect::StopHeartbeat => {
                self.heartbeat = None;
                self.pong_deadline = None;
                self.ping_sent_at = None;
            }
            LinkEffect::ResetAttempts => self.attempts = 0,
            LinkEffect::FlushQueue => self.flush_queue(),
            LinkEffect::ResolveConnectWaiters => {
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
            }
            LinkEffect::RejectConnectWaiters => {
                let waiters: Vec<_> = self.connect_waiters.drain(..).collect();
                for waiter in waiters {
                    let _ = waiter.send(Err(self.rejection()));
                }
            }
            LinkEffect::FailInFlight => {
                let written: Vec<String> = self
                    .pending
                    .iter()
                    .filter(|(_, p)| p.written)
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in written {
                    if let Some(pending) = self.take_pending(&id) {
                        let _ = pending.reply.send(Err(self.rejection()));
                    }
                }
            }
            LinkEffect::FailAll => {
                let pending: Vec<Pending> = self.pending.drain().map(|(_, p)| p).collect();
                self.timeouts.clear();
                if !pending.is_empty() || !self.queue.is_empty() {
                    log::info!(
                        "ConnectionManager: rejecting {} pending request(s), discarding {} queued message(s)",
                        pending.len(),
                        self.queue.len()
                    );
                }
                self.queue.clear();
                for p in pending {
                    let _ = p.reply.send(Err(self.rejection()));
                }
            }
            LinkEffect::ReportFatal => {
                let raw = RawError::with_code(
                    "RECONNECT_EXHAUSTED",
                    format!(
                        "gave up after {} reconnect attempts: {}",
                        self.attempts, self.last_failure
                    ),
                );
                let error = self
                    .errors
                    .report(&raw, CONNECTION_COLLABORATOR, &self.context());
                self.errors.surface(&error);
                self.fatal = Some(error);
            }
            LinkEffect::EmitStatus => {
                self.status.send_replace(self.state);
            }
        }
    }

    /// Error for requests and waiters cut off in the current state
    ///
    /// In ERROR this is the failure that ended the connection.
    fn rejection(&self) -> ConnectionError {
        match (self.state, &self.fatal) {
            (ConnectionState::Error, Some(fatal)) => {
                ConnectionError::Unavailable(Box::new(fatal.clone()))
            }
            (ConnectionState::Disconnected, _) => ConnectionError::Cancelled,
            _ => ConnectionError::Disconnected(self.last_failure.clone()),
        }
    }

    fn context(&self) -> ErrorContext {
        let mut context = ErrorContext::new();
        context.insert("url".to_string(), self.url.clone().into());
        context.insert("state".to_string(), self.state.as_str().into());
        context.insert("attempt".to_string(), self.attempts.into());
        context
    }

    fn take_pending(&mut self, request_id: &str) -> Option<Pending> {
        let pending = self.pending.remove(request_id)?;
        self.timeouts.remove(&pending.timeout_key);
        Some(pending)
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect(reply) => match self.state {
                ConnectionState::Connected => {
                    let _ = reply.send(Ok(()));
                }
                ConnectionState::Disconnected | ConnectionState::Error => {
                    self.connect_waiters.push(reply);
                    self.fatal = None;
                    self.apply(LinkEvent::ConnectRequested);
                }
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    self.connect_waiters.push(reply);
                }
            },
            Command::Send { envelope, done } => {
                if self.state == ConnectionState::Error {
                    let _ = done.send(Err(self.rejection()));
                    return;
                }
                let frame = match serde_json::to_string(&envelope) {
                    Ok(frame) => frame,
                    Err(e) => {
                        let _ = done.send(Err(ConnectionError::Serialization(e.to_string())));
                        return;
                    }
                };
                self.dispatch(Queued {
                    frame,
                    action: envelope.action,
                    request_id: None,
                });
                let _ = done.send(Ok(()));
            }
            Command::Request {
                mut envelope,
                timeout,
                reply,
            } => {
                if self.state == ConnectionState::Error {
                    let _ = reply.send(Err(self.rejection()));
                    return;
                }
                let request_id = Uuid::new_v4().to_string();
                envelope.request_id = Some(request_id.clone());
                let frame = match serde_json::to_string(&envelope) {
                    Ok(frame) => frame,
                    Err(e) => {
                        let _ = reply.send(Err(ConnectionError::Serialization(e.to_string())));
                        return;
                    }
                };

                let timeout_key = self.timeouts.insert(request_id.clone(), timeout);
                self.pending.insert(
                    request_id.clone(),
                    Pending {
                        reply,
                        timeout_key,
                        timeout,
                        written: false,
                    },
                );
                self.dispatch(Queued {
                    frame,
                    action: envelope.action,
                    request_id: Some(request_id),
                });
            }
            Command::Disconnect(done) => {
                log::info!("ConnectionManager: disconnect requested");
                self.apply(LinkEvent::DisconnectRequested);
                let _ = done.send(());
            }
            Command::Stats(reply) => {
                let _ = reply.send(ConnectionStats {
                    state: self.state,
                    pending_requests: self.pending.len(),
                    queued_messages: self.queue.len(),
                    reconnect_attempts: self.attempts,
                    messages_sent: self.counters.sent,
                    messages_received: self.counters.received,
                    messages_dropped: self.counters.dropped,
                    last_round_trip_ms: self.counters.last_round_trip_ms,
                });
            }
        }
    }

    /// Write now if connected, otherwise queue
    fn dispatch(&mut self, item: Queued) {
        let writable = !self.state.queues_outbound()
            && self.link.as_ref().is_some_and(|link| !link.is_closed());
        if writable {
            self.write(item);
        } else {
            self.enqueue(item);
        }
    }

    fn write(&mut self, item: Queued) {
        let Some(link) = self.link.as_ref() else {
            self.enqueue(item);
            return;
        };
        if let Err(e) = link.send(item.frame) {
            log::warn!("ConnectionManager: dropped '{}' message: {}", item.action, e);
            self.counters.dropped += 1;
            return;
        }
        self.counters.sent += 1;
        if let Some(pending) = item
            .request_id
            .as_ref()
            .and_then(|id| self.pending.get_mut(id))
        {
            pending.written = true;
        }
    }

    /// Append to the bounded queue, evicting the oldest entry when full
    fn enqueue(&mut self, item: Queued) {
        while self.queue.len() >= self.max_queue {
            let Some(dropped) = self.queue.pop_front() else {
                break;
            };
            self.counters.dropped += 1;

            let error = ConnectionError::QueueOverflow {
                action: dropped.action.clone(),
            };
            let mut context = self.context();
            context.insert("action".to_string(), dropped.action.clone().into());
            context.insert("maxQueueSize".to_string(), self.max_queue.into());
            self.errors
                .record_warning(&RawError::from(&error), CONNECTION_COLLABORATOR, &context);

            if let Some(pending) = dropped
                .request_id
                .as_deref()
                .and_then(|id| self.take_pending(id))
            {
                let _ = pending.reply.send(Err(error));
            }
        }
        self.queue.push_back(item);
    }

    fn flush_queue(&mut self) {
        if !self.queue.is_empty() {
            log::info!(
                "ConnectionManager: flushing {} queued message(s)",
                self.queue.len()
            );
        }
        while let Some(item) = self.queue.pop_front() {
            if self.link.as_ref().map_or(true, |link| link.is_closed()) {
                self.queue.push_front(item);
                break;
            }
            self.write(item);
        }
    }

    // ------------------------------------------------------------------
    // Link
    // ------------------------------------------------------------------

    fn on_opened(&mut self, result: Result<Link, TransportError>) {
        self.opening = None;
        if !matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Reconnecting
        ) {
            return;
        }
        match result {
            Ok(link) => {
                self.link = Some(link);
                self.apply(LinkEvent::TransportOpened);
            }
            Err(e) => self.on_link_failure(RawError::from(&e)),
        }
    }

    fn on_link_failure(&mut self, raw: RawError) {
        if !matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Reconnecting
        ) {
            return;
        }
        // Reconnect backoff paces the retries here, not the breaker
        let (error, plan) = self
            .errors
            .handle_paced(&raw, CONNECTION_COLLABORATOR, &self.context());
        self.last_failure = error.raw_message().to_string();

        if matches!(
            plan.strategy,
            RecoveryStrategy::None | RecoveryStrategy::ManualIntervention
        ) {
            log::error!(
                "ConnectionManager: {} ({}), not reconnecting",
                error.code(),
                error.category()
            );
            // Already surfaced by the handler
            self.fatal = Some(error);
            self.apply(LinkEvent::LinkRejected);
            return;
        }

        let exhausted = self.attempts >= self.policy.max_attempts();
        self.apply(LinkEvent::LinkFailed { exhausted });
    }

    fn send_ping(&mut self, answer_within: Duration) {
        let Some(link) = self.link.as_ref() else {
            return;
        };
        match serde_json::to_string(&Envelope::ping()) {
            Ok(frame) => {
                if let Err(e) = link.send(frame) {
                    log::debug!("ConnectionManager: ping not sent: {}", e);
                }
            }
            Err(e) => log::warn!("ConnectionManager: failed to encode ping: {}", e),
        }
        let now = Instant::now();
        self.pong_deadline.get_or_insert(now + answer_within);
        self.ping_sent_at.get_or_insert(now);
    }

    fn on_frame(&mut self, text: &str) {
        self.counters.received += 1;

        let frame = match InboundFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                let raw = RawError::with_code("INVALID_FRAME", e.to_string());
                self.errors.handle(&raw, CONNECTION_COLLABORATOR, &self.context());
                return;
            }
        };

        if frame.is_pong() {
            self.on_pong();
            return;
        }

        match frame {
            InboundFrame::Response(response) => {
                let pending = response
                    .request_id
                    .as_deref()
                    .and_then(|id| self.take_pending(id));
                match pending {
                    Some(pending) => {
                        let _ = pending.reply.send(Ok(response));
                    }
                    None => log::debug!(
                        "ConnectionManager: ignoring response to unknown or expired request {:?}",
                        response.request_id
                    ),
                }
            }
            InboundFrame::Event(envelope) => {
                if self.listeners.dispatch(&envelope) == 0 {
                    log::debug!(
                        "ConnectionManager: no listener for '{}'",
                        envelope.action
                    );
                }
            }
        }
    }

    fn on_pong(&mut self) {
        if let Some(sent_at) = self.ping_sent_at.take() {
            self.counters.last_round_trip_ms = Some(sent_at.elapsed().as_millis() as u64);
        }
        self.pong_deadline = None;

        let awaiting_ready = matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Reconnecting
        ) && self.link.is_some();
        if awaiting_ready {
            self.errors.record_success(CONNECTION_COLLABORATOR);
            self.apply(LinkEvent::ReadyAcknowledged);
        }
    }

    fn on_request_expired(&mut self, request_id: String) {
        // The DelayQueue entry is already gone
        let Some(pending) = self.pending.remove(&request_id) else {
            return;
        };
        self.queue
            .retain(|item| item.request_id.as_deref() != Some(request_id.as_str()));
        log::warn!(
            "ConnectionManager: request {} timed out after {:?}",
            request_id,
            pending.timeout
        );
        let _ = pending.reply.send(Err(ConnectionError::Timeout {
            request_id,
            after: pending.timeout,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_listeners_dispatch_in_registration_order() {
        let registry = ListenerRegistry::default();
        let calls = Arc::new(Mutex::new(Vec::new()));

        for n in 0..3 {
            let calls = calls.clone();
            registry.add(
                "translation".to_string(),
                Arc::new(move |_: &Envelope| calls.lock().unwrap().push(n)),
            );
        }
        registry.add("other".to_string(), Arc::new(|_: &Envelope| panic!("wrong action")));

        assert_eq!(registry.dispatch(&Envelope::new("translation")), 3);
        assert_eq!(*calls.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_panicking_listener_does_not_stop_delivery() {
        let registry = ListenerRegistry::default();
        let delivered = Arc::new(AtomicUsize::new(0));

        registry.add("translation".to_string(), Arc::new(|_: &Envelope| panic!("boom")));
        let d = delivered.clone();
        registry.add(
            "translation".to_string(),
            Arc::new(move |_: &Envelope| {
                d.fetch_add(1, Ordering::SeqCst);
            }),
        );

        registry.dispatch(&Envelope::new("translation"));
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_listener() {
        let registry = ListenerRegistry::default();
        let id = registry.add("translation".to_string(), Arc::new(|_: &Envelope| {}));
        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert_eq!(registry.dispatch(&Envelope::new("translation")), 0);
    }

    #[test]
    fn test_send_options() {
        let options = SendOptions::correlated().with_timeout(Duration::from_millis(250));
        assert!(options.correlated);
        assert_eq!(options.timeout, Some(Duration::from_millis(250)));
        assert!(!SendOptions::default().correlated);
    }
}
