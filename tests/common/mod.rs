//! In-memory gateway for integration tests
#![allow(dead_code)]

use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use voxbridge::config::{BufferConfig, ConnectionConfig, TransportConfig};
use voxbridge::connection::{Link, Transport, TransportError, TransportEvent};
use voxbridge::{ConnectionManager, ConnectionState, TransportContext};

/// Fast timings for paused-clock tests
///
/// Reconnect delays are 100ms, 200ms, 400ms; the heartbeat pings every second.
pub fn test_config() -> TransportConfig {
    TransportConfig {
        url: "mock://gateway".to_string(),
        connection: ConnectionConfig {
            max_reconnect_attempts: 3,
            reconnect_interval_ms: 100,
            max_reconnect_interval_ms: 400,
            backoff_multiplier: 2.0,
            heartbeat_interval_ms: 1_000,
            message_timeout_ms: 500,
            max_queue_size: 5,
            connect_timeout_ms: 500,
        },
        buffer: BufferConfig {
            max_buffer_size: 10,
            batch_size: 3,
            flush_interval_ms: 1_000,
            max_chunk_age_ms: 5_000,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// The gateway's side of one link
pub struct ServerEnd {
    frames: mpsc::UnboundedReceiver<String>,
    events: mpsc::Sender<TransportEvent>,
}

impl ServerEnd {
    /// Next frame from the client, or None once it dropped the link
    pub async fn recv(&mut self) -> Option<Value> {
        let frame = self.frames.recv().await?;
        Some(serde_json::from_str(&frame).expect("client sent invalid JSON"))
    }

    /// Next non-ping frame, answering pings on the way
    pub async fn recv_message(&mut self) -> Option<Value> {
        loop {
            let frame = self.recv().await?;
            if frame["action"] == "ping" {
                self.pong().await;
                continue;
            }
            return Some(frame);
        }
    }

    pub async fn push(&self, frame: Value) {
        self.push_raw(&frame.to_string()).await;
    }

    pub async fn push_raw(&self, text: &str) {
        let _ = self
            .events
            .send(TransportEvent::Frame(text.to_string()))
            .await;
    }

    pub async fn pong(&self) {
        self.push(json!({"action": "pong", "data": {}})).await;
    }

    pub async fn respond(&self, request: &Value, data: Value) {
        self.push(json!({
            "success": true,
            "action": request["action"],
            "data": data,
            "requestId": request["requestId"],
        }))
        .await;
    }

    pub async fn push_event(&self, action: &str, data: Value) {
        self.push(json!({"action": action, "data": data})).await;
    }

    pub async fn close(&self, reason: &str) {
        let _ = self
            .events
            .send(TransportEvent::Closed(Some(reason.to_string())))
            .await;
    }
}

pub struct MockTransport {
    links: mpsc::UnboundedSender<ServerEnd>,
    failures: Mutex<VecDeque<TransportError>>,
    refuse_all: AtomicBool,
    opened: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (links, accepted) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            links,
            failures: Mutex::new(VecDeque::new()),
            refuse_all: AtomicBool::new(false),
            opened: AtomicUsize::new(0),
        });
        (transport, accepted)
    }

    /// Fail the next open with `error`
    pub fn fail_next(&self, error: TransportError) {
        self.failures.lock().unwrap().push_back(error);
    }

    pub fn refuse_all(&self, refuse: bool) {
        self.refuse_all.store(refuse, Ordering::SeqCst);
    }

    /// Number of open attempts so far
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    fn open(&self, _url: &str) -> BoxFuture<'static, Result<Link, TransportError>> {
        self.opened.fetch_add(1, Ordering::SeqCst);

        let failure = if self.refuse_all.load(Ordering::SeqCst) {
            Some(TransportError::Refused("mock gateway refused".to_string()))
        } else {
            self.failures.lock().unwrap().pop_front()
        };
        if let Some(error) = failure {
            return Box::pin(async move { Err(error) });
        }

        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::channel(64);
        let _ = self.links.send(ServerEnd {
            frames: server_rx,
            events: server_tx,
        });
        Box::pin(async move { Ok(Link::new(client_tx, client_rx)) })
    }
}

pub struct Harness {
    pub context: TransportContext,
    pub transport: Arc<MockTransport>,
    pub links: mpsc::UnboundedReceiver<ServerEnd>,
    pub manager: ConnectionManager,
}

pub fn harness(config: TransportConfig) -> Harness {
    let context = TransportContext::new(config);
    let (transport, links) = MockTransport::new();
    let manager = context.connection_with(transport.clone());
    Harness {
        context,
        transport,
        links,
        manager,
    }
}

/// Take the next link and answer its readiness ping
pub async fn accept(links: &mut mpsc::UnboundedReceiver<ServerEnd>) -> ServerEnd {
    let mut server = links.recv().await.expect("no link opened");
    let ping = server.recv().await.expect("no readiness ping");
    assert_eq!(ping["action"], "ping");
    server.pong().await;
    server
}

/// Connect and return the gateway end of the link
pub async fn connect(h: &mut Harness) -> ServerEnd {
    let manager = h.manager.clone();
    let connecting = tokio::spawn(async move { manager.connect().await });
    let server = accept(&mut h.links).await;
    connecting
        .await
        .expect("connect task panicked")
        .expect("connect failed");
    server
}

pub async fn wait_for_state(manager: &ConnectionManager, target: ConnectionState) {
    let mut status = manager.subscribe_status();
    status
        .wait_for(|state| *state == target)
        .await
        .expect("status channel closed");
}

/// Serve a link until the client drops it: answer pings, echo each request's
/// data back, and return every non-ping frame received
pub fn spawn_echo(mut server: ServerEnd) -> JoinHandle<Vec<Value>> {
    tokio::spawn(async move {
        let mut received = Vec::new();
        while let Some(frame) = server.recv_message().await {
            if frame.get("requestId").is_some() {
                server.respond(&frame, frame["data"].clone()).await;
            }
            received.push(frame);
        }
        received
    })
}
