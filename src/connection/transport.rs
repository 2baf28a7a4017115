//! Duplex transport seam
//!
//! The [`ConnectionManager`](super::ConnectionManager) never touches a socket
//! directly. It asks a [`Transport`] to open a [`Link`]: a pair of channels
//! backed by background reader/writer tasks that are aborted when the link is
//! dropped.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, client::IntoClientRequest, Message},
};

use crate::resilience::RawError;

/// Inbound frames buffered between the reader task and the manager
const INBOUND_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("invalid endpoint URL: {0}")]
    InvalidUrl(String),
    #[error("connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),
    /// Handshake answered with a non-upgrade HTTP status
    #[error("handshake rejected with HTTP {status}")]
    Rejected { status: u16 },
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("connection failed: {0}")]
    Failed(String),
    #[error("transport closed")]
    Closed,
}

impl From<&TransportError> for RawError {
    fn from(err: &TransportError) -> Self {
        let message = err.to_string();
        match err {
            TransportError::InvalidUrl(_) => RawError::with_code("VALIDATION", message),
            TransportError::ConnectTimeout(_) => RawError::with_code("TIMEOUT", message),
            TransportError::Rejected { status } => RawError::new(message).with_status(*status),
            TransportError::Refused(_) => RawError::with_code("ECONNREFUSED", message),
            TransportError::Failed(_) => RawError::with_code("NETWORK_ERROR", message),
            TransportError::Closed => RawError::with_code("TRANSPORT_CLOSED", message),
        }
    }
}

/// Something the remote end did to the link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One text frame
    Frame(String),
    /// The link is gone; carries the close reason when the peer gave one
    Closed(Option<String>),
}

/// An open duplex link
pub struct Link {
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::Receiver<TransportEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl Link {
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::Receiver<TransportEvent>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            tasks: Vec::new(),
        }
    }

    /// Tie background tasks to the link's lifetime
    pub fn with_tasks(mut self, tasks: Vec<JoinHandle<()>>) -> Self {
        self.tasks = tasks;
        self
    }

    /// Queue one text frame for the writer; never blocks
    pub fn send(&self, frame: String) -> Result<(), TransportError> {
        self.outbound.send(frame).map_err(|_| TransportError::Closed)
    }

    /// The writer side has gone away
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    /// Next inbound event; a dropped sender reads as a close
    pub async fn recv(&mut self) -> TransportEvent {
        self.inbound
            .recv()
            .await
            .unwrap_or(TransportEvent::Closed(None))
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Opens links to a URL
pub trait Transport: Send + Sync + 'static {
    fn open(&self, url: &str) -> BoxFuture<'static, Result<Link, TransportError>>;
}

/// WebSocket transport over tokio-tungstenite (rustls for `wss://`)
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    connect_timeout: Duration,
}

impl WebSocketTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

fn map_ws_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Http(response) => TransportError::Rejected {
            status: response.status().as_u16(),
        },
        tungstenite::Error::Io(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            TransportError::Refused(e.to_string())
        }
        tungstenite::Error::Url(e) => TransportError::InvalidUrl(e.to_string()),
        other => TransportError::Failed(other.to_string()),
    }
}

impl Transport for WebSocketTransport {
    fn open(&self, url: &str) -> BoxFuture<'static, Result<Link, TransportError>> {
        let url = url.to_string();
        let connect_timeout = self.connect_timeout;

        Box::pin(async move {
            let request = url
                .as_str()
                .into_client_request()
                .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;

            log::info!("WebSocketTransport: connecting to {}", url);

            let (ws_stream, _response) = timeout(connect_timeout, connect_async(request))
                .await
                .map_err(|_| TransportError::ConnectTimeout(connect_timeout))?
                .map_err(map_ws_error)?;

            log::debug!("WebSocketTransport: connected to {}", url);

            let (mut write, mut read) = ws_stream.split();
            let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
            let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);

            let writer = tokio::spawn(async move {
                while let Some(frame) = outbound_rx.recv().await {
                    if let Err(e) = write.send(Message::Text(frame)).await {
                        log::warn!("WebSocketTransport: send failed: {}", e);
                        break;
                    }
                }
                if let Err(e) = write.close().await {
                    log::debug!("WebSocketTransport: close failed: {}", e);
                }
            });

            let reader = tokio::spawn(async move {
                let reason = loop {
                    match read.next().await {
                        Some(Ok(Message::Text(text))) => {
                            if inbound_tx.send(TransportEvent::Frame(text)).await.is_err() {
                                log::debug!("WebSocketTransport: link dropped");
                                return;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            log::info!("WebSocketTransport: closed by server");
                            break frame.map(|f| f.reason.to_string());
                        }
                        Some(Err(e)) => {
                            log::warn!("WebSocketTransport: read error: {}", e);
                            break Some(e.to_string());
                        }
                        None => break None,
                        // Ping/pong/binary
                        Some(Ok(_)) => {}
                    }
                };
                let _ = inbound_tx.send(TransportEvent::Closed(reason)).await;
            });

            Ok(Link::new(outbound_tx, inbound_rx).with_tasks(vec![writer, reader]))
        })
    }
}
