//! Transport seam between the upstream client and the network.
//!
//! A [`Connector`] opens one connection per attempt. The resulting
//! [`Connection`] is pumped in its own task and reports everything that happens
//! to it as [`LinkEvent`]s tagged with the attempt's generation, so the client
//! can discard events from connections it has already given up on.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::backoff::RATE_LIMIT_PENALTY;
use super::backoff::UNAUTHORIZED_PENALTY;

/// Close code reported when a connection ends without a close handshake.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// How long a connection attempt may take before it is abandoned.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Server rejected credentials (HTTP {0})")]
    Unauthorized(u16),

    #[error("Server is rate limiting connections (HTTP 429)")]
    RateLimited,

    #[error("Invalid upstream URL: {0}")]
    InvalidUrl(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Connection error: {0}")]
    Io(String),

    #[error("No response from server within {0:?}")]
    TimedOut(Duration),
}

impl TransportError {
    /// Extra delay this error adds to the next reconnect.
    pub fn penalty(&self) -> Option<Duration> {
        match self {
            TransportError::Unauthorized(_) => Some(UNAUTHORIZED_PENALTY),
            TransportError::RateLimited => Some(RATE_LIMIT_PENALTY),
            TransportError::InvalidUrl(_)
            | TransportError::Handshake(_)
            | TransportError::Io(_)
            | TransportError::TimedOut(_) => None,
        }
    }
}

#[derive(Clone)]
pub struct ConnectRequest {
    pub url: String,
    /// Sent as `Authorization: Bearer <credential>`
    pub credential: String,
    /// Accept self-signed server certificates
    pub accept_invalid_certs: bool,
}

impl fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("url", &self.url)
            .field("credential", &"<redacted>")
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// Frames the client asks a live connection to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Close,
}

/// Write half of a live connection, handed to the client on open.
#[derive(Debug, Clone)]
pub struct Link {
    tx: mpsc::UnboundedSender<Frame>,
}

impl Link {
    /// Queue a text frame. Returns false once the connection is gone.
    pub fn send_text(&self, text: &str) -> bool {
        self.tx.send(Frame::Text(text.to_string())).is_ok()
    }

    pub fn close(&self) {
        let _ = self.tx.send(Frame::Close);
    }
}

#[derive(Debug)]
pub enum LinkEvent {
    Opened(Link),
    Message(String),
    Error(TransportError),
    /// Always the last event of a connection.
    Closed(CloseInfo),
}

/// Where a connection reports its events.
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, LinkEvent)>,
}

impl EventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, LinkEvent)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once the client has gone away.
    pub fn emit(&self, event: LinkEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }
}

/// Opens connections to the upstream service.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, request: &ConnectRequest) -> Result<Box<dyn Connection>, TransportError>;
}

/// An established connection.
#[async_trait]
pub trait Connection: Send {
    /// Pump frames in both directions until the connection ends.
    ///
    /// Writes every frame received on `outbound`, reports inbound text as
    /// [`LinkEvent::Message`] and finishes with exactly one
    /// [`LinkEvent::Closed`]. A [`Frame::Close`] or a dropped `outbound`
    /// closes the connection normally.
    async fn run(self: Box<Self>, outbound: mpsc::UnboundedReceiver<Frame>, events: EventSink);
}

/// Run one connection attempt in the background.
///
/// Emits `Opened` before any other event of a successful attempt, and
/// `Error` followed by an abnormal `Closed` for a failed one. An attempt
/// still pending after [`CONNECT_TIMEOUT`] counts as failed.
pub fn spawn_link(
    connector: Arc<dyn Connector>,
    request: ConnectRequest,
    events: EventSink,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let attempt = tokio::time::timeout(CONNECT_TIMEOUT, connector.connect(&request))
            .await
            .unwrap_or_else(|_| Err(TransportError::TimedOut(CONNECT_TIMEOUT)));
        match attempt {
            Ok(connection) => {
                let (tx, rx) = mpsc::unbounded_channel();
                if !events.emit(LinkEvent::Opened(Link { tx })) {
                    return;
                }
                connection.run(rx, events).await;
            }
            Err(e) => {
                events.emit(LinkEvent::Error(e));
                events.emit(LinkEvent::Closed(CloseInfo::new(
                    ABNORMAL_CLOSURE,
                    "connection failed",
                )));
            }
        }
    })
}
