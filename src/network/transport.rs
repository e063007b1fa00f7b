use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use super::fault::FaultInjector;

/// Where a message is sent: an HQ server's TCP session port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    #[error("connection closed by peer")]
    Closed,
    #[error("negative acknowledgement: {0}")]
    Nack(String),
    #[error("message dropped by fault injector")]
    Dropped,
    #[error("delivery failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

/// An authenticated, line-oriented connection to an HQ server.
///
/// `open` performs the `AUTH|<token>` exchange; every later line is sent on
/// the same socket.
pub struct Link {
    endpoint: Endpoint,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Link {
    pub async fn open(
        endpoint: &Endpoint,
        token: &str,
        connect_timeout: Duration,
        reply_timeout: Duration,
    ) -> Result<Self, DeliveryError> {
        let stream = tokio::time::timeout(
            connect_timeout,
            TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
        )
        .await
        .map_err(|_| DeliveryError::Timeout("connect"))??;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let mut link = Self {
            endpoint: endpoint.clone(),
            reader: BufReader::new(read_half),
            writer: write_half,
        };

        let reply = link.request(&format!("AUTH|{}", token), reply_timeout).await?;
        if reply != "AUTH_OK" {
            return Err(DeliveryError::AuthRejected(reply));
        }

        tracing::trace!("Authenticated link to {}", link.endpoint);
        Ok(link)
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub async fn send(&mut self, line: &str) -> Result<(), DeliveryError> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Sends one line and waits for one reply line.
    pub async fn request(&mut self, line: &str, timeout: Duration) -> Result<String, DeliveryError> {
        self.send(line).await?;
        self.read_line(timeout).await
    }

    pub async fn read_line(&mut self, timeout: Duration) -> Result<String, DeliveryError> {
        let mut buf = String::new();
        let read = tokio::time::timeout(timeout, self.reader.read_line(&mut buf))
            .await
            .map_err(|_| DeliveryError::Timeout("reply"))??;

        if read == 0 {
            return Err(DeliveryError::Closed);
        }
        Ok(buf.trim_end().to_string())
    }

    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
    }
}

/// One request/reply exchange with a remote server.
///
/// The retry policy lives in `ReliableDelivery`; a transport only knows how
/// to make a single attempt.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn exchange(
        &self,
        target: &Endpoint,
        message: &str,
        ack_timeout: Duration,
    ) -> Result<String, DeliveryError>;
}

/// Real TCP transport: a fresh authenticated connection per attempt.
pub struct TcpTransport {
    token: String,
    connect_timeout: Duration,
    injector: Arc<FaultInjector>,
}

impl TcpTransport {
    pub fn new(token: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            token: token.into(),
            connect_timeout,
            injector: FaultInjector::global(),
        }
    }

    pub fn with_injector(mut self, injector: Arc<FaultInjector>) -> Self {
        self.injector = injector;
        self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn exchange(
        &self,
        target: &Endpoint,
        message: &str,
        ack_timeout: Duration,
    ) -> Result<String, DeliveryError> {
        if !self.injector.simulate_send(message).await {
            return Err(DeliveryError::Dropped);
        }

        let mut link = Link::open(target, &self.token, self.connect_timeout, ack_timeout).await?;
        let reply = link.request(message, ack_timeout).await;
        link.close().await;
        reply
    }
}

pub type Responder = Arc<dyn Fn(&Endpoint, &str) -> Option<String> + Send + Sync>;

/// In-memory transport for tests: every attempt goes through the fault
/// injector and, if it survives, the responder produces the reply.
pub struct SimulatedTransport {
    injector: Arc<FaultInjector>,
    responder: Responder,
    attempts: AtomicUsize,
}

impl SimulatedTransport {
    pub fn new(injector: Arc<FaultInjector>, responder: Responder) -> Self {
        Self {
            injector,
            responder,
            attempts: AtomicUsize::new(0),
        }
    }

    /// Answers every message with `OK`.
    pub fn acknowledging(injector: Arc<FaultInjector>) -> Self {
        Self::new(injector, Arc::new(|_: &Endpoint, _: &str| Some("OK".to_string())))
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn exchange(
        &self,
        target: &Endpoint,
        message: &str,
        _ack_timeout: Duration,
    ) -> Result<String, DeliveryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if !self.injector.simulate_send(message).await {
            return Err(DeliveryError::Dropped);
        }

        (self.responder)(target, message).ok_or(DeliveryError::Closed)
    }
}
