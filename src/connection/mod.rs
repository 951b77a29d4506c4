//! Device connections.
//!
//! The controller drives a device through the narrow [`Connection`] trait:
//! send a [`Command`], subscribe to decoded messages and status transitions,
//! disconnect. A [`Connector`] produces connections for a [`Target`];
//! [`connect_with_retry`] layers the configured attempt/timeout policy on top.
//!
//! # Implementations
//!
//! - [`LineConnection`]: line-delimited frames over any async byte stream
//!   (TCP socket or serial port), opened by [`DeviceConnector`].
//! - [`mock::MockConnection`]: in-process device for tests.

pub mod line;
pub mod mock;
#[cfg(feature = "serial")]
pub mod serial;

pub use line::LineConnection;

use crate::codec::{Command, JsonLineCodec};
use crate::config::{RetryPolicy, Target};
use crate::error::{SessionError, SessionResult};
use crate::message::DecodedMessage;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

/// Callback invoked for every decoded inbound message.
pub type MessageHandler = Arc<dyn Fn(DecodedMessage) + Send + Sync>;

/// Callback invoked for every connection status transition.
pub type StatusHandler = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

/// Link state as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Link established
    Connected,
    /// Closed on request
    Disconnected,
    /// Closed by the device or failed
    Lost(String),
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Lost(reason) => write!(f, "lost ({})", reason),
        }
    }
}

/// A live link to one device.
///
/// Handlers may be invoked from I/O tasks concurrently with each other and
/// with the caller. A newly registered status handler is first called with
/// the current status.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Human-readable endpoint description
    fn describe(&self) -> String;

    /// Subscribe to decoded messages
    fn on_message(&self, handler: MessageHandler);

    /// Subscribe to status transitions
    fn on_status(&self, handler: StatusHandler);

    /// Encode and write one command
    async fn send(&self, command: &Command) -> Result<()>;

    /// Close the link
    async fn disconnect(&self) -> Result<()>;
}

/// Opens connections to targets.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Make a single connection attempt
    async fn open(&self, target: &Target) -> Result<Box<dyn Connection>>;
}

/// Open a connection, honoring the attempt count, per-attempt timeout and
/// inter-attempt delay of `policy`.
pub async fn connect_with_retry(
    connector: &dyn Connector,
    target: &Target,
    policy: &RetryPolicy,
) -> SessionResult<Box<dyn Connection>> {
    let attempts = policy.attempts.max(1);
    let mut last_error = anyhow!("no connection attempt was made");

    for attempt in 1..=attempts {
        tracing::info!(device = %target, attempt, attempts, "Connecting");
        match timeout(policy.timeout, connector.open(target)).await {
            Ok(Ok(connection)) => {
                tracing::info!(device = %target, "Connected");
                return Ok(connection);
            }
            Ok(Err(e)) => {
                tracing::warn!(device = %target, attempt, error = %e, "Connection attempt failed");
                last_error = e;
            }
            Err(elapsed) => {
                tracing::warn!(device = %target, attempt, "Connection attempt timed out");
                last_error = anyhow::Error::new(elapsed)
                    .context(format!("attempt timed out after {:?}", policy.timeout));
            }
        }
        if attempt < attempts {
            sleep(policy.retry_delay).await;
        }
    }

    Err(SessionError::Connect {
        target: target.to_string(),
        attempts,
        source: last_error.into(),
    })
}

/// Production connector: TCP for network targets, tokio-serial for serial
/// targets, both speaking [`JsonLineCodec`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceConnector;

#[async_trait]
impl Connector for DeviceConnector {
    async fn open(&self, target: &Target) -> Result<Box<dyn Connection>> {
        let codec = Arc::new(JsonLineCodec);
        match target {
            Target::Network { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port))
                    .await
                    .with_context(|| format!("Failed to connect to {}:{}", host, port))?;
                // Disable Nagle's algorithm for low latency
                stream.set_nodelay(true)?;
                Ok(Box::new(LineConnection::new(stream, target.to_string(), codec)))
            }
            #[cfg(feature = "serial")]
            Target::Serial { port, baud } => {
                let stream = serial::open_serial_async(port, *baud).await?;
                Ok(Box::new(LineConnection::new(stream, target.to_string(), codec)))
            }
            #[cfg(not(feature = "serial"))]
            Target::Serial { .. } => Err(anyhow!(
                "Serial support not enabled. Rebuild with --features serial"
            )),
        }
    }
}

/// Registered handlers, shared between a connection and its I/O task.
#[derive(Default)]
pub(crate) struct Subscribers {
    messages: RwLock<Vec<MessageHandler>>,
    status: RwLock<Vec<StatusHandler>>,
}

impl Subscribers {
    pub(crate) fn add_message(&self, handler: MessageHandler) {
        self.messages.write().push(handler);
    }

    pub(crate) fn add_status(&self, handler: StatusHandler) {
        self.status.write().push(handler);
    }

    pub(crate) fn dispatch_message(&self, message: DecodedMessage) {
        // Clone the list so handlers run without holding the lock
        let handlers = self.messages.read().clone();
        match handlers.split_last() {
            Some((last, rest)) => {
                for handler in rest {
                    handler(message.clone());
                }
                last(message);
            }
            None => tracing::trace!("Dropping message with no subscribers"),
        }
    }

    pub(crate) fn dispatch_status(&self, status: ConnectionStatus) {
        let handlers = self.status.read().clone();
        for handler in handlers {
            handler(status.clone());
        }
    }
}
