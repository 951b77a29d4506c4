//! Line-delimited frames over an async byte stream.

use super::{Connection, ConnectionStatus, MessageHandler, StatusHandler, Subscribers};
use crate::codec::{Codec, Command};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, WriteHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Trait alias for the byte streams a [`LineConnection`] can run on.
///
/// Covers `tokio::net::TcpStream`, `tokio_serial::SerialStream` and
/// `tokio::io::DuplexStream` (tests).
pub trait DeviceStream: AsyncRead + AsyncWrite + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + 'static> DeviceStream for T {}

type BoxedStream = Box<dyn DeviceStream + Unpin>;

/// Connection that writes encoded commands and decodes one frame per line.
///
/// A background reader task decodes inbound lines and fans them out to the
/// registered handlers. Undecodable lines are logged and skipped.
pub struct LineConnection {
    label: String,
    codec: Arc<dyn Codec>,
    writer: Mutex<Option<WriteHalf<BoxedStream>>>,
    subscribers: Arc<Subscribers>,
    closing: Arc<AtomicBool>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl LineConnection {
    /// Take ownership of `stream` and start the reader task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new<S>(stream: S, label: impl Into<String>, codec: Arc<dyn Codec>) -> Self
    where
        S: DeviceStream + Unpin,
    {
        let label = label.into();
        let boxed: BoxedStream = Box::new(stream);
        let (read_half, write_half) = tokio::io::split(boxed);
        let subscribers = Arc::new(Subscribers::default());
        let closing = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(read_loop(
            BufReader::new(read_half),
            label.clone(),
            codec.clone(),
            subscribers.clone(),
            closing.clone(),
        ));

        Self {
            label,
            codec,
            writer: Mutex::new(Some(write_half)),
            subscribers,
            closing,
            reader: parking_lot::Mutex::new(Some(reader)),
        }
    }

    fn current_status(&self) -> ConnectionStatus {
        if self.closing.load(Ordering::SeqCst) {
            ConnectionStatus::Disconnected
        } else {
            ConnectionStatus::Connected
        }
    }
}

async fn read_loop<R>(
    reader: BufReader<R>,
    label: String,
    codec: Arc<dyn Codec>,
    subscribers: Arc<Subscribers>,
    closing: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = reader.lines();
    let reason = loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match codec.decode(&line) {
                    Ok(message) => subscribers.dispatch_message(message),
                    Err(e) => tracing::warn!(device = %label, error = %e, "Skipping undecodable frame"),
                }
            }
            Ok(None) => break "connection closed by device".to_string(),
            Err(e) => break format!("read failed: {}", e),
        }
    };

    if !closing.load(Ordering::SeqCst) {
        tracing::warn!(device = %label, %reason, "Link lost");
        subscribers.dispatch_status(ConnectionStatus::Lost(reason));
    }
}

#[async_trait]
impl Connection for LineConnection {
    fn describe(&self) -> String {
        self.label.clone()
    }

    fn on_message(&self, handler: MessageHandler) {
        self.subscribers.add_message(handler);
    }

    fn on_status(&self, handler: StatusHandler) {
        handler(self.current_status());
        self.subscribers.add_status(handler);
    }

    async fn send(&self, command: &Command) -> Result<()> {
        let bytes = self.codec.encode(command)?;
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .with_context(|| format!("{} is disconnected", self.label))?;

        tracing::debug!(device = %self.label, command = command.name(), "Sending command");
        writer
            .write_all(&bytes)
            .await
            .with_context(|| format!("Failed to write '{}' to {}", command.name(), self.label))?;
        writer
            .flush()
            .await
            .with_context(|| format!("Failed to flush {}", self.label))?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let writer = self.writer.lock().await.take();
        let shutdown = match writer {
            Some(mut writer) => writer
                .shutdown()
                .await
                .with_context(|| format!("Failed to close {}", self.label)),
            None => Ok(()),
        };

        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }

        tracing::info!(device = %self.label, "Disconnected");
        self.subscribers.dispatch_status(ConnectionStatus::Disconnected);
        shutdown
    }
}

impl std::fmt::Debug for LineConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineConnection")
            .field("label", &self.label)
            .field("closing", &self.closing.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonLineCodec;
    use crate::message::DecodedMessage;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn decodes_lines_and_writes_commands() {
        let (host_side, device_side) = duplex(4096);
        let connection = LineConnection::new(host_side, "duplex", Arc::new(JsonLineCodec));

        let (tx, mut rx) = mpsc::unbounded_channel::<DecodedMessage>();
        connection.on_message(Arc::new(move |m| {
            let _ = tx.send(m);
        }));

        let (device_read, mut device_write) = tokio::io::split(device_side);
        device_write
            .write_all(b"{\"type\":\"data\",\"ts\":7,\"analog\":[1,2]}\n\ngarbage\n")
            .await
            .unwrap();

        let message = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.timestamp, 7);
        assert_eq!(message.analog, vec![1, 2]);

        connection.send(&Command::Start { rate: 500 }).await.unwrap();
        let mut device_lines = BufReader::new(device_read).lines();
        let line = device_lines.next_line().await.unwrap().unwrap();
        assert_eq!(line, r#"{"cmd":"start","rate":500}"#);
    }

    #[tokio::test]
    async fn peer_close_reports_lost() {
        let (host_side, device_side) = duplex(1024);
        let connection = LineConnection::new(host_side, "duplex", Arc::new(JsonLineCodec));

        let (tx, mut rx) = mpsc::unbounded_channel::<ConnectionStatus>();
        connection.on_status(Arc::new(move |s| {
            let _ = tx.send(s);
        }));
        assert_eq!(rx.recv().await, Some(ConnectionStatus::Connected));

        drop(device_side);
        let status = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert!(matches!(status, Some(ConnectionStatus::Lost(_))));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_not_a_loss() {
        let (host_side, _device_side) = duplex(1024);
        let connection = LineConnection::new(host_side, "duplex", Arc::new(JsonLineCodec));

        let (tx, mut rx) = mpsc::unbounded_channel::<ConnectionStatus>();
        connection.on_status(Arc::new(move |s| {
            let _ = tx.send(s);
        }));

        connection.disconnect().await.unwrap();
        connection.disconnect().await.unwrap();

        assert_eq!(rx.recv().await, Some(ConnectionStatus::Connected));
        assert_eq!(rx.recv().await, Some(ConnectionStatus::Disconnected));
        assert!(rx.try_recv().is_err());

        assert!(connection.send(&Command::Stop).await.is_err());
    }
}
