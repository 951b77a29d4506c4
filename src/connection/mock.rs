//! Mock device connection
//!
//! Simulated device for testing the controller without hardware. The mock
//! records every command it receives and, once it sees `start`, plays back a
//! scripted list of frames through the registered message handlers.
//!
//! # Example
//!
//! ```rust,ignore
//! let device = MockConnection::new()
//!     .with_frames((1..=10).map(|ts| DecodedMessage::samples(ts, vec![1, 2])).collect())
//!     .with_interval(Duration::from_millis(5));
//! let connector = MockConnector::new(device.clone());
//! // ... run a session against `connector` ...
//! assert_eq!(device.commands().last(), Some(&Command::Stop));
//! ```

use super::{
    Connection, ConnectionStatus, Connector, MessageHandler, StatusHandler, Subscribers,
};
use crate::codec::Command;
use crate::config::Target;
use crate::message::DecodedMessage;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Default)]
struct Script {
    frames: Vec<DecodedMessage>,
    interval: Duration,
    concurrent: bool,
    lose_link_after: bool,
    fail_command: Option<&'static str>,
    fail_disconnect: bool,
}

#[derive(Default)]
struct MockState {
    subscribers: Subscribers,
    script: Mutex<Script>,
    commands: Mutex<Vec<Command>>,
    playback: Mutex<Option<JoinHandle<()>>>,
    disconnects: AtomicU32,
    closed: AtomicBool,
}

/// Scriptable in-process device. Clones share state.
#[derive(Clone, Default)]
pub struct MockConnection {
    state: Arc<MockState>,
}

impl MockConnection {
    /// Device with an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames to play after `start`.
    pub fn with_frames(self, frames: Vec<DecodedMessage>) -> Self {
        self.state.script.lock().frames = frames;
        self
    }

    /// Pause between frames (zero = back-to-back).
    pub fn with_interval(self, interval: Duration) -> Self {
        self.state.script.lock().interval = interval;
        self
    }

    /// Deliver every frame from its own task, like a multi-context I/O layer.
    pub fn with_concurrent_delivery(self) -> Self {
        self.state.script.lock().concurrent = true;
        self
    }

    /// Report the link as lost once the script is exhausted.
    pub fn lose_link_after_frames(self) -> Self {
        self.state.script.lock().lose_link_after = true;
        self
    }

    /// Fail every send of the named command (`enable_channels`, `start`, `stop`).
    pub fn fail_on(self, command: &'static str) -> Self {
        self.state.script.lock().fail_command = Some(command);
        self
    }

    /// Make `disconnect` return an error.
    pub fn fail_disconnect(self) -> Self {
        self.state.script.lock().fail_disconnect = true;
        self
    }

    /// Commands received so far, in order.
    pub fn commands(&self) -> Vec<Command> {
        self.state.commands.lock().clone()
    }

    /// Number of `stop` commands received.
    pub fn stop_count(&self) -> usize {
        self.commands()
            .iter()
            .filter(|c| matches!(c, Command::Stop))
            .count()
    }

    /// Number of `disconnect` calls.
    pub fn disconnect_count(&self) -> u32 {
        self.state.disconnects.load(Ordering::SeqCst)
    }

    /// Push one message to the subscribers right now.
    pub fn emit(&self, message: DecodedMessage) {
        self.state.subscribers.dispatch_message(message);
    }

    /// Push one status transition to the subscribers right now.
    pub fn emit_status(&self, status: ConnectionStatus) {
        self.state.subscribers.dispatch_status(status);
    }

    fn start_playback(&self) {
        let (frames, interval, concurrent, lose_link_after) = {
            let script = self.state.script.lock();
            (
                script.frames.clone(),
                script.interval,
                script.concurrent,
                script.lose_link_after,
            )
        };
        let state = self.state.clone();

        let handle = tokio::spawn(async move {
            let mut deliveries = Vec::new();
            for frame in frames {
                if concurrent {
                    let state = state.clone();
                    deliveries.push(tokio::spawn(async move {
                        state.subscribers.dispatch_message(frame);
                    }));
                } else {
                    state.subscribers.dispatch_message(frame);
                }
                if interval.is_zero() {
                    tokio::task::yield_now().await;
                } else {
                    tokio::time::sleep(interval).await;
                }
            }
            for delivery in deliveries {
                let _ = delivery.await;
            }
            if lose_link_after {
                state
                    .subscribers
                    .dispatch_status(ConnectionStatus::Lost("mock link dropped".into()));
            }
        });

        if let Some(previous) = self.state.playback.lock().replace(handle) {
            previous.abort();
        }
    }

    fn stop_playback(&self) {
        if let Some(handle) = self.state.playback.lock().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn describe(&self) -> String {
        "mock://device".to_string()
    }

    fn on_message(&self, handler: MessageHandler) {
        self.state.subscribers.add_message(handler);
    }

    fn on_status(&self, handler: StatusHandler) {
        handler(if self.state.closed.load(Ordering::SeqCst) {
            ConnectionStatus::Disconnected
        } else {
            ConnectionStatus::Connected
        });
        self.state.subscribers.add_status(handler);
    }

    async fn send(&self, command: &Command) -> Result<()> {
        let fail = self.state.script.lock().fail_command;
        if fail == Some(command.name()) {
            return Err(anyhow!("mock write of '{}' failed", command.name()));
        }

        self.state.commands.lock().push(command.clone());
        match command {
            Command::Start { .. } => self.start_playback(),
            Command::Stop => self.stop_playback(),
            Command::EnableChannels { .. } => {}
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.state.disconnects.fetch_add(1, Ordering::SeqCst);
        self.stop_playback();
        if self.state.script.lock().fail_disconnect {
            return Err(anyhow!("mock disconnect failed"));
        }
        self.state.closed.store(true, Ordering::SeqCst);
        self.state
            .subscribers
            .dispatch_status(ConnectionStatus::Disconnected);
        Ok(())
    }
}

/// Connector handing out clones of one [`MockConnection`].
pub struct MockConnector {
    connection: MockConnection,
    failures: AtomicU32,
    open_delay: Duration,
    attempts: AtomicU32,
}

impl MockConnector {
    /// Connector that succeeds on the first attempt.
    pub fn new(connection: MockConnection) -> Self {
        Self {
            connection,
            failures: AtomicU32::new(0),
            open_delay: Duration::ZERO,
            attempts: AtomicU32::new(0),
        }
    }

    /// Refuse the first `n` attempts.
    pub fn fail_first(self, n: u32) -> Self {
        self.failures.store(n, Ordering::SeqCst);
        self
    }

    /// Delay every attempt, e.g. to exercise the per-attempt timeout.
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    /// Attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, _target: &Target) -> Result<Box<dyn Connection>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        let refuse = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refuse {
            return Err(anyhow!("connection refused (mock)"));
        }
        Ok(Box::new(self.connection.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plays_script_after_start() {
        let device = MockConnection::new().with_frames(vec![
            DecodedMessage::samples(1, vec![1]),
            DecodedMessage::samples(2, vec![2]),
        ]);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        device.on_message(Arc::new(move |m: DecodedMessage| {
            let _ = tx.send(m.timestamp);
        }));

        device.send(&Command::Start { rate: 10 }).await.unwrap();
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(device.commands(), vec![Command::Start { rate: 10 }]);
    }

    #[tokio::test]
    async fn failing_command_is_not_recorded() {
        let device = MockConnection::new().fail_on("start");
        assert!(device.send(&Command::Start { rate: 10 }).await.is_err());
        assert!(device.commands().is_empty());
    }

    #[tokio::test]
    async fn counts_disconnects_even_when_failing() {
        let device = MockConnection::new().fail_disconnect();
        assert!(device.disconnect().await.is_err());
        assert_eq!(device.disconnect_count(), 1);
    }
}
