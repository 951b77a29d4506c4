//! Streaming session controller.
//!
//! A session runs from connect to teardown and produces exactly one
//! [`SessionOutcome`]:
//!
//! 1. connect with the configured retry policy
//! 2. subscribe to status transitions and decoded messages
//! 3. arm the one-shot cancellation (duration timer, message limit, interrupt)
//! 4. validate the channel mask and send it
//! 5. send `start` and wait for cancellation
//! 6. send `stop` exactly once
//! 7. compare the stream message count against the required minimum
//! 8. disconnect, unless the link is to be kept open
//!
//! All triggers converge on one [`CancellationToken`]; whichever fires first
//! wins and the rest are no-ops. The reason for cancelling never influences
//! the outcome, only the message count does. A token cancelled while still
//! connecting ends the session without sending anything to the device.
//!
//! # Example
//! ```no_run
//! use daq_session::config::{SessionConfig, Target};
//! use daq_session::connection::DeviceConnector;
//! use daq_session::session::SessionController;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let target = Target::Network { host: "192.168.1.40".into(), port: 4242 };
//! let config = SessionConfig::new(target).with_duration(Duration::from_secs(10));
//! let controller = SessionController::from_config(config, Arc::new(DeviceConnector));
//! let outcome = controller.run_to_outcome().await;
//! std::process::exit(outcome.exit_code().into());
//! # }
//! ```

use crate::codec::Command;
use crate::config::{ChannelMask, SessionConfig};
use crate::connection::{connect_with_retry, Connection, ConnectionStatus, Connector};
use crate::error::{error_chain, SessionError, SessionResult};
use crate::format::{render_status, SampleFormatter};
use crate::message::{DecodedMessage, MessageClassifier, MessageKind};
use crate::sink::OutputSink;
use parking_lot::Mutex;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Terminal result of a session, mapped onto the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Bound or limit reached, and the minimum was met (or not requested)
    Success,
    /// Fewer stream messages than required
    ValidationFailed,
    /// The link could not be established
    ConnectError,
    /// Failure while configuring, streaming or stopping
    RuntimeError,
}

impl SessionOutcome {
    /// Process exit code: 0 success, 2 validation shortfall, 1 any error.
    pub fn exit_code(self) -> u8 {
        match self {
            SessionOutcome::Success => 0,
            SessionOutcome::ValidationFailed => 2,
            SessionOutcome::ConnectError | SessionOutcome::RuntimeError => 1,
        }
    }
}

impl From<SessionOutcome> for std::process::ExitCode {
    fn from(outcome: SessionOutcome) -> Self {
        std::process::ExitCode::from(outcome.exit_code())
    }
}

/// What a completed (non-error) session observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    /// `Success` or `ValidationFailed`
    pub outcome: SessionOutcome,
    /// Stream messages accepted between subscription and stop
    pub received: u64,
    /// Configured minimum (0 = not checked)
    pub required: u64,
}

/// State shared between the controller and the connection's I/O contexts.
struct StreamState {
    classifier: MessageClassifier,
    formatter: SampleFormatter,
    limit: u64,
    data: Arc<OutputSink>,
    diagnostics: Arc<OutputSink>,
    cancel: CancellationToken,
    received: AtomicU64,
    fault: Mutex<Option<SessionError>>,
}

impl StreamState {
    fn handle_message(&self, message: DecodedMessage) {
        if self.cancel.is_cancelled() {
            return;
        }

        match self.classifier.classify(&message) {
            MessageKind::Stream => {
                let seen = self.received.fetch_add(1, Ordering::SeqCst) + 1;
                if self.limit > 0 && seen > self.limit {
                    return;
                }
                if let Err(e) = self.data.write_line(&self.formatter.render(&message)) {
                    self.fail(SessionError::Io(e));
                    return;
                }
                if self.limit > 0 && seen == self.limit {
                    tracing::debug!(limit = self.limit, "Message limit reached");
                    self.cancel.cancel();
                }
            }
            MessageKind::Status => {
                if let Err(e) = self.diagnostics.write_line(&render_status(&message)) {
                    tracing::warn!(error = %e, "Failed to write device status");
                }
            }
            MessageKind::Other => {}
        }
    }

    fn handle_status(&self, status: ConnectionStatus) {
        if let Err(e) = self.diagnostics.write_line(&format!("status: {}", status)) {
            tracing::warn!(error = %e, "Failed to write connection status");
        }
        if let ConnectionStatus::Lost(reason) = status {
            self.fail(SessionError::Transport(reason));
        }
    }

    /// Record the first fault and cancel the session.
    fn fail(&self, error: SessionError) {
        {
            let mut fault = self.fault.lock();
            if fault.is_none() {
                *fault = Some(error);
            }
        }
        self.cancel.cancel();
    }

    fn received(&self) -> u64 {
        let seen = self.received.load(Ordering::SeqCst);
        if self.limit > 0 {
            seen.min(self.limit)
        } else {
            seen
        }
    }
}

/// Owns one device connection for the lifetime of a session.
pub struct SessionController {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    data: Arc<OutputSink>,
    diagnostics: Arc<OutputSink>,
    cancel: CancellationToken,
}

impl SessionController {
    /// Controller writing data to `data` and status/error lines to
    /// `diagnostics`. The CSV header, if any, is reserved on `data` here.
    pub fn new(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        data: OutputSink,
        diagnostics: OutputSink,
    ) -> Self {
        let header = SampleFormatter::new(config.format).header();
        Self {
            config,
            connector,
            data: Arc::new(data.with_header(header)),
            diagnostics: Arc::new(diagnostics),
            cancel: CancellationToken::new(),
        }
    }

    /// Controller with the configured data destination and stderr diagnostics.
    ///
    /// An output file is only created (and truncated) once the device is
    /// connected.
    pub fn from_config(config: SessionConfig, connector: Arc<dyn Connector>) -> Self {
        let data = OutputSink::open(&config.destination);
        Self::new(config, connector, data, OutputSink::stderr())
    }

    /// Handle for external cancellation producers (e.g. Ctrl-C).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the session and report failures on the diagnostic stream.
    pub async fn run_to_outcome(&self) -> SessionOutcome {
        match self.run().await {
            Ok(summary) => {
                if summary.outcome == SessionOutcome::ValidationFailed {
                    self.diagnose(&format!(
                        "validation failed: received {} stream messages, required {}",
                        summary.received, summary.required
                    ));
                }
                summary.outcome
            }
            Err(e) => {
                self.diagnose(&format!("error: {}", error_chain(&e)));
                e.outcome()
            }
        }
    }

    /// Run the session. Errors abort it; a shortfall does not.
    pub async fn run(&self) -> SessionResult<SessionSummary> {
        let connection = tokio::select! {
            connected = connect_with_retry(&*self.connector, &self.config.target, &self.config.retry) => connected?,
            _ = self.cancel.cancelled() => {
                tracing::info!(device = %self.config.target, "Cancelled while connecting");
                return Ok(self.summarize(0));
            }
        };

        let result = self.stream(&*connection).await;
        self.teardown(connection).await;
        result
    }

    async fn stream(&self, connection: &dyn Connection) -> SessionResult<SessionSummary> {
        // Whatever happens below, leave the token cancelled so late messages
        // are ignored and the timer task ends.
        let _cancel_on_exit = self.cancel.clone().drop_guard();
        self.data.prepare()?;

        let state = Arc::new(StreamState {
            classifier: MessageClassifier::new(self.config.show_status),
            formatter: SampleFormatter::new(self.config.format),
            limit: self.config.limit,
            data: self.data.clone(),
            diagnostics: self.diagnostics.clone(),
            cancel: self.cancel.clone(),
            received: AtomicU64::new(0),
            fault: Mutex::new(None),
        });

        let status_state = state.clone();
        connection.on_status(Arc::new(move |status| status_state.handle_status(status)));
        let message_state = state.clone();
        connection.on_message(Arc::new(move |message| message_state.handle_message(message)));

        if !self.config.duration.is_zero() {
            let duration = self.config.duration;
            let token = self.cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => {
                        tracing::debug!(?duration, "Session duration elapsed");
                        token.cancel();
                    }
                    _ = token.cancelled() => {}
                }
            });
        }

        if let Some(raw) = &self.config.channel_mask {
            let mask = ChannelMask::parse(raw)?;
            self.send(connection, &Command::enable_channels(&mask)).await?;
        }

        let stopped = if self.cancel.is_cancelled() {
            tracing::info!(device = %connection.describe(), "Cancelled before streaming started");
            Ok(())
        } else {
            self.send(
                connection,
                &Command::Start {
                    rate: self.config.rate,
                },
            )
            .await?;
            tracing::info!(device = %connection.describe(), rate = self.config.rate, "Streaming started");

            self.cancel.cancelled().await;
            self.send(connection, &Command::Stop).await
        };
        let fault = state.fault.lock().take();
        if let Some(fault) = fault {
            if let Err(e) = stopped {
                tracing::warn!(error = %error_chain(&e), "Stop command failed after fault");
            }
            return Err(fault);
        }
        stopped?;

        let summary = self.summarize(state.received());
        tracing::info!(
            received = summary.received,
            required = summary.required,
            outcome = ?summary.outcome,
            "Streaming stopped"
        );
        Ok(summary)
    }

    fn summarize(&self, received: u64) -> SessionSummary {
        let required = self.config.min_samples;
        let outcome = if required > 0 && received < required {
            SessionOutcome::ValidationFailed
        } else {
            SessionOutcome::Success
        };
        SessionSummary {
            outcome,
            received,
            required,
        }
    }

    async fn send(&self, connection: &dyn Connection, command: &Command) -> SessionResult<()> {
        connection
            .send(command)
            .await
            .map_err(|e| SessionError::Send {
                command: command.name().to_string(),
                source: e.into(),
            })
    }

    async fn teardown(&self, connection: Box<dyn Connection>) {
        if self.config.keep_open {
            tracing::info!(device = %connection.describe(), "Leaving connection open");
            return;
        }
        if let Err(e) = connection.disconnect().await {
            let err = SessionError::Disconnect(e.into());
            tracing::error!(error = %error_chain(&err), "Teardown failed");
            self.diagnose(&format!("error: {}", error_chain(&err)));
        }
    }

    fn diagnose(&self, line: &str) {
        if let Err(e) = self.diagnostics.write_line(line) {
            tracing::warn!(error = %e, "Failed to write diagnostic line");
        }
    }
}

/// Cancel `token` on the first interrupt and call `force_exit` on the second.
///
/// `next_interrupt` resolves once per interrupt (e.g. `tokio::signal::ctrl_c`).
/// The second interrupt covers a stop or disconnect that hangs.
pub async fn relay_interrupts<F, Fut, X>(
    mut next_interrupt: F,
    token: CancellationToken,
    force_exit: X,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<()>>,
    X: FnOnce(),
{
    if let Err(e) = next_interrupt().await {
        tracing::warn!(error = %e, "Failed to listen for interrupts");
        return;
    }
    tracing::info!("Interrupted, stopping session");
    token.cancel();

    if let Err(e) = next_interrupt().await {
        tracing::warn!(error = %e, "Failed to listen for interrupts");
        return;
    }
    tracing::warn!("Interrupted again, exiting without teardown");
    force_exit();
}
