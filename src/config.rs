//! Session configuration.
//!
//! Two layers live here:
//!
//! 1. [`SessionDefaults`]: operator defaults loaded with Figment from an
//!    optional `daq-session.toml` and `DAQ_SESSION_*` environment variables.
//! 2. [`SessionConfig`]: the immutable per-run parameters handed to the
//!    session controller, built from the defaults plus command-line flags.
//!
//! # Example
//! ```no_run
//! use daq_session::config::{SessionConfig, SessionDefaults, Target};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let defaults = SessionDefaults::load(None)?;
//! let target = Target::from_parts(Some("192.168.1.40".into()), Some(4242), None, None, &defaults)?;
//! let config = SessionConfig::new(target)
//!     .with_rate(defaults.rate)
//!     .with_retry(defaults.retry_policy());
//! # let _ = config;
//! # Ok(())
//! # }
//! ```

use crate::error::{SessionError, SessionResult};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Defaults file looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "daq-session.toml";

/// Environment prefix for overriding defaults, e.g. `DAQ_SESSION_RATE=500`.
pub const ENV_PREFIX: &str = "DAQ_SESSION_";

/// Mask symbol for an enabled ADC channel.
pub const CHANNEL_ENABLED: char = '1';

/// Mask symbol for a disabled ADC channel.
pub const CHANNEL_DISABLED: char = '0';

// =============================================================================
// Operator defaults
// =============================================================================

/// Operator defaults merged from file and environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDefaults {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Diagnostic log format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Sample rate requested with the start command, in Hz
    #[serde(default = "default_rate")]
    pub rate: u32,
    /// Serial baud rate used when `--baud` is not given
    #[serde(default = "default_baud")]
    pub baud: u32,
    /// Network port used when `--port` is not given
    #[serde(default = "default_port")]
    pub port: u16,
    /// Per-attempt connect timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Number of connect attempts before giving up
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    /// Pause between connect attempts in milliseconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
    /// UDP port devices answer discovery probes on
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// How long to collect discovery replies, in milliseconds
    #[serde(default = "default_discovery_timeout")]
    pub discovery_timeout_ms: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

fn default_rate() -> u32 {
    1000
}

fn default_baud() -> u32 {
    115_200
}

fn default_port() -> u16 {
    4242
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_connect_attempts() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    500
}

fn default_discovery_port() -> u16 {
    4243
}

fn default_discovery_timeout() -> u64 {
    2000
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            rate: default_rate(),
            baud: default_baud(),
            port: default_port(),
            connect_timeout_ms: default_connect_timeout(),
            connect_attempts: default_connect_attempts(),
            retry_delay_ms: default_retry_delay(),
            discovery_port: default_discovery_port(),
            discovery_timeout_ms: default_discovery_timeout(),
        }
    }
}

impl SessionDefaults {
    /// Load defaults from `path` (or `daq-session.toml`) and `DAQ_SESSION_*`
    /// environment variables, in that order of precedence (env wins).
    ///
    /// A missing implicit file is fine; an explicitly requested file must exist.
    pub fn load(path: Option<&Path>) -> SessionResult<Self> {
        let file = match path {
            Some(p) => {
                if !p.exists() {
                    return Err(SessionError::Config(format!(
                        "config file not found: {}",
                        p.display()
                    )));
                }
                p.to_path_buf()
            }
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        let defaults: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()?;
        defaults.validate()?;
        Ok(defaults)
    }

    /// Validate defaults after loading
    pub fn validate(&self) -> SessionResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(SessionError::Config(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.log_format.to_lowercase().as_str()) {
            return Err(SessionError::Config(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.rate == 0 {
            return Err(SessionError::Config("rate must be greater than 0".into()));
        }

        if self.connect_attempts == 0 {
            return Err(SessionError::Config(
                "connect_attempts must be at least 1".into(),
            ));
        }

        Ok(())
    }

    /// Connect retry policy described by these defaults.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.connect_attempts,
            timeout: Duration::from_millis(self.connect_timeout_ms),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }
}

// =============================================================================
// Per-session parameters
// =============================================================================

/// Where the device lives. Exactly one of network or serial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// TCP endpoint
    Network {
        /// Hostname or IP address
        host: String,
        /// TCP port
        port: u16,
    },
    /// Local serial port
    Serial {
        /// Port path, e.g. `/dev/ttyUSB0` or `COM3`
        port: String,
        /// Baud rate
        baud: u32,
    },
}

impl Target {
    /// Build a target from the raw command-line pieces.
    ///
    /// Fails with [`SessionError::InvalidTarget`] when both a host and a serial
    /// port are given, or neither is. Missing port/baud fall back to `defaults`.
    pub fn from_parts(
        host: Option<String>,
        port: Option<u16>,
        serial: Option<String>,
        baud: Option<u32>,
        defaults: &SessionDefaults,
    ) -> SessionResult<Self> {
        match (host, serial) {
            (Some(_), Some(_)) => Err(SessionError::InvalidTarget(
                "specify either a network host or a serial port, not both".into(),
            )),
            (None, None) => Err(SessionError::InvalidTarget(
                "no target given; use --host or --serial".into(),
            )),
            (Some(host), None) => {
                if host.trim().is_empty() {
                    return Err(SessionError::InvalidTarget("host is empty".into()));
                }
                Ok(Target::Network {
                    host,
                    port: port.unwrap_or(defaults.port),
                })
            }
            (None, Some(serial)) => {
                if serial.trim().is_empty() {
                    return Err(SessionError::InvalidTarget("serial port is empty".into()));
                }
                Ok(Target::Serial {
                    port: serial,
                    baud: baud.unwrap_or(defaults.baud),
                })
            }
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Network { host, port } => write!(f, "tcp://{}:{}", host, port),
            Target::Serial { port, baud } => write!(f, "serial://{}@{}", port, baud),
        }
    }
}

/// Rendering of stream messages on the data sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// `ts=.. analog=[..] digital=..`
    #[default]
    Text,
    /// `timestamp,analog_values,digital_hex` rows after a one-time header
    Csv,
    /// One compact JSON object per line
    Jsonl,
}

/// Where stream data is written.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OutputDestination {
    /// Process standard output
    #[default]
    Stdout,
    /// A file, created or truncated at session start
    File(PathBuf),
}

/// Connect retry policy.
///
/// `attempts` is the total number of tries (not retries); each try is bounded
/// by `timeout` and separated from the next by `retry_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total connect attempts (at least 1)
    pub attempts: u32,
    /// Per-attempt timeout
    pub timeout: Duration,
    /// Pause between attempts
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        SessionDefaults::default().retry_policy()
    }
}

/// Validated per-channel enable mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMask(Vec<bool>);

impl ChannelMask {
    /// Parse a mask such as `1101`; only `1` and `0` are accepted.
    pub fn parse(raw: &str) -> SessionResult<Self> {
        if raw.is_empty() {
            return Err(SessionError::Config("channel mask is empty".into()));
        }
        raw.chars()
            .enumerate()
            .map(|(index, symbol)| match symbol {
                CHANNEL_ENABLED => Ok(true),
                CHANNEL_DISABLED => Ok(false),
                other => Err(SessionError::Config(format!(
                    "channel mask '{}' has invalid symbol '{}' at position {}; expected '{}' or '{}'",
                    raw, other, index, CHANNEL_ENABLED, CHANNEL_DISABLED
                ))),
            })
            .collect::<SessionResult<Vec<_>>>()
            .map(ChannelMask)
    }

    /// Per-channel flags, channel 0 first.
    pub fn channels(&self) -> &[bool] {
        &self.0
    }
}

/// Immutable parameters of one streaming session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Device endpoint
    pub target: Target,
    /// Sample rate sent with the start command (Hz)
    pub rate: u32,
    /// Session bound; zero means unbounded
    pub duration: Duration,
    /// Stop after this many stream messages; zero means unbounded
    pub limit: u64,
    /// Minimum stream messages for a successful exit; zero disables the check
    pub min_samples: u64,
    /// Raw channel mask, validated by the controller before any command
    pub channel_mask: Option<String>,
    /// Data rendering
    pub format: OutputFormat,
    /// Data destination
    pub destination: OutputDestination,
    /// Connect retry policy
    pub retry: RetryPolicy,
    /// Leave the link open at the end of the session
    pub keep_open: bool,
    /// Print device status frames on the diagnostic stream
    pub show_status: bool,
}

impl SessionConfig {
    /// Unbounded text session to stdout with default rate and retry policy.
    pub fn new(target: Target) -> Self {
        Self {
            target,
            rate: default_rate(),
            duration: Duration::ZERO,
            limit: 0,
            min_samples: 0,
            channel_mask: None,
            format: OutputFormat::Text,
            destination: OutputDestination::Stdout,
            retry: RetryPolicy::default(),
            keep_open: false,
            show_status: false,
        }
    }

    /// Set the sample rate
    pub fn with_rate(mut self, rate: u32) -> Self {
        self.rate = rate;
        self
    }

    /// Set the duration bound (zero = unbounded)
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Set the message-count limit (zero = unbounded)
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    /// Set the minimum required stream message count
    pub fn with_min_samples(mut self, min_samples: u64) -> Self {
        self.min_samples = min_samples;
        self
    }

    /// Set the raw channel mask
    pub fn with_channel_mask(mut self, mask: impl Into<String>) -> Self {
        self.channel_mask = Some(mask.into());
        self
    }

    /// Set the output format
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the output destination
    pub fn with_destination(mut self, destination: OutputDestination) -> Self {
        self.destination = destination;
        self
    }

    /// Set the connect retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Keep the link open after the session
    pub fn with_keep_open(mut self, keep_open: bool) -> Self {
        self.keep_open = keep_open;
        self
    }

    /// Print device status frames
    pub fn with_show_status(mut self, show_status: bool) -> Self {
        self.show_status = show_status;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_target_network() {
        let defaults = SessionDefaults::default();
        let target =
            Target::from_parts(Some("10.0.0.2".into()), None, None, None, &defaults).unwrap();
        assert_eq!(
            target,
            Target::Network {
                host: "10.0.0.2".into(),
                port: 4242
            }
        );
        assert_eq!(target.to_string(), "tcp://10.0.0.2:4242");
    }

    #[test]
    fn test_target_serial_uses_default_baud() {
        let defaults = SessionDefaults::default();
        let target =
            Target::from_parts(None, None, Some("/dev/ttyUSB0".into()), None, &defaults).unwrap();
        assert_eq!(target.to_string(), "serial:///dev/ttyUSB0@115200");
    }

    #[test]
    fn test_target_rejects_both() {
        let defaults = SessionDefaults::default();
        let err = Target::from_parts(
            Some("10.0.0.2".into()),
            Some(4242),
            Some("/dev/ttyUSB0".into()),
            Some(9600),
            &defaults,
        )
        .unwrap_err();
        assert!(matches!(err, SessionError::InvalidTarget(_)));
    }

    #[test]
    fn test_target_rejects_neither() {
        let defaults = SessionDefaults::default();
        let err = Target::from_parts(None, Some(4242), None, None, &defaults).unwrap_err();
        assert!(matches!(err, SessionError::InvalidTarget(_)));
    }

    #[test]
    fn test_channel_mask() {
        let mask = ChannelMask::parse("1101").unwrap();
        assert_eq!(mask.channels(), &[true, true, false, true]);

        assert!(matches!(
            ChannelMask::parse("11x1"),
            Err(SessionError::Config(_))
        ));
        assert!(matches!(ChannelMask::parse(""), Err(SessionError::Config(_))));
    }

    #[test]
    fn test_defaults_validation() {
        assert!(SessionDefaults::default().validate().is_ok());

        let mut defaults = SessionDefaults::default();
        defaults.log_level = "loud".into();
        assert!(defaults.validate().is_err());

        let mut defaults = SessionDefaults::default();
        defaults.connect_attempts = 0;
        assert!(defaults.validate().is_err());

        let mut defaults = SessionDefaults::default();
        defaults.rate = 0;
        assert!(defaults.validate().is_err());
    }

    #[test]
    fn test_load_merges_file_and_env() {
        Jail::expect_with(|jail| {
            jail.create_file(
                DEFAULT_CONFIG_FILE,
                r#"
                    rate = 250
                    connect_attempts = 5
                    log_level = "debug"
                "#,
            )?;
            jail.set_env("DAQ_SESSION_RATE", "500");

            let defaults = SessionDefaults::load(None).map_err(|e| e.to_string())?;
            assert_eq!(defaults.rate, 500);
            assert_eq!(defaults.connect_attempts, 5);
            assert_eq!(defaults.log_level, "debug");
            assert_eq!(defaults.baud, 115_200);
            Ok(())
        });
    }

    #[test]
    fn test_load_rejects_missing_explicit_file() {
        let err = SessionDefaults::load(Some(Path::new("/nonexistent/daq-session.toml")))
            .unwrap_err();
        assert!(matches!(err, SessionError::Config(_)));
    }

    #[test]
    fn test_retry_policy_from_defaults() {
        let policy = SessionDefaults::default().retry_policy();
        assert_eq!(policy.attempts, 3);
        assert_eq!(policy.timeout, Duration::from_millis(5000));
        assert_eq!(policy.retry_delay, Duration::from_millis(500));
    }
}
