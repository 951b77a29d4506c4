//! Device codec.
//!
//! The controller only sees [`DecodedMessage`]s and [`Command`]s; the
//! [`Codec`] trait is the seam between those and bytes on the wire.
//! [`JsonLineCodec`] is the line-delimited JSON dialect spoken by the devices
//! this tool ships with:
//!
//! ```text
//! device -> host   {"type":"data","ts":42,"analog_f":[1.0,2.5],"digital":[10,255]}
//! device -> host   {"type":"status","firmware":"1.4.2","serial":"OD-001","analog_ports":8}
//! host -> device   {"cmd":"enable_channels","mask":[true,false,true]}
//! host -> device   {"cmd":"start","rate":1000}
//! host -> device   {"cmd":"stop"}
//! ```

use crate::config::ChannelMask;
use crate::message::{DecodedMessage, MessageTag};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Control intents the controller sends to the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    /// Enable or disable ADC channels, channel 0 first
    EnableChannels {
        /// Per-channel enable flags
        mask: Vec<bool>,
    },
    /// Begin streaming at `rate` Hz
    Start {
        /// Sample rate in Hz
        rate: u32,
    },
    /// Stop streaming
    Stop,
}

impl Command {
    /// Channel-enable command for a validated mask.
    pub fn enable_channels(mask: &ChannelMask) -> Self {
        Command::EnableChannels {
            mask: mask.channels().to_vec(),
        }
    }

    /// Wire name of the command, for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Command::EnableChannels { .. } => "enable_channels",
            Command::Start { .. } => "start",
            Command::Stop => "stop",
        }
    }
}

/// Frame decoder / command encoder.
pub trait Codec: Send + Sync {
    /// Decode one frame (without its line terminator).
    fn decode(&self, frame: &str) -> Result<DecodedMessage>;

    /// Encode one command, including its terminator.
    fn encode(&self, command: &Command) -> Result<Vec<u8>>;
}

/// Newline-delimited JSON codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLineCodec;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum WireTag {
    Data,
    Status,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct WireFrame {
    #[serde(rename = "type")]
    tag: Option<WireTag>,
    #[serde(default)]
    ts: u64,
    #[serde(default)]
    analog: Vec<i64>,
    #[serde(default)]
    analog_f: Vec<f64>,
    #[serde(default)]
    digital: Vec<u8>,
    #[serde(default)]
    analog_ports: u32,
    #[serde(default)]
    digital_ports: u32,
    #[serde(default)]
    firmware: Option<String>,
    #[serde(default)]
    serial: String,
}

impl From<WireFrame> for DecodedMessage {
    fn from(frame: WireFrame) -> Self {
        let tag = match frame.tag {
            Some(WireTag::Data) => MessageTag::Data,
            Some(WireTag::Status) => MessageTag::Status,
            Some(WireTag::Other) | None => MessageTag::Other,
        };
        DecodedMessage {
            tag,
            timestamp: frame.ts,
            analog: frame.analog,
            analog_float: frame.analog_f,
            digital: frame.digital,
            analog_ports: frame.analog_ports,
            digital_ports: frame.digital_ports,
            firmware: frame.firmware,
            serial: frame.serial,
        }
    }
}

impl Codec for JsonLineCodec {
    fn decode(&self, frame: &str) -> Result<DecodedMessage> {
        let frame: WireFrame = serde_json::from_str(frame.trim())
            .with_context(|| format!("Malformed device frame: {}", frame.trim()))?;
        Ok(frame.into())
    }

    fn encode(&self, command: &Command) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(command)
            .with_context(|| format!("Failed to encode '{}' command", command.name()))?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}
