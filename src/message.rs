//! Decoded device messages and their classification.
//!
//! A [`DecodedMessage`] is what the codec hands over for every inbound frame.
//! The controller never keeps one past the handler call.

/// Frame tag assigned by the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageTag {
    /// Sample frame
    Data,
    /// Device metadata frame
    Status,
    /// Acknowledgements and anything else the codec does not interpret
    #[default]
    Other,
}

/// One decoded device frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedMessage {
    /// Codec tag
    pub tag: MessageTag,
    /// Device timestamp; 0 means absent
    pub timestamp: u64,
    /// Raw ADC readings
    pub analog: Vec<i64>,
    /// Scaled ADC readings; preferred over `analog` when non-empty
    pub analog_float: Vec<f64>,
    /// Digital input bitfield, one byte per 8 lines
    pub digital: Vec<u8>,
    /// Number of analog ports on the device
    pub analog_ports: u32,
    /// Number of digital ports on the device
    pub digital_ports: u32,
    /// Firmware revision, when reported
    pub firmware: Option<String>,
    /// Device serial number
    pub serial: String,
}

impl DecodedMessage {
    /// Sample frame with integer readings.
    pub fn samples(timestamp: u64, analog: Vec<i64>) -> Self {
        Self {
            tag: MessageTag::Data,
            timestamp,
            analog,
            ..Default::default()
        }
    }

    /// Sample frame with scaled readings.
    pub fn scaled_samples(timestamp: u64, analog_float: Vec<f64>) -> Self {
        Self {
            tag: MessageTag::Data,
            timestamp,
            analog_float,
            ..Default::default()
        }
    }

    /// Attach a digital bitfield.
    pub fn with_digital(mut self, digital: Vec<u8>) -> Self {
        self.digital = digital;
        self
    }

    /// Device status frame.
    pub fn status(firmware: Option<String>, serial: impl Into<String>) -> Self {
        Self {
            tag: MessageTag::Status,
            firmware,
            serial: serial.into(),
            ..Default::default()
        }
    }

    /// True when the frame carries at least one analog or digital sample.
    pub fn has_samples(&self) -> bool {
        !self.analog.is_empty() || !self.analog_float.is_empty() || !self.digital.is_empty()
    }
}

/// How the controller routes a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Carries samples; formatted onto the data sink
    Stream,
    /// Device metadata, shown only on request
    Status,
    /// Dropped silently
    Other,
}

/// Labels messages as stream, status or other.
///
/// The sample check runs first, so a frame that carries samples is always a
/// stream message even if the codec tagged it as status.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageClassifier {
    show_status: bool,
}

impl MessageClassifier {
    /// `show_status` enables the [`MessageKind::Status`] label.
    pub fn new(show_status: bool) -> Self {
        Self { show_status }
    }

    /// Classify one message.
    pub fn classify(&self, message: &DecodedMessage) -> MessageKind {
        if message.has_samples() {
            MessageKind::Stream
        } else if self.show_status && message.tag == MessageTag::Status {
            MessageKind::Status
        } else {
            MessageKind::Other
        }
    }
}
