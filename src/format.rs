//! Rendering of stream messages into text, CSV and JSON lines.
//!
//! Rust's float formatting always uses `.` as the decimal separator, so every
//! rendering here is locale-invariant.

use crate::config::OutputFormat;
use crate::message::DecodedMessage;
use std::fmt::Write as _;

/// Header emitted once before the first CSV row.
pub const CSV_HEADER: &str = "timestamp,analog_values,digital_hex";

/// Analog values shown in text mode before the list is elided.
pub const TEXT_ANALOG_LIMIT: usize = 8;

/// The numeric source used for one line; floats win, the two never mix.
enum Analog<'a> {
    Float(&'a [f64]),
    Int(&'a [i64]),
    Empty,
}

impl<'a> Analog<'a> {
    fn of(message: &'a DecodedMessage) -> Self {
        if !message.analog_float.is_empty() {
            Analog::Float(&message.analog_float)
        } else if !message.analog.is_empty() {
            Analog::Int(&message.analog)
        } else {
            Analog::Empty
        }
    }
}

/// Renders stream messages in one of the [`OutputFormat`]s.
#[derive(Debug, Clone, Copy)]
pub struct SampleFormatter {
    format: OutputFormat,
}

impl SampleFormatter {
    /// Formatter for `format`.
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Header line the sink must emit before the first row, if any.
    pub fn header(&self) -> Option<&'static str> {
        match self.format {
            OutputFormat::Csv => Some(CSV_HEADER),
            OutputFormat::Text | OutputFormat::Jsonl => None,
        }
    }

    /// Render one message as a single line (no trailing newline).
    pub fn render(&self, message: &DecodedMessage) -> String {
        match self.format {
            OutputFormat::Text => render_text(message),
            OutputFormat::Csv => render_csv(message),
            OutputFormat::Jsonl => render_jsonl(message),
        }
    }
}

fn render_text(message: &DecodedMessage) -> String {
    let mut parts = Vec::with_capacity(3);

    if message.timestamp != 0 {
        parts.push(format!("ts={}", message.timestamp));
    }

    let (shown, total) = match Analog::of(message) {
        Analog::Float(values) => (
            values
                .iter()
                .take(TEXT_ANALOG_LIMIT)
                .map(|v| format!("{:.3}", v))
                .collect::<Vec<_>>(),
            values.len(),
        ),
        Analog::Int(values) => (
            values
                .iter()
                .take(TEXT_ANALOG_LIMIT)
                .map(|v| v.to_string())
                .collect(),
            values.len(),
        ),
        Analog::Empty => (Vec::new(), 0),
    };
    if total > 0 {
        let mut body = shown.join(", ");
        if total > TEXT_ANALOG_LIMIT {
            body.push_str(", ...");
        }
        parts.push(format!("analog=[{}]", body));
    }

    if !message.digital.is_empty() {
        parts.push(format!("digital={}", hex(&message.digital, "-")));
    }

    parts.join(" ")
}

fn render_csv(message: &DecodedMessage) -> String {
    let analog = match Analog::of(message) {
        Analog::Float(values) => join(values.iter().map(|v| format!("{:.6}", v)), ","),
        Analog::Int(values) => join(values.iter().map(|v| v.to_string()), ","),
        Analog::Empty => String::new(),
    };
    format!(
        "{},{},{}",
        message.timestamp,
        analog,
        hex(&message.digital, "")
    )
}

fn render_jsonl(message: &DecodedMessage) -> String {
    let analog = match Analog::of(message) {
        Analog::Float(values) => join(values.iter().map(|v| json_float(*v)), ","),
        Analog::Int(values) => join(values.iter().map(|v| v.to_string()), ","),
        Analog::Empty => String::new(),
    };
    format!(
        r#"{{"ts":{},"analog":[{}],"digital":"{}"}}"#,
        message.timestamp,
        analog,
        hex(&message.digital, "")
    )
}

/// JSON has no NaN/Infinity literals.
fn json_float(value: f64) -> String {
    if value.is_finite() {
        format!("{:.6}", value)
    } else {
        "null".to_string()
    }
}

fn join(items: impl Iterator<Item = String>, sep: &str) -> String {
    items.collect::<Vec<_>>().join(sep)
}

/// Upper-case hex, bytes separated by `sep`.
fn hex(bytes: &[u8], sep: &str) -> String {
    let mut out = String::with_capacity(bytes.len() * (2 + sep.len()));
    for (i, byte) in bytes.iter().enumerate() {
        if i > 0 {
            out.push_str(sep);
        }
        let _ = write!(out, "{:02X}", byte);
    }
    out
}

/// One-line summary of a device status frame.
pub fn render_status(message: &DecodedMessage) -> String {
    format!(
        "device: firmware={} serial={} analog_ports={} digital_ports={}",
        message.firmware.as_deref().unwrap_or("unknown"),
        if message.serial.is_empty() {
            "unknown"
        } else {
            message.serial.as_str()
        },
        message.analog_ports,
        message.digital_ports
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference() -> DecodedMessage {
        DecodedMessage::scaled_samples(42, vec![1.0, 2.5])
    }

    #[test]
    fn reference_message_in_all_formats() {
        let message = reference();
        assert_eq!(
            SampleFormatter::new(OutputFormat::Text).render(&message),
            "ts=42 analog=[1.000, 2.500]"
        );
        assert_eq!(
            SampleFormatter::new(OutputFormat::Csv).render(&message),
            "42,1.000000,2.500000,"
        );
        assert_eq!(
            SampleFormatter::new(OutputFormat::Jsonl).render(&message),
            r#"{"ts":42,"analog":[1.000000,2.500000],"digital":""}"#
        );
    }

    #[test]
    fn text_omits_absent_sections() {
        let formatter = SampleFormatter::new(OutputFormat::Text);

        let message = DecodedMessage::samples(0, vec![3, -4]);
        assert_eq!(formatter.render(&message), "analog=[3, -4]");

        let message = DecodedMessage {
            digital: vec![0x0A, 0xFF],
            ..Default::default()
        };
        assert_eq!(formatter.render(&message), "digital=0A-FF");
    }

    #[test]
    fn text_truncates_after_eight_values() {
        let message = DecodedMessage::samples(7, (1..=10).collect());
        assert_eq!(
            SampleFormatter::new(OutputFormat::Text).render(&message),
            "ts=7 analog=[1, 2, 3, 4, 5, 6, 7, 8, ...]"
        );

        let exactly_eight = DecodedMessage::samples(0, (1..=8).collect());
        assert_eq!(
            SampleFormatter::new(OutputFormat::Text).render(&exactly_eight),
            "analog=[1, 2, 3, 4, 5, 6, 7, 8]"
        );
    }

    #[test]
    fn floats_take_precedence_over_ints() {
        let mut message = DecodedMessage::samples(1, vec![100, 200]);
        message.analog_float = vec![0.25];
        assert_eq!(
            SampleFormatter::new(OutputFormat::Text).render(&message),
            "ts=1 analog=[0.250]"
        );
        assert_eq!(
            SampleFormatter::new(OutputFormat::Csv).render(&message),
            "1,0.250000,"
        );
    }

    #[test]
    fn csv_digital_is_contiguous_hex() {
        let message = DecodedMessage::samples(9, vec![1, 2]).with_digital(vec![0x01, 0xAB]);
        assert_eq!(
            SampleFormatter::new(OutputFormat::Csv).render(&message),
            "9,1,2,01AB"
        );
        assert_eq!(
            SampleFormatter::new(OutputFormat::Text).render(&message),
            "ts=9 analog=[1, 2] digital=01-AB"
        );
    }

    #[test]
    fn jsonl_is_single_compact_line() {
        let message = DecodedMessage::samples(0, vec![5]).with_digital(vec![0xC0]);
        let line = SampleFormatter::new(OutputFormat::Jsonl).render(&message);
        assert_eq!(line, r#"{"ts":0,"analog":[5],"digital":"C0"}"#);
        assert!(!line.contains('\n'));

        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["analog"][0], 5);
    }

    #[test]
    fn jsonl_maps_non_finite_to_null() {
        let message = DecodedMessage::scaled_samples(3, vec![f64::NAN, 1.5]);
        assert_eq!(
            SampleFormatter::new(OutputFormat::Jsonl).render(&message),
            r#"{"ts":3,"analog":[null,1.500000],"digital":""}"#
        );
    }

    #[test]
    fn only_csv_has_a_header() {
        assert_eq!(SampleFormatter::new(OutputFormat::Csv).header(), Some(CSV_HEADER));
        assert_eq!(SampleFormatter::new(OutputFormat::Text).header(), None);
        assert_eq!(SampleFormatter::new(OutputFormat::Jsonl).header(), None);
    }

    #[test]
    fn status_summary() {
        let mut message = DecodedMessage::status(Some("1.4.2".into()), "OD-001");
        message.analog_ports = 8;
        message.digital_ports = 2;
        assert_eq!(
            render_status(&message),
            "device: firmware=1.4.2 serial=OD-001 analog_ports=8 digital_ports=2"
        );
        assert_eq!(
            render_status(&DecodedMessage::status(None, "")),
            "device: firmware=unknown serial=unknown analog_ports=0 digital_ports=0"
        );
    }
}
