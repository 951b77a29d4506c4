//! # DAQ Session Library
//!
//! This crate is the library behind the `daq-session` command. It drives one
//! streaming session against a data-acquisition device: connect, configure,
//! stream under a time or sample bound, then stop and report an exit outcome.
//! Keeping the logic in a library lets the integration tests drive the
//! controller against an in-process mock device.
//!
//! ## Crate Structure
//!
//! - **`config`**: Session parameters (`SessionConfig`, `Target`, `ChannelMask`)
//!   and operator defaults loaded from `daq-session.toml` and `DAQ_SESSION_*`.
//! - **`error`**: The `SessionError` enum and its mapping onto exit outcomes.
//! - **`logging`**: `tracing` subscriber setup; diagnostics go to stderr.
//! - **`message`**: Decoded device messages and the `MessageClassifier`.
//! - **`format`**: `SampleFormatter` for the Text, CSV and JSONL renderings.
//! - **`sink`**: `OutputSink`, a serialized line writer with a lazy CSV header.
//! - **`codec`**: Device commands and the JSON-lines wire codec.
//! - **`connection`**: The `Connection`/`Connector` seams, connect retry, the
//!   TCP and serial line transport, and a scriptable mock device.
//! - **`discovery`**: UDP broadcast discovery and serial port listing.
//! - **`session`**: `SessionController` and `SessionOutcome`.

pub mod codec;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod format;
pub mod logging;
pub mod message;
pub mod session;
pub mod sink;
