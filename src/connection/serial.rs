//! Serial port transport.
//!
//! Requires the `serial` feature (enabled by default).

use anyhow::{Context, Result};
use tokio::task::spawn_blocking;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// Open a serial port asynchronously using spawn_blocking.
///
/// Opening a port can block on some platforms, so it is kept off the async
/// workers. Standard settings are applied: 8N1, no flow control.
pub async fn open_serial_async(port_path: &str, baud_rate: u32) -> Result<SerialStream> {
    let port_path_owned = port_path.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .with_context(|| {
                format!(
                    "Failed to open serial port {} at {} baud",
                    port_path_owned, baud_rate
                )
            })
    })
    .await
    .context("spawn_blocking for serial port opening failed")?
}

/// Names of the serial ports present on this machine.
pub fn available_port_names() -> Result<Vec<String>> {
    let ports = tokio_serial::available_ports().context("Failed to enumerate serial ports")?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}
