//! Device discovery.
//!
//! Network devices answer a UDP broadcast probe with a small JSON document
//! (`{"name":"OpenDAQ-8","port":4242,"serial":"OD-001"}`); the reply's source
//! IP is the device address. Serial devices cannot be probed safely while an
//! experiment may be running, so for those only the port names are listed.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};

/// Datagram payload that asks devices to identify themselves.
pub const DISCOVERY_PROBE: &[u8] = b"DAQ_DISCOVER";

/// A device that answered the discovery probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// Model or user-assigned name
    pub name: String,
    /// Source address of the reply
    pub address: IpAddr,
    /// TCP port the device streams on
    pub port: u16,
    /// Serial number (may be empty)
    pub serial: String,
}

impl fmt::Display for DiscoveredDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}:{}", self.name, self.address, self.port)?;
        if !self.serial.is_empty() {
            write!(f, " serial={}", self.serial)?;
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct DiscoveryReply {
    name: String,
    port: u16,
    #[serde(default)]
    serial: String,
}

/// Broadcast a probe on `discovery_port` and collect replies for `window`.
pub async fn discover_network_devices(
    discovery_port: u16,
    window: Duration,
) -> Result<Vec<DiscoveredDevice>> {
    let broadcast = SocketAddr::from((Ipv4Addr::BROADCAST, discovery_port));
    discover_at(broadcast, window).await
}

/// Send the probe to `destination` (broadcast or unicast) and collect replies
/// until `window` elapses. Duplicate answers from one device are reported once.
pub async fn discover_at(destination: SocketAddr, window: Duration) -> Result<Vec<DiscoveredDevice>> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .context("Failed to bind discovery socket")?;
    socket
        .set_broadcast(true)
        .context("Failed to enable broadcast on discovery socket")?;
    socket
        .send_to(DISCOVERY_PROBE, destination)
        .await
        .with_context(|| format!("Failed to send discovery probe to {}", destination))?;
    tracing::debug!(%destination, ?window, "Discovery probe sent");

    let deadline = Instant::now() + window;
    let mut devices: Vec<DiscoveredDevice> = Vec::new();
    let mut buf = [0u8; 1500];

    loop {
        let (len, from) = match timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Err(_) => break,
            Ok(Ok(received)) => received,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Discovery receive failed");
                break;
            }
        };

        let reply: DiscoveryReply = match serde_json::from_slice(&buf[..len]) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!(%from, error = %e, "Ignoring malformed discovery reply");
                continue;
            }
        };

        let device = DiscoveredDevice {
            name: reply.name,
            address: from.ip(),
            port: reply.port,
            serial: reply.serial,
        };
        let duplicate = devices.iter().any(|known| {
            if device.serial.is_empty() {
                known.address == device.address && known.port == device.port
            } else {
                known.serial == device.serial
            }
        });
        if !duplicate {
            tracing::debug!(%device, "Discovered device");
            devices.push(device);
        }
    }

    Ok(devices)
}

/// Serial ports present on this machine.
#[cfg(feature = "serial")]
pub fn list_serial_ports() -> Result<Vec<String>> {
    crate::connection::serial::available_port_names()
}

/// Serial ports present on this machine.
#[cfg(not(feature = "serial"))]
pub fn list_serial_ports() -> Result<Vec<String>> {
    anyhow::bail!("Serial support not enabled. Rebuild with --features serial")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collects_unique_replies() {
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let device_addr = device.local_addr().unwrap();

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, from) = device.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..len], DISCOVERY_PROBE);

            let reply = br#"{"name":"OpenDAQ-8","port":4242,"serial":"OD-001"}"#;
            device.send_to(reply, from).await.unwrap();
            device.send_to(reply, from).await.unwrap();
            device.send_to(b"garbage", from).await.unwrap();
        });

        let devices = discover_at(device_addr, Duration::from_millis(300))
            .await
            .unwrap();
        responder.await.unwrap();

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "OpenDAQ-8");
        assert_eq!(devices[0].port, 4242);
        assert_eq!(devices[0].address, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(
            devices[0].to_string(),
            "OpenDAQ-8 127.0.0.1:4242 serial=OD-001"
        );
    }

    #[tokio::test]
    async fn silence_yields_empty_list() {
        let quiet = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let devices = discover_at(quiet.local_addr().unwrap(), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(devices.is_empty());
    }
}
