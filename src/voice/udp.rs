use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;

pub const DISCOVERY_PACKET_LEN: usize = 74;
const REQUEST_TYPE: u16 = 0x1;
const RESPONSE_TYPE: u16 = 0x2;
const ADDRESS_LEN: usize = 64;
const ATTEMPTS: u32 = 3;
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("udp io: {0}")]
    Io(#[from] io::Error),
    #[error("no ip discovery response")]
    Timeout,
    #[error("malformed ip discovery response: {0}")]
    Malformed(&'static str),
}

/// Externally visible address as seen by the voice server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalAddress {
    pub ip: String,
    pub port: u16,
}

pub fn discovery_request(ssrc: u32) -> [u8; DISCOVERY_PACKET_LEN] {
    let mut packet = [0u8; DISCOVERY_PACKET_LEN];
    packet[0..2].copy_from_slice(&REQUEST_TYPE.to_be_bytes());
    packet[2..4].copy_from_slice(&70u16.to_be_bytes());
    packet[4..8].copy_from_slice(&ssrc.to_be_bytes());
    packet
}

pub fn parse_discovery_response(packet: &[u8]) -> Result<ExternalAddress, DiscoveryError> {
    if packet.len() < DISCOVERY_PACKET_LEN {
        return Err(DiscoveryError::Malformed("short packet"));
    }
    if u16::from_be_bytes([packet[0], packet[1]]) != RESPONSE_TYPE {
        return Err(DiscoveryError::Malformed("unexpected packet type"));
    }
    let address = &packet[8..8 + ADDRESS_LEN];
    let end = address.iter().position(|&b| b == 0).unwrap_or(ADDRESS_LEN);
    let ip = std::str::from_utf8(&address[..end])
        .map_err(|_| DiscoveryError::Malformed("address is not utf-8"))?;
    if ip.is_empty() {
        return Err(DiscoveryError::Malformed("empty address"));
    }
    let port = u16::from_be_bytes([packet[72], packet[73]]);
    Ok(ExternalAddress {
        ip: ip.to_string(),
        port,
    })
}

/// Learn our external address through the connected voice UDP socket.
pub async fn discover(socket: &UdpSocket, ssrc: u32) -> Result<ExternalAddress, DiscoveryError> {
    let request = discovery_request(ssrc);
    let mut buf = [0u8; 128];
    for attempt in 1..=ATTEMPTS {
        socket.send(&request).await?;
        match tokio::time::timeout(ATTEMPT_TIMEOUT, socket.recv(&mut buf)).await {
            Ok(Ok(n)) => match parse_discovery_response(&buf[..n]) {
                Ok(addr) => return Ok(addr),
                // stray media packets can race the response
                Err(e) => tracing::debug!(attempt, "ignoring packet during ip discovery: {e}"),
            },
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => tracing::debug!(attempt, "ip discovery attempt timed out"),
        }
    }
    Err(DiscoveryError::Timeout)
}
