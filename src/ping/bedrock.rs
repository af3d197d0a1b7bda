//! Bedrock edition unconnected ping (RakNet offline message).

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;

use super::{PingError, PingResponse};

pub const DEFAULT_PORT: u16 = 19132;

const UNCONNECTED_PING: u8 = 0x01;
const UNCONNECTED_PONG: u8 = 0x1c;

/// RakNet offline message magic.
const MAGIC: [u8; 16] = [
    0x00, 0xff, 0xff, 0x00, 0xfe, 0xfe, 0xfe, 0xfe, 0xfd, 0xfd, 0xfd, 0xfd, 0x12, 0x34, 0x56, 0x78,
];

/// id + ping time + server guid + magic + string length.
const PONG_HEADER_LEN: usize = 1 + 8 + 8 + 16 + 2;

pub async fn ping(host: &str, port: u16, timeout: Duration) -> Result<PingResponse, PingError> {
    tokio::time::timeout(timeout, exchange(host, port))
        .await
        .map_err(|_| PingError::Timeout(timeout))?
}

async fn exchange(host: &str, port: u16) -> Result<PingResponse, PingError> {
    let connect_err = |source| PingError::Connect {
        target: format!("{host}:{port}"),
        source,
    };

    let remote = tokio::net::lookup_host((host, port))
        .await
        .map_err(connect_err)?
        .next()
        .ok_or_else(|| {
            connect_err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no addresses resolved",
            ))
        })?;

    let socket = UdpSocket::bind(local_addr_for(&remote)).await?;
    socket.connect(remote).await.map_err(connect_err)?;

    let client_guid = i64::from(std::process::id());
    socket
        .send(&ping_packet(crate::model::epoch_millis(), client_guid))
        .await?;

    let mut buf = [0u8; 2048];
    let n = socket.recv(&mut buf).await?;

    parse_pong(&buf[..n])
}

/// Wildcard local address in the same family as `remote`.
fn local_addr_for(remote: &SocketAddr) -> SocketAddr {
    match remote {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    }
}

fn ping_packet(send_time: i64, client_guid: i64) -> Vec<u8> {
    let mut packet = Vec::with_capacity(1 + 8 + 16 + 8);
    packet.push(UNCONNECTED_PING);
    packet.extend_from_slice(&send_time.to_be_bytes());
    packet.extend_from_slice(&MAGIC);
    packet.extend_from_slice(&client_guid.to_be_bytes());
    packet
}

fn parse_pong(data: &[u8]) -> Result<PingResponse, PingError> {
    if data.len() < PONG_HEADER_LEN {
        return Err(PingError::Malformed(format!(
            "pong too short: {} bytes",
            data.len()
        )));
    }

    if data[0] != UNCONNECTED_PONG {
        return Err(PingError::Malformed(format!(
            "unexpected packet id {:#04x}",
            data[0]
        )));
    }

    if data[17..33] != MAGIC {
        return Err(PingError::Malformed("bad offline message magic".to_string()));
    }

    let len = usize::from(u16::from_be_bytes([data[33], data[34]]));
    let advert = data
        .get(PONG_HEADER_LEN..PONG_HEADER_LEN + len)
        .ok_or_else(|| PingError::Malformed("truncated server advertisement".to_string()))?;
    let advert = std::str::from_utf8(advert)
        .map_err(|e| PingError::Malformed(format!("advertisement is not utf-8: {e}")))?;

    parse_advertisement(advert)
}

/// Parses `MCPE;motd;protocol;version;online;max;...`.
fn parse_advertisement(advert: &str) -> Result<PingResponse, PingError> {
    let fields: Vec<&str> = advert.split(';').collect();

    let online = fields
        .get(4)
        .ok_or_else(|| PingError::Malformed(format!("advertisement has {} fields", fields.len())))?;
    let player_count = online
        .trim()
        .parse::<i64>()
        .map_err(|e| PingError::Malformed(format!("player count {online:?}: {e}")))?;

    let protocol_version = fields.get(2).and_then(|p| p.trim().parse::<i32>().ok());

    Ok(PingResponse {
        player_count,
        protocol_version,
        favicon: None,
    })
}
