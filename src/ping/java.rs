//! Java edition server-list ping.
//!
//! Handshake (next state = status), status request, then a single
//! length-prefixed JSON status response.

use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{PingError, PingResponse};

pub const DEFAULT_PORT: u16 = 25565;

/// Protocol version sent in the handshake; -1 asks for the server's own.
const STATUS_PROTOCOL_VERSION: i32 = -1;

/// Status responses carry base64 favicons, so allow a generous size.
const MAX_STATUS_LEN: usize = 2 * 1024 * 1024;

pub async fn ping(host: &str, port: u16, timeout: Duration) -> Result<PingResponse, PingError> {
    tokio::time::timeout(timeout, exchange(host, port))
        .await
        .map_err(|_| PingError::Timeout(timeout))?
}

async fn exchange(host: &str, port: u16) -> Result<PingResponse, PingError> {
    let mut stream = TcpStream::connect((host, port))
        .await
        .map_err(|source| PingError::Connect {
            target: format!("{host}:{port}"),
            source,
        })?;

    stream.write_all(&handshake_packet(host, port)).await?;
    stream.write_all(&status_request_packet()).await?;
    stream.flush().await?;

    read_status(&mut stream).await
}

async fn read_status<R: AsyncRead + Unpin>(reader: &mut R) -> Result<PingResponse, PingError> {
    let _packet_len = read_varint(reader).await?;

    let packet_id = read_varint(reader).await?;
    if packet_id != 0x00 {
        return Err(PingError::Malformed(format!(
            "unexpected packet id {packet_id:#04x}"
        )));
    }

    let json_len = read_varint(reader).await?;
    let json_len = usize::try_from(json_len)
        .map_err(|_| PingError::Malformed(format!("negative status length {json_len}")))?;
    if json_len > MAX_STATUS_LEN {
        return Err(PingError::Malformed(format!(
            "status length {json_len} exceeds {MAX_STATUS_LEN}"
        )));
    }

    let mut json = vec![0u8; json_len];
    reader.read_exact(&mut json).await?;

    parse_status(&json)
}

#[derive(Deserialize)]
struct StatusJson {
    #[serde(default)]
    version: Option<VersionJson>,
    players: PlayersJson,
    #[serde(default)]
    favicon: Option<String>,
}

#[derive(Deserialize)]
struct VersionJson {
    protocol: i32,
}

#[derive(Deserialize)]
struct PlayersJson {
    online: i64,
}

fn parse_status(json: &[u8]) -> Result<PingResponse, PingError> {
    let status: StatusJson = serde_json::from_slice(json)?;

    Ok(PingResponse {
        player_count: status.players.online,
        protocol_version: status.version.map(|v| v.protocol),
        favicon: status.favicon,
    })
}

fn handshake_packet(host: &str, port: u16) -> Vec<u8> {
    let mut body = Vec::with_capacity(16 + host.len());
    write_varint(&mut body, 0x00);
    write_varint(&mut body, STATUS_PROTOCOL_VERSION);
    write_varint(&mut body, host.len() as i32);
    body.extend_from_slice(host.as_bytes());
    body.extend_from_slice(&port.to_be_bytes());
    write_varint(&mut body, 1);

    let mut packet = Vec::with_capacity(body.len() + 5);
    write_varint(&mut packet, body.len() as i32);
    packet.extend_from_slice(&body);
    packet
}

fn status_request_packet() -> [u8; 2] {
    [0x01, 0x00]
}

fn write_varint(buf: &mut Vec<u8>, value: i32) {
    let mut v = value as u32;
    loop {
        if v & !0x7f == 0 {
            buf.push(v as u8);
            return;
        }
        buf.push(((v & 0x7f) | 0x80) as u8);
        v >>= 7;
    }
}

async fn read_varint<R: AsyncRead + Unpin>(reader: &mut R) -> Result<i32, PingError> {
    let mut value: u32 = 0;
    for i in 0..5 {
        let byte = reader.read_u8().await?;
        value |= u32::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value as i32);
        }
    }
    Err(PingError::Malformed("varint longer than 5 bytes".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: i32) -> Vec<u8> {
        let mut buf = Vec::new();
        write_varint(&mut buf, value);
        buf
    }

    #[test]
    fn test_write_varint_known_values() {
        assert_eq!(encode(0), vec![0x00]);
        assert_eq!(encode(1), vec![0x01]);
        assert_eq!(encode(127), vec![0x7f]);
        assert_eq!(encode(128), vec![0x80, 0x01]);
        assert_eq!(encode(25565), vec![0xdd, 0xc7, 0x01]);
        assert_eq!(encode(-1), vec![0xff, 0xff, 0xff, 0xff, 0x0f]);
    }

    #[tokio::test]
    async fn test_read_varint_known_values() {
        let mut data: &[u8] = &[0xdd, 0xc7, 0x01];
        assert_eq!(read_varint(&mut data).await.expect("valid varint"), 25565);

        let mut data: &[u8] = &[0xff, 0xff, 0xff, 0xff, 0x0f];
        assert_eq!(read_varint(&mut data).await.expect("valid varint"), -1);
    }

    #[tokio::test]
    async fn test_read_varint_too_long() {
        let mut data: &[u8] = &[0xff, 0xff, 0xff, 0xff, 0xff, 0x01];
        assert!(matches!(
            read_varint(&mut data).await,
            Err(PingError::Malformed(_))
        ));
    }

    #[test]
    fn test_handshake_packet_layout() {
        let packet = handshake_packet("mc.local", 25565);
        // length prefix, then packet id 0x00
        assert_eq!(packet[0] as usize, packet.len() - 1);
        assert_eq!(packet[1], 0x00);
        // protocol version -1
        assert_eq!(&packet[2..7], &[0xff, 0xff, 0xff, 0xff, 0x0f]);
        // host
        assert_eq!(packet[7], 8);
        assert_eq!(&packet[8..16], b"mc.local");
        // port, then next state
        assert_eq!(&packet[16..18], &25565u16.to_be_bytes());
        assert_eq!(packet[18], 0x01);
    }

    #[test]
    fn test_parse_status_full() {
        let json = br#"{"version":{"name":"1.20.4","protocol":765},"players":{"max":100,"online":37},"description":"hi","favicon":"data:image/png;base64,AAAA"}"#;
        let resp = parse_status(json).expect("valid status");
        assert_eq!(resp.player_count, 37);
        assert_eq!(resp.protocol_version, Some(765));
        assert_eq!(resp.favicon.as_deref(), Some("data:image/png;base64,AAAA"));
    }

    #[test]
    fn test_parse_status_minimal() {
        let resp = parse_status(br#"{"players":{"online":-3}}"#).expect("valid status");
        assert_eq!(resp.player_count, -3);
        assert_eq!(resp.protocol_version, None);
        assert_eq!(resp.favicon, None);
    }

    #[test]
    fn test_parse_status_missing_players() {
        assert!(matches!(
            parse_status(br#"{"version":{"protocol":1}}"#),
            Err(PingError::Json(_))
        ));
    }

    #[tokio::test]
    async fn test_read_status_frame() {
        let json = br#"{"players":{"online":5}}"#;
        let mut body = Vec::new();
        write_varint(&mut body, 0x00);
        write_varint(&mut body, json.len() as i32);
        body.extend_from_slice(json);
        let mut frame = Vec::new();
        write_varint(&mut frame, body.len() as i32);
        frame.extend_from_slice(&body);

        let mut reader: &[u8] = &frame;
        let resp = read_status(&mut reader).await.expect("valid frame");
        assert_eq!(resp.player_count, 5);
    }

    #[tokio::test]
    async fn test_read_status_rejects_wrong_packet_id() {
        let mut reader: &[u8] = &[0x02, 0x01, 0x00];
        assert!(matches!(
            read_status(&mut reader).await,
            Err(PingError::Malformed(_))
        ));
    }
}
