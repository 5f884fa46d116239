//! Server list ping, the pre-netty `0xFE 0x01` flavour.
//!
//! The reply is a kick packet (`0xFF`, u16 length, UTF-16BE string). Servers
//! from 1.4 on answer with `§1\0protocol\0version\0motd\0online\0max`; older
//! ones with `motd§online§max`. Both are accepted.

use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::ProtocolError;

pub const PING_TIMEOUT: Duration = Duration::from_millis(2500);

const STATUS_REQUEST: [u8; 2] = [0xFE, 0x01];
const LEGACY_DELIMITER: u8 = 0xA7;
const HEADER_LEN: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResult {
    pub protocol: Option<i32>,
    pub server_version: Option<String>,
    pub motd: String,
    pub players_online: i32,
    pub players_max: i32,
}

pub fn status_request() -> [u8; 2] {
    STATUS_REQUEST
}

/// Decode one reply buffer, trying the modern layout first.
pub fn decode_status(data: &[u8]) -> Result<PingResult, ProtocolError> {
    decode_modern(data)
        .or_else(|| decode_legacy(data))
        .ok_or_else(|| ProtocolError::Malformed(format!("unrecognized ping reply ({} bytes)", data.len())))
}

fn decode_modern(data: &[u8]) -> Option<PingResult> {
    let body = data.get(HEADER_LEN..)?;
    let even = &body[..body.len() - body.len() % 2];
    let units: Vec<u16> = even.chunks_exact(2).map(BigEndian::read_u16).collect();
    let text = String::from_utf16_lossy(&units);

    // first field is the "§1" marker
    let fields: Vec<&str> = text.split('\0').skip(1).collect();
    if fields.len() != 5 {
        return None;
    }
    Some(PingResult {
        protocol: fields[0].trim().parse().ok(),
        server_version: Some(fields[1].to_string()),
        motd: fields[2].to_string(),
        players_online: fields[3].trim().parse().ok()?,
        players_max: fields[4].trim().parse().ok()?,
    })
}

fn decode_legacy(data: &[u8]) -> Option<PingResult> {
    let parts = split_on_delimiter(data, LEGACY_DELIMITER);
    if parts.len() != 3 {
        return None;
    }
    // part 0 still carries the kick header and the high byte of the delimiter
    let motd_bytes = parts[0].get(HEADER_LEN..parts[0].len().saturating_sub(1)).unwrap_or(&[]);
    Some(PingResult {
        protocol: None,
        server_version: None,
        motd: ascii_without_nuls(motd_bytes),
        players_online: ascii_without_nuls(parts[1]).trim().parse().ok()?,
        players_max: ascii_without_nuls(parts[2]).trim().parse().ok()?,
    })
}

/// Split on `delimiter`. One at offset 0 is skipped, and an empty tail is not a part.
fn split_on_delimiter(data: &[u8], delimiter: u8) -> Vec<&[u8]> {
    let mut parts = Vec::new();
    let mut start = 0;
    for (i, b) in data.iter().enumerate() {
        if *b != delimiter {
            continue;
        }
        if i == 0 {
            start = 1;
            continue;
        }
        parts.push(&data[start..i]);
        start = i + 1;
    }
    if start < data.len() {
        parts.push(&data[start..]);
    }
    parts
}

fn ascii_without_nuls(bytes: &[u8]) -> String {
    bytes
        .iter()
        .filter(|b| **b != 0)
        .map(|b| (*b & 0x7F) as char)
        .collect()
}

/// One status round trip against `host:port`. No retry.
pub async fn ping(host: &str, port: u16) -> Result<PingResult, ProtocolError> {
    ping_with_timeout(host, port, PING_TIMEOUT).await
}

pub async fn ping_with_timeout(host: &str, port: u16, timeout: Duration) -> Result<PingResult, ProtocolError> {
    let addr = format!("{}:{}", host, port);
    let exchange = async {
        let mut stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| ProtocolError::ConnectionError(format!("Failed to connect to {}: {}", addr, e)))?;
        stream.write_all(&STATUS_REQUEST).await?;

        let mut buf = vec![0u8; 1024];
        let n = stream.read(&mut buf).await?;
        let _ = stream.shutdown().await;
        if n == 0 {
            return Err(ProtocolError::Malformed(format!("{} closed without replying", addr)));
        }
        decode_status(&buf[..n])
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| ProtocolError::TimeoutError(format!("ping to {} after {:?}", addr, timeout)))?
}
