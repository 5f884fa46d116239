//! GameSpy4 "full stat" query over UDP (`enable-query=true` servers).

use std::collections::BTreeMap;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;

use super::ProtocolError;

pub const QUERY_TIMEOUT: Duration = Duration::from_millis(2500);

const MAGIC: [u8; 2] = [0xFE, 0xFD];
const TYPE_HANDSHAKE: u8 = 0x09;
const TYPE_STAT: u8 = 0x00;
/// type + session id + `splitnum\0\x80\0`
const FULL_STAT_HEADER: usize = 16;
const PLAYER_MARKER: &[u8] = b"\x01player_";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullStat {
    /// hostname, gametype, version, plugins, map, numplayers, maxplayers, ...
    #[serde(flatten)]
    pub info: BTreeMap<String, String>,
    pub players: Vec<String>,
}

fn session_id() -> u32 {
    (uuid::Uuid::new_v4().as_u128() as u32) & 0x0F0F_0F0F
}

pub fn handshake_request(session: u32) -> Vec<u8> {
    let mut packet = Vec::with_capacity(7);
    packet.extend_from_slice(&MAGIC);
    packet.push(TYPE_HANDSHAKE);
    let mut id = [0u8; 4];
    BigEndian::write_u32(&mut id, session);
    packet.extend_from_slice(&id);
    packet
}

pub fn full_stat_request(session: u32, challenge: i32) -> Vec<u8> {
    let mut packet = Vec::with_capacity(15);
    packet.extend_from_slice(&MAGIC);
    packet.push(TYPE_STAT);
    let mut buf = [0u8; 4];
    BigEndian::write_u32(&mut buf, session);
    packet.extend_from_slice(&buf);
    BigEndian::write_i32(&mut buf, challenge);
    packet.extend_from_slice(&buf);
    // padding selects the full stat instead of the basic one
    packet.extend_from_slice(&[0, 0, 0, 0]);
    packet
}

/// Challenge token from a handshake reply: `09 <session> <ascii digits> 00`.
pub fn decode_challenge(data: &[u8]) -> Result<i32, ProtocolError> {
    if data.len() < 6 || data[0] != TYPE_HANDSHAKE {
        return Err(ProtocolError::Malformed("bad handshake reply".into()));
    }
    let token = data[5..].split(|b| *b == 0).next().unwrap_or(&[]);
    std::str::from_utf8(token)
        .ok()
        .and_then(|s| s.trim().parse::<i32>().ok())
        .ok_or_else(|| ProtocolError::Malformed("challenge token is not a number".into()))
}

pub fn decode_full_stat(data: &[u8]) -> Result<FullStat, ProtocolError> {
    if data.len() < FULL_STAT_HEADER || data[0] != TYPE_STAT {
        return Err(ProtocolError::Malformed("bad full stat reply".into()));
    }
    let mut fields = data[FULL_STAT_HEADER..].split(|b| *b == 0);
    let mut stat = FullStat::default();

    loop {
        let key = fields
            .next()
            .ok_or_else(|| ProtocolError::Malformed("unterminated key/value section".into()))?;
        if key.is_empty() {
            break;
        }
        let value = fields.next().unwrap_or(&[]);
        stat.info.insert(text(key), text(value));
    }

    if fields.next() != Some(PLAYER_MARKER) {
        return Ok(stat);
    }
    fields.next();
    stat.players = fields.take_while(|name| !name.is_empty()).map(text).collect();
    Ok(stat)
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Handshake plus full stat against `host:port`.
pub async fn full_stat(host: &str, port: u16) -> Result<FullStat, ProtocolError> {
    let addr = format!("{}:{}", host, port);
    let exchange = async {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket
            .connect(&addr)
            .await
            .map_err(|e| ProtocolError::ConnectionError(format!("Failed to reach {}: {}", addr, e)))?;

        let session = session_id();
        let mut buf = vec![0u8; 4096];

        socket.send(&handshake_request(session)).await?;
        let n = socket.recv(&mut buf).await?;
        let challenge = decode_challenge(&buf[..n])?;

        socket.send(&full_stat_request(session, challenge)).await?;
        let n = socket.recv(&mut buf).await?;
        decode_full_stat(&buf[..n])
    };

    tokio::time::timeout(QUERY_TIMEOUT, exchange)
        .await
        .map_err(|_| ProtocolError::TimeoutError(format!("query to {}", addr)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_stat_reply(session: u32) -> Vec<u8> {
        let mut reply = vec![TYPE_STAT];
        let mut id = [0u8; 4];
        BigEndian::write_u32(&mut id, session);
        reply.extend_from_slice(&id);
        reply.extend_from_slice(b"splitnum\0\x80\0");
        reply.extend_from_slice(b"hostname\0A Server\0numplayers\x002\0maxplayers\x0020\0\0");
        reply.extend_from_slice(b"\x01player_\0\0Steve\0Alex\0\0");
        reply
    }

    #[test]
    fn requests_are_well_formed() {
        let hs = handshake_request(0x0102_0304);
        assert_eq!(hs, vec![0xFE, 0xFD, 0x09, 1, 2, 3, 4]);

        let fs = full_stat_request(1, 9_513_307);
        assert_eq!(fs.len(), 15);
        assert_eq!(&fs[..3], &[0xFE, 0xFD, 0x00]);
        assert_eq!(BigEndian::read_i32(&fs[7..11]), 9_513_307);
        assert_eq!(&fs[11..], &[0, 0, 0, 0]);
    }

    #[test]
    fn decodes_challenge() {
        let mut reply = vec![0x09, 0, 0, 0, 1];
        reply.extend_from_slice(b"-1234567\0");
        assert_eq!(decode_challenge(&reply).unwrap(), -1_234_567);
        assert!(decode_challenge(b"\x09\0\0\0\x01abc\0").is_err());
    }

    #[test]
    fn decodes_full_stat() {
        let stat = decode_full_stat(&full_stat_reply(7)).unwrap();
        assert_eq!(stat.info.get("hostname").map(String::as_str), Some("A Server"));
        assert_eq!(stat.info.get("maxplayers").map(String::as_str), Some("20"));
        assert_eq!(stat.players, vec!["Steve", "Alex"]);
    }

    #[test]
    fn full_stat_without_player_section() {
        let mut reply = full_stat_reply(7);
        let cut = reply.len() - b"\x01player_\0\0Steve\0Alex\0\0".len();
        reply.truncate(cut);
        let stat = decode_full_stat(&reply).unwrap();
        assert!(stat.players.is_empty());
        assert_eq!(stat.info.len(), 3);
    }

    #[tokio::test]
    async fn round_trip_against_fake_server() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();

        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (_, peer) = server.recv_from(&mut buf).await.unwrap();
            let session = BigEndian::read_u32(&buf[3..7]);
            let mut reply = vec![0x09];
            reply.extend_from_slice(&buf[3..7]);
            reply.extend_from_slice(b"42\0");
            server.send_to(&reply, peer).await.unwrap();

            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(n, 15);
            assert_eq!(BigEndian::read_i32(&buf[7..11]), 42);
            server.send_to(&full_stat_reply(session), peer).await.unwrap();
        });

        let stat = full_stat("127.0.0.1", port).await.unwrap();
        assert_eq!(stat.players.len(), 2);
    }
}
