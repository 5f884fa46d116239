//! "Open to LAN" announcements so game clients list running servers.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use super::ProtocolError;

pub const LAN_PORT: u16 = 4445;
pub const BROADCAST_INTERVAL: Duration = Duration::from_millis(4000);

/// What one instance announces, and from which local address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanAnnouncement {
    pub message: String,
    pub server_ip: String,
}

impl LanAnnouncement {
    pub fn new(motd: &str, port: &str, server_ip: &str) -> Self {
        Self {
            message: format!("[MOTD]{}[/MOTD][AD]{}[/AD]", motd, port),
            server_ip: server_ip.to_string(),
        }
    }

    fn bind_address(&self) -> Ipv4Addr {
        self.server_ip.trim().parse().unwrap_or(Ipv4Addr::UNSPECIFIED)
    }
}

/// Keeps one broadcast socket per distinct `server-ip`.
#[derive(Default)]
pub struct LanBroadcaster {
    sockets: HashMap<Ipv4Addr, UdpSocket>,
}

impl LanBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn announce(&mut self, announcement: &LanAnnouncement) -> Result<(), ProtocolError> {
        let ip = announcement.bind_address();
        if !self.sockets.contains_key(&ip) {
            let socket = broadcast_socket(ip)?;
            self.sockets.insert(ip, socket);
        }
        let Some(socket) = self.sockets.get(&ip) else {
            return Ok(());
        };
        let target = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, LAN_PORT));
        socket.send_to(announcement.message.as_bytes(), target).await?;
        Ok(())
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }
}

fn broadcast_socket(ip: Ipv4Addr) -> Result<UdpSocket, ProtocolError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::V4(SocketAddrV4::new(ip, LAN_PORT)).into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}
