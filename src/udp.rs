use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// Outbound datagram sink for media packets.
#[async_trait]
pub trait MediaSocket: Send + Sync {
    async fn send_to(&self, packet: &[u8], target: SocketAddr) -> io::Result<usize>;
}

#[derive(Debug)]
pub struct UdpMediaSocket {
    socket: UdpSocket,
}

impl UdpMediaSocket {
    /// Binds an ephemeral port on all interfaces.
    pub async fn bind() -> io::Result<Self> {
        Self::bind_to(SocketAddr::from(([0, 0, 0, 0], 0))).await
    }

    pub async fn bind_to(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[async_trait]
impl MediaSocket for UdpMediaSocket {
    async fn send_to(&self, packet: &[u8], target: SocketAddr) -> io::Result<usize> {
        let sent = self.socket.send_to(packet, target).await?;
        if sent != packet.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short datagram: {sent} of {} bytes", packet.len()),
            ));
        }
        Ok(sent)
    }
}
