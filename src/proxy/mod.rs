//! Inbound protocol adapters
//!
//! How the client learns where a connection or datagram wants to go:
//! either a SOCKS5 exchange, or a fixed forward address in tunnel mode.

pub mod socks5;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Error, Result};
use crate::protocol::Address;

/// Target discovery for inbound TCP connections.
pub enum TcpHandshake {
    /// Negotiate RFC 1928 CONNECT on the connection.
    Socks5,
    /// Return the configured forward address without reading anything.
    Tunnel(Address),
}

impl TcpHandshake {
    pub async fn handshake<S>(&self, conn: &mut S) -> Result<Address>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match self {
            TcpHandshake::Socks5 => socks5::negotiate(conn).await,
            TcpHandshake::Tunnel(forward) => Ok(forward.clone()),
        }
    }
}

/// Translates between client datagrams and the shadowsocks payload
/// (a SOCKS5-address-then-data tuple) carried inside UDP packets.
pub trait UdpPacketHandler: Send + Sync {
    /// Client datagram → shadowsocks payload.
    fn handle_inbound(&self, packet: &[u8]) -> Result<Vec<u8>>;
    /// Shadowsocks payload → client datagram.
    fn handle_outbound(&self, packet: &[u8]) -> Result<Vec<u8>>;
}

/// SOCKS5 UDP relay framing:
/// `RSV(2) | FRAG(1) | ATYP(1) | DST.ADDR | DST.PORT | DATA`.
pub struct Socks5PacketHandler;

impl UdpPacketHandler for Socks5PacketHandler {
    fn handle_inbound(&self, packet: &[u8]) -> Result<Vec<u8>> {
        if packet.len() < 3 {
            return Err(Error::PacketTooShort {
                need: 3,
                got: packet.len(),
            });
        }
        // Discard RSV and FRAG, keep the address and data
        Ok(packet[3..].to_vec())
    }

    fn handle_outbound(&self, packet: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(3 + packet.len());
        out.extend_from_slice(&[0, 0, 0]); // RSV, FRAG
        out.extend_from_slice(packet);
        Ok(out)
    }
}

/// Tunnel mode: datagrams carry bare payloads; the forward address is
/// fixed by configuration.
pub struct TunnelPacketHandler {
    pub forward: Address,
}

impl UdpPacketHandler for TunnelPacketHandler {
    fn handle_inbound(&self, packet: &[u8]) -> Result<Vec<u8>> {
        let mut out = self.forward.to_bytes();
        out.extend_from_slice(packet);
        Ok(out)
    }

    fn handle_outbound(&self, packet: &[u8]) -> Result<Vec<u8>> {
        let (_, consumed) = Address::decode(packet)?;
        Ok(packet[consumed..].to_vec())
    }
}
