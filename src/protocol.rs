//! Wire protocol encoding/decoding
//!
//! Implements the SOCKS5 address triple shared by the negotiator and the
//! Shadowsocks framer:
//! - `[ATYP(1)][ADDR(4 / 1+N / 16)][PORT(2 BE)]`

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::BufMut;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

/// SOCKS5 protocol constants
pub mod socks5 {
    /// SOCKS5 version
    pub const VERSION: u8 = 0x05;

    /// Authentication methods
    pub const AUTH_NONE: u8 = 0x00;
    pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

    /// Commands
    pub const CMD_CONNECT: u8 = 0x01;

    /// Address types
    pub const ATYP_IPV4: u8 = 0x01;
    pub const ATYP_DOMAIN: u8 = 0x03;
    pub const ATYP_IPV6: u8 = 0x04;

    /// Reply codes
    pub const REP_SUCCESS: u8 = 0x00;
    pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
}

/// A target address as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Ipv4(Ipv4Addr, u16),
    Ipv6(Ipv6Addr, u16),
    Domain(String, u16),
}

impl Address {
    /// Parse a textual `host:port` pair. The host becomes an IP variant if
    /// it parses as one, a domain name otherwise. An empty host fails.
    pub fn parse(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or(Error::MalformedAddress("missing port"))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::MalformedAddress("invalid port"))?;

        // Bracketed IPv6 literals ("[::1]:80")
        let host = host
            .strip_prefix('[')
            .map_or(host, |h| h.strip_suffix(']').unwrap_or(h));

        if host.is_empty() {
            return Err(Error::MalformedAddress("empty host"));
        }

        match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => Ok(Address::Ipv4(ip, port)),
            Ok(IpAddr::V6(ip)) => Ok(Address::Ipv6(ip, port)),
            Err(_) => {
                if host.len() > 255 {
                    return Err(Error::MalformedAddress("domain too long"));
                }
                Ok(Address::Domain(host.to_string(), port))
            }
        }
    }

    /// Read an address from a stream: type byte, payload, big-endian port.
    /// A stream that ends mid-address is malformed, not a disconnect.
    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self> {
        let atyp = r.read_u8().await.map_err(short_read)?;
        match atyp {
            socks5::ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                r.read_exact(&mut octets).await.map_err(short_read)?;
                let port = r.read_u16().await.map_err(short_read)?;
                Ok(Address::Ipv4(Ipv4Addr::from(octets), port))
            }
            socks5::ATYP_DOMAIN => {
                let len = r.read_u8().await.map_err(short_read)? as usize;
                if len == 0 {
                    return Err(Error::MalformedAddress("empty domain"));
                }
                let mut name = vec![0u8; len];
                r.read_exact(&mut name).await.map_err(short_read)?;
                let name = String::from_utf8(name)
                    .map_err(|_| Error::MalformedAddress("domain is not utf-8"))?;
                let port = r.read_u16().await.map_err(short_read)?;
                Ok(Address::Domain(name, port))
            }
            socks5::ATYP_IPV6 => {
                let mut octets = [0u8; 16];
                r.read_exact(&mut octets).await.map_err(short_read)?;
                let port = r.read_u16().await.map_err(short_read)?;
                Ok(Address::Ipv6(Ipv6Addr::from(octets), port))
            }
            _ => Err(Error::MalformedAddress("unknown address type")),
        }
    }

    /// Decode an address from the front of a buffer.
    ///
    /// Returns the address and the number of bytes consumed. Used on the
    /// datagram path where the whole packet is already in memory.
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        let too_short = |need: usize| Error::PacketTooShort {
            need,
            got: data.len(),
        };

        let atyp = *data.first().ok_or_else(|| too_short(1))?;
        match atyp {
            socks5::ATYP_IPV4 => {
                if data.len() < 7 {
                    return Err(too_short(7));
                }
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&data[1..5]);
                let port = u16::from_be_bytes([data[5], data[6]]);
                Ok((Address::Ipv4(Ipv4Addr::from(octets), port), 7))
            }
            socks5::ATYP_DOMAIN => {
                if data.len() < 2 {
                    return Err(too_short(2));
                }
                let len = data[1] as usize;
                let total = 2 + len + 2;
                if data.len() < total {
                    return Err(too_short(total));
                }
                let name = String::from_utf8(data[2..2 + len].to_vec())
                    .map_err(|_| Error::MalformedAddress("domain is not utf-8"))?;
                let port = u16::from_be_bytes([data[2 + len], data[3 + len]]);
                Ok((Address::Domain(name, port), total))
            }
            socks5::ATYP_IPV6 => {
                if data.len() < 19 {
                    return Err(too_short(19));
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&data[1..17]);
                let port = u16::from_be_bytes([data[17], data[18]]);
                Ok((Address::Ipv6(Ipv6Addr::from(octets), port), 19))
            }
            _ => Err(Error::MalformedAddress("unknown address type")),
        }
    }

    /// Encode to a freshly allocated byte sequence.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.write_bytes(&mut buf);
        buf
    }

    /// Append the wire encoding to `buf`.
    pub fn write_bytes(&self, buf: &mut Vec<u8>) {
        match self {
            Address::Ipv4(ip, port) => {
                buf.push(socks5::ATYP_IPV4);
                buf.extend_from_slice(&ip.octets());
                buf.put_u16(*port);
            }
            Address::Domain(name, port) => {
                buf.push(socks5::ATYP_DOMAIN);
                buf.push(name.len() as u8);
                buf.extend_from_slice(name.as_bytes());
                buf.put_u16(*port);
            }
            Address::Ipv6(ip, port) => {
                buf.push(socks5::ATYP_IPV6);
                buf.extend_from_slice(&ip.octets());
                buf.put_u16(*port);
            }
        }
    }

    /// Length of the wire encoding.
    pub fn encoded_len(&self) -> usize {
        match self {
            Address::Ipv4(..) => 1 + 4 + 2,
            Address::Domain(name, _) => 1 + 1 + name.len() + 2,
            Address::Ipv6(..) => 1 + 16 + 2,
        }
    }

}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Ipv4(ip, port) => write!(f, "{}:{}", ip, port),
            Address::Ipv6(ip, port) => write!(f, "[{}]:{}", ip, port),
            Address::Domain(name, port) => write!(f, "{}:{}", name, port),
        }
    }
}

fn short_read(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::MalformedAddress("short read")
    } else {
        Error::Io(e)
    }
}

/// Encode a SOCKS5 reply with the given reply code and an all-zero
/// IPv4 bind address.
pub fn encode_reply(rep: u8) -> Vec<u8> {
    let mut buf = Vec::with_capacity(10);
    buf.push(socks5::VERSION);
    buf.push(rep);
    buf.push(0x00); // Reserved
    Address::Ipv4(Ipv4Addr::UNSPECIFIED, 0).write_bytes(&mut buf);
    buf
}
