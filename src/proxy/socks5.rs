//! SOCKS5 negotiation on inbound connections
//!
//! Serves the CONNECT subset of RFC 1928 to learn the client's intended
//! target address. No authentication methods besides "no auth" are offered.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::{Error, Result};
use crate::protocol::{encode_reply, socks5, Address};
use crate::shadowsocks::HANDSHAKE_TIMEOUT;

/// Run the SOCKS5 negotiation under the handshake deadline and return the
/// requested target address.
pub async fn negotiate<S>(conn: &mut S) -> Result<Address>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::time::timeout(HANDSHAKE_TIMEOUT, negotiate_inner(conn)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "socks5 negotiation timed out",
        ))),
    }
}

async fn negotiate_inner<S>(conn: &mut S) -> Result<Address>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // +----+----------+----------+
    // |VER | NMETHODS | METHODS  |
    // +----+----------+----------+
    let mut header = [0u8; 2];
    conn.read_exact(&mut header).await?;

    if header[0] != socks5::VERSION {
        return Err(Error::UnsupportedVersion(header[0]));
    }
    let nmethods = header[1] as usize;
    if nmethods == 0 {
        return Err(Error::InvalidMethodsCount);
    }

    let mut methods = vec![0u8; nmethods];
    conn.read_exact(&mut methods).await?;

    if !methods.contains(&socks5::AUTH_NONE) {
        conn.write_all(&[socks5::VERSION, socks5::AUTH_NO_ACCEPTABLE])
            .await?;
        return Err(Error::NoAcceptableMethods);
    }

    conn.write_all(&[socks5::VERSION, socks5::AUTH_NONE]).await?;

    // +----+-----+-------+------+----------+----------+
    // |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
    // +----+-----+-------+------+----------+----------+
    let mut request = [0u8; 3];
    conn.read_exact(&mut request).await?;

    let cmd = request[1];
    if cmd != socks5::CMD_CONNECT {
        conn.write_all(&encode_reply(socks5::REP_CMD_NOT_SUPPORTED))
            .await?;
        return Err(Error::UnsupportedCommand(cmd));
    }

    let target = Address::read_from(conn).await?;
    conn.write_all(&encode_reply(socks5::REP_SUCCESS)).await?;

    trace!(target = %target, "socks5 negotiation complete");
    Ok(target)
}
