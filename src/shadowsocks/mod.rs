//! Shadowsocks 2022 wire protocol engine
//!
//! Salted AEAD stream framing over TCP and the separate-header packet
//! scheme over UDP, as negotiated with a 2022-blake3 server.

pub mod cipher;
pub mod datagram;
pub mod stream;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::{Rng, RngCore};

use crate::error::{Error, Result};

/// Stream header types (first byte of the fixed-length header).
pub const HEADER_TYPE_CLIENT_STREAM: u8 = 0x00;
pub const HEADER_TYPE_SERVER_STREAM: u8 = 0x01;

/// Packet header types (first byte of the decrypted UDP body).
pub const HEADER_TYPE_CLIENT_PACKET: u8 = 0x00;
pub const HEADER_TYPE_SERVER_PACKET: u8 = 0x01;

/// Largest payload carried by one framed stream chunk.
pub const MAX_PAYLOAD_LEN: usize = 0xFFFF;

/// Upper bound of the stream-handshake padding length.
pub const MAX_PADDING_LEN: u16 = 900;

/// Cap on the fast-open early read from the inbound connection.
pub const MAX_INITIAL_PAYLOAD_LEN: usize = 8192;

/// Receive buffer size for datagrams.
pub const MAX_UDP_PACKET_LEN: usize = 65_535;

/// Upper bound of the per-packet UDP padding length.
pub const MAX_UDP_PADDING_LEN: u16 = 100;

/// UDP session ids are the first 8 bytes of the separate header.
pub const UDP_SESSION_ID_LEN: usize = 8;

/// Maximum accepted clock skew of a peer timestamp, in seconds.
pub const TIMESTAMP_MAX_SKEW: u64 = 30;

/// Wall-clock budget for the inbound SOCKS5 negotiation.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for early data when fast-open is enabled.
pub const FAST_OPEN_READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Sessions idle longer than this are evicted.
pub const SESSION_IDLE_TIMEOUT_SECS: u64 = 240;

/// How often the session monitor sweeps for idle sessions.
pub const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Current unix time in seconds.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// Reject peer timestamps outside the skew window.
pub(crate) fn validate_timestamp(timestamp: u64) -> Result<()> {
    let diff = unix_now().abs_diff(timestamp);
    if diff > TIMESTAMP_MAX_SKEW {
        return Err(Error::TimestampSkew(diff));
    }
    Ok(())
}

/// Random padding: a 2-byte big-endian length followed by that many random
/// bytes, with the length drawn uniformly from `[min, max]`.
pub(crate) fn padding(min: u16, max: u16) -> Vec<u8> {
    let max = max.min(0xFFFF - 2);
    let len = rand::thread_rng().gen_range(min..=max);
    let mut buf = vec![0u8; 2 + len as usize];
    buf[..2].copy_from_slice(&len.to_be_bytes());
    rand::thread_rng().fill_bytes(&mut buf[2..]);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padding_bounds() {
        for _ in 0..100 {
            let pad = padding(1, MAX_PADDING_LEN);
            let len = u16::from_be_bytes([pad[0], pad[1]]);
            assert!((1..=MAX_PADDING_LEN).contains(&len));
            assert_eq!(pad.len(), 2 + len as usize);
        }
    }

    #[test]
    fn test_timestamp_window() {
        assert!(validate_timestamp(unix_now()).is_ok());
        assert!(validate_timestamp(unix_now() - TIMESTAMP_MAX_SKEW).is_ok());
        let skewed = unix_now() - 60;
        assert!(matches!(
            validate_timestamp(skewed),
            Err(Error::TimestampSkew(_))
        ));
        assert!(validate_timestamp(unix_now() + 60).is_err());
    }
}
