//! Stream engine
//!
//! Establishes an authenticated TCP stream to the server, performs the
//! request/response handshake, frames payloads as length-prefixed AEAD
//! chunks, and bridges the inbound application connection to the remote.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::debug;

use crate::config::CipherMethod;
use crate::error::{Error, Result};
use crate::protocol::Address;
use crate::shadowsocks::cipher::{new_salt, Cipher};
use crate::shadowsocks::{
    padding, unix_now, validate_timestamp, FAST_OPEN_READ_TIMEOUT, HEADER_TYPE_CLIENT_STREAM,
    HEADER_TYPE_SERVER_STREAM, MAX_INITIAL_PAYLOAD_LEN, MAX_PADDING_LEN, MAX_PAYLOAD_LEN,
};

/// An authenticated stream to the Shadowsocks server, before it is split
/// for bidirectional relaying.
pub struct ShadowTcpStream {
    conn: TcpStream,
    encrypt: Arc<Cipher>,
}

impl ShadowTcpStream {
    /// Dial the server and set up the encrypt context with a fresh salt.
    pub async fn connect(server: SocketAddr, key: &[u8], method: CipherMethod) -> Result<Self> {
        let conn = TcpStream::connect(server).await?;
        conn.set_nodelay(true).ok();
        Self::new(conn, key, method)
    }

    pub fn new(conn: TcpStream, key: &[u8], method: CipherMethod) -> Result<Self> {
        let salt = new_salt(key.len());
        let encrypt = Cipher::new(key, &salt, method)?;
        Ok(Self {
            conn,
            encrypt: Arc::new(encrypt),
        })
    }

    /// Transmit the client handshake record:
    /// `salt || Seal(fixed_header) || Seal(variable_header)`.
    pub async fn write_client_handshake(
        &mut self,
        target: &Address,
        initial_payload: &[u8],
    ) -> Result<()> {
        let vlh = build_request_vlh(target, initial_payload);
        let flh = build_request_flh(vlh.len() as u16);

        let overhead = self.encrypt.overhead();
        let mut record =
            Vec::with_capacity(self.encrypt.salt().len() + flh.len() + vlh.len() + 2 * overhead);
        record.extend_from_slice(self.encrypt.salt());
        self.encrypt.seal_into(&mut record, &flh)?;
        self.encrypt.seal_into(&mut record, &vlh)?;

        self.conn.write_all(&record).await?;
        Ok(())
    }

    /// Split into halves, one cipher context per direction. The decrypt
    /// context is created lazily by the read half from the first server
    /// record.
    pub fn into_split(self) -> (ShadowReadHalf, ShadowWriteHalf) {
        let (read, write) = self.conn.into_split();
        (
            ShadowReadHalf {
                conn: read,
                encrypt: self.encrypt.clone(),
                decrypt: None,
                early: Vec::new(),
                scratch: Vec::new(),
            },
            ShadowWriteHalf {
                conn: write,
                cipher: self.encrypt,
            },
        )
    }
}

/// Server-to-client direction of an established stream.
pub struct ShadowReadHalf {
    conn: OwnedReadHalf,
    encrypt: Arc<Cipher>,
    decrypt: Option<Cipher>,
    early: Vec<u8>,
    scratch: Vec<u8>,
}

impl ShadowReadHalf {
    /// Read and validate the server handshake, creating the decrypt
    /// context. One-shot: called on the first `read_chunk`.
    async fn read_server_handshake(&mut self) -> Result<()> {
        let salt_len = self.encrypt.salt().len();
        let overhead = self.encrypt.overhead();

        // salt || Seal(type || timestamp || request-salt || length)
        let mut record = vec![0u8; salt_len + 1 + 8 + salt_len + 2 + overhead];
        self.conn.read_exact(&mut record).await?;

        let decrypt = self.encrypt.renew(&record[..salt_len])?;
        let header = decrypt.open(&record[salt_len..])?;

        if header[0] != HEADER_TYPE_SERVER_STREAM {
            return Err(Error::HeaderTypeMismatch {
                expected: HEADER_TYPE_SERVER_STREAM,
                got: header[0],
            });
        }

        let mut timestamp = [0u8; 8];
        timestamp.copy_from_slice(&header[1..9]);
        validate_timestamp(u64::from_be_bytes(timestamp))?;

        if header[9..9 + salt_len] != *self.encrypt.salt() {
            return Err(Error::SaltMismatch);
        }

        let early_len = u16::from_be_bytes([header[9 + salt_len], header[10 + salt_len]]) as usize;
        if early_len > 0 {
            let mut body = vec![0u8; early_len + overhead];
            self.conn.read_exact(&mut body).await?;
            self.early = decrypt.open(&body)?;
        }

        self.decrypt = Some(decrypt);
        Ok(())
    }

    /// Read one framed chunk. `Ok(None)` means the peer ended the stream.
    ///
    /// Any early-response payload from the handshake surfaces before the
    /// first framed chunk.
    pub async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        if self.decrypt.is_none() {
            self.read_server_handshake().await?;
        }
        if !self.early.is_empty() {
            return Ok(Some(std::mem::take(&mut self.early)));
        }

        let overhead = self.encrypt.overhead();
        self.scratch.resize(2 + overhead, 0);
        match self.conn.read_exact(&mut self.scratch).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let decrypt = self.decrypt.as_ref().ok_or(Error::AeadOpenFailed)?;
        let len_chunk = decrypt.open(&self.scratch)?;
        let payload_len = u16::from_be_bytes([len_chunk[0], len_chunk[1]]) as usize;
        if payload_len == 0 {
            return Ok(None);
        }

        self.scratch.resize(payload_len + overhead, 0);
        self.conn.read_exact(&mut self.scratch).await?;

        let decrypt = self.decrypt.as_ref().ok_or(Error::AeadOpenFailed)?;
        let payload = decrypt.open(&self.scratch)?;
        Ok(Some(payload))
    }
}

/// Client-to-server direction of an established stream.
pub struct ShadowWriteHalf {
    conn: OwnedWriteHalf,
    cipher: Arc<Cipher>,
}

impl ShadowWriteHalf {
    /// Write one framed chunk: `Seal(length) || Seal(payload)`.
    pub async fn write_chunk(&mut self, payload: &[u8]) -> Result<()> {
        let len = (payload.len() as u16).to_be_bytes();
        let mut record = Vec::with_capacity(2 + payload.len() + 2 * self.cipher.overhead());
        self.cipher.seal_into(&mut record, &len)?;
        self.cipher.seal_into(&mut record, payload)?;
        self.conn.write_all(&record).await?;
        Ok(())
    }
}

/// Relay payloads between the inbound connection and the remote stream
/// until either side ends or shutdown fires. Whichever direction finishes
/// first tears down both endpoints.
pub async fn bridge(
    remote: ShadowTcpStream,
    mut inbound: TcpStream,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let (mut remote_read, mut remote_write) = remote.into_split();
    let (mut local_read, mut local_write) = inbound.split();

    let inbound_to_remote = async {
        let mut buf = vec![0u8; MAX_PAYLOAD_LEN];
        loop {
            let n = local_read.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            remote_write.write_chunk(&buf[..n]).await?;
        }
        Ok::<(), Error>(())
    };

    let remote_to_inbound = async {
        while let Some(chunk) = remote_read.read_chunk().await? {
            local_write.write_all(&chunk).await?;
        }
        Ok::<(), Error>(())
    };

    let result = tokio::select! {
        r = inbound_to_remote => r,
        r = remote_to_inbound => r,
        _ = shutdown.recv() => Err(Error::Cancelled),
    };

    debug!("stream bridge closed");
    result
}

/// Wait up to the fast-open deadline for early data on the inbound
/// connection. An expired deadline yields an empty payload.
pub async fn read_initial_payload(conn: &mut TcpStream) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; MAX_INITIAL_PAYLOAD_LEN];
    match tokio::time::timeout(FAST_OPEN_READ_TIMEOUT, conn.read(&mut buf)).await {
        Ok(Ok(n)) => {
            buf.truncate(n);
            Ok(buf)
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Ok(Vec::new()),
    }
}

/// variable_header: address || padding || initial_payload
fn build_request_vlh(target: &Address, initial_payload: &[u8]) -> Vec<u8> {
    let mut vlh = target.to_bytes();
    vlh.extend_from_slice(&padding(1, MAX_PADDING_LEN));
    vlh.extend_from_slice(initial_payload);
    vlh
}

/// fixed_header: type || 8-byte timestamp || 2-byte vlh length
fn build_request_flh(vlh_len: u16) -> [u8; 11] {
    let mut flh = [0u8; 11];
    flh[0] = HEADER_TYPE_CLIENT_STREAM;
    flh[1..9].copy_from_slice(&unix_now().to_be_bytes());
    flh[9..11].copy_from_slice(&vlh_len.to_be_bytes());
    flh
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_request_flh_layout() {
        let flh = build_request_flh(0x1234);
        assert_eq!(flh[0], HEADER_TYPE_CLIENT_STREAM);
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&flh[1..9]);
        assert!(unix_now().abs_diff(u64::from_be_bytes(ts)) <= 1);
        assert_eq!(&flh[9..11], &[0x12, 0x34]);
    }

    #[test]
    fn test_request_vlh_layout() {
        let target = Address::Ipv4(Ipv4Addr::new(127, 0, 0, 1), 8080);
        let payload = b"early";
        let vlh = build_request_vlh(&target, payload);

        let addr_len = target.encoded_len();
        assert_eq!(&vlh[..addr_len], &target.to_bytes()[..]);

        let pad_len = u16::from_be_bytes([vlh[addr_len], vlh[addr_len + 1]]);
        assert!((1..=MAX_PADDING_LEN).contains(&pad_len));
        assert_eq!(
            &vlh[addr_len + 2 + pad_len as usize..],
            payload.as_slice()
        );
    }
}
