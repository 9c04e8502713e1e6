//! Datagram engine
//!
//! Owns the UDP listener, a table of per-client sessions (each with its
//! own upstream socket and cipher pair), and the idle-session monitor.
//! Packets are wrapped in the 2022 separate-header scheme: a 16-byte
//! session-id+counter header encrypted with a raw block cipher, followed
//! by the AEAD-sealed body.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::CipherMethod;
use crate::error::{Error, Result};
use crate::proxy::UdpPacketHandler;
use crate::shadowsocks::cipher::{new_salt, BlockCipher, Cipher, NONCE_LEN, TAG_LEN};
use crate::shadowsocks::{
    padding, unix_now, validate_timestamp, HEADER_TYPE_CLIENT_PACKET, HEADER_TYPE_SERVER_PACKET,
    MAX_UDP_PACKET_LEN, MAX_UDP_PADDING_LEN, SESSION_IDLE_TIMEOUT_SECS, SESSION_SWEEP_INTERVAL,
    UDP_SESSION_ID_LEN,
};

/// Length of the block-encrypted separate header.
const SEPARATE_HEADER_LEN: usize = 16;

/// Server message prefix: type(1) + timestamp(8) + session-id(8) +
/// padding-length(2).
const SERVER_MESSAGE_MIN_LEN: usize = 19;

/// UDP relay between local clients and the Shadowsocks server.
pub struct UdpRelayer {
    inner: Arc<RelayerInner>,
    shutdown: broadcast::Sender<()>,
}

struct RelayerInner {
    listener: UdpSocket,
    sessions: DashMap<SocketAddr, Arc<Session>>,
    block: BlockCipher,
    key: Vec<u8>,
    method: CipherMethod,
    server_addr: SocketAddr,
    handler: Arc<dyn UdpPacketHandler>,
}

impl UdpRelayer {
    /// Bind the local listener and prepare the relay. `shutdown` is the
    /// root channel; every session reader and the monitor subscribe to it.
    pub async fn bind(
        listen: SocketAddr,
        server_addr: SocketAddr,
        key: Vec<u8>,
        method: CipherMethod,
        handler: Arc<dyn UdpPacketHandler>,
        shutdown: broadcast::Sender<()>,
    ) -> Result<Self> {
        let listener = UdpSocket::bind(listen).await?;
        let block = BlockCipher::new(&key)?;

        Ok(Self {
            inner: Arc::new(RelayerInner {
                listener,
                sessions: DashMap::new(),
                block,
                key,
                method,
                server_addr,
                handler,
            }),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.listener.local_addr()?)
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Receive loop. Returns `Ok(())` when shutdown closes the listener.
    pub async fn run(&self) -> Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();
        let monitor = self.spawn_monitor();

        info!(
            listen = %self.local_addr()?,
            server = %self.inner.server_addr,
            "udp relay started"
        );

        let mut buf = vec![0u8; MAX_UDP_PACKET_LEN];
        loop {
            let (n, client_addr) = tokio::select! {
                _ = shutdown_rx.recv() => break,
                res = self.inner.listener.recv_from(&mut buf) => match res {
                    Ok(received) => received,
                    Err(e) => {
                        warn!(error = %e, "udp listener receive failed");
                        continue;
                    }
                },
            };

            let session = match self.load_or_store_session(client_addr).await {
                Ok(session) => session,
                Err(e) => {
                    warn!(error = %e, client = %client_addr, "session setup failed");
                    continue;
                }
            };

            if let Err(e) = self.forward_to_server(&session, &buf[..n]).await {
                warn!(error = %e, client = %client_addr, "write to server failed");
                if let Some((_, session)) = self.inner.sessions.remove(&client_addr) {
                    session.close();
                }
            }
        }

        monitor.abort();
        self.close_all();
        info!("udp relay stopped");
        Ok(())
    }

    /// Adapt a client datagram, wrap it, and send it upstream.
    async fn forward_to_server(&self, session: &Session, packet: &[u8]) -> Result<()> {
        let payload = self.inner.handler.handle_inbound(packet)?;
        let wrapped = session.wrap_packet(&payload, &self.inner.block)?;
        session.server_conn.send(&wrapped).await?;
        session.touch();
        Ok(())
    }

    /// At most one session per client source address. A lost creation race
    /// closes the freshly built session and keeps the winner.
    async fn load_or_store_session(&self, client_addr: SocketAddr) -> Result<Arc<Session>> {
        if let Some(existing) = self.inner.sessions.get(&client_addr) {
            return Ok(existing.clone());
        }

        let salt = new_salt(UDP_SESSION_ID_LEN);
        let encrypt = Cipher::new(&self.inner.key, &salt, self.inner.method)?;

        let bind_addr: SocketAddr = if self.inner.server_addr.is_ipv4() {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let server_conn = UdpSocket::bind(bind_addr).await?;
        server_conn.connect(self.inner.server_addr).await?;

        let session = Arc::new(Session {
            client_addr,
            server_conn,
            encrypt,
            decrypt: Mutex::new(None),
            last_active: AtomicU64::new(unix_now()),
            reader: Mutex::new(None),
        });

        let winner = {
            use dashmap::mapref::entry::Entry;
            match self.inner.sessions.entry(client_addr) {
                Entry::Occupied(existing) => {
                    session.close();
                    return Ok(existing.get().clone());
                }
                Entry::Vacant(slot) => {
                    slot.insert(session.clone());
                    session
                }
            }
        };

        let reader = tokio::spawn(run_session_reader(
            winner.clone(),
            self.inner.clone(),
            self.shutdown.subscribe(),
        ));
        *winner.reader.lock() = Some(reader);

        debug!(client = %client_addr, "udp session created");
        Ok(winner)
    }

    fn spawn_monitor(&self) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SESSION_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tick.tick() => inner.sweep_idle_sessions(unix_now()),
                }
            }
        })
    }

    /// Evict every session idle longer than the timeout, as of `now`
    /// (unix seconds). The monitor calls this every sweep interval.
    pub fn sweep_idle_sessions(&self, now: u64) {
        self.inner.sweep_idle_sessions(now);
    }

    fn close_all(&self) {
        let clients: Vec<SocketAddr> = self.inner.sessions.iter().map(|e| *e.key()).collect();
        for client in clients {
            if let Some((_, session)) = self.inner.sessions.remove(&client) {
                session.close();
            }
        }
    }
}

impl RelayerInner {
    fn sweep_idle_sessions(&self, now: u64) {
        // Collect first: closing must not happen under the map's shard locks
        let expired: Vec<SocketAddr> = self
            .sessions
            .iter()
            .filter(|entry| {
                now.saturating_sub(entry.value().last_active()) > SESSION_IDLE_TIMEOUT_SECS
            })
            .map(|entry| *entry.key())
            .collect();

        for client in expired {
            if let Some((_, session)) = self.sessions.remove(&client) {
                debug!(client = %client, "udp session evicted after idle timeout");
                session.close();
            }
        }
    }
}

/// Per-client relay state: upstream socket, cipher pair, activity clock.
struct Session {
    client_addr: SocketAddr,
    server_conn: UdpSocket,
    /// client→server context; its 8-byte salt is the session id
    encrypt: Cipher,
    /// server→client context, created from the first server packet's
    /// declared session id
    decrypt: Mutex<Option<Cipher>>,
    /// unix seconds of the last successful send or receive
    last_active: AtomicU64,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    fn touch(&self) {
        self.last_active.store(unix_now(), Ordering::Relaxed);
    }

    fn last_active(&self) -> u64 {
        self.last_active.load(Ordering::Relaxed)
    }

    fn close(&self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }

    /// Client→server: block-encrypted separate header plus sealed body.
    fn wrap_packet(&self, payload: &[u8], block: &BlockCipher) -> Result<Vec<u8>> {
        let mut header = [0u8; SEPARATE_HEADER_LEN];
        header[..UDP_SESSION_ID_LEN].copy_from_slice(self.encrypt.salt());
        header[UDP_SESSION_ID_LEN..].copy_from_slice(&self.encrypt.nonce()[..8]);

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&header[4..16]);

        let body = build_client_message(payload);
        let sealed = self.encrypt.seal_with_nonce(&nonce, &body)?;

        block.encrypt_block(&mut header);

        let mut packet = Vec::with_capacity(SEPARATE_HEADER_LEN + sealed.len());
        packet.extend_from_slice(&header);
        packet.extend_from_slice(&sealed);
        Ok(packet)
    }

    /// Server→client: decrypt the separate header, lazily create the
    /// decrypt context from the declared session id, open and validate the
    /// body. Returns the shadowsocks payload (address then data).
    fn unwrap_packet(&self, packet: &[u8], block: &BlockCipher) -> Result<Vec<u8>> {
        if packet.len() < SEPARATE_HEADER_LEN + TAG_LEN {
            return Err(Error::PacketTooShort {
                need: SEPARATE_HEADER_LEN + TAG_LEN,
                got: packet.len(),
            });
        }

        let mut header = [0u8; SEPARATE_HEADER_LEN];
        header.copy_from_slice(&packet[..SEPARATE_HEADER_LEN]);
        block.decrypt_block(&mut header);

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&header[4..16]);

        let message = {
            let mut slot = self.decrypt.lock();
            if slot.is_none() {
                *slot = Some(self.encrypt.renew(&header[..UDP_SESSION_ID_LEN])?);
            }
            let decrypt = slot.as_ref().ok_or(Error::AeadOpenFailed)?;
            decrypt.open_with_nonce(&nonce, &packet[SEPARATE_HEADER_LEN..])?
        };

        self.parse_server_message(&message)
    }

    fn parse_server_message(&self, message: &[u8]) -> Result<Vec<u8>> {
        if message.len() < SERVER_MESSAGE_MIN_LEN {
            return Err(Error::PacketTooShort {
                need: SERVER_MESSAGE_MIN_LEN,
                got: message.len(),
            });
        }

        if message[0] != HEADER_TYPE_SERVER_PACKET {
            return Err(Error::HeaderTypeMismatch {
                expected: HEADER_TYPE_SERVER_PACKET,
                got: message[0],
            });
        }

        let mut timestamp = [0u8; 8];
        timestamp.copy_from_slice(&message[1..9]);
        validate_timestamp(u64::from_be_bytes(timestamp))?;

        if message[9..17] != *self.encrypt.salt() {
            return Err(Error::SaltMismatch);
        }

        let padding_len = u16::from_be_bytes([message[17], message[18]]) as usize;
        let payload_start = SERVER_MESSAGE_MIN_LEN + padding_len;
        if message.len() < payload_start {
            return Err(Error::PacketTooShort {
                need: payload_start,
                got: message.len(),
            });
        }

        Ok(message[payload_start..].to_vec())
    }
}

/// `type || timestamp || padding-length || padding || payload`
fn build_client_message(payload: &[u8]) -> Vec<u8> {
    let pad = padding(1, MAX_UDP_PADDING_LEN);
    let mut message = Vec::with_capacity(1 + 8 + pad.len() + payload.len());
    message.push(HEADER_TYPE_CLIENT_PACKET);
    message.extend_from_slice(&unix_now().to_be_bytes());
    message.extend_from_slice(&pad);
    message.extend_from_slice(payload);
    message
}

/// Relay server packets back to the client source until the upstream
/// socket fails, a packet fails validation, or shutdown fires.
async fn run_session_reader(
    session: Arc<Session>,
    inner: Arc<RelayerInner>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; MAX_UDP_PACKET_LEN];
    loop {
        let n = tokio::select! {
            _ = shutdown.recv() => break,
            res = session.server_conn.recv(&mut buf) => match res {
                Ok(n) => n,
                Err(e) => {
                    debug!(error = %e, client = %session.client_addr, "upstream receive ended");
                    break;
                }
            },
        };

        let payload = match session.unwrap_packet(&buf[..n], &inner.block) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, client = %session.client_addr, "unwrap of server packet failed");
                break;
            }
        };

        let datagram = match inner.handler.handle_outbound(&payload) {
            Ok(datagram) => datagram,
            Err(e) => {
                warn!(error = %e, client = %session.client_addr, "outbound packet handling failed");
                break;
            }
        };

        if let Err(e) = inner.listener.send_to(&datagram, session.client_addr).await {
            debug!(error = %e, client = %session.client_addr, "write back to client failed");
            break;
        }

        session.touch();
    }

    // Only remove the entry if it still refers to this session; the
    // upstream socket closes with the last reference
    inner
        .sessions
        .remove_if(&session.client_addr, |_, current| {
            Arc::ptr_eq(current, &session)
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::TunnelPacketHandler;
    use crate::protocol::Address;
    use rand::RngCore;

    fn test_key() -> Vec<u8> {
        let mut key = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }

    fn test_session(key: &[u8]) -> Session {
        let salt = new_salt(UDP_SESSION_ID_LEN);
        let encrypt = Cipher::new(key, &salt, CipherMethod::Aes256Gcm).unwrap();
        let server_conn = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        server_conn.set_nonblocking(true).unwrap();
        Session {
            client_addr: "127.0.0.1:9".parse().unwrap(),
            server_conn: UdpSocket::from_std(server_conn).unwrap(),
            encrypt,
            decrypt: Mutex::new(None),
            last_active: AtomicU64::new(unix_now()),
            reader: Mutex::new(None),
        }
    }

    /// Decrypt a client packet the way the server would, returning
    /// (session id, packet counter, shadowsocks payload).
    fn server_side_unwrap(packet: &[u8], key: &[u8], block: &BlockCipher) -> ([u8; 8], [u8; 8], Vec<u8>) {
        let mut header = [0u8; SEPARATE_HEADER_LEN];
        header.copy_from_slice(&packet[..SEPARATE_HEADER_LEN]);
        block.decrypt_block(&mut header);

        let mut session_id = [0u8; 8];
        session_id.copy_from_slice(&header[..8]);
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&header[8..]);

        let decrypt = Cipher::new(key, &session_id, CipherMethod::Aes256Gcm).unwrap();
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&header[4..16]);
        let message = decrypt
            .open_with_nonce(&nonce, &packet[SEPARATE_HEADER_LEN..])
            .unwrap();

        assert_eq!(message[0], HEADER_TYPE_CLIENT_PACKET);
        let padding_len = u16::from_be_bytes([message[9], message[10]]) as usize;
        (session_id, counter, message[11 + padding_len..].to_vec())
    }

    /// Build a server packet addressed to the given client session.
    fn server_side_wrap(
        payload: &[u8],
        client_session_id: &[u8],
        key: &[u8],
        block: &BlockCipher,
        timestamp: u64,
    ) -> Vec<u8> {
        let server_session_id = new_salt(UDP_SESSION_ID_LEN);
        let encrypt = Cipher::new(key, &server_session_id, CipherMethod::Aes256Gcm).unwrap();

        let mut header = [0u8; SEPARATE_HEADER_LEN];
        header[..8].copy_from_slice(&server_session_id);
        header[8..].copy_from_slice(&encrypt.nonce()[..8]);

        let mut message = Vec::new();
        message.push(HEADER_TYPE_SERVER_PACKET);
        message.extend_from_slice(&timestamp.to_be_bytes());
        message.extend_from_slice(client_session_id);
        message.extend_from_slice(&[0, 0]); // no padding
        message.extend_from_slice(payload);

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&header[4..16]);
        let sealed = encrypt.seal_with_nonce(&nonce, &message).unwrap();

        block.encrypt_block(&mut header);
        let mut packet = header.to_vec();
        packet.extend_from_slice(&sealed);
        packet
    }

    #[tokio::test]
    async fn test_wrap_unwrap_roundtrip() {
        let key = test_key();
        let block = BlockCipher::new(&key).unwrap();
        let session = test_session(&key);

        let mut payload = Address::Ipv4("10.0.0.1".parse().unwrap(), 53).to_bytes();
        payload.extend_from_slice(b"query");

        let packet = session.wrap_packet(&payload, &block).unwrap();
        let (session_id, counter, unwrapped) = server_side_unwrap(&packet, &key, &block);
        assert_eq!(&session_id[..], session.encrypt.salt());
        assert_eq!(counter, [0u8; 8]);
        assert_eq!(unwrapped, payload);

        // The packet counter advances with every wrapped packet
        let packet = session.wrap_packet(&payload, &block).unwrap();
        let (_, counter, _) = server_side_unwrap(&packet, &key, &block);
        assert_eq!(counter, [1, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_unwrap_server_packet() {
        let key = test_key();
        let block = BlockCipher::new(&key).unwrap();
        let session = test_session(&key);

        let mut payload = Address::Ipv4("10.0.0.1".parse().unwrap(), 53).to_bytes();
        payload.extend_from_slice(b"answer");

        let packet =
            server_side_wrap(&payload, session.encrypt.salt(), &key, &block, unix_now());
        assert_eq!(session.unwrap_packet(&packet, &block).unwrap(), payload);
        // Decrypt context is created once and reused
        assert!(session.decrypt.lock().is_some());
    }

    #[tokio::test]
    async fn test_unwrap_rejects_skewed_timestamp() {
        let key = test_key();
        let block = BlockCipher::new(&key).unwrap();
        let session = test_session(&key);

        let packet = server_side_wrap(
            b"late",
            session.encrypt.salt(),
            &key,
            &block,
            unix_now() - 60,
        );
        assert!(matches!(
            session.unwrap_packet(&packet, &block),
            Err(Error::TimestampSkew(_))
        ));
    }

    #[tokio::test]
    async fn test_unwrap_rejects_foreign_session_id() {
        let key = test_key();
        let block = BlockCipher::new(&key).unwrap();
        let session = test_session(&key);

        let foreign = new_salt(UDP_SESSION_ID_LEN);
        let packet = server_side_wrap(b"stray", &foreign, &key, &block, unix_now());
        assert!(matches!(
            session.unwrap_packet(&packet, &block),
            Err(Error::SaltMismatch)
        ));
    }

    #[tokio::test]
    async fn test_unwrap_rejects_short_packet() {
        let key = test_key();
        let block = BlockCipher::new(&key).unwrap();
        let session = test_session(&key);

        assert!(matches!(
            session.unwrap_packet(&[0u8; 20], &block),
            Err(Error::PacketTooShort { .. })
        ));
    }

    #[tokio::test]
    async fn test_idle_sweep() {
        let key = test_key();
        let (shutdown_tx, _) = broadcast::channel(1);
        let relayer = UdpRelayer::bind(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:8388".parse().unwrap(),
            key,
            CipherMethod::Aes256Gcm,
            Arc::new(TunnelPacketHandler {
                forward: Address::Ipv4("127.0.0.1".parse().unwrap(), 4444),
            }),
            shutdown_tx,
        )
        .await
        .unwrap();

        let client: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        relayer.load_or_store_session(client).await.unwrap();
        assert_eq!(relayer.session_count(), 1);

        // A fresh session survives an on-time sweep
        relayer.sweep_idle_sessions(unix_now());
        assert_eq!(relayer.session_count(), 1);

        // A sweep past the idle deadline evicts it
        relayer.sweep_idle_sessions(unix_now() + SESSION_IDLE_TIMEOUT_SECS + 1);
        assert_eq!(relayer.session_count(), 0);
    }

    #[tokio::test]
    async fn test_session_uniqueness() {
        let key = test_key();
        let (shutdown_tx, _) = broadcast::channel(1);
        let relayer = Arc::new(
            UdpRelayer::bind(
                "127.0.0.1:0".parse().unwrap(),
                "127.0.0.1:8388".parse().unwrap(),
                key,
                CipherMethod::Aes256Gcm,
                Arc::new(crate::proxy::Socks5PacketHandler),
                shutdown_tx,
            )
            .await
            .unwrap(),
        );

        let client: SocketAddr = "127.0.0.1:50001".parse().unwrap();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let relayer = relayer.clone();
            handles.push(tokio::spawn(async move {
                relayer.load_or_store_session(client).await.unwrap()
            }));
        }

        let mut sessions = Vec::new();
        for handle in handles {
            sessions.push(handle.await.unwrap());
        }
        assert_eq!(relayer.session_count(), 1);
        for pair in sessions.windows(2) {
            assert!(Arc::ptr_eq(&pair[0], &pair[1]));
        }
    }
}
