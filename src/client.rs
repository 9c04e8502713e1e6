//! Client assembly
//!
//! Dispatches on the configured protocol and mode, owns the local
//! listeners, and wires the root shutdown channel through every engine.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::{CipherMethod, Config, Mode, Protocol};
use crate::error::Error;
use crate::protocol::Address;
use crate::proxy::{
    Socks5PacketHandler, TcpHandshake, TunnelPacketHandler, UdpPacketHandler,
};
use crate::shadowsocks::datagram::UdpRelayer;
use crate::shadowsocks::stream::{bridge, read_initial_payload, ShadowTcpStream};

/// The running client: local listener plus relay engines.
pub struct Client {
    config: Arc<Config>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Client {
    pub fn new(config: Arc<Config>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            shutdown_tx,
        }
    }

    /// Signal every listener, bridge, session reader, and monitor to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Serve until a fatal error or shutdown. Shutdown-induced listener
    /// closure returns `Ok(())`.
    pub async fn run(&self) -> Result<()> {
        let key = self.config.decoded_key()?;
        let server_addr = resolve_address(&self.config.server.address)
            .await
            .context("failed to resolve server address")?;
        let forward = self.forward_address()?;

        match self.config.client.mode {
            Mode::Tcp => {
                let handshake = match (self.config.client.protocol, forward) {
                    (Protocol::Socks, _) => TcpHandshake::Socks5,
                    (Protocol::Tunnel, Some(addr)) => TcpHandshake::Tunnel(addr),
                    (Protocol::Tunnel, None) => {
                        return Err(Error::Configuration(
                            "tunnel protocol requires a forward address".into(),
                        )
                        .into())
                    }
                };
                self.serve_tcp(server_addr, key, handshake).await
            }
            Mode::Udp => {
                let handler: Arc<dyn UdpPacketHandler> =
                    match (self.config.client.protocol, forward) {
                        (Protocol::Socks, _) => Arc::new(Socks5PacketHandler),
                        (Protocol::Tunnel, Some(addr)) => {
                            Arc::new(TunnelPacketHandler { forward: addr })
                        }
                        (Protocol::Tunnel, None) => {
                            return Err(Error::Configuration(
                                "tunnel protocol requires a forward address".into(),
                            )
                            .into())
                        }
                    };
                self.serve_udp(server_addr, key, handler).await
            }
        }
    }

    fn forward_address(&self) -> Result<Option<Address>> {
        match &self.config.client.forward {
            Some(raw) => {
                let addr = Address::parse(raw)
                    .map_err(|e| Error::Configuration(format!("invalid forward address: {e}")))?;
                Ok(Some(addr))
            }
            None => Ok(None),
        }
    }

    async fn serve_tcp(
        &self,
        server_addr: SocketAddr,
        key: Vec<u8>,
        handshake: TcpHandshake,
    ) -> Result<()> {
        let listener = TcpListener::bind(self.config.client.listen)
            .await
            .with_context(|| format!("failed to bind {}", self.config.client.listen))?;

        info!(
            listen = %self.config.client.listen,
            server = %server_addr,
            method = %self.config.server.method,
            "tcp client started"
        );

        let handshake = Arc::new(handshake);
        let method = self.config.server.method;
        let fast_open = self.config.client.fast_open;
        let key = Arc::new(key);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            let (conn, peer) = tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("tcp client stopped");
                    return Ok(());
                }
                accepted = listener.accept() => accepted?,
            };

            debug!(client = %peer, "inbound connection accepted");

            let handshake = handshake.clone();
            let key = key.clone();
            let shutdown_rx = self.shutdown_tx.subscribe();

            tokio::spawn(async move {
                let result = handle_connection(
                    conn,
                    server_addr,
                    &key,
                    method,
                    fast_open,
                    &handshake,
                    shutdown_rx,
                )
                .await;
                if let Err(e) = result {
                    if e.is_disconnect() {
                        debug!(client = %peer, error = %e, "connection closed");
                    } else {
                        warn!(client = %peer, error = %e, "connection failed");
                    }
                }
            });
        }
    }

    async fn serve_udp(
        &self,
        server_addr: SocketAddr,
        key: Vec<u8>,
        handler: Arc<dyn UdpPacketHandler>,
    ) -> Result<()> {
        let relayer = UdpRelayer::bind(
            self.config.client.listen,
            server_addr,
            key,
            self.config.server.method,
            handler,
            self.shutdown_tx.clone(),
        )
        .await
        .with_context(|| format!("failed to bind {}", self.config.client.listen))?;

        relayer.run().await?;
        Ok(())
    }
}

/// One inbound connection: discover the target, optionally collect early
/// data, handshake with the server, then relay until either side ends.
async fn handle_connection(
    mut conn: TcpStream,
    server_addr: SocketAddr,
    key: &[u8],
    method: CipherMethod,
    fast_open: bool,
    handshake: &TcpHandshake,
    shutdown_rx: broadcast::Receiver<()>,
) -> std::result::Result<(), Error> {
    let target = handshake.handshake(&mut conn).await?;
    debug!(target = %target, "target negotiated");

    let initial_payload = if fast_open {
        read_initial_payload(&mut conn).await?
    } else {
        Vec::new()
    };

    let mut remote = ShadowTcpStream::connect(server_addr, key, method).await?;
    remote.write_client_handshake(&target, &initial_payload).await?;

    bridge(remote, conn, shutdown_rx).await
}

/// Resolve a `host:port` string, taking the first answer.
pub async fn resolve_address(address: &str) -> Result<SocketAddr> {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(addr);
    }

    tokio::net::lookup_host(address)
        .await
        .with_context(|| format!("failed to resolve {}", address))?
        .next()
        .ok_or_else(|| anyhow::anyhow!("no addresses found for {}", address))
}
