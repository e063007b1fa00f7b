use anyhow::Result;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::types::{Hello, Peer, ServerId};
use crate::config::DiscoveryConfig;

pub type ClaimSource = Arc<dyn Fn() -> bool + Send + Sync>;
pub type PeerSink = Arc<dyn Fn(Peer) + Send + Sync>;

/// Multicast beacon: announces this server and reports the others it hears.
pub struct DiscoveryService {
    self_id: ServerId,
    tcp_port: u16,
    settings: DiscoveryConfig,
    claims_leader: ClaimSource,
    on_peer: PeerSink,
    shutdown: CancellationToken,
}

impl DiscoveryService {
    pub fn new(
        self_id: ServerId,
        tcp_port: u16,
        settings: DiscoveryConfig,
        claims_leader: ClaimSource,
        on_peer: PeerSink,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            self_id,
            tcp_port,
            settings,
            claims_leader,
            on_peer,
            shutdown,
        })
    }

    /// Binds the group socket, then spawns the listen and announce loops on
    /// `tracker` so the owner can wait for them on shutdown.
    pub async fn start(self: Arc<Self>, tracker: &TaskTracker) -> Result<()> {
        let listen_socket = self.bind_group_socket()?;
        tracing::info!(
            "Discovery listening on {}:{} (announce every {:?})",
            self.settings.group,
            self.settings.port,
            self.settings.interval()
        );

        let service = self.clone();
        tracker.spawn(async move {
            service.listen_loop(listen_socket).await;
        });

        let service = self.clone();
        tracker.spawn(async move {
            service.announce_loop().await;
        });

        Ok(())
    }

    /// Stops both loops; the group socket is dropped when the listener exits.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn hello(&self) -> Hello {
        Hello {
            server_id: self.self_id,
            tcp_port: self.tcp_port,
            claims_leader: (self.claims_leader)(),
        }
    }

    /// Turns one datagram into a peer, ignoring our own beacon and garbage.
    pub fn handle_datagram(&self, datagram: &[u8], src: SocketAddr) -> Option<Peer> {
        let text = std::str::from_utf8(datagram).ok()?;
        let hello = match Hello::parse(text) {
            Some(hello) => hello,
            None => {
                tracing::trace!("Ignoring malformed discovery datagram from {}", src);
                return None;
            }
        };

        if hello.server_id == self.self_id {
            return None;
        }

        Some(Peer {
            id: hello.server_id,
            host: src.ip().to_string(),
            port: hello.tcp_port,
            claims_leader: hello.claims_leader,
        })
    }

    fn bind_group_socket(&self) -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.set_nonblocking(true)?;

        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.settings.port);
        socket.bind(&SocketAddr::V4(bind_addr).into())?;
        socket.join_multicast_v4(&self.settings.group, &Ipv4Addr::UNSPECIFIED)?;

        Ok(UdpSocket::from_std(socket.into())?)
    }

    async fn listen_loop(self: Arc<Self>, socket: UdpSocket) {
        let mut buf = vec![0u8; 512];

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, src)) => {
                        if let Some(peer) = self.handle_datagram(&buf[..len], src) {
                            tracing::debug!("HELLO from server #{} at {}", peer.id, src);
                            (self.on_peer)(peer);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Discovery receive failed: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                },
            }
        }

        if let Err(e) = socket.leave_multicast_v4(self.settings.group, Ipv4Addr::UNSPECIFIED) {
            tracing::debug!("Leaving multicast group failed: {}", e);
        }
        tracing::info!("Discovery listener stopped");
    }

    async fn announce_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.settings.interval());
        let target = SocketAddr::V4(SocketAddrV4::new(self.settings.group, self.settings.port));

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.announce_once(target).await {
                        tracing::warn!("Discovery announce failed: {}", e);
                    }
                }
            }
        }

        tracing::info!("Discovery announcer stopped");
    }

    async fn announce_once(&self, target: SocketAddr) -> std::io::Result<()> {
        let socket = UdpSocket::bind(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))).await?;
        socket.set_multicast_ttl_v4(self.settings.ttl)?;

        let beacon = self.hello().encode();
        socket.send_to(beacon.as_bytes(), target).await?;
        tracing::trace!("Announced {}", beacon);
        Ok(())
    }
}
