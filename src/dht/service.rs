use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use super::error::DhtError;
use super::node::{Clock, DhtSettings, Node, Socket, SystemClock};
use crate::alert::AlertManager;

const TOKEN_ROTATION_INTERVAL: Duration = Duration::from_secs(5 * 60);
const TICK_INTERVAL: Duration = Duration::from_secs(5);
const TIMEOUT_POLL: Duration = Duration::from_millis(500);

/// Default routers for an empty routing table.
pub const BOOTSTRAP_NODES: &[&str] = &[
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "router.utorrent.com:6881",
];

struct UdpSender(Arc<UdpSocket>);

impl Socket for UdpSender {
    fn send(&self, data: &[u8], to: SocketAddr) {
        // fire-and-forget: UDP send failures are handled by RPC timeouts
        if let Err(e) = self.0.try_send_to(data, to) {
            debug!(%to, error = %e, "udp send failed");
        }
    }
}

/// Owns the UDP socket and drives a [`Node`] from a select loop: incoming
/// datagrams, RPC timeout sweeps, periodic maintenance and token rotation.
pub struct DhtService {
    socket: Arc<UdpSocket>,
    node: Node,
}

impl DhtService {
    pub async fn bind(
        port: u16,
        settings: DhtSettings,
        alerts: Option<Arc<AlertManager>>,
    ) -> Result<Self, DhtError> {
        let socket = Arc::new(UdpSocket::bind(("0.0.0.0", port)).await?);
        let local = socket.local_addr()?;

        let node = Node::new(
            None,
            settings,
            Arc::new(UdpSender(socket.clone())),
            Arc::new(SystemClock) as Arc<dyn Clock>,
            alerts,
        );
        info!(%local, id = %node.our_id(), "dht service bound");

        Ok(Self { socket, node })
    }

    pub fn node_mut(&mut self) -> &mut Node {
        &mut self.node
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Resolves the default routers and starts a bootstrap traversal.
    pub async fn bootstrap(&mut self) {
        let mut routers = Vec::new();
        for host in BOOTSTRAP_NODES {
            match tokio::net::lookup_host(host).await {
                Ok(addrs) => routers.extend(addrs.filter(|a| a.is_ipv4()).take(1)),
                Err(e) => warn!(host, error = %e, "failed to resolve bootstrap node"),
            }
        }
        self.node.bootstrap(&routers, None);
    }

    /// Runs the service until cancelled.
    pub async fn run(&mut self) -> Result<(), DhtError> {
        let mut buf = vec![0u8; 65536];
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        let mut timeouts = tokio::time::interval(TIMEOUT_POLL);
        let mut rotate = tokio::time::interval(TOKEN_ROTATION_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        timeouts.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        rotate.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        rotate.tick().await;

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((n, from)) => self.node.incoming(&buf[..n], from),
                        Err(e) => debug!(error = %e, "udp recv failed"),
                    }
                }
                _ = timeouts.tick() => {
                    self.node.connection_timeout();
                }
                _ = tick.tick() => {
                    self.node.tick();
                }
                _ = rotate.tick() => {
                    self.node.new_write_key();
                }
            }
        }
    }
}
