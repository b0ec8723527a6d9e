//! Transport seam towards the LoRa mesh layer.
//!
//! The mesh PHY/L3 is an external collaborator; its contract here is a
//! datagram socket with link-local multicast, a neighbor view and a receive
//! side. [`UdpMesh`] is the deployment adapter over a UDP socket: it joins a
//! link-local multicast group standing in for the mesh "all neighbors"
//! address and learns its neighbor table from recently heard frames.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tracing::{debug, info};

/// Zombiegram wire port. LoRa listens to all incoming traffic on the
/// interface; the port keeps the UDP stand-in honest.
pub const MESH_PORT: u16 = 1337;

/// Link-local multicast group used as the "all neighbors" destination.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 199);

/// A neighbor unheard for this long drops out of the table.
const NEIGHBOR_TTL: Duration = Duration::from_secs(120);

/// Datagram contract the router drives the mesh through.
#[async_trait]
pub trait MeshTransport: Send + Sync {
    async fn send_to(&self, frame: &[u8], addr: SocketAddr) -> io::Result<usize>;

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Destination meaning "all immediate neighbors".
    fn multicast_addr(&self) -> SocketAddr;

    fn is_connected(&self) -> bool;

    /// Source ids of the currently reachable neighbors.
    fn neighbors(&self) -> Vec<u32>;

    /// Feed link-layer learning with the origin of a received frame.
    fn record_heard(&self, source_id: u32, addr: SocketAddr);

    /// Current interface address. Querying refreshes internal state on some
    /// mesh stacks, so the router polls it every maintenance tick.
    fn local_ip(&self) -> Option<String>;

    /// Tear the mesh down. The socket itself closes on drop.
    fn deinit(&self);
}

#[derive(Debug, Default)]
struct NeighborTable {
    entries: Mutex<HashMap<u32, (SocketAddr, Instant)>>,
}

impl NeighborTable {
    fn record(&self, source_id: u32, addr: SocketAddr) {
        self.entries.lock().insert(source_id, (addr, Instant::now()));
    }

    fn fresh_ids(&self, ttl: Duration) -> Vec<u32> {
        let mut entries = self.entries.lock();
        entries.retain(|_, (_, heard)| heard.elapsed() < ttl);
        entries.keys().copied().collect()
    }
}

/// UDP adapter for host deployments and integration rigs.
#[derive(Debug)]
pub struct UdpMesh {
    socket: UdpSocket,
    multicast: SocketAddr,
    neighbors: NeighborTable,
}

impl UdpMesh {
    /// Bind the mesh socket on [`MESH_PORT`] and join the multicast group.
    pub async fn bind() -> io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", MESH_PORT)).await?;
        socket.join_multicast_v4(MULTICAST_GROUP, Ipv4Addr::UNSPECIFIED)?;
        info!(port = MESH_PORT, group = %MULTICAST_GROUP, "mesh socket bound");
        Ok(Self {
            socket,
            multicast: SocketAddr::from((MULTICAST_GROUP, MESH_PORT)),
            neighbors: NeighborTable::default(),
        })
    }
}

#[async_trait]
impl MeshTransport for UdpMesh {
    async fn send_to(&self, frame: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(frame, addr).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    fn multicast_addr(&self) -> SocketAddr {
        self.multicast
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn neighbors(&self) -> Vec<u32> {
        self.neighbors.fresh_ids(NEIGHBOR_TTL)
    }

    fn record_heard(&self, source_id: u32, addr: SocketAddr) {
        self.neighbors.record(source_id, addr);
    }

    fn local_ip(&self) -> Option<String> {
        self.socket.local_addr().ok().map(|addr| addr.ip().to_string())
    }

    fn deinit(&self) {
        if let Err(e) = self.socket.leave_multicast_v4(MULTICAST_GROUP, Ipv4Addr::UNSPECIFIED) {
            debug!(error = %e, "leaving the multicast group failed");
        }
        info!("mesh deinitialised");
    }
}
