#![allow(dead_code)]

use std::{
    net::{SocketAddr, TcpListener},
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use cluster_mesh::{Cluster, NodeId, PeerTable, TopologyBuilder};
use tokio::time::{sleep, Instant};

pub const WAIT: Duration = Duration::from_secs(2);

/// Loopback addresses that were free a moment ago.
pub fn free_addresses(count: usize) -> Result<Vec<SocketAddr>> {
    let listeners = (0..count)
        .map(|_| TcpListener::bind("127.0.0.1:0"))
        .collect::<std::io::Result<Vec<_>>>()?;
    let addrs = listeners
        .iter()
        .map(TcpListener::local_addr)
        .collect::<std::io::Result<Vec<_>>>()?;
    Ok(addrs)
}

/// Peer-list text for `ids` on fresh loopback ports.
pub fn peer_list(ids: &[NodeId]) -> Result<String> {
    let addrs = free_addresses(ids.len())?;
    Ok(ids
        .iter()
        .zip(addrs)
        .map(|(id, addr)| format!("{id},{addr}\n"))
        .collect())
}

pub async fn spawn_cluster(ids: &[NodeId]) -> Result<Cluster> {
    let peers = PeerTable::parse(&peer_list(ids)?)?;
    let cluster = TopologyBuilder::new(Arc::new(peers)).build().await?;
    Ok(cluster)
}

/// Polls `condition` until it holds or [`WAIT`] passes.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}
