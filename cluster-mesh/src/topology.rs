//! Full-mesh construction.
//!
//! Building a cluster happens in two phases. First every node binds its
//! inbound listener. Only then does each node open one outbound connection
//! to every node's listener, its own included, for N² connections in an
//! N-node cluster. Connections that arrive before a receiver starts
//! accepting wait in the listener backlog.

use std::{collections::HashMap, io, net::SocketAddr, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{
    net::{TcpListener, TcpStream},
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    config::{NodeId, Peer, PeerTable},
    node::{Node, NodeError, NodeReport},
};

const DEFAULT_OUTBOX_CAPACITY: usize = 1024;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("node {id}: failed to bind {address}: {source}")]
    Bind {
        id: NodeId,
        address: String,
        source: io::Error,
    },

    #[error("node {from}: failed to connect to node {to} at {address}: {source}")]
    Connect {
        from: NodeId,
        to: NodeId,
        address: String,
        source: io::Error,
    },

    #[error("node {0} is not in the peer table")]
    UnknownNode(NodeId),
}

/// Turns a [`PeerTable`] into running nodes.
#[derive(Debug, Clone)]
pub struct TopologyBuilder {
    peers: Arc<PeerTable>,
    outbox_capacity: usize,
    connect_timeout: Duration,
    connect_retries: u32,
    retry_backoff: Duration,
}

impl TopologyBuilder {
    pub fn new(peers: Arc<PeerTable>) -> Self {
        Self {
            peers,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            connect_retries: 0,
            retry_backoff: Duration::ZERO,
        }
    }

    /// Envelopes an outbox holds before `Outbox::send` waits.
    pub fn with_outbox_capacity(mut self, capacity: usize) -> Self {
        self.outbox_capacity = capacity.max(1);
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Retries a refused or timed-out connect `retries` more times, sleeping
    /// `backoff` in between. Only useful when peers live in other processes
    /// and may not be listening yet.
    pub fn with_connect_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.connect_retries = retries;
        self.retry_backoff = backoff;
        self
    }

    /// Builds every node of the table in this process.
    ///
    /// Any bind or connect failure aborts the whole build; nodes wired so
    /// far are dropped, which stops their tasks.
    pub async fn build(self) -> Result<Cluster, TopologyError> {
        let mut bound = Vec::with_capacity(self.peers.len());
        for peer in self.peers.iter() {
            let (listener, local_addr) = bind(peer).await?;
            bound.push((peer.id, listener, local_addr));
        }

        // Connect to what was actually bound, so a `:0` port still resolves.
        let endpoints: Vec<(NodeId, String)> = bound
            .iter()
            .map(|(id, _, local_addr)| (*id, local_addr.to_string()))
            .collect();

        let mut wired = Vec::with_capacity(bound.len());
        for (id, listener, local_addr) in bound {
            let mut connections = HashMap::with_capacity(endpoints.len());
            for (to, address) in &endpoints {
                let stream = self.connect(id, *to, address).await?;
                connections.insert(*to, stream);
            }
            wired.push((id, listener, local_addr, connections));
        }

        let nodes: Vec<Node> = wired
            .into_iter()
            .map(|(id, listener, local_addr, connections)| {
                Node::spawn(
                    id,
                    Arc::clone(&self.peers),
                    listener,
                    local_addr,
                    connections,
                    self.outbox_capacity,
                )
            })
            .collect();

        info!(
            nodes = nodes.len(),
            connections = nodes.len() * nodes.len(),
            "full mesh established"
        );
        Ok(Cluster {
            peers: self.peers,
            nodes,
        })
    }

    /// Builds only node `id`, for running one cluster member per process.
    ///
    /// Other members are reached at their table addresses, so they may live
    /// in other processes. Pair with [`TopologyBuilder::with_connect_retries`]
    /// when they start at different times.
    pub async fn build_node(self, id: NodeId) -> Result<Node, TopologyError> {
        let me = self.peers.get(id).ok_or(TopologyError::UnknownNode(id))?;
        let (listener, local_addr) = bind(me).await?;

        let mut connections = HashMap::with_capacity(self.peers.len());
        for peer in self.peers.iter() {
            let address = if peer.id == id {
                local_addr.to_string()
            } else {
                peer.address.clone()
            };
            let stream = self.connect(id, peer.id, &address).await?;
            connections.insert(peer.id, stream);
        }

        info!(node = id, %local_addr, peers = connections.len(), "node connected to mesh");
        Ok(Node::spawn(
            id,
            Arc::clone(&self.peers),
            listener,
            local_addr,
            connections,
            self.outbox_capacity,
        ))
    }

    async fn connect(&self, from: NodeId, to: NodeId, address: &str) -> Result<TcpStream, TopologyError> {
        let mut attempt = 0;
        loop {
            let result = match timeout(self.connect_timeout, TcpStream::connect(address)).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
            };

            match result {
                Ok(stream) => {
                    if let Err(error) = stream.set_nodelay(true) {
                        debug!(from, to, ?error, "failed to set TCP_NODELAY");
                    }
                    debug!(from, to, address, "connected");
                    return Ok(stream);
                }
                Err(error) if attempt < self.connect_retries => {
                    attempt += 1;
                    debug!(from, to, address, attempt, %error, "connect failed, retrying");
                    sleep(self.retry_backoff).await;
                }
                Err(source) => {
                    return Err(TopologyError::Connect {
                        from,
                        to,
                        address: address.to_string(),
                        source,
                    })
                }
            }
        }
    }
}

async fn bind(peer: &Peer) -> Result<(TcpListener, SocketAddr), TopologyError> {
    let bind_error = |source| TopologyError::Bind {
        id: peer.id,
        address: peer.address.clone(),
        source,
    };
    let listener = TcpListener::bind(peer.address.as_str())
        .await
        .map_err(bind_error)?;
    let local_addr = listener.local_addr().map_err(bind_error)?;
    debug!(node = peer.id, %local_addr, "listener bound");
    Ok((listener, local_addr))
}

/// Every node of a peer table, running in this process.
pub struct Cluster {
    peers: Arc<PeerTable>,
    nodes: Vec<Node>,
}

impl Cluster {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn peers(&self) -> &Arc<PeerTable> {
        &self.peers
    }

    /// Node ids in table order.
    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(Node::id).collect()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.iter().find(|node| node.id() == id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|node| node.id() == id)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn nodes_mut(&mut self) -> &mut [Node] {
        &mut self.nodes
    }

    pub fn into_nodes(self) -> Vec<Node> {
        self.nodes
    }

    /// Stops every node.
    ///
    /// All outboxes are drained before any receiver stops, so envelopes
    /// already submitted still reach their targets' inboxes. Returns the
    /// first node failure, after every node has been stopped.
    pub async fn shutdown(self) -> Result<Vec<NodeReport>, NodeError> {
        let mut nodes = self.nodes;
        for node in &nodes {
            node.close_outbox();
        }
        for node in &mut nodes {
            node.drain_outbox().await;
        }

        let mut reports = Vec::with_capacity(nodes.len());
        let mut first_error = None;
        for node in nodes {
            match node.shutdown().await {
                Ok(report) => reports.push(report),
                Err(error) => {
                    warn!(%error, "node stopped with an error");
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(reports),
        }
    }
}
