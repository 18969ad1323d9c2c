//! A running cluster member and its mailbox.
//!
//! A [`Node`] owns two tasks: a dispatcher that drains the [`Outbox`] onto
//! the outbound connections, and a receiver that fills the [`Inbox`] from
//! the inbound listener. Applications only ever see the two mailbox handles.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc::{self, error::TrySendError},
    task::{JoinError, JoinHandle},
};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

use crate::{
    config::{NodeId, PeerTable, BROADCAST},
    dispatcher::{DispatchError, DispatchStats, Dispatcher},
    envelope::Envelope,
    receiver::{ReceiveCounters, ReceiveError, ReceiveStats, Receiver},
};

/// Errors returned to code submitting into an [`Outbox`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MailboxError {
    #[error("outbox of node {0} is closed")]
    Closed(NodeId),

    #[error("outbox of node {0} is full")]
    Full(NodeId),

    #[error("node {0} is not a member of the cluster")]
    UnknownTarget(NodeId),
}

/// Failure of one of a node's tasks, reported by [`Node::shutdown`].
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node {node}: dispatcher failed: {source}")]
    Dispatch { node: NodeId, source: DispatchError },

    #[error("node {node}: receiver failed: {source}")]
    Receive { node: NodeId, source: ReceiveError },

    #[error("node {node}: {task} task did not complete: {source}")]
    Join {
        node: NodeId,
        task: &'static str,
        source: JoinError,
    },
}

/// Send side of a node's mailbox. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Outbox {
    node: NodeId,
    peers: Arc<PeerTable>,
    tx: mpsc::Sender<Envelope>,
}

impl Outbox {
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Queues an envelope for the dispatcher, waiting for room if the queue
    /// is full.
    ///
    /// Fails with [`MailboxError::Closed`] once the dispatcher has stopped,
    /// and with [`MailboxError::UnknownTarget`] for a target that is neither
    /// a cluster member nor [`BROADCAST`].
    pub async fn send(&self, envelope: Envelope) -> Result<(), MailboxError> {
        self.check_target(envelope.target)?;
        self.tx
            .send(envelope)
            .await
            .map_err(|_| MailboxError::Closed(self.node))
    }

    pub fn try_send(&self, envelope: Envelope) -> Result<(), MailboxError> {
        self.check_target(envelope.target)?;
        self.tx.try_send(envelope).map_err(|err| match err {
            TrySendError::Full(_) => MailboxError::Full(self.node),
            TrySendError::Closed(_) => MailboxError::Closed(self.node),
        })
    }

    pub async fn unicast(&self, target: NodeId, payload: impl Into<String>) -> Result<(), MailboxError> {
        self.send(Envelope::unicast(target, payload)).await
    }

    pub async fn broadcast(&self, payload: impl Into<String>) -> Result<(), MailboxError> {
        self.send(Envelope::broadcast(payload)).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn check_target(&self, target: NodeId) -> Result<(), MailboxError> {
        if target == BROADCAST || self.peers.contains(target) {
            Ok(())
        } else {
            Err(MailboxError::UnknownTarget(target))
        }
    }
}

/// Receive side of a node's mailbox.
#[derive(Debug)]
pub struct Inbox {
    node: NodeId,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Inbox {
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Next delivered envelope. `None` once the receiver has stopped and
    /// everything it delivered has been consumed.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }

    /// Like [`Inbox::recv`], giving up after `wait`.
    pub async fn recv_timeout(&mut self, wait: Duration) -> Option<Envelope> {
        tokio::time::timeout(wait, self.rx.recv()).await.ok().flatten()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Outcome of a clean [`Node::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeReport {
    pub node: NodeId,
    pub dispatched: DispatchStats,
    pub received: ReceiveStats,
}

type DispatchTask = JoinHandle<Result<DispatchStats, DispatchError>>;
type ReceiveTask = JoinHandle<Result<ReceiveStats, ReceiveError>>;

/// A cluster member with its dispatcher and receiver running.
///
/// Dropping a node without calling [`Node::shutdown`] still stops both
/// tasks, but their outcome is lost.
pub struct Node {
    id: NodeId,
    peers: Arc<PeerTable>,
    local_addr: SocketAddr,
    outbound: Vec<NodeId>,
    outbox: Outbox,
    inbox: Inbox,
    counters: Arc<ReceiveCounters>,
    dispatch_stop: CancellationToken,
    receive_stop: CancellationToken,
    dispatcher: Option<DispatchTask>,
    dispatched: Option<Result<DispatchStats, NodeError>>,
    receiver: ReceiveTask,
    _guards: [DropGuard; 2],
}

impl Node {
    /// Starts the dispatcher and receiver for an already-wired node.
    ///
    /// `connections` must hold one stream per table entry, the node's own
    /// id included.
    pub(crate) fn spawn(
        id: NodeId,
        peers: Arc<PeerTable>,
        listener: TcpListener,
        local_addr: SocketAddr,
        connections: HashMap<NodeId, TcpStream>,
        outbox_capacity: usize,
    ) -> Self {
        let (outbox_tx, outbox_rx) = mpsc::channel(outbox_capacity.max(1));
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let counters = Arc::new(ReceiveCounters::default());
        let dispatch_stop = CancellationToken::new();
        let receive_stop = CancellationToken::new();

        let outbound: Vec<NodeId> = peers
            .ids()
            .filter(|peer| connections.contains_key(peer))
            .collect();

        let dispatcher = Dispatcher::new(id, Arc::clone(&peers), connections, outbox_rx);
        let receiver = Receiver::new(id, listener, inbox_tx, Arc::clone(&counters));
        let dispatcher = tokio::spawn(dispatcher.run(dispatch_stop.clone()));
        let receiver = tokio::spawn(receiver.run(receive_stop.clone()));

        Self {
            id,
            outbox: Outbox {
                node: id,
                peers: Arc::clone(&peers),
                tx: outbox_tx,
            },
            inbox: Inbox { node: id, rx: inbox_rx },
            peers,
            local_addr,
            outbound,
            counters,
            _guards: [
                dispatch_stop.clone().drop_guard(),
                receive_stop.clone().drop_guard(),
            ],
            dispatch_stop,
            receive_stop,
            dispatcher: Some(dispatcher),
            dispatched: None,
            receiver,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Every node id this node can address, itself included, in table order.
    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.peers.ids().collect()
    }

    pub fn peers(&self) -> &Arc<PeerTable> {
        &self.peers
    }

    /// Address the inbound listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Ids this node holds an outbound connection to.
    pub fn outbound_peers(&self) -> &[NodeId] {
        &self.outbound
    }

    /// Inbound connections accepted so far.
    pub fn inbound_connections(&self) -> u64 {
        self.counters.snapshot().connections
    }

    pub fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }

    pub fn inbox(&mut self) -> &mut Inbox {
        &mut self.inbox
    }

    /// True once both tasks have stopped, whether cleanly or not.
    pub fn is_finished(&self) -> bool {
        let dispatcher_done = self
            .dispatcher
            .as_ref()
            .map_or(true, JoinHandle::is_finished);
        dispatcher_done && self.receiver.is_finished()
    }

    /// Closes the outbox. The dispatcher sends what is already queued and
    /// then stops; later submissions fail with [`MailboxError::Closed`].
    pub fn close_outbox(&self) {
        self.dispatch_stop.cancel();
    }

    /// Closes the outbox and waits for the dispatcher to finish draining.
    pub(crate) async fn drain_outbox(&mut self) {
        self.close_outbox();
        if let Some(task) = self.dispatcher.take() {
            let outcome = match task.await {
                Ok(Ok(stats)) => Ok(stats),
                Ok(Err(source)) => Err(NodeError::Dispatch {
                    node: self.id,
                    source,
                }),
                Err(source) => Err(NodeError::Join {
                    node: self.id,
                    task: "dispatcher",
                    source,
                }),
            };
            self.dispatched = Some(outcome);
        }
    }

    /// Stops the node: drains the outbox, then stops the receiver.
    ///
    /// Returns the first task failure, the dispatcher's taking precedence.
    /// Envelopes already in the inbox are discarded with the node.
    pub async fn shutdown(mut self) -> Result<NodeReport, NodeError> {
        self.drain_outbox().await;
        self.receive_stop.cancel();

        let received = match (&mut self.receiver).await {
            Ok(Ok(stats)) => Ok(stats),
            Ok(Err(source)) => Err(NodeError::Receive {
                node: self.id,
                source,
            }),
            Err(source) => Err(NodeError::Join {
                node: self.id,
                task: "receiver",
                source,
            }),
        };

        let dispatched = self
            .dispatched
            .take()
            .unwrap_or(Ok(DispatchStats::default()))?;
        let received = received?;
        debug!(node = self.id, "node shut down");

        Ok(NodeReport {
            node: self.id,
            dispatched,
            received,
        })
    }
}
