//! Outbox draining and destination routing.
//!
//! One dispatcher runs per node. It is the only writer on the node's
//! outbound connections, so no locking is involved: the connection map is
//! owned by the task.

use std::{collections::HashMap, io, sync::Arc};

use thiserror::Error;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    select,
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    codec::{self, CodecError},
    config::{NodeId, PeerTable},
    envelope::Envelope,
};

/// Distance between the first message ids of consecutive node ids.
///
/// Node `n` starts counting at `n * MESSAGE_ID_STRIDE`. This keeps ids from
/// different nodes apart in practice; it is not a uniqueness guarantee.
pub const MESSAGE_ID_STRIDE: i64 = 1000;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to encode envelope for node {target}: {source}")]
    Encode {
        target: NodeId,
        source: CodecError,
    },

    #[error("failed to send to node {target}: {source}")]
    Transport { target: NodeId, source: io::Error },

    #[error("no outbound connection to node {0}")]
    UnknownTarget(NodeId),

    #[error("node {node} has used up its message ids")]
    IdsExhausted { node: NodeId },
}

/// Strictly increasing message-id source owned by a single node.
#[derive(Debug, Clone)]
pub struct MessageIds {
    next: Option<i64>,
}

impl MessageIds {
    /// A node whose seed does not fit in an `i64` gets no ids at all.
    pub fn seeded_for(node: NodeId) -> Self {
        Self {
            next: node.checked_mul(MESSAGE_ID_STRIDE),
        }
    }

    /// Next id, or `None` once the counter would pass `i64::MAX`.
    pub fn next_id(&mut self) -> Option<i64> {
        let id = self.next?;
        self.next = id.checked_add(1);
        Some(id)
    }
}

/// Counters reported when a dispatcher stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    /// Envelopes taken off the outbox.
    pub envelopes: u64,
    /// Frames written to connections; a broadcast counts once per node.
    pub frames: u64,
    pub last_message_id: Option<i64>,
}

pub struct Dispatcher<W = TcpStream> {
    node: NodeId,
    peers: Arc<PeerTable>,
    connections: HashMap<NodeId, W>,
    outbox: mpsc::Receiver<Envelope>,
    ids: MessageIds,
    stats: DispatchStats,
}

impl<W> Dispatcher<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(
        node: NodeId,
        peers: Arc<PeerTable>,
        connections: HashMap<NodeId, W>,
        outbox: mpsc::Receiver<Envelope>,
    ) -> Self {
        Self {
            node,
            peers,
            connections,
            outbox,
            ids: MessageIds::seeded_for(node),
            stats: DispatchStats::default(),
        }
    }

    /// Drains the outbox until every sender is gone or `shutdown` fires.
    ///
    /// On shutdown the outbox is closed first, so later submissions fail
    /// fast, and whatever was already queued is still sent. Any encode or
    /// send failure ends the task with an error.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<DispatchStats, DispatchError> {
        info!(
            node = self.node,
            connections = self.connections.len(),
            "dispatcher started"
        );

        loop {
            select! {
                next = self.outbox.recv() => match next {
                    Some(envelope) => self.dispatch(envelope).await?,
                    None => break,
                },
                _ = shutdown.cancelled() => {
                    self.outbox.close();
                    while let Some(envelope) = self.outbox.recv().await {
                        self.dispatch(envelope).await?;
                    }
                    break;
                }
            }
        }

        self.close_connections().await;
        info!(
            node = self.node,
            envelopes = self.stats.envelopes,
            frames = self.stats.frames,
            "dispatcher stopped"
        );
        Ok(self.stats)
    }

    async fn dispatch(&mut self, envelope: Envelope) -> Result<(), DispatchError> {
        self.stats.envelopes += 1;

        if envelope.is_broadcast() {
            // Every node, self included: the loop-back connection is what
            // lets broadcast skip any special case for the sender.
            let peers = Arc::clone(&self.peers);
            for target in peers.ids() {
                self.send_to(target, &envelope).await?;
            }
            Ok(())
        } else {
            self.send_to(envelope.target, &envelope).await
        }
    }

    async fn send_to(&mut self, target: NodeId, envelope: &Envelope) -> Result<(), DispatchError> {
        let Some(connection) = self.connections.get_mut(&target) else {
            return Err(DispatchError::UnknownTarget(target));
        };

        let message_id = self
            .ids
            .next_id()
            .ok_or(DispatchError::IdsExhausted { node: self.node })?;
        let outgoing = envelope.addressed(target, message_id);
        let frame =
            codec::frame(&outgoing).map_err(|source| DispatchError::Encode { target, source })?;
        connection
            .write_all(&frame)
            .await
            .map_err(|source| DispatchError::Transport { target, source })?;

        debug!(node = self.node, target, message_id, "sent envelope");
        self.stats.frames += 1;
        self.stats.last_message_id = Some(message_id);
        Ok(())
    }

    async fn close_connections(&mut self) {
        for (peer, mut connection) in self.connections.drain() {
            if let Err(error) = connection.shutdown().await {
                debug!(node = self.node, peer, ?error, "failed to close connection cleanly");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::DuplexStream;

    use super::*;
    use crate::{codec::read_frame, config::BROADCAST};

    struct Harness {
        outbox: mpsc::Sender<Envelope>,
        shutdown: CancellationToken,
        task: tokio::task::JoinHandle<Result<DispatchStats, DispatchError>>,
        readers: HashMap<NodeId, DuplexStream>,
    }

    fn start(node: NodeId, ids: &[NodeId]) -> Harness {
        let peers = PeerTable::from_entries(
            ids.iter()
                .enumerate()
                .map(|(port, &id)| (id, format!("127.0.0.1:{}", 7000 + port))),
        )
        .expect("peer table");

        let mut connections = HashMap::new();
        let mut readers = HashMap::new();
        for &id in ids {
            let (writer, reader) = tokio::io::duplex(64 * 1024);
            connections.insert(id, writer);
            readers.insert(id, reader);
        }

        let (outbox, outbox_rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let dispatcher = Dispatcher::new(node, Arc::new(peers), connections, outbox_rx);
        let task = tokio::spawn(dispatcher.run(shutdown.clone()));

        Harness {
            outbox,
            shutdown,
            task,
            readers,
        }
    }

    async fn next_frame(reader: &mut DuplexStream) -> Option<Envelope> {
        tokio::time::timeout(Duration::from_secs(1), read_frame(reader))
            .await
            .expect("frame within timeout")
            .expect("valid frame")
    }

    #[test]
    fn message_ids_start_at_node_range_and_increase() {
        let mut ids = MessageIds::seeded_for(3);
        let first = ids.next_id().expect("id");
        let second = ids.next_id().expect("id");
        let third = ids.next_id().expect("id");

        assert_eq!(first, 3 * MESSAGE_ID_STRIDE);
        assert!(first < second && second < third);
    }

    #[test]
    fn message_ids_stop_instead_of_wrapping() {
        let mut near_max = MessageIds::seeded_for(i64::MAX / MESSAGE_ID_STRIDE);
        let mut previous = near_max.next_id().expect("first id");
        while let Some(id) = near_max.next_id() {
            assert!(id > previous);
            previous = id;
        }
        assert_eq!(previous, i64::MAX);
        assert_eq!(near_max.next_id(), None);

        let mut overflowing = MessageIds::seeded_for(i64::MAX / MESSAGE_ID_STRIDE + 1);
        assert_eq!(overflowing.next_id(), None);
    }

    #[tokio::test]
    async fn exhausted_ids_end_the_task_with_an_error() {
        let node = i64::MAX / MESSAGE_ID_STRIDE + 1;
        let harness = start(node, &[node]);
        harness
            .outbox
            .send(Envelope::broadcast("too late"))
            .await
            .expect("queue envelope");

        let err = harness.task.await.expect("join").unwrap_err();
        assert!(matches!(err, DispatchError::IdsExhausted { node: n } if n == node));
    }

    #[tokio::test]
    async fn unicast_writes_one_frame_to_the_target_only() {
        let mut harness = start(1, &[1, 2, 3]);
        harness
            .outbox
            .send(Envelope::unicast(2, "hello"))
            .await
            .expect("queue envelope");
        drop(harness.outbox);

        let stats = harness.task.await.expect("join").expect("dispatcher");
        assert_eq!(stats.envelopes, 1);
        assert_eq!(stats.frames, 1);

        let received = next_frame(harness.readers.get_mut(&2).expect("reader 2"))
            .await
            .expect("frame for node 2");
        assert_eq!(received.target, 2);
        assert_eq!(received.message_id, MESSAGE_ID_STRIDE);
        assert_eq!(received.payload, "hello");

        for id in [1, 3] {
            let reader = harness.readers.get_mut(&id).expect("reader");
            assert_eq!(next_frame(reader).await, None, "node {id} got a frame");
        }
    }

    #[tokio::test]
    async fn broadcast_fans_out_to_every_node_including_self() {
        let mut harness = start(2, &[1, 2, 3]);
        harness
            .outbox
            .send(Envelope::broadcast("to everyone"))
            .await
            .expect("queue envelope");
        drop(harness.outbox);

        let stats = harness.task.await.expect("join").expect("dispatcher");
        assert_eq!(stats.envelopes, 1);
        assert_eq!(stats.frames, 3);

        let mut seen_ids = Vec::new();
        for id in [1, 2, 3] {
            let reader = harness.readers.get_mut(&id).expect("reader");
            let received = next_frame(reader).await.expect("broadcast frame");
            assert_eq!(received.target, id);
            assert_ne!(received.target, BROADCAST);
            assert_eq!(received.payload, "to everyone");
            seen_ids.push(received.message_id);
            assert_eq!(next_frame(reader).await, None);
        }

        // Fan-out walks the table in order, one fresh id per frame.
        assert_eq!(seen_ids, vec![2000, 2001, 2002]);
    }

    #[tokio::test]
    async fn ids_keep_increasing_across_envelopes() {
        let mut harness = start(1, &[1, 2]);
        for text in ["a", "b", "c"] {
            harness
                .outbox
                .send(Envelope::unicast(2, text))
                .await
                .expect("queue envelope");
        }
        drop(harness.outbox);
        let stats = harness.task.await.expect("join").expect("dispatcher");
        assert_eq!(stats.last_message_id, Some(1002));

        let reader = harness.readers.get_mut(&2).expect("reader");
        let mut previous = None;
        while let Some(envelope) = next_frame(reader).await {
            if let Some(previous) = previous {
                assert!(envelope.message_id > previous);
            }
            previous = Some(envelope.message_id);
        }
        assert_eq!(previous, Some(1002));
    }

    #[tokio::test]
    async fn caller_supplied_message_id_is_overwritten() {
        let mut harness = start(4, &[4]);
        let mut envelope = Envelope::unicast(4, "self");
        envelope.message_id = 99;
        harness.outbox.send(envelope).await.expect("queue envelope");
        drop(harness.outbox);
        harness.task.await.expect("join").expect("dispatcher");

        let received = next_frame(harness.readers.get_mut(&4).expect("reader"))
            .await
            .expect("frame");
        assert_eq!(received.message_id, 4 * MESSAGE_ID_STRIDE);
    }

    #[tokio::test]
    async fn unknown_target_ends_the_task() {
        let harness = start(1, &[1, 2]);
        harness
            .outbox
            .send(Envelope::unicast(9, "nobody"))
            .await
            .expect("queue envelope");

        let err = harness.task.await.expect("join").unwrap_err();
        assert!(matches!(err, DispatchError::UnknownTarget(9)));
    }

    #[tokio::test]
    async fn shutdown_drains_queued_envelopes_then_closes_outbox() {
        let mut harness = start(1, &[1, 2]);
        for text in ["one", "two"] {
            harness
                .outbox
                .send(Envelope::unicast(2, text))
                .await
                .expect("queue envelope");
        }
        harness.shutdown.cancel();

        let stats = harness.task.await.expect("join").expect("dispatcher");
        assert_eq!(stats.envelopes, 2);
        assert!(harness.outbox.is_closed());
        assert!(harness
            .outbox
            .send(Envelope::unicast(2, "late"))
            .await
            .is_err());

        let reader = harness.readers.get_mut(&2).expect("reader");
        assert_eq!(next_frame(reader).await.expect("first").payload, "one");
        assert_eq!(next_frame(reader).await.expect("second").payload, "two");
        assert_eq!(next_frame(reader).await, None);
    }
}
