//! Inbound side of a node.
//!
//! The receiver owns the node's listener. Each peer (the node itself
//! included) connects once, and every accepted connection gets a reader
//! sub-task that decodes frames into the node's inbox. A bad frame on any
//! connection stops the whole receiver.

use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use thiserror::Error;
use tokio::{
    io::{AsyncRead, BufReader},
    net::TcpListener,
    select,
    sync::mpsc,
    task::{JoinError, JoinSet},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    codec::{self, CodecError},
    config::NodeId,
    envelope::Envelope,
};

/// How long readers get after shutdown to finish frames already in flight.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),

    #[error("bad frame from {peer}: {source}")]
    Codec { peer: SocketAddr, source: CodecError },

    #[error("connection reader failed: {0}")]
    Reader(#[from] JoinError),
}

/// Live counters shared between a receiver and its node.
#[derive(Debug, Default)]
pub struct ReceiveCounters {
    connections: AtomicU64,
    frames: AtomicU64,
}

impl ReceiveCounters {
    pub fn snapshot(&self) -> ReceiveStats {
        ReceiveStats {
            connections: self.connections.load(Ordering::Relaxed),
            frames: self.frames.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveStats {
    /// Inbound connections accepted.
    pub connections: u64,
    /// Envelopes decoded and handed to the inbox.
    pub frames: u64,
}

pub struct Receiver {
    node: NodeId,
    listener: TcpListener,
    inbox: mpsc::UnboundedSender<Envelope>,
    counters: Arc<ReceiveCounters>,
}

impl Receiver {
    pub fn new(
        node: NodeId,
        listener: TcpListener,
        inbox: mpsc::UnboundedSender<Envelope>,
        counters: Arc<ReceiveCounters>,
    ) -> Self {
        Self {
            node,
            listener,
            inbox,
            counters,
        }
    }

    /// Accepts and reads connections until `shutdown` fires, the inbox is
    /// dropped, or a connection fails.
    ///
    /// After `shutdown` the listener stops accepting, and open connections
    /// get a short grace period to deliver what their peers already sent.
    pub async fn run(self, shutdown: CancellationToken) -> Result<ReceiveStats, ReceiveError> {
        let Receiver {
            node,
            listener,
            inbox,
            counters,
        } = self;
        let mut readers = JoinSet::new();
        info!(node, addr = ?listener.local_addr().ok(), "receiver started");

        let outcome = loop {
            select! {
                _ = shutdown.cancelled() => break Ok(()),
                _ = inbox.closed() => {
                    debug!(node, "inbox dropped, receiver stopping");
                    break Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        counters.connections.fetch_add(1, Ordering::Relaxed);
                        if let Err(error) = stream.set_nodelay(true) {
                            debug!(node, %peer, ?error, "failed to set TCP_NODELAY");
                        }
                        debug!(node, %peer, "accepted connection");
                        let inbox = inbox.clone();
                        let counters = Arc::clone(&counters);
                        readers.spawn(async move {
                            forward_frames(node, peer, BufReader::new(stream), &inbox, &counters).await
                        });
                    }
                    Err(error) => break Err(ReceiveError::Accept(error)),
                },
                Some(joined) = readers.join_next() => match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => break Err(error),
                    Err(error) => break Err(ReceiveError::Reader(error)),
                },
            }
        };

        let outcome = match outcome {
            Ok(()) if shutdown.is_cancelled() => drain_readers(&mut readers).await,
            other => other,
        };
        readers.abort_all();
        let stats = counters.snapshot();
        match &outcome {
            Ok(()) => info!(
                node,
                connections = stats.connections,
                frames = stats.frames,
                "receiver stopped"
            ),
            Err(error) => warn!(node, %error, "receiver failed"),
        }
        outcome.map(|()| stats)
    }
}

/// Lets readers run until their peers close, or until the grace period ends.
async fn drain_readers(readers: &mut JoinSet<Result<(), ReceiveError>>) -> Result<(), ReceiveError> {
    let drained = timeout(SHUTDOWN_GRACE, async {
        while let Some(joined) = readers.join_next().await {
            joined??;
        }
        Ok::<(), ReceiveError>(())
    })
    .await;
    drained.unwrap_or(Ok(()))
}

/// Decodes frames from one connection into the inbox until EOF.
pub(crate) async fn forward_frames<R>(
    node: NodeId,
    peer: SocketAddr,
    mut reader: R,
    inbox: &mpsc::UnboundedSender<Envelope>,
    counters: &ReceiveCounters,
) -> Result<(), ReceiveError>
where
    R: AsyncRead + Unpin,
{
    loop {
        match codec::read_frame(&mut reader).await {
            Ok(Some(envelope)) => {
                debug!(
                    node,
                    %peer,
                    target = envelope.target,
                    message_id = envelope.message_id,
                    "received envelope"
                );
                counters.frames.fetch_add(1, Ordering::Relaxed);
                if inbox.send(envelope).is_err() {
                    return Ok(());
                }
            }
            Ok(None) => {
                debug!(node, %peer, "peer closed connection");
                return Ok(());
            }
            Err(source) => return Err(ReceiveError::Codec { peer, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::codec::write_frame;

    fn peer() -> SocketAddr {
        "127.0.0.1:9".parse().expect("socket addr")
    }

    #[tokio::test]
    async fn forwards_every_frame_until_eof() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let (inbox, mut inbox_rx) = mpsc::unbounded_channel();
        let counters = ReceiveCounters::default();

        let first = Envelope {
            target: 1,
            message_id: 2000,
            payload: "a b }".into(),
        };
        let second = Envelope {
            target: 1,
            message_id: 2001,
            payload: String::new(),
        };
        write_frame(&mut writer, &first).await.expect("write");
        write_frame(&mut writer, &second).await.expect("write");
        drop(writer);

        forward_frames(1, peer(), reader, &inbox, &counters)
            .await
            .expect("clean eof");

        assert_eq!(inbox_rx.recv().await, Some(first));
        assert_eq!(inbox_rx.recv().await, Some(second));
        assert!(inbox_rx.try_recv().is_err());
        assert_eq!(counters.snapshot().frames, 2);
    }

    #[tokio::test]
    async fn malformed_frame_fails_without_enqueuing() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let (inbox, mut inbox_rx) = mpsc::unbounded_channel();
        let counters = ReceiveCounters::default();

        writer.write_all(&3u32.to_be_bytes()).await.expect("write");
        writer.write_all(&[0xde, 0xad, 0xbe]).await.expect("write");
        drop(writer);

        let err = forward_frames(1, peer(), reader, &inbox, &counters)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReceiveError::Codec {
                source: CodecError::Malformed(_),
                ..
            }
        ));
        assert!(inbox_rx.try_recv().is_err());
        assert_eq!(counters.snapshot().frames, 0);
    }

    #[tokio::test]
    async fn receiver_stops_on_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let (inbox, _inbox_rx) = mpsc::unbounded_channel();
        let counters = Arc::new(ReceiveCounters::default());
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(Receiver::new(7, listener, inbox, counters).run(shutdown.clone()));
        shutdown.cancel();

        let stats = task.await.expect("join").expect("receiver");
        assert_eq!(stats, ReceiveStats::default());
    }

    #[tokio::test]
    async fn receiver_stops_when_inbox_is_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let counters = Arc::new(ReceiveCounters::default());

        let task = tokio::spawn(
            Receiver::new(7, listener, inbox, counters).run(CancellationToken::new()),
        );
        drop(inbox_rx);

        task.await.expect("join").expect("receiver");
    }
}
