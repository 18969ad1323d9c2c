//! Load harness driving a cluster purely through its mailboxes.
//!
//! Each round, every node sends `loops` messages whose payload is its own
//! id. A unicast round sends to the next node in table order (wrapping
//! around); a broadcast round reaches every node. Arrivals count only when
//! the envelope's target is the node whose inbox it came out of. The run
//! passes once the received count reaches the expected count, and fails if
//! the deadline passes first.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use clap::ValueEnum;
use futures::future::select_all;
use serde::Serialize;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::{
    config::NodeId,
    node::{Inbox, MailboxError, Outbox},
    topology::Cluster,
};

/// Sends between pauses.
const PACING_BATCH: u64 = 10;
const PROGRESS_INTERVAL: Duration = Duration::from_secs(3);
const DEFAULT_TIMEOUT_SLACK: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    Broadcast,
    Unicast,
    /// A unicast round followed by a broadcast round.
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Round {
    Unicast,
    Broadcast,
}

impl LoadMode {
    fn rounds(self) -> &'static [Round] {
        match self {
            LoadMode::Broadcast => &[Round::Broadcast],
            LoadMode::Unicast => &[Round::Unicast],
            LoadMode::Both => &[Round::Unicast, Round::Broadcast],
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadConfig {
    pub loops: usize,
    pub mode: LoadMode,
    /// Pause after every tenth counted send.
    pub delay: Duration,
    /// Overall deadline. Derived from the message count when unset.
    pub timeout: Option<Duration>,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            loops: 100,
            mode: LoadMode::Both,
            delay: Duration::from_millis(1),
            timeout: None,
        }
    }
}

impl LoadConfig {
    /// Arrivals a correct cluster of `nodes` members produces.
    ///
    /// A single-node cluster has no "next" node, so it sends no unicasts.
    pub fn expected(&self, nodes: usize) -> u64 {
        let loops = self.loops as u64;
        let nodes = nodes as u64;
        self.mode
            .rounds()
            .iter()
            .map(|round| match round {
                Round::Broadcast => loops * nodes * nodes,
                Round::Unicast if nodes > 1 => loops * nodes,
                Round::Unicast => 0,
            })
            .sum()
    }

    /// Explicit timeout, or the time pacing alone takes plus a fixed slack.
    pub fn deadline(&self, nodes: usize) -> Duration {
        self.timeout.unwrap_or_else(|| {
            let pauses = u32::try_from(self.expected(nodes) / PACING_BATCH).unwrap_or(u32::MAX);
            self.delay.saturating_mul(pauses) + DEFAULT_TIMEOUT_SLACK
        })
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Mailbox(#[from] MailboxError),

    #[error("inbox of node {0} closed while the load was running")]
    InboxClosed(NodeId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub nodes: usize,
    pub mode: LoadMode,
    pub expected: u64,
    pub sent: u64,
    pub received: u64,
    /// Arrivals whose target was not the receiving node.
    pub misrouted: u64,
    pub elapsed_ms: u64,
    pub passed: bool,
}

#[derive(Default)]
struct Tally {
    sent: AtomicU64,
    received: AtomicU64,
    misrouted: AtomicU64,
}

/// Runs the load against `cluster` and reports the counts.
///
/// A timeout is not an error: it yields a report with `passed == false`.
pub async fn run_load(cluster: &mut Cluster, config: &LoadConfig) -> Result<LoadReport, LoadError> {
    let started = Instant::now();
    let nodes = cluster.len();
    let expected = config.expected(nodes);
    let deadline = config.deadline(nodes);
    let tally = Tally::default();

    let senders: Vec<(NodeId, Outbox)> = cluster
        .nodes()
        .iter()
        .map(|node| (node.id(), node.outbox()))
        .collect();
    let mut inboxes: Vec<(NodeId, &mut Inbox)> = cluster
        .nodes_mut()
        .iter_mut()
        .map(|node| (node.id(), node.inbox()))
        .collect();

    info!(nodes, expected, mode = ?config.mode, ?deadline, "load started");
    let run = async {
        let (produced, consumed) = tokio::join!(
            produce(&senders, config, &tally),
            consume(&mut inboxes, expected, &tally),
        );
        produced.and(consumed)
    };
    let finished = match timeout(deadline, run).await {
        Ok(result) => {
            result?;
            true
        }
        Err(_) => false,
    };

    let report = LoadReport {
        nodes,
        mode: config.mode,
        expected,
        sent: tally.sent.load(Ordering::Relaxed),
        received: tally.received.load(Ordering::Relaxed),
        misrouted: tally.misrouted.load(Ordering::Relaxed),
        elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        passed: false,
    };
    let passed = finished && report.sent == expected && report.received == expected;
    if !passed {
        warn!(sent = report.sent, received = report.received, expected, "load did not complete");
    }
    Ok(LoadReport { passed, ..report })
}

async fn produce(senders: &[(NodeId, Outbox)], config: &LoadConfig, tally: &Tally) -> Result<(), LoadError> {
    let nodes = senders.len();
    for &round in config.mode.rounds() {
        for _ in 0..config.loops {
            for (index, (id, outbox)) in senders.iter().enumerate() {
                let payload = id.to_string();
                let counted = match round {
                    Round::Broadcast => {
                        outbox.broadcast(payload).await?;
                        nodes as u64
                    }
                    Round::Unicast => {
                        let (next, _) = &senders[(index + 1) % nodes];
                        if next == id {
                            continue;
                        }
                        outbox.unicast(*next, payload).await?;
                        1
                    }
                };

                let sent = tally.sent.fetch_add(counted, Ordering::Relaxed) + counted;
                if sent % PACING_BATCH == 0 && !config.delay.is_zero() {
                    sleep(config.delay).await;
                }
            }
        }
    }
    Ok(())
}

async fn consume(inboxes: &mut [(NodeId, &mut Inbox)], expected: u64, tally: &Tally) -> Result<(), LoadError> {
    if inboxes.is_empty() || expected == 0 {
        return Ok(());
    }

    let mut last_progress = Instant::now();
    while tally.received.load(Ordering::Relaxed) < expected {
        let waits = inboxes.iter_mut().map(|(id, inbox)| {
            let id = *id;
            Box::pin(async move { (id, inbox.recv().await) })
        });
        let ((id, delivered), _, _) = select_all(waits).await;

        let Some(envelope) = delivered else {
            return Err(LoadError::InboxClosed(id));
        };
        if envelope.target == id {
            tally.received.fetch_add(1, Ordering::Relaxed);
        } else {
            tally.misrouted.fetch_add(1, Ordering::Relaxed);
        }

        if last_progress.elapsed() >= PROGRESS_INTERVAL {
            info!(
                sent = tally.sent.load(Ordering::Relaxed),
                received = tally.received.load(Ordering::Relaxed),
                expected,
                "load progress"
            );
            last_progress = Instant::now();
        }
    }
    Ok(())
}
