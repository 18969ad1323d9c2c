//! Interactive single-node mode.
//!
//! Lines typed on stdin become envelopes: `* text` broadcasts, `<id> text`
//! goes to one node. Everything arriving in the node's inbox is printed.

use std::sync::Arc;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::{
    io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    select,
};
use tracing::{info, warn};

use crate::{
    cli::NodeArgs,
    config::{NodeId, PeerTable},
    envelope::Envelope,
    node::{MailboxError, Node, Outbox},
    topology::TopologyBuilder,
};

const BROADCAST_MARKER: &str = "*";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LineError {
    #[error("'{0}' is neither a node id nor '*'")]
    BadTarget(String),
}

/// Turns one console line into an envelope. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<Envelope>, LineError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let (target, text) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let text = text.trim_start();
    if target == BROADCAST_MARKER {
        return Ok(Some(Envelope::broadcast(text)));
    }
    let target: NodeId = target
        .parse()
        .map_err(|_| LineError::BadTarget(target.to_string()))?;
    Ok(Some(Envelope::unicast(target, text)))
}

pub async fn run(args: NodeArgs) -> Result<()> {
    let peers = PeerTable::load(&args.config)?;
    let mut node = TopologyBuilder::new(Arc::new(peers))
        .with_connect_retries(args.connect_retries, args.retry_backoff())
        .build_node(args.id)
        .await
        .with_context(|| format!("failed to start node {}", args.id))?;

    write_stdout(&format!(
        "*** node {} listening on {}, peers: {:?}",
        node.id(),
        node.local_addr(),
        node.peer_ids()
    ))
    .await?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    run_console_loop(&mut node, &mut stdin).await?;

    let report = node.shutdown().await?;
    info!(
        node = report.node,
        sent = report.dispatched.frames,
        received = report.received.frames,
        "node stopped"
    );
    Ok(())
}

async fn run_console_loop<R>(node: &mut Node, stdin: &mut Lines<R>) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let outbox = node.outbox();
    loop {
        // `next_line` keeps a partly read line buffered when the inbox wins.
        select! {
            delivered = node.inbox().recv() => {
                if !handle_delivery(delivered).await? {
                    break;
                }
            }
            line = stdin.next_line() => {
                if !handle_stdin_input(line, &outbox).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(err) = ctrl_c {
                    warn!("failed to listen for ctrl-c: {err:?}");
                }
                break;
            }
        }
    }
    Ok(())
}

async fn handle_delivery(delivered: Option<Envelope>) -> Result<bool> {
    match delivered {
        Some(envelope) => {
            write_stdout(&format!("[{}] {}", envelope.message_id, envelope.payload)).await?;
            Ok(true)
        }
        None => {
            write_stdout("*** receiver stopped").await?;
            Ok(false)
        }
    }
}

async fn handle_stdin_input(line: io::Result<Option<String>>, outbox: &Outbox) -> Result<bool> {
    let Some(input) = line? else {
        return Ok(false);
    };
    if input.trim().eq_ignore_ascii_case("/quit") {
        return Ok(false);
    }

    let envelope = match parse_line(&input) {
        Ok(Some(envelope)) => envelope,
        Ok(None) => return Ok(true),
        Err(err) => {
            write_stdout(&format!("*** {err}")).await?;
            return Ok(true);
        }
    };

    match outbox.send(envelope).await {
        Ok(()) => Ok(true),
        Err(err @ MailboxError::UnknownTarget(_)) => {
            write_stdout(&format!("*** {err}")).await?;
            Ok(true)
        }
        Err(err) => {
            write_stdout(&format!("*** {err}")).await?;
            Ok(false)
        }
    }
}

async fn write_stdout(line: &str) -> Result<()> {
    let mut stdout = io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(())
}
