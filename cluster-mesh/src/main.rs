use std::{process::ExitCode, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use cluster_mesh::{
    cli::{Cli, Command, RunArgs},
    console,
    load::run_load,
    PeerTable, TopologyBuilder,
};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Node(args) => {
            console::run(args).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run(args: RunArgs) -> Result<ExitCode> {
    let peers = PeerTable::load(&args.config)?;
    info!(nodes = peers.len(), config = %args.config.display(), "peer list loaded");

    let mut cluster = TopologyBuilder::new(Arc::new(peers))
        .with_outbox_capacity(args.outbox_capacity)
        .build()
        .await
        .context("failed to build cluster")?;

    let report = run_load(&mut cluster, &args.load_config()).await?;
    println!("{}", if report.passed { "PASS" } else { "FAIL" });
    if args.details {
        println!(
            "nodes={} mode={:?} expected={} sent={} received={} misrouted={} elapsed_ms={}",
            report.nodes,
            report.mode,
            report.expected,
            report.sent,
            report.received,
            report.misrouted,
            report.elapsed_ms
        );
    }
    if args.json {
        println!("{}", serde_json::to_string(&report)?);
    }

    if let Err(err) = cluster.shutdown().await {
        warn!("cluster shut down with error: {err}");
        if report.passed {
            return Err(err.into());
        }
    }

    Ok(if report.passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
