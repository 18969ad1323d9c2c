use std::{path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{
    config::NodeId,
    load::{LoadConfig, LoadMode},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start every node of the peer list in this process and run a load test.
    Run(RunArgs),
    /// Start a single node and exchange messages through stdin and stdout.
    Node(NodeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Peer list with one `id,address` record per line.
    #[arg(long, default_value = "clusterconf.txt")]
    pub config: PathBuf,

    /// Messages each node sends per round.
    #[arg(long, default_value_t = 100)]
    pub loops: usize,

    #[arg(long, value_enum, default_value_t = LoadMode::Both)]
    pub mode: LoadMode,

    /// Pause after every tenth send, in milliseconds.
    #[arg(long, default_value_t = 1)]
    pub delay_ms: u64,

    /// Give up after this many seconds. Derived from the load size if unset.
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    #[arg(long, default_value_t = 1024)]
    pub outbox_capacity: usize,

    /// Print the counts behind the verdict.
    #[arg(long)]
    pub details: bool,

    /// Print the report as JSON after the verdict.
    #[arg(long)]
    pub json: bool,
}

impl RunArgs {
    pub fn load_config(&self) -> LoadConfig {
        LoadConfig {
            loops: self.loops,
            mode: self.mode,
            delay: Duration::from_millis(self.delay_ms),
            timeout: self.timeout_secs.map(Duration::from_secs),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    /// Peer list shared by every node of the cluster.
    #[arg(long, default_value = "clusterconf.txt")]
    pub config: PathBuf,

    /// Which entry of the peer list this process runs.
    #[arg(long, allow_negative_numbers = true)]
    pub id: NodeId,

    /// Connect attempts beyond the first, for peers that start later.
    #[arg(long, default_value_t = 50)]
    pub connect_retries: u32,

    #[arg(long, default_value_t = 200)]
    pub retry_ms: u64,
}

impl NodeArgs {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_defaults_match_the_reference_load() {
        let cli = Cli::try_parse_from(["cluster-mesh", "run"]).expect("parse");
        let Command::Run(args) = cli.command else {
            panic!("expected run subcommand");
        };
        assert_eq!(args.config, PathBuf::from("clusterconf.txt"));

        let load = args.load_config();
        assert_eq!(load.loops, 100);
        assert_eq!(load.mode, LoadMode::Both);
        assert_eq!(load.delay, Duration::from_millis(1));
        assert_eq!(load.timeout, None);
    }

    #[test]
    fn run_accepts_mode_and_timeout() {
        let cli = Cli::try_parse_from([
            "cluster-mesh",
            "run",
            "--config",
            "peers.txt",
            "--mode",
            "broadcast",
            "--timeout-secs",
            "5",
            "--json",
        ])
        .expect("parse");
        let Command::Run(args) = cli.command else {
            panic!("expected run subcommand");
        };
        assert!(args.json);
        let load = args.load_config();
        assert_eq!(load.mode, LoadMode::Broadcast);
        assert_eq!(load.timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn node_requires_an_id() {
        assert!(Cli::try_parse_from(["cluster-mesh", "node"]).is_err());

        let cli = Cli::try_parse_from(["cluster-mesh", "node", "--id", "3"]).expect("parse");
        let Command::Node(args) = cli.command else {
            panic!("expected node subcommand");
        };
        assert_eq!(args.id, 3);
        assert_eq!(args.connect_retries, 50);
        assert_eq!(args.retry_backoff(), Duration::from_millis(200));
    }
}
