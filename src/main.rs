//! CLI front end. Parses the `start` subcommand, loads the cluster
//! topology, and runs a [`raft::Node`] until the process is killed.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;

use raft::common::{DEFAULT_LINGER, DEFAULT_READ_BATCH_SIZE, DEFAULT_WRITE_BATCH_SIZE};
use raft::config::ClusterConfig;
use raft::node::NodeOptions;
use raft::Node;

#[derive(Parser)]
#[command(name = "rusty_raft")]
enum Cli {
    /// Start a cluster member.
    Start {
        /// This node's id, as it appears in the topology file.
        #[arg(long)]
        id: u64,
        /// Path to the JSON cluster topology file.
        #[arg(long)]
        conf: PathBuf,
        /// Directory for this node's durable state/log files.
        #[arg(long, default_value = ".")]
        data_dir: PathBuf,
        #[arg(long, default_value_t = DEFAULT_WRITE_BATCH_SIZE)]
        write_batch_size: usize,
        #[arg(long, default_value_t = DEFAULT_READ_BATCH_SIZE)]
        read_batch_size: usize,
        /// Skip fsync on every durable write.
        #[arg(long)]
        async_log: bool,
        #[arg(long)]
        debug: bool,
    },
}

fn main() -> ExitCode {
    let Cli::Start { id, conf, data_dir, write_batch_size, read_batch_size, async_log, debug } = Cli::parse();

    let filter = if debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    let cluster = match ClusterConfig::load(&conf) {
        Ok(c) => c,
        Err(e) => {
            log::error!("failed to load topology file {}: {e}", conf.display());
            return ExitCode::FAILURE;
        }
    };

    let mut options = NodeOptions::new(id, data_dir);
    options.write_batch_size = write_batch_size;
    options.read_batch_size = read_batch_size;
    options.async_log = async_log;
    options.linger = DEFAULT_LINGER;

    let node = match Node::new(options, &cluster) {
        Ok(n) => n,
        Err(e) => {
            log::error!("failed to start node {id}: {e}");
            return ExitCode::FAILURE;
        }
    };

    // The node's own threads do the work from here; block the main
    // thread until the process is killed. A clean SIGINT/SIGTERM exit
    // with `node.shutdown()` would need a signal-handling crate outside
    // this project's dependency stack, so an operator stops a node the
    // way the original prototype expects: killing the process.
    loop {
        std::thread::sleep(Duration::from_secs(1));
        if node.is_fatal() {
            log::error!("node {id} observed a fatal error, exiting");
            return ExitCode::FAILURE;
        }
    }
}
