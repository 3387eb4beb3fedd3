//! `wq-manager`: thin CLI entry point over `workqueue_core::manager`.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use log::info;

use workqueue_core::auth::{AddressAuth, AuthChain, HostnameAuth};
use workqueue_core::task::SchedulingAlgorithm;
use workqueue_core::{Manager, ManagerConfig};

#[derive(Parser, Debug)]
#[command(name = "wq-manager", about = "Work queue manager: accepts workers and dispatches tasks")]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:9123")]
    bind: SocketAddr,

    /// Default scheduling algorithm for tasks that don't request one.
    #[arg(long, value_enum, default_value = "files")]
    algorithm: AlgorithmArg,

    /// Resubmission attempts allowed for a task whose worker disconnects.
    #[arg(long, default_value_t = 3)]
    max_resubmissions: u32,

    /// Seconds between keepalive pings to idle workers.
    #[arg(long, default_value_t = 30)]
    keepalive_interval_secs: u64,

    /// Seconds of silence before an unresponsive worker is disconnected.
    #[arg(long, default_value_t = 90)]
    keepalive_timeout_secs: u64,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum AlgorithmArg {
    Files,
    Fcfs,
    Time,
    Random,
}

impl From<AlgorithmArg> for SchedulingAlgorithm {
    fn from(a: AlgorithmArg) -> Self {
        match a {
            AlgorithmArg::Files => SchedulingAlgorithm::Files,
            AlgorithmArg::Fcfs => SchedulingAlgorithm::Fcfs,
            AlgorithmArg::Time => SchedulingAlgorithm::Time,
            AlgorithmArg::Random => SchedulingAlgorithm::Random,
        }
    }
}

#[tokio::main]
async fn main() -> workqueue_core::Result<()> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = ManagerConfig {
        bind_addr: cli.bind,
        default_algorithm: cli.algorithm.into(),
        max_resubmissions: cli.max_resubmissions,
        keepalive_interval: Duration::from_secs(cli.keepalive_interval_secs),
        keepalive_timeout: Duration::from_secs(cli.keepalive_timeout_secs),
    };
    let auth_chain = AuthChain::new().register(Box::new(AddressAuth)).register(Box::new(HostnameAuth));

    let manager = Manager::start(config, auth_chain).await?;
    info!("manager started on {}", cli.bind);

    // The dispatcher and accept loop run as background tasks; keep this
    // one alive indefinitely, periodically logging stats.
    loop {
        tokio::time::sleep(Duration::from_secs(60)).await;
        if let Ok(stats) = manager.stats().await {
            info!(
                "stats: ready={} dispatched={} running={} done={} failed={} workers={}",
                stats.tasks_ready, stats.tasks_dispatched, stats.tasks_running, stats.tasks_done, stats.tasks_failed, stats.workers_connected
            );
        }
    }
}
