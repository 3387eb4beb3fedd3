//! `wq-worker`: thin CLI entry point over `workqueue_core::worker`.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use log::info;

use workqueue_core::auth::{AddressAuth, AuthChain, HostnameAuth};
use workqueue_core::resources::ResourceVector;
use workqueue_core::worker::{self, WorkerConfig};

#[derive(Parser, Debug)]
#[command(name = "wq-worker", about = "Work queue worker: connects to a manager and runs tasks")]
struct Cli {
    /// Manager address to connect to.
    #[arg(long)]
    manager: SocketAddr,

    /// Name this worker announces itself as; defaults to the hostname.
    #[arg(long)]
    name: Option<String>,

    /// Directory backing this worker's content-addressed object cache.
    #[arg(long, default_value = "./wq-cache")]
    cache_dir: PathBuf,

    /// Directory under which per-task sandboxes are created.
    #[arg(long, default_value = "./wq-sandbox")]
    sandbox_root: PathBuf,

    /// Declared core count; detected via `num_cpus` if omitted.
    #[arg(long)]
    cores: Option<u64>,

    /// Declared memory in MB; if omitted the worker enforces no memory cap.
    #[arg(long)]
    memory_mb: Option<u64>,

    /// Declared disk budget in MB.
    #[arg(long)]
    disk_mb: Option<u64>,

    /// Declared GPU count.
    #[arg(long, default_value_t = 0)]
    gpus: u64,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
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

    let worker_name = cli.name.unwrap_or_else(|| {
        hostname_or_fallback()
    });

    let config = WorkerConfig {
        manager_addr: cli.manager,
        worker_name,
        cache_dir: cli.cache_dir,
        sandbox_root: cli.sandbox_root,
        resources: ResourceVector {
            cores: cli.cores,
            memory_mb: cli.memory_mb,
            disk_mb: cli.disk_mb,
            gpus: Some(cli.gpus),
            wall_time_s: None,
        },
    }
    .detect_defaults();

    let auth_chain = AuthChain::new().register(Box::new(AddressAuth)).register(Box::new(HostnameAuth));

    info!("connecting to manager at {}", cli.manager);
    worker::run(config, auth_chain).await
}

fn hostname_or_fallback() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "wq-worker".to_string())
}
