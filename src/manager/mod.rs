//! C5: Manager Dispatcher, public facade (spec.md §4.5, §6.4).
//!
//! `Manager` is the embedding-API surface: a cheap-to-clone handle backed
//! by a channel into the dispatcher actor (`dispatcher.rs`). Grounded in
//! the teacher's `SccacheScheduler`/`SccacheDaemonServer` split: here one
//! process plays both scheduler and "server" roles, listening for workers
//! directly, since spec.md's manager has no separate allocator tier.

mod dispatcher;
mod session;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

pub use dispatcher::{CacheDeclaration, CacheSource, CategorySummary, Stats};

use crate::auth::AuthChain;
use crate::errors::*;
use crate::task::{SchedulingAlgorithm, Task, TaskId, WorkerId};

/// Manager-side tuning, surfaced as CLI flags in `src/bin/manager.rs`
/// (SPEC_FULL.md §2 "Configuration").
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub bind_addr: SocketAddr,
    pub default_algorithm: SchedulingAlgorithm,
    pub max_resubmissions: u32,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            bind_addr: "0.0.0.0:9123".parse().unwrap(),
            default_algorithm: SchedulingAlgorithm::Files,
            max_resubmissions: 3,
            keepalive_interval: Duration::from_secs(30),
            keepalive_timeout: Duration::from_secs(90),
        }
    }
}

/// A handle to a running manager. Cloning shares the same dispatcher.
#[derive(Clone)]
pub struct Manager {
    tx: mpsc::UnboundedSender<dispatcher::DispatcherMsg>,
    local_addr: SocketAddr,
}

impl Manager {
    /// Start the dispatcher actor and the accept loop, returning
    /// immediately with a handle (spec.md §6.4 "manager_create").
    pub async fn start(config: ManagerConfig, auth_chain: AuthChain) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("manager listening on {}", local_addr);

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatcher::run_dispatcher(
            rx,
            config.default_algorithm,
            config.max_resubmissions,
            config.keepalive_interval,
            config.keepalive_timeout,
        ));

        let accept_tx = tx.clone();
        let auth_chain = Arc::new(auth_chain);
        tokio::spawn(accept_loop(listener, auth_chain, accept_tx));

        Ok(Manager { tx, local_addr })
    }

    /// The address the manager actually bound to — useful when
    /// `ManagerConfig::bind_addr` asked for an ephemeral port.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// spec.md §6.4 "manager_submit". Fails synchronously with
    /// `ErrorKind::ConfigError` if an input file doesn't exist on the
    /// manager and isn't backed by a declared cache object (spec.md §7).
    pub async fn submit(&self, task: Task) -> Result<TaskId> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(dispatcher::DispatcherMsg::Submit(task, reply_tx))?;
        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(ErrorKind::PeerGone("dispatcher gone".to_string()).into()),
        }
    }

    /// spec.md §6.4 "manager_wait": block (cooperatively) until a task
    /// reaches Done/Failed, or `timeout` elapses.
    pub async fn wait(&self, timeout: Duration) -> Result<Option<Task>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(dispatcher::DispatcherMsg::Wait(timeout, reply_tx))?;
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(task)) => Ok(task),
            Ok(Err(_)) => Err(ErrorKind::PeerGone("dispatcher gone".to_string()).into()),
            Err(_) => Ok(None),
        }
    }

    /// spec.md §6.4 "manager_cancel".
    pub async fn cancel(&self, task_id: TaskId) -> Result<bool> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(dispatcher::DispatcherMsg::Cancel(task_id, reply_tx))?;
        reply_rx.await.map_err(|_| ErrorKind::PeerGone("dispatcher gone".to_string()).into())
    }

    /// spec.md §6.4 "manager_stats".
    pub async fn stats(&self) -> Result<Stats> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(dispatcher::DispatcherMsg::Stats(reply_tx))?;
        reply_rx.await.map_err(|_| ErrorKind::PeerGone("dispatcher gone".to_string()).into())
    }

    /// Register a cache object backed by a URL fetch, so future task
    /// dispatch issues `puturl` instead of pushing a local file
    /// (spec.md §4.5 "File delivery").
    pub fn declare_url_cache(&self, cache_name: impl Into<String>, url: impl Into<String>, expected_size: u64, mode: u32) -> Result<()> {
        self.send(dispatcher::DispatcherMsg::DeclareCache(
            cache_name.into(),
            CacheDeclaration { source: CacheSource::Url(url.into()), expected_size, mode },
        ))
    }

    /// Register a cache object materialized by a producer command on the
    /// worker (`%%` substituted for the target path).
    pub fn declare_command_cache(&self, cache_name: impl Into<String>, shell_template: impl Into<String>, expected_size: u64, mode: u32) -> Result<()> {
        self.send(dispatcher::DispatcherMsg::DeclareCache(
            cache_name.into(),
            CacheDeclaration { source: CacheSource::Command(shell_template.into()), expected_size, mode },
        ))
    }

    fn send(&self, msg: dispatcher::DispatcherMsg) -> Result<()> {
        self.tx.send(msg).map_err(|_| ErrorKind::PeerGone("dispatcher gone".to_string()).into())
    }
}

async fn accept_loop(listener: TcpListener, auth_chain: Arc<AuthChain>, dispatcher_tx: mpsc::UnboundedSender<dispatcher::DispatcherMsg>) {
    let mut next_worker_id: WorkerId = 1;
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!("accept failed: {}", e);
                continue;
            }
        };
        let worker_id = next_worker_id;
        next_worker_id += 1;
        let auth_chain = auth_chain.clone();
        let dispatcher_tx = dispatcher_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = session::run_session(stream, worker_id, auth_chain, dispatcher_tx).await {
                error!("session with {} ended: {}", peer, e);
            }
        });
    }
}
