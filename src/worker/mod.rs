//! Worker runtime: connects to a manager, negotiates auth, announces its
//! resources, then alternates serving cache-maintenance verbs and running
//! tasks as sandboxed child processes (spec.md §5, §6.2).

mod sandbox;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::auth::AuthChain;
use crate::cache::{CacheKind, WorkerCache};
use crate::errors::*;
use crate::link::{Link, LinkWriter};
use crate::protocol::{read_manager_message, write_worker_message, ManagerMessage, WorkerMessage};
use crate::resources::ResourceVector;
use crate::task::TaskId;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
/// No message is expected to take longer than this to arrive; a read past
/// this deadline just means the manager went quiet, not a protocol error.
const IDLE_READ_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub manager_addr: std::net::SocketAddr,
    pub worker_name: String,
    pub cache_dir: PathBuf,
    pub sandbox_root: PathBuf,
    pub resources: ResourceVector,
}

impl WorkerConfig {
    /// Fill unset resource fields from the OS (spec.md §2 "Configuration":
    /// `num_cpus`/best-effort OS queries as fallback).
    pub fn detect_defaults(mut self) -> Self {
        if self.resources.cores.is_none() {
            self.resources.cores = Some(num_cpus::get() as u64);
        }
        if self.resources.gpus.is_none() {
            self.resources.gpus = Some(0);
        }
        self
    }
}

struct RunningTasks {
    handles: Mutex<HashMap<TaskId, JoinHandle<()>>>,
}

impl RunningTasks {
    fn new() -> Self {
        RunningTasks { handles: Mutex::new(HashMap::new()) }
    }

    async fn insert(&self, task_id: TaskId, handle: JoinHandle<()>) {
        self.handles.lock().await.insert(task_id, handle);
    }

    async fn remove(&self, task_id: TaskId) {
        self.handles.lock().await.remove(&task_id);
    }

    async fn kill(&self, task_id: TaskId) {
        if let Some(handle) = self.handles.lock().await.remove(&task_id) {
            handle.abort();
        }
    }
}

/// Connect, authenticate, announce resources, and serve the manager until
/// the connection ends or `exit` is received.
pub async fn run(config: WorkerConfig, auth_chain: AuthChain) -> Result<()> {
    std::fs::create_dir_all(&config.sandbox_root)?;
    let cache = Arc::new(WorkerCache::new(&config.cache_dir)?);
    cache.replay_journal().await?;

    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
    let mut link = Link::connect(config.manager_addr, deadline).await?;
    let identity = auth_chain.assert(&mut link, deadline).await?;
    info!("authenticated to manager as {}:{}", identity.method, identity.subject);

    let r = &config.resources;
    link.write_line(
        &format!(
            "ready {} {} {} {} {} {}",
            config.worker_name,
            r.cores.unwrap_or(0),
            r.memory_mb.unwrap_or(0),
            r.disk_mb.unwrap_or(0),
            r.gpus.unwrap_or(0),
            config.sandbox_root.display(),
        ),
        deadline,
    )
    .await?;

    let (mut reader, writer) = link.into_split();
    let writer = Arc::new(Mutex::new(writer));
    let running = Arc::new(RunningTasks::new());

    loop {
        let deadline = Instant::now() + IDLE_READ_TIMEOUT;
        let msg = match read_manager_message(&mut reader, deadline).await {
            Ok(msg) => msg,
            Err(e) => {
                info!("manager link closed: {}", e);
                break;
            }
        };
        match msg {
            ManagerMessage::Exit => {
                info!("manager requested exit");
                break;
            }
            ManagerMessage::Ping => {
                send(&writer, WorkerMessage::Alive).await;
            }
            ManagerMessage::File { cache_name, size, mode, bytes } => {
                let start = Instant::now();
                match store_pushed_file(&cache, &cache_name, mode, &bytes).await {
                    Ok(()) => {
                        debug!("stored pushed file {} ({} bytes)", cache_name, size);
                        send(&writer, WorkerMessage::CacheUpdate {
                            cache_name,
                            size,
                            elapsed_usec: start.elapsed().as_micros() as u64,
                        }).await;
                    }
                    Err(e) => {
                        warn!("couldn't store pushed file {}: {}", cache_name, e);
                        send(&writer, WorkerMessage::CacheInvalid { cache_name, message: e.to_string() }).await;
                    }
                }
            }
            ManagerMessage::PutUrl { cache_name, url, size, mode } => {
                let _ = cache.queue(&cache_name, CacheKind::Url, &url, size as i64, mode).await;
                spawn_ensure(cache.clone(), writer.clone(), cache_name);
            }
            ManagerMessage::PutCmd { cache_name, shell_template, size, mode } => {
                let _ = cache.queue(&cache_name, CacheKind::ProducerCommand, &shell_template, size as i64, mode).await;
                spawn_ensure(cache.clone(), writer.clone(), cache_name);
            }
            ManagerMessage::Unlink { cache_name } => {
                let _ = cache.remove(&cache_name).await;
            }
            ManagerMessage::GetFile { cache_name } => {
                send_file(&cache, &writer, &cache_name).await;
            }
            ManagerMessage::Task(wire) => {
                let task_id = wire.task_id;
                let cache = cache.clone();
                let writer = writer.clone();
                let sandbox_root = config.sandbox_root.clone();
                let handle = tokio::spawn(async move {
                    sandbox::run_task(wire, cache, writer, sandbox_root).await;
                });
                running.insert(task_id, handle).await;
            }
            ManagerMessage::Kill { task_id } => {
                running.kill(task_id).await;
            }
        }
        running_cleanup(&running).await;
    }
    Ok(())
}

/// Drop join handles for tasks that finished on their own, so the map
/// doesn't grow unboundedly.
async fn running_cleanup(running: &RunningTasks) {
    let mut handles = running.handles.lock().await;
    handles.retain(|_, h| !h.is_finished());
}

fn spawn_ensure(cache: Arc<WorkerCache>, writer: Arc<Mutex<LinkWriter>>, cache_name: String) {
    tokio::spawn(async move {
        let deadline = Instant::now() + Duration::from_secs(3600);
        let mut guard = writer.lock().await;
        if let Err(e) = cache.ensure(&cache_name, &mut *guard, deadline).await {
            error!("ensure({}) failed: {}", cache_name, e);
        }
    });
}

async fn store_pushed_file(cache: &WorkerCache, cache_name: &str, mode: u32, bytes: &[u8]) -> Result<()> {
    let path = cache.full_path(cache_name);
    std::fs::write(&path, bytes)?;
    sandbox::set_mode(&path, mode);
    cache.add_file(cache_name, bytes.len() as i64).await
}

async fn send_file(cache: &WorkerCache, writer: &Arc<Mutex<LinkWriter>>, cache_name: &str) {
    let obj = match cache.get(cache_name).await {
        Some(obj) if obj.present => obj,
        _ => {
            warn!("getfile for absent object {}", cache_name);
            return;
        }
    };
    let bytes = match std::fs::read(cache.full_path(cache_name)) {
        Ok(b) => b,
        Err(e) => {
            warn!("couldn't read {} for getfile: {}", cache_name, e);
            return;
        }
    };
    let msg = WorkerMessage::FileStream { cache_name: cache_name.to_string(), size: bytes.len() as u64, mode: obj.mode, bytes };
    send(writer, msg).await;
}

async fn send(writer: &Arc<Mutex<LinkWriter>>, msg: WorkerMessage) {
    let deadline = Instant::now() + Duration::from_secs(30);
    let mut guard = writer.lock().await;
    if let Err(e) = write_worker_message(&mut *guard, &msg, deadline).await {
        warn!("write to manager failed: {}", e);
    }
}
