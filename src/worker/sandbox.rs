//! Task execution: populate an isolated sandbox directory from the cache,
//! run the command as a child process, sample its peak memory, and return
//! results to the manager (spec.md §5 "Worker").

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::cache::WorkerCache;
use crate::errors::*;
use crate::link::LinkWriter;
use crate::protocol::{write_worker_message, WireTask, WorkerMessage};

const RSS_SAMPLE_INTERVAL: Duration = Duration::from_millis(200);
/// Worker-enforced soft memory kill, reported with the same sentinel the
/// category engine's overflow retry contract expects (spec.md §4.4).
const RESOURCE_OVERFLOW_STATUS: i32 = 137;
/// Exit code `timeout(1)` uses on a wall-clock breach; reused here for the
/// worker's own wall-time enforcement.
const WALL_TIME_EXCEEDED_STATUS: i32 = 124;

pub async fn run_task(wire: WireTask, cache: Arc<WorkerCache>, writer: Arc<Mutex<LinkWriter>>, sandbox_root: PathBuf) {
    let task_id = wire.task_id;
    let sandbox_dir = sandbox_root.join(format!("task-{}", task_id));

    if let Err(e) = prepare_sandbox(&sandbox_dir, &wire, &cache).await {
        warn!("task {}: sandbox setup failed: {}", task_id, e);
        report(&writer, task_id, -1, Vec::new(), 0, 0).await;
        return;
    }

    let deadline_note = wire.resources.wall_time_s.map(Duration::from_secs);
    let start = Instant::now();
    let (return_status, stdout, peak_memory_mb) = match execute(&wire, &sandbox_dir, deadline_note).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!("task {}: execution error: {}", task_id, e);
            (-1, Vec::new(), 0)
        }
    };
    let elapsed_usec = start.elapsed().as_micros() as u64;

    if let Err(e) = collect_outputs(&sandbox_dir, &wire, &cache).await {
        warn!("task {}: couldn't collect outputs: {}", task_id, e);
    }
    let _ = std::fs::remove_dir_all(&sandbox_dir);

    report(&writer, task_id, return_status, stdout, elapsed_usec, peak_memory_mb).await;
}

async fn prepare_sandbox(sandbox_dir: &Path, wire: &WireTask, cache: &WorkerCache) -> Result<()> {
    std::fs::create_dir_all(sandbox_dir)
        .chain_err(|| ErrorKind::SandboxError(format!("couldn't create {}", sandbox_dir.display())))?;
    for cache_name in &wire.inputs {
        let source = cache.full_path(cache_name);
        let target = sandbox_dir.join(cache_name);
        if std::fs::hard_link(&source, &target).is_err() {
            std::fs::copy(&source, &target)
                .chain_err(|| ErrorKind::SandboxError(format!("couldn't stage input {}", cache_name)))?;
        }
    }
    Ok(())
}

async fn collect_outputs(sandbox_dir: &Path, wire: &WireTask, cache: &WorkerCache) -> std::io::Result<()> {
    for cache_name in &wire.outputs {
        let produced = sandbox_dir.join(cache_name);
        if !produced.exists() {
            warn!("task {}: declared output {} was not produced", wire.task_id, cache_name);
            continue;
        }
        let target = cache.full_path(cache_name);
        if std::fs::hard_link(&produced, &target).is_err() {
            std::fs::copy(&produced, &target)?;
        }
        let size = std::fs::metadata(&target)?.len();
        let _ = cache.add_file(cache_name, size as i64).await;
    }
    Ok(())
}

/// Run the command line in `sandbox_dir`, sampling peak RSS while it runs
/// and enforcing the task's memory/wall-time limits if they're set
/// (spec.md §5: "child reaping uses a timeout so the event loop is never
/// blocked").
async fn execute(wire: &WireTask, sandbox_dir: &Path, wall_time: Option<Duration>) -> crate::errors::Result<(i32, Vec<u8>, u64)> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(&wire.cmd)
        .current_dir(sandbox_dir)
        .envs(&wire.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?;

    let pid = child.id();
    let mut stdout_pipe = child.stdout.take();
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = stdout_pipe.take() {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });

    let memory_limit = wire.resources.memory_mb;
    let mut ticker = tokio::time::interval(RSS_SAMPLE_INTERVAL);
    let mut peak_mb: u64 = 0;
    let mut overflow = false;

    let wait_body = async {
        loop {
            tokio::select! {
                status = child.wait() => return status,
                _ = ticker.tick() => {
                    if let Some(pid) = pid {
                        let rss = read_peak_rss_mb(pid);
                        peak_mb = peak_mb.max(rss);
                        if let Some(limit) = memory_limit {
                            if rss > limit && !overflow {
                                overflow = true;
                                let _ = child.start_kill();
                            }
                        }
                    }
                }
            }
        }
    };

    let status = match wall_time {
        Some(limit) => match tokio::time::timeout(limit, wait_body).await {
            Ok(status) => status,
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                let stdout = stdout_task.await.unwrap_or_default();
                return Ok((WALL_TIME_EXCEEDED_STATUS, stdout, peak_mb.max(read_peak_rss_mb(pid.unwrap_or(0)))));
            }
        },
        None => wait_body.await,
    }?;

    let stdout = stdout_task.await.unwrap_or_default();
    let return_status = if overflow { RESOURCE_OVERFLOW_STATUS } else { exit_code(&status) };
    info!("task sandboxed in {}: exit {}, peak {} MB", sandbox_dir.display(), return_status, peak_mb);
    Ok((return_status, stdout, peak_mb))
}

#[cfg(unix)]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.code().unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

#[cfg(not(unix))]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[cfg(target_os = "linux")]
fn read_peak_rss_mb(pid: u32) -> u64 {
    let path = format!("/proc/{}/status", pid);
    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(_) => return 0,
    };
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("VmHWM:") {
            let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().unwrap_or(0);
            return kb / 1024;
        }
    }
    0
}

#[cfg(not(target_os = "linux"))]
fn read_peak_rss_mb(_pid: u32) -> u64 {
    0
}

async fn report(writer: &Arc<Mutex<LinkWriter>>, task_id: u64, return_status: i32, stdout: Vec<u8>, elapsed_usec: u64, peak_memory_mb: u64) {
    let msg = WorkerMessage::Result { task_id, return_status, stdout, elapsed_usec, peak_memory_mb };
    let deadline = Instant::now() + Duration::from_secs(60);
    let mut guard = writer.lock().await;
    if let Err(e) = write_worker_message(&mut *guard, &msg, deadline).await {
        warn!("couldn't report result for task {}: {}", task_id, e);
    }
}

#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode));
}

#[cfg(not(unix))]
pub fn set_mode(_path: &Path, _mode: u32) {}
