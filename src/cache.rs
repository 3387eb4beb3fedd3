//! C3: Worker Cache.
//!
//! A named-object store under a per-worker directory, materializing
//! objects by transfer, URL download, or producer command, with an
//! at-most-one-concurrent-build guarantee per name (spec.md §4.3).
//! Grounded directly in `original_source/work_queue/src/work_queue_cache.c`
//! (`work_queue_cache_addfile`/`_queue`/`_ensure`/`_remove`) and
//! `dataswarm/src/worker/ds_cache.c`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};

use crate::errors::*;
use crate::link::LinkWrite;
use crate::protocol::{write_worker_message, WorkerMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheKind {
    PushedByManager,
    Url,
    ProducerCommand,
}

/// One entry in the cache (spec.md §3 "CacheObject (worker side)").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheObject {
    pub cache_name: String,
    pub kind: CacheKind,
    /// URL for `Url`; shell template containing `%%` for `ProducerCommand`;
    /// ignored for `PushedByManager`.
    pub source: String,
    pub expected_size: i64,
    pub actual_size: i64,
    pub mode: u32,
    pub present: bool,
}

/// One journal record, appended to the on-disk journal and replayed on
/// worker boot (spec.md §6.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op")]
enum JournalRecord {
    Queued { cache_name: String, kind: CacheKind, source: String, expected_size: i64, mode: u32 },
    AddFile { cache_name: String, size: i64 },
    Present { cache_name: String, actual_size: i64 },
    Invalid { cache_name: String },
    Removed { cache_name: String },
}

/// The worker-side cache manager.
pub struct WorkerCache {
    cache_dir: PathBuf,
    journal_path: PathBuf,
    table: Mutex<HashMap<String, CacheObject>>,
    /// At-most-one-build lock table: a name present here means a
    /// materialization is already in flight; other callers await its
    /// `Notify` instead of racing the producer (spec.md §4.3
    /// "At-most-one-build invariant").
    in_flight: Mutex<HashMap<String, Arc<Notify>>>,
}

impl WorkerCache {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let cache_dir = cache_dir.into();
        std::fs::create_dir_all(&cache_dir)?;
        let journal_path = cache_dir.join("journal.ndjson");
        let cache = WorkerCache {
            cache_dir,
            journal_path,
            table: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        };
        Ok(cache)
    }

    /// Replay the journal from disk, trusting a `present` record only if a
    /// later `stat` confirms the file size (spec.md §6.3: "present =
    /// confirmed by stat").
    pub async fn replay_journal(&self) -> Result<()> {
        if !self.journal_path.exists() {
            return Ok(());
        }
        let contents = std::fs::read_to_string(&self.journal_path)?;
        let mut table = self.table.lock().await;
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let record: JournalRecord = serde_json::from_str(line)?;
            match record {
                JournalRecord::Queued { cache_name, kind, source, expected_size, mode } => {
                    table.insert(cache_name.clone(), CacheObject {
                        cache_name,
                        kind,
                        source,
                        expected_size,
                        actual_size: 0,
                        mode,
                        present: false,
                    });
                }
                JournalRecord::AddFile { cache_name, size } => {
                    table.insert(cache_name.clone(), CacheObject {
                        cache_name,
                        kind: CacheKind::PushedByManager,
                        source: "manager".to_string(),
                        expected_size: size,
                        actual_size: size,
                        mode: 0o755,
                        present: false,
                    });
                }
                JournalRecord::Present { cache_name, actual_size } => {
                    if let Some(obj) = table.get_mut(&cache_name) {
                        obj.actual_size = actual_size;
                        obj.present = true;
                    }
                }
                JournalRecord::Invalid { cache_name } => {
                    if let Some(obj) = table.get_mut(&cache_name) {
                        obj.present = false;
                    }
                }
                JournalRecord::Removed { cache_name } => {
                    table.remove(&cache_name);
                }
            }
        }
        // Demote any entry claimed present whose file no longer matches.
        for obj in table.values_mut() {
            if obj.present {
                let path = self.cache_dir.join(&obj.cache_name);
                let confirmed = std::fs::metadata(&path).map(|m| m.len() as i64 == obj.actual_size).unwrap_or(false);
                if !confirmed {
                    warn!("cache: {} claimed present in journal but stat disagrees, demoting", obj.cache_name);
                    obj.present = false;
                }
            }
        }
        Ok(())
    }

    fn append_journal(&self, record: &JournalRecord) -> Result<()> {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&self.journal_path)?;
        let line = serde_json::to_string(record)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    pub fn full_path(&self, cache_name: &str) -> PathBuf {
        self.cache_dir.join(cache_name)
    }

    /// The manager has pushed a file of known size directly into the
    /// cache directory; register it as present (spec.md §4.3 "add_file").
    pub async fn add_file(&self, cache_name: &str, size: i64) -> Result<()> {
        let mut table = self.table.lock().await;
        table.insert(cache_name.to_string(), CacheObject {
            cache_name: cache_name.to_string(),
            kind: CacheKind::PushedByManager,
            source: "manager".to_string(),
            expected_size: size,
            actual_size: size,
            mode: 0o644,
            present: true,
        });
        drop(table);
        self.append_journal(&JournalRecord::AddFile { cache_name: cache_name.to_string(), size })?;
        self.append_journal(&JournalRecord::Present { cache_name: cache_name.to_string(), actual_size: size })?;
        Ok(())
    }

    /// Record an intent to materialize later; no I/O happens yet
    /// (spec.md §4.3 "queue").
    pub async fn queue(&self, cache_name: &str, kind: CacheKind, source: &str, expected_size: i64, mode: u32) -> Result<()> {
        let mut table = self.table.lock().await;
        table.insert(cache_name.to_string(), CacheObject {
            cache_name: cache_name.to_string(),
            kind,
            source: source.to_string(),
            expected_size,
            actual_size: 0,
            mode,
            present: false,
        });
        drop(table);
        self.append_journal(&JournalRecord::Queued {
            cache_name: cache_name.to_string(),
            kind,
            source: source.to_string(),
            expected_size,
            mode,
        })
    }

    /// Remove a named item from the cache (spec.md §4.3 "Eviction").
    pub async fn remove(&self, cache_name: &str) -> Result<bool> {
        let mut table = self.table.lock().await;
        let existed = table.remove(cache_name).is_some();
        drop(table);
        if existed {
            let _ = std::fs::remove_file(self.full_path(cache_name));
            self.append_journal(&JournalRecord::Removed { cache_name: cache_name.to_string() })?;
        }
        Ok(existed)
    }

    pub async fn contains_present(&self, cache_name: &str) -> bool {
        self.table.lock().await.get(cache_name).map(|o| o.present).unwrap_or(false)
    }

    pub async fn get(&self, cache_name: &str) -> Option<CacheObject> {
        self.table.lock().await.get(cache_name).cloned()
    }

    /// Materialize `cache_name` if not already present, reporting the
    /// result back to the manager over `manager_link`. Returns whether
    /// the object is now present (spec.md §4.3 "ensure").
    pub async fn ensure<L: LinkWrite>(&self, cache_name: &str, manager_link: &mut L, deadline: Instant) -> Result<bool> {
        // Fast path: nothing to do.
        {
            let table = self.table.lock().await;
            match table.get(cache_name) {
                None => {
                    let miss: Error = ErrorKind::CacheMiss(cache_name.to_string()).into();
                    debug!("{}, perhaps it failed to transfer earlier?", miss);
                    return Ok(false);
                }
                Some(obj) if obj.present => return Ok(true),
                Some(_) => {}
            }
        }

        // At-most-one-build: claim the name, or wait on whoever holds it.
        let notify = {
            let mut in_flight = self.in_flight.lock().await;
            if let Some(existing) = in_flight.get(cache_name) {
                Some(existing.clone())
            } else {
                in_flight.insert(cache_name.to_string(), Arc::new(Notify::new()));
                None
            }
        };
        if let Some(notify) = notify {
            notify.notified().await;
            return Ok(self.contains_present(cache_name).await);
        }

        let result = self.materialize(cache_name, manager_link, deadline).await;

        let notify = self.in_flight.lock().await.remove(cache_name);
        if let Some(notify) = notify {
            notify.notify_waiters();
        }
        result
    }

    async fn materialize<L: LinkWrite>(&self, cache_name: &str, manager_link: &mut L, deadline: Instant) -> Result<bool> {
        // The entry can vanish between `ensure`'s presence check and here if
        // a concurrent `unlink` races in — not a bug, just a build that no
        // longer has anything to build.
        let obj = match self.table.lock().await.get(cache_name).cloned() {
            Some(obj) => obj,
            None => {
                debug!("cache: {} vanished before materialization could start", cache_name);
                return Ok(false);
            }
        };
        let target = self.full_path(cache_name);
        let start = Instant::now();

        let outcome: std::result::Result<(), String> = match obj.kind {
            CacheKind::PushedByManager => Err("object should already be present".to_string()),
            CacheKind::Url => materialize_url(&obj.source, &target).await,
            CacheKind::ProducerCommand => materialize_command(&obj.source, &target).await,
        };

        if outcome.is_ok() {
            let _ = set_mode(&target, obj.mode);
        }

        let elapsed = start.elapsed();
        match (outcome, std::fs::metadata(&target)) {
            (Ok(()), Ok(meta)) => {
                let actual_size = meta.len() as i64;
                {
                    let mut table = self.table.lock().await;
                    if let Some(entry) = table.get_mut(cache_name) {
                        entry.actual_size = actual_size;
                        entry.present = true;
                    }
                }
                self.append_journal(&JournalRecord::Present { cache_name: cache_name.to_string(), actual_size })?;
                info!("cache: {} materialized ({} bytes, {:?})", cache_name, actual_size, elapsed);
                write_worker_message(
                    manager_link,
                    &WorkerMessage::CacheUpdate { cache_name: cache_name.to_string(), size: actual_size as u64, elapsed_usec: elapsed.as_micros() as u64 },
                    deadline,
                ).await?;
                Ok(true)
            }
            (outcome, stat) => {
                let reason = match outcome {
                    Err(e) => e,
                    Ok(()) => format!("target file missing after materialization: {:?}", stat.err()),
                };
                let _ = std::fs::remove_file(&target);
                {
                    let mut table = self.table.lock().await;
                    if let Some(entry) = table.get_mut(cache_name) {
                        entry.present = false;
                    }
                }
                self.append_journal(&JournalRecord::Invalid { cache_name: cache_name.to_string() })?;
                let err: Error = ErrorKind::MaterializationFailed(cache_name.to_string(), reason.clone()).into();
                warn!("{}", err);
                write_worker_message(
                    manager_link,
                    &WorkerMessage::CacheInvalid { cache_name: cache_name.to_string(), message: reason },
                    deadline,
                ).await?;
                Ok(false)
            }
        }
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

/// Fetch a URL to `target`, following redirects (spec.md §4.3 "URL"),
/// grounded in `work_queue_cache.c`'s `do_transfer` (`curl -sSL`).
async fn materialize_url(url: &str, target: &Path) -> std::result::Result<(), String> {
    let url = url.to_string();
    let target = target.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let client = reqwest::blocking::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| e.to_string())?;
        let mut resp = client.get(&url).send().map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("http status {}", resp.status()));
        }
        let mut file = std::fs::File::create(&target).map_err(|e| e.to_string())?;
        std::io::copy(&mut resp, &mut file).map_err(|e| e.to_string())?;
        Ok(())
    })
    .await
    .map_err(|e| e.to_string())?
}

/// Run a producer command, substituting `%%` with the target path
/// (spec.md §4.3 "ProducerCommand"), grounded in `work_queue_cache.c`'s
/// `do_command` (`string_replace_percents`).
async fn materialize_command(template: &str, target: &Path) -> std::result::Result<(), String> {
    let command = template.replace("%%", &target.to_string_lossy());
    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(&command)
        .output()
        .await
        .map_err(|e| format!("couldn't execute \"{}\": {}", command, e))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(String::from_utf8_lossy(&output.stderr).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::Link;

    #[tokio::test]
    async fn add_file_is_present_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let cache = WorkerCache::new(dir.path()).unwrap();
        cache.add_file("data.bin", 1024).await.unwrap();
        assert!(cache.contains_present("data.bin").await);
    }

    #[tokio::test]
    async fn ensure_unknown_name_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let cache = WorkerCache::new(dir.path()).unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move { listener.accept().await.unwrap(); });
        let deadline = Instant::now() + std::time::Duration::from_secs(2);
        let mut link = Link::connect(addr, deadline).await.unwrap();
        let ok = cache.ensure("nonexistent", &mut link, deadline).await.unwrap();
        assert!(!ok);
    }

    /// Property 2: N concurrent `ensure` calls on the same cache_name
    /// invoke the producer command exactly once; the other N-1 callers
    /// wait and observe the same successful result.
    #[tokio::test]
    async fn concurrent_ensures_invoke_producer_at_most_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(WorkerCache::new(dir.path()).unwrap());
        let marker = dir.path().join("invocations");
        std::fs::write(&marker, "").unwrap();

        // Producer command appends a line to a counter file each time it
        // runs, then writes the cache content itself.
        let command = format!("echo ran >> {} && echo payload > %%", marker.display());
        cache.queue("built.bin", CacheKind::ProducerCommand, &command, 8, 0o644).await.unwrap();

        const N: usize = 5;
        let mut servers = Vec::new();
        let mut addrs = Vec::new();
        for _ in 0..N {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            addrs.push(listener.local_addr().unwrap());
            servers.push(listener);
        }

        let server_tasks: Vec<_> = servers
            .into_iter()
            .map(|listener| {
                tokio::spawn(async move {
                    let (stream, _) = listener.accept().await.unwrap();
                    let mut link = Link::new(stream).unwrap();
                    let deadline = Instant::now() + std::time::Duration::from_secs(5);
                    // Accept either a cache-update (the builder) or
                    // nothing at all (a waiter never reports back).
                    let _ = tokio::time::timeout(
                        std::time::Duration::from_millis(500),
                        crate::protocol::read_worker_message(&mut link, deadline),
                    ).await;
                })
            })
            .collect();

        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        let mut ensure_tasks = Vec::new();
        for addr in addrs {
            let cache = cache.clone();
            ensure_tasks.push(tokio::spawn(async move {
                let mut link = Link::connect(addr, deadline).await.unwrap();
                cache.ensure("built.bin", &mut link, deadline).await.unwrap()
            }));
        }

        let mut results = Vec::new();
        for t in ensure_tasks {
            results.push(t.await.unwrap());
        }
        for t in server_tasks {
            t.await.unwrap();
        }

        assert!(results.iter().all(|ok| *ok), "all N ensures must observe present=true");
        let runs = std::fs::read_to_string(&marker).unwrap().lines().filter(|l| *l == "ran").count();
        assert_eq!(runs, 1, "producer must run exactly once across N concurrent ensures");
    }
}
