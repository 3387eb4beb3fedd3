//! The Task / FileSpec data model (spec.md §3).

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::resources::ResourceVector;

pub type TaskId = u64;
pub type WorkerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Ready,
    Dispatched,
    Running,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskResult {
    Unset,
    Success,
    InputMissing,
    OutputMissing,
    SignalKilled,
    ResourceExhaustion,
    TransferError,
    WorkerDisconnect,
}

/// Per-task scheduling policy (spec.md §4.5 "Scheduling policy").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulingAlgorithm {
    Files,
    Fcfs,
    Time,
    Random,
}

impl Default for SchedulingAlgorithm {
    fn default() -> Self {
        SchedulingAlgorithm::Files
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileDirection {
    Input,
    Output,
}

/// A declared input or output file attached to a task (spec.md §3
/// "FileSpec").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSpec {
    /// Path on the manager: read from here for inputs, written here from
    /// the returned stream for outputs.
    pub local_path: String,
    /// Stable name for the object in the worker's cache.
    pub cache_name: String,
    /// If false, the worker purges the object after the task finishes.
    pub cache: bool,
    pub direction: FileDirection,
    /// POSIX mode bits to restore after transfer.
    pub mode: u32,
}

impl FileSpec {
    pub fn input(local_path: impl Into<String>, cache_name: impl Into<String>, cache: bool) -> Self {
        FileSpec {
            local_path: local_path.into(),
            cache_name: cache_name.into(),
            cache,
            direction: FileDirection::Input,
            mode: 0o644,
        }
    }

    pub fn output(cache_name: impl Into<String>, local_path: impl Into<String>, cache: bool) -> Self {
        FileSpec {
            local_path: local_path.into(),
            cache_name: cache_name.into(),
            cache,
            direction: FileDirection::Output,
            mode: 0o644,
        }
    }
}

fn now_monotonic_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A unit of work (spec.md §3 "Task").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub command_line: String,
    pub tag: String,
    pub category: String,
    pub inputs: Vec<FileSpec>,
    pub outputs: Vec<FileSpec>,
    pub environment: HashMap<String, String>,
    pub requested_resources: ResourceVector,
    pub state: TaskState,
    pub result: TaskResult,
    pub return_status: i32,
    pub assigned_worker: Option<WorkerId>,
    pub submit_time: u64,
    pub start_time: Option<u64>,
    pub finish_time: Option<u64>,
    pub priority: i64,
    pub algorithm: Option<SchedulingAlgorithm>,
    /// Number of times this task has been resubmitted after a disconnect
    /// or overflow retry.
    pub resubmissions: u32,
    /// Current two-step allocation label, mirroring the category engine's
    /// `next_label` contract (spec.md §4.4).
    pub allocation_label: AllocationLabel,
    /// Output captured from the most recent run, if any.
    pub output: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationLabel {
    First,
    Max,
    Error,
}

impl Task {
    pub fn new(task_id: TaskId, command_line: impl Into<String>) -> Self {
        Task {
            task_id,
            command_line: command_line.into(),
            tag: String::new(),
            category: "default".to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            environment: HashMap::new(),
            requested_resources: ResourceVector::new(),
            state: TaskState::Ready,
            result: TaskResult::Unset,
            return_status: 0,
            assigned_worker: None,
            submit_time: now_monotonic_ms(),
            start_time: None,
            finish_time: None,
            priority: 0,
            algorithm: None,
            resubmissions: 0,
            allocation_label: AllocationLabel::First,
            output: String::new(),
        }
    }

    pub fn input_cache_names(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().map(|f| f.cache_name.as_str())
    }

    pub fn output_cache_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(|f| f.cache_name.as_str())
    }

    /// Revert a Dispatched/Running task back to Ready after a disconnect
    /// or retriable overflow, incrementing its resubmission count
    /// (spec.md §3 "Lifecycle").
    pub fn revert_to_ready(&mut self) {
        self.state = TaskState::Ready;
        self.assigned_worker = None;
        self.resubmissions += 1;
    }

    pub fn mark_dispatched(&mut self, worker_id: WorkerId) {
        self.state = TaskState::Dispatched;
        self.assigned_worker = Some(worker_id);
    }

    pub fn mark_running(&mut self) {
        self.state = TaskState::Running;
        self.start_time = Some(now_monotonic_ms());
    }

    pub fn mark_done(&mut self, return_status: i32, output: String) {
        self.state = TaskState::Done;
        self.result = TaskResult::Success;
        self.return_status = return_status;
        self.output = output;
        self.finish_time = Some(now_monotonic_ms());
    }

    pub fn mark_failed(&mut self, result: TaskResult) {
        self.state = TaskState::Failed;
        self.result = result;
        self.finish_time = Some(now_monotonic_ms());
    }
}
