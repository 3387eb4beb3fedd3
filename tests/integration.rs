//! End-to-end tests driving a real manager and real (or deliberately
//! misbehaving) workers over loopback TCP (spec.md §8 "Testable Properties"
//! and "End-to-End Scenarios").

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use workqueue_core::auth::{AddressAuth, AuthChain};
use workqueue_core::link::Link;
use workqueue_core::protocol::{read_manager_message, ManagerMessage};
use workqueue_core::resources::ResourceVector;
use workqueue_core::task::FileSpec;
use workqueue_core::worker::{self, WorkerConfig};
use workqueue_core::{ErrorKind, Manager, ManagerConfig, Task, TaskResult, TaskState};

fn test_auth_chain() -> AuthChain {
    AuthChain::new().register(Box::new(AddressAuth))
}

async fn start_manager(max_resubmissions: u32) -> Manager {
    let config = ManagerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        max_resubmissions,
        ..ManagerConfig::default()
    };
    Manager::start(config, test_auth_chain()).await.expect("manager should start")
}

/// Spawn a real worker, keeping its scratch directories alive for as long
/// as the returned guards are in scope.
async fn spawn_worker(addr: SocketAddr, name: &str, resources: ResourceVector) -> (tokio::task::JoinHandle<()>, TempDir, TempDir) {
    let cache_dir = tempfile::tempdir().unwrap();
    let sandbox_dir = tempfile::tempdir().unwrap();
    let config = WorkerConfig {
        manager_addr: addr,
        worker_name: name.to_string(),
        cache_dir: cache_dir.path().to_path_buf(),
        sandbox_root: sandbox_dir.path().to_path_buf(),
        resources,
    };
    let handle = tokio::spawn(async move {
        let _ = worker::run(config, test_auth_chain()).await;
    });
    (handle, cache_dir, sandbox_dir)
}

async fn wait_for_workers(manager: &Manager, n: usize, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        let stats = manager.stats().await.unwrap();
        if stats.workers_connected >= n {
            return;
        }
        if Instant::now() >= deadline {
            panic!("timed out waiting for {} worker(s) to connect", n);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Scenario 1 (spec.md §8): a task with no inputs/outputs runs to
/// completion and its stdout is reported back to the manager.
#[tokio::test]
async fn echo_task_runs_end_to_end() {
    let manager = start_manager(3).await;
    let addr = manager.local_addr();
    let (_worker, _cache_dir, _sandbox_dir) = spawn_worker(addr, "worker-1", ResourceVector::full(2, 1024, 1024, 0)).await;
    wait_for_workers(&manager, 1, Duration::from_secs(5)).await;

    let task = Task::new(0, "echo hello-from-worker");
    let task_id = manager.submit(task).await.unwrap();

    let result = manager.wait(Duration::from_secs(10)).await.unwrap().expect("task should complete");
    assert_eq!(result.task_id, task_id);
    assert_eq!(result.state, TaskState::Done);
    assert_eq!(result.result, TaskResult::Success);
    assert_eq!(result.return_status, 0);
    assert!(result.output.contains("hello-from-worker"), "output was: {:?}", result.output);
}

/// Scenario 2 (spec.md §8): a cache object pushed for one task is reused by
/// a later task without the manager re-reading the source file. The second
/// task's `FileSpec::local_path` deliberately points at a file that does
/// not exist — if the dispatcher ever re-read it, dispatch would fail with
/// `InputMissing` instead of succeeding from the worker's cache.
#[tokio::test]
async fn cached_input_is_reused_without_rereading_source() {
    let manager = start_manager(3).await;
    let addr = manager.local_addr();
    let (_worker, _cache_dir, _sandbox_dir) = spawn_worker(addr, "worker-1", ResourceVector::full(2, 1024, 1024, 0)).await;
    wait_for_workers(&manager, 1, Duration::from_secs(5)).await;

    let input_dir = tempfile::tempdir().unwrap();
    let source_path = input_dir.path().join("source.txt");
    std::fs::write(&source_path, "shared-content\n").unwrap();
    // A second, genuinely existing file with different content. It passes
    // manager-side submission validation (spec.md §7 "ConfigError ...
    // input file not found on manager") but must never actually be read,
    // since the worker already has "shared.txt" cached under that name.
    let distractor_path = input_dir.path().join("distractor.txt");
    std::fs::write(&distractor_path, "distractor-content\n").unwrap();

    let mut task1 = Task::new(0, "cat shared.txt");
    task1.inputs.push(FileSpec::input(source_path.to_string_lossy().to_string(), "shared.txt", true));
    let task1_id = manager.submit(task1).await.unwrap();

    let result1 = manager.wait(Duration::from_secs(10)).await.unwrap().expect("task1 should complete");
    assert_eq!(result1.task_id, task1_id);
    assert_eq!(result1.result, TaskResult::Success);
    assert!(result1.output.contains("shared-content"));

    let mut task2 = Task::new(0, "cat shared.txt");
    task2.inputs.push(FileSpec::input(distractor_path.to_string_lossy().to_string(), "shared.txt", true));
    let task2_id = manager.submit(task2).await.unwrap();

    let result2 = manager.wait(Duration::from_secs(10)).await.unwrap().expect("task2 should complete");
    assert_eq!(result2.task_id, task2_id);
    assert_eq!(result2.result, TaskResult::Success);
    assert!(result2.output.contains("shared-content"), "output was: {:?}", result2.output);
    assert!(!result2.output.contains("distractor-content"), "dispatcher re-read the distractor file instead of reusing the cached object");
}

/// spec.md §7: "`ConfigError` surfaces to the embedder synchronously on
/// submission" — a task whose input references a local file that doesn't
/// exist, and isn't backed by a declared cache object, is rejected by
/// `submit` itself rather than being queued and failing later.
#[tokio::test]
async fn submit_rejects_missing_local_input_synchronously() {
    let manager = start_manager(3).await;

    let mut task = Task::new(0, "cat missing.txt");
    task.inputs.push(FileSpec::input("/nonexistent/does/not/exist".to_string(), "missing.txt", true));
    let err = manager.submit(task).await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::ConfigError(_)), "expected ConfigError, got {:?}", err.kind());

    // The rejected submission never occupied a slot in the queue.
    let stats = manager.stats().await.unwrap();
    assert_eq!(stats.tasks_ready, 0);
}

/// Property 1 (spec.md §8): a worker's committed resources rise when a
/// task is dispatched and fall back to zero once it completes.
#[tokio::test]
async fn committed_resources_return_to_zero_after_completion() {
    let manager = start_manager(3).await;
    let addr = manager.local_addr();
    let (_worker, _cache_dir, _sandbox_dir) = spawn_worker(addr, "worker-1", ResourceVector::full(4, 4096, 4096, 0)).await;
    wait_for_workers(&manager, 1, Duration::from_secs(5)).await;

    let mut task = Task::new(0, "sleep 1");
    task.requested_resources = ResourceVector::full(1, 256, 100, 0);
    let task_id = manager.submit(task).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let stats = manager.stats().await.unwrap();
        if stats.tasks_running >= 1 || stats.tasks_dispatched >= 1 {
            assert!(stats.committed_resources.cores.unwrap_or(0) >= 1, "committed cores should reflect the running task");
            break;
        }
        assert!(Instant::now() < deadline, "task never reached dispatched/running");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let result = manager.wait(Duration::from_secs(10)).await.unwrap().expect("task should complete");
    assert_eq!(result.task_id, task_id);
    assert_eq!(result.result, TaskResult::Success);

    let stats = manager.stats().await.unwrap();
    assert_eq!(stats.committed_resources.cores, Some(0));
    assert_eq!(stats.committed_resources.memory_mb, Some(0));
}

/// Property 3 + scenario 5 (spec.md §8): a worker that vanishes mid-task is
/// detected, and the task is reassigned to a different worker exactly once
/// rather than being silently dropped or duplicated. The "crashing" worker
/// here is a hand-rolled link rather than the full `worker::run` runtime,
/// so the test controls precisely when the connection drops.
#[tokio::test]
async fn worker_disconnect_reassigns_task_to_another_worker() {
    let manager = start_manager(3).await;
    let addr = manager.local_addr();

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut flaky = Link::connect(addr, deadline).await.unwrap();
    let chain = test_auth_chain();
    chain.assert(&mut flaky, deadline).await.unwrap();
    flaky.write_line("ready flaky-worker 1 1024 1024 0 /tmp/flaky", deadline).await.unwrap();

    let mut task = Task::new(0, "echo done-on-replacement");
    task.requested_resources = ResourceVector::full(1, 64, 64, 0);
    let task_id = manager.submit(task).await.unwrap();

    let msg = read_manager_message(&mut flaky, Instant::now() + Duration::from_secs(5)).await.unwrap();
    match msg {
        ManagerMessage::Task(wire) => assert_eq!(wire.task_id, task_id),
        other => panic!("expected a Task dispatch, got {:?}", other),
    }

    // Simulate a crash: drop the connection without ever reporting a result.
    drop(flaky);

    let (_worker, _cache_dir, _sandbox_dir) = spawn_worker(addr, "replacement-worker", ResourceVector::full(2, 1024, 1024, 0)).await;

    let result = manager.wait(Duration::from_secs(10)).await.unwrap().expect("task should eventually complete");
    assert_eq!(result.task_id, task_id);
    assert_eq!(result.state, TaskState::Done);
    assert_eq!(result.result, TaskResult::Success);
    assert!(result.resubmissions >= 1, "task should have been resubmitted after the disconnect");
    assert!(result.output.contains("done-on-replacement"));
}

/// Scenario 3 (spec.md §8): a declared URL source that can never be
/// fetched (nothing is listening on the port) fails the task with
/// `TransferError` instead of hanging or silently dropping it.
#[tokio::test]
async fn unreachable_url_cache_fails_task_with_transfer_error() {
    let manager = start_manager(3).await;
    let addr = manager.local_addr();
    let (_worker, _cache_dir, _sandbox_dir) = spawn_worker(addr, "worker-1", ResourceVector::full(2, 1024, 1024, 0)).await;
    wait_for_workers(&manager, 1, Duration::from_secs(5)).await;

    let dead_port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    let url = format!("http://127.0.0.1:{}/missing", dead_port);
    manager.declare_url_cache("broken.bin", url, 10, 0o644).unwrap();

    let mut task = Task::new(0, "cat broken.bin");
    task.inputs.push(FileSpec::input("unused".to_string(), "broken.bin", true));
    let task_id = manager.submit(task).await.unwrap();

    let result = manager.wait(Duration::from_secs(10)).await.unwrap().expect("task should complete (by failing)");
    assert_eq!(result.task_id, task_id);
    assert_eq!(result.state, TaskState::Failed);
    assert_eq!(result.result, TaskResult::TransferError);
}

/// Scenario 4 (spec.md §8): a task that blows past its declared memory
/// limit is killed by the worker's own RSS sampling (the `137` overflow
/// sentinel) and, since this category has no `max_allocation` configured,
/// the category engine's `next_label` escalates straight to `Error` rather
/// than retrying forever.
#[cfg(target_os = "linux")]
#[tokio::test]
async fn memory_overflow_fails_task_with_resource_exhaustion() {
    let manager = start_manager(3).await;
    let addr = manager.local_addr();
    let (_worker, _cache_dir, _sandbox_dir) = spawn_worker(addr, "worker-1", ResourceVector::full(2, 4096, 4096, 0)).await;
    wait_for_workers(&manager, 1, Duration::from_secs(5)).await;

    let mut task = Task::new(0, "a=$(head -c 83886080 /dev/zero | base64); sleep 1");
    task.requested_resources = ResourceVector::full(1, 5, 64, 0);
    let task_id = manager.submit(task).await.unwrap();

    let result = manager.wait(Duration::from_secs(15)).await.unwrap().expect("task should complete (by failing)");
    assert_eq!(result.task_id, task_id);
    assert_eq!(result.state, TaskState::Failed);
    assert_eq!(result.result, TaskResult::ResourceExhaustion);
}
