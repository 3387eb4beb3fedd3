//! The line-oriented wire protocol between manager and worker
//! (spec.md §6.2). Every message is ASCII, newline-terminated,
//! whitespace-tokenized; binary payloads are preceded by a `size` field,
//! per spec.md §4.1.

use std::collections::HashMap;
use std::time::Instant;

use crate::errors::*;
use crate::link::{LinkRead, LinkWrite, CONTROL_LINE_MAX, HEADER_LINE_MAX};
use crate::resources::ResourceVector;
use crate::task::{FileDirection, FileSpec, Task, TaskId};

/// Messages a worker sends to the manager.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    Ready { worker_name: String, cores: u64, memory_mb: u64, disk_mb: u64, gpus: u64, workdir: String },
    Alive,
    CacheUpdate { cache_name: String, size: u64, elapsed_usec: u64 },
    CacheInvalid { cache_name: String, message: String },
    /// `stdout` has already been read off the wire by the caller
    /// (the `stdout_size` bytes that follow the header line).
    /// `peak_memory_mb` is the sandbox's observed high-water mark, feeding
    /// the category engine's histograms (spec.md §4.4).
    Result { task_id: TaskId, return_status: i32, stdout: Vec<u8>, elapsed_usec: u64, peak_memory_mb: u64 },
    /// `bytes` has already been read off the wire by the caller.
    FileStream { cache_name: String, size: u64, mode: u32, bytes: Vec<u8> },
}

/// Messages a manager sends to a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerMessage {
    Ping,
    /// `bytes` is written immediately following the header line.
    File { cache_name: String, size: u64, mode: u32, bytes: Vec<u8> },
    PutUrl { cache_name: String, url: String, size: u64, mode: u32 },
    PutCmd { cache_name: String, shell_template: String, size: u64, mode: u32 },
    Unlink { cache_name: String },
    GetFile { cache_name: String },
    Task(WireTask),
    Kill { task_id: TaskId },
    Exit,
}

/// The execution-relevant subset of a `Task`, as carried by the
/// `task … end` sequence (spec.md §6.2, Property 4).
#[derive(Debug, Clone, PartialEq)]
pub struct WireTask {
    pub task_id: TaskId,
    pub cmd: String,
    pub category: String,
    pub env: HashMap<String, String>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub resources: ResourceVector,
}

impl WireTask {
    pub fn from_task(task: &Task) -> Self {
        WireTask {
            task_id: task.task_id,
            cmd: task.command_line.clone(),
            category: task.category.clone(),
            env: task.environment.clone(),
            inputs: task.inputs.iter().map(|f| f.cache_name.clone()).collect(),
            outputs: task.outputs.iter().map(|f| f.cache_name.clone()).collect(),
            resources: task.requested_resources,
        }
    }
}

fn parse_u64(field: &str, s: &str) -> Result<u64> {
    s.parse().map_err(|_| Error::from(ErrorKind::Protocol(format!("{} is not an integer: {}", field, s))))
}

fn parse_i32(field: &str, s: &str) -> Result<i32> {
    s.parse().map_err(|_| Error::from(ErrorKind::Protocol(format!("{} is not an integer: {}", field, s))))
}

fn parse_u32(field: &str, s: &str) -> Result<u32> {
    s.parse().map_err(|_| Error::from(ErrorKind::Protocol(format!("{} is not an integer: {}", field, s))))
}

fn require_args<'a>(verb: &str, args: &'a [String], n: usize) -> Result<&'a [String]> {
    if args.len() < n {
        bail!(ErrorKind::Protocol(format!("{} expects {} argument(s), got {}", verb, n, args.len())));
    }
    Ok(args)
}

/// Read one worker -> manager message, including any trailing binary
/// payload named by the header line.
pub async fn read_worker_message<L: LinkRead>(link: &mut L, deadline: Instant) -> Result<WorkerMessage> {
    let (verb, args) = link.read_verb_line(HEADER_LINE_MAX, deadline).await?;
    match verb.as_str() {
        "ready" => {
            let a = require_args(&verb, &args, 6)?;
            Ok(WorkerMessage::Ready {
                worker_name: a[0].clone(),
                cores: parse_u64("cores", &a[1])?,
                memory_mb: parse_u64("memory_mb", &a[2])?,
                disk_mb: parse_u64("disk_mb", &a[3])?,
                gpus: parse_u64("gpus", &a[4])?,
                workdir: a[5].clone(),
            })
        }
        "alive" => Ok(WorkerMessage::Alive),
        "cache-update" => {
            let a = require_args(&verb, &args, 3)?;
            Ok(WorkerMessage::CacheUpdate {
                cache_name: a[0].clone(),
                size: parse_u64("size", &a[1])?,
                elapsed_usec: parse_u64("elapsed_usec", &a[2])?,
            })
        }
        "cache-invalid" => {
            let a = require_args(&verb, &args, 1)?;
            let message = args[1..].join(" ");
            Ok(WorkerMessage::CacheInvalid { cache_name: a[0].clone(), message })
        }
        "result" => {
            let a = require_args(&verb, &args, 5)?;
            let task_id = parse_u64("task_id", &a[0])?;
            let return_status = parse_i32("return_status", &a[1])?;
            let stdout_size = parse_u64("stdout_size", &a[2])? as usize;
            let elapsed_usec = parse_u64("elapsed_usec", &a[3])?;
            let peak_memory_mb = parse_u64("peak_memory_mb", &a[4])?;
            let stdout = link.read_exact(stdout_size, deadline).await?;
            Ok(WorkerMessage::Result { task_id, return_status, stdout, elapsed_usec, peak_memory_mb })
        }
        "file-stream" => {
            let a = require_args(&verb, &args, 3)?;
            let size = parse_u64("size", &a[1])? as usize;
            let mode = parse_u32("mode", &a[2])?;
            let bytes = link.read_exact(size, deadline).await?;
            Ok(WorkerMessage::FileStream { cache_name: a[0].clone(), size: size as u64, mode, bytes })
        }
        other => bail!(ErrorKind::Protocol(format!("unknown worker verb: {}", other))),
    }
}

pub async fn write_worker_message<L: LinkWrite>(link: &mut L, msg: &WorkerMessage, deadline: Instant) -> Result<()> {
    match msg {
        WorkerMessage::Ready { worker_name, cores, memory_mb, disk_mb, gpus, workdir } => {
            link.write_line(&format!("ready {} {} {} {} {} {}", worker_name, cores, memory_mb, disk_mb, gpus, workdir), deadline).await
        }
        WorkerMessage::Alive => link.write_line("alive", deadline).await,
        WorkerMessage::CacheUpdate { cache_name, size, elapsed_usec } => {
            link.write_line(&format!("cache-update {} {} {}", cache_name, size, elapsed_usec), deadline).await
        }
        WorkerMessage::CacheInvalid { cache_name, message } => {
            link.write_line(&format!("cache-invalid {} {}", cache_name, message), deadline).await
        }
        WorkerMessage::Result { task_id, return_status, stdout, elapsed_usec, peak_memory_mb } => {
            link.write_line(&format!("result {} {} {} {} {}", task_id, return_status, stdout.len(), elapsed_usec, peak_memory_mb), deadline).await?;
            link.write_all(stdout, deadline).await
        }
        WorkerMessage::FileStream { cache_name, size, mode, bytes } => {
            link.write_line(&format!("file-stream {} {} {}", cache_name, size, mode), deadline).await?;
            link.write_all(bytes, deadline).await
        }
    }
}

/// Read one manager -> worker message (spec.md §6.2).
pub async fn read_manager_message<L: LinkRead>(link: &mut L, deadline: Instant) -> Result<ManagerMessage> {
    let (verb, args) = link.read_verb_line(HEADER_LINE_MAX, deadline).await?;
    match verb.as_str() {
        "ping" => Ok(ManagerMessage::Ping),
        "file" => {
            let a = require_args(&verb, &args, 3)?;
            let size = parse_u64("size", &a[1])? as usize;
            let mode = parse_u32("mode", &a[2])?;
            let bytes = link.read_exact(size, deadline).await?;
            Ok(ManagerMessage::File { cache_name: a[0].clone(), size: size as u64, mode, bytes })
        }
        "puturl" => {
            let a = require_args(&verb, &args, 3)?;
            Ok(ManagerMessage::PutUrl {
                cache_name: a[0].clone(),
                size: parse_u64("size", &a[1])?,
                mode: parse_u32("mode", &a[2])?,
                url: args[3..].join(" "),
            })
        }
        "putcmd" => {
            let a = require_args(&verb, &args, 3)?;
            Ok(ManagerMessage::PutCmd {
                cache_name: a[0].clone(),
                size: parse_u64("size", &a[1])?,
                mode: parse_u32("mode", &a[2])?,
                shell_template: args[3..].join(" "),
            })
        }
        "unlink" => {
            let a = require_args(&verb, &args, 1)?;
            Ok(ManagerMessage::Unlink { cache_name: a[0].clone() })
        }
        "getfile" => {
            let a = require_args(&verb, &args, 1)?;
            Ok(ManagerMessage::GetFile { cache_name: a[0].clone() })
        }
        "task" => {
            let a = require_args(&verb, &args, 1)?;
            let task_id = parse_u64("task_id", &a[0])?;
            let wire = read_task_body(link, task_id, deadline).await?;
            Ok(ManagerMessage::Task(wire))
        }
        "kill" => {
            let a = require_args(&verb, &args, 1)?;
            Ok(ManagerMessage::Kill { task_id: parse_u64("task_id", &a[0])? })
        }
        "exit" => Ok(ManagerMessage::Exit),
        other => bail!(ErrorKind::Protocol(format!("unknown manager verb: {}", other))),
    }
}

async fn read_task_body<L: LinkRead>(link: &mut L, task_id: TaskId, deadline: Instant) -> Result<WireTask> {
    let mut wire = WireTask {
        task_id,
        cmd: String::new(),
        category: "default".to_string(),
        env: HashMap::new(),
        inputs: Vec::new(),
        outputs: Vec::new(),
        resources: ResourceVector::new(),
    };
    loop {
        let (verb, args) = link.read_verb_line(CONTROL_LINE_MAX, deadline).await?;
        match verb.as_str() {
            "end" => break,
            "cmd" => wire.cmd = args.join(" "),
            "category" => wire.category = args.first().cloned().unwrap_or_else(|| "default".to_string()),
            "env" => {
                let a = require_args(&verb, &args, 2)?;
                wire.env.insert(a[0].clone(), args[1..].join(" "));
            }
            "input" => wire.inputs.push(require_args(&verb, &args, 1)?[0].clone()),
            "output" => wire.outputs.push(require_args(&verb, &args, 1)?[0].clone()),
            "cores" => wire.resources.cores = Some(parse_u64("cores", &require_args(&verb, &args, 1)?[0])?),
            "memory" => wire.resources.memory_mb = Some(parse_u64("memory", &require_args(&verb, &args, 1)?[0])?),
            "disk" => wire.resources.disk_mb = Some(parse_u64("disk", &require_args(&verb, &args, 1)?[0])?),
            "gpus" => wire.resources.gpus = Some(parse_u64("gpus", &require_args(&verb, &args, 1)?[0])?),
            "wall_time" => wire.resources.wall_time_s = Some(parse_u64("wall_time", &require_args(&verb, &args, 1)?[0])?),
            other => bail!(ErrorKind::Protocol(format!("unknown task field: {}", other))),
        }
    }
    Ok(wire)
}

pub async fn write_manager_message<L: LinkWrite>(link: &mut L, msg: &ManagerMessage, deadline: Instant) -> Result<()> {
    match msg {
        ManagerMessage::Ping => link.write_line("ping", deadline).await,
        ManagerMessage::File { cache_name, size, mode, bytes } => {
            link.write_line(&format!("file {} {} {}", cache_name, size, mode), deadline).await?;
            link.write_all(bytes, deadline).await
        }
        ManagerMessage::PutUrl { cache_name, url, size, mode } => {
            // `url` is free text and must come last so it can't shift `size`/`mode`
            // out of position (cf. `cache-invalid`'s `message` field).
            link.write_line(&format!("puturl {} {} {} {}", cache_name, size, mode, url), deadline).await
        }
        ManagerMessage::PutCmd { cache_name, shell_template, size, mode } => {
            // `shell_template` is an arbitrary shell command (e.g. "tar xzf %% -C .")
            // and must come last for the same reason.
            link.write_line(&format!("putcmd {} {} {} {}", cache_name, size, mode, shell_template), deadline).await
        }
        ManagerMessage::Unlink { cache_name } => link.write_line(&format!("unlink {}", cache_name), deadline).await,
        ManagerMessage::GetFile { cache_name } => link.write_line(&format!("getfile {}", cache_name), deadline).await,
        ManagerMessage::Task(wire) => write_task(link, wire, deadline).await,
        ManagerMessage::Kill { task_id } => link.write_line(&format!("kill {}", task_id), deadline).await,
        ManagerMessage::Exit => link.write_line("exit", deadline).await,
    }
}

async fn write_task<L: LinkWrite>(link: &mut L, wire: &WireTask, deadline: Instant) -> Result<()> {
    link.write_line(&format!("task {}", wire.task_id), deadline).await?;
    link.write_line(&format!("cmd {}", wire.cmd), deadline).await?;
    link.write_line(&format!("category {}", wire.category), deadline).await?;
    for (k, v) in &wire.env {
        link.write_line(&format!("env {} {}", k, v), deadline).await?;
    }
    for name in &wire.inputs {
        link.write_line(&format!("input {}", name), deadline).await?;
    }
    for name in &wire.outputs {
        link.write_line(&format!("output {}", name), deadline).await?;
    }
    if let Some(cores) = wire.resources.cores {
        link.write_line(&format!("cores {}", cores), deadline).await?;
    }
    if let Some(memory) = wire.resources.memory_mb {
        link.write_line(&format!("memory {}", memory), deadline).await?;
    }
    if let Some(disk) = wire.resources.disk_mb {
        link.write_line(&format!("disk {}", disk), deadline).await?;
    }
    if let Some(gpus) = wire.resources.gpus {
        link.write_line(&format!("gpus {}", gpus), deadline).await?;
    }
    if let Some(wall) = wire.resources.wall_time_s {
        link.write_line(&format!("wall_time {}", wall), deadline).await?;
    }
    link.write_line("end", deadline).await
}

/// Build a `Task` suitable for round-trip comparisons in tests (Property
/// 4): a `Task` carrying only the fields the wire protocol transports.
pub fn task_from_wire(wire: &WireTask) -> Task {
    let mut task = Task::new(wire.task_id, wire.cmd.clone());
    task.category = wire.category.clone();
    task.environment = wire.env.clone();
    task.requested_resources = wire.resources;
    task.inputs = wire.inputs.iter().map(|n| FileSpec {
        local_path: String::new(),
        cache_name: n.clone(),
        cache: true,
        direction: FileDirection::Input,
        mode: 0o644,
    }).collect();
    task.outputs = wire.outputs.iter().map(|n| FileSpec {
        local_path: String::new(),
        cache_name: n.clone(),
        cache: true,
        direction: FileDirection::Output,
        mode: 0o644,
    }).collect();
    task
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::Link;
    use tokio::net::TcpListener;
    use std::time::Duration;

    #[tokio::test]
    async fn task_round_trip_preserves_structure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut original = Task::new(42, "/bin/echo hello");
        original.category = "default".to_string();
        original.environment.insert("FOO".to_string(), "bar".to_string());
        original.requested_resources = ResourceVector::full(2, 512, 1024, 0);
        original.inputs.push(FileSpec::input("/tmp/in", "data.bin", true));
        original.outputs.push(FileSpec::output("out.bin", "/tmp/out", true));

        let to_send = original.clone();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut link = Link::new(stream).unwrap();
            let deadline = Instant::now() + Duration::from_secs(2);
            write_manager_message(&mut link, &ManagerMessage::Task(WireTask::from_task(&to_send)), deadline).await.unwrap();
        });

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut client = Link::connect(addr, deadline).await.unwrap();
        let msg = read_manager_message(&mut client, deadline).await.unwrap();
        server.await.unwrap();

        let ManagerMessage::Task(wire) = msg else { panic!("expected Task message") };
        let decoded = task_from_wire(&wire);

        assert_eq!(decoded.task_id, original.task_id);
        assert_eq!(decoded.command_line, original.command_line);
        assert_eq!(decoded.category, original.category);
        assert_eq!(decoded.environment, original.environment);
        assert_eq!(decoded.requested_resources, original.requested_resources);
        assert_eq!(decoded.inputs.len(), original.inputs.len());
        assert_eq!(decoded.inputs[0].cache_name, original.inputs[0].cache_name);
        assert_eq!(decoded.outputs[0].cache_name, original.outputs[0].cache_name);
    }

    #[tokio::test]
    async fn putcmd_round_trips_a_multi_word_shell_template() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let msg = ManagerMessage::PutCmd {
            cache_name: "built.bin".to_string(),
            shell_template: "tar xzf %% -C . && echo done".to_string(),
            size: 4096,
            mode: 0o644,
        };
        let to_send = msg.clone();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut link = Link::new(stream).unwrap();
            let deadline = Instant::now() + Duration::from_secs(2);
            write_manager_message(&mut link, &to_send, deadline).await.unwrap();
        });
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut client = Link::connect(addr, deadline).await.unwrap();
        let decoded = read_manager_message(&mut client, deadline).await.unwrap();
        server.await.unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn result_message_carries_stdout_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut link = Link::new(stream).unwrap();
            let deadline = Instant::now() + Duration::from_secs(2);
            let msg = WorkerMessage::Result { task_id: 1, return_status: 0, stdout: b"hello\n".to_vec(), elapsed_usec: 123, peak_memory_mb: 64 };
            write_worker_message(&mut link, &msg, deadline).await.unwrap();
        });
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut client = Link::connect(addr, deadline).await.unwrap();
        let msg = read_worker_message(&mut client, deadline).await.unwrap();
        server.await.unwrap();
        match msg {
            WorkerMessage::Result { task_id, return_status, stdout, .. } => {
                assert_eq!(task_id, 1);
                assert_eq!(return_status, 0);
                assert_eq!(stdout, b"hello\n");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
