//! Per-worker I/O. One session is spawned per accepted connection: it runs
//! the auth handshake and `ready` handshake on the whole `Link`, then
//! splits into a reader task (forwards `WorkerMessage`s to the dispatcher)
//! and a writer task (drains an `mpsc` of `OutboundCmd`s onto the wire).
//! Neither task touches dispatcher state directly (SPEC_FULL.md §4.5).

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::auth::AuthChain;
use crate::errors::Result;
use crate::link::Link;
use crate::manager::dispatcher::{DispatcherMsg, OutboundCmd};
use crate::protocol::{read_worker_message, write_manager_message};
use crate::resources::ResourceVector;
use crate::task::WorkerId;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn run_session(
    stream: TcpStream,
    worker_id: WorkerId,
    auth_chain: Arc<AuthChain>,
    dispatcher_tx: mpsc::UnboundedSender<DispatcherMsg>,
) -> Result<()> {
    let mut link = Link::new(stream)?;
    let peer = link.remote_address();
    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;

    let identity = auth_chain.accept(&mut link, deadline).await?;
    debug!("worker at {:?} authenticated as {}:{}", peer, identity.method, identity.subject);

    let (verb, args) = link.read_verb_line(crate::link::HEADER_LINE_MAX, deadline).await?;
    if verb != "ready" {
        warn!("worker at {:?} sent {} instead of ready", peer, verb);
        return Err(crate::errors::ErrorKind::Protocol(format!("expected ready, got {}", verb)).into());
    }
    let resources = parse_ready_args(&args)?;

    let (mut reader, mut writer) = link.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutboundCmd>();

    dispatcher_tx
        .send(DispatcherMsg::WorkerConnected { worker_id, subject: identity.subject.clone(), resources, out_tx })
        .map_err(|_| crate::errors::ErrorKind::PeerGone("dispatcher gone".to_string()))?;

    let writer_task = tokio::spawn(async move {
        while let Some(cmd) = out_rx.recv().await {
            match cmd {
                OutboundCmd::Send(msg) => {
                    let deadline = Instant::now() + Duration::from_secs(30);
                    if let Err(e) = write_manager_message(&mut writer, &msg, deadline).await {
                        warn!("writer for worker {}: {}", worker_id, e);
                        break;
                    }
                }
                OutboundCmd::Close => break,
            }
        }
    });

    loop {
        let deadline = Instant::now() + Duration::from_secs(3600);
        match read_worker_message(&mut reader, deadline).await {
            Ok(msg) => {
                if dispatcher_tx.send(DispatcherMsg::WorkerEvent(worker_id, msg)).is_err() {
                    break;
                }
            }
            Err(e) => {
                info!("worker {} link error: {}", worker_id, e);
                break;
            }
        }
    }

    let _ = dispatcher_tx.send(DispatcherMsg::WorkerDisconnected(worker_id));
    writer_task.abort();
    Ok(())
}

fn parse_ready_args(args: &[String]) -> Result<ResourceVector> {
    if args.len() < 6 {
        return Err(crate::errors::ErrorKind::Protocol("ready: expected 6 arguments".to_string()).into());
    }
    let parse = |field: &str, s: &str| -> Result<u64> {
        s.parse().map_err(|_| crate::errors::ErrorKind::Protocol(format!("ready: bad {}: {}", field, s)).into())
    };
    Ok(ResourceVector {
        cores: Some(parse("cores", &args[1])?),
        memory_mb: Some(parse("memory_mb", &args[2])?),
        disk_mb: Some(parse("disk_mb", &args[3])?),
        gpus: Some(parse("gpus", &args[4])?),
        wall_time_s: None,
    })
}
