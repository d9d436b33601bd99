//! RESP2 wire surface.
//!
//! One task per connection; commands parse into [`Command`] and execute on
//! the blocking pool because every engine-backed operation parks until its
//! flush. The protocol is deliberately tiny: counters, sequences, lease
//! locks, a stats dump, and PING.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::{BytesFrame, Resp2Frame};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use coal_engine::UpdateError;

use crate::node::NodeState;

#[derive(Clone, Debug)]
pub enum Command {
    Ping,
    CounterAdd {
        account: String,
        id: String,
        delta: i64,
    },
    CounterGet {
        account: String,
        id: String,
    },
    CounterDel {
        account: String,
        id: String,
    },
    SeqNext {
        account: String,
        id: String,
    },
    SeqGet {
        account: String,
        id: String,
    },
    SeqDel {
        account: String,
        id: String,
    },
    LockAcquire {
        account: String,
        id: String,
        hold: Duration,
        wait: Duration,
    },
    LockRelease {
        account: String,
        id: String,
        token: u64,
    },
    Stats,
}

/// Accept connections until the listener task is aborted.
pub async fn run(addr: SocketAddr, state: Arc<NodeState>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    loop {
        let (socket, _) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_conn(socket, state).await {
                tracing::debug!(error = ?err, "client connection closed");
            }
        });
    }
}

async fn handle_conn(socket: TcpStream, state: Arc<NodeState>) -> anyhow::Result<()> {
    let mut framed = Framed::new(socket, Resp2::default());
    while let Some(frame) = framed.next().await {
        let frame = frame?;
        let reply = match parse_command(frame) {
            Ok(None) => continue,
            Ok(Some(command)) => dispatch(command, &state).await,
            Err(err) => BytesFrame::Error(format!("ERR {err}").into()),
        };
        framed.send(reply).await?;
    }
    Ok(())
}

/// Run a command on the blocking pool; engine-backed commands park there
/// until their flush signal closes.
async fn dispatch(command: Command, state: &Arc<NodeState>) -> BytesFrame {
    let state = Arc::clone(state);
    match tokio::task::spawn_blocking(move || execute(&state, command)).await {
        Ok(reply) => reply,
        Err(err) => BytesFrame::Error(format!("ERR command task failed: {err}").into()),
    }
}

fn execute(state: &NodeState, command: Command) -> BytesFrame {
    match command {
        Command::Ping => BytesFrame::SimpleString(bytes::Bytes::from_static(b"PONG")),
        Command::CounterAdd { account, id, delta } => {
            match state.counters.add(&account, &id, delta) {
                Ok(value) => BytesFrame::Integer(value),
                Err(err) => update_error(err),
            }
        }
        Command::CounterGet { account, id } => match state.counters.get(&account, &id) {
            Ok(Some(value)) => BytesFrame::Integer(value),
            Ok(None) => BytesFrame::Null,
            Err(err) => BytesFrame::Error(format!("ERR {err}").into()),
        },
        Command::CounterDel { account, id } => match state.counters.delete(&account, &id) {
            Ok(()) => BytesFrame::SimpleString(bytes::Bytes::from_static(b"OK")),
            Err(err) => update_error(err),
        },
        Command::SeqNext { account, id } => match state.sequences.next(&account, &id) {
            Ok(value) => BytesFrame::Integer(value as i64),
            Err(err) => update_error(err),
        },
        Command::SeqGet { account, id } => match state.sequences.get(&account, &id) {
            Ok(Some(value)) => BytesFrame::Integer(value as i64),
            Ok(None) => BytesFrame::Null,
            Err(err) => BytesFrame::Error(format!("ERR {err}").into()),
        },
        Command::SeqDel { account, id } => match state.sequences.delete(&account, &id) {
            Ok(()) => BytesFrame::SimpleString(bytes::Bytes::from_static(b"OK")),
            Err(err) => update_error(err),
        },
        Command::LockAcquire {
            account,
            id,
            hold,
            wait,
        } => match state.locks.acquire(&account, &id, hold, wait) {
            Some(token) => BytesFrame::Integer(token as i64),
            None => BytesFrame::Null,
        },
        Command::LockRelease { account, id, token } => {
            let released = state.locks.release(&account, &id, token);
            BytesFrame::Integer(released as i64)
        }
        Command::Stats => {
            let stats = state.engine.stats().snapshot_and_reset();
            let json = serde_json::json!({
                "updates_started": stats.updates_started,
                "updates_rejected": stats.updates_rejected,
                "mutator_errors": stats.mutator_errors,
                "flush_cycles": stats.flush_cycles,
                "sync_commits": stats.sync_commits,
                "commit_total_us": stats.commit_total_us,
                "commit_max_us": stats.commit_max_us,
                "coalesced_total": stats.coalesced_total,
                "coalesced_max": stats.coalesced_max,
            });
            BytesFrame::BulkString(bytes::Bytes::from(json.to_string().into_bytes()))
        }
    }
}

fn update_error(err: UpdateError) -> BytesFrame {
    match err {
        UpdateError::ShuttingDown => BytesFrame::Error("ERR shutting down".into()),
        UpdateError::Mutator(err) => BytesFrame::Error(format!("ERR {err}").into()),
    }
}

fn parse_command(frame: BytesFrame) -> anyhow::Result<Option<Command>> {
    let BytesFrame::Array(parts) = frame else {
        anyhow::bail!("expected array frame");
    };
    if parts.is_empty() {
        return Ok(None);
    }

    let name = frame_str_upper(&parts[0]).ok_or_else(|| anyhow::anyhow!("invalid command"))?;
    match name.as_str() {
        "PING" => {
            anyhow::ensure!(parts.len() == 1, "PING expects 0 arguments");
            Ok(Some(Command::Ping))
        }
        "COUNTER.ADD" => {
            anyhow::ensure!(
                parts.len() == 3 || parts.len() == 4,
                "COUNTER.ADD expects account, id and an optional delta"
            );
            let delta = if parts.len() == 4 {
                parse_i64(&parts[3], "delta")?
            } else {
                1
            };
            let (account, id) = account_id(&parts)?;
            Ok(Some(Command::CounterAdd { account, id, delta }))
        }
        "COUNTER.GET" => {
            anyhow::ensure!(parts.len() == 3, "COUNTER.GET expects account and id");
            let (account, id) = account_id(&parts)?;
            Ok(Some(Command::CounterGet { account, id }))
        }
        "COUNTER.DEL" => {
            anyhow::ensure!(parts.len() == 3, "COUNTER.DEL expects account and id");
            let (account, id) = account_id(&parts)?;
            Ok(Some(Command::CounterDel { account, id }))
        }
        "SEQ.NEXT" => {
            anyhow::ensure!(parts.len() == 3, "SEQ.NEXT expects account and id");
            let (account, id) = account_id(&parts)?;
            Ok(Some(Command::SeqNext { account, id }))
        }
        "SEQ.GET" => {
            anyhow::ensure!(parts.len() == 3, "SEQ.GET expects account and id");
            let (account, id) = account_id(&parts)?;
            Ok(Some(Command::SeqGet { account, id }))
        }
        "SEQ.DEL" => {
            anyhow::ensure!(parts.len() == 3, "SEQ.DEL expects account and id");
            let (account, id) = account_id(&parts)?;
            Ok(Some(Command::SeqDel { account, id }))
        }
        "LOCK.ACQUIRE" => {
            anyhow::ensure!(
                parts.len() == 5,
                "LOCK.ACQUIRE expects account, id, hold_ms and wait_ms"
            );
            let (account, id) = account_id(&parts)?;
            let hold = Duration::from_millis(parse_u64(&parts[3], "hold_ms")?);
            let wait = Duration::from_millis(parse_u64(&parts[4], "wait_ms")?);
            Ok(Some(Command::LockAcquire {
                account,
                id,
                hold,
                wait,
            }))
        }
        "LOCK.RELEASE" => {
            anyhow::ensure!(
                parts.len() == 4,
                "LOCK.RELEASE expects account, id and token"
            );
            let (account, id) = account_id(&parts)?;
            let token = parse_u64(&parts[3], "token")?;
            Ok(Some(Command::LockRelease { account, id, token }))
        }
        "COALSTATS" => {
            anyhow::ensure!(parts.len() == 1, "COALSTATS expects 0 arguments");
            Ok(Some(Command::Stats))
        }
        other => anyhow::bail!("unknown command {other}"),
    }
}

fn account_id(parts: &[BytesFrame]) -> anyhow::Result<(String, String)> {
    let account = frame_str(&parts[1]).ok_or_else(|| anyhow::anyhow!("invalid account"))?;
    let id = frame_str(&parts[2]).ok_or_else(|| anyhow::anyhow!("invalid id"))?;
    Ok((account, id))
}

fn frame_str(frame: &BytesFrame) -> Option<String> {
    frame.as_str().map(|s| s.to_string())
}

fn frame_str_upper(frame: &BytesFrame) -> Option<String> {
    frame.as_str().map(|s| s.to_ascii_uppercase())
}

fn parse_i64(frame: &BytesFrame, what: &str) -> anyhow::Result<i64> {
    frame
        .as_str()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| anyhow::anyhow!("invalid {what}"))
}

fn parse_u64(frame: &BytesFrame, what: &str) -> anyhow::Result<u64> {
    frame
        .as_str()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| anyhow::anyhow!("invalid {what}"))
}
