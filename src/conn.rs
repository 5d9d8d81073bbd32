//! Drives one client connection: reads protocol lines, calls into the
//! engine, and maps command outcomes onto response keywords. The
//! connection owns exactly one session; closing the stream closes the
//! session and releases everything it held.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::engine::{CommandError, Engine, ReserveOutcome};
use crate::line_reader::{DataRead, LineReader};
use crate::stats::to_yaml;
use crate::types::protocol::{BeanstalkCommand, BeanstalkResponse};
use crate::types::serialisable::BeanstalkSerialisable;
use crate::types::session::ReserveReply;

/// Serves one connection until the peer disconnects, sends `quit`, or the
/// server shuts down. The session is closed on every exit path.
pub async fn serve<R, W>(
    engine: &Engine,
    cancel: &CancellationToken,
    reader: R,
    mut writer: W,
    sid: &str,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines: LineReader<R> = reader.into();

    engine.state().await.open_session(sid);
    let result = drive(engine, cancel, &mut lines, &mut writer, sid).await;

    let now_ms = engine.now_ms();
    engine.state().await.close_session(sid, now_ms);

    result
}

async fn drive<R, W>(
    engine: &Engine,
    cancel: &CancellationToken,
    lines: &mut LineReader<R>,
    writer: &mut W,
    sid: &str,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let line = select! {
            line = lines.read_line() => line?,
            _ = cancel.cancelled() => return Ok(()),
        };
        let Some(line) = line else {
            return Ok(());
        };

        trace!(
            session = sid,
            cmd = %String::from_utf8_lossy(&line),
            "processing command"
        );

        let cmd = match TryInto::<BeanstalkCommand>::try_into(&line[..]) {
            Ok(cmd) => cmd,
            Err(error) => {
                write_response(writer, &error.into()).await?;
                continue;
            },
        };

        if cmd == BeanstalkCommand::Quit {
            return Ok(());
        }

        match execute(engine, cancel, lines, cmd, sid).await? {
            Some(response) => write_response(writer, &response).await?,
            // No response means the wait was cancelled or the stream
            // ended mid-command; the read loop sees it next.
            None => {},
        }
    }
}

async fn execute<R>(
    engine: &Engine,
    cancel: &CancellationToken,
    lines: &mut LineReader<R>,
    cmd: BeanstalkCommand,
    sid: &str,
) -> io::Result<Option<BeanstalkResponse>>
where
    R: AsyncRead + Unpin,
{
    use BeanstalkCommand::*;

    let now_ms = engine.now_ms();

    let response = match cmd {
        Put {
            pri,
            delay,
            ttr,
            n_bytes,
        } => {
            let body = select! {
                body = lines.read_data(n_bytes as usize) => body?,
                _ = cancel.cancelled() => return Ok(None),
            };
            match body {
                DataRead::Data(data) => {
                    match engine.state().await.put(
                        sid,
                        pri,
                        delay,
                        ttr,
                        data.to_vec(),
                        now_ms,
                    ) {
                        Ok(id) => BeanstalkResponse::Inserted(id),
                        Err(error) => error_response(error),
                    }
                },
                DataRead::BadTerminator => BeanstalkResponse::ExpectedCrlf,
                DataRead::Closed => return Ok(None),
            }
        },

        Use { tube } => {
            BeanstalkResponse::Using(engine.state().await.use_tube(sid, &tube))
        },

        Reserve => return reserve(engine, cancel, sid, None).await,
        ReserveWithTimeout { timeout } => {
            return reserve(engine, cancel, sid, Some(timeout)).await
        },

        Delete { id } => match engine.state().await.delete(sid, id) {
            Ok(()) => BeanstalkResponse::Deleted,
            Err(error) => error_response(error),
        },

        Release { id, pri, delay } => {
            match engine.state().await.release(sid, id, pri, delay, now_ms) {
                Ok(()) => BeanstalkResponse::Released,
                Err(error) => error_response(error),
            }
        },

        Bury { id, pri } => match engine.state().await.bury(sid, id, pri) {
            Ok(()) => BeanstalkResponse::Buried,
            Err(error) => error_response(error),
        },

        Touch { id } => match engine.state().await.touch(sid, id, now_ms) {
            Ok(()) => BeanstalkResponse::Touched,
            Err(error) => error_response(error),
        },

        Watch { tube } => {
            BeanstalkResponse::Watching(engine.state().await.watch(sid, &tube))
        },

        Ignore { tube } => match engine.state().await.ignore(sid, &tube) {
            Ok(n) => BeanstalkResponse::Watching(n),
            Err(error) => error_response(error),
        },

        Peek { id } => found(engine.state().await.peek(id)),
        PeekReady => found(engine.state().await.peek_ready(sid)),
        PeekDelayed => found(engine.state().await.peek_delayed(sid)),
        PeekBuried => found(engine.state().await.peek_buried(sid)),

        Kick { bound } => match engine.state().await.kick(sid, bound, now_ms)
        {
            Ok(n) => BeanstalkResponse::Kicked(n),
            Err(error) => error_response(error),
        },

        PauseTube { tube, delay } => {
            match engine.state().await.pause_tube(&tube, delay, now_ms) {
                Ok(()) => BeanstalkResponse::Paused,
                Err(error) => error_response(error),
            }
        },

        StatsJob { id } => {
            match engine.state().await.stats_job(id, now_ms) {
                Ok(stats) => yaml_response(&stats),
                Err(error) => error_response(error),
            }
        },

        StatsTube { tube } => {
            match engine.state().await.stats_tube(&tube, now_ms) {
                Ok(stats) => yaml_response(&stats),
                Err(error) => error_response(error),
            }
        },

        StatsServer => yaml_response(&engine.state().await.stats(now_ms)),

        ListTubes => yaml_response(&engine.state().await.list_tubes()),
        ListTubeUsed => {
            BeanstalkResponse::Using(engine.state().await.list_tube_used(sid))
        },
        ListTubesWatched => {
            yaml_response(&engine.state().await.list_tubes_watched(sid))
        },

        // Handled by the read loop before execution.
        Quit => return Ok(None),
    };

    Ok(Some(response))
}

/// Completes a reserve: either immediately, or by waiting on the
/// engine-delivered reply without holding the engine lock.
async fn reserve(
    engine: &Engine,
    cancel: &CancellationToken,
    sid: &str,
    timeout: Option<u32>,
) -> io::Result<Option<BeanstalkResponse>> {
    let now_ms = engine.now_ms();
    let outcome = engine.state().await.reserve(sid, timeout, now_ms);

    Ok(match outcome {
        ReserveOutcome::Reserved(view) => {
            Some(BeanstalkResponse::Reserved(view.id, view.data))
        },
        ReserveOutcome::TimedOut => Some(BeanstalkResponse::TimedOut),
        ReserveOutcome::Queued(rx) => select! {
            reply = rx => match reply {
                Ok(ReserveReply::Reserved(view)) => {
                    Some(BeanstalkResponse::Reserved(view.id, view.data))
                },
                Ok(ReserveReply::TimedOut) => Some(BeanstalkResponse::TimedOut),
                // The sender is only dropped when the engine discards the
                // session, which cannot race a live connection.
                Err(_) => Some(BeanstalkResponse::InternalError),
            },
            _ = cancel.cancelled() => None,
        },
    })
}

fn found(
    result: Result<(u64, Vec<u8>), CommandError>,
) -> BeanstalkResponse {
    match result {
        Ok((id, data)) => BeanstalkResponse::Found(id, data),
        Err(error) => error_response(error),
    }
}

fn yaml_response<T: serde::Serialize>(value: &T) -> BeanstalkResponse {
    match to_yaml(value) {
        Ok(payload) => BeanstalkResponse::Ok(payload),
        Err(error) => {
            warn!(%error, "failed to serialise stats payload");
            BeanstalkResponse::InternalError
        },
    }
}

fn error_response(error: CommandError) -> BeanstalkResponse {
    match error {
        CommandError::NotFound => BeanstalkResponse::NotFound,
        CommandError::NotIgnored => BeanstalkResponse::NotIgnored,
        CommandError::Draining => BeanstalkResponse::Draining,
        CommandError::Wal(error) => {
            warn!(%error, "command failed against the write-ahead log");
            BeanstalkResponse::InternalError
        },
    }
}

async fn write_response<W>(
    writer: &mut W,
    response: &BeanstalkResponse,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&response.serialise_beanstalk()).await
}
