mod args;
mod config;

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use ironbeans::clock::SystemClock;
use ironbeans::conn;
use ironbeans::engine::Engine;
use ironbeans::wal::{Wal, DEFAULT_SHARDS};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio::{select, signal};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Level};

use crate::args::Args;
use crate::config::FileConfig;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logging
    if args.debug {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    let file = match &args.config {
        Some(path) => match FileConfig::load(path) {
            Ok(file) => file,
            Err(error) => {
                error!(%error, "unreadable configuration file");
                return ExitCode::from(2);
            },
        },
        None => FileConfig::default(),
    };

    let port = args.port.or(file.port).unwrap_or(11300);

    // A WAL directory on the command line, or wal.enable in the file,
    // turns durability on.
    let wal_enabled =
        args.wal_dir.is_some() || file.wal_enable.unwrap_or(false);
    let wal = if wal_enabled {
        let dir = args
            .wal_dir
            .clone()
            .or(file.wal_dir.clone())
            .unwrap_or_else(|| PathBuf::from("wal"));
        let shards =
            args.wal_files.or(file.wal_files).unwrap_or(DEFAULT_SHARDS);

        match Wal::open(&dir, shards) {
            Ok(bundle) => Some(bundle),
            Err(error) => {
                error!(%error, dir = %dir.display(),
                       "cannot initialise write-ahead log");
                return ExitCode::from(2);
            },
        }
    } else {
        None
    };

    let engine =
        Arc::new(Engine::new(Arc::new(SystemClock), wal, args.drain));

    // Cancellation and termination channel.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            };
            cancel.cancel();
        });
    }

    let (shutdown_hold, mut shutdown_wait) = mpsc::channel::<()>(1);

    tokio::spawn(run_sweeper(engine.clone(), cancel.clone()));

    let exit_code = if let Err(error) =
        begin(args.listen, port, engine, cancel, shutdown_hold).await
    {
        error!(%error, "encountered runtime error");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    };

    shutdown_wait.recv().await;

    exit_code
}

async fn begin(
    listen: IpAddr,
    port: u16,
    engine: Arc<Engine>,
    cancel: CancellationToken,
    shutdown_hold: mpsc::Sender<()>,
) -> Result<()> {
    let listener = TcpListener::bind((listen, port)).await?;
    info!(addr = %listener.local_addr()?, "listening");

    // Accept incoming connections until an exit signal is sent, and handle
    // each connection as its own task.
    let mut next_session = 0u64;
    loop {
        let conn = match select! {
            accept = listener.accept() => accept,
            _ = cancel.cancelled() => break,
        } {
            Ok((conn, _)) => conn,
            Err(error) => {
                warn!(%error, "failed to accept connection");
                continue;
            },
        };

        next_session += 1;
        tokio::spawn(begin_handle(
            engine.clone(),
            cancel.clone(),
            shutdown_hold.clone(),
            conn,
            next_session,
        ));
    }

    Ok(())
}

#[instrument(name = "handle", err, fields(peer = %conn.peer_addr()?, session = session), skip_all)]
async fn begin_handle(
    engine: Arc<Engine>,
    cancel: CancellationToken,
    _shutdown_hold: mpsc::Sender<()>,
    mut conn: TcpStream,
    session: u64,
) -> Result<()> {
    debug!("accepted connection");

    conn.set_nodelay(true).context("setting NODELAY")?;

    let sid = format!("conn-{session}");
    let ret = {
        let (reader, writer) = conn.split();
        conn::serve(&engine, &cancel, reader, writer, &sid).await
    };

    conn.shutdown().await.context("during shutdown")?;

    debug!("closed connection");

    ret.context("serving connection")
}

/// Runs the engine's time-driven sweeps (delay, TTR, pause and
/// reserve-timeout expiry) at roughly 1 Hz until shutdown.
async fn run_sweeper(engine: Arc<Engine>, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            _ = tick.tick() => {
                let now_ms = engine.now_ms();
                engine.state().await.tick(now_ms);
            },
            _ = cancel.cancelled() => return,
        }
    }
}
