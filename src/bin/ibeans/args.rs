use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub(crate) struct Args {
    /// Path to a properties file; recognised keys are server.port,
    /// wal.enable, wal.dir and wal.files. Flags override file values.
    pub(crate) config: Option<PathBuf>,
    /// Address to listen on.
    #[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)))]
    pub(crate) listen: IpAddr,
    /// (TCP) port to listen on.
    #[arg(short, long)]
    pub(crate) port: Option<u16>,
    /// Enables write-ahead logging and sets the directory to store WAL
    /// files in.
    #[arg(short = 'b', long)]
    pub(crate) wal_dir: Option<PathBuf>,
    /// Number of files the write-ahead log is sharded across.
    #[arg(long)]
    pub(crate) wal_files: Option<usize>,
    /// Rejects new jobs (put answers DRAINING) while serving every other
    /// command.
    #[arg(long, default_value_t)]
    pub(crate) drain: bool,
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t)]
    pub(crate) debug: bool,
}
