//! ironbeans
//!
//! An in-memory job queue server speaking the beanstalkd TCP protocol.
//!
//! The crate is split into the lifecycle engine and the wire plumbing
//! around it:
//! - `types`: job, tube, session records and the protocol enums
//! - `engine`: the state machine, dispatcher and command surface
//! - `wal`: the sharded binary write-ahead log and its replay
//! - `parser` / `line_reader` / `conn`: the TCP text protocol
//! - `clock`: millisecond wall-clock abstraction
//! - `stats`: YAML-serialisable stats snapshots

pub mod clock;
pub mod conn;
pub mod engine;
pub mod line_reader;
pub mod parser;
pub mod stats;
pub mod types;
pub mod wal;
