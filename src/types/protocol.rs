use super::job::JobId;
use super::serialisable::BeanstalkSerialisable;
use super::tube::TubeName;

/// A command sent by the client to the server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BeanstalkCommand {
    /// `put <pri> <delay> <ttr> <bytes>` (the job body follows the line)
    Put {
        pri: u32,
        delay: u32,
        ttr: u32,
        n_bytes: u32,
    },
    /// `use <tube>`
    Use { tube: TubeName },
    /// `reserve`
    Reserve,
    /// `reserve-with-timeout <seconds>`
    ReserveWithTimeout { timeout: u32 },
    /// `delete <id>`
    Delete { id: JobId },
    /// `release <id> <pri> <delay>`
    Release { id: JobId, pri: u32, delay: u32 },
    /// `bury <id> <pri>`
    Bury { id: JobId, pri: u32 },
    /// `touch <id>`
    Touch { id: JobId },
    /// `watch <tube>`
    Watch { tube: TubeName },
    /// `ignore <tube>`
    Ignore { tube: TubeName },
    /// `peek <id>`
    Peek { id: JobId },
    /// `peek-ready`
    PeekReady,
    /// `peek-delayed`
    PeekDelayed,
    /// `peek-buried`
    PeekBuried,
    /// `kick <bound>`
    Kick { bound: u64 },
    /// `stats-job <id>`
    StatsJob { id: JobId },
    /// `stats-tube <tube>`
    StatsTube { tube: TubeName },
    /// `stats`
    StatsServer,
    /// `list-tubes`
    ListTubes,
    /// `list-tube-used`
    ListTubeUsed,
    /// `list-tubes-watched`
    ListTubesWatched,
    /// `pause-tube <tube> <delay>`
    PauseTube { tube: TubeName, delay: u32 },
    /// `quit`
    Quit,
}

/// A response sent by the server to the client.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BeanstalkResponse {
    Inserted(JobId),
    Using(TubeName),
    /// `RESERVED <id> <bytes>` followed by the job body.
    Reserved(JobId, Vec<u8>),
    /// `FOUND <id> <bytes>` followed by the job body.
    Found(JobId, Vec<u8>),
    /// `OK <bytes>` followed by a YAML payload.
    Ok(Vec<u8>),
    Watching(usize),
    Kicked(u64),
    Deleted,
    Released,
    Buried,
    Touched,
    Paused,
    TimedOut,
    NotFound,
    NotIgnored,
    Draining,
    ExpectedCrlf,
    BadFormat,
    UnknownCommand,
    InternalError,
}

impl BeanstalkSerialisable for BeanstalkResponse {
    fn serialise_beanstalk(&self) -> Vec<u8> {
        use BeanstalkResponse::*;

        fn with_body(head: String, body: &[u8]) -> Vec<u8> {
            let mut out = Vec::with_capacity(head.len() + body.len() + 2);
            out.extend_from_slice(head.as_bytes());
            out.extend_from_slice(body);
            out.extend_from_slice(b"\r\n");
            out
        }

        match self {
            Inserted(id) => format!("INSERTED {id}\r\n").into_bytes(),
            Using(tube) => format!("USING {tube}\r\n").into_bytes(),
            Reserved(id, data) => {
                with_body(format!("RESERVED {id} {}\r\n", data.len()), data)
            },
            Found(id, data) => {
                with_body(format!("FOUND {id} {}\r\n", data.len()), data)
            },
            Ok(data) => with_body(format!("OK {}\r\n", data.len()), data),
            Watching(n) => format!("WATCHING {n}\r\n").into_bytes(),
            Kicked(n) => format!("KICKED {n}\r\n").into_bytes(),
            Deleted => b"DELETED\r\n".to_vec(),
            Released => b"RELEASED\r\n".to_vec(),
            Buried => b"BURIED\r\n".to_vec(),
            Touched => b"TOUCHED\r\n".to_vec(),
            Paused => b"PAUSED\r\n".to_vec(),
            TimedOut => b"TIMED_OUT\r\n".to_vec(),
            NotFound => b"NOT_FOUND\r\n".to_vec(),
            NotIgnored => b"NOT_IGNORED\r\n".to_vec(),
            Draining => b"DRAINING\r\n".to_vec(),
            ExpectedCrlf => b"EXPECTED_CRLF\r\n".to_vec(),
            BadFormat => b"BAD_FORMAT\r\n".to_vec(),
            UnknownCommand => b"UNKNOWN_COMMAND\r\n".to_vec(),
            InternalError => b"INTERNAL_ERROR\r\n".to_vec(),
        }
    }
}
