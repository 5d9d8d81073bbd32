use std::collections::{BTreeSet, HashSet};

use tokio::sync::oneshot;

use super::job::JobId;
use super::states::{SessionKind, SessionState};
use super::tube::{TubeName, DEFAULT_TUBE};

/// Opaque session identifier assigned by the connection layer. Sessions
/// are always referred to by id; queue positions and reserver fields
/// store the id and look the record up through the sessions map.
pub type SessionId = String;

/// The engine's answer to a queued reserve, delivered out of band once a
/// dispatch or a timeout resolves it.
#[derive(Debug)]
pub enum ReserveReply {
    Reserved(ReservedJob),
    TimedOut,
}

/// What a worker gets back from reserve: enough to run the job and to
/// name it in later delete/release/bury/touch calls.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReservedJob {
    pub id: JobId,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub kind: Option<SessionKind>,
    /// Tube that put targets.
    pub using: TubeName,
    /// Tubes a reserve draws from.
    pub watching: BTreeSet<TubeName>,
    pub state: SessionState,
    /// For a waiting session, the wall time its reserve expires; None for
    /// an infinite reserve.
    pub deadline_ms: Option<u64>,
    /// Ids of jobs this session currently holds.
    pub reserved: HashSet<JobId>,
    /// Completion slot for an outstanding blocking reserve.
    pub pending: Option<oneshot::Sender<ReserveReply>>,
}

impl Session {
    pub fn new(id: impl Into<SessionId>) -> Self {
        let mut watching = BTreeSet::new();
        watching.insert(DEFAULT_TUBE.to_string());

        Self {
            id: id.into(),
            kind: None,
            using: DEFAULT_TUBE.to_string(),
            watching,
            state: SessionState::Idle,
            deadline_ms: None,
            reserved: HashSet::new(),
            pending: None,
        }
    }

    pub fn is_waiting(&self) -> bool {
        self.state == SessionState::Waiting
    }

    /// Called when the session stops holding a job; a session with no
    /// reservations left and no outstanding reserve goes back to idle.
    pub fn settle(&mut self) {
        if self.reserved.is_empty() && self.state == SessionState::Working {
            self.state = SessionState::Idle;
        }
    }
}
