use std::collections::{BTreeSet, VecDeque};

use super::job::{JobId, URGENT_PRI};
use super::session::SessionId;

pub type TubeName = String;

/// The tube every session starts out using and watching.
pub const DEFAULT_TUBE: &str = "default";

/// A named, isolated queue. The tube holds indexes over job ids only; the
/// jobs map owned by the engine is the single source of truth for job
/// data.
#[derive(Debug)]
pub struct Tube {
    pub name: TubeName,
    /// Jobs available for reservation, ordered by (priority, id) so that
    /// ties on priority resolve to the lower id.
    pub ready: BTreeSet<(u32, JobId)>,
    /// Delayed jobs ordered by (deadline, id).
    pub delayed: BTreeSet<(u64, JobId)>,
    /// Buried jobs, FIFO.
    pub buried: VecDeque<JobId>,
    /// Sessions blocked on reserve with this tube in their watch set, in
    /// arrival order.
    pub waiting: VecDeque<SessionId>,
    pub paused: bool,
    pub pause_deadline_ms: u64,
    pub pauses: u32,
    pub total_jobs: u64,
    pub cmd_delete: u64,
    pub cmd_pause_tube: u64,
}

impl Tube {
    pub fn new(name: impl Into<TubeName>) -> Self {
        Self {
            name: name.into(),
            ready: BTreeSet::new(),
            delayed: BTreeSet::new(),
            buried: VecDeque::new(),
            waiting: VecDeque::new(),
            paused: false,
            pause_deadline_ms: 0,
            pauses: 0,
            total_jobs: 0,
            cmd_delete: 0,
            cmd_pause_tube: 0,
        }
    }

    /// Head of the ready set: the job a reserve on only this tube would
    /// take next.
    pub fn peek_ready(&self) -> Option<(u32, JobId)> {
        self.ready.first().copied()
    }

    /// The delayed job closest to becoming ready.
    pub fn peek_delayed(&self) -> Option<JobId> {
        self.delayed.first().map(|&(_, id)| id)
    }

    /// Oldest buried job.
    pub fn peek_buried(&self) -> Option<JobId> {
        self.buried.front().copied()
    }

    pub fn urgent_count(&self) -> usize {
        self.ready.range(..(URGENT_PRI, 0)).count()
    }

    pub fn pause(&mut self, delay_s: u32, now_ms: u64) {
        self.paused = true;
        self.pause_deadline_ms = now_ms + u64::from(delay_s) * 1000;
        self.pauses += 1;
        self.cmd_pause_tube += 1;
    }

    /// Seconds of pause remaining, zero when not paused.
    pub fn pause_time_left_s(&self, now_ms: u64) -> u64 {
        if self.paused {
            self.pause_deadline_ms.saturating_sub(now_ms) / 1000
        } else {
            0
        }
    }

    /// Drops a session from the waiting list, wherever it is queued.
    pub fn forget_waiter(&mut self, sid: &str) {
        self.waiting.retain(|s| s != sid);
    }
}
