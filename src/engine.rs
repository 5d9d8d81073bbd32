//! The job-lifecycle engine.
//!
//! All shared state lives in [`EngineState`]: the jobs map (the single
//! owner of every job), the tubes with their ready/delay/buried indexes,
//! and the sessions. Every command and every periodic sweep runs as one
//! synchronous call while holding the engine lock, so each is an atomic
//! transaction over the data model. The only wait a caller ever performs
//! is a blocking reserve, and that wait happens *between* transactions:
//! the session is queued on its watched tubes and handed a oneshot
//! receiver which a later transaction completes.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{oneshot, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::stats::{CommandCounters, JobStats, ServerStats, TubeStats};
use crate::types::job::{Job, JobId};
use crate::types::session::{
    ReserveReply, ReservedJob, Session, SessionId,
};
use crate::types::states::{JobState, SessionKind, SessionState};
use crate::types::tube::{Tube, TubeName, DEFAULT_TUBE};
use crate::wal::{Wal, WalRecord, WalState};

/// Errors a command can surface. The connection layer maps these onto
/// protocol keywords; the engine never unwinds across a transaction.
#[derive(Debug, Error)]
pub enum CommandError {
    /// Unknown job or tube, or an operation the caller is not permitted
    /// to perform (reported identically, as beanstalkd does).
    #[error("not found")]
    NotFound,
    /// Refusing to ignore the last watched tube.
    #[error("cannot ignore the only watched tube")]
    NotIgnored,
    /// Drain mode is on; new jobs are not accepted.
    #[error("draining")]
    Draining,
    /// The write-ahead log failed; the in-memory transition still
    /// applied.
    #[error("write-ahead log append failed: {0}")]
    Wal(#[from] io::Error),
}

pub type CommandResult<T> = Result<T, CommandError>;

/// Result of a reserve transaction.
#[derive(Debug)]
pub enum ReserveOutcome {
    /// A ready job was assigned synchronously.
    Reserved(ReservedJob),
    /// Non-blocking poll (`reserve-with-timeout 0`) found nothing.
    TimedOut,
    /// The session is queued; the receiver completes on dispatch or
    /// reserve-timeout expiry.
    Queued(oneshot::Receiver<ReserveReply>),
}

/// Async shell around the engine: the lock plus the clock.
pub struct Engine {
    state: Mutex<EngineState>,
    clock: Arc<dyn Clock>,
}

impl Engine {
    pub fn new(
        clock: Arc<dyn Clock>,
        wal: Option<(Wal, Vec<WalRecord>)>,
        drain: bool,
    ) -> Self {
        let now_ms = clock.now_ms();
        let state = match wal {
            Some((wal, recovered)) => {
                let mut state = EngineState::new(now_ms, Some(wal), drain);
                state.restore(recovered);
                state
            },
            None => EngineState::new(now_ms, None, drain),
        };

        Self {
            state: Mutex::new(state),
            clock,
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Takes the engine lock. Commands run against the guard and must not
    /// hold it across awaits other than the lock acquisition itself.
    pub async fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().await
    }
}

pub struct EngineState {
    jobs: HashMap<JobId, Job>,
    tubes: HashMap<TubeName, Tube>,
    sessions: HashMap<SessionId, Session>,
    next_id: JobId,
    drain: bool,
    started_ms: u64,
    job_timeouts: u64,
    total_jobs: u64,
    cmds: CommandCounters,
    wal: Option<Wal>,
}

impl EngineState {
    pub fn new(now_ms: u64, wal: Option<Wal>, drain: bool) -> Self {
        let mut tubes = HashMap::new();
        tubes.insert(DEFAULT_TUBE.to_string(), Tube::new(DEFAULT_TUBE));

        Self {
            jobs: HashMap::new(),
            tubes,
            sessions: HashMap::new(),
            next_id: 1,
            drain,
            started_ms: now_ms,
            job_timeouts: 0,
            total_jobs: 0,
            cmds: CommandCounters::default(),
            wal,
        }
    }

    /// Rebuilds the in-memory model from recovered full records. Replay
    /// already reduced reserved jobs to ready; ids resume past the
    /// highest recovered id.
    pub fn restore(&mut self, records: Vec<WalRecord>) {
        for rec in records {
            let Some(tube_name) = rec.tube.clone() else {
                continue;
            };
            let state = match rec.state {
                WalState::Ready | WalState::Reserved => JobState::Ready,
                WalState::Delayed => JobState::Delayed {
                    until_ms: rec.deadline_ms,
                },
                WalState::Buried => JobState::Buried,
                WalState::Invalid => continue,
            };

            let job = Job {
                id: rec.id,
                pri: rec.pri,
                data: rec.body.unwrap_or_default(),
                state: state.clone(),
                tube: tube_name.clone(),
                delay: rec.delay,
                ttr: rec.ttr,
                created_ms: rec.created_ms,
                reserves: rec.reserves,
                timeouts: rec.timeouts,
                releases: rec.releases,
                buries: rec.buries,
                kicks: rec.kicks,
            };

            let tube = self.tube_mut(&tube_name);
            match &state {
                JobState::Ready => {
                    tube.ready.insert((job.pri, job.id));
                },
                JobState::Delayed { until_ms } => {
                    tube.delayed.insert((*until_ms, job.id));
                },
                JobState::Buried => tube.buried.push_back(job.id),
                JobState::Reserved { .. } => {},
            }
            tube.total_jobs += 1;

            self.next_id = self.next_id.max(job.id + 1);
            self.jobs.insert(job.id, job);
        }

        // The log does not retain deleted jobs, so the cumulative total
        // restarts at the highest id the log has seen.
        self.total_jobs = self.next_id - 1;

        debug!(jobs = self.jobs.len(), next_id = self.next_id, "restored");
    }

    // ---- session lifecycle ---------------------------------------------

    /// Registers a session. Sessions are also created lazily on first
    /// command, so this only matters for connection accounting.
    pub fn open_session(&mut self, sid: &str) {
        self.session_mut(sid);
    }

    /// Closes a session: cancels any blocking reserve and releases every
    /// held job back to ready.
    pub fn close_session(&mut self, sid: &str, now_ms: u64) {
        self.forget_waiter_everywhere(sid);

        let Some(session) = self.sessions.remove(sid) else {
            return;
        };
        // Dropping `session.pending` here wakes a raced reserve with an
        // error; the connection is gone, so nobody is listening.

        let mut held: Vec<JobId> = session.reserved.into_iter().collect();
        held.sort_unstable();

        let mut touched = BTreeSet::new();
        for id in held {
            let Some(job) = self.jobs.get_mut(&id) else {
                continue;
            };
            job.state = JobState::Ready;
            let rec = delta_record(job);
            let tube_name = job.tube.clone();

            self.tube_mut(&tube_name).ready.insert((rec.pri, id));
            self.append_wal_lossy(&rec);
            touched.insert(tube_name);
        }

        for tube_name in touched {
            self.dispatch_ready(&tube_name, now_ms);
        }
    }

    // ---- producer commands ---------------------------------------------

    pub fn put(
        &mut self,
        sid: &str,
        pri: u32,
        delay: u32,
        ttr: u32,
        data: Vec<u8>,
        now_ms: u64,
    ) -> CommandResult<JobId> {
        self.cmds.put += 1;

        if self.drain {
            return Err(CommandError::Draining);
        }

        let tube_name = {
            let session = self.session_mut(sid);
            session.kind = Some(SessionKind::Producer);
            session.using.clone()
        };

        let id = self.next_id;
        self.next_id += 1;

        let job = Job::new(id, pri, delay, ttr, data, tube_name.clone(), now_ms);
        let ready = job.state == JobState::Ready;

        // The put is the first record for this id and so must be full.
        self.append_wal(&full_record(&job))?;

        {
            let tube = self.tube_mut(&tube_name);
            match &job.state {
                JobState::Ready => {
                    tube.ready.insert((job.pri, id));
                },
                JobState::Delayed { until_ms } => {
                    tube.delayed.insert((*until_ms, id));
                },
                JobState::Reserved { .. } | JobState::Buried => {},
            }
            tube.total_jobs += 1;
        }
        self.total_jobs += 1;
        self.jobs.insert(id, job);

        if ready {
            self.dispatch_ready(&tube_name, now_ms);
        }

        Ok(id)
    }

    pub fn use_tube(&mut self, sid: &str, tube: &str) -> TubeName {
        self.cmds.use_ += 1;
        self.tube_mut(tube);

        let session = self.session_mut(sid);
        session.using = tube.to_string();
        session.using.clone()
    }

    pub fn peek(&mut self, id: JobId) -> CommandResult<(JobId, Vec<u8>)> {
        self.cmds.peek += 1;
        self.job_view(Some(id))
    }

    pub fn peek_ready(&mut self, sid: &str) -> CommandResult<(JobId, Vec<u8>)> {
        self.cmds.peek_ready += 1;
        let tube_name = self.session_mut(sid).using.clone();
        let head = self
            .tubes
            .get(&tube_name)
            .and_then(|tube| tube.peek_ready())
            .map(|(_, id)| id);
        self.job_view(head)
    }

    pub fn peek_delayed(
        &mut self,
        sid: &str,
    ) -> CommandResult<(JobId, Vec<u8>)> {
        self.cmds.peek_delayed += 1;
        let tube_name = self.session_mut(sid).using.clone();
        let head = self.tubes.get(&tube_name).and_then(|tube| tube.peek_delayed());
        self.job_view(head)
    }

    pub fn peek_buried(
        &mut self,
        sid: &str,
    ) -> CommandResult<(JobId, Vec<u8>)> {
        self.cmds.peek_buried += 1;
        let tube_name = self.session_mut(sid).using.clone();
        let head = self.tubes.get(&tube_name).and_then(|tube| tube.peek_buried());
        self.job_view(head)
    }

    /// Promotes up to `bound` jobs in the used tube to ready. While any
    /// buried jobs exist only those are kicked; otherwise delayed jobs
    /// are, never both in one call.
    pub fn kick(
        &mut self,
        sid: &str,
        bound: u64,
        now_ms: u64,
    ) -> CommandResult<u64> {
        self.cmds.kick += 1;

        let tube_name = self.session_mut(sid).using.clone();
        let from_buried = self
            .tubes
            .get(&tube_name)
            .map(|tube| !tube.buried.is_empty())
            .unwrap_or(false);

        let mut kicked = 0;
        while kicked < bound {
            let id = {
                let Some(tube) = self.tubes.get_mut(&tube_name) else {
                    break;
                };
                if from_buried {
                    tube.buried.pop_front()
                } else {
                    tube.delayed.pop_first().map(|(_, id)| id)
                }
            };
            let Some(id) = id else {
                break;
            };

            let Some(job) = self.jobs.get_mut(&id) else {
                continue;
            };
            job.state = JobState::Ready;
            job.kicks += 1;
            let rec = delta_record(job);

            self.tube_mut(&tube_name).ready.insert((rec.pri, id));
            self.append_wal(&rec)?;
            kicked += 1;
        }

        if kicked > 0 {
            self.dispatch_ready(&tube_name, now_ms);
        }

        Ok(kicked)
    }

    pub fn pause_tube(
        &mut self,
        tube: &str,
        delay: u32,
        now_ms: u64,
    ) -> CommandResult<()> {
        self.cmds.pause_tube += 1;

        match self.tubes.get_mut(tube) {
            Some(tube) => {
                tube.pause(delay, now_ms);
                Ok(())
            },
            None => Err(CommandError::NotFound),
        }
    }

    // ---- worker commands -----------------------------------------------

    /// Queues the session on every watched tube, then attempts an
    /// immediate assignment. The returned outcome is either the job, an
    /// immediate timeout (non-blocking poll), or a receiver a later
    /// dispatch or expiry completes.
    pub fn reserve(
        &mut self,
        sid: &str,
        timeout: Option<u32>,
        now_ms: u64,
    ) -> ReserveOutcome {
        match timeout {
            None => self.cmds.reserve += 1,
            Some(_) => self.cmds.reserve_with_timeout += 1,
        }

        let watched: Vec<TubeName> = {
            let session = self.session_mut(sid);
            session.kind = Some(SessionKind::Worker);
            session.state = SessionState::Waiting;
            session.deadline_ms =
                timeout.map(|t| now_ms + u64::from(t) * 1000);
            session.watching.iter().cloned().collect()
        };

        for tube_name in &watched {
            self.tube_mut(tube_name).waiting.push_back(sid.to_string());
        }

        if let Some((_, id)) = self.top_ready_for(sid) {
            if let Some(view) = self.assign_job(sid, id, now_ms) {
                return ReserveOutcome::Reserved(view);
            }
        }

        if timeout == Some(0) {
            self.cancel_waiting(sid);
            return ReserveOutcome::TimedOut;
        }

        let (tx, rx) = oneshot::channel();
        self.session_mut(sid).pending = Some(tx);
        ReserveOutcome::Queued(rx)
    }

    pub fn delete(&mut self, sid: &str, id: JobId) -> CommandResult<()> {
        self.cmds.delete += 1;

        let (tube_name, pri, state) = match self.jobs.get(&id) {
            Some(job) => (job.tube.clone(), job.pri, job.state.clone()),
            None => return Err(CommandError::NotFound),
        };

        match &state {
            JobState::Ready => {
                if let Some(tube) = self.tubes.get_mut(&tube_name) {
                    tube.ready.remove(&(pri, id));
                }
            },
            JobState::Buried => {
                if let Some(tube) = self.tubes.get_mut(&tube_name) {
                    if let Some(pos) =
                        tube.buried.iter().position(|&j| j == id)
                    {
                        tube.buried.remove(pos);
                    }
                }
            },
            JobState::Reserved { by, .. } if by == sid => {
                if let Some(session) = self.sessions.get_mut(sid) {
                    session.reserved.remove(&id);
                    session.settle();
                }
            },
            // Delayed jobs, and jobs held by someone else, cannot be
            // deleted; the two are indistinguishable to the caller.
            JobState::Delayed { .. } | JobState::Reserved { .. } => {
                return Err(CommandError::NotFound)
            },
        }

        self.jobs.remove(&id);
        if let Some(tube) = self.tubes.get_mut(&tube_name) {
            tube.cmd_delete += 1;
        }

        self.append_wal(&tombstone_record(id))
    }

    pub fn release(
        &mut self,
        sid: &str,
        id: JobId,
        pri: u32,
        delay: u32,
        now_ms: u64,
    ) -> CommandResult<()> {
        self.cmds.release += 1;

        let job = self.jobs.get_mut(&id).ok_or(CommandError::NotFound)?;
        match &job.state {
            JobState::Reserved { by, .. } if by == sid => {},
            _ => return Err(CommandError::NotFound),
        }

        job.pri = pri;
        job.delay = delay;
        job.releases += 1;
        job.state = if delay == 0 {
            JobState::Ready
        } else {
            JobState::Delayed {
                until_ms: now_ms + u64::from(delay) * 1000,
            }
        };
        let ready = delay == 0;
        let until_ms = job.deadline_ms();
        let tube_name = job.tube.clone();
        let rec = delta_record(job);

        if let Some(session) = self.sessions.get_mut(sid) {
            session.reserved.remove(&id);
            session.settle();
        }

        {
            let tube = self.tube_mut(&tube_name);
            if ready {
                tube.ready.insert((pri, id));
            } else {
                tube.delayed.insert((until_ms, id));
            }
        }

        self.append_wal(&rec)?;

        if ready {
            self.dispatch_ready(&tube_name, now_ms);
        }

        Ok(())
    }

    pub fn bury(
        &mut self,
        sid: &str,
        id: JobId,
        pri: u32,
    ) -> CommandResult<()> {
        self.cmds.bury += 1;

        let job = self.jobs.get_mut(&id).ok_or(CommandError::NotFound)?;
        match &job.state {
            JobState::Reserved { by, .. } if by == sid => {},
            _ => return Err(CommandError::NotFound),
        }

        job.pri = pri;
        job.state = JobState::Buried;
        job.buries += 1;
        let tube_name = job.tube.clone();
        let rec = delta_record(job);

        if let Some(session) = self.sessions.get_mut(sid) {
            session.reserved.remove(&id);
            session.settle();
        }
        self.tube_mut(&tube_name).buried.push_back(id);

        self.append_wal(&rec)
    }

    pub fn touch(
        &mut self,
        sid: &str,
        id: JobId,
        now_ms: u64,
    ) -> CommandResult<()> {
        self.cmds.touch += 1;

        let job = self.jobs.get_mut(&id).ok_or(CommandError::NotFound)?;
        let new_deadline = job.ttr_deadline(now_ms);
        match &mut job.state {
            JobState::Reserved { deadline_ms, by } if by == sid => {
                *deadline_ms = new_deadline;
            },
            _ => return Err(CommandError::NotFound),
        }
        let rec = delta_record(job);

        self.append_wal(&rec)
    }

    pub fn watch(&mut self, sid: &str, tube: &str) -> usize {
        self.cmds.watch += 1;
        self.tube_mut(tube);

        let session = self.session_mut(sid);
        session.watching.insert(tube.to_string());
        session.watching.len()
    }

    pub fn ignore(&mut self, sid: &str, tube: &str) -> CommandResult<usize> {
        self.cmds.ignore += 1;

        let removed = {
            let session = self.session_mut(sid);
            if session.watching.contains(tube) {
                if session.watching.len() == 1 {
                    return Err(CommandError::NotIgnored);
                }
                session.watching.remove(tube);
                true
            } else {
                false
            }
        };

        if removed {
            if let Some(t) = self.tubes.get_mut(tube) {
                t.forget_waiter(sid);
            }
        }

        Ok(self
            .sessions
            .get(sid)
            .map(|session| session.watching.len())
            .unwrap_or(0))
    }

    // ---- inspection ----------------------------------------------------

    pub fn list_tubes(&mut self) -> Vec<TubeName> {
        self.cmds.list_tubes += 1;
        let mut names: Vec<TubeName> = self.tubes.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn list_tube_used(&mut self, sid: &str) -> TubeName {
        self.cmds.list_tube_used += 1;
        self.session_mut(sid).using.clone()
    }

    pub fn list_tubes_watched(&mut self, sid: &str) -> Vec<TubeName> {
        self.cmds.list_tubes_watched += 1;
        self.session_mut(sid).watching.iter().cloned().collect()
    }

    pub fn stats_job(
        &mut self,
        id: JobId,
        now_ms: u64,
    ) -> CommandResult<JobStats> {
        self.cmds.stats_job += 1;

        let job = self.jobs.get(&id).ok_or(CommandError::NotFound)?;
        let time_left_ms = match &job.state {
            JobState::Delayed { until_ms } => until_ms.saturating_sub(now_ms),
            JobState::Reserved { deadline_ms, .. } => {
                if *deadline_ms == u64::MAX {
                    0
                } else {
                    deadline_ms.saturating_sub(now_ms)
                }
            },
            JobState::Ready | JobState::Buried => 0,
        };

        Ok(JobStats {
            id: job.id,
            tube: job.tube.clone(),
            state: job.state.clone(),
            pri: job.pri,
            age: now_ms.saturating_sub(job.created_ms) / 1000,
            delay: job.delay,
            ttr: job.ttr,
            time_left: time_left_ms / 1000,
            reserves: job.reserves,
            timeouts: job.timeouts,
            releases: job.releases,
            buries: job.buries,
            kicks: job.kicks,
        })
    }

    pub fn stats_tube(
        &mut self,
        name: &str,
        now_ms: u64,
    ) -> CommandResult<TubeStats> {
        self.cmds.stats_tube += 1;

        let tube = self.tubes.get(name).ok_or(CommandError::NotFound)?;
        let reserved = self
            .jobs
            .values()
            .filter(|job| {
                job.tube == name
                    && matches!(job.state, JobState::Reserved { .. })
            })
            .count() as u64;

        let mut using = 0;
        let mut watching = 0;
        let mut waiting = 0;
        for session in self.sessions.values() {
            if session.using == name {
                using += 1;
            }
            if session.watching.contains(name) {
                watching += 1;
                if session.is_waiting() {
                    waiting += 1;
                }
            }
        }

        Ok(TubeStats {
            name: tube.name.clone(),
            current_jobs_urgent: tube.urgent_count() as u64,
            current_jobs_ready: tube.ready.len() as u64,
            current_jobs_reserved: reserved,
            current_jobs_delayed: tube.delayed.len() as u64,
            current_jobs_buried: tube.buried.len() as u64,
            total_jobs: tube.total_jobs,
            current_using: using,
            current_watching: watching,
            current_waiting: waiting,
            cmd_delete: tube.cmd_delete,
            cmd_pause_tube: tube.cmd_pause_tube,
            pause: u64::from(tube.pauses),
            pause_time_left: tube.pause_time_left_s(now_ms),
        })
    }

    pub fn stats(&mut self, now_ms: u64) -> ServerStats {
        self.cmds.stats += 1;

        let mut urgent = 0;
        let mut ready = 0;
        let mut reserved = 0;
        let mut delayed = 0;
        let mut buried = 0;
        for job in self.jobs.values() {
            match &job.state {
                JobState::Ready => {
                    ready += 1;
                    if job.is_urgent() {
                        urgent += 1;
                    }
                },
                JobState::Reserved { .. } => reserved += 1,
                JobState::Delayed { .. } => delayed += 1,
                JobState::Buried => buried += 1,
            }
        }

        let mut producers = 0;
        let mut workers = 0;
        let mut waiting = 0;
        for session in self.sessions.values() {
            match session.kind {
                Some(SessionKind::Producer) => producers += 1,
                Some(SessionKind::Worker) => workers += 1,
                None => {},
            }
            if session.is_waiting() {
                waiting += 1;
            }
        }

        ServerStats {
            current_jobs_urgent: urgent,
            current_jobs_ready: ready,
            current_jobs_reserved: reserved,
            current_jobs_delayed: delayed,
            current_jobs_buried: buried,
            cmds: self.cmds.clone(),
            job_timeouts: self.job_timeouts,
            total_jobs: self.total_jobs,
            current_tubes: self.tubes.len() as u64,
            current_connections: self.sessions.len() as u64,
            current_producers: producers,
            current_workers: workers,
            current_waiting: waiting,
            uptime: now_ms.saturating_sub(self.started_ms) / 1000,
        }
    }

    // ---- periodic sweeps -----------------------------------------------

    /// Runs the four time-driven sweeps. Called at roughly 1 Hz by the
    /// server; tests call the individual sweeps with explicit times.
    pub fn tick(&mut self, now_ms: u64) {
        self.expire_delays(now_ms);
        self.expire_ttrs(now_ms);
        self.expire_pauses(now_ms);
        self.expire_reserve_timeouts(now_ms);
    }

    /// Moves every delayed job whose deadline has passed to ready.
    pub fn expire_delays(&mut self, now_ms: u64) {
        let tube_names: Vec<TubeName> = self.tubes.keys().cloned().collect();

        for tube_name in tube_names {
            let mut promoted = false;
            loop {
                let id = {
                    let Some(tube) = self.tubes.get_mut(&tube_name) else {
                        break;
                    };
                    match tube.delayed.first().copied() {
                        Some((deadline_ms, id)) if deadline_ms < now_ms => {
                            tube.delayed.pop_first();
                            Some(id)
                        },
                        _ => None,
                    }
                };
                let Some(id) = id else {
                    break;
                };

                let Some(job) = self.jobs.get_mut(&id) else {
                    continue;
                };
                job.state = JobState::Ready;
                let rec = delta_record(job);

                self.tube_mut(&tube_name).ready.insert((rec.pri, id));
                self.append_wal_lossy(&rec);
                promoted = true;
            }

            if promoted {
                self.dispatch_ready(&tube_name, now_ms);
            }
        }
    }

    /// Returns every expired reservation to ready, charging the job a
    /// timeout. A TTR of zero never expires.
    pub fn expire_ttrs(&mut self, now_ms: u64) {
        let mut expired: Vec<JobId> = self
            .jobs
            .values()
            .filter_map(|job| match &job.state {
                JobState::Reserved { deadline_ms, .. }
                    if *deadline_ms < now_ms =>
                {
                    Some(job.id)
                },
                _ => None,
            })
            .collect();
        expired.sort_unstable();

        let mut touched = BTreeSet::new();
        for id in expired {
            let Some(job) = self.jobs.get_mut(&id) else {
                continue;
            };
            let holder = match &job.state {
                JobState::Reserved { by, .. } => by.clone(),
                _ => continue,
            };

            job.state = JobState::Ready;
            job.timeouts += 1;
            let tube_name = job.tube.clone();
            let rec = delta_record(job);

            self.job_timeouts += 1;
            if let Some(session) = self.sessions.get_mut(&holder) {
                session.reserved.remove(&id);
                session.settle();
            }
            self.tube_mut(&tube_name).ready.insert((rec.pri, id));
            self.append_wal_lossy(&rec);
            touched.insert(tube_name);
        }

        for tube_name in touched {
            self.dispatch_ready(&tube_name, now_ms);
        }
    }

    /// Unpauses tubes whose pause window has passed, then pairs waiting
    /// sessions with ready jobs until one side runs out.
    pub fn expire_pauses(&mut self, now_ms: u64) {
        let expired: Vec<TubeName> = self
            .tubes
            .values()
            .filter(|tube| tube.paused && tube.pause_deadline_ms < now_ms)
            .map(|tube| tube.name.clone())
            .collect();

        for tube_name in expired {
            if let Some(tube) = self.tubes.get_mut(&tube_name) {
                tube.paused = false;
                tube.pause_deadline_ms = 0;
            }
            self.dispatch_ready(&tube_name, now_ms);
        }
    }

    /// Times out waiting sessions whose reserve deadline has passed.
    pub fn expire_reserve_timeouts(&mut self, now_ms: u64) {
        let mut expired: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|session| {
                session.is_waiting()
                    && session
                        .deadline_ms
                        .map(|deadline| deadline < now_ms)
                        .unwrap_or(false)
            })
            .map(|session| session.id.clone())
            .collect();
        expired.sort_unstable();

        for sid in expired {
            self.forget_waiter_everywhere(&sid);
            if let Some(session) = self.sessions.get_mut(&sid) {
                session.deadline_ms = None;
                session.state = if session.reserved.is_empty() {
                    SessionState::Idle
                } else {
                    SessionState::Working
                };
                if let Some(tx) = session.pending.take() {
                    let _ = tx.send(ReserveReply::TimedOut);
                }
            }
        }
    }

    // ---- invariants ----------------------------------------------------

    /// Validates the cross-structure invariants that must hold between
    /// transactions. Returns a description of the first violation found.
    pub fn check_invariants(&self) -> Result<(), String> {
        for job in self.jobs.values() {
            let tube = self
                .tubes
                .get(&job.tube)
                .ok_or_else(|| format!("job {} names unknown tube", job.id))?;

            let (in_ready, in_delayed, in_buried) = (
                tube.ready.contains(&(job.pri, job.id)),
                matches!(&job.state, JobState::Delayed { until_ms }
                    if tube.delayed.contains(&(*until_ms, job.id))),
                tube.buried.contains(&job.id),
            );

            let placement_ok = match &job.state {
                JobState::Ready => in_ready && !in_buried,
                JobState::Delayed { .. } => in_delayed && !in_ready,
                JobState::Buried => in_buried && !in_ready,
                JobState::Reserved { by, .. } => {
                    let held = self
                        .sessions
                        .get(by)
                        .map(|s| s.reserved.contains(&job.id))
                        .unwrap_or(false);
                    if !held {
                        return Err(format!(
                            "reserved job {} not held by its reserver",
                            job.id
                        ));
                    }
                    !in_ready && !in_buried
                },
            };
            if !placement_ok {
                return Err(format!(
                    "job {} in state {} has wrong placement",
                    job.id,
                    job.state.name()
                ));
            }

            if job.id >= self.next_id {
                return Err(format!("job {} >= id counter", job.id));
            }
        }

        for session in self.sessions.values() {
            if session.is_waiting() {
                for tube_name in &session.watching {
                    let queued = self
                        .tubes
                        .get(tube_name)
                        .map(|t| t.waiting.contains(&session.id))
                        .unwrap_or(false);
                    if !queued {
                        return Err(format!(
                            "waiting session {} missing from tube {}",
                            session.id, tube_name
                        ));
                    }
                }
            }
            if session.state == SessionState::Working
                && session.reserved.is_empty()
            {
                return Err(format!(
                    "working session {} holds no jobs",
                    session.id
                ));
            }
            for id in &session.reserved {
                match self.jobs.get(id).map(|job| &job.state) {
                    Some(JobState::Reserved { by, .. })
                        if *by == session.id => {},
                    _ => {
                        return Err(format!(
                            "session {} claims job {id} it does not hold",
                            session.id
                        ))
                    },
                }
            }
        }

        Ok(())
    }

    // ---- internals -----------------------------------------------------

    fn session_mut(&mut self, sid: &str) -> &mut Session {
        self.sessions
            .entry(sid.to_string())
            .or_insert_with(|| Session::new(sid))
    }

    fn tube_mut(&mut self, name: &str) -> &mut Tube {
        self.tubes
            .entry(name.to_string())
            .or_insert_with(|| Tube::new(name))
    }

    fn job_view(
        &self,
        id: Option<JobId>,
    ) -> CommandResult<(JobId, Vec<u8>)> {
        id.and_then(|id| self.jobs.get(&id))
            .map(|job| (job.id, job.data.clone()))
            .ok_or(CommandError::NotFound)
    }

    /// Lowest (priority, id) ready job across the session's watched,
    /// unpaused tubes: a k-way selection over the tube heads.
    fn top_ready_for(&self, sid: &str) -> Option<(TubeName, JobId)> {
        let session = self.sessions.get(sid)?;

        session
            .watching
            .iter()
            .filter_map(|name| self.tubes.get(name))
            .filter(|tube| !tube.paused)
            .filter_map(|tube| {
                tube.peek_ready().map(|(pri, id)| (pri, id, &tube.name))
            })
            .min()
            .map(|(_, id, name)| (name.clone(), id))
    }

    /// Pairs the tube's ready head with its longest-waiting live session,
    /// repeatedly, until either side empties. Entering jobs on a paused
    /// tube never dispatches.
    fn dispatch_ready(&mut self, tube_name: &str, now_ms: u64) {
        loop {
            let (id, sid) = {
                let Some(tube) = self.tubes.get_mut(tube_name) else {
                    return;
                };
                if tube.paused {
                    return;
                }
                let Some((_, id)) = tube.peek_ready() else {
                    return;
                };

                // Skip entries for sessions that were assigned elsewhere,
                // timed out, or disconnected since they queued.
                let sid = loop {
                    match tube.waiting.pop_front() {
                        None => return,
                        Some(sid) => {
                            let live = self
                                .sessions
                                .get(&sid)
                                .map(|s| s.is_waiting())
                                .unwrap_or(false);
                            if live {
                                break sid;
                            }
                        },
                    }
                };
                (id, sid)
            };

            self.assign_job(&sid, id, now_ms);
        }
    }

    /// Performs the reservation of a ready job for a session and delivers
    /// it if a blocking reserve is pending.
    fn assign_job(
        &mut self,
        sid: &str,
        id: JobId,
        now_ms: u64,
    ) -> Option<ReservedJob> {
        let (tube_name, view, rec) = {
            let job = self.jobs.get_mut(&id)?;
            let deadline_ms = job.ttr_deadline(now_ms);
            job.state = JobState::Reserved {
                deadline_ms,
                by: sid.to_string(),
            };
            job.reserves += 1;
            (
                job.tube.clone(),
                ReservedJob {
                    id,
                    data: job.data.clone(),
                },
                delta_record(job),
            )
        };

        if let Some(tube) = self.tubes.get_mut(&tube_name) {
            tube.ready.remove(&(rec.pri, id));
        }

        self.forget_waiter_everywhere(sid);

        let session = self.session_mut(sid);
        session.reserved.insert(id);
        session.state = SessionState::Working;
        session.deadline_ms = None;
        if let Some(tx) = session.pending.take() {
            // The receiver can only be gone if the connection died; the
            // close will release the job again.
            let _ = tx.send(ReserveReply::Reserved(view.clone()));
        }

        self.append_wal_lossy(&rec);

        Some(view)
    }

    /// Aborts an outstanding wait: the session keeps no queue position.
    fn cancel_waiting(&mut self, sid: &str) {
        self.forget_waiter_everywhere(sid);
        let session = self.session_mut(sid);
        session.deadline_ms = None;
        session.pending = None;
        session.state = if session.reserved.is_empty() {
            SessionState::Idle
        } else {
            SessionState::Working
        };
    }

    fn forget_waiter_everywhere(&mut self, sid: &str) {
        let watched: Vec<TubeName> = self
            .sessions
            .get(sid)
            .map(|session| session.watching.iter().cloned().collect())
            .unwrap_or_default();

        for tube_name in watched {
            if let Some(tube) = self.tubes.get_mut(&tube_name) {
                tube.forget_waiter(sid);
            }
        }
    }

    fn append_wal(&mut self, rec: &WalRecord) -> CommandResult<()> {
        match &mut self.wal {
            Some(wal) => wal.append(rec).map_err(CommandError::from),
            None => Ok(()),
        }
    }

    /// WAL append on paths with nobody to report an error to (sweeps,
    /// session close). The failure is logged; in-memory state stays
    /// consistent and at most this one record is lost.
    fn append_wal_lossy(&mut self, rec: &WalRecord) {
        if let Some(wal) = &mut self.wal {
            if let Err(error) = wal.append(rec) {
                warn!(%error, id = rec.id, "write-ahead log append failed");
            }
        }
    }
}

fn wal_state(state: &JobState) -> WalState {
    match state {
        JobState::Ready => WalState::Ready,
        JobState::Delayed { .. } => WalState::Delayed,
        JobState::Reserved { .. } => WalState::Reserved,
        JobState::Buried => WalState::Buried,
    }
}

fn full_record(job: &Job) -> WalRecord {
    WalRecord {
        tube: Some(job.tube.clone()),
        body: Some(job.data.clone()),
        ..delta_record(job)
    }
}

fn delta_record(job: &Job) -> WalRecord {
    WalRecord {
        id: job.id,
        delay: job.delay,
        ttr: job.ttr,
        pri: job.pri,
        created_ms: job.created_ms,
        deadline_ms: job.deadline_ms(),
        state: wal_state(&job.state),
        reserves: job.reserves,
        timeouts: job.timeouts,
        releases: job.releases,
        buries: job.buries,
        kicks: job.kicks,
        tube: None,
        body: None,
    }
}

fn tombstone_record(id: JobId) -> WalRecord {
    WalRecord {
        id,
        delay: 0,
        ttr: 0,
        pri: 0,
        created_ms: 0,
        deadline_ms: 0,
        state: WalState::Invalid,
        reserves: 0,
        timeouts: 0,
        releases: 0,
        buries: 0,
        kicks: 0,
        tube: None,
        body: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> EngineState {
        EngineState::new(0, None, false)
    }

    #[track_caller]
    fn ok_invariants(state: &EngineState) {
        if let Err(violation) = state.check_invariants() {
            panic!("invariant violated: {violation}");
        }
    }

    #[track_caller]
    fn reserved_now(outcome: ReserveOutcome) -> ReservedJob {
        match outcome {
            ReserveOutcome::Reserved(view) => view,
            other => panic!("expected an immediate reservation, got {other:?}"),
        }
    }

    #[track_caller]
    fn queued(outcome: ReserveOutcome) -> oneshot::Receiver<ReserveReply> {
        match outcome {
            ReserveOutcome::Queued(rx) => rx,
            other => panic!("expected a queued reserve, got {other:?}"),
        }
    }

    #[test]
    fn priority_ties_resolve_by_lower_id() {
        let mut state = engine();
        let id1 = state.put("p", 10, 0, 100, b"a".to_vec(), 0).unwrap();
        let id2 = state.put("p", 10, 0, 100, b"b".to_vec(), 0).unwrap();
        assert_eq!((id1, id2), (1, 2));

        let view = reserved_now(state.reserve("w", None, 0));
        assert_eq!(view.id, 1);
        assert_eq!(view.data, b"a");
        ok_invariants(&state);
    }

    #[test]
    fn lower_priority_number_wins() {
        let mut state = engine();
        state.put("p", 1024, 0, 100, b"later".to_vec(), 0).unwrap();
        state.put("p", 5, 0, 100, b"first".to_vec(), 0).unwrap();

        assert_eq!(reserved_now(state.reserve("w", None, 0)).data, b"first");
    }

    #[test]
    fn delayed_jobs_become_ready_after_expiry() {
        let mut state = engine();
        let id = state.put("p", 5, 1, 10, b"x".to_vec(), 0).unwrap();
        assert!(matches!(
            state.stats_job(id, 0).unwrap().state,
            JobState::Delayed { .. }
        ));

        // Not yet due at exactly the deadline.
        state.expire_delays(1_000);
        assert!(matches!(state.reserve("w", Some(0), 1_000),
            ReserveOutcome::TimedOut));

        state.expire_delays(1_500);
        let view = reserved_now(state.reserve("w", None, 1_500));
        assert_eq!(view.id, id);
        ok_invariants(&state);
    }

    #[test]
    fn delay_expiry_dispatches_to_waiting_worker() {
        let mut state = engine();
        state.put("p", 5, 1, 10, b"x".to_vec(), 0).unwrap();

        let mut rx = queued(state.reserve("w", None, 0));
        state.expire_delays(1_500);

        let reply = rx.try_recv().expect("job should have been delivered");
        match reply {
            ReserveReply::Reserved(view) => assert_eq!(view.data, b"x"),
            ReserveReply::TimedOut => panic!("unexpected timeout"),
        }
        ok_invariants(&state);
    }

    #[test]
    fn ttr_expiry_returns_job_to_ready() {
        let mut state = engine();
        let id = state.put("p", 5, 0, 1, b"y".to_vec(), 0).unwrap();
        reserved_now(state.reserve("w", None, 0));

        // Still reserved at the deadline itself.
        state.expire_ttrs(1_000);
        assert!(matches!(
            state.stats_job(id, 1_000).unwrap().state,
            JobState::Reserved { .. }
        ));

        state.expire_ttrs(1_100);
        let stats = state.stats_job(id, 1_100).unwrap();
        assert_eq!(stats.state, JobState::Ready);
        assert_eq!(stats.timeouts, 1);
        assert_eq!(state.stats(1_100).job_timeouts, 1);
        ok_invariants(&state);
    }

    #[test]
    fn zero_ttr_reservation_never_expires() {
        let mut state = engine();
        let id = state.put("p", 5, 0, 0, b"z".to_vec(), 0).unwrap();
        reserved_now(state.reserve("w", None, 0));

        state.expire_ttrs(u64::MAX - 1);
        assert!(matches!(
            state.stats_job(id, 0).unwrap().state,
            JobState::Reserved { .. }
        ));
    }

    #[test]
    fn touch_extends_a_reservation() {
        let mut state = engine();
        let id = state.put("p", 5, 0, 1, b"y".to_vec(), 0).unwrap();
        reserved_now(state.reserve("w", None, 0));

        state.touch("w", id, 900).unwrap();
        state.expire_ttrs(1_500);
        assert!(matches!(
            state.stats_job(id, 1_500).unwrap().state,
            JobState::Reserved { .. }
        ));

        state.expire_ttrs(2_000);
        assert_eq!(state.stats_job(id, 2_000).unwrap().state, JobState::Ready);
    }

    #[test]
    fn touch_requires_the_reserver() {
        let mut state = engine();
        let id = state.put("p", 5, 0, 1, b"y".to_vec(), 0).unwrap();
        reserved_now(state.reserve("w", None, 0));

        assert!(matches!(
            state.touch("other", id, 0),
            Err(CommandError::NotFound)
        ));
    }

    #[test]
    fn release_requeues_with_new_priority() {
        let mut state = engine();
        let id = state.put("p", 100, 0, 60, b"j".to_vec(), 0).unwrap();
        reserved_now(state.reserve("w", None, 0));

        state.release("w", id, 7, 0, 0).unwrap();
        let stats = state.stats_job(id, 0).unwrap();
        assert_eq!(stats.state, JobState::Ready);
        assert_eq!(stats.pri, 7);
        assert_eq!(stats.releases, 1);

        let view = reserved_now(state.reserve("w", None, 0));
        assert_eq!(view.id, id);
        ok_invariants(&state);
    }

    #[test]
    fn release_with_delay_goes_back_to_delayed() {
        let mut state = engine();
        let id = state.put("p", 100, 0, 60, b"j".to_vec(), 0).unwrap();
        reserved_now(state.reserve("w", None, 0));

        state.release("w", id, 100, 5, 1_000).unwrap();
        assert_eq!(
            state.stats_job(id, 1_000).unwrap().state,
            JobState::Delayed { until_ms: 6_000 }
        );
        assert!(matches!(state.reserve("w", Some(0), 1_000),
            ReserveOutcome::TimedOut));
        ok_invariants(&state);
    }

    #[test]
    fn bury_then_kick_round_trip() {
        let mut state = engine();
        let id = state.put("p", 5, 0, 100, b"z".to_vec(), 0).unwrap();
        reserved_now(state.reserve("w", None, 0));

        state.bury("w", id, 10).unwrap();
        let tube = state.stats_tube(DEFAULT_TUBE, 0).unwrap();
        assert_eq!(tube.current_jobs_buried, 1);
        assert_eq!(tube.current_jobs_ready, 0);

        assert_eq!(state.kick("p", 1, 0).unwrap(), 1);
        let tube = state.stats_tube(DEFAULT_TUBE, 0).unwrap();
        assert_eq!(tube.current_jobs_buried, 0);
        assert_eq!(tube.current_jobs_ready, 1);

        let stats = state.stats_job(id, 0).unwrap();
        assert_eq!(stats.pri, 10);
        assert_eq!(stats.kicks, 1);
        ok_invariants(&state);
    }

    #[test]
    fn kick_prefers_buried_over_delayed() {
        let mut state = engine();
        let delayed = state.put("p", 5, 60, 100, b"d".to_vec(), 0).unwrap();
        let buried = state.put("p", 5, 0, 100, b"b".to_vec(), 0).unwrap();
        reserved_now(state.reserve("w", None, 0));
        state.bury("w", buried, 5).unwrap();

        // Both populations exist; only the buried job moves.
        assert_eq!(state.kick("p", 100, 0).unwrap(), 1);
        assert_eq!(state.stats_job(buried, 0).unwrap().state, JobState::Ready);
        assert!(matches!(
            state.stats_job(delayed, 0).unwrap().state,
            JobState::Delayed { .. }
        ));

        // With the buried list empty, a second kick takes the delayed job.
        assert_eq!(state.kick("p", 100, 0).unwrap(), 1);
        assert_eq!(state.stats_job(delayed, 0).unwrap().state, JobState::Ready);
        ok_invariants(&state);
    }

    #[test]
    fn kick_respects_the_bound() {
        let mut state = engine();
        for _ in 0..5 {
            let id = state.put("p", 5, 0, 100, b"b".to_vec(), 0).unwrap();
            reserved_now(state.reserve("w", None, 0));
            state.bury("w", id, 5).unwrap();
        }

        assert_eq!(state.kick("p", 3, 0).unwrap(), 3);
        let tube = state.stats_tube(DEFAULT_TUBE, 0).unwrap();
        assert_eq!(tube.current_jobs_buried, 2);
        assert_eq!(tube.current_jobs_ready, 3);
    }

    #[test]
    fn delete_rules() {
        let mut state = engine();

        // Ready: anyone can delete.
        let ready = state.put("p", 5, 0, 100, b"r".to_vec(), 0).unwrap();
        state.delete("p", ready).unwrap();
        assert!(matches!(
            state.stats_job(ready, 0),
            Err(CommandError::NotFound)
        ));

        // Delayed: nobody can delete.
        let delayed = state.put("p", 5, 60, 100, b"d".to_vec(), 0).unwrap();
        assert!(matches!(
            state.delete("p", delayed),
            Err(CommandError::NotFound)
        ));

        // Reserved: only the reserver.
        let held = state.put("p", 5, 0, 100, b"h".to_vec(), 0).unwrap();
        reserved_now(state.reserve("w", None, 0));
        assert!(matches!(
            state.delete("p", held),
            Err(CommandError::NotFound)
        ));
        state.delete("w", held).unwrap();

        // Buried: anyone.
        let buried = state.put("p", 5, 0, 100, b"b".to_vec(), 0).unwrap();
        reserved_now(state.reserve("w", None, 0));
        state.bury("w", buried, 5).unwrap();
        state.delete("p", buried).unwrap();

        ok_invariants(&state);
    }

    #[test]
    fn tubes_are_isolated_and_created_lazily() {
        let mut state = engine();
        assert_eq!(state.use_tube("p", "emails"), "emails");
        state.put("p", 5, 0, 100, b"mail".to_vec(), 0).unwrap();

        // A worker watching only default sees nothing.
        assert!(matches!(state.reserve("w", Some(0), 0),
            ReserveOutcome::TimedOut));

        assert_eq!(state.watch("w", "emails"), 2);
        let view = reserved_now(state.reserve("w", None, 0));
        assert_eq!(view.data, b"mail");
        ok_invariants(&state);
    }

    #[test]
    fn ignore_refuses_to_empty_the_watch_set() {
        let mut state = engine();
        state.open_session("w");
        assert!(matches!(
            state.ignore("w", DEFAULT_TUBE),
            Err(CommandError::NotIgnored)
        ));
        assert_eq!(state.list_tubes_watched("w"), vec!["default"]);

        state.watch("w", "other");
        assert_eq!(state.ignore("w", DEFAULT_TUBE).unwrap(), 1);
        assert_eq!(state.list_tubes_watched("w"), vec!["other"]);
    }

    #[test]
    fn ignoring_an_unwatched_tube_is_a_no_op() {
        let mut state = engine();
        state.open_session("w");
        assert_eq!(state.ignore("w", "nonexistent").unwrap(), 1);
    }

    #[test]
    fn waiting_workers_are_served_fifo() {
        let mut state = engine();
        let mut rx_a = queued(state.reserve("a", None, 0));
        let mut rx_b = queued(state.reserve("b", None, 0));

        state.put("p", 5, 0, 100, b"first".to_vec(), 0).unwrap();
        state.put("p", 5, 0, 100, b"second".to_vec(), 0).unwrap();

        match rx_a.try_recv().unwrap() {
            ReserveReply::Reserved(view) => assert_eq!(view.data, b"first"),
            ReserveReply::TimedOut => panic!("a timed out"),
        }
        match rx_b.try_recv().unwrap() {
            ReserveReply::Reserved(view) => assert_eq!(view.data, b"second"),
            ReserveReply::TimedOut => panic!("b timed out"),
        }
        ok_invariants(&state);
    }

    #[test]
    fn reserve_timeout_expires_the_wait() {
        let mut state = engine();
        let mut rx = queued(state.reserve("w", Some(2), 0));

        state.expire_reserve_timeouts(1_000);
        assert!(rx.try_recv().is_err(), "not yet due");

        state.expire_reserve_timeouts(2_500);
        assert!(matches!(rx.try_recv(), Ok(ReserveReply::TimedOut)));
        ok_invariants(&state);

        // A job arriving later is not handed to the lapsed session.
        state.put("p", 5, 0, 100, b"late".to_vec(), 3_000).unwrap();
        assert_eq!(
            state.stats_job(1, 3_000).unwrap().state,
            JobState::Ready
        );
    }

    #[test]
    fn paused_tube_defers_dispatch_until_expiry() {
        let mut state = engine();
        state.put("p", 1, 0, 100, b"q".to_vec(), 0).unwrap();
        state.pause_tube(DEFAULT_TUBE, 1, 0).unwrap();

        // The job is ready but the tube contributes nothing.
        let mut rx = queued(state.reserve("w", None, 0));
        assert!(rx.try_recv().is_err());

        state.expire_pauses(500);
        assert!(rx.try_recv().is_err(), "pause still active");

        state.expire_pauses(1_100);
        match rx.try_recv().unwrap() {
            ReserveReply::Reserved(view) => assert_eq!(view.data, b"q"),
            ReserveReply::TimedOut => panic!("unexpected timeout"),
        }
        ok_invariants(&state);
    }

    #[test]
    fn put_on_paused_tube_does_not_dispatch() {
        let mut state = engine();
        state.pause_tube(DEFAULT_TUBE, 60, 0).unwrap();
        let mut rx = queued(state.reserve("w", None, 0));

        state.put("p", 1, 0, 100, b"q".to_vec(), 0).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn pause_tube_requires_an_existing_tube() {
        let mut state = engine();
        assert!(matches!(
            state.pause_tube("missing", 1, 0),
            Err(CommandError::NotFound)
        ));
    }

    #[test]
    fn drain_mode_rejects_puts_only() {
        let mut state = EngineState::new(0, None, true);
        assert!(matches!(
            state.put("p", 5, 0, 100, b"no".to_vec(), 0),
            Err(CommandError::Draining)
        ));
        // Everything else keeps working.
        assert_eq!(state.use_tube("p", "emails"), "emails");
        assert!(matches!(state.reserve("w", Some(0), 0),
            ReserveOutcome::TimedOut));
    }

    #[test]
    fn closing_a_session_releases_its_jobs() {
        let mut state = engine();
        let id = state.put("p", 5, 0, 100, b"held".to_vec(), 0).unwrap();
        reserved_now(state.reserve("w", None, 0));

        // Another worker is already waiting; the released job flows to it.
        let mut rx = queued(state.reserve("w2", None, 0));
        state.close_session("w", 0);

        assert_eq!(state.stats(0).current_connections, 2);
        match rx.try_recv().unwrap() {
            ReserveReply::Reserved(view) => assert_eq!(view.id, id),
            ReserveReply::TimedOut => panic!("unexpected timeout"),
        }
        ok_invariants(&state);
    }

    #[test]
    fn closing_a_waiting_session_leaves_no_queue_position() {
        let mut state = engine();
        let _rx = queued(state.reserve("w", None, 0));
        state.close_session("w", 0);

        // The next put must not be burned on the dead session.
        let id = state.put("p", 5, 0, 100, b"x".to_vec(), 0).unwrap();
        assert_eq!(state.stats_job(id, 0).unwrap().state, JobState::Ready);
        ok_invariants(&state);
    }

    #[test]
    fn peeks_inspect_the_used_tube() {
        let mut state = engine();
        state.put("p", 5, 60, 100, b"delayed".to_vec(), 0).unwrap();
        let ready = state.put("p", 5, 0, 100, b"ready".to_vec(), 0).unwrap();
        let buried = state.put("p", 1, 0, 100, b"buried".to_vec(), 0).unwrap();
        reserved_now(state.reserve("w", None, 0));
        state.bury("w", buried, 1).unwrap();

        assert_eq!(state.peek_ready("p").unwrap(), (ready, b"ready".to_vec()));
        assert_eq!(state.peek_delayed("p").unwrap().1, b"delayed".to_vec());
        assert_eq!(state.peek_buried("p").unwrap().0, buried);
        assert_eq!(state.peek(ready).unwrap().1, b"ready".to_vec());
        assert!(matches!(state.peek(999), Err(CommandError::NotFound)));

        // Peeks on another tube see none of these.
        state.use_tube("p", "elsewhere");
        assert!(matches!(
            state.peek_ready("p"),
            Err(CommandError::NotFound)
        ));
    }

    #[test]
    fn stats_counts_by_state_and_role() {
        let mut state = engine();
        state.put("p", 5, 0, 100, b"a".to_vec(), 0).unwrap();
        state.put("p", 2000, 60, 100, b"b".to_vec(), 0).unwrap();
        reserved_now(state.reserve("w", None, 0));
        let _rx = queued(state.reserve("w2", None, 0));

        let stats = state.stats(5_000);
        assert_eq!(stats.current_jobs_ready, 0);
        assert_eq!(stats.current_jobs_reserved, 1);
        assert_eq!(stats.current_jobs_delayed, 1);
        assert_eq!(stats.current_producers, 1);
        assert_eq!(stats.current_workers, 2);
        assert_eq!(stats.current_waiting, 1);
        assert_eq!(stats.total_jobs, 2);
        assert_eq!(stats.cmds.put, 2);
        assert_eq!(stats.cmds.reserve, 2);
        assert_eq!(stats.uptime, 5);
        ok_invariants(&state);
    }

    #[test]
    fn urgent_jobs_are_ready_jobs_below_1024() {
        let mut state = engine();
        state.put("p", 1023, 0, 100, b"u".to_vec(), 0).unwrap();
        state.put("p", 1024, 0, 100, b"n".to_vec(), 0).unwrap();
        state.put("p", 500, 60, 100, b"d".to_vec(), 0).unwrap();

        let stats = state.stats(0);
        assert_eq!(stats.current_jobs_urgent, 1);
        assert_eq!(
            state.stats_tube(DEFAULT_TUBE, 0).unwrap().current_jobs_urgent,
            1
        );
    }

    #[test]
    fn ids_survive_and_increase_monotonically() {
        let mut state = engine();
        let a = state.put("p", 5, 0, 100, b"a".to_vec(), 0).unwrap();
        state.delete("p", a).unwrap();
        let b = state.put("p", 5, 0, 100, b"b".to_vec(), 0).unwrap();
        assert!(b > a);
    }
}
