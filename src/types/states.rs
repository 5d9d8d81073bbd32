use serde::Serialize;

use super::session::SessionId;

/// Lifecycle state of a job. State-specific data lives in the variant:
/// a delayed job knows when it becomes ready, a reserved job knows who
/// holds it and when the reservation expires.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum JobState {
    Ready,
    Delayed { until_ms: u64 },
    Reserved { deadline_ms: u64, by: SessionId },
    Buried,
}

impl JobState {
    pub fn name(&self) -> &'static str {
        use JobState::*;

        match self {
            Ready => "ready",
            Delayed { .. } => "delayed",
            Reserved { .. } => "reserved",
            Buried => "buried",
        }
    }
}

// This impl is used to allow JobStats to be serialised to YAML.
impl Serialize for JobState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.name())
    }
}

/// What a session is doing right now: `Waiting` means a blocking reserve
/// is outstanding, `Working` means at least one job is held.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    Idle,
    Waiting,
    Working,
}

/// Informational role of a session, set by the last role-defining command
/// it ran (`put` makes it a producer, `reserve` a worker).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionKind {
    Producer,
    Worker,
}
