//! Serialisable snapshots for the stats and list commands.
//!
//! beanstalkd renders these as YAML dictionaries and lists inside an
//! `OK <bytes>` response; serde's kebab-case renames reproduce the wire
//! key names exactly.

use serde::Serialize;

use crate::types::states::JobState;

/// Renders any snapshot as the YAML payload of an `OK` response.
pub fn to_yaml<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_yaml::Error> {
    serde_yaml::to_string(value).map(String::into_bytes)
}

/// One counter per command verb, bumped once per dispatch into the
/// engine.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CommandCounters {
    #[serde(rename = "cmd-put")]
    pub put: u64,
    #[serde(rename = "cmd-use")]
    pub use_: u64,
    #[serde(rename = "cmd-reserve")]
    pub reserve: u64,
    #[serde(rename = "cmd-reserve-with-timeout")]
    pub reserve_with_timeout: u64,
    #[serde(rename = "cmd-delete")]
    pub delete: u64,
    #[serde(rename = "cmd-release")]
    pub release: u64,
    #[serde(rename = "cmd-bury")]
    pub bury: u64,
    #[serde(rename = "cmd-touch")]
    pub touch: u64,
    #[serde(rename = "cmd-watch")]
    pub watch: u64,
    #[serde(rename = "cmd-ignore")]
    pub ignore: u64,
    #[serde(rename = "cmd-peek")]
    pub peek: u64,
    #[serde(rename = "cmd-peek-ready")]
    pub peek_ready: u64,
    #[serde(rename = "cmd-peek-delayed")]
    pub peek_delayed: u64,
    #[serde(rename = "cmd-peek-buried")]
    pub peek_buried: u64,
    #[serde(rename = "cmd-kick")]
    pub kick: u64,
    #[serde(rename = "cmd-stats")]
    pub stats: u64,
    #[serde(rename = "cmd-stats-job")]
    pub stats_job: u64,
    #[serde(rename = "cmd-stats-tube")]
    pub stats_tube: u64,
    #[serde(rename = "cmd-list-tubes")]
    pub list_tubes: u64,
    #[serde(rename = "cmd-list-tube-used")]
    pub list_tube_used: u64,
    #[serde(rename = "cmd-list-tubes-watched")]
    pub list_tubes_watched: u64,
    #[serde(rename = "cmd-pause-tube")]
    pub pause_tube: u64,
}

/// The `stats` response: process-wide counts.
#[derive(Clone, Debug, Serialize)]
pub struct ServerStats {
    #[serde(rename = "current-jobs-urgent")]
    pub current_jobs_urgent: u64,
    #[serde(rename = "current-jobs-ready")]
    pub current_jobs_ready: u64,
    #[serde(rename = "current-jobs-reserved")]
    pub current_jobs_reserved: u64,
    #[serde(rename = "current-jobs-delayed")]
    pub current_jobs_delayed: u64,
    #[serde(rename = "current-jobs-buried")]
    pub current_jobs_buried: u64,
    #[serde(flatten)]
    pub cmds: CommandCounters,
    #[serde(rename = "job-timeouts")]
    pub job_timeouts: u64,
    #[serde(rename = "total-jobs")]
    pub total_jobs: u64,
    #[serde(rename = "current-tubes")]
    pub current_tubes: u64,
    #[serde(rename = "current-connections")]
    pub current_connections: u64,
    #[serde(rename = "current-producers")]
    pub current_producers: u64,
    #[serde(rename = "current-workers")]
    pub current_workers: u64,
    #[serde(rename = "current-waiting")]
    pub current_waiting: u64,
    /// Seconds since the engine started.
    pub uptime: u64,
}

/// The `stats-tube <name>` response.
#[derive(Clone, Debug, Serialize)]
pub struct TubeStats {
    pub name: String,
    #[serde(rename = "current-jobs-urgent")]
    pub current_jobs_urgent: u64,
    #[serde(rename = "current-jobs-ready")]
    pub current_jobs_ready: u64,
    #[serde(rename = "current-jobs-reserved")]
    pub current_jobs_reserved: u64,
    #[serde(rename = "current-jobs-delayed")]
    pub current_jobs_delayed: u64,
    #[serde(rename = "current-jobs-buried")]
    pub current_jobs_buried: u64,
    #[serde(rename = "total-jobs")]
    pub total_jobs: u64,
    #[serde(rename = "current-using")]
    pub current_using: u64,
    #[serde(rename = "current-watching")]
    pub current_watching: u64,
    #[serde(rename = "current-waiting")]
    pub current_waiting: u64,
    #[serde(rename = "cmd-delete")]
    pub cmd_delete: u64,
    #[serde(rename = "cmd-pause-tube")]
    pub cmd_pause_tube: u64,
    pub pause: u64,
    #[serde(rename = "pause-time-left")]
    pub pause_time_left: u64,
}

/// The `stats-job <id>` response.
#[derive(Clone, Debug, Serialize)]
pub struct JobStats {
    pub id: u64,
    pub tube: String,
    pub state: JobState,
    pub pri: u32,
    /// Seconds since the job was created.
    pub age: u64,
    pub delay: u32,
    pub ttr: u32,
    /// Seconds until the current delay or reservation expires.
    #[serde(rename = "time-left")]
    pub time_left: u64,
    pub reserves: u32,
    pub timeouts: u32,
    pub releases: u32,
    pub buries: u32,
    pub kicks: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_stats_use_wire_key_names() {
        let stats = ServerStats {
            current_jobs_urgent: 0,
            current_jobs_ready: 2,
            current_jobs_reserved: 1,
            current_jobs_delayed: 0,
            current_jobs_buried: 0,
            cmds: CommandCounters {
                put: 3,
                reserve_with_timeout: 1,
                ..Default::default()
            },
            job_timeouts: 0,
            total_jobs: 3,
            current_tubes: 1,
            current_connections: 2,
            current_producers: 1,
            current_workers: 1,
            current_waiting: 0,
            uptime: 12,
        };

        let yaml = String::from_utf8(to_yaml(&stats).unwrap()).unwrap();
        assert!(yaml.contains("current-jobs-ready: 2"));
        assert!(yaml.contains("cmd-put: 3"));
        assert!(yaml.contains("cmd-reserve-with-timeout: 1"));
        assert!(yaml.contains("uptime: 12"));
    }

    #[test]
    fn job_stats_serialise_state_name() {
        let stats = JobStats {
            id: 9,
            tube: "default".into(),
            state: JobState::Delayed { until_ms: 99 },
            pri: 10,
            age: 1,
            delay: 5,
            ttr: 60,
            time_left: 4,
            reserves: 0,
            timeouts: 0,
            releases: 0,
            buries: 0,
            kicks: 0,
        };

        let yaml = String::from_utf8(to_yaml(&stats).unwrap()).unwrap();
        assert!(yaml.contains("state: delayed"));
        assert!(yaml.contains("time-left: 4"));
    }

    #[test]
    fn tube_lists_are_yaml_sequences() {
        let yaml = to_yaml(&vec!["default".to_string(), "jobs".to_string()])
            .unwrap();
        assert_eq!(yaml, b"- default\n- jobs\n");
    }
}
