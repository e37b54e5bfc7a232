use serde::{Deserialize, Serialize};

use super::RecordId;

/// Lifecycle state of a scheduler job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting for a free slot (or for a retry).
    #[default]
    Scheduled,
    /// A step is in flight against a remote server.
    Running,
    /// Finished successfully.
    Done,
    /// Finished with an error.
    Failed,
    /// Parked until its countdown reaches zero.
    Delayed,
    /// Cancelled before it could run.
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Scheduled,
        JobStatus::Running,
        JobStatus::Done,
        JobStatus::Failed,
        JobStatus::Delayed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Scheduled => "SCHEDULED",
            JobStatus::Running => "RUNNING",
            JobStatus::Done => "DONE",
            JobStatus::Failed => "FAILED",
            JobStatus::Delayed => "DELAYED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    /// Returns `true` once the job left the job list for good.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Done | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Durable record of one job, kept so in-flight work survives a restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: RecordId,
    /// Wire representation of the command the job executes.
    pub command: String,
    pub status: JobStatus,
    /// Server currently executing the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heuristic_version: Option<RecordId>,
    /// Log bundle collected for the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<RecordId>,
}

/// Problem report attached to a failed job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: RecordId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<RecordId>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl Alert {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Done.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());

        assert!(!JobStatus::Scheduled.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Delayed.is_terminal());
    }

    #[test]
    fn status_serializes_as_upper_case() {
        let json = serde_json::to_string(&JobStatus::Delayed).unwrap();
        assert_eq!(json, r#""DELAYED""#);
        assert_eq!(JobStatus::Delayed.as_str(), "DELAYED");
    }

    #[test]
    fn alert_builder_sets_details() {
        let alert = Alert::new("boom").with_details("Error: disk full");
        assert_eq!(alert.message, "boom");
        assert_eq!(alert.details.as_deref(), Some("Error: disk full"));
        assert!(alert.job.is_none());
    }
}
