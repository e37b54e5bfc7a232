use serde::{Deserialize, Serialize};

use super::RecordId;

/// Algorithm run by a Clustering Server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusteringAlgorithm {
    pub id: RecordId,
    pub name: String,
}

/// Whether a signature was already clustered by an algorithm.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignatureStatus {
    pub id: RecordId,
    pub algorithm: RecordId,
    /// The [`HeuristicSignature`](super::HeuristicSignature).
    pub signature: RecordId,
    pub processed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DebuggingStatus {
    #[default]
    Scheduled,
    Running,
    Done,
    Failed,
}

/// Request to record what a heuristic version computes on one sequence of
/// a goal-planning task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebuggingEntry {
    pub id: RecordId,
    pub heuristic_version: RecordId,
    pub goal: String,
    pub environment: String,
    /// Number of the factory task, used to name the result file.
    pub task_number: i64,
    pub sequence: i64,
    /// Negative when unset.
    pub start_frame: i64,
    /// Negative when unset.
    pub end_frame: i64,
    pub status: DebuggingStatus,
    #[serde(default)]
    pub error_details: String,
}

impl Default for DebuggingEntry {
    fn default() -> Self {
        Self {
            id: 0,
            heuristic_version: 0,
            goal: String::new(),
            environment: String::new(),
            task_number: 0,
            sequence: 0,
            start_frame: -1,
            end_frame: -1,
            status: DebuggingStatus::Scheduled,
            error_details: String::new(),
        }
    }
}

impl DebuggingEntry {
    /// Path of the recorded data, relative to the debugging root.
    pub fn filename(&self) -> String {
        format!("{}/{}.data", self.heuristic_version, self.task_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_unset_by_default() {
        let entry = DebuggingEntry {
            heuristic_version: 12,
            task_number: 3,
            ..Default::default()
        };
        assert!(entry.start_frame < 0 && entry.end_frame < 0);
        assert_eq!(entry.filename(), "12/3.data");
    }
}
