use serde::{Deserialize, Serialize};

use super::RecordId;

/// Results of one evaluation experiment of a heuristic version.
///
/// The per-seed errors are the [`EvaluationStep`](super::EvaluationStep)s of
/// `experiment`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeuristicEvaluationResults {
    pub id: RecordId,
    pub heuristic_version: RecordId,
    /// The `template/...` configuration the experiment was built from.
    pub evaluation_config: RecordId,
    pub experiment: RecordId,
    /// Rank among the results of the same evaluation configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<i64>,
}

/// Experiment recording what a heuristic version computes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeuristicSignature {
    pub id: RecordId,
    pub heuristic_version: RecordId,
    pub experiment: RecordId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestPhase {
    #[default]
    Status,
    Compilation,
    Analyze,
    Test,
}

/// Progress of the check of a heuristic version, shown while it runs or
/// after it failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeuristicTestStatus {
    pub id: RecordId,
    pub heuristic_version: RecordId,
    pub phase: TestPhase,
    pub error: bool,
    #[serde(default)]
    pub details: String,
}

/// A heuristic version taking part in a contest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContestEntry {
    pub id: RecordId,
    pub contest: RecordId,
    pub heuristic_version: RecordId,
    pub experiment: RecordId,
    /// Whether the author belongs to the project consortium. Members and
    /// non-members are ranked separately.
    #[serde(default)]
    pub project_member: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<i64>,
}
