use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::RecordId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExperimentStatus {
    #[default]
    Scheduled,
    Running,
    Done,
    DoneWithErrors,
    Failed,
    Deleted,
}

/// One run of a configuration on the computation farm.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: RecordId,
    pub name: String,
    pub configuration: RecordId,
    pub status: ExperimentStatus,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub start: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub end: Option<OffsetDateTime>,
    /// Heuristic version evaluated (or signed) by this experiment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heuristic_version: Option<RecordId>,
    /// Contest this experiment is an entry of.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contest: Option<RecordId>,
}

/// Live progress row reported by an Experiment Server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: RecordId,
    pub experiment: RecordId,
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResults {
    pub id: RecordId,
    pub experiment: RecordId,
    pub train_error: Option<f64>,
    pub test_error: Option<f64>,
}

/// Results of one seed of an evaluation experiment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationStep {
    pub id: RecordId,
    pub experiment: RecordId,
    pub seed: i64,
    pub train_error: Option<f64>,
    pub test_error: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GoalPlanningResult {
    pub id: RecordId,
    pub experiment: RecordId,
    pub nb_goals_reached: i64,
    pub nb_tasks_failed: i64,
    pub nb_actions_done: i64,
    pub nb_mimicking_errors: i64,
    pub nb_not_recommended_actions: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoundResult {
    GoalReached,
    TaskFailed,
    #[default]
    None,
}

impl RoundResult {
    pub fn parse(text: &str) -> Self {
        match text {
            "GOAL_REACHED" => RoundResult::GoalReached,
            "TASK_FAILED" => RoundResult::TaskFailed,
            _ => RoundResult::None,
        }
    }
}

/// One test round of a goal-planning experiment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GoalPlanningRound {
    pub id: RecordId,
    /// The owning [`GoalPlanningResult`].
    pub summary: RecordId,
    pub round: i64,
    pub result: RoundResult,
    pub score: f64,
    pub nb_actions_done: i64,
    pub nb_mimicking_errors: i64,
    pub nb_not_recommended_actions: i64,
}
