use serde::{Deserialize, Serialize};

use super::RecordId;

/// Kind of experiment a configuration describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfigurationType {
    #[default]
    Public,
    Private,
    Consortium,
    Evaluation,
    ContestBase,
    ContestEntry,
    Signature,
    Factory,
}

/// Machine-learning task family of a configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    #[default]
    Classification,
    ObjectDetection,
    GoalPlanning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HeuristicsList {
    #[default]
    All,
    Custom,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub id: RecordId,
    pub name: String,
    pub experiment_type: ConfigurationType,
    pub task: TaskType,
    pub heuristics_list: HeuristicsList,
    /// Heuristic versions used by the configuration.
    #[serde(default)]
    pub heuristics: Vec<RecordId>,
    /// Instruments attached to the configuration.
    #[serde(default)]
    pub instruments: Vec<RecordId>,
}

/// One `name = value` entry of a configuration.
///
/// Names are slash-separated paths (`EXPERIMENT_SETUP/LABELS`,
/// `INSTRUMENT_SETUP/<author>/<name>/<key>`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Setting {
    pub id: RecordId,
    pub configuration: RecordId,
    pub name: String,
    pub value: String,
}
