use serde::{Deserialize, Serialize};

use super::RecordId;

/// A tar.gz archive of everything the instruments recorded during an experiment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataReport {
    pub id: RecordId,
    pub experiment: RecordId,
    /// Path relative to the data-reports root.
    pub filename: String,
    #[serde(default)]
    pub instruments: Vec<RecordId>,
}

/// A folder of log files collected for one job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: RecordId,
    /// Path relative to the log-files root.
    pub folder: String,
    #[serde(default)]
    pub files: Vec<String>,
}
