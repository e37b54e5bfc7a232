mod job;
pub use job::{Alert, JobRecord, JobStatus};

mod experiment;
pub use experiment::{
    ClassificationResults, EvaluationStep, Experiment, ExperimentStatus, GoalPlanningResult,
    GoalPlanningRound, Notification, RoundResult,
};

mod configuration;
pub use configuration::{Configuration, ConfigurationType, HeuristicsList, Setting, TaskType};

mod server;
pub use server::{ProvidedGoal, Server, ServerStatus, ServerSubtype, ServerType};

mod plugin;
pub use plugin::{
    HeuristicStatus, HeuristicVersion, Instrument, InstrumentStatus, PluginErrorReport,
    PluginErrorType, slugify,
};

mod evaluation;
pub use evaluation::{
    ContestEntry, HeuristicEvaluationResults, HeuristicSignature, HeuristicTestStatus, TestPhase,
};

mod clustering;
pub use clustering::{ClusteringAlgorithm, DebuggingEntry, DebuggingStatus, SignatureStatus};

mod report;
pub use report::{DataReport, LogEntry};

/// Primary key of every durable record.
///
/// `0` means "not stored yet"; the store assigns a positive id on insert.
pub type RecordId = i64;
