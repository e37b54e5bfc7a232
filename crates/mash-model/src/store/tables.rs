use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::*;

/// A record type the [`Store`](super::Store) knows how to keep.
pub trait Entity: Clone + Send + Sync + 'static {
    /// Table name, used in errors and logs.
    const KIND: &'static str;

    fn id(&self) -> RecordId;
    fn set_id(&mut self, id: RecordId);

    #[doc(hidden)]
    fn table(tables: &Tables) -> &BTreeMap<RecordId, Self>;
    #[doc(hidden)]
    fn table_mut(tables: &mut Tables) -> &mut BTreeMap<RecordId, Self>;
}

macro_rules! tables {
    ($($ty:ty => $field:ident),* $(,)?) => {
        /// Every table of the store, serialized as a whole into snapshots.
        #[derive(Debug, Default, Serialize, Deserialize)]
        pub struct Tables {
            next_id: RecordId,
            $(
                #[serde(default)]
                $field: BTreeMap<RecordId, $ty>,
            )*
        }

        $(
            impl Entity for $ty {
                const KIND: &'static str = stringify!($field);

                #[inline]
                fn id(&self) -> RecordId {
                    self.id
                }
                #[inline]
                fn set_id(&mut self, id: RecordId) {
                    self.id = id;
                }
                #[inline]
                fn table(tables: &Tables) -> &BTreeMap<RecordId, Self> {
                    &tables.$field
                }
                #[inline]
                fn table_mut(tables: &mut Tables) -> &mut BTreeMap<RecordId, Self> {
                    &mut tables.$field
                }
            }
        )*
    };
}

tables! {
    JobRecord => jobs,
    Alert => alerts,
    Experiment => experiments,
    Configuration => configurations,
    Setting => settings,
    Server => servers,
    HeuristicVersion => heuristic_versions,
    Instrument => instruments,
    Notification => notifications,
    ClassificationResults => classification_results,
    EvaluationStep => evaluation_steps,
    GoalPlanningResult => goal_planning_results,
    GoalPlanningRound => goal_planning_rounds,
    DataReport => data_reports,
    PluginErrorReport => plugin_error_reports,
    LogEntry => log_entries,
    HeuristicEvaluationResults => evaluation_results,
    HeuristicSignature => heuristic_signatures,
    HeuristicTestStatus => heuristic_test_statuses,
    ContestEntry => contest_entries,
    ClusteringAlgorithm => clustering_algorithms,
    SignatureStatus => signature_statuses,
    DebuggingEntry => debugging_entries,
}

impl Tables {
    /// Picks the id of a new record, honouring a caller-provided one.
    pub(super) fn allocate(&mut self, requested: RecordId) -> RecordId {
        if requested > 0 {
            self.next_id = self.next_id.max(requested);
            requested
        } else {
            self.next_id += 1;
            self.next_id
        }
    }
}
