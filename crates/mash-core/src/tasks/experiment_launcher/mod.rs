//! Runs experiments on the Experiment Servers.
//!
//! An experiment is a long chain of request/response round-trips against a
//! single Experiment Server. Every link of the chain is an [`Op`]: it
//! checks the response to the previous command, sends the next one and
//! names the link handling its response.

mod errors;
mod report;
mod results;
mod servers;
mod setup;

use std::collections::VecDeque;

use async_trait::async_trait;
use mash_model::{
    Configuration, Experiment, ExperimentStatus, GoalPlanningRound, HeuristicVersion, Instrument,
    RecordId, Server,
};
use mash_net::{Message, Param};
use tracing::debug;

use super::farm::{RETRY_DELAY, now, send, wait_response};
use crate::{CommandSpec, Job, JobExt, JobList, ParamType, Task, TaskContext, TaskError};

const COMMANDS: &[CommandSpec] = &[
    CommandSpec::new("RUN_EXPERIMENT", &[ParamType::Int]),
    CommandSpec::new("CANCEL_EXPERIMENT", &[ParamType::Int]),
];

/// Largest chunk of raw data read or written at once.
const CHUNK_SIZE: usize = 10 * 1024;

#[derive(Debug, Default)]
pub struct ExperimentLauncher;

/// Step of the experiment protocol waiting for the next response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    SendApplicationServerInfos,
    SendGlobalSeed,
    SendExperimentSetupSection,
    SendSection,
    SendInstrumentsList,
    SendNextInstrument,
    SendPredictorModel,
    SendPredictorInternalData,
    SendPredictor,
    SendPredictorSettings,
    SendHeuristicsRepositoryUrl,
    SendHeuristicsList,
    SendNextHeuristic,
    TrainPredictor,
    ProcessImageBasedTrainingResult,
    ProcessImageBasedTestResult,
    ProcessGoalPlanningTrainingResult,
    ProcessGoalPlanningTestResult,
    ProcessGoalPlanningRound,
    ProcessGoalPlanningSummary,
    ProcessDataReport,
}

/// A block of settings streamed between `BEGIN_<name>` and `END_<name>`.
#[derive(Debug, Clone)]
pub struct Section {
    pub name: &'static str,
    pub parameters: Vec<Param>,
    pub settings_to_send: VecDeque<(String, String)>,
    /// Link handling the response to `END_<name>`.
    pub next_operation: Op,
}

/// What a job of the launcher remembers between two steps.
#[derive(Debug, Default)]
pub struct LaunchState {
    pub application_server: Option<Server>,
    /// Seeds already run by an evaluation (or retries of another experiment).
    pub nb_evaluation_rounds_done: usize,
    pub nb_goalplanning_rounds_done: i64,
    pub seeds: Option<Vec<i64>>,
    pub current_section: Option<Section>,
    pub instruments_to_send: VecDeque<Instrument>,
    pub heuristics_to_send: VecDeque<HeuristicVersion>,
    /// Goal-planning round being received.
    pub current_round: Option<GoalPlanningRound>,
    pub summary: Option<RecordId>,
}

impl JobExt for LaunchState {
    type Operation = Op;
}

pub(crate) type LaunchJob = Job<LaunchState>;

/// Experiment of the job, with its configuration.
fn load(cx: &TaskContext, job: &LaunchJob) -> Result<(Experiment, Configuration), TaskError> {
    let id = job.record.experiment.unwrap_or_default();
    let experiment = cx.store().get::<Experiment>(id).ok_or(TaskError::Missing {
        kind: "experiment",
        id,
    })?;
    let configuration = cx
        .store()
        .get::<Configuration>(experiment.configuration)
        .ok_or(TaskError::Missing {
            kind: "configuration",
            id: experiment.configuration,
        })?;
    Ok((experiment, configuration))
}

impl ExperimentLauncher {
    /// Consume a response that must be `OK`. On anything else the error
    /// path runs with `failure` as message and `false` is returned.
    async fn expect_ok(
        &self,
        cx: &TaskContext,
        job: &mut LaunchJob,
        failure: &str,
    ) -> Result<bool, TaskError> {
        match wait_response(job).await {
            Some(response) if response.is("OK") => Ok(true),
            response => {
                self.process_error(cx, job, failure, response.as_ref(), true)
                    .await?;
                Ok(false)
            }
        }
    }

    /// Like [`send`], running the error path with `failure` when it fails.
    async fn send_or_fail(
        &self,
        cx: &TaskContext,
        job: &mut LaunchJob,
        command: &Message,
        failure: &str,
    ) -> Result<bool, TaskError> {
        if send(job, command).await {
            return Ok(true);
        }
        self.process_error(cx, job, failure, None, true).await?;
        Ok(false)
    }

    async fn process(&self, cx: &TaskContext, job: &mut LaunchJob) -> Result<(), TaskError> {
        let id = job.command.int(0).unwrap_or_default();
        let Some(experiment) = cx.store().get::<Experiment>(id) else {
            return self
                .process_error(cx, job, &format!("Unknown experiment ID: {id}"), None, true)
                .await;
        };

        job.mark_as_running(None, None, Some(experiment.id)).await?;
        let (experiment, configuration) = load(cx, job)?;
        self.run_experiment(cx, job, experiment, configuration)
            .await
    }

    async fn dispatch(&self, cx: &TaskContext, job: &mut LaunchJob, op: Op) -> Result<(), TaskError> {
        match op {
            Op::SendApplicationServerInfos => self.send_application_server_infos(cx, job).await,
            Op::SendGlobalSeed => self.send_global_seed(cx, job).await,
            Op::SendExperimentSetupSection => self.send_experiment_setup_section(cx, job).await,
            Op::SendSection => self.send_section(cx, job).await,
            Op::SendInstrumentsList => self.send_instruments_list(cx, job).await,
            Op::SendNextInstrument => self.send_next_instrument(cx, job, false).await,
            Op::SendPredictorModel => self.send_predictor_model(cx, job, true).await,
            Op::SendPredictorInternalData => self.send_predictor_internal_data(cx, job).await,
            Op::SendPredictor => self.send_predictor(cx, job, true).await,
            Op::SendPredictorSettings => self.send_predictor_settings(cx, job).await,
            Op::SendHeuristicsRepositoryUrl => self.send_heuristics_repository_url(cx, job).await,
            Op::SendHeuristicsList => self.send_heuristics_list(cx, job).await,
            Op::SendNextHeuristic => self.send_next_heuristic(cx, job, false).await,
            Op::TrainPredictor => self.train_predictor(cx, job).await,
            Op::ProcessImageBasedTrainingResult => {
                self.process_image_based_training_result(cx, job).await
            }
            Op::ProcessImageBasedTestResult => self.process_image_based_test_result(cx, job).await,
            Op::ProcessGoalPlanningTrainingResult => {
                self.process_goal_planning_training_result(cx, job).await
            }
            Op::ProcessGoalPlanningTestResult => {
                self.process_goal_planning_test_result(cx, job).await
            }
            Op::ProcessGoalPlanningRound => self.process_goal_planning_round(cx, job).await,
            Op::ProcessGoalPlanningSummary => self.process_goal_planning_summary(cx, job).await,
            Op::ProcessDataReport => self.process_data_report(cx, job).await,
        }
    }
}

#[async_trait]
impl Task for ExperimentLauncher {
    type Ext = LaunchState;

    const NAME: &'static str = "ExperimentLauncher";

    fn commands(&self) -> &'static [CommandSpec] {
        COMMANDS
    }

    async fn on_startup(
        &mut self,
        cx: &TaskContext,
        jobs: &mut JobList<LaunchState>,
    ) -> Result<(), TaskError> {
        for experiment in cx
            .store()
            .filter::<Experiment>(|e| e.status == ExperimentStatus::Scheduled)
        {
            let command = Message::new("RUN_EXPERIMENT").arg(experiment.id);
            if !jobs.has_job(&command) {
                jobs.add_job(&command)?;
            }
        }
        Ok(())
    }

    async fn on_command_received(
        &mut self,
        cx: &TaskContext,
        jobs: &mut JobList<LaunchState>,
        command: &Message,
    ) -> Result<bool, TaskError> {
        let experiment = command.int(0).unwrap_or_default();
        let run = Message::new("RUN_EXPERIMENT").arg(experiment);

        if command.is("RUN_EXPERIMENT") {
            if jobs.has_job(&run) {
                cx.log().write(&format!(
                    "Experiment already in the queue of jobs: {experiment}\n"
                ));
                return Ok(true);
            }
            return Ok(false);
        }

        let Some(&id) = jobs.get_jobs(None, Some(&run)).first() else {
            cx.log().write(&format!(
                "ERROR - Experiment ID not found in the queue of jobs: {experiment}\n"
            ));
            return Ok(true);
        };
        if let Some(job) = jobs.get_mut(id) {
            job.mark_as_cancelled().await?;
        }
        jobs.remove(id);
        debug!(experiment, job = id, "experiment cancelled");

        cx.send_event(&Message::new("EVT_EXPERIMENT_CANCELLED").arg(experiment));
        Ok(true)
    }

    async fn step(&mut self, cx: &TaskContext, job: &mut LaunchJob) -> Result<(), TaskError> {
        match job.operation {
            None => self.process(cx, job).await,
            Some(op) => self.dispatch(cx, job, op).await,
        }
    }
}

/// Value of the setting for the current round of an evaluation, which
/// lists one value per round (the last one is reused past the end).
fn round_value<T: Clone>(values: &[T], evaluation: bool, round: usize) -> Option<T> {
    if evaluation {
        values.get(round).or_else(|| values.last()).cloned()
    } else {
        values.first().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_value_reuses_the_last_entry() {
        let values = [1, 2, 3];
        assert_eq!(round_value(&values, true, 1), Some(2));
        assert_eq!(round_value(&values, true, 7), Some(3));
        assert_eq!(round_value(&values, false, 2), Some(1));
        assert_eq!(round_value::<i64>(&[], true, 0), None);
    }
}
