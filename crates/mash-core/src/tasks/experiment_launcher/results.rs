use mash_model::{
    ClassificationResults, ConfigurationType, EvaluationStep, GoalPlanningResult,
    GoalPlanningRound, RecordId, RoundResult,
};
use mash_net::Message;

use super::{ExperimentLauncher, LaunchJob, Op, load, wait_response};
use crate::{TaskContext, TaskError};

/// Which error of a predictor a response carries.
#[derive(Clone, Copy)]
enum Phase {
    Train,
    Test,
}

/// `NAME value...` becomes the notification `NAME` of the experiment.
fn update_notification(
    cx: &TaskContext,
    job: &LaunchJob,
    name: &str,
    value: &str,
) -> Result<(), TaskError> {
    if let Some(experiment) = job.record.experiment {
        cx.store().upsert_notification(experiment, name, value)?;
    }
    Ok(())
}

fn notification_of(message: &Message) -> Option<(String, String)> {
    let name = message.text(0)?;
    let value = message.params[1..]
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ");
    Some((name, value))
}

/// `NOTIFICATION` messages only update the experiment status rows.
fn handle_notification(
    cx: &TaskContext,
    job: &LaunchJob,
    response: &Message,
) -> Result<bool, TaskError> {
    if !response.is("NOTIFICATION") {
        return Ok(false);
    }
    if let Some((name, value)) = notification_of(response) {
        update_notification(cx, job, &name, &value)?;
    }
    Ok(true)
}

fn setting_or(cx: &TaskContext, configuration: RecordId, name: &str, default: i64) -> i64 {
    cx.store()
        .try_get_setting(configuration, name)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl ExperimentLauncher {
    /// Store the train or test error of the current run.
    fn save_error(
        &self,
        cx: &TaskContext,
        job: &LaunchJob,
        phase: Phase,
        value: f64,
    ) -> Result<(), TaskError> {
        let (experiment, configuration) = load(cx, job)?;
        let store = cx.store();

        if configuration.experiment_type != ConfigurationType::Evaluation {
            let mut results = match store
                .find::<ClassificationResults>(|r| r.experiment == experiment.id)
            {
                Some(results) => results,
                None => store.insert(ClassificationResults {
                    experiment: experiment.id,
                    ..Default::default()
                })?,
            };
            match phase {
                Phase::Train => results.train_error = Some(value),
                Phase::Test => results.test_error = Some(value),
            }
            store.save(&results)?;
            return Ok(());
        }

        let seed = job
            .ext
            .seeds
            .as_deref()
            .and_then(|seeds| seeds.get(job.ext.nb_evaluation_rounds_done))
            .copied()
            .unwrap_or_default();
        let mut step = match store
            .find::<EvaluationStep>(|s| s.experiment == experiment.id && s.seed == seed)
        {
            Some(step) => step,
            None => store.insert(EvaluationStep {
                experiment: experiment.id,
                seed,
                ..Default::default()
            })?,
        };
        match phase {
            Phase::Train => step.train_error = Some(value),
            Phase::Test => step.test_error = Some(value),
        }
        store.save(&step)?;
        Ok(())
    }

    pub(super) async fn process_image_based_training_result(
        &self,
        cx: &TaskContext,
        job: &mut LaunchJob,
    ) -> Result<(), TaskError> {
        let response = wait_response(job).await;
        let train_error = match &response {
            Some(r) if handle_notification(cx, job, r)? => return Ok(()),
            Some(r) if r.is("TRAIN_ERROR") => r.float(0),
            _ => None,
        };
        let Some(train_error) = train_error else {
            return self
                .process_error(cx, job, "Failed to train the predictor", response.as_ref(), true)
                .await;
        };
        self.save_error(cx, job, Phase::Train, train_error)?;

        if self
            .send_or_fail(
                cx,
                job,
                &Message::new("TEST_PREDICTOR"),
                "Failed to tell the predictor to test itself",
            )
            .await?
        {
            job.operation = Some(Op::ProcessImageBasedTestResult);
        }
        Ok(())
    }

    pub(super) async fn process_image_based_test_result(
        &self,
        cx: &TaskContext,
        job: &mut LaunchJob,
    ) -> Result<(), TaskError> {
        let response = wait_response(job).await;
        let test_error = match &response {
            Some(r) if handle_notification(cx, job, r)? => return Ok(()),
            Some(r) if r.is("TEST_ERROR") => r.float(0),
            _ => None,
        };
        let Some(test_error) = test_error else {
            return self
                .process_error(cx, job, "Failed to test the predictor", response.as_ref(), true)
                .await;
        };
        self.save_error(cx, job, Phase::Test, test_error)?;

        // An evaluation only reports its data after the last seed.
        let (_, configuration) = load(cx, job)?;
        let nb_seeds = job.ext.seeds.as_ref().map_or(1, Vec::len);
        if configuration.experiment_type != ConfigurationType::Evaluation
            || job.ext.nb_evaluation_rounds_done + 1 >= nb_seeds
        {
            if self
                .send_or_fail(
                    cx,
                    job,
                    &Message::new("REPORT_DATA"),
                    "Failed to ask for the data report",
                )
                .await?
            {
                job.operation = Some(Op::ProcessDataReport);
            }
            return Ok(());
        }
        self.finalize_experiment(cx, job).await
    }

    pub(super) async fn process_goal_planning_training_result(
        &self,
        cx: &TaskContext,
        job: &mut LaunchJob,
    ) -> Result<(), TaskError> {
        let response = wait_response(job).await;
        match &response {
            Some(r) if handle_notification(cx, job, r)? => return Ok(()),
            Some(r) if r.is("TRAIN_RESULT") => {}
            _ => {
                return self
                    .process_error(cx, job, "Failed to train the predictor", response.as_ref(), true)
                    .await;
            }
        }

        let (_, configuration) = load(cx, job)?;
        let nb_test_rounds = setting_or(cx, configuration.id, "TEST_PREDICTOR/NB_TEST_ROUNDS", 1);
        let nb_max_actions = setting_or(cx, configuration.id, "TEST_PREDICTOR/NB_MAX_ACTIONS", 1000);

        job.ext.nb_goalplanning_rounds_done = 0;
        update_notification(cx, job, "CURRENT_ROUND", &format!("0 {nb_test_rounds}"))?;

        let command = Message::new("TEST_PREDICTOR")
            .arg(nb_test_rounds)
            .arg(nb_max_actions);
        if self
            .send_or_fail(cx, job, &command, "Failed to tell the predictor to test itself")
            .await?
        {
            job.operation = Some(Op::ProcessGoalPlanningTestResult);
        }
        Ok(())
    }

    /// Wait for the next `TEST_ROUND` or for the `TEST_SUMMARY`.
    pub(super) async fn process_goal_planning_test_result(
        &self,
        cx: &TaskContext,
        job: &mut LaunchJob,
    ) -> Result<(), TaskError> {
        let response = wait_response(job).await;
        if let Some(r) = &response
            && handle_notification(cx, job, r)?
        {
            return Ok(());
        }

        let (experiment, _) = load(cx, job)?;
        let store = cx.store();
        let summary = match store.find::<GoalPlanningResult>(|r| r.experiment == experiment.id) {
            Some(summary) => summary,
            None => store.insert(GoalPlanningResult {
                experiment: experiment.id,
                ..Default::default()
            })?,
        };
        job.ext.summary = Some(summary.id);

        match &response {
            Some(r) if r.is("TEST_ROUND") => {
                job.ext.current_round = Some(GoalPlanningRound {
                    summary: summary.id,
                    round: r.int(0).unwrap_or_default(),
                    ..Default::default()
                });
                job.operation = Some(Op::ProcessGoalPlanningRound);
                Ok(())
            }
            Some(r) if r.is("TEST_SUMMARY") => {
                job.operation = Some(Op::ProcessGoalPlanningSummary);
                Ok(())
            }
            _ => {
                self.process_error(cx, job, "Failed to test the predictor", response.as_ref(), true)
                    .await
            }
        }
    }

    /// One value of the round being received, up to `TEST_ROUND_END`.
    pub(super) async fn process_goal_planning_round(
        &self,
        cx: &TaskContext,
        job: &mut LaunchJob,
    ) -> Result<(), TaskError> {
        let response = wait_response(job).await;
        let Some(round) = job.ext.current_round.as_mut() else {
            return Err(TaskError::Internal("no goal-planning round in progress".into()));
        };

        match response.as_ref().map(|r| (r.name.as_str(), r)) {
            Some(("RESULT", r)) => {
                round.result = RoundResult::parse(&r.text(0).unwrap_or_default());
            }
            Some(("SCORE", r)) => round.score = r.float(0).unwrap_or_default(),
            Some(("NB_ACTIONS_DONE", r)) => round.nb_actions_done = r.int(0).unwrap_or_default(),
            Some(("NB_MIMICKING_ERRORS", r)) => {
                round.nb_mimicking_errors = r.int(0).unwrap_or_default();
            }
            Some(("NB_NOT_RECOMMENDED_ACTIONS", r)) => {
                round.nb_not_recommended_actions = r.int(0).unwrap_or_default();
            }
            Some(("TEST_ROUND_END", _)) => {
                if let Some(round) = job.ext.current_round.take() {
                    cx.store().insert(round)?;
                }
                job.ext.nb_goalplanning_rounds_done += 1;

                let (_, configuration) = load(cx, job)?;
                let nb_test_rounds =
                    setting_or(cx, configuration.id, "TEST_PREDICTOR/NB_TEST_ROUNDS", 1);
                let progress = format!("{} {nb_test_rounds}", job.ext.nb_goalplanning_rounds_done);
                update_notification(cx, job, "CURRENT_ROUND", &progress)?;

                job.operation = Some(Op::ProcessGoalPlanningTestResult);
            }
            _ => {
                job.ext.current_round = None;
                return self
                    .process_error(cx, job, "Failed to test the predictor", response.as_ref(), true)
                    .await;
            }
        }
        Ok(())
    }

    /// One value of the summary, up to `TEST_SUMMARY_END`, after which the
    /// data report is requested.
    pub(super) async fn process_goal_planning_summary(
        &self,
        cx: &TaskContext,
        job: &mut LaunchJob,
    ) -> Result<(), TaskError> {
        let response = wait_response(job).await;
        let id = job.ext.summary.unwrap_or_default();
        let store = cx.store();
        let mut summary = store.get::<GoalPlanningResult>(id).ok_or(TaskError::Missing {
            kind: "goal-planning result",
            id,
        })?;

        let value = response.as_ref().and_then(|r| r.int(0)).unwrap_or_default();
        match response.as_ref().map(|r| r.name.as_str()) {
            Some("NB_GOALS_REACHED") => summary.nb_goals_reached = value,
            Some("NB_TASKS_FAILED") => summary.nb_tasks_failed = value,
            Some("NB_ACTIONS_DONE") => summary.nb_actions_done = value,
            Some("NB_MIMICKING_ERRORS") => summary.nb_mimicking_errors = value,
            Some("NB_NOT_RECOMMENDED_ACTIONS") => summary.nb_not_recommended_actions = value,
            Some("TEST_SUMMARY_END") => {
                if self
                    .send_or_fail(
                        cx,
                        job,
                        &Message::new("REPORT_DATA"),
                        "Failed to ask for the data report",
                    )
                    .await?
                {
                    job.operation = Some(Op::ProcessDataReport);
                }
                return Ok(());
            }
            _ => {
                return self
                    .process_error(cx, job, "Failed to test the predictor", response.as_ref(), true)
                    .await;
            }
        }
        store.save(&summary)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_value_joins_the_remaining_parameters() {
        let message = Message::decode("NOTIFICATION TRAINING_STEP 12 100");
        assert_eq!(
            notification_of(&message),
            Some(("TRAINING_STEP".to_string(), "12 100".to_string()))
        );
        assert!(notification_of(&Message::new("NOTIFICATION")).is_none());
    }
}
