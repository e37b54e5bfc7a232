use std::collections::VecDeque;

use mash_model::{
    ConfigurationType, HeuristicStatus, HeuristicVersion, Instrument, InstrumentStatus, TaskType,
};
use mash_net::{Message, Param};

use super::{CHUNK_SIZE, ExperimentLauncher, LaunchJob, Op, Section, load, round_value, wait_response};
use crate::{TaskContext, TaskError};

/// Outcome of streaming a predictor file.
enum FileTransfer {
    Sent,
    /// No file configured, or an empty one.
    Skipped,
    /// The error path already ran.
    Failed,
}

/// Labels sent for the current round: `LABELS` holds one line per round.
fn select_labels(value: &str, evaluation: bool, round: usize) -> Vec<Param> {
    let rows: Vec<&str> = value
        .split('\n')
        .map(|row| row.trim_end_matches('\r'))
        .filter(|row| !row.is_empty())
        .collect();
    round_value(&rows, evaluation, round)
        .map(|row| {
            row.split(' ')
                .filter(|label| !label.is_empty())
                .map(Param::guess)
                .collect()
        })
        .unwrap_or_default()
}

impl ExperimentLauncher {
    pub(super) async fn send_global_seed(
        &self,
        cx: &TaskContext,
        job: &mut LaunchJob,
    ) -> Result<(), TaskError> {
        match wait_response(job).await {
            Some(response) if response.is("OK") => {}
            response if job.ext.nb_evaluation_rounds_done > 0 => {
                return self
                    .process_error(
                        cx,
                        job,
                        "Failed to reset the Experiment Server",
                        response.as_ref(),
                        false,
                    )
                    .await;
            }
            response => {
                return self
                    .process_error(
                        cx,
                        job,
                        "Failed to select the Application Server",
                        response.as_ref(),
                        true,
                    )
                    .await;
            }
        }

        let (_, configuration) = load(cx, job)?;
        if job.ext.seeds.is_none() {
            let configured = cx
                .store()
                .try_get_setting(configuration.id, "USE_GLOBAL_SEED")
                .and_then(|value| {
                    value
                        .split(' ')
                        .map(|seed| seed.parse::<i64>().ok())
                        .collect::<Option<Vec<_>>>()
                })
                .filter(|seeds| !seeds.is_empty());
            let seeds = match configured {
                Some(seeds) => seeds,
                None => {
                    let seed = time::OffsetDateTime::now_utc().unix_timestamp();
                    cx.store()
                        .add_setting(configuration.id, "USE_GLOBAL_SEED", &seed.to_string())?;
                    vec![seed]
                }
            };
            job.ext.seeds = Some(seeds);
        }

        let evaluation = configuration.experiment_type == ConfigurationType::Evaluation;
        let seed = job
            .ext
            .seeds
            .as_deref()
            .and_then(|seeds| round_value(seeds, evaluation, job.ext.nb_evaluation_rounds_done))
            .unwrap_or_default();

        if self
            .send_or_fail(
                cx,
                job,
                &Message::new("USE_GLOBAL_SEED").arg(seed),
                "Failed to set the global seed",
            )
            .await?
        {
            job.operation = Some(Op::SendExperimentSetupSection);
        }
        Ok(())
    }

    pub(super) async fn send_experiment_setup_section(
        &self,
        cx: &TaskContext,
        job: &mut LaunchJob,
    ) -> Result<(), TaskError> {
        if !self
            .expect_ok(cx, job, "Failed to set the global seed")
            .await?
        {
            return Ok(());
        }
        let section = self.section(cx, job, "EXPERIMENT_SETUP", "EXPERIMENT_SETUP/", Vec::new(), Op::SendInstrumentsList)?;
        self.start_section(cx, job, section).await
    }

    /// A section streaming the settings named `<prefix><key>`.
    fn section(
        &self,
        cx: &TaskContext,
        job: &LaunchJob,
        name: &'static str,
        prefix: &str,
        parameters: Vec<Param>,
        next_operation: Op,
    ) -> Result<Section, TaskError> {
        let (_, configuration) = load(cx, job)?;
        let settings_to_send = cx
            .store()
            .settings_with_prefix(configuration.id, prefix)
            .into_iter()
            .map(|s| (s.name[prefix.len()..].to_string(), s.value))
            .collect();
        Ok(Section {
            name,
            parameters,
            settings_to_send,
            next_operation,
        })
    }

    async fn start_section(
        &self,
        cx: &TaskContext,
        job: &mut LaunchJob,
        section: Section,
    ) -> Result<(), TaskError> {
        let begin = Message::with_params(format!("BEGIN_{}", section.name), section.parameters.clone());
        let failure = format!("Failed to start the '{}' section", section.name);
        job.ext.current_section = Some(section);
        if self.send_or_fail(cx, job, &begin, &failure).await? {
            job.operation = Some(Op::SendSection);
        }
        Ok(())
    }

    /// Send the next setting of the current section, or close it.
    pub(super) async fn send_section(
        &self,
        cx: &TaskContext,
        job: &mut LaunchJob,
    ) -> Result<(), TaskError> {
        if !self.expect_ok(cx, job, "Failed to send a setting").await? {
            return Ok(());
        }
        let Some(section) = job.ext.current_section.as_mut() else {
            return Err(TaskError::Internal("no section being sent".into()));
        };
        let name = section.name;

        let Some((key, value)) = section.settings_to_send.pop_front() else {
            let next = section.next_operation;
            job.ext.current_section = None;
            if self
                .send_or_fail(
                    cx,
                    job,
                    &Message::new(format!("END_{name}")),
                    &format!("Failed to end the '{name}' section"),
                )
                .await?
            {
                job.operation = Some(next);
            }
            return Ok(());
        };

        let setting = if name == "EXPERIMENT_SETUP" && key == "LABELS" {
            let (_, configuration) = load(cx, job)?;
            let evaluation = configuration.experiment_type == ConfigurationType::Evaluation;
            Message::with_params(
                key.clone(),
                select_labels(&value, evaluation, job.ext.nb_evaluation_rounds_done),
            )
        } else {
            Message::new(key.clone()).arg(Param::guess(&value))
        };

        if self
            .send_or_fail(cx, job, &setting, &format!("Failed to send the setting '{key}'"))
            .await?
        {
            job.operation = Some(Op::SendSection);
        }
        Ok(())
    }

    pub(super) async fn send_instruments_list(
        &self,
        cx: &TaskContext,
        job: &mut LaunchJob,
    ) -> Result<(), TaskError> {
        if !self
            .expect_ok(cx, job, "Failed to send the 'EXPERIMENT_SETUP' section")
            .await?
        {
            return Ok(());
        }

        let (_, configuration) = load(cx, job)?;
        job.ext.instruments_to_send = configuration
            .instruments
            .iter()
            .filter_map(|id| cx.store().get::<Instrument>(*id))
            .filter(|i| !matches!(i.status, InstrumentStatus::Disabled | InstrumentStatus::Builtin))
            .collect();
        job.ext.current_section = None;

        if job.ext.instruments_to_send.is_empty() {
            self.send_predictor_model(cx, job, false).await
        } else {
            self.send_next_instrument(cx, job, true).await
        }
    }

    /// Select the next instrument, then stream its settings.
    pub(super) async fn send_next_instrument(
        &self,
        cx: &TaskContext,
        job: &mut LaunchJob,
        first: bool,
    ) -> Result<(), TaskError> {
        if !first
            && !self
                .expect_ok(cx, job, "Failed to send the 'EXPERIMENT_SETUP' section")
                .await?
        {
            return Ok(());
        }

        // The instrument was just selected: its settings follow.
        if let Some(section) = job.ext.current_section.take() {
            return self.start_section(cx, job, section).await;
        }

        let Some(instrument) = job.ext.instruments_to_send.pop_front() else {
            return self.send_predictor_model(cx, job, false).await;
        };
        let fullname = instrument.fullname();
        let next = if job.ext.instruments_to_send.is_empty() {
            Op::SendPredictorModel
        } else {
            Op::SendNextInstrument
        };
        let section = self.section(
            cx,
            job,
            "INSTRUMENT_SETUP",
            &format!("INSTRUMENT_SETUP/{fullname}/"),
            vec![Param::Str(fullname.clone())],
            next,
        )?;
        job.ext.current_section = Some(section);

        if self
            .send_or_fail(
                cx,
                job,
                &Message::new("USE_INSTRUMENT").arg(fullname.as_str()),
                &format!("Failed to select the instrument '{fullname}'"),
            )
            .await?
        {
            job.operation = Some(Op::SendNextInstrument);
        }
        Ok(())
    }

    pub(super) async fn send_predictor_model(
        &self,
        cx: &TaskContext,
        job: &mut LaunchJob,
        wait: bool,
    ) -> Result<(), TaskError> {
        if wait
            && !self
                .expect_ok(cx, job, "Failed to send the list of instruments")
                .await?
        {
            return Ok(());
        }

        match self
            .send_predictor_file(cx, job, "USE_PREDICTOR_MODEL", "model")
            .await?
        {
            FileTransfer::Sent => job.operation = Some(Op::SendPredictorInternalData),
            FileTransfer::Skipped => return self.send_predictor(cx, job, false).await,
            FileTransfer::Failed => {}
        }
        Ok(())
    }

    pub(super) async fn send_predictor_internal_data(
        &self,
        cx: &TaskContext,
        job: &mut LaunchJob,
    ) -> Result<(), TaskError> {
        if !self
            .expect_ok(cx, job, "Failed to send the predictor model")
            .await?
        {
            return Ok(());
        }

        match self
            .send_predictor_file(cx, job, "USE_PREDICTOR_INTERNAL_DATA", "internal data")
            .await?
        {
            FileTransfer::Sent => job.operation = Some(Op::SendPredictor),
            FileTransfer::Skipped => return self.send_predictor(cx, job, false).await,
            FileTransfer::Failed => {}
        }
        Ok(())
    }

    /// Stream the file named by the setting `command` (relative to the
    /// models root) as a raw payload announced by `command <size>`.
    async fn send_predictor_file(
        &self,
        cx: &TaskContext,
        job: &mut LaunchJob,
        command: &str,
        what: &str,
    ) -> Result<FileTransfer, TaskError> {
        let (_, configuration) = load(cx, job)?;
        let Some(value) = cx.store().try_get_setting(configuration.id, command) else {
            return Ok(FileTransfer::Skipped);
        };
        let filenames: Vec<&str> = value.split(' ').filter(|f| !f.is_empty()).collect();
        let evaluation = configuration.experiment_type == ConfigurationType::Evaluation;
        let Some(filename) = round_value(&filenames, evaluation, job.ext.nb_evaluation_rounds_done)
        else {
            return Ok(FileTransfer::Skipped);
        };

        let path = cx.config().models_root.join(filename);
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) => {
                let failure = if what == "model" {
                    format!("Failed to read the predictor model file '{}'", path.display())
                } else {
                    format!("Failed to read the predictor internal data file '{}'", path.display())
                };
                job.log.write(&format!("ERROR - {e}\n"));
                self.process_error(cx, job, &failure, None, true).await?;
                return Ok(FileTransfer::Failed);
            }
        };
        if content.is_empty() {
            job.log
                .write(&format!("The predictor {what} file '{}' is empty\n", path.display()));
            return Ok(FileTransfer::Skipped);
        }

        if !self
            .send_or_fail(
                cx,
                job,
                &Message::new(command).arg(content.len()),
                &format!("Failed to send the '{command}' command"),
            )
            .await?
        {
            return Ok(FileTransfer::Failed);
        }

        for chunk in content.chunks(CHUNK_SIZE) {
            let sent = match job.client.as_mut() {
                Some(client) => client.send_data(chunk).await.is_ok(),
                None => false,
            };
            if !sent {
                let failure = format!("Failed to send the content of the file '{}'", path.display());
                self.process_error(cx, job, &failure, None, true).await?;
                return Ok(FileTransfer::Failed);
            }
        }
        Ok(FileTransfer::Sent)
    }

    pub(super) async fn send_predictor(
        &self,
        cx: &TaskContext,
        job: &mut LaunchJob,
        wait: bool,
    ) -> Result<(), TaskError> {
        if wait
            && !self
                .expect_ok(cx, job, "Failed to send the internal data of the predictor")
                .await?
        {
            return Ok(());
        }

        let (_, configuration) = load(cx, job)?;
        let Some(predictor) = cx.store().try_get_setting(configuration.id, "USE_PREDICTOR") else {
            return self
                .process_error(cx, job, "No predictor specified", None, true)
                .await;
        };
        if self
            .send_or_fail(
                cx,
                job,
                &Message::new("USE_PREDICTOR").arg(predictor),
                "Failed to set the predictor",
            )
            .await?
        {
            job.operation = Some(Op::SendPredictorSettings);
        }
        Ok(())
    }

    pub(super) async fn send_predictor_settings(
        &self,
        cx: &TaskContext,
        job: &mut LaunchJob,
    ) -> Result<(), TaskError> {
        if !self
            .expect_ok(cx, job, "Failed to set the predictor")
            .await?
        {
            return Ok(());
        }
        let section = self.section(
            cx,
            job,
            "PREDICTOR_SETUP",
            "PREDICTOR_SETUP/",
            Vec::new(),
            Op::SendHeuristicsRepositoryUrl,
        )?;
        self.start_section(cx, job, section).await
    }

    pub(super) async fn send_heuristics_repository_url(
        &self,
        cx: &TaskContext,
        job: &mut LaunchJob,
    ) -> Result<(), TaskError> {
        if !self
            .expect_ok(cx, job, "Failed to send the 'PREDICTOR_SETUP' section")
            .await?
        {
            return Ok(());
        }
        let command = Message::new("USE_HEURISTICS_REPOSITORY")
            .arg(cx.config().heuristics_repository_url.as_str());
        if self
            .send_or_fail(
                cx,
                job,
                &command,
                "Failed to send the URL of the repository of heuristics",
            )
            .await?
        {
            job.operation = Some(Op::SendHeuristicsList);
        }
        Ok(())
    }

    pub(super) async fn send_heuristics_list(
        &self,
        cx: &TaskContext,
        job: &mut LaunchJob,
    ) -> Result<(), TaskError> {
        if !self
            .expect_ok(cx, job, "Failed to send the URL of the repository of heuristics")
            .await?
        {
            return Ok(());
        }

        let (_, configuration) = load(cx, job)?;
        let heuristics: VecDeque<HeuristicVersion> = configuration
            .heuristics
            .iter()
            .filter_map(|id| cx.store().get::<HeuristicVersion>(*id))
            .filter(|hv| hv.status == HeuristicStatus::Ok)
            .collect();
        if heuristics.is_empty() {
            return self
                .process_error(cx, job, "No enabled heuristic version available", None, true)
                .await;
        }
        job.ext.heuristics_to_send = heuristics;
        job.ext.current_section = None;
        self.send_next_heuristic(cx, job, true).await
    }

    pub(super) async fn send_next_heuristic(
        &self,
        cx: &TaskContext,
        job: &mut LaunchJob,
        first: bool,
    ) -> Result<(), TaskError> {
        if !first
            && !self
                .expect_ok(cx, job, "Failed to send the list of heuristics")
                .await?
        {
            return Ok(());
        }

        let Some(heuristic) = job.ext.heuristics_to_send.pop_front() else {
            return Err(TaskError::Internal("no heuristic left to send".into()));
        };
        let next = if job.ext.heuristics_to_send.is_empty() {
            Op::TrainPredictor
        } else {
            Op::SendNextHeuristic
        };
        let fullname = heuristic.fullname();
        if self
            .send_or_fail(
                cx,
                job,
                &Message::new("USE_HEURISTIC").arg(fullname.as_str()),
                &format!("Failed to select the heuristic '{fullname}'"),
            )
            .await?
        {
            job.operation = Some(next);
        }
        Ok(())
    }

    pub(super) async fn train_predictor(
        &self,
        cx: &TaskContext,
        job: &mut LaunchJob,
    ) -> Result<(), TaskError> {
        if !self
            .expect_ok(cx, job, "Failed to send the list of heuristics")
            .await?
        {
            return Ok(());
        }
        if !self
            .send_or_fail(
                cx,
                job,
                &Message::new("TRAIN_PREDICTOR"),
                "Failed to tell the predictor to train itself",
            )
            .await?
        {
            return Ok(());
        }

        let (_, configuration) = load(cx, job)?;
        job.operation = Some(if configuration.task == TaskType::GoalPlanning {
            Op::ProcessGoalPlanningTrainingResult
        } else {
            Op::ProcessImageBasedTrainingResult
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LABELS: &str = "0 1 2\r\n\r\n3 4\n5\n";

    #[test]
    fn labels_follow_the_evaluation_round() {
        assert_eq!(
            select_labels(LABELS, true, 1),
            vec![Param::Int(3), Param::Int(4)]
        );
        assert_eq!(select_labels(LABELS, true, 9), vec![Param::Int(5)]);
    }

    #[test]
    fn other_experiments_use_the_first_labels() {
        assert_eq!(
            select_labels(LABELS, false, 2),
            vec![Param::Int(0), Param::Int(1), Param::Int(2)]
        );
        assert!(select_labels("", false, 0).is_empty());
    }
}
