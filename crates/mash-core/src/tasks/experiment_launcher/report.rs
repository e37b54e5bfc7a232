use std::{
    fs,
    io::{self, Read},
    path::{Path, PathBuf},
};

use flate2::read::GzDecoder;
use mash_model::{
    Configuration, ConfigurationType, DataReport, Experiment, ExperimentStatus, HeuristicStatus,
    HeuristicVersion, HeuristicsList, Instrument, InstrumentStatus, RecordId,
};
use mash_net::Message;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use super::{CHUNK_SIZE, ExperimentLauncher, LaunchJob, Op, load, now, send, wait_response};
use crate::{
    TaskContext, TaskError,
    utils::{LockFile, generate_unique_folder_name, get_server_logs},
};

const MODEL_FILE: &str = "predictor.model";
const INTERNAL_DATA_FILE: &str = "predictor.internal";

/// Heuristic versions listed in the `HEURISTICS` block of a model file, as
/// `(author, name, version)`.
fn parse_model_heuristics(model: &str) -> Vec<(String, String, u32)> {
    model
        .lines()
        .skip_while(|line| *line != "HEURISTICS")
        .skip(1)
        .take_while(|line| *line != "END_HEURISTICS")
        .filter_map(|line| {
            let reference = line.split(' ').next()?;
            let mut parts = reference.split('/');
            let author = parts.next()?;
            let name = parts.next()?;
            let version = match parts.next() {
                Some(v) => v.parse().ok()?,
                None => 1,
            };
            Some((author.to_string(), name.to_string(), version))
        })
        .collect()
}

/// Extract the predictor files of a data report into `folder`.
fn extract_model(report: &Path, folder: &Path) -> io::Result<()> {
    fs::create_dir_all(folder)?;
    let mut archive = tar::Archive::new(GzDecoder::new(fs::File::open(report)?));
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if path.components().count() <= 2 && (name == MODEL_FILE || name == INTERNAL_DATA_FILE) {
            let mut content = Vec::new();
            entry.read_to_end(&mut content)?;
            fs::write(folder.join(name), content)?;
        }
    }
    Ok(())
}

impl ExperimentLauncher {
    pub(super) async fn process_data_report(
        &self,
        cx: &TaskContext,
        job: &mut LaunchJob,
    ) -> Result<(), TaskError> {
        let response = wait_response(job).await;
        let size = match &response {
            Some(r) if r.is("ERROR") => {
                return self
                    .process_error(cx, job, "Failed to retrieve the data report", response.as_ref(), true)
                    .await;
            }
            Some(r) if r.is("DATA") && r.params.len() == 1 => r.int(0).unwrap_or_default(),
            _ => return self.finalize_experiment(cx, job).await,
        };

        let root = cx.config().data_reports_root.clone();
        let (filename, mut file, fullpath) = {
            let _lock = LockFile::acquire(&root.join("dataReports.lock")).await?;
            let filename = format!("{}.tar.gz", generate_unique_folder_name().await);
            let fullpath = root.join(&filename);
            if let Some(dir) = fullpath.parent() {
                tokio::fs::create_dir_all(dir).await?;
            }
            let file = tokio::fs::File::create(&fullpath).await?;
            (filename, file, fullpath)
        };

        let mut remaining = size.max(0) as usize;
        while remaining > 0 {
            let nb = remaining.min(CHUNK_SIZE);
            let data = match job.client.as_mut() {
                Some(client) => client.wait_data(nb).await,
                None => None,
            };
            let Some(data) = data else {
                drop(file);
                if let Err(e) = tokio::fs::remove_file(&fullpath).await {
                    warn!(path = %fullpath.display(), error = %e, "cannot remove the partial data report");
                }
                return self.finalize_experiment(cx, job).await;
            };
            file.write_all(&data).await?;
            remaining -= nb;
        }
        file.flush().await?;
        drop(file);

        let (experiment, configuration) = load(cx, job)?;
        let instruments = configuration
            .instruments
            .iter()
            .filter_map(|id| cx.store().get::<Instrument>(*id))
            .filter(|i| i.status != InstrumentStatus::Disabled)
            .map(|i| i.id)
            .collect();
        let report = cx.store().insert(DataReport {
            experiment: experiment.id,
            filename,
            instruments,
            ..Default::default()
        })?;
        info!(experiment = experiment.id, report = report.id, "data report saved");

        self.finalize_experiment(cx, job).await
    }

    /// Called once the experiment (or one seed of an evaluation) succeeded.
    pub(super) async fn finalize_experiment(
        &self,
        cx: &TaskContext,
        job: &mut LaunchJob,
    ) -> Result<(), TaskError> {
        if let Some(client) = job.client.as_mut() {
            job.record.logs = get_server_logs(
                cx.store(),
                &cx.config().log_files_root,
                client,
                job.record.logs,
                Some(&["Predictor.log"][..]),
            )
            .await?;
            cx.store().save(&job.record)?;
        }

        let (mut experiment, configuration) = load(cx, job)?;

        if configuration.experiment_type == ConfigurationType::Evaluation {
            job.ext.nb_evaluation_rounds_done += 1;
            let nb_seeds = job.ext.seeds.as_ref().map_or(1, Vec::len);
            if job.ext.nb_evaluation_rounds_done < nb_seeds {
                if send(job, &Message::new("RESET")).await {
                    job.operation = Some(Op::SendGlobalSeed);
                } else {
                    self.process_error(cx, job, "Failed to reset the Experiment Server", None, true)
                        .await?;
                }
                return Ok(());
            }
        }

        if configuration.experiment_type == ConfigurationType::ContestBase {
            job.log.write("Creating the contest configuration...\n");
            match self.create_contest_configuration(cx, &experiment, &configuration).await {
                Ok(Some(id)) => job
                    .log
                    .write(&format!("Contest configuration #{id} created\n")),
                Ok(None) => job
                    .log
                    .write("Failed to extract the predictor model from the data report\n"),
                Err(e) => job
                    .log
                    .write(&format!("ERROR - Failed to create the contest configuration: {e}\n")),
            }
        }

        experiment.end = Some(now());
        cx.store().save(&experiment)?;

        let status = if configuration.experiment_type != ConfigurationType::Evaluation
            && job.ext.nb_evaluation_rounds_done > 0
        {
            ExperimentStatus::DoneWithErrors
        } else {
            ExperimentStatus::Done
        };
        job.mark_as_done(status).await?;

        let event = match configuration.experiment_type {
            ConfigurationType::Public => {
                Some(Message::new("EVT_PUBLIC_EXPERIMENT_DONE").arg(experiment.id))
            }
            ConfigurationType::Evaluation => experiment
                .heuristic_version
                .map(|hv| Message::new("EVT_HEURISTIC_EVALUATED").arg(hv)),
            ConfigurationType::ContestEntry => experiment
                .contest
                .map(|contest| Message::new("RANK_CONTEST_ENTRIES").arg(contest)),
            ConfigurationType::Signature => experiment
                .heuristic_version
                .map(|hv| Message::new("EVT_HEURISTIC_SIGNATURE_RECORDED").arg(hv)),
            _ => None,
        };
        if let Some(event) = event {
            cx.send_event(&event);
        }
        Ok(())
    }

    /// Turn a finished contest-base experiment into the configuration of
    /// the contest entries, using the model it trained.
    ///
    /// Returns `None` when the data report holds no model.
    async fn create_contest_configuration(
        &self,
        cx: &TaskContext,
        experiment: &Experiment,
        template: &Configuration,
    ) -> Result<Option<RecordId>, TaskError> {
        let store = cx.store();
        let config = cx.config();
        let report = store
            .filter::<DataReport>(|r| r.experiment == experiment.id)
            .pop()
            .ok_or(TaskError::Missing {
                kind: "data report",
                id: experiment.id,
            })?;

        let model_folder = report
            .filename
            .strip_suffix(".tar.gz")
            .unwrap_or(&report.filename)
            .to_string();
        let report_path = config.data_reports_root.join(&report.filename);
        let model_path: PathBuf = config.models_root.join(&model_folder);

        let extracted = model_path.clone();
        tokio::task::spawn_blocking(move || extract_model(&report_path, &extracted))
            .await
            .map_err(|e| TaskError::Internal(e.to_string()))?
            .map_err(|e| TaskError::Archive(e.to_string()))?;

        let Ok(model) = tokio::fs::read(model_path.join(MODEL_FILE)).await else {
            return Ok(None);
        };
        let has_internal_data = tokio::fs::try_exists(model_path.join(INTERNAL_DATA_FILE))
            .await
            .unwrap_or(false);

        let mut heuristics = Vec::new();
        for (author, name, version) in parse_model_heuristics(&String::from_utf8_lossy(&model)) {
            let hv = store
                .find::<HeuristicVersion>(|hv| {
                    hv.status != HeuristicStatus::Deleted && hv.matches(&author, &name, version)
                })
                .ok_or_else(|| {
                    TaskError::Protocol(format!(
                        "unknown heuristic version in the model: {author}/{name}/{version}"
                    ))
                })?;
            heuristics.push(hv.id);
        }

        let name = match template.name.strip_suffix("/base") {
            Some(name) => name.to_string(),
            None => format!("{}/contest", template.name),
        };
        let configuration = store.insert(Configuration {
            name,
            experiment_type: ConfigurationType::ContestEntry,
            task: template.task,
            heuristics_list: HeuristicsList::Custom,
            heuristics,
            instruments: template.instruments.clone(),
            ..Default::default()
        })?;

        for setting in store.settings_with_prefix(template.id, "") {
            if setting.name != "USE_PREDICTOR_MODEL" && setting.name != "USE_PREDICTOR_INTERNAL_DATA" {
                store.add_setting(configuration.id, &setting.name, &setting.value)?;
            }
        }
        store.add_setting(
            configuration.id,
            "USE_PREDICTOR_MODEL",
            &format!("{model_folder}/{MODEL_FILE}"),
        )?;
        if has_internal_data {
            store.add_setting(
                configuration.id,
                "USE_PREDICTOR_INTERNAL_DATA",
                &format!("{model_folder}/{INTERNAL_DATA_FILE}"),
            )?;
        }

        Ok(Some(configuration.id))
    }
}
