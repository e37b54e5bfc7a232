//! Creates the experiments the platform runs on its own: the public
//! experiments, the evaluation of each checked heuristic and the recording
//! of its signature.
//!
//! Jobs of this task never talk to a server. They build the configurations
//! and experiments, then hand them to the launcher with `RUN_EXPERIMENT`
//! (or withdraw them with `CANCEL_EXPERIMENT`).

use std::convert::Infallible;

use async_trait::async_trait;
use mash_model::{
    Alert, Configuration, ConfigurationType, Experiment, ExperimentStatus,
    HeuristicEvaluationResults, HeuristicSignature, HeuristicStatus, HeuristicVersion, JobStatus,
    RecordId, Store,
};
use mash_net::Message;
use time::macros::format_description;
use tracing::{debug, info};

use super::farm::now;
use crate::{CommandSpec, Job, JobExt, JobList, ParamType, Task, TaskContext, TaskError};

const COMMANDS: &[CommandSpec] = &[
    CommandSpec::new("SCHEDULE_PUBLIC_EXPERIMENTS", &[]),
    CommandSpec::new("SCHEDULE_HEURISTIC_EVALUATION", &[ParamType::Int]),
    CommandSpec::new("EVALUATE_ALL_HEURISTICS", &[]),
    CommandSpec::new("SCHEDULE_HEURISTIC_SIGNATURE_RECORDING", &[ParamType::Int]),
    CommandSpec::new("RECORD_ALL_HEURISTIC_SIGNATURES", &[]),
];

const EVENTS: &[CommandSpec] = &[
    CommandSpec::new("EVT_HEURISTIC_CHECKED", &[ParamType::Int]),
    CommandSpec::new("EVT_PUBLIC_EXPERIMENT_DONE", &[ParamType::Int]),
    CommandSpec::new("EVT_PUBLIC_EXPERIMENT_FAILED", &[ParamType::Int]),
    CommandSpec::new("EVT_EXPERIMENT_CANCELLED", &[ParamType::Int]),
];

/// Prefix of the configurations the experiments are copied from.
const TEMPLATE_PREFIX: &str = "template/";

#[derive(Debug, Default)]
pub struct ExperimentScheduler;

#[derive(Debug, Default)]
pub struct ScheduleState;

impl JobExt for ScheduleState {
    type Operation = Infallible;
}

type ScheduleJob = Job<ScheduleState>;

fn public_experiments() -> Message {
    Message::new("SCHEDULE_PUBLIC_EXPERIMENTS")
}

fn evaluation_of(heuristic_version: RecordId) -> Message {
    Message::new("SCHEDULE_HEURISTIC_EVALUATION").arg(heuristic_version)
}

fn signature_of(heuristic_version: RecordId) -> Message {
    Message::new("SCHEDULE_HEURISTIC_SIGNATURE_RECORDING").arg(heuristic_version)
}

/// Checked, enabled and not simple.
fn is_evaluable(hv: &HeuristicVersion) -> bool {
    hv.checked && hv.status == HeuristicStatus::Ok && !hv.simple
}

fn templates(store: &Store, experiment_type: ConfigurationType) -> Vec<Configuration> {
    store.filter::<Configuration>(|c| {
        c.experiment_type == experiment_type && c.name.starts_with(TEMPLATE_PREFIX)
    })
}

/// Latest public version of every heuristic that is not simple.
fn current_public_versions(store: &Store) -> Vec<RecordId> {
    store
        .filter::<HeuristicVersion>(|hv| hv.public && !hv.simple)
        .into_iter()
        .filter(|hv| store.latest_public_version(hv).is_some_and(|l| l.id == hv.id))
        .map(|hv| hv.id)
        .collect()
}

/// Copy of `template` named `name`, using `heuristics`, with its settings.
/// `extra` settings are added before the ones of the template.
fn instantiate(
    store: &Store,
    template: &Configuration,
    name: String,
    heuristics: Vec<RecordId>,
    instruments: Vec<RecordId>,
    extra: &[(&str, String)],
) -> Result<Configuration, TaskError> {
    let configuration = store.insert(Configuration {
        id: 0,
        name,
        experiment_type: template.experiment_type,
        task: template.task,
        heuristics_list: template.heuristics_list,
        heuristics,
        instruments,
    })?;
    for (name, value) in extra {
        store.add_setting(configuration.id, name, value)?;
    }
    for setting in store.settings_with_prefix(template.id, "") {
        store.add_setting(configuration.id, &setting.name, &setting.value)?;
    }
    Ok(configuration)
}

fn create_experiment(
    store: &Store,
    configuration: &Configuration,
    heuristic_version: Option<RecordId>,
) -> Result<Experiment, TaskError> {
    Ok(store.insert(Experiment {
        name: configuration.name.clone(),
        configuration: configuration.id,
        status: ExperimentStatus::Scheduled,
        heuristic_version,
        ..Default::default()
    })?)
}

async fn fail(job: &mut ScheduleJob, message: String) -> Result<(), TaskError> {
    job.log.write(&format!("ERROR - {message}\n"));
    job.mark_as_failed(Some(Alert::new(message))).await?;
    Ok(())
}

fn run(cx: &TaskContext, experiment: &Experiment) {
    cx.send_event(&Message::new("RUN_EXPERIMENT").arg(experiment.id));
}

fn cancel(cx: &TaskContext, experiment: RecordId) {
    cx.send_event(&Message::new("CANCEL_EXPERIMENT").arg(experiment));
}

impl ExperimentScheduler {
    async fn schedule_public_experiments(
        &self,
        cx: &TaskContext,
        job: &mut ScheduleJob,
    ) -> Result<(), TaskError> {
        job.mark_as_running(None, None, None).await?;
        let store = cx.store();

        for template in templates(store, ConfigurationType::Public) {
            let base = &template.name[TEMPLATE_PREFIX.len()..];

            // Latest experiment built from this template
            let previous = store
                .filter::<Configuration>(|c| {
                    c.experiment_type == ConfigurationType::Public
                        && !c.name.starts_with(TEMPLATE_PREFIX)
                        && c.name.starts_with(base)
                })
                .into_iter()
                .filter_map(|c| {
                    store
                        .find::<Experiment>(|e| e.configuration == c.id)
                        .map(|e| (c, e))
                })
                .max_by_key(|(_, e)| e.id);

            if previous
                .as_ref()
                .is_some_and(|(_, e)| e.status == ExperimentStatus::Running)
            {
                continue;
            }

            let current = current_public_versions(store);
            let already_used = previous
                .as_ref()
                .map(|(c, _)| c.heuristics.clone())
                .unwrap_or_default();
            if current.iter().all(|id| already_used.contains(id)) {
                continue;
            }

            if let Some((_, experiment)) = &previous
                && experiment.status == ExperimentStatus::Scheduled
            {
                job.log.write(&format!(
                    "Cancelling the outdated experiment #{}\n",
                    experiment.id
                ));
                cancel(cx, experiment.id);
                continue;
            }

            let date = now()
                .format(format_description!(
                    "[year]-[month]-[day] [hour]:[minute]:[second]"
                ))
                .map_err(|e| TaskError::Internal(e.to_string()))?;
            let configuration = instantiate(
                store,
                &template,
                format!("{base}/{date}"),
                current,
                template.instruments.clone(),
                &[],
            )?;
            let experiment = create_experiment(store, &configuration, None)?;
            info!(experiment = experiment.id, name = %experiment.name, "public experiment scheduled");
            run(cx, &experiment);
        }

        job.mark_as_done(ExperimentStatus::Done).await?;
        Ok(())
    }

    async fn schedule_heuristic_evaluation(
        &self,
        cx: &TaskContext,
        job: &mut ScheduleJob,
    ) -> Result<(), TaskError> {
        let store = cx.store();
        let id = job.command.int(0).unwrap_or_default();
        let Some(mut heuristic_version) = store.get::<HeuristicVersion>(id) else {
            return fail(job, format!("Unknown heuristic version ID: {id}")).await;
        };

        job.mark_as_running(None, Some(heuristic_version.id), None)
            .await?;

        let results = store
            .filter::<HeuristicEvaluationResults>(|r| r.heuristic_version == heuristic_version.id);

        if heuristic_version.evaluated {
            // Start again from scratch
            for r in &results {
                if let Some(experiment) = store.get::<Experiment>(r.experiment) {
                    store.delete_configuration(experiment.configuration)?;
                }
                store.delete::<HeuristicEvaluationResults>(r.id)?;
            }
            heuristic_version.evaluated = false;
            heuristic_version.rank = None;
            store.save(&heuristic_version)?;
        } else if !results.is_empty() {
            // Under evaluation: the running experiments are cancelled, which
            // schedules the evaluation again once the last one is gone.
            for r in &results {
                match store.get::<Experiment>(r.experiment) {
                    Some(experiment) if experiment.status == ExperimentStatus::Running => {
                        cancel(cx, experiment.id);
                    }
                    experiment => {
                        if let Some(experiment) = experiment {
                            store.delete_configuration(experiment.configuration)?;
                        }
                        store.delete::<HeuristicEvaluationResults>(r.id)?;
                    }
                }
            }
            job.mark_as_done(ExperimentStatus::Done).await?;
            return Ok(());
        }

        let templates = templates(store, ConfigurationType::Evaluation);
        if templates.is_empty() {
            return fail(job, "No evaluation configuration found".to_string()).await;
        }

        for template in templates {
            let name = template.name.replacen(
                TEMPLATE_PREFIX,
                &format!("{}/", heuristic_version.fullname()),
                1,
            );
            let mut heuristics = template.heuristics.clone();
            let mut extra = Vec::new();
            if heuristics.contains(&heuristic_version.id) {
                extra.push((
                    "PREDICTOR_SETUP/ADDITIONAL_HEURISTICS",
                    heuristic_version.absolutename(),
                ));
            } else {
                heuristics.push(heuristic_version.id);
            }

            let configuration = instantiate(
                store,
                &template,
                name,
                heuristics,
                template.instruments.clone(),
                &extra,
            )?;
            let experiment = create_experiment(store, &configuration, Some(heuristic_version.id))?;
            store.insert(HeuristicEvaluationResults {
                heuristic_version: heuristic_version.id,
                evaluation_config: template.id,
                experiment: experiment.id,
                ..Default::default()
            })?;
            debug!(experiment = experiment.id, heuristic_version = heuristic_version.id, "evaluation scheduled");
            run(cx, &experiment);
        }

        job.mark_as_done(ExperimentStatus::Done).await?;
        Ok(())
    }

    async fn schedule_heuristic_signature_recording(
        &self,
        cx: &TaskContext,
        job: &mut ScheduleJob,
    ) -> Result<(), TaskError> {
        let store = cx.store();
        let id = job.command.int(0).unwrap_or_default();
        let Some(heuristic_version) = store.get::<HeuristicVersion>(id) else {
            return fail(job, format!("Unknown heuristic version ID: {id}")).await;
        };

        job.mark_as_running(None, Some(heuristic_version.id), None)
            .await?;

        if let Some(signature) =
            store.find::<HeuristicSignature>(|s| s.heuristic_version == heuristic_version.id)
        {
            let experiment = store.get::<Experiment>(signature.experiment);
            if let Some(experiment) = &experiment
                && matches!(
                    experiment.status,
                    ExperimentStatus::Running | ExperimentStatus::Scheduled
                )
            {
                // Recorded again once the cancellation is notified
                cancel(cx, experiment.id);
                job.mark_as_done(ExperimentStatus::Done).await?;
                return Ok(());
            }
            if let Some(experiment) = experiment {
                store.delete_configuration(experiment.configuration)?;
            }
            store.delete::<HeuristicSignature>(signature.id)?;
        }

        let Some(template) = templates(store, ConfigurationType::Signature).into_iter().next()
        else {
            return fail(job, "No signature recording configuration found".to_string()).await;
        };

        let name = template.name.replacen(
            TEMPLATE_PREFIX,
            &format!("{}/", heuristic_version.fullname()),
            1,
        );
        let configuration = instantiate(
            store,
            &template,
            name,
            vec![heuristic_version.id],
            Vec::new(),
            &[],
        )?;
        let experiment = create_experiment(store, &configuration, Some(heuristic_version.id))?;
        store.insert(HeuristicSignature {
            heuristic_version: heuristic_version.id,
            experiment: experiment.id,
            ..Default::default()
        })?;
        run(cx, &experiment);

        job.mark_as_done(ExperimentStatus::Done).await?;
        Ok(())
    }

    /// Forget what the cancelled experiment was created for, and schedule
    /// it again when it is still needed.
    fn on_experiment_cancelled(
        &self,
        cx: &TaskContext,
        jobs: &mut JobList<ScheduleState>,
        experiment: RecordId,
    ) -> Result<Vec<RecordId>, TaskError> {
        let store = cx.store();
        let Some(experiment) = store.get::<Experiment>(experiment) else {
            return Ok(Vec::new());
        };
        let Some(configuration) = store.get::<Configuration>(experiment.configuration) else {
            return Ok(Vec::new());
        };

        let command = match configuration.experiment_type {
            ConfigurationType::Public => Some(public_experiments()),
            ConfigurationType::Evaluation => {
                let results = store
                    .find::<HeuristicEvaluationResults>(|r| r.experiment == experiment.id);
                match results {
                    Some(results) => {
                        store.delete::<HeuristicEvaluationResults>(results.id)?;
                        let remaining = store.count::<HeuristicEvaluationResults>(|r| {
                            r.heuristic_version == results.heuristic_version
                        });
                        store
                            .get::<HeuristicVersion>(results.heuristic_version)
                            .filter(|hv| remaining == 0 && hv.status == HeuristicStatus::Ok)
                            .map(|hv| evaluation_of(hv.id))
                    }
                    None => None,
                }
            }
            ConfigurationType::Signature => {
                let signature =
                    store.find::<HeuristicSignature>(|s| s.experiment == experiment.id);
                match signature {
                    Some(signature) => {
                        store.delete::<HeuristicSignature>(signature.id)?;
                        store
                            .get::<HeuristicVersion>(signature.heuristic_version)
                            .filter(|hv| hv.status == HeuristicStatus::Ok)
                            .map(|hv| signature_of(hv.id))
                    }
                    None => None,
                }
            }
            _ => None,
        };

        store.delete_configuration(configuration.id)?;

        match command {
            Some(command) => Ok(vec![jobs.add_job(&command)?]),
            None => Ok(Vec::new()),
        }
    }
}

#[async_trait]
impl Task for ExperimentScheduler {
    type Ext = ScheduleState;

    const NAME: &'static str = "ExperimentScheduler";

    fn commands(&self) -> &'static [CommandSpec] {
        COMMANDS
    }

    fn events(&self) -> &'static [CommandSpec] {
        EVENTS
    }

    async fn on_startup(
        &mut self,
        cx: &TaskContext,
        jobs: &mut JobList<ScheduleState>,
    ) -> Result<(), TaskError> {
        let store = cx.store();
        jobs.add_job(&public_experiments())?;

        for hv in store.filter::<HeuristicVersion>(|hv| is_evaluable(hv) && !hv.evaluated) {
            jobs.add_job(&evaluation_of(hv.id))?;
        }

        for hv in store.filter::<HeuristicVersion>(is_evaluable) {
            if store.count::<HeuristicSignature>(|s| s.heuristic_version == hv.id) == 0 {
                jobs.add_job(&signature_of(hv.id))?;
            }
        }
        Ok(())
    }

    async fn on_command_received(
        &mut self,
        cx: &TaskContext,
        jobs: &mut JobList<ScheduleState>,
        command: &Message,
    ) -> Result<bool, TaskError> {
        match command.name.as_str() {
            "SCHEDULE_PUBLIC_EXPERIMENTS" => {
                let Some(&id) = jobs.get_jobs(None, Some(command)).first() else {
                    return Ok(false);
                };
                // A waiting job is woken up instead of queuing another one
                if let Some(job) = jobs.get_mut(id)
                    && job.status() == JobStatus::Delayed
                {
                    job.timeout = Some(0);
                }
                Ok(true)
            }
            "EVALUATE_ALL_HEURISTICS" => {
                for hv in cx.store().filter::<HeuristicVersion>(is_evaluable) {
                    jobs.add_job(&evaluation_of(hv.id))?;
                }
                Ok(true)
            }
            "RECORD_ALL_HEURISTIC_SIGNATURES" => {
                for hv in cx.store().filter::<HeuristicVersion>(is_evaluable) {
                    jobs.add_job(&signature_of(hv.id))?;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn on_event_received(
        &mut self,
        cx: &TaskContext,
        jobs: &mut JobList<ScheduleState>,
        event: &Message,
    ) -> Result<Vec<RecordId>, TaskError> {
        let id = event.int(0).unwrap_or_default();
        match event.name.as_str() {
            "EVT_HEURISTIC_CHECKED" => {
                let hv = cx
                    .store()
                    .get::<HeuristicVersion>(id)
                    .ok_or(TaskError::Missing {
                        kind: "heuristic version",
                        id,
                    })?;
                if hv.simple {
                    return Ok(Vec::new());
                }
                Ok(vec![
                    jobs.add_job(&evaluation_of(id))?,
                    jobs.add_job(&signature_of(id))?,
                ])
            }
            "EVT_PUBLIC_EXPERIMENT_DONE" | "EVT_PUBLIC_EXPERIMENT_FAILED" => {
                Ok(vec![jobs.add_job(&public_experiments())?])
            }
            "EVT_EXPERIMENT_CANCELLED" => self.on_experiment_cancelled(cx, jobs, id),
            _ => Ok(Vec::new()),
        }
    }

    async fn step(&mut self, cx: &TaskContext, job: &mut ScheduleJob) -> Result<(), TaskError> {
        if let Some(op) = job.operation {
            match op {}
        }
        match job.command.name.as_str() {
            "SCHEDULE_PUBLIC_EXPERIMENTS" => self.schedule_public_experiments(cx, job).await,
            "SCHEDULE_HEURISTIC_EVALUATION" => self.schedule_heuristic_evaluation(cx, job).await,
            "SCHEDULE_HEURISTIC_SIGNATURE_RECORDING" => {
                self.schedule_heuristic_signature_recording(cx, job).await
            }
            other => Err(TaskError::Protocol(format!("unexpected command '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryMailer, ScheduledTask, SchedulerConfig, Services, TaskEngine};
    use mash_model::{Setting, TaskType};
    use std::sync::Arc;

    fn engine_for(store: &Store) -> TaskEngine<ExperimentScheduler> {
        let services = Services::new(
            store.clone(),
            SchedulerConfig::default(),
            Arc::new(MemoryMailer::new()),
        );
        TaskEngine::new(ExperimentScheduler, services)
    }

    fn heuristic(store: &Store, name: &str, public: bool) -> HeuristicVersion {
        store
            .insert(HeuristicVersion {
                author: "User1".into(),
                name: name.into(),
                version: 1,
                checked: true,
                public,
                ..Default::default()
            })
            .unwrap()
    }

    fn template(store: &Store, name: &str, experiment_type: ConfigurationType) -> Configuration {
        let template = store
            .insert(Configuration {
                name: name.into(),
                experiment_type,
                task: TaskType::Classification,
                instruments: vec![7],
                ..Default::default()
            })
            .unwrap();
        store
            .add_setting(template.id, "EXPERIMENT_SETUP/DATABASE_NAME", "mnist")
            .unwrap();
        template
    }

    fn names(events: &[Message]) -> Vec<String> {
        events.iter().map(Message::encode).collect()
    }

    #[tokio::test]
    async fn evaluation_creates_one_experiment_per_template() {
        let store = Store::new();
        let hv = heuristic(&store, "edges", false);
        let eval1 = template(&store, "template/eval1", ConfigurationType::Evaluation);
        template(&store, "template/eval2", ConfigurationType::Evaluation);
        template(&store, "template/public", ConfigurationType::Public);

        let mut engine = engine_for(&store);
        assert!(engine.process_message(&evaluation_of(hv.id)).await);
        engine.process_new_jobs().await;
        assert!(engine.jobs().is_empty());

        let results = store.all::<HeuristicEvaluationResults>();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].evaluation_config, eval1.id);

        let experiment = store.get::<Experiment>(results[0].experiment).unwrap();
        assert_eq!(experiment.name, "user1/edges/eval1");
        assert_eq!(experiment.heuristic_version, Some(hv.id));
        assert_eq!(experiment.status, ExperimentStatus::Scheduled);

        let configuration = store.get::<Configuration>(experiment.configuration).unwrap();
        assert_eq!(configuration.heuristics, vec![hv.id]);
        assert_eq!(configuration.instruments, vec![7]);
        assert_eq!(
            store
                .try_get_setting(configuration.id, "EXPERIMENT_SETUP/DATABASE_NAME")
                .as_deref(),
            Some("mnist")
        );

        let events = engine.take_events().await;
        assert_eq!(
            names(&events),
            vec![
                format!("RUN_EXPERIMENT {}", results[0].experiment),
                format!("RUN_EXPERIMENT {}", results[1].experiment),
            ]
        );
    }

    #[tokio::test]
    async fn heuristic_of_the_template_is_passed_as_additional() {
        let store = Store::new();
        let hv = heuristic(&store, "edges", false);
        let mut eval = template(&store, "template/eval", ConfigurationType::Evaluation);
        eval.heuristics = vec![hv.id];
        store.save(&eval).unwrap();

        let mut engine = engine_for(&store);
        engine.process_message(&evaluation_of(hv.id)).await;
        engine.process_new_jobs().await;

        let results = store.all::<HeuristicEvaluationResults>().pop().unwrap();
        let experiment = store.get::<Experiment>(results.experiment).unwrap();
        assert_eq!(
            store
                .try_get_setting(experiment.configuration, "PREDICTOR_SETUP/ADDITIONAL_HEURISTICS")
                .as_deref(),
            Some("user1/edges/1")
        );
    }

    #[tokio::test]
    async fn evaluation_failures_raise_alerts() {
        let store = Store::new();
        let hv = heuristic(&store, "edges", false);
        let mut engine = engine_for(&store);

        engine.process_message(&evaluation_of(99)).await;
        engine.process_message(&evaluation_of(hv.id)).await;
        engine.process_new_jobs().await;

        let alerts: Vec<_> = store.all::<Alert>().into_iter().map(|a| a.message).collect();
        assert_eq!(
            alerts,
            vec![
                "Unknown heuristic version ID: 99",
                "No evaluation configuration found"
            ]
        );
    }

    #[tokio::test]
    async fn checked_heuristic_is_evaluated_and_signed() {
        let store = Store::new();
        let hv = heuristic(&store, "edges", false);
        let simple = store
            .insert(HeuristicVersion {
                id: 0,
                simple: true,
                ..hv.clone()
            })
            .unwrap();
        template(&store, "template/eval", ConfigurationType::Evaluation);
        template(&store, "template/signature", ConfigurationType::Signature);

        let mut engine = engine_for(&store);
        let event = |id| Message::new("EVT_HEURISTIC_CHECKED").arg(id);
        assert!(engine.process_message(&event(simple.id)).await);
        assert!(engine.jobs().is_empty());

        assert!(engine.process_message(&event(hv.id)).await);
        engine.process_new_jobs().await;

        assert_eq!(store.count::<HeuristicEvaluationResults>(|_| true), 1);
        let signature = store.all::<HeuristicSignature>().pop().unwrap();
        assert_eq!(signature.heuristic_version, hv.id);
        let experiment = store.get::<Experiment>(signature.experiment).unwrap();
        assert_eq!(experiment.name, "user1/edges/signature");

        let events = engine.take_events().await;
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.is("RUN_EXPERIMENT")));
    }

    #[tokio::test]
    async fn evaluate_all_starts_the_queued_jobs() {
        let store = Store::new();
        heuristic(&store, "a", false);
        heuristic(&store, "b", false);
        store
            .insert(HeuristicVersion {
                name: "unchecked".into(),
                ..Default::default()
            })
            .unwrap();
        template(&store, "template/eval", ConfigurationType::Evaluation);

        let mut engine = engine_for(&store);
        assert!(engine.process_message(&Message::new("EVALUATE_ALL_HEURISTICS")).await);
        engine.process_new_jobs().await;

        assert!(engine.jobs().is_empty());
        assert_eq!(store.count::<HeuristicEvaluationResults>(|_| true), 2);
    }

    #[tokio::test]
    async fn public_experiment_uses_the_latest_public_versions() {
        let store = Store::new();
        let a = heuristic(&store, "a", true);
        let b1 = heuristic(&store, "b", true);
        let b2 = store
            .insert(HeuristicVersion {
                id: 0,
                version: 2,
                ..b1.clone()
            })
            .unwrap();
        heuristic(&store, "private", false);
        let public = template(&store, "template/public", ConfigurationType::Public);

        let mut engine = engine_for(&store);
        engine.process_message(&public_experiments()).await;
        engine.process_new_jobs().await;

        let experiment = store
            .find::<Experiment>(|e| e.name.starts_with("public/"))
            .unwrap();
        let configuration = store.get::<Configuration>(experiment.configuration).unwrap();
        assert_eq!(configuration.heuristics, vec![a.id, b2.id]);
        assert_eq!(
            store.count::<Setting>(|s| s.configuration == configuration.id),
            store.count::<Setting>(|s| s.configuration == public.id)
        );
        assert_eq!(
            names(&engine.take_events().await),
            vec![format!("RUN_EXPERIMENT {}", experiment.id)]
        );

        // Nothing new: nothing scheduled
        engine.process_message(&public_experiments()).await;
        engine.process_new_jobs().await;
        assert!(engine.take_events().await.is_empty());

        // A new version while the previous experiment still waits: it is cancelled
        heuristic(&store, "c", true);
        engine.process_message(&public_experiments()).await;
        engine.process_new_jobs().await;
        assert_eq!(
            names(&engine.take_events().await),
            vec![format!("CANCEL_EXPERIMENT {}", experiment.id)]
        );
    }

    #[tokio::test]
    async fn cancelled_evaluation_is_scheduled_again() {
        let store = Store::new();
        let hv = heuristic(&store, "edges", false);
        template(&store, "template/eval", ConfigurationType::Evaluation);

        let mut engine = engine_for(&store);
        engine.process_message(&evaluation_of(hv.id)).await;
        engine.process_new_jobs().await;
        engine.take_events().await;

        let results = store.all::<HeuristicEvaluationResults>().pop().unwrap();
        let experiment = store.get::<Experiment>(results.experiment).unwrap();

        engine
            .process_message(&Message::new("EVT_EXPERIMENT_CANCELLED").arg(experiment.id))
            .await;
        assert!(store.get::<Configuration>(experiment.configuration).is_none());
        assert!(store.get::<HeuristicEvaluationResults>(results.id).is_none());
        assert_eq!(engine.jobs().count(None), 1);

        engine.process_new_jobs().await;
        let rescheduled = store.all::<HeuristicEvaluationResults>().pop().unwrap();
        assert_ne!(rescheduled.experiment, experiment.id);
    }

    #[tokio::test]
    async fn startup_queues_missing_evaluations_and_signatures() {
        let store = Store::new();
        let hv = heuristic(&store, "edges", false);
        let done = store
            .insert(HeuristicVersion {
                id: 0,
                evaluated: true,
                ..hv.clone()
            })
            .unwrap();
        store
            .insert(HeuristicSignature {
                heuristic_version: done.id,
                experiment: 1,
                ..Default::default()
            })
            .unwrap();

        let store_jobs = || {
            store
                .all::<mash_model::JobRecord>()
                .into_iter()
                .map(|j| j.command)
                .collect::<Vec<_>>()
        };
        let mut engine = engine_for(&store);
        engine.start().await;

        let commands = store_jobs();
        assert!(commands.contains(&"SCHEDULE_PUBLIC_EXPERIMENTS".to_string()));
        assert!(commands.contains(&format!("SCHEDULE_HEURISTIC_EVALUATION {}", hv.id)));
        assert!(commands.contains(&format!("SCHEDULE_HEURISTIC_SIGNATURE_RECORDING {}", hv.id)));
        assert!(!commands.contains(&format!("SCHEDULE_HEURISTIC_EVALUATION {}", done.id)));
        assert!(!commands.contains(&format!("SCHEDULE_HEURISTIC_SIGNATURE_RECORDING {}", done.id)));
    }
}
