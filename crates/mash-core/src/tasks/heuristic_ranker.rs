//! Ranks the evaluated heuristic versions and the contest entries.
//!
//! Every evaluation configuration ranks its results by mean test error, the
//! mean train error breaking ties. The global rank of a version sums, over
//! the configurations, how far below the mean error it is in standard
//! deviations.

use std::{cmp::Ordering, convert::Infallible};

use async_trait::async_trait;
use mash_model::{
    Alert, ClassificationResults, Configuration, ConfigurationType, ContestEntry, EvaluationStep,
    Experiment, ExperimentStatus, HeuristicEvaluationResults, HeuristicVersion, RecordId, Store,
};
use mash_net::Message;
use tracing::debug;

use crate::{CommandSpec, Job, JobExt, JobList, ParamType, Task, TaskContext, TaskError};

const COMMANDS: &[CommandSpec] = &[
    CommandSpec::new("RANK_EVALUATED_HEURISTICS", &[]),
    CommandSpec::new("RANK_HEURISTIC_VERSION", &[ParamType::Int]),
    CommandSpec::new("RANK_CONTEST_ENTRIES", &[ParamType::Int]),
];

const EVENTS: &[CommandSpec] = &[CommandSpec::new("EVT_HEURISTIC_EVALUATED", &[ParamType::Int])];

#[derive(Debug, Default)]
pub struct HeuristicRanker;

#[derive(Debug, Default)]
pub struct RankState;

impl JobExt for RankState {
    type Operation = Infallible;
}

type RankJob = Job<RankState>;

/// Something ranked by its mean test error, then its mean train error.
#[derive(Debug, Clone)]
struct Scored<T> {
    item: T,
    test: f64,
    train: f64,
}

fn compare<T>(a: &Scored<T>, b: &Scored<T>) -> Ordering {
    a.test.total_cmp(&b.test).then(a.train.total_cmp(&b.train))
}

/// Rank of an unranked score among `ranked`, ordered by rank: the rank of
/// the first one it beats, or past the last one.
fn rank_element(test: f64, train: f64, ranked: &[Scored<HeuristicEvaluationResults>]) -> i64 {
    ranked
        .iter()
        .find(|r| test < r.test || (!(test > r.test) && train < r.train))
        .and_then(|r| r.item.rank)
        .unwrap_or(ranked.len() as i64 + 1)
}

/// Mean (test, train) errors of the seeds of an evaluation experiment.
fn mean_errors(store: &Store, experiment: RecordId) -> Result<(f64, f64), TaskError> {
    let steps = store.filter::<EvaluationStep>(|s| s.experiment == experiment);
    let mean = |values: Vec<f64>| {
        (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
    };
    let test = mean(steps.iter().filter_map(|s| s.test_error).collect());
    let train = mean(steps.iter().filter_map(|s| s.train_error).collect());
    match (test, train) {
        (Some(test), Some(train)) => Ok((test, train)),
        _ => Err(TaskError::Internal(format!(
            "no evaluation error recorded for the experiment #{experiment}"
        ))),
    }
}

fn scored(
    store: &Store,
    results: HeuristicEvaluationResults,
) -> Result<Scored<HeuristicEvaluationResults>, TaskError> {
    let (test, train) = mean_errors(store, results.experiment)?;
    Ok(Scored {
        item: results,
        test,
        train,
    })
}

fn experiment_done(store: &Store, experiment: RecordId) -> bool {
    store
        .get::<Experiment>(experiment)
        .is_some_and(|e| e.status == ExperimentStatus::Done)
}

fn is_latest_public(store: &Store, hv: &HeuristicVersion) -> bool {
    store
        .latest_public_version(hv)
        .is_some_and(|latest| latest.id == hv.id)
}

fn evaluation_templates(store: &Store) -> Vec<RecordId> {
    store
        .filter::<Configuration>(|c| {
            c.experiment_type == ConfigurationType::Evaluation && c.name.starts_with("template/")
        })
        .into_iter()
        .map(|c| c.id)
        .collect()
}

/// Done and ranked results of the latest public versions for a
/// configuration, ordered by rank.
fn ranked_results(
    store: &Store,
    configuration: RecordId,
) -> Result<Vec<Scored<HeuristicEvaluationResults>>, TaskError> {
    let mut ranked = Vec::new();
    for results in store.filter::<HeuristicEvaluationResults>(|r| {
        r.evaluation_config == configuration && r.rank.is_some()
    }) {
        let public_latest = store
            .get::<HeuristicVersion>(results.heuristic_version)
            .is_some_and(|hv| hv.public && is_latest_public(store, &hv));
        if public_latest && experiment_done(store, results.experiment) {
            ranked.push(scored(store, results)?);
        }
    }
    ranked.sort_by_key(|r| r.item.rank);
    Ok(ranked)
}

struct Candidate {
    heuristic_version: HeuristicVersion,
    score: f64,
    modifiable: bool,
}

impl Candidate {
    fn new(heuristic_version: HeuristicVersion, modifiable: bool) -> Self {
        Self {
            heuristic_version,
            score: 0.0,
            modifiable,
        }
    }
}

/// Sum the z-scores of every candidate over the configurations, then save
/// the rank of the modifiable ones.
fn compute_global_ranking(
    store: &Store,
    mut candidates: Vec<Candidate>,
    configurations: &[RecordId],
) -> Result<(), TaskError> {
    if candidates.is_empty() {
        return Ok(());
    }

    for &configuration in configurations {
        let mut errors = Vec::with_capacity(candidates.len());
        for candidate in &candidates {
            let hv = candidate.heuristic_version.id;
            let results = store
                .find::<HeuristicEvaluationResults>(|r| {
                    r.heuristic_version == hv && r.evaluation_config == configuration
                })
                .ok_or(TaskError::Missing {
                    kind: "evaluation results",
                    id: hv,
                })?;
            errors.push(mean_errors(store, results.experiment)?.0);
        }

        let n = errors.len() as f64;
        let sum: f64 = errors.iter().sum();
        let squared_sum: f64 = errors.iter().map(|e| e * e).sum();
        let mean = sum / n;
        let deviation = ((squared_sum - sum * mean) / (n - 1.0)).sqrt();
        if !deviation.is_finite() || deviation == 0.0 {
            return Err(TaskError::Internal(format!(
                "cannot rank {} heuristic versions on the configuration #{configuration}: standard deviation is {deviation}",
                errors.len()
            )));
        }

        for (candidate, error) in candidates.iter_mut().zip(errors) {
            candidate.score += (mean - error) / deviation;
        }
    }

    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    for (index, candidate) in candidates.iter_mut().enumerate() {
        if candidate.modifiable {
            candidate.heuristic_version.rank = Some(index as i64 + 1);
            store.save(&candidate.heuristic_version)?;
        }
    }
    Ok(())
}

impl HeuristicRanker {
    async fn rank_evaluated_heuristics(
        &self,
        cx: &TaskContext,
        job: &mut RankJob,
    ) -> Result<(), TaskError> {
        job.mark_as_running(None, None, None).await?;
        let store = cx.store();

        for mut results in store.all::<HeuristicEvaluationResults>() {
            results.rank = None;
            store.save(&results)?;
            if let Some(mut hv) = store.get::<HeuristicVersion>(results.heuristic_version) {
                hv.rank = None;
                store.save(&hv)?;
            }
        }

        let configurations = evaluation_templates(store);
        let public: Vec<HeuristicVersion> = store
            .filter::<HeuristicVersion>(|hv| hv.public && hv.evaluated)
            .into_iter()
            .filter(|hv| is_latest_public(store, hv))
            .collect();

        for &configuration in &configurations {
            let mut to_rank = Vec::new();
            for hv in &public {
                for results in store.filter::<HeuristicEvaluationResults>(|r| {
                    r.heuristic_version == hv.id && r.evaluation_config == configuration
                }) {
                    to_rank.push(scored(store, results)?);
                }
            }
            to_rank.sort_by(compare);
            for (index, mut scored) in to_rank.into_iter().enumerate() {
                scored.item.rank = Some(index as i64 + 1);
                store.save(&scored.item)?;
            }
        }

        compute_global_ranking(
            store,
            public.iter().cloned().map(|hv| Candidate::new(hv, true)).collect(),
            &configurations,
        )?;

        // The other results are placed among the public ones
        for &configuration in &configurations {
            let ranked = ranked_results(store, configuration)?;
            for results in store.filter::<HeuristicEvaluationResults>(|r| {
                r.evaluation_config == configuration && r.rank.is_none()
            }) {
                if !experiment_done(store, results.experiment) {
                    continue;
                }
                let mut scored = scored(store, results)?;
                scored.item.rank = Some(rank_element(scored.test, scored.train, &ranked));
                store.save(&scored.item)?;
            }
        }

        for hv in store.filter::<HeuristicVersion>(|hv| hv.rank.is_none() && hv.evaluated) {
            let mut candidates: Vec<_> = public
                .iter()
                .cloned()
                .map(|hv| Candidate::new(hv, false))
                .collect();
            candidates.push(Candidate::new(hv, true));
            compute_global_ranking(store, candidates, &configurations)?;
        }

        job.mark_as_done(ExperimentStatus::Done).await?;
        Ok(())
    }

    async fn rank_heuristic_version(
        &self,
        cx: &TaskContext,
        job: &mut RankJob,
    ) -> Result<(), TaskError> {
        let store = cx.store();
        let id = job.command.int(0).unwrap_or_default();
        let Some(mut heuristic_version) = store.get::<HeuristicVersion>(id) else {
            let message = format!("Unknown heuristic version ID: {id}");
            job.log.write(&format!("ERROR - {message}\n"));
            job.mark_as_failed(Some(Alert::new(message))).await?;
            return Ok(());
        };

        let results = store
            .filter::<HeuristicEvaluationResults>(|r| r.heuristic_version == heuristic_version.id);
        heuristic_version.evaluated = results
            .iter()
            .all(|r| experiment_done(store, r.experiment));
        store.save(&heuristic_version)?;

        // A public version changes the ranks of everyone
        if heuristic_version.public {
            return self.rank_evaluated_heuristics(cx, job).await;
        }

        job.mark_as_running(None, Some(heuristic_version.id), None)
            .await?;

        for results in &results {
            if results.rank.is_some() || !experiment_done(store, results.experiment) {
                continue;
            }
            let ranked = ranked_results(store, results.evaluation_config)?;
            let mut scored = scored(store, results.clone())?;
            scored.item.rank = Some(rank_element(scored.test, scored.train, &ranked));
            store.save(&scored.item)?;
        }

        if heuristic_version.evaluated {
            let mut candidates: Vec<_> = store
                .filter::<HeuristicVersion>(|hv| hv.rank.is_some() && hv.public)
                .into_iter()
                .filter(|hv| is_latest_public(store, hv))
                .map(|hv| Candidate::new(hv, false))
                .collect();
            candidates.push(Candidate::new(heuristic_version, true));
            let configurations: Vec<_> = results.iter().map(|r| r.evaluation_config).collect();
            compute_global_ranking(store, candidates, &configurations)?;
        }

        job.mark_as_done(ExperimentStatus::Done).await?;
        Ok(())
    }

    /// Consortium members and the others are ranked separately.
    async fn rank_contest_entries(
        &self,
        cx: &TaskContext,
        job: &mut RankJob,
    ) -> Result<(), TaskError> {
        job.mark_as_running(None, None, None).await?;
        let store = cx.store();
        let contest = job.command.int(0).unwrap_or_default();

        for project_member in [true, false] {
            let mut entries = Vec::new();
            for mut entry in store.filter::<ContestEntry>(|e| {
                e.contest == contest && e.project_member == project_member
            }) {
                let done = store.get::<Experiment>(entry.experiment).is_some_and(|e| {
                    matches!(
                        e.status,
                        ExperimentStatus::Done | ExperimentStatus::DoneWithErrors
                    )
                });
                if !done {
                    continue;
                }
                entry.rank = None;
                store.save(&entry)?;

                let results =
                    store.find::<ClassificationResults>(|r| r.experiment == entry.experiment);
                let error = |e: Option<f64>| e.unwrap_or(f64::INFINITY);
                entries.push(Scored {
                    test: error(results.as_ref().and_then(|r| r.test_error)),
                    train: error(results.as_ref().and_then(|r| r.train_error)),
                    item: entry,
                });
            }

            entries.sort_by(compare);
            for (index, mut scored) in entries.into_iter().enumerate() {
                scored.item.rank = Some(index as i64 + 1);
                store.save(&scored.item)?;
            }
        }
        debug!(contest, "contest entries ranked");

        job.mark_as_done(ExperimentStatus::Done).await?;
        Ok(())
    }
}

#[async_trait]
impl Task for HeuristicRanker {
    type Ext = RankState;

    const NAME: &'static str = "HeuristicRanker";

    fn commands(&self) -> &'static [CommandSpec] {
        COMMANDS
    }

    fn events(&self) -> &'static [CommandSpec] {
        EVENTS
    }

    async fn on_event_received(
        &mut self,
        _cx: &TaskContext,
        jobs: &mut JobList<RankState>,
        event: &Message,
    ) -> Result<Vec<RecordId>, TaskError> {
        if !event.is("EVT_HEURISTIC_EVALUATED") {
            return Ok(Vec::new());
        }
        let command = Message::new("RANK_HEURISTIC_VERSION").arg(event.int(0).unwrap_or_default());
        Ok(vec![jobs.add_job(&command)?])
    }

    async fn step(&mut self, cx: &TaskContext, job: &mut RankJob) -> Result<(), TaskError> {
        if let Some(op) = job.operation {
            match op {}
        }
        match job.command.name.as_str() {
            "RANK_EVALUATED_HEURISTICS" => self.rank_evaluated_heuristics(cx, job).await,
            "RANK_HEURISTIC_VERSION" => self.rank_heuristic_version(cx, job).await,
            "RANK_CONTEST_ENTRIES" => self.rank_contest_entries(cx, job).await,
            other => Err(TaskError::Protocol(format!("unexpected command '{other}'"))),
        }
    }
}
