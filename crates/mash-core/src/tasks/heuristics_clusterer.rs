use std::{
    fs,
    io::{self, Read},
    path::Path,
};

use async_trait::async_trait;
use flate2::read::GzDecoder;
use mash_model::{
    Alert, ClusteringAlgorithm, DataReport, Experiment, ExperimentStatus, HeuristicSignature,
    HeuristicVersion, RecordId, Server, ServerType, SignatureStatus, Store, slugify,
};
use mash_net::Message;
use tracing::info;

use super::farm::{RETRY_DELAY, connect_free_server, describe, fail_with_logs, send, wait_response};
use crate::{
    CommandSpec, Job, JobExt, JobList, ParamType, Task, TaskContext, TaskError, utils::LockFile,
};

const COMMANDS: &[CommandSpec] = &[CommandSpec::new("CLUSTER_HEURISTICS", &[ParamType::Str])];

const EVENTS: &[CommandSpec] = &[CommandSpec::new(
    "EVT_HEURISTIC_SIGNATURE_RECORDED",
    &[ParamType::Int],
)];

const SIGNATURE_FILE: &str = "predictor.data";

/// Sends the recorded signatures of the heuristics to the Clustering Server
/// of an algorithm and publishes the results for the website.
#[derive(Debug, Default)]
pub struct HeuristicsClusterer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    SendNextSignature,
    PerformClustering,
    ProcessClusteringResults,
}

#[derive(Debug, Default)]
pub struct ClusterState {
    pending: Vec<SignatureStatus>,
    sent: Vec<SignatureStatus>,
}

impl JobExt for ClusterState {
    type Operation = Op;
}

type ClusterJob = Job<ClusterState>;

fn cluster(algorithm: &str) -> Message {
    Message::new("CLUSTER_HEURISTICS").arg(algorithm)
}

fn signature_done(store: &Store, signature: RecordId) -> bool {
    store
        .get::<HeuristicSignature>(signature)
        .and_then(|s| store.get::<Experiment>(s.experiment))
        .is_some_and(|e| e.status == ExperimentStatus::Done)
}

fn unprocessed(store: &Store, algorithm: RecordId) -> Vec<SignatureStatus> {
    store.filter::<SignatureStatus>(|s| {
        s.algorithm == algorithm && !s.processed && signature_done(store, s.signature)
    })
}

/// `author/name/version` of the heuristic a signature was recorded for.
fn signature_name(store: &Store, status: &SignatureStatus) -> String {
    store
        .get::<HeuristicSignature>(status.signature)
        .and_then(|s| store.get::<HeuristicVersion>(s.heuristic_version))
        .map_or_else(
            || format!("signature #{}", status.signature),
            |hv| hv.absolutename(),
        )
}

/// The signature file of a data report archive.
fn read_signature(report: &Path) -> io::Result<Vec<u8>> {
    let mut archive = tar::Archive::new(GzDecoder::new(fs::File::open(report)?));
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.as_ref() == Path::new(SIGNATURE_FILE) {
            let mut content = Vec::new();
            entry.read_to_end(&mut content)?;
            return Ok(content);
        }
    }
    Err(io::Error::new(
        io::ErrorKind::NotFound,
        format!("no '{SIGNATURE_FILE}' in {}", report.display()),
    ))
}

impl HeuristicsClusterer {
    async fn process(&self, cx: &TaskContext, job: &mut ClusterJob) -> Result<(), TaskError> {
        job.mark_as_running(None, None, None).await?;
        let store = cx.store();
        let name = job.command.text(0).unwrap_or_default();

        let Some(algorithm) = store.find::<ClusteringAlgorithm>(|a| a.name == name) else {
            job.mark_as_done(ExperimentStatus::Done).await?;
            return Ok(());
        };

        for signature in store.all::<HeuristicSignature>() {
            let known = store.count::<SignatureStatus>(|s| {
                s.signature == signature.id && s.algorithm == algorithm.id
            }) > 0;
            if !known && signature_done(store, signature.id) {
                store.insert(SignatureStatus {
                    algorithm: algorithm.id,
                    signature: signature.id,
                    ..Default::default()
                })?;
            }
        }

        let pending = unprocessed(store, algorithm.id);
        if pending.is_empty() {
            job.mark_as_done(ExperimentStatus::Done).await?;
            return Ok(());
        }

        job.log.write(&format!(
            "Searching a free Clustering Server with the algorithm '{name}'...\n"
        ));
        let candidates = store.filter::<Server>(|s| {
            s.server_type == ServerType::Clustering
                && s.clustering_algorithm.as_deref() == Some(name.as_str())
        });
        let Some(server) = connect_free_server(cx, job, candidates, "Clustering Server").await
        else {
            job.log.write("Failed to find a free Clustering Server\n");
            job.mark_as_delayed(RETRY_DELAY).await?;
            return Ok(());
        };
        job.mark_as_running(Some(server.id), None, None).await?;

        job.ext = ClusterState {
            pending,
            sent: Vec::new(),
        };
        self.send_next_signature(cx, job).await
    }

    /// The server acknowledges each signature with `OK`.
    async fn check_acknowledgement(
        &self,
        cx: &TaskContext,
        job: &mut ClusterJob,
    ) -> Result<bool, TaskError> {
        let response = wait_response(job).await;
        if response.as_ref().is_some_and(|r| r.is("OK")) {
            return Ok(true);
        }
        let signature = job
            .ext
            .sent
            .last()
            .map(|s| signature_name(cx.store(), s))
            .unwrap_or_default();
        let alert = Alert::new("Failed to send a signature").with_details(format!(
            "Signature: {signature}\nResponse: {}",
            describe(response.as_ref())
        ));
        fail_with_logs(cx, job, alert).await?;
        Ok(false)
    }

    async fn send_next_signature(
        &self,
        cx: &TaskContext,
        job: &mut ClusterJob,
    ) -> Result<(), TaskError> {
        if !job.ext.sent.is_empty() && !self.check_acknowledgement(cx, job).await? {
            return Ok(());
        }
        if job.ext.pending.is_empty() {
            return Err(TaskError::Internal("no signature left to send".to_string()));
        }

        let store = cx.store();
        let status = job.ext.pending.remove(0);
        let name = signature_name(store, &status);
        job.ext.sent.push(status.clone());
        job.log
            .write(&format!("Send the signature of heuristic '{name}'...\n"));

        let report = store
            .get::<HeuristicSignature>(status.signature)
            .and_then(|s| store.find::<DataReport>(|r| r.experiment == s.experiment));
        let content = match report
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no data report"))
            .and_then(|r| read_signature(&cx.config().data_reports_root.join(&r.filename)))
        {
            Ok(content) => content,
            Err(e) => {
                let message = format!("Failed to extract the signature of '{name}'");
                job.log.write(&format!("ERROR - {message}\n        {e}\n"));
                job.mark_as_failed(Some(Alert::new(message).with_details(e.to_string())))
                    .await?;
                return Ok(());
            }
        };

        let command = Message::new("ADD_SIGNATURE")
            .arg(slugify(&name))
            .arg(content.len());
        if !send(job, &command).await {
            let alert = Alert::new(format!(
                "Failed to tell the server about the signature of '{name}'"
            ));
            return fail_with_logs(cx, job, alert).await;
        }
        let sent = match job.client.as_mut() {
            Some(client) => client.send_data(&content).await.is_ok(),
            None => false,
        };
        if !sent {
            let alert = Alert::new(format!(
                "Failed to send the signature of '{name}' to the server"
            ));
            return fail_with_logs(cx, job, alert).await;
        }

        job.operation = Some(if job.ext.pending.is_empty() {
            Op::PerformClustering
        } else {
            Op::SendNextSignature
        });
        Ok(())
    }

    async fn perform_clustering(
        &self,
        cx: &TaskContext,
        job: &mut ClusterJob,
    ) -> Result<(), TaskError> {
        if !self.check_acknowledgement(cx, job).await? {
            return Ok(());
        }
        job.log.write("All signatures correctly sent\n");

        if !send(job, &Message::new("CLUSTER")).await {
            let alert = Alert::new("Failed to tell the server to perform the clustering");
            return fail_with_logs(cx, job, alert).await;
        }
        job.operation = Some(Op::ProcessClusteringResults);
        Ok(())
    }

    async fn process_clustering_results(
        &self,
        cx: &TaskContext,
        job: &mut ClusterJob,
    ) -> Result<(), TaskError> {
        let response = wait_response(job).await;
        let size = match &response {
            Some(r) if r.is("RESULTS") => r.int(0).unwrap_or_default().max(0) as usize,
            other => {
                let alert = Alert::new("Failed to perform the clustering")
                    .with_details(format!("Response: {}", describe(other.as_ref())));
                return fail_with_logs(cx, job, alert).await;
            }
        };

        job.log
            .write("Clustering done, retrieving the results...\n");
        let content = match job.client.as_mut() {
            Some(client) => client.wait_data(size).await,
            None => None,
        };
        let Some(content) = content else {
            let alert = Alert::new("Failed to retrieve the results of the clustering")
                .with_details(format!("Response: {}", describe(response.as_ref())));
            return fail_with_logs(cx, job, alert).await;
        };

        if let Some(mut client) = job.client.take() {
            let _ = client.send_command(&Message::new("DONE")).await;
            client.close();
        }

        let store = cx.store();
        for status in &mut job.ext.sent {
            status.processed = true;
            store.save(status)?;
        }

        let name = job.command.text(0).unwrap_or_default();
        let snippets = &cx.config().snippets_root;
        let folder = snippets.join("clustering");
        tokio::fs::create_dir_all(&folder).await?;
        let temporary = folder.join(format!("{name}.dat.tmp"));
        tokio::fs::write(&temporary, content).await?;
        {
            let _lock = LockFile::acquire(&snippets.join("snippets.lock")).await?;
            tokio::fs::rename(&temporary, folder.join(format!("{name}.dat"))).await?;
        }
        info!(algorithm = %name, signatures = job.ext.sent.len(), "clustering results published");

        job.mark_as_done(ExperimentStatus::Done).await?;

        // Signatures recorded meanwhile need another run
        if let Some(algorithm) = store.find::<ClusteringAlgorithm>(|a| a.name == name)
            && !unprocessed(store, algorithm.id).is_empty()
        {
            cx.send_event(&cluster(&name));
        }
        Ok(())
    }
}

#[async_trait]
impl Task for HeuristicsClusterer {
    type Ext = ClusterState;

    const NAME: &'static str = "HeuristicsClusterer";

    fn commands(&self) -> &'static [CommandSpec] {
        COMMANDS
    }

    fn events(&self) -> &'static [CommandSpec] {
        EVENTS
    }

    async fn on_startup(
        &mut self,
        cx: &TaskContext,
        jobs: &mut JobList<ClusterState>,
    ) -> Result<(), TaskError> {
        let store = cx.store();
        let signatures = store
            .all::<HeuristicSignature>()
            .into_iter()
            .filter(|s| signature_done(store, s.id))
            .count();
        for algorithm in store.all::<ClusteringAlgorithm>() {
            let processed = store.count::<SignatureStatus>(|s| {
                s.algorithm == algorithm.id && s.processed && signature_done(store, s.signature)
            });
            if signatures > processed {
                jobs.add_job(&cluster(&algorithm.name))?;
            }
        }
        Ok(())
    }

    /// A clustering already queued for the algorithm covers the new request.
    async fn on_command_received(
        &mut self,
        _cx: &TaskContext,
        jobs: &mut JobList<ClusterState>,
        command: &Message,
    ) -> Result<bool, TaskError> {
        Ok(jobs.has_job(command))
    }

    async fn on_event_received(
        &mut self,
        cx: &TaskContext,
        jobs: &mut JobList<ClusterState>,
        event: &Message,
    ) -> Result<Vec<RecordId>, TaskError> {
        if !jobs.is_empty() || !event.is("EVT_HEURISTIC_SIGNATURE_RECORDED") {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for algorithm in cx.store().all::<ClusteringAlgorithm>() {
            ids.push(jobs.add_job(&cluster(&algorithm.name))?);
        }
        Ok(ids)
    }

    async fn step(&mut self, cx: &TaskContext, job: &mut ClusterJob) -> Result<(), TaskError> {
        match job.operation {
            None => self.process(cx, job).await,
            Some(Op::SendNextSignature) => self.send_next_signature(cx, job).await,
            Some(Op::PerformClustering) => self.perform_clustering(cx, job).await,
            Some(Op::ProcessClusteringResults) => self.process_clustering_results(cx, job).await,
        }
    }
}
