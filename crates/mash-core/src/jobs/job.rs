use std::{fmt, sync::Arc};

use mash_model::{
    Alert, Experiment, ExperimentStatus, JobRecord, JobStatus, LogEntry, RecordId, Store,
    StoreError,
};
use mash_net::{Client, Message};
use mash_observe::{OutStream, log_transition};
use tracing::warn;

use crate::{SchedulerConfig, utils::save_log_file};

/// Size of the job log saved with the server logs of a failed job.
const FAILED_LOG_DUMP: usize = 200 * 1024;

/// Per-task state carried by each job.
pub trait JobExt: Default + Send + Sync + 'static {
    /// Protocol step waiting for the next response of the job's server.
    type Operation: Copy + fmt::Debug + PartialEq + Send + Sync + 'static;
}

/// What the jobs of one task share.
pub(crate) struct JobEnv {
    pub store: Store,
    pub config: Arc<SchedulerConfig>,
    pub task: &'static str,
}

pub struct Job<X: JobExt> {
    pub record: JobRecord,
    pub command: Message,
    /// Seconds left before a delayed job is scheduled again.
    pub timeout: Option<i64>,
    pub client: Option<Client>,
    /// `None` means the job starts from the task's entry point.
    pub operation: Option<X::Operation>,
    /// Alert attached by the last failure.
    pub alert: Option<Alert>,
    pub mail_sent: bool,
    pub log: OutStream,
    pub ext: X,
    env: Arc<JobEnv>,
}

impl<X: JobExt> fmt::Debug for Job<X> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.record.id)
            .field("command", &self.record.command)
            .field("status", &self.record.status)
            .field("operation", &self.operation)
            .finish()
    }
}

impl<X: JobExt> Job<X> {
    pub(crate) fn new(record: JobRecord, env: Arc<JobEnv>) -> Self {
        Self {
            command: Message::decode(&record.command),
            record,
            timeout: None,
            client: None,
            operation: None,
            alert: None,
            mail_sent: false,
            log: OutStream::default(),
            ext: X::default(),
            env,
        }
    }

    #[inline]
    pub fn id(&self) -> RecordId {
        self.record.id
    }

    #[inline]
    pub fn status(&self) -> JobStatus {
        self.record.status
    }

    pub fn store(&self) -> &Store {
        &self.env.store
    }

    /// A client bound to the job log, honouring the response timeout.
    pub fn new_client(&self) -> Client {
        Client::new(Some(self.log.clone())).with_timeout(self.env.config.response_timeout())
    }

    pub async fn mark_as_scheduled(&mut self) -> Result<(), StoreError> {
        self.persist(JobStatus::Scheduled)?;
        self.mirror(ExperimentStatus::Scheduled, true)?;
        self.timeout = None;
        self.operation = None;
        self.release().await;
        Ok(())
    }

    /// Link the job to what it works on and open its log.
    pub async fn mark_as_running(
        &mut self,
        server: Option<RecordId>,
        heuristic_version: Option<RecordId>,
        experiment: Option<RecordId>,
    ) -> Result<(), StoreError> {
        self.record.status = JobStatus::Running;
        self.record.server = server;
        self.record.heuristic_version = heuristic_version;
        self.record.experiment = experiment;
        self.env.store.save(&self.record)?;
        log_transition(self.env.task, self.id(), JobStatus::Running);

        self.mirror(ExperimentStatus::Running, false)?;
        self.timeout = None;

        let name = format!("Job {}", self.id());
        self.log = match self.env.config.job_log_template(self.env.task, self.id()) {
            Some(template) => {
                let log = OutStream::default();
                if let Err(e) = log.open(&name, &template) {
                    warn!(job = self.id(), error = %e, "cannot open the job log, keeping it in memory");
                    OutStream::memory(name)
                } else {
                    log
                }
            }
            None => OutStream::memory(name),
        };
        self.log
            .write(&format!("Executing command: {}\n", self.record.command));
        Ok(())
    }

    /// `experiment_status` is what the experiment of the job becomes.
    pub async fn mark_as_done(
        &mut self,
        experiment_status: ExperimentStatus,
    ) -> Result<(), StoreError> {
        self.persist(JobStatus::Done)?;
        self.mirror(experiment_status, true)?;
        self.operation = None;
        self.release().await;
        Ok(())
    }

    /// The alert is stored, linked to the job. When server logs were
    /// collected, the job log is saved next to them.
    pub async fn mark_as_failed(&mut self, alert: Option<Alert>) -> Result<(), StoreError> {
        self.persist(JobStatus::Failed)?;
        self.mirror(ExperimentStatus::Failed, true)?;
        self.operation = None;

        if let Some(mut alert) = alert {
            alert.job = Some(self.id());
            self.alert = Some(self.env.store.insert(alert)?);
        }

        if let Some(mut client) = self.client.take() {
            let _ = client.send_command(&Message::new("DONE")).await;
            client.close();
        }

        if let Some(mut entry) = self.record.logs.and_then(|id| self.env.store.get::<LogEntry>(id))
            && let Some(content) = self.log.dump(FAILED_LOG_DUMP)
            && let Err(e) = save_log_file(
                &self.env.store,
                &self.env.config.log_files_root,
                &mut entry,
                "Job.log",
                content.as_bytes(),
            )
        {
            warn!(job = self.id(), error = %e, "cannot save the job log");
        }

        self.log.delete();
        self.log = OutStream::default();
        Ok(())
    }

    pub async fn mark_as_cancelled(&mut self) -> Result<(), StoreError> {
        self.persist(JobStatus::Cancelled)?;
        self.mirror(ExperimentStatus::Failed, true)?;
        self.operation = None;
        self.release().await;
        Ok(())
    }

    /// Park the job for `delay` seconds.
    pub async fn mark_as_delayed(&mut self, delay: i64) -> Result<(), StoreError> {
        self.persist(JobStatus::Delayed)?;
        self.mirror(ExperimentStatus::Scheduled, true)?;
        self.timeout = Some(delay);
        self.operation = None;
        self.release().await;
        Ok(())
    }

    fn persist(&mut self, status: JobStatus) -> Result<(), StoreError> {
        self.record.status = status;
        self.record.server = None;
        self.env.store.save(&self.record)?;
        log_transition(self.env.task, self.id(), status);
        Ok(())
    }

    fn mirror(
        &self,
        status: ExperimentStatus,
        clear_notifications: bool,
    ) -> Result<(), StoreError> {
        let Some(id) = self.record.experiment else {
            return Ok(());
        };
        let Some(mut experiment) = self.env.store.get::<Experiment>(id) else {
            return Ok(());
        };
        experiment.status = status;
        self.env.store.save(&experiment)?;
        if clear_notifications {
            self.env.store.delete_notifications(id)?;
        }
        Ok(())
    }

    async fn release(&mut self) {
        if let Some(mut client) = self.client.take() {
            let _ = client.send_command(&Message::new("DONE")).await;
            client.close();
        }
        self.log.delete();
        self.log = OutStream::default();
    }
}
