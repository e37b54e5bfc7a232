use std::{fs, sync::Arc};

use async_trait::async_trait;
use futures::future::select_all;
use mash_model::{Alert, JobStatus, LogEntry, RecordId};
use mash_net::{
    Message,
    channel::{self, ChannelKind, Endpoint},
};
use mash_observe::OutStream;
use time::{Duration, OffsetDateTime};
use tracing::{debug, error, instrument, warn};

use super::{CommandSpec, ScheduledTask, Services, Task, TaskContext};
use crate::{
    JobList, TaskError,
    jobs::{Job, JobEnv},
    utils::save_log_file,
};

/// Log files larger than this are truncated in alert mails.
const MAIL_LOG_LIMIT: usize = 10 * 1024;

/// Drives the jobs of one [`Task`].
pub struct TaskEngine<T: Task> {
    task: T,
    jobs: JobList<T::Ext>,
    new_jobs: Vec<RecordId>,
    cx: TaskContext,
    events: Endpoint,
    nb_max_jobs: usize,
    log_started: OffsetDateTime,
}

impl<T: Task> TaskEngine<T> {
    pub fn new(task: T, services: Services) -> Self {
        let (writer, reader) = channel::create(ChannelKind::Simplex);

        let name = format!("Task {}", T::NAME);
        let log = match services.config.task_log_template(T::NAME) {
            Some(template) => {
                let log = OutStream::default();
                match log.open(&name, &template) {
                    Ok(()) => log,
                    Err(e) => {
                        warn!(task = T::NAME, error = %e, "cannot open the task log, keeping it in memory");
                        OutStream::memory(name)
                    }
                }
            }
            None => OutStream::memory(name),
        };

        let env = Arc::new(JobEnv {
            store: services.store.clone(),
            config: services.config.clone(),
            task: T::NAME,
        });

        Self {
            task,
            jobs: JobList::new(env),
            new_jobs: Vec::new(),
            nb_max_jobs: services.config.nb_max_jobs,
            cx: TaskContext::new(services, writer, log),
            events: reader,
            log_started: OffsetDateTime::now_utc(),
        }
    }

    pub fn with_max_jobs(mut self, nb_max_jobs: usize) -> Self {
        self.nb_max_jobs = nb_max_jobs;
        self
    }

    pub fn task(&self) -> &T {
        &self.task
    }

    pub fn jobs(&self) -> &JobList<T::Ext> {
        &self.jobs
    }

    pub fn context(&self) -> &TaskContext {
        &self.cx
    }

    /// Start or continue a job. Returns its status afterwards, `None` when
    /// it was dropped after an internal error.
    async fn process_job(&mut self, id: RecordId) -> Option<JobStatus> {
        let running = self.jobs.count(Some(JobStatus::Running));
        let job = self.jobs.get_mut(id)?;
        if job.status() != JobStatus::Running && running >= self.nb_max_jobs {
            return Some(job.status());
        }

        let log = self.cx.log();
        log.write(&format!("Processing of the job #{id}: '{}'\n", job.command));
        let operation = job
            .operation
            .map_or_else(|| "process".to_string(), |op| format!("{op:?}"));
        log.write(&format!("    Current operation: '{operation}'\n"));
        job.log
            .write(&format!("Current operation: '{operation}'\n"));

        if let Err(e) = self.task.step(&self.cx, job).await {
            self.on_step_error(id, e).await;
            return None;
        }

        let status = job.status();
        match status {
            JobStatus::Scheduled => {
                log.write("Result: the job is still scheduled\n");
                self.jobs.reschedule(id);
            }
            JobStatus::Running => log.write("Result: the job is still running\n"),
            JobStatus::Delayed => log.write(&format!(
                "Result: the job was delayed for {} seconds\n",
                job.timeout.unwrap_or_default()
            )),
            JobStatus::Done => {
                log.write("Result: the job is done\n");
                self.jobs.remove(id);
            }
            JobStatus::Cancelled => {
                log.write("Result: the job was cancelled\n");
                self.jobs.remove(id);
            }
            JobStatus::Failed => {
                log.write("Result: the job has failed\n");
                if let Some(job) = self.jobs.remove(id) {
                    self.report_failure(job).await;
                }
            }
        }
        Some(status)
    }

    async fn on_step_error(&mut self, id: RecordId, e: TaskError) {
        error!(task = T::NAME, job = id, error = %e, "exception during the processing of a job");
        self.cx.log().write(&format!(
            "Exception during the processing of the job:\n{e}\n"
        ));

        let Some(mut job) = self.jobs.remove(id) else {
            return;
        };
        let alert = Alert::new("Exception during the processing of the job")
            .with_details(e.to_string());
        if let Err(store_err) = job.mark_as_failed(Some(alert)).await {
            error!(task = T::NAME, job = id, error = %store_err, "cannot mark the job as failed");
        }

        let body = format!("Job ID: {id}\nCommand: {}\n\n{e}", job.command);
        self.cx
            .mail_admins("[MASH ALERT] Exception during the processing of a job", &body)
            .await;
    }

    /// Save the task log with the server logs of the job and mail the
    /// administrators about its alert.
    async fn report_failure(&self, job: Job<T::Ext>) {
        let Some(alert) = job.alert.as_ref() else {
            return;
        };
        let store = self.cx.store();
        let root = &self.cx.config().log_files_root;

        let mut entry = job.record.logs.and_then(|id| store.get::<LogEntry>(id));
        if let Some(entry) = entry.as_mut() {
            let content = self.cx.log().dump(0).unwrap_or_default();
            if let Err(e) = save_log_file(
                store,
                root,
                entry,
                &format!("{}.log", T::NAME),
                content.as_bytes(),
            ) {
                warn!(task = T::NAME, job = job.id(), error = %e, "cannot save the task log");
            }
        }

        if job.mail_sent {
            return;
        }

        let website = &self.cx.config().website_url;
        let mut body = String::new();
        if let Some(details) = &alert.details {
            body.push_str(details);
            body.push_str("\n\n");
        }
        body.push_str(&format!("Job ID: {}\nCommand: {}\n", job.id(), job.command));
        if let Some(hv) = job.record.heuristic_version {
            body.push_str(&format!("Heuristic version: {website}/heuristics/v{hv}/\n"));
        }
        if let Some(exp) = job.record.experiment {
            body.push_str(&format!("Experiment: {website}/experiments/{exp}/\n"));
        }
        if let Some(entry) = &entry {
            for file in &entry.files {
                let Ok(content) = fs::read(root.join(&entry.folder).join(file)) else {
                    continue;
                };
                body.push_str("\n\n");
                body.push_str(&"-".repeat(80));
                body.push('\n');
                body.push_str(file);
                if content.len() > MAIL_LOG_LIMIT {
                    body.push_str(" (truncated)\n\n...\n");
                    body.push_str(&String::from_utf8_lossy(
                        &content[content.len() - MAIL_LOG_LIMIT..],
                    ));
                } else {
                    body.push_str("\n\n");
                    body.push_str(&String::from_utf8_lossy(&content));
                }
            }
        }

        self.cx
            .mail_admins(&format!("[MASH ALERT] {}", alert.message), &body)
            .await;
    }

    fn rotate_log_if_needed(&mut self) {
        let now = OffsetDateTime::now_utc();
        if now <= self.log_started + Duration::days(1) {
            return;
        }
        self.log_started = now;
        let log = self.cx.log();
        log.write("----------------------------------------------------------------\n");
        log.write("Opening a new log file...\n");
        if let Err(e) = log.reopen() {
            warn!(task = T::NAME, error = %e, "cannot rotate the task log");
        }
    }

    fn lookup(&self, name: &str) -> Option<(CommandSpec, bool)> {
        if let Some(spec) = self.task.commands().iter().find(|c| c.name == name) {
            return Some((*spec, true));
        }
        self.task
            .events()
            .iter()
            .find(|c| c.name == name)
            .map(|spec| (*spec, false))
    }

    async fn prepare(&mut self, message: &Message, is_command: bool) -> Result<(), TaskError> {
        let log = self.cx.log();
        if is_command {
            log.write(&format!("Got command: {message}\n"));
            log.write("Trying task-specific handling...\n");
            let known = self.jobs.get_jobs(None, None);
            if self
                .task
                .on_command_received(&self.cx, &mut self.jobs, message)
                .await?
            {
                // Jobs the handler queued itself start like new ones.
                self.new_jobs.extend(
                    self.jobs
                        .get_jobs(Some(JobStatus::Scheduled), None)
                        .into_iter()
                        .filter(|id| !known.contains(id)),
                );
            } else {
                log.write("Add a job in the list...\n");
                let id = self.jobs.add_job(message)?;
                self.new_jobs.push(id);
            }
        } else {
            log.write(&format!("Got event: {message}\n"));
            let ids = self
                .task
                .on_event_received(&self.cx, &mut self.jobs, message)
                .await?;
            self.new_jobs.extend(ids);
        }
        Ok(())
    }

    /// Step a running job while its server has answered.
    async fn pump(&mut self, id: RecordId) -> bool {
        let Some(client) = self.jobs.get_mut(id).and_then(|j| j.client.as_mut()) else {
            return false;
        };
        client.fill_nonblocking();
        if !(client.has_response() || client.at_eof() || !client.is_connected()) {
            return false;
        }

        loop {
            match self.process_job(id).await {
                None | Some(JobStatus::Done) | Some(JobStatus::Failed) => return true,
                Some(JobStatus::Running) => {}
                Some(_) => return false,
            }
            let more = self
                .jobs
                .get(id)
                .and_then(|j| j.client.as_ref())
                .is_some_and(|c| c.has_response());
            if !more {
                return false;
            }
        }
    }
}

#[async_trait]
impl<T: Task> ScheduledTask for TaskEngine<T> {
    fn name(&self) -> &'static str {
        T::NAME
    }

    fn commands(&self) -> &'static [CommandSpec] {
        self.task.commands()
    }

    fn events(&self) -> &'static [CommandSpec] {
        self.task.events()
    }

    #[instrument(level = "debug", skip(self), fields(task = T::NAME))]
    async fn start(&mut self) {
        self.cx.log().write("Start the processing...\n");
        if let Err(e) = self.task.on_startup(&self.cx, &mut self.jobs).await {
            error!(task = T::NAME, error = %e, "start-up failed");
            self.cx
                .log()
                .write(&format!("ERROR - Start-up failed: {e}\n"));
        }

        for id in self.jobs.get_jobs(Some(JobStatus::Scheduled), None) {
            self.process_job(id).await;
        }
    }

    async fn stop(&mut self) {
        for job in self
            .jobs
            .iter_mut()
            .filter(|j| j.status() == JobStatus::Running)
        {
            if let Err(e) = job.mark_as_scheduled().await {
                error!(task = T::NAME, job = job.id(), error = %e, "cannot reschedule the job");
            }
        }
        self.cx.log().close();
    }

    fn timeout(&self) -> Option<i64> {
        self.jobs.next_timeout().or_else(|| {
            (self.jobs.count(Some(JobStatus::Scheduled)) > 0).then_some(60)
        })
    }

    async fn wait_readable(&self) {
        let running = || {
            self.jobs
                .iter()
                .filter(|j| j.status() == JobStatus::Running)
                .filter_map(|j| j.client.as_ref())
        };
        if running().any(|c| c.has_response()) {
            return;
        }

        let waits: Vec<_> = running()
            .filter_map(|c| c.socket())
            .map(|socket| Box::pin(socket.readable()))
            .collect();
        if waits.is_empty() {
            return std::future::pending().await;
        }
        let _ = select_all(waits).await;
    }

    async fn on_event(&mut self, elapsed: i64) {
        self.rotate_log_if_needed();

        if elapsed > 0 {
            match self.jobs.update_timeouts(elapsed).await {
                Ok(expired) => {
                    for (index, id) in expired.into_iter().enumerate() {
                        if index == 0 {
                            self.cx.log().write("Timeout!\n");
                        }
                        self.process_job(id).await;
                    }
                }
                Err(e) => error!(task = T::NAME, error = %e, "cannot update the delayed jobs"),
            }
        }

        let mut nb_done = 0;
        let running: Vec<_> = self
            .jobs
            .iter()
            .filter(|j| j.status() == JobStatus::Running && j.client.is_some())
            .map(|j| j.id())
            .collect();
        for id in running {
            if self.pump(id).await {
                nb_done += 1;
            }
        }

        // Start as many new jobs as just finished. An idle task starts as
        // many as it may run.
        let budget = if nb_done > 0 {
            nb_done
        } else if self.jobs.count(Some(JobStatus::Running)) == 0 {
            self.nb_max_jobs
        } else {
            0
        };
        let mut started = 0;
        for id in self.jobs.get_jobs(Some(JobStatus::Scheduled), None) {
            if started >= budget {
                break;
            }
            if self.process_job(id).await == Some(JobStatus::Running) {
                started += 1;
            }
        }
    }

    async fn process_message(&mut self, message: &Message) -> bool {
        let Some((spec, is_command)) = self.lookup(&message.name) else {
            return false;
        };

        if spec.arity() != message.params.len() {
            self.cx.log().write(&format!(
                "ERROR: Invalid number of arguments, expected {}, got message: {message}\n",
                spec.arity()
            ));
            return false;
        }
        let Some(message) = spec.coerce(message) else {
            self.cx.log().write(&format!(
                "ERROR: Invalid type of arguments, expected '{:?}', got message: {message}\n",
                spec.params
            ));
            return false;
        };

        if let Err(e) = self.prepare(&message, is_command).await {
            error!(task = T::NAME, message = %message, error = %e, "exception during the preparation of a job");
            self.cx.log().write(&format!(
                "Exception during the preparation of a job:\n{e}\n"
            ));
            self.cx
                .mail_admins(
                    "[MASH ALERT] Exception during the preparation of a job",
                    &format!("Message: {message}\n\n{e}"),
                )
                .await;
        }
        true
    }

    async fn process_new_jobs(&mut self) {
        let new_jobs = std::mem::take(&mut self.new_jobs);
        if !new_jobs.is_empty() {
            debug!(task = T::NAME, count = new_jobs.len(), "processing new jobs");
        }
        for id in new_jobs {
            self.process_job(id).await;
        }
    }

    fn has_pending_events(&self) -> bool {
        self.events.has_pending()
    }

    async fn take_events(&mut self) -> Vec<Message> {
        let mut events = Vec::new();
        while let Some(event) = self.events.wait_message(false).await {
            events.push(event);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use mash_model::{ExperimentStatus, JobRecord, Store};

    use super::*;
    use crate::{JobExt, MemoryMailer, ParamType, SchedulerConfig};

    const COMMANDS: &[CommandSpec] = &[
        CommandSpec::new("HOLD", &[ParamType::Int]),
        CommandSpec::new("BREAK", &[ParamType::Int]),
    ];

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Step {
        Finish,
    }

    #[derive(Debug, Default)]
    struct HoldState;

    impl JobExt for HoldState {
        type Operation = Step;
    }

    /// `HOLD` runs until stepped a second time, `BREAK` fails its first step.
    #[derive(Default)]
    struct Hold;

    #[async_trait]
    impl Task for Hold {
        type Ext = HoldState;

        const NAME: &'static str = "Hold";

        fn commands(&self) -> &'static [CommandSpec] {
            COMMANDS
        }

        async fn step(&mut self, _cx: &TaskContext, job: &mut Job<HoldState>) -> Result<(), TaskError> {
            if job.command.is("BREAK") {
                return Err(TaskError::Internal("broken step".into()));
            }
            match job.operation {
                None => {
                    job.mark_as_running(None, None, None).await?;
                    job.operation = Some(Step::Finish);
                }
                Some(Step::Finish) => job.mark_as_done(ExperimentStatus::Done).await?,
            }
            Ok(())
        }
    }

    fn engine(store: &Store, mailer: Arc<MemoryMailer>) -> TaskEngine<Hold> {
        let services = Services::new(store.clone(), SchedulerConfig::default(), mailer);
        TaskEngine::new(Hold, services)
    }

    #[tokio::test]
    async fn scheduled_jobs_wait_below_the_ceiling() {
        let store = Store::new();
        let mut engine = engine(&store, Arc::new(MemoryMailer::new())).with_max_jobs(1);

        assert!(engine.process_message(&Message::new("HOLD").arg(1)).await);
        assert!(engine.process_message(&Message::new("HOLD").arg(2)).await);
        engine.process_new_jobs().await;

        let running = engine.jobs().get_jobs(Some(JobStatus::Running), None);
        assert_eq!(running.len(), 1);
        assert_eq!(engine.jobs().count(Some(JobStatus::Scheduled)), 1);

        // The first job finishes, the idle engine starts the second one
        assert_eq!(engine.process_job(running[0]).await, Some(JobStatus::Done));
        engine.on_event(0).await;
        assert_eq!(engine.jobs().count(None), 1);
        assert_eq!(engine.jobs().count(Some(JobStatus::Running)), 1);
        assert_ne!(
            engine.jobs().get_jobs(Some(JobStatus::Running), None),
            running
        );
    }

    #[tokio::test]
    async fn failing_step_fails_the_job_and_mails_the_admins() {
        let store = Store::new();
        let mailer = Arc::new(MemoryMailer::new());
        let mut engine = engine(&store, mailer.clone());

        assert!(engine.process_message(&Message::new("BREAK").arg(1)).await);
        engine.process_new_jobs().await;

        assert!(engine.jobs().is_empty());
        let record = store.all::<JobRecord>().pop().unwrap();
        assert_eq!(record.status, JobStatus::Failed);

        let alert = store.all::<Alert>().pop().unwrap();
        assert_eq!(alert.message, "Exception during the processing of the job");
        assert_eq!(alert.details.as_deref(), Some("broken step"));
        assert_eq!(alert.job, Some(record.id));

        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].0,
            "[MASH ALERT] Exception during the processing of a job"
        );
        assert!(sent[0].1.ends_with("broken step"));
    }
}
