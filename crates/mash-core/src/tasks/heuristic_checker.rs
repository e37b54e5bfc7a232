use std::path::Path;

use async_trait::async_trait;
use mash_model::{
    Alert, ExperimentStatus, HeuristicStatus, HeuristicTestStatus, HeuristicVersion,
    PluginErrorReport, PluginErrorType, Server, ServerType, TestPhase,
};
use mash_net::Message;
use tokio::fs;
use tracing::{info, warn};

use super::farm::{
    RETRY_DELAY, connect_free_server, describe, fail_with_logs, now, send, wait_response,
};
use crate::{
    CommandSpec, Job, JobExt, JobList, ParamType, Task, TaskContext, TaskError, utils::LockFile,
};

const COMMANDS: &[CommandSpec] = &[CommandSpec::new("CHECK_HEURISTIC", &[ParamType::Int])];

/// Compiles, analyzes and tests an uploaded heuristic version on a
/// Compilation Server, then moves its source into the heuristics repository.
#[derive(Debug, Default)]
pub struct HeuristicChecker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    StartHeuristicCheck,
    ProcessCompilationResult,
    ProcessAnalysisResult,
    ProcessTestResult,
}

#[derive(Debug, Default)]
pub struct CheckState {
    heuristic_version: HeuristicVersion,
    test_status: HeuristicTestStatus,
}

impl JobExt for CheckState {
    type Operation = Op;
}

type CheckJob = Job<CheckState>;

fn check_heuristic(heuristic_version: i64) -> Message {
    Message::new("CHECK_HEURISTIC").arg(heuristic_version)
}

impl HeuristicChecker {
    fn update_status(
        &self,
        cx: &TaskContext,
        job: &mut CheckJob,
        phase: TestPhase,
    ) -> Result<(), TaskError> {
        job.ext.test_status.phase = phase;
        cx.store().save(&job.ext.test_status)?;
        Ok(())
    }

    /// Record the error in the test status and fail the job. The heuristic
    /// version is disabled when `disable` is set.
    async fn fail(
        &self,
        cx: &TaskContext,
        job: &mut CheckJob,
        alert: Alert,
        disable: bool,
    ) -> Result<(), TaskError> {
        let store = cx.store();
        if disable {
            job.ext.heuristic_version.status = HeuristicStatus::Disabled;
            job.ext.heuristic_version.status_date = Some(now());
            store.save(&job.ext.heuristic_version)?;
        }

        job.ext.test_status.error = true;
        job.ext.test_status.details = match &alert.details {
            Some(details) => format!("{}\n{details}", alert.message),
            None => alert.message.clone(),
        };
        store.save(&job.ext.test_status)?;

        fail_with_logs(cx, job, alert).await
    }

    async fn process(&self, cx: &TaskContext, job: &mut CheckJob) -> Result<(), TaskError> {
        let store = cx.store();
        let id = job.command.int(0).unwrap_or_default();
        let Some(heuristic_version) = store.get::<HeuristicVersion>(id) else {
            let message = format!("Unknown heuristic version ID: {id}");
            job.log.write(&format!("ERROR - {message}\n"));
            job.mark_as_failed(Some(Alert::new(message))).await?;
            return Ok(());
        };

        job.log.write("Searching a free compilation server...\n");
        let candidates = store.filter::<Server>(|s| s.server_type == ServerType::Compilation);
        let Some(server) = connect_free_server(cx, job, candidates, "Compilation Server").await
        else {
            job.log.write("Failed to find a free compilation server\n");
            job.mark_as_delayed(RETRY_DELAY).await?;
            return Ok(());
        };
        job.mark_as_running(Some(server.id), Some(heuristic_version.id), None)
            .await?;

        let test_status = match store
            .find::<HeuristicTestStatus>(|s| s.heuristic_version == heuristic_version.id)
        {
            Some(status) => status,
            None => store.insert(HeuristicTestStatus {
                heuristic_version: heuristic_version.id,
                ..Default::default()
            })?,
        };
        job.ext = CheckState {
            heuristic_version,
            test_status,
        };
        self.update_status(cx, job, TestPhase::Status)?;

        job.log
            .write("Tell the server about the heuristics repository...\n");
        let url = cx.config().upload_repository_url.clone();
        if !send(job, &Message::new("USE_HEURISTICS_REPOSITORY").arg(url)).await {
            let alert = Alert::new("Failed to tell the server about the heuristics repository");
            return self.fail(cx, job, alert, false).await;
        }
        job.operation = Some(Op::StartHeuristicCheck);
        Ok(())
    }

    async fn start_heuristic_check(
        &self,
        cx: &TaskContext,
        job: &mut CheckJob,
    ) -> Result<(), TaskError> {
        let response = wait_response(job).await;
        if !response.as_ref().is_some_and(|r| r.is("OK")) {
            let alert = Alert::new("Failed to select the heuristics repository").with_details(
                format!(
                    "Repository: {}\nResponse: {}",
                    cx.config().upload_repository.display(),
                    describe(response.as_ref())
                ),
            );
            return self.fail(cx, job, alert, false).await;
        }

        self.update_status(cx, job, TestPhase::Compilation)?;

        job.log.write("Check the heuristic...\n");
        let fullname = job.ext.heuristic_version.fullname();
        if !send(job, &Message::new("CHECK_HEURISTIC").arg(&fullname)).await {
            let alert =
                Alert::new(format!("Failed to tell the server to check the heuristic '{fullname}'"));
            return self.fail(cx, job, alert, false).await;
        }
        job.operation = Some(Op::ProcessCompilationResult);
        Ok(())
    }

    async fn process_compilation_result(
        &self,
        cx: &TaskContext,
        job: &mut CheckJob,
    ) -> Result<(), TaskError> {
        let response = wait_response(job).await;
        let fullname = job.ext.heuristic_version.fullname();
        let alert = match &response {
            Some(r) if r.is("COMPILATION_OK") => None,
            Some(r) if r.is("ERROR") => Some(
                Alert::new(format!("Failed to check the heuristic '{fullname}'")).with_details(
                    format!(
                        "Error during the compilation phase: {}",
                        r.text(0).unwrap_or_default()
                    ),
                ),
            ),
            Some(r) if r.is("COMPILATION_ERROR") => Some(
                Alert::new(format!("Failed to compile the heuristic '{fullname}'"))
                    .with_details(r.text(0).unwrap_or_default()),
            ),
            other => Some(
                Alert::new(format!("Failed to check the heuristic '{fullname}'")).with_details(
                    format!(
                        "Unknown response from the Compilation Server. Expected: COMPILATION_OK, got: {}",
                        describe(other.as_ref())
                    ),
                ),
            ),
        };
        if let Some(alert) = alert {
            return self.fail(cx, job, alert, true).await;
        }

        job.log.write("Compilation OK\n");
        self.update_status(cx, job, TestPhase::Analyze)?;
        job.operation = Some(Op::ProcessAnalysisResult);
        Ok(())
    }

    async fn process_analysis_result(
        &self,
        cx: &TaskContext,
        job: &mut CheckJob,
    ) -> Result<(), TaskError> {
        let response = wait_response(job).await;
        let fullname = job.ext.heuristic_version.fullname();
        let alert = match &response {
            Some(r) if r.is("ANALYZE_OK") => None,
            Some(r) if r.is("ANALYZE_ERROR") => Some(
                Alert::new(format!("Failed to analyze the heuristic '{fullname}'"))
                    .with_details(r.text(0).unwrap_or_default()),
            ),
            other => Some(
                Alert::new(format!("Failed to check the heuristic '{fullname}'")).with_details(
                    format!(
                        "Unknown response from the Compilation Server. Expected: ANALYZE_OK, got: {}",
                        describe(other.as_ref())
                    ),
                ),
            ),
        };
        if let Some(alert) = alert {
            return self.fail(cx, job, alert, true).await;
        }

        job.log.write("Analysis OK\n");
        self.update_status(cx, job, TestPhase::Test)?;
        job.operation = Some(Op::ProcessTestResult);
        Ok(())
    }

    async fn process_test_result(
        &self,
        cx: &TaskContext,
        job: &mut CheckJob,
    ) -> Result<(), TaskError> {
        let response = wait_response(job).await;
        if !response.as_ref().is_some_and(|r| r.is("TEST_OK")) {
            return self.test_failed(cx, job, response).await;
        }

        job.log.write("Test OK\n");
        if let Some(mut client) = job.client.take() {
            let _ = client.send_command(&Message::new("DONE")).await;
            client.close();
        }

        if let Err(e) = self.move_to_heuristics_repository(cx, job).await {
            let alert = Alert::new(format!(
                "Error while moving the heuristic version '{}' from the 'upload' repository to the 'heuristics' one",
                job.ext.heuristic_version.fullname()
            ))
            .with_details(e.to_string());
            return self.fail(cx, job, alert, false).await;
        }

        let store = cx.store();
        job.ext.heuristic_version.checked = true;
        store.save(&job.ext.heuristic_version)?;
        store.delete::<HeuristicTestStatus>(job.ext.test_status.id)?;

        info!(heuristic_version = job.ext.heuristic_version.id, "heuristic checked");
        job.mark_as_done(ExperimentStatus::Done).await?;
        cx.send_event(
            &Message::new("EVT_HEURISTIC_CHECKED").arg(job.ext.heuristic_version.id),
        );
        Ok(())
    }

    async fn test_failed(
        &self,
        cx: &TaskContext,
        job: &mut CheckJob,
        response: Option<Message>,
    ) -> Result<(), TaskError> {
        let hv = job.ext.heuristic_version.id;
        let report = |error_type, description| PluginErrorReport {
            heuristic_version: Some(hv),
            error_type,
            description,
            ..Default::default()
        };
        let (report, details) = match &response {
            Some(r) if r.is("TEST_ERROR") => (
                Some(report(PluginErrorType::Other, r.text(0))),
                None,
            ),
            Some(r) if r.is("HEURISTIC_CRASH") => (Some(report(PluginErrorType::Crash, None)), None),
            Some(r) if r.is("HEURISTIC_TIMEOUT") => {
                (Some(report(PluginErrorType::Timeout, None)), None)
            }
            other => (
                None,
                Some(format!(
                    "Unknown response from the Compilation Server. Expected: TEST_OK, got: {}",
                    describe(other.as_ref())
                )),
            ),
        };

        let mut report = report;
        if let Some(report) = report.as_mut() {
            if let Some(r) = wait_response(job).await
                && r.is("CONTEXT")
            {
                report.context = r.text(0);
            }
            let has_context = report.context.as_deref().is_some_and(|c| !c.is_empty());
            if report.error_type == PluginErrorType::Crash
                && has_context
                && let Some(r) = wait_response(job).await
                && r.is("STACKTRACE")
            {
                report.stacktrace = r.text(0);
            }
        }

        let mut alert = Alert::new(format!(
            "The test of the heuristic '{}' failed",
            job.ext.heuristic_version.fullname()
        ));
        if let Some(details) = details {
            alert = alert.with_details(details);
        }

        if let Some(report) = report {
            let report = cx.store().insert(report)?;
            job.mail_sent = self.mail_error_report(cx, job, &report).await;
        }
        self.fail(cx, job, alert, true).await
    }

    /// Crashes and timeouts are mailed. Returns whether a mail was sent.
    async fn mail_error_report(
        &self,
        cx: &TaskContext,
        job: &CheckJob,
        report: &PluginErrorReport,
    ) -> bool {
        let name = job.ext.heuristic_version.fullname();
        let subject = match report.error_type {
            PluginErrorType::Crash => format!("Your heuristic '{name}' crashed"),
            PluginErrorType::Timeout => format!("Your heuristic '{name}' took too much time"),
            PluginErrorType::Other => return false,
        };

        let website = &cx.config().website_url;
        let mut body = format!(
            "You can view this error report online on the page of the heuristic: {website}/heuristics/v{}/\n\n\nDue to this error, the heuristic will not be useable anymore!\n\nPlease fix the problem, and upload a new version of this heuristic.\n\n\n",
            job.ext.heuristic_version.id
        );
        body.push_str("This error happened during the test of the heuristic\n\n\n");
        if let Some(context) = &report.context {
            body.push_str(&format!("CONTEXT\n-------\n\n{context}\n\n\n"));
        }
        if let Some(stacktrace) = &report.stacktrace {
            body.push_str(&format!("STACKTRACE\n----------\n\n{stacktrace}\n\n\n"));
        }
        cx.mail_admins(&subject, &body).await;
        true
    }

    /// `<upload>/<author>/<filename>` becomes `<heuristics>/<author>/<slug>.cpp`.
    async fn move_to_heuristics_repository(
        &self,
        cx: &TaskContext,
        job: &mut CheckJob,
    ) -> std::io::Result<()> {
        let config = cx.config();
        let heuristics = &config.heuristics_repository;
        let upload = &config.upload_repository;

        let _heuristics_lock = LockFile::acquire(&lock_path(heuristics)).await?;
        let _upload_lock = LockFile::acquire(&lock_path(upload)).await?;

        let hv = &mut job.ext.heuristic_version;
        let author = hv.author.to_lowercase();
        let filename = hv.repository_filename();

        let source = upload.join(&author).join(&hv.filename);
        let content = fs::read(&source).await?;
        let user_path = heuristics.join(&author);
        fs::create_dir_all(&user_path).await?;
        fs::write(user_path.join(&filename), content).await?;
        fs::remove_file(&source).await?;

        // Uploaded files are not kept once checked
        let upload_user = upload.join(&author);
        if let Err(e) = fs::remove_dir(&upload_user).await
            && e.kind() != std::io::ErrorKind::DirectoryNotEmpty
        {
            warn!(path = %upload_user.display(), error = %e, "cannot clean the upload repository");
        }

        job.log.write(&format!(
            "Heuristic moved to '{}/{filename}'\n",
            user_path.display()
        ));
        hv.filename = filename;
        Ok(())
    }
}

fn lock_path(repository: &Path) -> std::path::PathBuf {
    repository.with_extension("lock")
}

#[async_trait]
impl Task for HeuristicChecker {
    type Ext = CheckState;

    const NAME: &'static str = "HeuristicChecker";

    fn commands(&self) -> &'static [CommandSpec] {
        COMMANDS
    }

    /// Versions left unchecked by a previous run are checked again from
    /// the start.
    async fn on_startup(
        &mut self,
        cx: &TaskContext,
        jobs: &mut JobList<CheckState>,
    ) -> Result<(), TaskError> {
        let store = cx.store();
        for hv in store
            .filter::<HeuristicVersion>(|hv| !hv.checked && hv.status == HeuristicStatus::Ok)
        {
            store.delete_where::<HeuristicTestStatus>(|s| s.heuristic_version == hv.id)?;
            jobs.add_job(&check_heuristic(hv.id))?;
        }
        Ok(())
    }

    async fn step(&mut self, cx: &TaskContext, job: &mut CheckJob) -> Result<(), TaskError> {
        match job.operation {
            None => self.process(cx, job).await,
            Some(Op::StartHeuristicCheck) => self.start_heuristic_check(cx, job).await,
            Some(Op::ProcessCompilationResult) => self.process_compilation_result(cx, job).await,
            Some(Op::ProcessAnalysisResult) => self.process_analysis_result(cx, job).await,
            Some(Op::ProcessTestResult) => self.process_test_result(cx, job).await,
        }
    }
}
