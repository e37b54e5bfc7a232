use async_trait::async_trait;
use mash_model::{
    Alert, DebuggingEntry, DebuggingStatus, ExperimentStatus, HeuristicVersion, RecordId, Server,
    ServerSubtype, ServerType,
};
use mash_net::Message;
use tracing::info;

use super::farm::{
    RETRY_DELAY, connect_free_server, describe, fail_with_logs, find_application_server, send,
    wait_response,
};
use crate::{CommandSpec, Job, JobExt, JobList, ParamType, Task, TaskContext, TaskError};

const COMMANDS: &[CommandSpec] = &[CommandSpec::new("DEBUG_HEURISTIC", &[ParamType::Int])];

/// Records, on a Debugging Server, what a heuristic version computes on one
/// sequence of a goal-planning task.
#[derive(Debug, Default)]
pub struct HeuristicDebugger;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    SelectTask,
    SendHeuristicsRepository,
    StartHeuristicDebugging,
    ProcessDebuggingResult,
}

#[derive(Debug, Default)]
pub struct DebugState {
    entry: DebuggingEntry,
    heuristic_version: HeuristicVersion,
}

impl JobExt for DebugState {
    type Operation = Op;
}

type DebugJob = Job<DebugState>;

fn debug_heuristic(entry: RecordId) -> Message {
    Message::new("DEBUG_HEURISTIC").arg(entry)
}

/// `OK`, or the response appended to the details.
fn check_ok(response: Option<&Message>, details: String) -> Result<(), String> {
    match response {
        Some(r) if r.is("OK") => Ok(()),
        Some(r) => Err(format!("{details}\nResponse: {}", describe(Some(r)))),
        None => Err(details),
    }
}

impl HeuristicDebugger {
    async fn fail(
        &self,
        cx: &TaskContext,
        job: &mut DebugJob,
        alert: Alert,
    ) -> Result<(), TaskError> {
        job.ext.entry.status = DebuggingStatus::Failed;
        job.ext.entry.error_details = match &alert.details {
            Some(details) if !details.is_empty() => format!("{}\n{details}", alert.message),
            _ => alert.message.clone(),
        };
        cx.store().save(&job.ext.entry)?;
        fail_with_logs(cx, job, alert).await
    }

    async fn process(&self, cx: &TaskContext, job: &mut DebugJob) -> Result<(), TaskError> {
        let store = cx.store();
        let id = job.command.int(0).unwrap_or_default();
        let entry = store.get::<DebuggingEntry>(id);
        let heuristic_version = entry
            .as_ref()
            .and_then(|e| store.get::<HeuristicVersion>(e.heuristic_version));
        let (Some(entry), Some(heuristic_version)) = (entry, heuristic_version) else {
            let message = format!("Unknown debugging entry ID: {id}");
            job.log.write(&format!("ERROR - {message}\n"));
            job.mark_as_failed(Some(Alert::new(message))).await?;
            return Ok(());
        };

        let (goal, environment) = (entry.goal.clone(), entry.environment.clone());
        job.log.write(&format!(
            "Searching a free Interactive Application Server providing the goal '{goal}' and the environment '{environment}'...\n"
        ));
        let candidates = store.filter::<Server>(|s| {
            s.server_type == ServerType::Application
                && s.subtype == ServerSubtype::Interactive
                && s.provides_goal(&goal, &environment)
        });
        let Some(application_server) =
            find_application_server(cx, job, candidates, "Interactive Application Server").await
        else {
            job.log.write(&format!(
                "Failed to find a free Interactive Application providing the goal '{goal}' and the environment '{environment}'...\n"
            ));
            job.mark_as_delayed(RETRY_DELAY).await?;
            return Ok(());
        };

        job.log.write("Searching a free debugging server...\n");
        let candidates = store.filter::<Server>(|s| s.server_type == ServerType::Debugging);
        let Some(server) = connect_free_server(cx, job, candidates, "Debugging Server").await
        else {
            job.log.write("Failed to find a free debugging server\n");
            job.mark_as_delayed(RETRY_DELAY).await?;
            return Ok(());
        };
        job.mark_as_running(Some(server.id), Some(heuristic_version.id), None)
            .await?;

        job.ext = DebugState {
            entry,
            heuristic_version,
        };
        job.ext.entry.status = DebuggingStatus::Running;
        job.ext.entry.error_details.clear();
        store.save(&job.ext.entry)?;

        let command = Message::new("USE_APPLICATION_SERVER")
            .arg(&application_server.address)
            .arg(i64::from(application_server.port));
        if !send(job, &command).await {
            return self
                .fail(cx, job, Alert::new("Failed to select the Application Server"))
                .await;
        }
        job.operation = Some(Op::SelectTask);
        Ok(())
    }

    async fn select_task(&self, cx: &TaskContext, job: &mut DebugJob) -> Result<(), TaskError> {
        let response = wait_response(job).await;
        if !response.as_ref().is_some_and(|r| r.is("OK")) {
            return self
                .fail(cx, job, Alert::new("Failed to select the Application Server"))
                .await;
        }

        job.log.write("Selecting the task...\n");
        let (goal, environment) = (job.ext.entry.goal.clone(), job.ext.entry.environment.clone());
        let command = Message::new("SELECT_TASK").arg(&goal).arg(&environment);
        if !send(job, &command).await {
            let alert = Alert::new(format!(
                "Failed to tell the server about the task (goal: {goal}, environment: {environment})"
            ));
            return self.fail(cx, job, alert).await;
        }
        job.operation = Some(Op::SendHeuristicsRepository);
        Ok(())
    }

    async fn send_heuristics_repository(
        &self,
        cx: &TaskContext,
        job: &mut DebugJob,
    ) -> Result<(), TaskError> {
        let response = wait_response(job).await;
        let details = format!(
            "Goal: {}\nEnvironment: {}",
            job.ext.entry.goal, job.ext.entry.environment
        );
        if let Err(details) = check_ok(response.as_ref(), details) {
            let alert = Alert::new("Failed to select the task").with_details(details);
            return self.fail(cx, job, alert).await;
        }

        job.log
            .write("Tell the server about the heuristics repository...\n");
        let url = cx.config().heuristics_repository_url.clone();
        if !send(job, &Message::new("USE_HEURISTICS_REPOSITORY").arg(url)).await {
            let alert = Alert::new("Failed to tell the server about the heuristics repository");
            return self.fail(cx, job, alert).await;
        }
        job.operation = Some(Op::StartHeuristicDebugging);
        Ok(())
    }

    async fn start_heuristic_debugging(
        &self,
        cx: &TaskContext,
        job: &mut DebugJob,
    ) -> Result<(), TaskError> {
        let response = wait_response(job).await;
        let details = format!("Repository: {}", cx.config().heuristics_repository_url);
        if let Err(details) = check_ok(response.as_ref(), details) {
            let alert = Alert::new("Failed to select the heuristics repository").with_details(details);
            return self.fail(cx, job, alert).await;
        }

        job.log.write("Debug the heuristic...\n");
        let fullname = job.ext.heuristic_version.fullname();
        let entry = &job.ext.entry;
        let mut command = Message::new("DEBUG_HEURISTIC")
            .arg(&fullname)
            .arg(entry.sequence);
        if entry.start_frame >= 0 {
            command = command.arg(entry.start_frame);
            if entry.end_frame >= 0 {
                command = command.arg(entry.end_frame);
            }
        }
        if !send(job, &command).await {
            let alert = Alert::new(format!(
                "Failed to tell the server to debug the heuristic '{fullname}'"
            ));
            return self.fail(cx, job, alert).await;
        }
        job.operation = Some(Op::ProcessDebuggingResult);
        Ok(())
    }

    async fn process_debugging_result(
        &self,
        cx: &TaskContext,
        job: &mut DebugJob,
    ) -> Result<(), TaskError> {
        let response = wait_response(job).await;
        let fullname = job.ext.heuristic_version.fullname();
        let size = match &response {
            Some(r) if r.is("DATA") => r.int(0).unwrap_or_default().max(0) as usize,
            other => {
                let mut alert = Alert::new(format!("Failed to debug the heuristic '{fullname}'"));
                if let Some(r) = other {
                    alert = alert.with_details(format!("Response: {}", describe(Some(r))));
                }
                return self.fail(cx, job, alert).await;
            }
        };

        let data = match job.client.as_mut() {
            Some(client) => client.wait_data(size).await,
            None => None,
        };
        let Some(data) = data else {
            let alert = Alert::new(format!("Failed to debug the heuristic '{fullname}'"))
                .with_details(format!(
                    "Response: {}\nThe data could not be retrieved",
                    describe(response.as_ref())
                ));
            return self.fail(cx, job, alert).await;
        };

        let path = cx.config().debugging_root.join(job.ext.entry.filename());
        if let Some(folder) = path.parent() {
            tokio::fs::create_dir_all(folder).await?;
        }
        tokio::fs::write(&path, data).await?;

        job.ext.entry.status = DebuggingStatus::Done;
        cx.store().save(&job.ext.entry)?;
        job.log.write("Debugging done\n");
        info!(entry = job.ext.entry.id, path = %path.display(), "debugging data recorded");

        job.mark_as_done(ExperimentStatus::Done).await?;
        Ok(())
    }
}

#[async_trait]
impl Task for HeuristicDebugger {
    type Ext = DebugState;

    const NAME: &'static str = "HeuristicDebugger";

    fn commands(&self) -> &'static [CommandSpec] {
        COMMANDS
    }

    /// Interrupted entries come first.
    async fn on_startup(
        &mut self,
        cx: &TaskContext,
        jobs: &mut JobList<DebugState>,
    ) -> Result<(), TaskError> {
        let store = cx.store();
        for status in [DebuggingStatus::Running, DebuggingStatus::Scheduled] {
            for entry in store.filter::<DebuggingEntry>(|e| e.status == status) {
                jobs.add_job(&debug_heuristic(entry.id))?;
            }
        }
        Ok(())
    }

    async fn step(&mut self, cx: &TaskContext, job: &mut DebugJob) -> Result<(), TaskError> {
        match job.operation {
            None => self.process(cx, job).await,
            Some(Op::SelectTask) => self.select_task(cx, job).await,
            Some(Op::SendHeuristicsRepository) => self.send_heuristics_repository(cx, job).await,
            Some(Op::StartHeuristicDebugging) => self.start_heuristic_debugging(cx, job).await,
            Some(Op::ProcessDebuggingResult) => self.process_debugging_result(cx, job).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refusals_carry_the_response() {
        let refused = Message::new("ERROR").arg("unknown goal");
        assert_eq!(
            check_ok(Some(&refused), "Goal: reach".into()),
            Err("Goal: reach\nResponse: ERROR 'unknown goal'".to_string())
        );
        assert_eq!(check_ok(None, "Goal: reach".into()), Err("Goal: reach".into()));
        assert_eq!(check_ok(Some(&Message::new("OK")), String::new()), Ok(()));
    }
}
