use mash_model::{
    Configuration, ConfigurationType, Experiment, Server, ServerSubtype, ServerType, TaskType,
};
use mash_net::{Client, Message};
use tracing::info;

use super::{ExperimentLauncher, LaunchJob, Op, RETRY_DELAY, now};
use crate::tasks::farm::find_application_server;
use crate::{TaskContext, TaskError};

/// Protocol an Experiment Server must speak.
const EXPERIMENT_SERVER_PROTOCOL: &str = "1.7";

impl ExperimentLauncher {
    /// Reserve the servers and start the protocol.
    pub(super) async fn run_experiment(
        &self,
        cx: &TaskContext,
        job: &mut LaunchJob,
        mut experiment: Experiment,
        configuration: Configuration,
    ) -> Result<(), TaskError> {
        let store = cx.store();
        let setting = |name: &str| store.try_get_setting(configuration.id, name);

        let (candidates, label, experiment_type) = match configuration.task {
            TaskType::Classification | TaskType::ObjectDetection => {
                let database = setting("EXPERIMENT_SETUP/DATABASE_NAME").unwrap_or_default();
                job.log.write(&format!(
                    "Searching a free Image Server providing the database '{database}'...\n"
                ));
                let candidates = store.filter::<Server>(|s| {
                    s.server_type == ServerType::Application
                        && s.subtype == ServerSubtype::Images
                        && s.provides_database(&database)
                });
                let experiment_type = if configuration.task == TaskType::Classification {
                    "Classification"
                } else {
                    "ObjectDetection"
                };
                (candidates, "Image Server", experiment_type)
            }
            TaskType::GoalPlanning => {
                if configuration.experiment_type == ConfigurationType::Evaluation {
                    return self
                        .process_error(
                            cx,
                            job,
                            "Evaluation experiments don't support goal-planning tasks",
                            None,
                            true,
                        )
                        .await;
                }
                let goal = setting("EXPERIMENT_SETUP/GOAL_NAME").unwrap_or_default();
                let environment = setting("EXPERIMENT_SETUP/ENVIRONMENT_NAME").unwrap_or_default();
                job.log.write(&format!(
                    "Searching a free Interactive Application Server providing the goal '{goal}' and the environment '{environment}'...\n"
                ));
                let candidates = store.filter::<Server>(|s| {
                    s.server_type == ServerType::Application
                        && s.subtype == ServerSubtype::Interactive
                        && s.provides_goal(&goal, &environment)
                });
                (candidates, "Interactive Application Server", "GoalPlanning")
            }
        };

        let application_server = find_application_server(cx, job, candidates, label).await;
        job.ext.application_server = application_server;
        if job.ext.application_server.is_none() {
            job.log
                .write(&format!("Failed to find a free {label} suitable for the experiment\n"));
            job.mark_as_delayed(RETRY_DELAY).await?;
            return Ok(());
        }

        if !self
            .select_experiment_server(cx, job, &configuration)
            .await?
        {
            return Ok(());
        }

        experiment.start = Some(now());
        experiment.end = None;
        store.save(&experiment)?;

        if !self
            .send_or_fail(
                cx,
                job,
                &Message::new("SET_EXPERIMENT_TYPE").arg(experiment_type),
                "Failed to set the experiment type",
            )
            .await?
        {
            return Ok(());
        }
        job.operation = Some(Op::SendApplicationServerInfos);
        Ok(())
    }

    /// Connect the job to a free Experiment Server able to run the
    /// experiment. The job is delayed when there is none.
    async fn select_experiment_server(
        &self,
        cx: &TaskContext,
        job: &mut LaunchJob,
        configuration: &Configuration,
    ) -> Result<bool, TaskError> {
        job.log
            .write("Searching a free Experiment Server suitable for the task\n");

        let experiment_type = match configuration.experiment_type {
            ConfigurationType::ContestBase => ConfigurationType::ContestEntry,
            ConfigurationType::Signature => ConfigurationType::Evaluation,
            other => other,
        };
        let suitable = |s: &Server| {
            s.server_type == ServerType::Experiments && s.supported_tasks.contains(&configuration.task)
        };
        let store = cx.store();
        let mut servers =
            store.filter::<Server>(|s| suitable(s) && s.restrict_experiment == Some(experiment_type));
        servers.extend(store.filter::<Server>(|s| suitable(s) && s.restrict_experiment.is_none()));

        for server in servers {
            job.log.write(&format!(
                "    Contacting '{}:{}'...\n",
                server.address, server.port
            ));

            let mut client = job.new_client();
            if self.check_experiment_server(&mut client, &server).await {
                job.client = Some(client);
                job.log.write("    Experiment Server found\n");
                info!(job = job.id(), server = %server.name, "experiment server selected");
                job.record.server = Some(server.id);
                job.store().save(&job.record)?;
                return Ok(true);
            }
            client.close();
        }

        job.log.write("Failed to find a free Experiment Server\n");
        job.mark_as_delayed(RETRY_DELAY).await?;
        Ok(false)
    }

    /// `STATUS` must answer `READY`, `INFO` must report an Experiment
    /// Server speaking the expected protocol.
    async fn check_experiment_server(&self, client: &mut Client, server: &Server) -> bool {
        if client.connect(&server.address, server.port).await.is_err()
            || client.send_command(&Message::new("STATUS")).await.is_err()
            || !client.wait_response().await.is_some_and(|r| r.is("READY"))
            || client.send_command(&Message::new("INFO")).await.is_err()
        {
            return false;
        }
        let is_experiment_server = client
            .wait_response()
            .await
            .is_some_and(|r| r.is("TYPE") && r.text(0).as_deref() == Some("ExperimentServer"));
        is_experiment_server
            && client.wait_response().await.is_some_and(|r| {
                r.is("PROTOCOL") && r.text(0).as_deref() == Some(EXPERIMENT_SERVER_PROTOCOL)
            })
    }

    pub(super) async fn send_application_server_infos(
        &self,
        cx: &TaskContext,
        job: &mut LaunchJob,
    ) -> Result<(), TaskError> {
        if !self
            .expect_ok(cx, job, "Failed to set the experiment type")
            .await?
        {
            return Ok(());
        }

        let Some(server) = job.ext.application_server.clone() else {
            return Err(TaskError::Internal("no application server selected".into()));
        };
        let command = Message::new("USE_APPLICATION_SERVER")
            .arg(server.address.as_str())
            .arg(u32::from(server.port));
        if self
            .send_or_fail(cx, job, &command, "Failed to select the Application Server")
            .await?
        {
            job.operation = Some(Op::SendGlobalSeed);
        }
        Ok(())
    }
}
