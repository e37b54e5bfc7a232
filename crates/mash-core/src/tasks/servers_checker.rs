use std::time::Duration;

use async_trait::async_trait;
use mash_model::{ExperimentStatus, Server, ServerStatus};
use mash_net::{Client, Message};
use tokio::time::Instant;
use tracing::info;

use crate::{CommandSpec, Job, JobExt, JobList, Task, TaskContext, TaskError};

const COMMANDS: &[CommandSpec] = &[CommandSpec::new("CHECK_SERVERS_STATUS", &[])];

/// A command arriving this soon after a check is ignored.
const MIN_INTERVAL: Duration = Duration::from_secs(2);

/// Contacts every known server and records whether it is online.
#[derive(Debug, Default)]
pub struct ServersChecker {
    last_check: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct CheckState;

impl JobExt for CheckState {
    type Operation = std::convert::Infallible;
}

#[async_trait]
impl Task for ServersChecker {
    type Ext = CheckState;

    const NAME: &'static str = "ServersChecker";

    fn commands(&self) -> &'static [CommandSpec] {
        COMMANDS
    }

    async fn on_startup(
        &mut self,
        _cx: &TaskContext,
        jobs: &mut JobList<CheckState>,
    ) -> Result<(), TaskError> {
        jobs.add_job(&Message::new("CHECK_SERVERS_STATUS"))?;
        Ok(())
    }

    async fn on_command_received(
        &mut self,
        _cx: &TaskContext,
        jobs: &mut JobList<CheckState>,
        _command: &Message,
    ) -> Result<bool, TaskError> {
        if !jobs.is_empty() {
            return Ok(true);
        }
        Ok(self
            .last_check
            .is_some_and(|last| last.elapsed() <= MIN_INTERVAL))
    }

    async fn step(&mut self, cx: &TaskContext, job: &mut Job<CheckState>) -> Result<(), TaskError> {
        job.mark_as_running(None, None, None).await?;

        let store = cx.store();
        let mut online = 0;
        for mut server in store.all::<Server>() {
            server.status = ServerStatus::Unknown;
            store.save(&server)?;

            job.log.write(&format!(
                "Attempt to connect to server '{}' at '{}:{}'... ",
                server.name, server.address, server.port
            ));
            let mut client = Client::new(None).with_timeout(cx.config().response_timeout());
            server.status = match client.connect(&server.address, server.port).await {
                Ok(()) => {
                    job.log.write("ONLINE\n");
                    online += 1;
                    ServerStatus::Online
                }
                Err(_) => {
                    job.log.write("OFFLINE\n");
                    ServerStatus::Offline
                }
            };
            client.close();
            store.save(&server)?;
        }
        info!(online, "servers checked");

        self.last_check = Some(Instant::now());
        job.mark_as_done(ExperimentStatus::Done).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryMailer, ScheduledTask, SchedulerConfig, Services, TaskEngine};
    use mash_model::Store;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn check_marks_servers_online_or_offline() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open_port = listener.local_addr().unwrap().port();
        let closed_port = {
            let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
            unused.local_addr().unwrap().port()
        };

        let store = Store::new();
        let up = store
            .insert(Server {
                name: "up".into(),
                address: "127.0.0.1".into(),
                port: open_port,
                ..Default::default()
            })
            .unwrap();
        let down = store
            .insert(Server {
                name: "down".into(),
                address: "127.0.0.1".into(),
                port: closed_port,
                ..Default::default()
            })
            .unwrap();

        let services = Services::new(
            store.clone(),
            SchedulerConfig::default(),
            Arc::new(MemoryMailer::new()),
        );
        let mut engine = TaskEngine::new(ServersChecker::default(), services);
        engine.start().await;

        assert!(engine.jobs().is_empty());
        assert_eq!(store.get::<Server>(up.id).unwrap().status, ServerStatus::Online);
        assert_eq!(store.get::<Server>(down.id).unwrap().status, ServerStatus::Offline);
        assert!(engine.task().last_check.is_some());

        // A check just happened: the command is swallowed.
        assert!(engine.process_message(&Message::new("CHECK_SERVERS_STATUS")).await);
        engine.process_new_jobs().await;
        assert!(engine.jobs().is_empty());
    }
}
