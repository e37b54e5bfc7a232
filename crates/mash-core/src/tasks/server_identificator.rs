use async_trait::async_trait;
use mash_model::{Alert, ExperimentStatus, Server, ServerSubtype, ServerType};
use mash_net::Message;
use tracing::info;

use super::farm::{RETRY_DELAY, describe};
use crate::{CommandSpec, Job, JobExt, JobList, ParamType, Task, TaskContext, TaskError};

const COMMANDS: &[CommandSpec] = &[CommandSpec::new("IDENTIFY_SERVER", &[ParamType::Int])];

/// Asks a server what it is (`INFO`) and records its type.
#[derive(Debug, Default)]
pub struct ServerIdentificator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    ProcessServerInfo,
    ProcessSubtype,
}

#[derive(Debug, Default)]
pub struct IdentifyState;

impl JobExt for IdentifyState {
    type Operation = Op;
}

type IdentifyJob = Job<IdentifyState>;

async fn fail(job: &mut IdentifyJob, message: String) -> Result<(), TaskError> {
    job.log.write(&format!("ERROR - {message}\n"));
    job.mark_as_failed(Some(Alert::new(message))).await?;
    Ok(())
}

impl ServerIdentificator {
    async fn process(&self, cx: &TaskContext, job: &mut IdentifyJob) -> Result<(), TaskError> {
        let id = job.command.int(0).unwrap_or_default();
        let Some(server) = cx.store().get::<Server>(id) else {
            return fail(job, format!("Unknown server ID: {id}")).await;
        };

        job.mark_as_running(Some(server.id), None, None).await?;
        job.log.write(&format!(
            "Identification of the server '{}' at '{}:{}'...\n",
            server.name, server.address, server.port
        ));

        let mut client = job.new_client();
        if client.connect(&server.address, server.port).await.is_err() {
            job.log
                .write("ERROR - Failed to establish a connection with the server\n");
            job.mark_as_delayed(RETRY_DELAY).await?;
            return Ok(());
        }
        client.send_command(&Message::new("INFO")).await?;
        job.client = Some(client);
        job.operation = Some(Op::ProcessServerInfo);
        Ok(())
    }

    async fn process_server_info(
        &self,
        cx: &TaskContext,
        job: &mut IdentifyJob,
    ) -> Result<(), TaskError> {
        let response = match job.client.as_mut() {
            Some(client) => client.wait_response().await,
            None => None,
        };
        let name = match &response {
            Some(r) if r.is("TYPE") && r.params.len() == 1 => r.text(0).unwrap_or_default(),
            other => {
                let line = describe(other.as_ref());
                return fail(job, format!("Unexpected response from the server: {line}")).await;
            }
        };

        let server_type = match name.as_str() {
            "ExperimentServer" => {
                job.log.write("--> Experiment Server\n");
                ServerType::Experiments
            }
            "CompilationServer" => {
                job.log.write("--> Compilation Server\n");
                ServerType::Compilation
            }
            "ClusteringServer" => {
                job.log.write("--> Clustering Server\n");
                ServerType::Clustering
            }
            "DebuggingServer" => {
                job.log.write("--> Debugging Server\n");
                ServerType::Debugging
            }
            "ApplicationServer" => {
                job.operation = Some(Op::ProcessSubtype);
                return Ok(());
            }
            _ => {
                job.log.write("--> Unknown\n");
                ServerType::Unknown
            }
        };
        self.identified(cx, job, server_type, ServerSubtype::None)
            .await
    }

    async fn process_subtype(
        &self,
        cx: &TaskContext,
        job: &mut IdentifyJob,
    ) -> Result<(), TaskError> {
        let response = match job.client.as_mut() {
            Some(client) => client.wait_response().await,
            None => None,
        };
        let subtype = match &response {
            Some(r) if r.is("SUBTYPE") && r.params.len() == 1 => r.text(0).unwrap_or_default(),
            other => {
                let line = describe(other.as_ref());
                return fail(
                    job,
                    format!("Unexpected response from the application server: {line}"),
                )
                .await;
            }
        };

        let subtype = match subtype.as_str() {
            "Images" => {
                job.log.write("--> Application Server, subtype = Images\n");
                ServerSubtype::Images
            }
            "Interactive" => {
                job.log
                    .write("--> Application Server, subtype = Interactive\n");
                ServerSubtype::Interactive
            }
            _ => {
                job.log.write("--> Application Server, media = Unknown\n");
                ServerSubtype::None
            }
        };
        self.identified(cx, job, ServerType::Application, subtype)
            .await
    }

    async fn identified(
        &self,
        cx: &TaskContext,
        job: &mut IdentifyJob,
        server_type: ServerType,
        subtype: ServerSubtype,
    ) -> Result<(), TaskError> {
        let id = job.record.server.unwrap_or_default();
        let mut server = cx.store().get::<Server>(id).ok_or(TaskError::Missing {
            kind: "server",
            id,
        })?;
        server.server_type = server_type;
        server.subtype = subtype;
        cx.store().save(&server)?;
        info!(server = %server.name, kind = ?server_type, "server identified");

        job.mark_as_done(ExperimentStatus::Done).await?;
        Ok(())
    }
}

#[async_trait]
impl Task for ServerIdentificator {
    type Ext = IdentifyState;

    const NAME: &'static str = "ServerIdentificator";

    fn commands(&self) -> &'static [CommandSpec] {
        COMMANDS
    }

    async fn on_startup(
        &mut self,
        cx: &TaskContext,
        jobs: &mut JobList<IdentifyState>,
    ) -> Result<(), TaskError> {
        for server in cx
            .store()
            .filter::<Server>(|s| s.server_type == ServerType::Unidentified)
        {
            jobs.add_job(&Message::new("IDENTIFY_SERVER").arg(server.id))?;
        }
        Ok(())
    }

    async fn step(&mut self, cx: &TaskContext, job: &mut IdentifyJob) -> Result<(), TaskError> {
        match job.operation {
            None => self.process(cx, job).await,
            Some(Op::ProcessServerInfo) => self.process_server_info(cx, job).await,
            Some(Op::ProcessSubtype) => self.process_subtype(cx, job).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryMailer, ScheduledTask, SchedulerConfig, Services, TaskEngine};
    use mash_model::Store;
    use std::sync::Arc;
    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        net::TcpListener,
    };

    /// Answers `INFO` with the given lines, then `GOODBYE` to anything.
    async fn fake_server(lines: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut read = BufReader::new(read).lines();
            while let Ok(Some(line)) = read.next_line().await {
                let answer = if line == "INFO" { lines } else { "GOODBYE\n" };
                if write.write_all(answer.as_bytes()).await.is_err() {
                    break;
                }
            }
        });
        port
    }

    async fn engine_for(store: &Store) -> TaskEngine<ServerIdentificator> {
        let services = Services::new(
            store.clone(),
            SchedulerConfig::default(),
            Arc::new(MemoryMailer::new()),
        );
        TaskEngine::new(ServerIdentificator, services)
    }

    async fn drive(engine: &mut TaskEngine<ServerIdentificator>) {
        for _ in 0..50 {
            if engine.jobs().is_empty() {
                return;
            }
            tokio::time::timeout(std::time::Duration::from_millis(100), engine.wait_readable())
                .await
                .ok();
            engine.on_event(0).await;
        }
    }

    #[tokio::test]
    async fn application_server_subtype_is_recorded() {
        let port = fake_server("TYPE ApplicationServer\nSUBTYPE Interactive\n").await;
        let store = Store::new();
        let server = store
            .insert(Server {
                name: "app".into(),
                address: "127.0.0.1".into(),
                port,
                ..Default::default()
            })
            .unwrap();

        let mut engine = engine_for(&store).await;
        engine.start().await;
        drive(&mut engine).await;

        let server = store.get::<Server>(server.id).unwrap();
        assert_eq!(server.server_type, ServerType::Application);
        assert_eq!(server.subtype, ServerSubtype::Interactive);
    }

    #[tokio::test]
    async fn unknown_server_fails_the_job() {
        let store = Store::new();
        let mut engine = engine_for(&store).await;

        assert!(engine.process_message(&Message::new("IDENTIFY_SERVER").arg(42)).await);
        engine.process_new_jobs().await;

        assert!(engine.jobs().is_empty());
        let alert = store.all::<Alert>().pop().unwrap();
        assert_eq!(alert.message, "Unknown server ID: 42");
    }

    #[tokio::test]
    async fn unexpected_answer_fails_the_job() {
        let port = fake_server("BUSY\n").await;
        let store = Store::new();
        store
            .insert(Server {
                address: "127.0.0.1".into(),
                port,
                ..Default::default()
            })
            .unwrap();

        let mut engine = engine_for(&store).await;
        engine.start().await;
        drive(&mut engine).await;

        let alert = store.all::<Alert>().pop().unwrap();
        assert_eq!(alert.message, "Unexpected response from the server: BUSY");
    }
}
