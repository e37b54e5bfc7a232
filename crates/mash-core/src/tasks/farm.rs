//! Dialogue helpers shared by the tasks driving a remote server.

use mash_model::{Alert, Server};
use mash_net::{Client, Message};
use time::OffsetDateTime;
use tracing::error;

use crate::{Job, JobExt, TaskContext, TaskError, utils::get_server_logs};

/// Seconds to wait before looking again for a free server.
pub(crate) const RETRY_DELAY: i64 = 60;

pub(crate) fn now() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

pub(crate) async fn wait_response<X: JobExt>(job: &mut Job<X>) -> Option<Message> {
    match job.client.as_mut() {
        Some(client) => client.wait_response().await,
        None => None,
    }
}

/// `false` when the command could not be sent.
pub(crate) async fn send<X: JobExt>(job: &mut Job<X>, command: &Message) -> bool {
    match job.client.as_mut() {
        Some(client) => client.send_command(command).await.is_ok(),
        None => false,
    }
}

pub(crate) fn describe(response: Option<&Message>) -> String {
    response.map_or_else(|| "<no response>".to_string(), Message::encode)
}

/// Connect the job to the first idle candidate answering `READY` to
/// `STATUS`. The client stays attached to the job.
pub(crate) async fn connect_free_server<X: JobExt>(
    cx: &TaskContext,
    job: &mut Job<X>,
    candidates: Vec<Server>,
    label: &str,
) -> Option<Server> {
    for server in candidates {
        if cx.store().current_job(server.id).is_some() {
            continue;
        }
        job.log.write(&format!(
            "    Contacting '{}:{}'...\n",
            server.address, server.port
        ));

        let mut client = job.new_client();
        let ready = client.connect(&server.address, server.port).await.is_ok()
            && client.send_command(&Message::new("STATUS")).await.is_ok()
            && client
                .wait_response()
                .await
                .is_some_and(|r| r.is("READY"));
        if ready {
            job.log.write(&format!("    {label} found\n"));
            job.client = Some(client);
            return Some(server);
        }
        client.close();
    }
    None
}

/// First candidate answering `READY` to `STATUS`. The connection is only
/// used for the question: the server is given to another server later.
pub(crate) async fn find_application_server<X: JobExt>(
    cx: &TaskContext,
    job: &Job<X>,
    candidates: Vec<Server>,
    label: &str,
) -> Option<Server> {
    for server in candidates {
        job.log.write(&format!(
            "    Contacting '{}:{}'...\n",
            server.address, server.port
        ));

        let mut client = Client::new(None).with_timeout(cx.config().response_timeout());
        let ready = client.connect(&server.address, server.port).await.is_ok()
            && client.send_command(&Message::new("STATUS")).await.is_ok()
            && client
                .wait_response()
                .await
                .is_some_and(|r| r.is("READY"));
        client.close();

        if ready {
            job.log.write(&format!("    {label} found\n"));
            return Some(server);
        }
    }
    None
}

/// Log the alert, harvest the logs of the server the job talks to and mark
/// the job as failed.
pub(crate) async fn fail_with_logs<X: JobExt>(
    cx: &TaskContext,
    job: &mut Job<X>,
    alert: Alert,
) -> Result<(), TaskError> {
    job.log.write(&format!("ERROR - {}\n", alert.message));
    if let Some(details) = &alert.details {
        job.log.write(&format!("        {details}\n"));
    }

    if let Some(client) = job.client.as_mut() {
        match get_server_logs(
            cx.store(),
            &cx.config().log_files_root,
            client,
            job.record.logs,
            None,
        )
        .await
        {
            Ok(logs) => {
                job.record.logs = logs;
                cx.store().save(&job.record)?;
            }
            Err(e) => error!(job = job.id(), error = %e, "cannot collect the server logs"),
        }
    }

    job.mark_as_failed(Some(alert)).await?;
    Ok(())
}
