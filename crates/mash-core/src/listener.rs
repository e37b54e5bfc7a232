use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use mash_net::{Action, Endpoint, Listener, ListenerFactory, Message, Param, Session};
use tracing::{debug, warn};

use crate::CommandSpec;

pub const PROTOCOL: &str = "1.2";

/// Commands forwarded to the scheduler, with their number of parameters.
#[derive(Debug, Clone, Default)]
pub struct CommandTable {
    arity: HashMap<&'static str, usize>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: &CommandSpec) {
        if let Some(previous) = self.arity.insert(spec.name, spec.arity())
            && previous != spec.arity()
        {
            warn!(command = spec.name, previous, now = spec.arity(), "command registered twice");
        }
    }

    pub fn arity(&self, name: &str) -> Option<usize> {
        self.arity.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.arity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arity.is_empty()
    }
}

struct Shared {
    commands: CommandTable,
    mailbox: Endpoint,
}

/// Answers the clients of the scheduler (mostly the web application) and
/// forwards the commands of the tasks to the scheduler loop.
pub struct SchedulerListener {
    shared: Arc<Shared>,
}

impl SchedulerListener {
    /// `mailbox` is the writing side of the scheduler input channel.
    pub fn factory(commands: CommandTable, mailbox: Endpoint) -> ListenerFactory {
        let shared = Arc::new(Shared { commands, mailbox });
        Arc::new(move || {
            Box::new(SchedulerListener {
                shared: shared.clone(),
            }) as Box<dyn Listener>
        })
    }
}

/// Close the connection when the response cannot be sent.
async fn reply(session: &mut Session, response: &Message) -> Action {
    match session.send_response(response).await {
        Ok(()) => Action::None,
        Err(_) => Action::CloseConnection,
    }
}

#[async_trait]
impl Listener for SchedulerListener {
    async fn handle_command(&mut self, session: &mut Session, command: &Message) -> Action {
        match command.name.as_str() {
            "STATUS" => reply(session, &Message::new("READY")).await,
            "INFO" => {
                if session
                    .send_response(&Message::new("TYPE").arg("Scheduler"))
                    .await
                    .is_err()
                {
                    return Action::CloseConnection;
                }
                reply(
                    session,
                    &Message::new("PROTOCOL").arg(Param::guess(PROTOCOL)),
                )
                .await
            }
            "DONE" => {
                let _ = session.send_response(&Message::new("GOODBYE")).await;
                Action::CloseConnection
            }
            name => match self.shared.commands.arity(name) {
                Some(arity) if arity != command.params.len() => {
                    reply(session, &Message::new("INVALID_ARGUMENT")).await
                }
                Some(_) => {
                    debug!(client = session.id(), command = %command, "forwarding command");
                    if let Err(e) = self.shared.mailbox.send_message(command) {
                        warn!(command = %command, error = %e, "scheduler mailbox closed");
                    }
                    reply(session, &Message::new("OK")).await
                }
                None => reply(session, &Message::new("UNKNOWN_COMMAND").arg(name)).await,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ParamType;
    use mash_net::{ChannelKind, Connection, Server, channel};
    use tokio::net::TcpStream;

    async fn ask(conn: &mut Connection<TcpStream>, line: &str) -> Message {
        conn.send_message(&Message::decode(line)).await.unwrap();
        conn.wait_message().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn forwards_registered_commands_only() {
        let mut commands = CommandTable::new();
        commands.register(&CommandSpec::new("RUN_EXPERIMENT", &[ParamType::Int]));
        let (writer, mut mailbox) = channel::create(ChannelKind::Multiplexing);

        let mut server = Server::new("Scheduler", 0);
        let port = server.listen("127.0.0.1", 0).unwrap().port();
        let stop = server.stop_token();
        let factory = SchedulerListener::factory(commands, writer);
        let running = tokio::spawn(async move { server.run(factory).await });

        let mut conn = Connection::new(TcpStream::connect(("127.0.0.1", port)).await.unwrap());
        assert_eq!(ask(&mut conn, "STATUS").await, Message::new("READY"));
        assert_eq!(
            ask(&mut conn, "RUN_EXPERIMENT").await,
            Message::new("INVALID_ARGUMENT")
        );
        assert_eq!(ask(&mut conn, "RUN_EXPERIMENT 4").await, Message::new("OK"));
        assert_eq!(
            ask(&mut conn, "CHECK_HEURISTIC 1").await,
            Message::new("UNKNOWN_COMMAND").arg("CHECK_HEURISTIC")
        );
        assert_eq!(ask(&mut conn, "DONE").await, Message::new("GOODBYE"));

        assert_eq!(
            mailbox.wait_message(true).await,
            Some(Message::new("RUN_EXPERIMENT").arg(4))
        );
        assert!(!mailbox.has_pending());

        stop.cancel();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn info_reports_the_protocol() {
        let (writer, _mailbox) = channel::create(ChannelKind::Multiplexing);
        let mut server = Server::new("Scheduler", 1);
        let port = server.listen("127.0.0.1", 0).unwrap().port();
        let stop = server.stop_token();
        let running = tokio::spawn({
            let factory = SchedulerListener::factory(CommandTable::new(), writer);
            async move { server.run(factory).await }
        });

        let mut conn = Connection::new(TcpStream::connect(("127.0.0.1", port)).await.unwrap());
        conn.send_message(&Message::new("INFO")).await.unwrap();
        assert_eq!(
            conn.wait_message().await.unwrap(),
            Some(Message::new("TYPE").arg("Scheduler"))
        );
        let protocol = conn.wait_message().await.unwrap().unwrap();
        assert_eq!(protocol.to_string(), "PROTOCOL 1.2");

        stop.cancel();
        running.await.unwrap().unwrap();
    }
}
