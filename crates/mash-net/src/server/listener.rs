use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use mash_observe::OutStream;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::{Connection, Message, TransportError};

/// What the connection handler does after a command was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Keep reading commands.
    None,
    CloseConnection,
    /// Tell the server to go to sleep, then keep reading commands.
    Sleep,
}

/// Protocol logic of a listening component, one instance per connection.
#[async_trait]
pub trait Listener: Send {
    async fn handle_command(&mut self, session: &mut Session, command: &Message) -> Action;
}

/// Builds the listener of each accepted connection.
pub type ListenerFactory = Arc<dyn Fn() -> Box<dyn Listener> + Send + Sync>;

/// One accepted connection.
pub struct Session {
    id: u64,
    peer: SocketAddr,
    conn: Connection<TcpStream>,
    log: OutStream,
}

impl Session {
    pub(crate) fn new(id: u64, peer: SocketAddr, stream: TcpStream) -> Self {
        Self {
            id,
            peer,
            conn: Connection::new(stream),
            log: OutStream::memory(format!("Client-{id}")),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn log(&self) -> &OutStream {
        &self.log
    }

    pub async fn send_response(&mut self, response: &Message) -> Result<(), TransportError> {
        self.log.write(&format!("> {response}\n"));
        let res = self.conn.send_message(response).await;
        if let Err(e) = &res {
            self.log
                .write(&format!("ERROR: Failed to send the response, reason: {e}\n"));
        }
        res
    }

    pub async fn send_data(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.log.write(&format!("> <{} bytes of data>\n", data.len()));
        let res = self.conn.send_data(data).await;
        if let Err(e) = &res {
            self.log
                .write(&format!("ERROR: Failed to send the data, reason: {e}\n"));
        }
        res
    }

    /// Read a command outside of the regular dispatch loop.
    pub async fn wait_message(&mut self) -> Option<Message> {
        match self.conn.wait_message().await {
            Ok(Some(msg)) => {
                self.log.write(&format!("< {msg}\n"));
                Some(msg)
            }
            Ok(None) => None,
            Err(e) => {
                self.log
                    .write(&format!("ERROR: Failed to wait for a message, reason: {e}\n"));
                None
            }
        }
    }

    pub async fn wait_data(&mut self, size: usize) -> Option<Vec<u8>> {
        match self.conn.wait_data(size).await {
            Ok(Some(data)) => {
                self.log.write(&format!("< <{size} bytes of data>\n"));
                Some(data)
            }
            Ok(None) => {
                self.log
                    .write(&format!("ERROR: Failed to wait for {size} bytes of data\n"));
                None
            }
            Err(e) => {
                self.log.write(&format!(
                    "ERROR: Failed to wait for {size} bytes of data, reason: {e}\n"
                ));
                None
            }
        }
    }

    pub(crate) async fn next_command(
        &mut self,
        interrupt: &CancellationToken,
    ) -> Result<Option<Message>, TransportError> {
        let command = self.conn.wait_message_or_cancel(interrupt).await?;
        if let Some(command) = &command {
            self.log.write(&format!("< {command}\n"));
        }
        Ok(command)
    }
}

/// Handles the clients the server cannot take right now.
///
/// `INFO` is still answered by a regular listener; anything else but the
/// polite `DONE`/`SLEEP` gets `BUSY` and the connection is closed.
pub struct BusyListener {
    factory: ListenerFactory,
}

impl BusyListener {
    pub fn new(factory: ListenerFactory) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl Listener for BusyListener {
    async fn handle_command(&mut self, session: &mut Session, command: &Message) -> Action {
        match command.name.as_str() {
            "INFO" => {
                let mut listener = (self.factory)();
                listener.handle_command(session, command).await
            }
            "DONE" => {
                let _ = session.send_response(&Message::new("GOODBYE")).await;
                Action::CloseConnection
            }
            "SLEEP" => {
                let _ = session.send_response(&Message::new("OK")).await;
                Action::Sleep
            }
            _ => {
                let _ = session.send_response(&Message::new("BUSY")).await;
                Action::CloseConnection
            }
        }
    }
}
