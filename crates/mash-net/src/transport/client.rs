use std::time::Duration;

use mash_observe::OutStream;
use tokio::net::TcpStream;
use tracing::{debug, instrument};

use super::{Connection, TransportError};
use crate::Message;

/// Connection to one server of the farm, as seen by a job.
///
/// Every exchange is written to the job's log: commands as `> ...`, responses
/// as `< ...`. Waiting for a response never fails loudly: a transport error,
/// a timeout or the peer going away are logged and reported as `None`.
#[derive(Debug, Default)]
pub struct Client {
    conn: Option<Connection<TcpStream>>,
    log: Option<OutStream>,
    timeout: Option<Duration>,
}

impl Client {
    pub fn new(log: Option<OutStream>) -> Self {
        Self {
            conn: None,
            log,
            timeout: None,
        }
    }

    /// Bound every connection attempt and blocking wait.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn connect(&mut self, address: &str, port: u16) -> Result<(), TransportError> {
        self.close();
        self.write(&format!(
            "Trying to establish a connection to '{address}:{port}'\n"
        ));

        let attempt = TcpStream::connect((address, port));
        let res = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, attempt)
                .await
                .map_err(|_| TransportError::Timeout(limit.as_secs()))
                .and_then(|r| r.map_err(TransportError::from)),
            None => attempt.await.map_err(TransportError::from),
        };

        match res {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                self.conn = Some(Connection::new(stream));
                self.write("Connection established with the server\n");
                Ok(())
            }
            Err(e) => {
                debug!(error = %e, "connection failed");
                self.write("ERROR - Failed to establish a connection with the server\n");
                Err(e)
            }
        }
    }

    pub fn close(&mut self) {
        self.conn = None;
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    pub async fn send_command(&mut self, command: &Message) -> Result<(), TransportError> {
        let conn = self.conn.as_mut().ok_or(TransportError::NotConnected)?;
        let res = conn.send_message(command).await;
        self.write(&format!("> {command}\n"));
        if let Err(e) = &res {
            self.write(&format!("ERROR: Failed to send the command, reason: {e}\n"));
        }
        res
    }

    pub async fn send_data(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let conn = self.conn.as_mut().ok_or(TransportError::NotConnected)?;
        let res = conn.send_data(data).await;
        self.write(&format!("> <{} bytes of data>\n", data.len()));
        if let Err(e) = &res {
            self.write(&format!("ERROR: Failed to send the data, reason: {e}\n"));
        }
        res
    }

    pub async fn wait_response(&mut self) -> Option<Message> {
        let conn = self.conn.as_mut()?;
        match conn.wait_message_for(self.timeout).await {
            Ok(Some(response)) => {
                self.write(&format!("< {response}\n"));
                Some(response)
            }
            Ok(None) => {
                self.write("ERROR: Failed to wait for a response\n");
                None
            }
            Err(e) => {
                self.write(&format!(
                    "ERROR: Failed to wait for a response, reason: {e}\n"
                ));
                None
            }
        }
    }

    pub async fn wait_data(&mut self, size: usize) -> Option<Vec<u8>> {
        let conn = self.conn.as_mut()?;
        match conn.wait_data_for(size, self.timeout).await {
            Ok(Some(data)) => {
                self.write(&format!("< <{size} bytes of data>\n"));
                Some(data)
            }
            Ok(None) => {
                self.write(&format!("ERROR: Failed to wait for {size} bytes of data\n"));
                None
            }
            Err(e) => {
                self.write(&format!(
                    "ERROR: Failed to wait for {size} bytes of data, reason: {e}\n"
                ));
                None
            }
        }
    }

    /// Whether the next response is already buffered.
    pub fn has_response(&self) -> bool {
        self.conn.as_ref().is_some_and(Connection::has_message)
    }

    /// Whether the server closed the connection.
    pub fn at_eof(&self) -> bool {
        self.conn.as_ref().is_some_and(Connection::at_eof)
    }

    /// Buffer what the socket already holds. A read error closes the client.
    pub fn fill_nonblocking(&mut self) -> usize {
        let Some(conn) = self.conn.as_mut() else {
            return 0;
        };
        match conn.fill_nonblocking() {
            Ok(n) => n,
            Err(e) => {
                self.write(&format!("ERROR: Failed to read from the server, reason: {e}\n"));
                self.close();
                0
            }
        }
    }

    /// Underlying socket, to wait for its readiness.
    pub fn socket(&self) -> Option<&TcpStream> {
        self.conn.as_ref().map(Connection::get_ref)
    }

    fn write(&self, text: &str) {
        if let Some(log) = &self.log {
            log.write(text);
        }
    }
}
