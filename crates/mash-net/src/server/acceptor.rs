use std::{
    collections::HashMap,
    io,
    net::{SocketAddr, ToSocketAddrs},
};

use mash_observe::OutStream;
use tokio::{
    net::{TcpListener, TcpSocket, TcpStream},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{Action, BusyListener, Listener, ListenerFactory, Session};
use crate::{
    Message,
    channel::{self, ChannelKind, Endpoint},
};

const RULE: &str =
    "--------------------------------------------------------------------------------\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Normal,
    /// A client asked for sleep; waiting for the remaining clients to leave.
    GoingToSleep,
    /// Every new client is handled as busy.
    Sleeping,
}

pub struct Server {
    name: String,
    max_clients: usize,
    log_limit: usize,
    log: OutStream,
    state: ServerState,
    socket: Option<TcpListener>,
    local: Option<SocketAddr>,
    handlers: HashMap<u64, JoinHandle<()>>,
    clients_counter: usize,
    next_id: u64,
    stop: CancellationToken,
}

impl Server {
    /// `max_clients == 0` means no limit.
    pub fn new(name: impl Into<String>, max_clients: usize) -> Self {
        let name = name.into();
        Self {
            log: OutStream::memory(name.clone()),
            name,
            max_clients,
            log_limit: 100,
            state: ServerState::Normal,
            socket: None,
            local: None,
            handlers: HashMap::new(),
            clients_counter: 0,
            next_id: 1,
            stop: CancellationToken::new(),
        }
    }

    /// Number of served clients after which the log is rotated.
    pub fn with_log_limit(mut self, log_limit: usize) -> Self {
        self.log_limit = log_limit;
        self
    }

    /// Write the server log to `<folder>/<name>-$TIMESTAMP.log`.
    pub fn with_log_folder(self, folder: &str) -> io::Result<Self> {
        let template = format!("{folder}/{}-$TIMESTAMP.log", self.name);
        self.log.open(&self.name, &template)?;
        Ok(self)
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn log(&self) -> &OutStream {
        &self.log
    }

    /// Token that makes [`run`](Self::run) return once cancelled.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Bind the listening socket. Port 0 picks a free port.
    pub fn listen(&mut self, host: &str, port: u16) -> io::Result<SocketAddr> {
        if host.is_empty() {
            self.log.write(&format!(
                "Start to listen for incoming connections on port {port}\n"
            ));
        } else {
            self.log.write(&format!(
                "Start to listen for incoming connections on '{host}:{port}'\n"
            ));
        }
        self.write_capacity();

        let res = bind(host, port, self.max_clients);
        match res {
            Ok(listener) => {
                let local = listener.local_addr()?;
                info!(server = %self.name, %local, "listening");
                self.local = Some(local);
                self.socket = Some(listener);
                Ok(local)
            }
            Err(e) => {
                self.log
                    .write("ERROR - Failed to listen for incoming connections\n");
                Err(e)
            }
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    /// Accept clients until the stop token is cancelled, then wait for the
    /// connection handlers to finish.
    #[instrument(level = "debug", skip(self, factory), fields(server = %self.name))]
    pub async fn run(&mut self, factory: ListenerFactory) -> io::Result<()> {
        let socket = self
            .socket
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "server not listening"))?;
        let (notifier, mut notifications) = channel::create(ChannelKind::Multiplexing);
        let interrupt = self.stop.child_token();

        loop {
            self.log.write(RULE);
            self.log.write("Waiting...\n");

            tokio::select! {
                _ = self.stop.cancelled() => break,
                Some(first) = notifications.wait_message(true) => {
                    self.process_notifications(first, &mut notifications).await;
                }
                accepted = socket.accept() => match accepted {
                    Ok((stream, peer)) => {
                        self.accept(stream, peer, &factory, &notifier, &interrupt);
                    }
                    Err(e) => {
                        warn!(server = %self.name, error = %e, "accept failed");
                        self.log
                            .write(&format!("Failed to accept a connection, reason: {e}\n"));
                    }
                },
            }

            self.rotate_log_if_needed();
        }

        drop(socket);
        self.terminate_handlers(&interrupt).await;
        Ok(())
    }

    fn accept(
        &mut self,
        stream: TcpStream,
        peer: SocketAddr,
        factory: &ListenerFactory,
        notifier: &Endpoint,
        interrupt: &CancellationToken,
    ) {
        self.log
            .write(&format!("Incoming connection from {peer}\n"));

        let busy = self.is_busy();
        let listener: Box<dyn Listener> = if busy {
            Box::new(BusyListener::new(factory.clone()))
        } else {
            factory()
        };

        let id = self.next_id;
        self.next_id += 1;
        debug!(server = %self.name, id, %peer, busy, "client accepted");

        let Some(notify) = notifier.share_writer() else {
            return;
        };
        let session = Session::new(id, peer, stream);
        let handle = tokio::spawn(handle_client(session, listener, notify, interrupt.clone()));
        self.handlers.insert(id, handle);
        self.clients_counter += 1;
    }

    fn is_busy(&self) -> bool {
        let connected = self.handlers.len();
        match self.state {
            ServerState::Sleeping => {
                self.log.write(&format!(
                    "The server is sleeping, there is currently {connected} clients connected\n"
                ));
                true
            }
            ServerState::GoingToSleep => {
                self.log.write(&format!(
                    "The server is going to sleep, there is still {connected} clients connected\n"
                ));
                true
            }
            ServerState::Normal if self.max_clients > 0 => {
                let busy = connected >= self.max_clients;
                let verdict = if busy { "busy" } else { "available" };
                self.log.write(&format!(
                    "The server is {verdict} ({connected}/{} client(s) connected)\n",
                    self.max_clients
                ));
                busy
            }
            ServerState::Normal => {
                self.log.write(&format!(
                    "The server is available ({connected} client(s) connected)\n"
                ));
                false
            }
        }
    }

    async fn process_notifications(&mut self, first: Message, notifications: &mut Endpoint) {
        let mut next = Some(first);
        let mut done = 0;
        while let Some(message) = next {
            let id = message.int(0).unwrap_or_default() as u64;
            match message.name.as_str() {
                "SLEEP" => {
                    self.log.write("Going to sleep...\n");
                    self.state = ServerState::GoingToSleep;
                }
                "DONE" => {
                    if self.handlers.remove(&id).is_some() {
                        done += 1;
                    }
                }
                other => debug!(server = %self.name, notification = other, "ignored"),
            }
            next = notifications.wait_message(false).await;
        }

        match done {
            0 => {}
            1 => self.log.write("One client is done\n"),
            n => self.log.write(&format!("{n} clients are done\n")),
        }

        if self.state == ServerState::GoingToSleep && self.handlers.is_empty() {
            self.log.write("Sleeping...\n");
            info!(server = %self.name, "server sleeping");
            self.state = ServerState::Sleeping;
        }
    }

    fn rotate_log_if_needed(&mut self) {
        if self.clients_counter < self.log_limit || !self.handlers.is_empty() {
            return;
        }
        self.log.write(RULE);
        if let Err(e) = self.log.reopen() {
            warn!(server = %self.name, error = %e, "cannot rotate the server log");
        }
        self.log.write_stamped("Reset of the log file\n");
        if let Some(local) = self.local {
            self.log
                .write(&format!("Listen for incoming connections on '{local}'\n"));
        }
        self.write_capacity();
        self.clients_counter = 0;
    }

    fn write_capacity(&self) {
        if self.max_clients > 0 {
            self.log.write(&format!(
                "This server only supports {} client(s) at the same time\n",
                self.max_clients
            ));
        } else {
            self.log
                .write("This server supports an unlimited amount of clients\n");
        }
    }

    async fn terminate_handlers(&mut self, interrupt: &CancellationToken) {
        interrupt.cancel();
        for (id, handle) in self.handlers.drain() {
            if let Err(e) = handle.await {
                warn!(server = %self.name, id, error = %e, "connection handler ended abnormally");
            }
        }
        info!(server = %self.name, "server stopped");
    }
}

fn bind(host: &str, port: u16, max_clients: usize) -> io::Result<TcpListener> {
    let host = if host.is_empty() { "0.0.0.0" } else { host };
    let addr = (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, host.to_string()))?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    let backlog = (max_clients * 2).max(10) as u32;
    socket.listen(backlog)
}

async fn handle_client(
    mut session: Session,
    mut listener: Box<dyn Listener>,
    notify: Endpoint,
    interrupt: CancellationToken,
) {
    let id = session.id();
    loop {
        let command = match session.next_command(&interrupt).await {
            Ok(Some(command)) => command,
            Ok(None) => break,
            Err(e) => {
                session
                    .log()
                    .write(&format!("ERROR: Failed to wait for a command, reason: {e}\n"));
                break;
            }
        };

        match listener.handle_command(&mut session, &command).await {
            Action::None => {}
            Action::Sleep => {
                let _ = notify.send_message(&Message::new("SLEEP").arg(id as i64));
            }
            Action::CloseConnection => break,
        }
    }

    session.log().delete();
    drop(session);
    let _ = notify.send_message(&Message::new("DONE").arg(id as i64));
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Echo;

    #[async_trait]
    impl Listener for Echo {
        async fn handle_command(&mut self, session: &mut Session, command: &Message) -> Action {
            match command.name.as_str() {
                "SLEEP" => {
                    let _ = session.send_response(&Message::new("OK")).await;
                    Action::Sleep
                }
                "DONE" => Action::CloseConnection,
                _ => {
                    let _ = session.send_response(command).await;
                    Action::None
                }
            }
        }
    }

    #[tokio::test]
    async fn stop_token_ends_the_server() {
        let mut server = Server::new("Echo", 0);
        server.listen("127.0.0.1", 0).unwrap();
        let stop = server.stop_token();

        let handle = tokio::spawn(async move {
            let factory: ListenerFactory = Arc::new(|| Box::new(Echo) as Box<dyn Listener>);
            server.run(factory).await.map(|_| server)
        });
        stop.cancel();
        let server = handle.await.unwrap().unwrap();
        assert!(server.log().dump(0).unwrap().contains("unlimited amount of clients"));
    }

    #[test]
    fn run_requires_listen() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let mut server = Server::new("Echo", 0);
        let factory: ListenerFactory = Arc::new(|| Box::new(Echo) as Box<dyn Listener>);
        let err = rt.block_on(server.run(factory)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }
}
