use std::{future, io, net::SocketAddr, sync::Arc};

use futures::future::select_all;
use mash_model::{JobRecord, JobStatus, Store};
use mash_net::{
    Message, Server,
    channel::{self, ChannelKind, Endpoint},
};
use mash_observe::OutStream;
use time::OffsetDateTime;
use tokio::time::{Duration, Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    CommandTable, Mailer, ScheduledTask, SchedulerConfig, SchedulerListener, Services,
    listener::PROTOCOL, registry,
};

const RULE: &str = "----------------------------------------------------------------\n";

/// Owns the listener and the tasks, and runs the event loop driving them.
pub struct Scheduler {
    services: Services,
    tasks: Vec<Box<dyn ScheduledTask>>,
    commands: CommandTable,
    log: OutStream,
    log_started: OffsetDateTime,
    stop: CancellationToken,
    server: Option<Server>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, store: Store, mailer: Arc<dyn Mailer>) -> Self {
        let log = open_log(&config);
        log.write(&format!("Scheduler, protocol {PROTOCOL}\n"));

        let services = Services::new(store, config, mailer);
        let tasks = registry::build_all(&services);

        let mut commands = CommandTable::new();
        for task in &tasks {
            log.write(&format!("Loading the task '{}'\n", task.name()));
            log.write("    Supported commands:\n");
            for spec in task.commands() {
                log.write(&format!("        - {}\n", spec.name));
                commands.register(spec);
            }
        }

        Self {
            services,
            tasks,
            commands,
            log,
            log_started: OffsetDateTime::now_utc(),
            stop: CancellationToken::new(),
            server: None,
        }
    }

    pub fn store(&self) -> &Store {
        &self.services.store
    }

    pub fn commands(&self) -> &CommandTable {
        &self.commands
    }

    /// Token that makes [`run`](Self::run) return once cancelled.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Bind the listener. Must precede [`run`](Self::run) to know the port
    /// when the configured one is `0`.
    pub fn listen(&mut self) -> io::Result<SocketAddr> {
        let config = &self.services.config;
        let mut server = Server::new("Scheduler", config.max_clients).with_log_limit(config.log_limit);
        if let Some(folder) = &config.log_folder {
            server = server.with_log_folder(&folder.to_string_lossy())?;
        }
        let address = if config.address.is_empty() {
            "0.0.0.0"
        } else {
            config.address.as_str()
        };
        let local = server.listen(address, config.port)?;
        self.log
            .write(&format!("Listening for commands on {local}\n"));
        self.server = Some(server);
        Ok(local)
    }

    /// Run until the stop token is cancelled.
    #[instrument(level = "debug", skip(self))]
    pub async fn run(&mut self) -> io::Result<()> {
        if self.server.is_none() {
            self.listen()?;
        }
        let Some(mut server) = self.server.take() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "scheduler not listening"));
        };

        // 1) Listener
        let (writer, mut mailbox) = channel::create(ChannelKind::Multiplexing);
        let server_stop = server.stop_token();
        self.recover_jobs(&writer);
        let factory = SchedulerListener::factory(self.commands.clone(), writer);
        let listener = tokio::spawn(async move { server.run(factory).await });
        info!("listener started");

        // 2) Tasks
        for task in &mut self.tasks {
            task.start().await;
        }
        info!(tasks = self.tasks.len(), "tasks started");

        // 3) Event loop
        let mut last = Instant::now();
        loop {
            self.rotate_log_if_needed();

            let timeout = self.timeout();
            match timeout {
                None => self.log.write("Waiting for an event, no timeout...\n"),
                Some(secs) => self.log.write(&format!(
                    "Waiting for an event, with a timeout of {secs} seconds...\n"
                )),
            }

            let mut received = Vec::new();
            tokio::select! {
                _ = self.stop.cancelled() => break,
                Some(message) = mailbox.wait_message(true) => received.push(message),
                _ = any_readable(&self.tasks) => {}
                _ = sleep_for(timeout) => {}
            }
            while let Some(message) = mailbox.wait_message(false).await {
                received.push(message);
            }

            let elapsed = last.elapsed().as_secs();
            if elapsed > 0 {
                last += Duration::from_secs(elapsed);
            }
            for task in &mut self.tasks {
                task.on_event(elapsed as i64).await;
            }

            for task in &mut self.tasks {
                received.extend(task.take_events().await);
            }
            for message in received {
                self.dispatch(&message).await;
            }

            for task in &mut self.tasks {
                task.process_new_jobs().await;
            }
        }

        // 4) Shutdown
        self.log.write("Scheduler stopped\n");
        for task in &mut self.tasks {
            task.stop().await;
        }
        server_stop.cancel();
        match listener.await {
            Ok(res) => res?,
            Err(e) => error!(error = %e, "listener task panicked"),
        }
        self.log.close();
        info!("scheduler stopped");
        Ok(())
    }

    /// Jobs interrupted by a crash are deleted and their commands received
    /// again, as if a client had just sent them.
    fn recover_jobs(&self, mailbox: &Endpoint) {
        let store = &self.services.store;
        let jobs = store.filter::<JobRecord>(|job| {
            matches!(job.status, JobStatus::Running | JobStatus::Delayed)
        });
        if jobs.is_empty() {
            return;
        }
        info!(count = jobs.len(), "rescheduling interrupted jobs");

        for job in jobs {
            self.log
                .write(&format!("Rescheduling the job #{}: {}\n", job.id, job.command));
            if let Err(e) = mailbox.send_message(&Message::decode(&job.command)) {
                warn!(job = job.id, error = %e, "cannot reschedule the job");
                continue;
            }
            if let Err(e) = store.delete::<JobRecord>(job.id) {
                warn!(job = job.id, error = %e, "cannot delete the interrupted job");
            }
        }
    }

    /// Offer the message to each task in turn, until one accepts it.
    async fn dispatch(&mut self, message: &Message) {
        self.log.write(&format!("Got message: {message}\n"));
        for task in &mut self.tasks {
            if task.process_message(message).await {
                debug!(task = task.name(), message = %message, "message handled");
                return;
            }
        }
        warn!(message = %message, "no task handles the message");
        self.log
            .write(&format!("ERROR - No task handles the message: {message}\n"));
    }

    /// Smallest timeout of the tasks, `0` when events are waiting.
    fn timeout(&self) -> Option<i64> {
        if self.tasks.iter().any(|t| t.has_pending_events()) {
            return Some(0);
        }
        self.tasks.iter().filter_map(|t| t.timeout()).min()
    }

    fn rotate_log_if_needed(&mut self) {
        let now = OffsetDateTime::now_utc();
        if now <= self.log_started + time::Duration::days(1) {
            return;
        }
        self.log_started = now;
        self.log.write(RULE);
        self.log.write("Opening a new log file...\n");
        if let Err(e) = self.log.reopen() {
            warn!(error = %e, "cannot rotate the scheduler log");
        }
    }
}

fn open_log(config: &SchedulerConfig) -> OutStream {
    let Some(folder) = &config.log_folder else {
        return OutStream::memory("Scheduler");
    };
    let log = OutStream::default();
    let template = format!("{}/scheduler-$TIMESTAMP.log", folder.display());
    match log.open("Scheduler", &template) {
        Ok(()) => log,
        Err(e) => {
            warn!(error = %e, "cannot open the scheduler log, keeping it in memory");
            OutStream::memory("Scheduler")
        }
    }
}

/// Resolves once any task has a job response to read.
async fn any_readable(tasks: &[Box<dyn ScheduledTask>]) {
    if tasks.is_empty() {
        return future::pending().await;
    }
    let waits: Vec<_> = tasks.iter().map(|t| t.wait_readable()).collect();
    let _ = select_all(waits).await;
}

async fn sleep_for(timeout: Option<i64>) {
    match timeout {
        Some(secs) => sleep(Duration::from_secs(secs.max(0) as u64)).await,
        None => future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryMailer;
    use mash_model::Alert;
    use mash_net::Connection;
    use tokio::net::TcpStream;

    fn scheduler(store: Store) -> Scheduler {
        let config = SchedulerConfig {
            address: "127.0.0.1".into(),
            port: 0,
            ..Default::default()
        };
        Scheduler::new(config, store, Arc::new(MemoryMailer::new()))
    }

    async fn wait_for_alert(store: &Store, message: &str) -> Alert {
        for _ in 0..100 {
            if let Some(alert) = store.find::<Alert>(|a| a.message == message) {
                return alert;
            }
            sleep(Duration::from_millis(20)).await;
        }
        panic!("no alert '{message}'");
    }

    #[tokio::test]
    async fn interrupted_jobs_are_received_again() {
        let store = Store::new();
        let running = store
            .insert(JobRecord {
                command: "IDENTIFY_SERVER 99".into(),
                status: JobStatus::Running,
                ..Default::default()
            })
            .unwrap();
        let done = store
            .insert(JobRecord {
                command: "IDENTIFY_SERVER 98".into(),
                status: JobStatus::Done,
                ..Default::default()
            })
            .unwrap();

        let mut scheduler = scheduler(store.clone());
        scheduler.listen().unwrap();
        let stop = scheduler.stop_token();
        let handle = tokio::spawn(async move { scheduler.run().await });

        wait_for_alert(&store, "Unknown server ID: 99").await;
        assert!(store.get::<JobRecord>(running.id).is_none());
        assert!(store.get::<JobRecord>(done.id).is_some());
        assert!(store.find::<Alert>(|a| a.message == "Unknown server ID: 98").is_none());

        stop.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn commands_of_clients_reach_their_task() {
        let store = Store::new();
        let mut scheduler = scheduler(store.clone());
        let port = scheduler.listen().unwrap().port();
        assert_eq!(scheduler.commands().arity("IDENTIFY_SERVER"), Some(1));
        let stop = scheduler.stop_token();
        let handle = tokio::spawn(async move { scheduler.run().await });

        let mut conn = Connection::new(TcpStream::connect(("127.0.0.1", port)).await.unwrap());
        conn.send_message(&Message::decode("IDENTIFY_SERVER 42"))
            .await
            .unwrap();
        assert_eq!(conn.wait_message().await.unwrap(), Some(Message::new("OK")));
        conn.send_message(&Message::new("DONE")).await.unwrap();

        let alert = wait_for_alert(&store, "Unknown server ID: 42").await;
        let job = store.get::<JobRecord>(alert.job.unwrap()).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.command, "IDENTIFY_SERVER 42");

        stop.cancel();
        handle.await.unwrap().unwrap();
    }
}
