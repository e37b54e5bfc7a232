use std::sync::Arc;

use mash_model::Store;
use mash_net::{Endpoint, Message};
use mash_observe::OutStream;
use tracing::{error, warn};

use crate::{Mailer, SchedulerConfig};

/// Process-wide collaborators handed to every task.
#[derive(Clone)]
pub struct Services {
    pub store: Store,
    pub config: Arc<SchedulerConfig>,
    pub mailer: Arc<dyn Mailer>,
}

impl Services {
    pub fn new(store: Store, config: SchedulerConfig, mailer: Arc<dyn Mailer>) -> Self {
        Self {
            store,
            config: Arc::new(config),
            mailer,
        }
    }
}

/// What a task sees while handling a message or a job step.
pub struct TaskContext {
    services: Services,
    events: Endpoint,
    log: OutStream,
}

impl TaskContext {
    pub(crate) fn new(services: Services, events: Endpoint, log: OutStream) -> Self {
        Self {
            services,
            events,
            log,
        }
    }

    #[inline]
    pub fn store(&self) -> &Store {
        &self.services.store
    }

    #[inline]
    pub fn config(&self) -> &SchedulerConfig {
        &self.services.config
    }

    pub(crate) fn services(&self) -> &Services {
        &self.services
    }

    /// Log of the task.
    #[inline]
    pub fn log(&self) -> &OutStream {
        &self.log
    }

    /// Emit an event for the other tasks.
    pub fn send_event(&self, event: &Message) {
        self.log.write(&format!("Send event: {event}\n"));
        if let Err(e) = self.events.send_message(event) {
            warn!(event = %event, error = %e, "cannot emit the event");
        }
    }

    /// Mail the administrators. Failures are only logged.
    pub async fn mail_admins(&self, subject: &str, body: &str) {
        if let Err(e) = self.services.mailer.send_mail(subject, body).await {
            error!(subject, error = %e, "cannot mail the administrators");
            self.log
                .write(&format!("ERROR - Failed to send a mail: {e}\n"));
        }
    }
}
