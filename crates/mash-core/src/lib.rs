//! Job scheduling engine of the MASH platform.
//!
//! The [`Scheduler`] receives commands from the web application through its
//! listener, routes them to the [`ScheduledTask`]s of the static
//! [`registry`], and drives every task from a single cooperative loop.

pub mod config;
pub use config::{MailConfig, SchedulerConfig};

mod error;
pub use error::{MailError, TaskError};

pub mod mailer;
pub use mailer::{LogMailer, Mailer, MemoryMailer, SmtpMailer};

pub mod utils;

mod jobs;
pub use jobs::{Job, JobExt, JobList};

pub mod task;
pub use task::{CommandSpec, ParamType, ScheduledTask, Services, Task, TaskContext, TaskEngine};

pub mod registry;

mod listener;
pub use listener::{CommandTable, SchedulerListener};

mod scheduler;
pub use scheduler::Scheduler;

pub mod tasks;
