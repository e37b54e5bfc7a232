//! Generic step engine shared by every task.
//!
//! A [`Task`] only describes its protocol: the commands and events it
//! accepts and what one step of a job does. The [`TaskEngine`] owns the job
//! list and drives the steps from the scheduler loop through the
//! object-safe [`ScheduledTask`] interface.

mod engine;
pub use engine::TaskEngine;

mod context;
pub use context::{Services, TaskContext};

use async_trait::async_trait;
use mash_model::RecordId;
use mash_net::{Message, Param};

use crate::{Job, JobExt, JobList, TaskError};

/// Type a parameter of a command or event is converted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Int,
    Float,
    Str,
}

impl ParamType {
    /// `None` when `value` cannot be represented with this type.
    pub fn coerce(self, value: &Param) -> Option<Param> {
        match self {
            ParamType::Int => value
                .as_int()
                .or_else(|| {
                    value
                        .as_float()
                        .filter(|f| f.fract() == 0.0)
                        .map(|f| f as i64)
                })
                .map(Param::Int),
            ParamType::Float => value.as_float().map(Param::Float),
            ParamType::Str => Some(Param::Str(value.to_string())),
        }
    }
}

/// Name and parameter types of a command (or event) a task accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    pub name: &'static str,
    pub params: &'static [ParamType],
}

impl CommandSpec {
    pub const fn new(name: &'static str, params: &'static [ParamType]) -> Self {
        Self { name, params }
    }

    #[inline]
    pub fn arity(&self) -> usize {
        self.params.len()
    }

    /// Copy of `message` with every parameter converted to its declared type.
    pub fn coerce(&self, message: &Message) -> Option<Message> {
        if message.params.len() != self.arity() {
            return None;
        }
        let params = self
            .params
            .iter()
            .zip(&message.params)
            .map(|(ty, value)| ty.coerce(value))
            .collect::<Option<Vec<_>>>()?;
        Some(Message::with_params(message.name.clone(), params))
    }
}

/// Protocol of one kind of job.
///
/// Steps are resumable: a step sends a command, stores in
/// `job.operation` the step handling its response, and returns. The engine
/// calls [`step`](Task::step) again once the response is readable.
#[async_trait]
pub trait Task: Send + Sync + 'static {
    type Ext: JobExt;

    const NAME: &'static str;

    /// Commands received from the outside, each one becoming a job.
    fn commands(&self) -> &'static [CommandSpec];

    /// Messages emitted by other tasks.
    fn events(&self) -> &'static [CommandSpec] {
        &[]
    }

    /// Re-create the jobs left over by a previous run.
    async fn on_startup(
        &mut self,
        _cx: &TaskContext,
        _jobs: &mut JobList<Self::Ext>,
    ) -> Result<(), TaskError> {
        Ok(())
    }

    /// Handle a command without creating a job. `false` lets the engine
    /// queue a job for it.
    async fn on_command_received(
        &mut self,
        _cx: &TaskContext,
        _jobs: &mut JobList<Self::Ext>,
        _command: &Message,
    ) -> Result<bool, TaskError> {
        Ok(false)
    }

    /// Returns the jobs created for the event.
    async fn on_event_received(
        &mut self,
        _cx: &TaskContext,
        _jobs: &mut JobList<Self::Ext>,
        _event: &Message,
    ) -> Result<Vec<RecordId>, TaskError> {
        Ok(Vec::new())
    }

    /// Run `job.operation`, or the entry point when it is `None`.
    async fn step(&mut self, cx: &TaskContext, job: &mut Job<Self::Ext>) -> Result<(), TaskError>;
}

/// A task as seen by the scheduler loop.
#[async_trait]
pub trait ScheduledTask: Send + Sync {
    fn name(&self) -> &'static str;

    fn commands(&self) -> &'static [CommandSpec];

    fn events(&self) -> &'static [CommandSpec];

    /// Recover the pending jobs and try to start them.
    async fn start(&mut self);

    /// Running jobs are scheduled again, to be restarted by the next run.
    async fn stop(&mut self);

    /// Seconds the loop may sleep before this task needs attention.
    fn timeout(&self) -> Option<i64>;

    /// Resolves once a running job has something to read. Never resolves
    /// when no job is waiting for a response.
    async fn wait_readable(&self);

    async fn on_event(&mut self, elapsed: i64);

    /// `false` when the message is not for this task.
    async fn process_message(&mut self, message: &Message) -> bool;

    async fn process_new_jobs(&mut self);

    fn has_pending_events(&self) -> bool;

    /// Events emitted by the task since the last call.
    async fn take_events(&mut self) -> Vec<Message>;
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUN: CommandSpec = CommandSpec::new("RUN_EXPERIMENT", &[ParamType::Int]);

    #[test]
    fn coerce_converts_integral_values() {
        let msg = RUN.coerce(&Message::decode("RUN_EXPERIMENT '12'")).unwrap();
        assert_eq!(msg, Message::new("RUN_EXPERIMENT").arg(12));

        let msg = RUN.coerce(&Message::new("RUN_EXPERIMENT").arg(3.0)).unwrap();
        assert_eq!(msg.int(0), Some(3));
    }

    #[test]
    fn coerce_rejects_bad_values_and_arity() {
        assert!(RUN.coerce(&Message::decode("RUN_EXPERIMENT abc")).is_none());
        assert!(RUN.coerce(&Message::decode("RUN_EXPERIMENT 1.5")).is_none());
        assert!(RUN.coerce(&Message::decode("RUN_EXPERIMENT")).is_none());
        assert!(RUN.coerce(&Message::decode("RUN_EXPERIMENT 1 2")).is_none());
    }

    #[test]
    fn strings_accept_anything() {
        let spec = CommandSpec::new("SAY", &[ParamType::Str, ParamType::Float]);
        let msg = spec.coerce(&Message::decode("SAY 42 1")).unwrap();
        assert_eq!(msg.param(0), Some(&Param::Str("42".into())));
        assert_eq!(msg.param(1), Some(&Param::Float(1.0)));
    }
}
