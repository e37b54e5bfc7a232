//! Jobs of a task and their state machine.
//!
//! ```text
//! SCHEDULED --start--> RUNNING --success--> DONE
//!                      RUNNING --retry----> DELAYED --timer--> SCHEDULED
//!                      RUNNING --fatal----> FAILED
//! SCHEDULED --cancel-> CANCELLED
//! ```
//!
//! Every transition is persisted in the job record and mirrored on the
//! experiment the job works on, if any.

mod job;
pub use job::{Job, JobExt};
pub(crate) use job::JobEnv;

mod list;
pub use list::JobList;
