use mash_model::{JobStatus, RecordId};
use tracing::{debug, error, info, warn};

#[inline]
pub fn message_for(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Scheduled => "job scheduled (waiting for a free slot)",
        JobStatus::Running => "job running",
        JobStatus::Delayed => "job delayed (will be rescheduled when its timer expires)",
        JobStatus::Done => "job done",
        JobStatus::Failed => "job failed",
        JobStatus::Cancelled => "job cancelled before it started",
    }
}

/// Report a job status change of `task`.
#[inline]
pub fn log_transition(task: &str, job: RecordId, status: JobStatus) {
    let msg = message_for(status);

    match status {
        JobStatus::Scheduled => debug!(task, job, "{msg}"),
        JobStatus::Running | JobStatus::Delayed | JobStatus::Done => info!(task, job, "{msg}"),
        JobStatus::Failed => error!(task, job, "{msg}"),
        JobStatus::Cancelled => warn!(task, job, "{msg}"),
    }
}
