use std::sync::Arc;

use mash_model::{JobRecord, JobStatus, RecordId, StoreError};
use mash_net::Message;

use super::{Job, JobEnv, JobExt};

/// Jobs of one task, in scheduling order.
pub struct JobList<X: JobExt> {
    jobs: Vec<Job<X>>,
    env: Arc<JobEnv>,
}

impl<X: JobExt> JobList<X> {
    pub(crate) fn new(env: Arc<JobEnv>) -> Self {
        Self {
            jobs: Vec::new(),
            env,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Number of jobs with `status`, or of all jobs.
    pub fn count(&self, status: Option<JobStatus>) -> usize {
        match status {
            Some(status) => self.jobs.iter().filter(|j| j.status() == status).count(),
            None => self.jobs.len(),
        }
    }

    /// Whether a job already executes `command`.
    pub fn has_job(&self, command: &Message) -> bool {
        self.jobs.iter().any(|j| &j.command == command)
    }

    /// Store a new SCHEDULED job executing `command` and append it.
    pub fn add_job(&mut self, command: &Message) -> Result<RecordId, StoreError> {
        let record = self.env.store.insert(JobRecord {
            command: command.encode(),
            status: JobStatus::Scheduled,
            ..Default::default()
        })?;
        Ok(self.push(record))
    }

    /// Append a job for an already stored record.
    pub fn push(&mut self, record: JobRecord) -> RecordId {
        let id = record.id;
        self.jobs.push(Job::new(record, self.env.clone()));
        id
    }

    /// Ids of the jobs matching `status` and `command`, in order.
    pub fn get_jobs(&self, status: Option<JobStatus>, command: Option<&Message>) -> Vec<RecordId> {
        self.jobs
            .iter()
            .filter(|j| status.is_none_or(|s| j.status() == s))
            .filter(|j| command.is_none_or(|c| &j.command == c))
            .map(|j| j.id())
            .collect()
    }

    pub fn get(&self, id: RecordId) -> Option<&Job<X>> {
        self.jobs.iter().find(|j| j.id() == id)
    }

    pub fn get_mut(&mut self, id: RecordId) -> Option<&mut Job<X>> {
        self.jobs.iter_mut().find(|j| j.id() == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job<X>> {
        self.jobs.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Job<X>> {
        self.jobs.iter_mut()
    }

    pub fn remove(&mut self, id: RecordId) -> Option<Job<X>> {
        let pos = self.jobs.iter().position(|j| j.id() == id)?;
        Some(self.jobs.remove(pos))
    }

    pub fn remove_many(&mut self, ids: &[RecordId]) {
        self.jobs.retain(|j| !ids.contains(&j.id()));
    }

    /// Move a job to the back of the queue.
    pub fn reschedule(&mut self, id: RecordId) {
        if let Some(job) = self.remove(id) {
            self.jobs.push(job);
        }
    }

    /// Smallest timeout among the delayed jobs.
    pub fn next_timeout(&self) -> Option<i64> {
        self.jobs
            .iter()
            .filter(|j| j.status() == JobStatus::Delayed)
            .filter_map(|j| j.timeout)
            .min()
    }

    /// Count `elapsed` seconds down on every delayed job. The ones whose
    /// timer expired are scheduled again and returned.
    pub async fn update_timeouts(&mut self, elapsed: i64) -> Result<Vec<RecordId>, StoreError> {
        let mut expired = Vec::new();
        for job in self
            .jobs
            .iter_mut()
            .filter(|j| j.status() == JobStatus::Delayed)
        {
            let left = job.timeout.unwrap_or(0) - elapsed;
            job.timeout = Some(left);
            if left <= 0 {
                job.mark_as_scheduled().await?;
                expired.push(job.id());
            }
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SchedulerConfig;
    use mash_model::Store;

    #[derive(Default)]
    struct Plain;

    impl JobExt for Plain {
        type Operation = std::convert::Infallible;
    }

    fn list() -> (Store, JobList<Plain>) {
        let store = Store::new();
        let env = Arc::new(JobEnv {
            store: store.clone(),
            config: Arc::new(SchedulerConfig::default()),
            task: "Test",
        });
        (store, JobList::new(env))
    }

    #[tokio::test]
    async fn count_is_the_sum_of_counts_per_status() {
        let (_, mut jobs) = list();
        let ids: Vec<_> = (0..6)
            .map(|i| jobs.add_job(&Message::new("CMD").arg(i)).unwrap())
            .collect();

        jobs.get_mut(ids[0]).unwrap().mark_as_running(None, None, None).await.unwrap();
        jobs.get_mut(ids[1]).unwrap().mark_as_delayed(10).await.unwrap();
        jobs.get_mut(ids[2]).unwrap().mark_as_failed(None).await.unwrap();
        jobs.get_mut(ids[3]).unwrap().mark_as_cancelled().await.unwrap();
        jobs.get_mut(ids[4]).unwrap().mark_as_done(Default::default()).await.unwrap();

        let sum: usize = JobStatus::ALL.iter().map(|s| jobs.count(Some(*s))).sum();
        assert_eq!(jobs.count(None), sum);
        assert_eq!(jobs.count(Some(JobStatus::Scheduled)), 1);
    }

    #[tokio::test]
    async fn update_timeouts_reschedules_expired_jobs() {
        let (store, mut jobs) = list();
        let long = jobs.add_job(&Message::new("CMD").arg(1)).unwrap();
        let short = jobs.add_job(&Message::new("CMD").arg(2)).unwrap();
        jobs.get_mut(long).unwrap().mark_as_delayed(60).await.unwrap();
        jobs.get_mut(short).unwrap().mark_as_delayed(30).await.unwrap();
        assert_eq!(jobs.next_timeout(), Some(30));

        assert!(jobs.update_timeouts(20).await.unwrap().is_empty());
        assert_eq!(jobs.get(long).unwrap().timeout, Some(40));
        assert_eq!(jobs.get(short).unwrap().timeout, Some(10));
        assert_eq!(jobs.count(Some(JobStatus::Delayed)), 2);

        assert_eq!(jobs.update_timeouts(20).await.unwrap(), vec![short]);
        assert_eq!(jobs.get(short).unwrap().status(), JobStatus::Scheduled);
        assert_eq!(jobs.get(short).unwrap().timeout, None);
        assert_eq!(jobs.get(long).unwrap().status(), JobStatus::Delayed);
        assert_eq!(jobs.get(long).unwrap().timeout, Some(20));

        assert_eq!(jobs.update_timeouts(20).await.unwrap(), vec![long]);
        assert_eq!(jobs.count(Some(JobStatus::Scheduled)), 2);
        assert_eq!(
            store.get::<JobRecord>(long).unwrap().status,
            JobStatus::Scheduled
        );
    }

    #[test]
    fn has_job_compares_commands_structurally() {
        let (_, mut jobs) = list();
        jobs.add_job(&Message::decode("RUN_EXPERIMENT 3")).unwrap();

        assert!(jobs.has_job(&Message::new("RUN_EXPERIMENT").arg(3)));
        assert!(!jobs.has_job(&Message::new("RUN_EXPERIMENT").arg(4)));
        assert!(!jobs.has_job(&Message::new("RUN_EXPERIMENT").arg("3")));
        assert!(!jobs.has_job(&Message::new("CANCEL_EXPERIMENT").arg(3)));
    }

    #[test]
    fn reschedule_moves_the_job_to_the_back() {
        let (_, mut jobs) = list();
        let a = jobs.add_job(&Message::new("A")).unwrap();
        let b = jobs.add_job(&Message::new("B")).unwrap();

        jobs.reschedule(a);
        assert_eq!(jobs.get_jobs(None, None), vec![b, a]);

        jobs.remove_many(&[a, b]);
        assert!(jobs.is_empty());
    }

    #[test]
    fn get_jobs_filters_by_command() {
        let (_, mut jobs) = list();
        jobs.add_job(&Message::new("A")).unwrap();
        let b = jobs.add_job(&Message::new("B")).unwrap();

        assert_eq!(
            jobs.get_jobs(Some(JobStatus::Scheduled), Some(&Message::new("B"))),
            vec![b]
        );
        assert!(jobs.get_jobs(Some(JobStatus::Running), None).is_empty());
    }
}
