//! Durable record store shared by the scheduler and its tasks.
//!
//! Every mutation is committed on its own: there is no transaction spanning
//! several calls. When a snapshot path is configured, the whole content is
//! rewritten (atomically, through a temporary file) after each mutation and
//! reloaded on start-up.

mod error;
pub use error::StoreError;

mod tables;
pub use tables::{Entity, Tables};

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard},
};

use tracing::{debug, trace};

use crate::domain::{
    Configuration, Experiment, HeuristicStatus, HeuristicVersion, JobRecord, JobStatus,
    Notification, RecordId, Setting,
};

/// In-memory record storage with optional JSON persistence.
#[derive(Clone, Default)]
pub struct Store {
    inner: Arc<RwLock<Tables>>,
    snapshot: Option<PathBuf>,
}

impl Store {
    /// Create an empty, purely in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store persisted to `path`, loading its previous content if the file exists.
    pub fn with_snapshot(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let tables = if path.exists() {
            let raw = fs::read(&path)?;
            debug!(path = %path.display(), "loading store snapshot");
            serde_json::from_slice(&raw)?
        } else {
            Tables::default()
        };
        Ok(Self {
            inner: Arc::new(RwLock::new(tables)),
            snapshot: Some(path),
        })
    }

    pub fn get<T: Entity>(&self, id: RecordId) -> Option<T> {
        T::table(&self.read()).get(&id).cloned()
    }

    /// All records of a table, in insertion order.
    pub fn all<T: Entity>(&self) -> Vec<T> {
        T::table(&self.read()).values().cloned().collect()
    }

    pub fn filter<T: Entity>(&self, pred: impl Fn(&T) -> bool) -> Vec<T> {
        T::table(&self.read())
            .values()
            .filter(|r| pred(*r))
            .cloned()
            .collect()
    }

    pub fn find<T: Entity>(&self, pred: impl Fn(&T) -> bool) -> Option<T> {
        T::table(&self.read()).values().find(|r| pred(*r)).cloned()
    }

    pub fn count<T: Entity>(&self, pred: impl Fn(&T) -> bool) -> usize {
        T::table(&self.read()).values().filter(|r| pred(*r)).count()
    }

    /// Store a new record and return it with its assigned id.
    pub fn insert<T: Entity>(&self, mut value: T) -> Result<T, StoreError> {
        self.mutate(|tables| {
            let id = tables.allocate(value.id());
            value.set_id(id);
            T::table_mut(tables).insert(id, value.clone());
            trace!(kind = T::KIND, id, "record inserted");
            value
        })
    }

    /// Overwrite an already inserted record.
    pub fn save<T: Entity>(&self, value: &T) -> Result<(), StoreError> {
        if value.id() <= 0 {
            return Err(StoreError::NotInserted { kind: T::KIND });
        }
        self.mutate(|tables| {
            T::table_mut(tables).insert(value.id(), value.clone());
        })
    }

    /// Returns whether a record was removed.
    pub fn delete<T: Entity>(&self, id: RecordId) -> Result<bool, StoreError> {
        self.mutate(|tables| T::table_mut(tables).remove(&id).is_some())
    }

    /// Returns the number of removed records.
    pub fn delete_where<T: Entity>(&self, pred: impl Fn(&T) -> bool) -> Result<usize, StoreError> {
        self.mutate(|tables| {
            let table = T::table_mut(tables);
            let before = table.len();
            table.retain(|_, r| !pred(&*r));
            before - table.len()
        })
    }

    /// Value of a configuration setting, if it exists.
    pub fn try_get_setting(&self, configuration: RecordId, name: &str) -> Option<String> {
        self.find::<Setting>(|s| s.configuration == configuration && s.name == name)
            .map(|s| s.value)
    }

    /// Settings of a configuration whose name starts with `prefix`, in insertion order.
    pub fn settings_with_prefix(&self, configuration: RecordId, prefix: &str) -> Vec<Setting> {
        self.filter::<Setting>(|s| s.configuration == configuration && s.name.starts_with(prefix))
    }

    /// Create or update a configuration setting.
    pub fn add_setting(
        &self,
        configuration: RecordId,
        name: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        match self.find::<Setting>(|s| s.configuration == configuration && s.name == name) {
            Some(mut setting) => {
                setting.value = value.to_string();
                self.save(&setting)
            }
            None => self
                .insert(Setting {
                    configuration,
                    name: name.to_string(),
                    value: value.to_string(),
                    ..Default::default()
                })
                .map(|_| ()),
        }
    }

    /// Create or update the notification `name` of an experiment.
    pub fn upsert_notification(
        &self,
        experiment: RecordId,
        name: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        match self.find::<Notification>(|n| n.experiment == experiment && n.name == name) {
            Some(mut notification) => {
                notification.value = value.to_string();
                self.save(&notification)
            }
            None => self
                .insert(Notification {
                    experiment,
                    name: name.to_string(),
                    value: value.to_string(),
                    ..Default::default()
                })
                .map(|_| ()),
        }
    }

    pub fn delete_notifications(&self, experiment: RecordId) -> Result<usize, StoreError> {
        self.delete_where::<Notification>(|n| n.experiment == experiment)
    }

    /// Highest public version of the heuristic `version` belongs to.
    pub fn latest_public_version(&self, version: &HeuristicVersion) -> Option<HeuristicVersion> {
        self.filter::<HeuristicVersion>(|hv| {
            hv.public && hv.status != HeuristicStatus::Deleted && hv.same_heuristic(version)
        })
        .into_iter()
        .max_by_key(|hv| hv.version)
    }

    /// Job currently running on a server, if any.
    pub fn current_job(&self, server: RecordId) -> Option<JobRecord> {
        self.find::<JobRecord>(|j| j.status == JobStatus::Running && j.server == Some(server))
    }

    /// Remove a configuration with its settings and experiments.
    pub fn delete_configuration(&self, configuration: RecordId) -> Result<(), StoreError> {
        for experiment in self.filter::<Experiment>(|e| e.configuration == configuration) {
            self.delete_notifications(experiment.id)?;
            self.delete::<Experiment>(experiment.id)?;
        }
        self.delete_where::<Setting>(|s| s.configuration == configuration)?;
        self.delete::<Configuration>(configuration)?;
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut Tables) -> R) -> Result<R, StoreError> {
        let mut tables = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let out = f(&mut tables);
        if let Some(path) = &self.snapshot {
            persist(path, &tables)?;
        }
        Ok(out)
    }
}

fn persist(path: &Path, tables: &Tables) -> Result<(), StoreError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
    fs::write(&tmp, serde_json::to_vec_pretty(tables)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ExperimentStatus;

    #[test]
    fn insert_assigns_increasing_ids() {
        let store = Store::new();
        let a = store.insert(JobRecord::default()).unwrap();
        let b = store.insert(JobRecord::default()).unwrap();
        assert!(a.id > 0);
        assert!(b.id > a.id);
        assert_eq!(store.all::<JobRecord>().len(), 2);
    }

    #[test]
    fn insert_keeps_explicit_id() {
        let store = Store::new();
        let exp = store
            .insert(Experiment {
                id: 42,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(exp.id, 42);

        let next = store.insert(JobRecord::default()).unwrap();
        assert_eq!(next.id, 43);
    }

    #[test]
    fn save_requires_inserted_record() {
        let store = Store::new();
        let err = store.save(&JobRecord::default()).unwrap_err();
        assert!(matches!(err, StoreError::NotInserted { kind: "jobs" }));
    }

    #[test]
    fn save_overwrites_record() {
        let store = Store::new();
        let mut exp = store.insert(Experiment::default()).unwrap();
        exp.status = ExperimentStatus::Running;
        store.save(&exp).unwrap();

        let back = store.get::<Experiment>(exp.id).unwrap();
        assert_eq!(back.status, ExperimentStatus::Running);
    }

    #[test]
    fn delete_where_removes_matching_records() {
        let store = Store::new();
        for status in [JobStatus::Running, JobStatus::Delayed, JobStatus::Done] {
            store
                .insert(JobRecord {
                    status,
                    ..Default::default()
                })
                .unwrap();
        }

        let removed = store
            .delete_where::<JobRecord>(|j| {
                matches!(j.status, JobStatus::Running | JobStatus::Delayed)
            })
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.count::<JobRecord>(|_| true), 1);
    }

    #[test]
    fn try_get_setting_distinguishes_missing() {
        let store = Store::new();
        store.add_setting(1, "USE_PREDICTOR", "user/svm").unwrap();

        assert_eq!(
            store.try_get_setting(1, "USE_PREDICTOR").as_deref(),
            Some("user/svm")
        );
        assert!(store.try_get_setting(1, "USE_PREDICTOR_MODEL").is_none());
        assert!(store.try_get_setting(2, "USE_PREDICTOR").is_none());
    }

    #[test]
    fn add_setting_updates_existing_value() {
        let store = Store::new();
        store.add_setting(1, "USE_GLOBAL_SEED", "1").unwrap();
        store.add_setting(1, "USE_GLOBAL_SEED", "1 2 3").unwrap();

        assert_eq!(store.count::<Setting>(|_| true), 1);
        assert_eq!(
            store.try_get_setting(1, "USE_GLOBAL_SEED").as_deref(),
            Some("1 2 3")
        );
    }

    #[test]
    fn settings_with_prefix_keeps_insertion_order() {
        let store = Store::new();
        store.add_setting(1, "EXPERIMENT_SETUP/B", "2").unwrap();
        store.add_setting(1, "PREDICTOR_SETUP/X", "x").unwrap();
        store.add_setting(1, "EXPERIMENT_SETUP/A", "1").unwrap();

        let names: Vec<_> = store
            .settings_with_prefix(1, "EXPERIMENT_SETUP/")
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["EXPERIMENT_SETUP/B", "EXPERIMENT_SETUP/A"]);
    }

    #[test]
    fn notifications_are_upserted_by_name() {
        let store = Store::new();
        store.upsert_notification(7, "CURRENT_ROUND", "0 3").unwrap();
        store.upsert_notification(7, "CURRENT_ROUND", "1 3").unwrap();
        store.upsert_notification(8, "CURRENT_ROUND", "0 1").unwrap();

        let mine = store.filter::<Notification>(|n| n.experiment == 7);
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].value, "1 3");

        assert_eq!(store.delete_notifications(7).unwrap(), 1);
        assert_eq!(store.count::<Notification>(|_| true), 1);
    }

    #[test]
    fn latest_public_version_ignores_private_and_other_heuristics() {
        let store = Store::new();
        let version = |author: &str, name: &str, version: u32, public: bool| HeuristicVersion {
            author: author.into(),
            name: name.into(),
            version,
            public,
            ..Default::default()
        };
        let v1 = store.insert(version("User1", "h", 1, true)).unwrap();
        let v2 = store.insert(version("user1", "h", 2, true)).unwrap();
        store.insert(version("user1", "h", 3, false)).unwrap();
        store.insert(version("user2", "h", 5, true)).unwrap();

        assert_eq!(store.latest_public_version(&v1).map(|hv| hv.id), Some(v2.id));
    }

    #[test]
    fn delete_configuration_cascades() {
        let store = Store::new();
        let config = store.insert(Configuration::default()).unwrap();
        let other = store.insert(Configuration::default()).unwrap();
        store.add_setting(config.id, "USE_PREDICTOR", "user/svm").unwrap();
        store.add_setting(other.id, "USE_PREDICTOR", "user/svm").unwrap();
        let exp = store
            .insert(Experiment {
                configuration: config.id,
                ..Default::default()
            })
            .unwrap();
        store.upsert_notification(exp.id, "CURRENT_ROUND", "0 1").unwrap();

        store.delete_configuration(config.id).unwrap();

        assert!(store.get::<Configuration>(config.id).is_none());
        assert!(store.get::<Experiment>(exp.id).is_none());
        assert_eq!(store.count::<Setting>(|_| true), 1);
        assert_eq!(store.count::<Notification>(|_| true), 0);
    }

    #[test]
    fn current_job_only_considers_running_jobs() {
        let store = Store::new();
        store
            .insert(JobRecord {
                status: JobStatus::Delayed,
                server: Some(4),
                ..Default::default()
            })
            .unwrap();
        assert!(store.current_job(4).is_none());

        let running = store
            .insert(JobRecord {
                status: JobStatus::Running,
                server: Some(4),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(store.current_job(4).map(|j| j.id), Some(running.id));
    }

    #[test]
    fn snapshot_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("store.json");

        let store = Store::with_snapshot(&path).unwrap();
        let job = store
            .insert(JobRecord {
                command: "RUN_EXPERIMENT 3".into(),
                status: JobStatus::Running,
                ..Default::default()
            })
            .unwrap();
        drop(store);

        let reloaded = Store::with_snapshot(&path).unwrap();
        let back = reloaded.get::<JobRecord>(job.id).unwrap();
        assert_eq!(back.command, "RUN_EXPERIMENT 3");
        assert_eq!(back.status, JobStatus::Running);

        let next = reloaded.insert(JobRecord::default()).unwrap();
        assert!(next.id > job.id);
    }
}
