use std::{path::PathBuf, time::Duration};

use mash_observe::LoggerConfig;
use serde::Deserialize;

/// Settings of the scheduler daemon, usually read from a TOML file.
///
/// Every field has a default so a partial file (or none at all) is valid.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Address the listener binds to. Empty means every interface.
    pub address: String,
    pub port: u16,
    /// Concurrent clients of the listener, `0` for no limit.
    pub max_clients: usize,
    /// Served clients after which the listener log is rotated.
    pub log_limit: usize,
    /// Folder of the scheduler, task and job logs. In memory when unset.
    pub log_folder: Option<PathBuf>,
    /// Root of the log files harvested from the servers.
    pub log_files_root: PathBuf,
    pub data_reports_root: PathBuf,
    pub models_root: PathBuf,
    /// Base URL of the web application, used for the links of alert mails.
    pub website_url: String,
    pub heuristics_repository_url: String,
    /// Repository of the uploaded heuristics not checked yet, as given to
    /// the Compilation Servers.
    pub upload_repository_url: String,
    /// Local folder of the uploaded heuristics, one sub-folder per author.
    pub upload_repository: PathBuf,
    /// Local folder of the checked heuristics, one sub-folder per author.
    pub heuristics_repository: PathBuf,
    /// Root of the files generated for the website (clustering results).
    pub snippets_root: PathBuf,
    /// Root of the data recorded by the Debugging Servers.
    pub debugging_root: PathBuf,
    /// Ceiling of concurrently running jobs per task.
    pub nb_max_jobs: usize,
    /// How long a job waits for an answer of a remote server.
    pub response_timeout_secs: u64,
    /// JSON file persisting the record store.
    pub store_snapshot: Option<PathBuf>,
    pub mail: MailConfig,
    pub logger: LoggerConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: 10000,
            max_clients: 0,
            log_limit: 100,
            log_folder: None,
            log_files_root: PathBuf::from("logs/files"),
            data_reports_root: PathBuf::from("data_reports"),
            models_root: PathBuf::from("models"),
            website_url: "http://localhost:8000".to_string(),
            heuristics_repository_url: "file://heuristics".to_string(),
            upload_repository_url: "file://upload".to_string(),
            upload_repository: PathBuf::from("repositories/upload"),
            heuristics_repository: PathBuf::from("repositories/heuristics"),
            snippets_root: PathBuf::from("snippets"),
            debugging_root: PathBuf::from("debugging"),
            nb_max_jobs: 20,
            response_timeout_secs: 300,
            store_snapshot: None,
            mail: MailConfig::default(),
            logger: LoggerConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// `None` disables the timeout.
    pub fn response_timeout(&self) -> Option<Duration> {
        (self.response_timeout_secs > 0).then(|| Duration::from_secs(self.response_timeout_secs))
    }

    /// Path template of the log file of a job, when logs are written to disk.
    pub fn job_log_template(&self, task: &str, job: mash_model::RecordId) -> Option<String> {
        self.log_folder.as_ref().map(|folder| {
            format!(
                "{}/task-{}-job-{job}.log",
                folder.display(),
                task.to_lowercase()
            )
        })
    }

    pub fn task_log_template(&self, task: &str) -> Option<String> {
        self.log_folder.as_ref().map(|folder| {
            format!(
                "{}/task-{}-$TIMESTAMP.log",
                folder.display(),
                task.to_lowercase()
            )
        })
    }
}

/// Administrators e-mails.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MailConfig {
    pub from: String,
    pub admins: Vec<String>,
    /// No SMTP host means mails are only logged.
    pub smtp_host: Option<String>,
    pub smtp_port: Option<u16>,
    pub smtp_tls: bool,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            from: "MASH Scheduler <scheduler@localhost>".to_string(),
            admins: Vec::new(),
            smtp_host: None,
            smtp_port: None,
            smtp_tls: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.nb_max_jobs, 20);
        assert_eq!(cfg.log_limit, 100);
        assert_eq!(cfg.response_timeout(), Some(Duration::from_secs(300)));
        assert!(cfg.job_log_template("ExperimentLauncher", 3).is_none());
    }

    #[test]
    fn zero_timeout_disables_it() {
        let cfg = SchedulerConfig {
            response_timeout_secs: 0,
            ..Default::default()
        };
        assert!(cfg.response_timeout().is_none());
    }

    #[test]
    fn log_templates_use_lower_case_task_name() {
        let cfg = SchedulerConfig {
            log_folder: Some(PathBuf::from("/var/log/mash")),
            ..Default::default()
        };
        assert_eq!(
            cfg.job_log_template("ExperimentLauncher", 12).as_deref(),
            Some("/var/log/mash/task-experimentlauncher-job-12.log")
        );
        assert_eq!(
            cfg.task_log_template("ServersChecker").as_deref(),
            Some("/var/log/mash/task-serverschecker-$TIMESTAMP.log")
        );
    }
}
