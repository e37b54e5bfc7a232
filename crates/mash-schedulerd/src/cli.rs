use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use mash_core::SchedulerConfig;
use mash_observe::LoggerFormat;

#[derive(Debug, Parser)]
#[command(name = "mash-schedulerd")]
#[command(about = "MASH scheduler: runs the experiments on the computation farm", long_about = None)]
#[command(version)]
pub struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "MASH_SCHEDULER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to listen on (every interface when empty)
    #[arg(long, env = "MASH_SCHEDULER_ADDRESS")]
    pub address: Option<String>,

    #[arg(short, long, env = "MASH_SCHEDULER_PORT")]
    pub port: Option<u16>,

    /// Folder of the scheduler, task and job logs
    #[arg(long, env = "MASH_LOG_FOLDER")]
    pub log_folder: Option<PathBuf>,

    /// JSON file persisting the records
    #[arg(long, env = "MASH_STORE_SNAPSHOT")]
    pub store: Option<PathBuf>,

    #[arg(long, env = "MASH_LOG_FORMAT")]
    pub log_format: Option<LoggerFormat>,

    #[arg(long, env = "MASH_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Mirror the text logs of the scheduler on the console
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Configuration file (if any) with the command-line overrides applied.
    pub fn load_config(&self) -> anyhow::Result<SchedulerConfig> {
        let mut config = match &self.config {
            Some(path) => read_config(path)?,
            None => SchedulerConfig::default(),
        };

        if let Some(address) = &self.address {
            config.address = address.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(folder) = &self.log_folder {
            config.log_folder = Some(folder.clone());
        }
        if let Some(store) = &self.store {
            config.store_snapshot = Some(store.clone());
        }
        if let Some(format) = self.log_format {
            config.logger.format = format;
        }
        if let Some(level) = &self.log_level {
            config.logger.level = level.clone();
        }
        if self.verbose {
            config.logger.level = format!("{},mash_observe=trace", config.logger.level);
        }
        Ok(config)
    }
}

fn read_config(path: &Path) -> anyhow::Result<SchedulerConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("failed to parse config: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_overrides_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scheduler.toml");
        std::fs::write(
            &path,
            "port = 11000\nnb_max_jobs = 4\n\n[mail]\nadmins = [\"root@localhost\"]\n\n[logger]\nlevel = \"debug\"\n",
        )
        .unwrap();

        let cli = Cli::parse_from([
            "mash-schedulerd",
            "--config",
            path.to_str().unwrap(),
            "--port",
            "12000",
        ]);
        let config = cli.load_config().unwrap();
        assert_eq!(config.port, 12000);
        assert_eq!(config.nb_max_jobs, 4);
        assert_eq!(config.mail.admins, vec!["root@localhost"]);
        assert_eq!(config.logger.level, "debug");
        assert_eq!(config.log_limit, 100);
    }

    #[test]
    fn missing_file_is_an_error() {
        let cli = Cli::parse_from(["mash-schedulerd", "--config", "/nonexistent/scheduler.toml"]);
        let err = cli.load_config().unwrap_err();
        assert!(err.to_string().contains("failed to read config"));
    }
}
