mod cli;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use mash_core::{Scheduler, mailer};
use mash_model::Store;
use mash_observe::logger_init;

use crate::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1) Configuration
    if let Err(e) = dotenvy::dotenv()
        && !e.not_found()
    {
        return Err(e).context("failed to load .env");
    }
    let cli = Cli::parse();
    let config = cli.load_config()?;

    // 2) Logger
    logger_init(&config.logger)?;
    info!(protocol = "1.2", "MASH scheduler starting");

    // 3) Records and mails
    let store = match &config.store_snapshot {
        Some(path) => Store::with_snapshot(path)
            .with_context(|| format!("failed to load the store from {}", path.display()))?,
        None => {
            warn!("no store snapshot configured, records are kept in memory only");
            Store::new()
        }
    };
    let mailer = mailer::from_config(&config.mail)?;
    info!(admins = config.mail.admins.len(), "mailer ready");

    // 4) Scheduler
    let mut scheduler = Scheduler::new(config, store, mailer);
    let local = scheduler.listen().context("failed to listen for commands")?;
    info!(%local, commands = scheduler.commands().len(), "scheduler listening");

    // 5) Signals
    let stop = scheduler.stop_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutting down...");
        stop.cancel();
    });

    // 6) Run until stopped
    info!("press Ctrl+C to stop");
    scheduler.run().await?;
    info!("scheduler stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "cannot listen for SIGTERM"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for Ctrl+C");
    }
}
