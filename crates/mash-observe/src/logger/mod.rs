mod config;
mod error;
mod format;
mod log;

pub use config::LoggerConfig;
pub use error::LoggerError;
pub use format::LoggerFormat;

/// Install the process-wide `tracing` subscriber described by `cfg`.
///
/// Fails with [`LoggerError::AlreadyInitialized`] when called twice.
pub fn logger_init(cfg: &LoggerConfig) -> Result<(), LoggerError> {
    let filter = log::mk_filter(&cfg.level)?;
    match cfg.format {
        LoggerFormat::Text => log::init_text(cfg, filter),
        LoggerFormat::Json => log::init_json(cfg, filter),
        LoggerFormat::Journald => log::init_journald(filter),
    }
}
