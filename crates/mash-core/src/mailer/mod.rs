//! Mails sent to the administrators of the platform.
//!
//! Failures to deliver a mail are reported to the caller, which only logs
//! them: a mail never interrupts the scheduling loop.

mod smtp;
pub use smtp::SmtpMailer;

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::{MailConfig, MailError};

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_mail(&self, subject: &str, body: &str) -> Result<(), MailError>;
}

/// Build the mailer described by `config`: SMTP when a host is configured,
/// otherwise mails only go to the log.
pub fn from_config(config: &MailConfig) -> Result<Arc<dyn Mailer>, MailError> {
    match config.smtp_host.as_deref() {
        Some(host) if !config.admins.is_empty() => Ok(Arc::new(SmtpMailer::from_config(
            host,
            config.smtp_port,
            config.smtp_tls,
            &config.from,
            &config.admins,
        )?)),
        Some(_) => {
            warn!("no administrator address configured, mails will only be logged");
            Ok(Arc::new(LogMailer))
        }
        None => Ok(Arc::new(LogMailer)),
    }
}

/// Writes every mail to the log instead of sending it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_mail(&self, subject: &str, body: &str) -> Result<(), MailError> {
        info!(subject, body_len = body.len(), "mail (not sent, no smtp host)");
        Ok(())
    }
}

/// Keeps the mails in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryMailer {
    sent: Arc<Mutex<Vec<(String, String)>>>,
}

impl MemoryMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(subject, body)` of every mail, in sending order.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Mailer for MemoryMailer {
    async fn send_mail(&self, subject: &str, body: &str) -> Result<(), MailError> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((subject.to_string(), body.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_mailer_records_mails() {
        let mailer = MemoryMailer::new();
        mailer.send_mail("[MASH ALERT] boom", "details").await.unwrap();

        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "[MASH ALERT] boom");
    }

    #[test]
    fn without_smtp_host_mails_are_logged() {
        let mailer = from_config(&MailConfig::default());
        assert!(mailer.is_ok());
    }
}
