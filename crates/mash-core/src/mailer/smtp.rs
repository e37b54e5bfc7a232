use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor, message::Mailbox,
    transport::smtp::authentication::Credentials,
};
use tracing::debug;

use super::Mailer;
use crate::MailError;

/// Delivers mails to the administrators through an SMTP relay.
#[derive(Debug)]
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
}

impl SmtpMailer {
    /// Port defaults to 587. Credentials come from `SMTP_USERNAME` and
    /// `SMTP_PASSWORD` when both are set.
    pub fn from_config(
        host: &str,
        port: Option<u16>,
        tls: bool,
        from: &str,
        to: &[String],
    ) -> Result<Self, MailError> {
        let from: Mailbox = from
            .parse()
            .map_err(|e: lettre::address::AddressError| MailError::Config(e.to_string()))?;
        let to = to
            .iter()
            .map(|addr| {
                addr.parse()
                    .map_err(|e: lettre::address::AddressError| MailError::Config(e.to_string()))
            })
            .collect::<Result<Vec<Mailbox>, _>>()?;
        if to.is_empty() {
            return Err(MailError::Config("no recipient".to_string()));
        }

        let port = port.unwrap_or(587);
        let mut builder = if port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(host)
                .map_err(|e| MailError::Config(e.to_string()))?
                .port(port)
        } else if tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                .map_err(|e| MailError::Config(e.to_string()))?
                .port(port)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host).port(port)
        };
        if let (Ok(username), Ok(password)) =
            (std::env::var("SMTP_USERNAME"), std::env::var("SMTP_PASSWORD"))
        {
            builder = builder.credentials(Credentials::new(username, password));
        }

        Ok(Self {
            transport: builder.build(),
            from,
            to,
        })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send_mail(&self, subject: &str, body: &str) -> Result<(), MailError> {
        let mut builder = Message::builder().from(self.from.clone());
        for recipient in &self.to {
            builder = builder.to(recipient.clone());
        }
        let mail = builder
            .subject(subject)
            .body(body.to_string())
            .map_err(|e| MailError::Smtp(e.to_string()))?;

        self.transport
            .send(mail)
            .await
            .map_err(|e| MailError::Smtp(e.to_string()))?;
        debug!(subject, recipients = self.to.len(), "mail delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_sender_is_a_config_error() {
        let err = SmtpMailer::from_config("smtp.example.com", None, true, "nope", &[
            "admin@example.com".to_string(),
        ])
        .unwrap_err();
        assert!(matches!(err, MailError::Config(_)));
    }

    #[test]
    fn recipients_are_required() {
        let err = SmtpMailer::from_config("smtp.example.com", None, true, "a@example.com", &[])
            .unwrap_err();
        assert!(matches!(err, MailError::Config(_)));
    }
}
