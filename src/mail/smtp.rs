//! SMTP transport using lettre.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::{Mailbox, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use super::{MailError, MailJob, MailTransport};
use crate::config::SmtpSettings;

/// Sends mail jobs through an authenticated SMTP relay.
#[derive(Clone)]
pub struct SmtpMailer {
    transport: Arc<AsyncSmtpTransport<Tokio1Executor>>,
    from: Mailbox,
}

impl SmtpMailer {
    /// Builds the relay client. STARTTLS is required when `use_starttls` is set and
    /// attempted opportunistically otherwise.
    pub fn from_settings(settings: &SmtpSettings) -> Result<Self, MailError> {
        if settings.host.trim().is_empty() {
            return Err(MailError::MissingConfig("SMTP host".to_string()));
        }

        let from = sender_mailbox(settings)?;

        let mut builder = if settings.use_starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host).map_err(smtp_error)?
        } else {
            let parameters = TlsParameters::new(settings.host.clone()).map_err(smtp_error)?;
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&settings.host)
                .tls(Tls::Opportunistic(parameters))
        };

        builder = builder
            .port(settings.port)
            .timeout(Some(Duration::from_secs(settings.timeout)));

        if !settings.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                settings.username.clone(),
                settings.password.clone(),
            ));
        }

        Ok(Self {
            transport: Arc::new(builder.build()),
            from,
        })
    }

    fn build_message(&self, job: &MailJob) -> Result<Message, MailError> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .to(parse_mailbox(&job.to)?)
            .subject(job.subject.as_str());

        for cc in &job.cc {
            builder = builder.cc(parse_mailbox(cc)?);
        }
        for bcc in &job.bcc {
            builder = builder.bcc(parse_mailbox(bcc)?);
        }

        let part = if job.is_html {
            SinglePart::html(job.body.clone())
        } else {
            SinglePart::plain(job.body.clone())
        };

        builder
            .singlepart(part)
            .map_err(|e| MailError::Build(e.to_string()))
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn send(&self, job: &MailJob) -> Result<(), MailError> {
        let message = self.build_message(job)?;
        self.transport.send(message).await.map_err(smtp_error)?;
        Ok(())
    }
}

fn sender_mailbox(settings: &SmtpSettings) -> Result<Mailbox, MailError> {
    let address: lettre::Address = settings
        .sender_email
        .parse()
        .map_err(|_| MailError::InvalidAddress(settings.sender_email.clone()))?;
    let name = Some(settings.sender_name.clone()).filter(|n| !n.trim().is_empty());
    Ok(Mailbox::new(name, address))
}

fn parse_mailbox(address: &str) -> Result<Mailbox, MailError> {
    address
        .trim()
        .parse()
        .map_err(|_| MailError::InvalidAddress(address.to_string()))
}

fn smtp_error(error: lettre::transport::smtp::Error) -> MailError {
    MailError::Smtp {
        transient: error.is_transient(),
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> SmtpSettings {
        SmtpSettings {
            host: "smtp.example.com".into(),
            sender_name: "Newsletter".into(),
            sender_email: "news@example.com".into(),
            ..Default::default()
        }
    }

    #[test]
    fn missing_host_is_a_config_error() {
        let err = SmtpMailer::from_settings(&SmtpSettings::default()).err().unwrap();
        assert!(matches!(err, MailError::MissingConfig(_)));
    }

    #[test]
    fn invalid_sender_is_rejected() {
        let settings = SmtpSettings {
            sender_email: "not-an-address".into(),
            ..settings()
        };
        let err = SmtpMailer::from_settings(&settings).err().unwrap();
        assert!(matches!(err, MailError::InvalidAddress(_)));
    }

    #[tokio::test]
    async fn builds_html_message_with_copies() {
        let mailer = SmtpMailer::from_settings(&settings()).unwrap();
        let mut job = MailJob::new("a@x.com", "Hello", "<p>Hi</p>", true);
        job.cc.push("c@x.com".into());
        job.bcc.push("b@x.com".into());

        let message = mailer.build_message(&job).unwrap();
        let envelope = message.envelope();
        assert_eq!(envelope.to().len(), 3);

        let formatted = String::from_utf8(message.formatted()).unwrap();
        assert!(formatted.contains("Subject: Hello"));
        assert!(formatted.contains("text/html"));
        assert!(formatted.contains("Newsletter"));
        assert!(formatted.contains("news@example.com"));
    }

    #[tokio::test]
    async fn bad_recipient_fails_before_sending() {
        let mailer = SmtpMailer::from_settings(&settings()).unwrap();
        let job = MailJob::new("nobody", "S", "B", false);

        let err = mailer.send(&job).await.unwrap_err();
        assert!(matches!(err, MailError::InvalidAddress(_)));
    }
}
