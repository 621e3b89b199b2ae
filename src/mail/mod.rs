//! Mail jobs, their delivery records and the collaborators the dispatch worker uses.
//!
//! A [`MailJob`] is what travels on the queue. The [`DispatchWorker`] sends each job
//! through a [`MailTransport`] and writes one [`DeliveryAttemptRecord`] per job to an
//! [`AttemptSink`], whether the send worked or not.

mod enqueue;
mod sink;
mod smtp;
mod worker;

pub use enqueue::{
    enqueue_from_lookup, enqueue_template, normalize_recipients, EnqueueError, EnqueueReport, Template,
    TemplateLookup,
};
pub use sink::{AttemptSink, JsonLinesSink, MemorySink, SinkError};
pub use smtp::SmtpMailer;
pub use worker::DispatchWorker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Queue the worker listens on unless configured otherwise.
pub const DEFAULT_MAIL_QUEUE: &str = "mail_sharp";

/// One email to send, as carried on the queue.
///
/// Field names are camelCase on the wire; PascalCase names written by other
/// producers are accepted too. Missing or `null` cc/bcc lists read as empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailJob {
    #[serde(alias = "To")]
    pub to: String,
    #[serde(
        default,
        alias = "Cc",
        deserialize_with = "null_as_empty",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub cc: Vec<String>,
    #[serde(
        default,
        alias = "Bcc",
        deserialize_with = "null_as_empty",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub bcc: Vec<String>,
    #[serde(alias = "Subject")]
    pub subject: String,
    #[serde(alias = "Body")]
    pub body: String,
    #[serde(default, alias = "IsHtml")]
    pub is_html: bool,
}

impl MailJob {
    pub fn new(to: impl Into<String>, subject: impl Into<String>, body: impl Into<String>, is_html: bool) -> Self {
        Self {
            to: to.into(),
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: subject.into(),
            body: body.into(),
            is_html,
        }
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Outcome of one send attempt, persisted after the attempt resolves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryAttemptRecord {
    pub to: String,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    pub subject: String,
    pub body: String,
    pub is_html: bool,
    pub created_at: DateTime<Utc>,
    pub sent_successfully: bool,
    pub error_message: Option<String>,
}

impl DeliveryAttemptRecord {
    fn from_job(job: &MailJob, sent_successfully: bool, error_message: Option<String>) -> Self {
        Self {
            to: job.to.clone(),
            cc: job.cc.clone(),
            bcc: job.bcc.clone(),
            subject: job.subject.clone(),
            body: job.body.clone(),
            is_html: job.is_html,
            created_at: Utc::now(),
            sent_successfully,
            error_message,
        }
    }

    pub fn sent(job: &MailJob) -> Self {
        Self::from_job(job, true, None)
    }

    /// Record for a failed attempt. The error text is never empty.
    pub fn failed(job: &MailJob, error: impl Into<String>) -> Self {
        let mut error = error.into();
        if error.trim().is_empty() {
            error = "unknown mail transport error".to_string();
        }
        Self::from_job(job, false, Some(error))
    }
}

/// Mail transport failure.
#[derive(Debug, Error)]
pub enum MailError {
    #[error("missing required config: {0}")]
    MissingConfig(String),

    #[error("invalid email address: {0}")]
    InvalidAddress(String),

    #[error("failed to build message: {0}")]
    Build(String),

    /// The relay refused or the conversation failed. `transient` marks 4xx-class
    /// failures worth another try later.
    #[error("{message}")]
    Smtp { message: String, transient: bool },
}

impl MailError {
    pub fn is_transient(&self) -> bool {
        matches!(self, MailError::Smtp { transient: true, .. })
    }
}

/// Sends one mail job.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, job: &MailJob) -> Result<(), MailError>;
}
