//! Producer side: turning a template and a recipient list into queued mail jobs.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::MailJob;
use crate::error::BoxError;
use crate::publisher::Publisher;

/// The parts of a stored email template a job needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub subject: String,
    pub body: String,
    pub is_html: bool,
}

impl Template {
    pub fn job_for(&self, recipient: &str) -> MailJob {
        MailJob::new(recipient, self.subject.clone(), self.body.clone(), self.is_html)
    }
}

/// Looks templates up by identifier.
#[async_trait]
pub trait TemplateLookup: Send + Sync {
    async fn find_template(&self, id: i64) -> Result<Option<Template>, BoxError>;
}

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("email template {0} not found")]
    TemplateNotFound(i64),

    #[error("template lookup failed: {0}")]
    Lookup(#[source] BoxError),
}

/// Result of queueing one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueReport {
    pub total: usize,
    pub queued: usize,
    /// Recipients whose job could not be published.
    pub failed: Vec<String>,
}

/// Trims entries, keeps the ones that look like addresses (contain `@`) and drops
/// duplicates, keeping first-seen order.
pub fn normalize_recipients<I, S>(raw: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    raw.into_iter()
        .filter_map(|entry| {
            let entry = entry.as_ref().trim();
            (!entry.is_empty() && entry.contains('@')).then(|| entry.to_string())
        })
        .filter(|entry| seen.insert(entry.clone()))
        .collect()
}

/// Publishes one durable job per recipient.
///
/// A failed publish is logged and reported; the rest of the batch still goes out.
pub async fn enqueue_template(
    publisher: &Publisher,
    queue_name: &str,
    template: &Template,
    recipients: &[String],
) -> EnqueueReport {
    let mut report = EnqueueReport {
        total: recipients.len(),
        ..Default::default()
    };

    for recipient in recipients {
        match publisher.publish(queue_name, &template.job_for(recipient), true).await {
            Ok(_) => report.queued += 1,
            Err(e) => {
                log::error!("Failed to enqueue email for {}: {}", recipient, e);
                report.failed.push(recipient.clone());
            }
        }
    }

    log::info!(
        "{} of {} emails queued on '{}'",
        report.queued,
        report.total,
        queue_name
    );
    report
}

/// Resolves `template_id` and queues one job per normalized recipient.
pub async fn enqueue_from_lookup(
    lookup: &dyn TemplateLookup,
    template_id: i64,
    publisher: &Publisher,
    queue_name: &str,
    recipients: &[String],
) -> Result<EnqueueReport, EnqueueError> {
    let template = lookup
        .find_template(template_id)
        .await
        .map_err(EnqueueError::Lookup)?
        .ok_or(EnqueueError::TemplateNotFound(template_id))?;

    let recipients = normalize_recipients(recipients);
    Ok(enqueue_template(publisher, queue_name, &template, &recipients).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_trims_filters_and_dedupes() {
        let raw = vec![" a@x.com ", "", "not-an-address", "b@x.com", "a@x.com", "  "];
        assert_eq!(
            normalize_recipients(raw),
            vec!["a@x.com".to_string(), "b@x.com".to_string()]
        );
    }

    #[test]
    fn template_builds_plain_jobs() {
        let template = Template {
            subject: "S".into(),
            body: "B".into(),
            is_html: true,
        };
        let job = template.job_for("a@x.com");
        assert_eq!(job.to, "a@x.com");
        assert!(job.is_html);
        assert!(job.cc.is_empty());
    }
}
