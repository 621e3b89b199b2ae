#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mail_dispatch::broker::memory::MemoryBroker;
use mail_dispatch::mail::{MailError, MailJob, MailTransport};
use mail_dispatch::{BrokerSettings, ConnectionManager, HandlerError, MessageHandler, RetryEnvelope};
use tokio::sync::Mutex;

pub fn manager(broker: &MemoryBroker) -> Arc<ConnectionManager> {
    Arc::new(ConnectionManager::new(Arc::new(broker.clone()), BrokerSettings::default()))
}

/// Polls `condition` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition().await {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn sample_job() -> MailJob {
    MailJob::new("a@x.com", "S", "B", false)
}

/// Fails the first `failures` deliveries, then succeeds. Records every envelope seen.
pub struct FlakyHandler {
    failures: usize,
    pub seen: Mutex<Vec<(MailJob, RetryEnvelope)>>,
}

impl FlakyHandler {
    pub fn failing(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures,
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn always_failing() -> Arc<Self> {
        Self::failing(usize::MAX)
    }

    pub async fn attempts(&self) -> usize {
        self.seen.lock().await.len()
    }

    pub async fn retry_counts(&self) -> Vec<u32> {
        self.seen.lock().await.iter().map(|(_, e)| e.retry_count).collect()
    }
}

#[async_trait]
impl MessageHandler for FlakyHandler {
    type MessageType = MailJob;

    async fn handle_message(&self, message: MailJob, envelope: &RetryEnvelope) -> Result<(), HandlerError> {
        let mut seen = self.seen.lock().await;
        seen.push((message, envelope.clone()));
        if seen.len() <= self.failures {
            return Err(HandlerError::from(format!("simulated failure #{}", seen.len())));
        }
        Ok(())
    }

    fn handler_name(&self) -> &str {
        "FlakyHandler"
    }
}

/// Mail transport returning scripted outcomes, then success.
#[derive(Default)]
pub struct ScriptedTransport {
    outcomes: Mutex<Vec<Result<(), MailError>>>,
    pub sent: Mutex<Vec<MailJob>>,
}

impl ScriptedTransport {
    pub fn new(outcomes: Vec<Result<(), MailError>>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub async fn calls(&self) -> usize {
        self.sent.lock().await.len()
    }
}

#[async_trait]
impl MailTransport for ScriptedTransport {
    async fn send(&self, job: &MailJob) -> Result<(), MailError> {
        self.sent.lock().await.push(job.clone());
        let mut outcomes = self.outcomes.lock().await;
        if outcomes.is_empty() {
            Ok(())
        } else {
            outcomes.remove(0)
        }
    }
}
