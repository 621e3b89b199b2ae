mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, manager, sample_job, ScriptedTransport};
use mail_dispatch::broker::memory::MemoryBroker;
use mail_dispatch::mail::{MailError, MemorySink};
use mail_dispatch::{Consumer, ConsumerConfig, DispatchWorker, MailJob, Publisher, QueueError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn smtp_error(message: &str, transient: bool) -> MailError {
    MailError::Smtp {
        message: message.to_string(),
        transient,
    }
}

struct Harness {
    broker: MemoryBroker,
    publisher: Publisher,
    transport: Arc<ScriptedTransport>,
    sink: MemorySink,
    cancel: CancellationToken,
    task: JoinHandle<Result<(), QueueError>>,
}

impl Harness {
    async fn start(outcomes: Vec<Result<(), MailError>>, requeue_transient: bool) -> Self {
        let broker = MemoryBroker::new();
        let connections = manager(&broker);
        let transport = ScriptedTransport::new(outcomes);
        let sink = MemorySink::new();
        let worker = Arc::new(
            DispatchWorker::new(transport.clone(), Arc::new(sink.clone()))
                .requeue_transient_failures(requeue_transient),
        );

        let cancel = CancellationToken::new();
        let consumer = Consumer::new(connections.clone());
        let config = ConsumerConfig::builder("mail_sharp").build();
        let stop = cancel.clone();
        let task = tokio::spawn(async move { worker.run(&consumer, &config, stop).await });

        eventually(|| async { broker.consumer_count("mail_sharp").await == 1 }).await;
        Self {
            publisher: Publisher::new(connections),
            broker,
            transport,
            sink,
            cancel,
            task,
        }
    }

    async fn settled(&self) -> bool {
        self.broker.queue_len("mail_sharp").await == 0 && self.broker.unacked_count().await == 0
    }

    async fn stop(self) {
        self.cancel.cancel();
        self.task.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn successful_send_is_recorded_and_acked() {
    let harness = Harness::start(vec![], false).await;
    harness.publisher.publish("mail_sharp", &sample_job(), true).await.unwrap();

    eventually(|| async { harness.sink.records().await.len() == 1 }).await;
    eventually(|| harness.settled()).await;

    let records = harness.sink.records().await;
    assert!(records[0].sent_successfully);
    assert_eq!(records[0].error_message, None);
    assert_eq!(records[0].to, "a@x.com");
    assert_eq!(harness.transport.calls().await, 1);
    harness.stop().await;
}

#[tokio::test]
async fn smtp_failure_is_recorded_once_and_not_retried() {
    let harness = Harness::start(vec![Err(smtp_error("SMTP auth error", false))], false).await;
    harness.publisher.publish("mail_sharp", &sample_job(), true).await.unwrap();

    eventually(|| async { harness.sink.records().await.len() == 1 }).await;
    eventually(|| harness.settled()).await;

    let records = harness.sink.records().await;
    assert!(!records[0].sent_successfully);
    assert_eq!(records[0].error_message.as_deref(), Some("SMTP auth error"));
    assert_eq!(records[0].subject, "S");
    assert_eq!(harness.transport.calls().await, 1);
    assert_eq!(harness.broker.queue_len("mail_sharp_dead").await, 0);
    harness.stop().await;
}

#[tokio::test]
async fn transient_failure_is_final_by_default() {
    let harness = Harness::start(vec![Err(smtp_error("mailbox busy", true))], false).await;
    harness.publisher.publish("mail_sharp", &sample_job(), true).await.unwrap();

    eventually(|| async { harness.sink.records().await.len() == 1 }).await;
    eventually(|| harness.settled()).await;

    assert_eq!(harness.transport.calls().await, 1);
    harness.stop().await;
}

#[tokio::test]
async fn transient_failure_is_retried_when_enabled() {
    let harness = Harness::start(vec![Err(smtp_error("mailbox busy", true))], true).await;
    harness.publisher.publish("mail_sharp", &sample_job(), true).await.unwrap();

    eventually(|| async { harness.sink.records().await.len() == 2 }).await;
    eventually(|| harness.settled()).await;

    let records = harness.sink.records().await;
    assert!(!records[0].sent_successfully);
    assert!(records[1].sent_successfully);
    assert_eq!(harness.transport.calls().await, 2);
    harness.stop().await;
}

#[tokio::test]
async fn permanent_failure_is_not_retried_even_when_enabled() {
    let harness = Harness::start(vec![Err(smtp_error("550 no such user", false))], true).await;
    harness.publisher.publish("mail_sharp", &sample_job(), true).await.unwrap();

    eventually(|| async { harness.sink.records().await.len() == 1 }).await;
    eventually(|| harness.settled()).await;

    assert_eq!(harness.transport.calls().await, 1);
    harness.stop().await;
}

#[tokio::test]
async fn unrecorded_attempt_is_dead_lettered_without_another_send() {
    let harness = Harness::start(vec![], false).await;
    harness.sink.refuse_writes(Some("db down".into())).await;
    harness.publisher.publish("mail_sharp", &sample_job(), true).await.unwrap();

    eventually(|| async { harness.broker.queue_len("mail_sharp_dead").await == 1 }).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(harness.transport.calls().await, 1);
    assert!(harness.sink.records().await.is_empty());
    assert!(harness.settled().await);

    let dead = harness.broker.messages("mail_sharp_dead").await;
    let job: MailJob = serde_json::from_slice(&dead[0].data).unwrap();
    assert_eq!(job, sample_job());
    harness.stop().await;
}

#[tokio::test]
async fn transient_retries_are_bounded() {
    let outcomes = (0..5).map(|_| Err(smtp_error("mailbox busy", true))).collect();
    let harness = Harness::start(outcomes, true).await;
    harness.publisher.publish("mail_sharp", &sample_job(), true).await.unwrap();

    eventually(|| async { harness.broker.queue_len("mail_sharp_dead").await == 1 }).await;
    eventually(|| harness.settled()).await;

    // one send and one record per delivery, three deliveries in total
    assert_eq!(harness.transport.calls().await, 3);
    let records = harness.sink.records().await;
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| !r.sent_successfully));
    harness.stop().await;
}

#[tokio::test]
async fn undecodable_job_does_not_block_the_queue() {
    let harness = Harness::start(vec![], false).await;
    harness
        .publisher
        .publish("mail_sharp", &serde_json::json!({"unexpected": true}), true)
        .await
        .unwrap();
    harness.publisher.publish("mail_sharp", &sample_job(), true).await.unwrap();

    eventually(|| async { harness.broker.queue_len("mail_sharp_dead").await == 1 }).await;
    eventually(|| harness.settled()).await;

    assert_eq!(harness.transport.calls().await, 1);
    assert_eq!(harness.sink.records().await.len(), 1);
    harness.stop().await;
}

#[tokio::test]
async fn jobs_are_dispatched_in_queue_order() {
    let harness = Harness::start(vec![], false).await;
    for n in 0..5 {
        let job = MailJob::new(format!("user{}@x.com", n), "S", "B", false);
        harness.publisher.publish("mail_sharp", &job, true).await.unwrap();
    }

    eventually(|| async { harness.sink.records().await.len() == 5 }).await;
    let recipients: Vec<_> = harness.sink.records().await.into_iter().map(|r| r.to).collect();
    assert_eq!(
        recipients,
        (0..5).map(|n| format!("user{}@x.com", n)).collect::<Vec<_>>()
    );
    harness.stop().await;
}
