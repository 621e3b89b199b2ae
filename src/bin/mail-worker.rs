use std::sync::Arc;
use std::time::Duration;

use mail_dispatch::broker::amqp::AmqpConnector;
use mail_dispatch::mail::{JsonLinesSink, SmtpMailer};
use mail_dispatch::{
    BrokerSettings, ConnectionManager, Consumer, DispatchWorker, EnvConfig, QueueTopology, SmtpSettings,
    WorkerSettings,
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let (broker, smtp, settings) = match load_settings() {
        Ok(settings) => settings,
        Err(e) => {
            log::error!("Invalid configuration: {}", e);
            std::process::exit(2);
        }
    };

    log::info!("Using RabbitMQ at {}", broker.endpoint());
    let connections = Arc::new(ConnectionManager::new(Arc::new(AmqpConnector), broker));

    // The worker cannot do anything without its queue pair, so a failure here is fatal.
    let topology = QueueTopology::new(connections.clone());
    if let Err(e) = topology.ensure_queue(&settings.queue_name, true).await {
        log::error!(
            "Could not declare queue '{}' and its dead-letter queue, shutting down: {}",
            settings.queue_name,
            e
        );
        std::process::exit(1);
    }

    let mailer = match SmtpMailer::from_settings(&smtp) {
        Ok(mailer) => mailer,
        Err(e) => {
            log::error!("Invalid SMTP configuration: {}", e);
            std::process::exit(2);
        }
    };
    let sink = JsonLinesSink::new(settings.attempt_log.clone());
    log::info!("Recording delivery attempts to {}", sink.path().display());

    let worker = Arc::new(
        DispatchWorker::new(Arc::new(mailer), Arc::new(sink))
            .requeue_transient_failures(settings.requeue_transient_failures),
    );
    let consumer = Consumer::new(connections.clone());
    let config = settings.consumer_config();
    let reconnect_delay = Duration::from_secs(settings.reconnect_delay);

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Ctrl+C received. Shutting down.");
        }
        shutdown.cancel();
    });

    // The application is in control of the run loop.
    let mut exit_code = 0;
    loop {
        match worker.clone().run(&consumer, &config, cancel.clone()).await {
            Ok(()) => break,
            Err(e) if cancel.is_cancelled() => {
                log::warn!("Worker stopped with an error during shutdown: {}", e);
                break;
            }
            Err(e) if !e.is_connectivity() => {
                log::error!("Worker failed and cannot recover: {}", e);
                exit_code = 1;
                break;
            }
            Err(e) => {
                log::error!("Worker failed: {}. Reconnecting in {:?}...", e, reconnect_delay);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(reconnect_delay) => {}
                }
            }
        }
    }

    if let Err(e) = connections.shutdown().await {
        log::warn!("Failed to close RabbitMQ connection cleanly: {}", e);
    }
    log::info!("Application has shut down.");
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}

fn load_settings() -> Result<(BrokerSettings, SmtpSettings, WorkerSettings), mail_dispatch::config::ConfigError> {
    Ok((
        BrokerSettings::from_env_with_prefix("RABBITMQ")?,
        SmtpSettings::from_env_with_prefix("SMTP")?,
        WorkerSettings::from_env_with_prefix("WORKER")?,
    ))
}
