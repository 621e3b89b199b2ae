//! Environment-driven settings for the broker, the SMTP relay and the dispatch worker.

use std::path::PathBuf;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::consumer::ConsumerConfig;

pub use config::ConfigError;

/// Loads a settings struct from environment variables.
///
/// Keys are matched case-insensitively against field names, so `RABBITMQ_VIRTUAL_HOST`
/// fills `virtual_host` when loaded with the `RABBITMQ` prefix.
pub trait EnvConfig: Sized {
    fn from_env() -> Result<Self, ConfigError>;
    fn from_env_with_prefix(prefix: &str) -> Result<Self, ConfigError>;
}

impl<D> EnvConfig for D
where
    D: DeserializeOwned,
{
    fn from_env() -> Result<Self, ConfigError> {
        config::Config::builder()
            .add_source(config::Environment::default())
            .build()?
            .try_deserialize()
    }

    fn from_env_with_prefix(prefix: &str) -> Result<Self, ConfigError> {
        config::Config::builder()
            .add_source(config::Environment::with_prefix(prefix))
            .build()?
            .try_deserialize()
    }
}

/// Connection settings for the RabbitMQ broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub virtual_host: String,
    /// Connection name shown in the broker management UI.
    pub client_provided_name: String,
    /// Connection timeout in milliseconds.
    pub connection_timeout: u64,
    /// Heartbeat interval in seconds.
    pub heartbeat: u16,
    /// Reopen the connection when it is found closed. When disabled a closed
    /// connection is reported as a connectivity error instead.
    pub automatic_recovery: bool,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            virtual_host: "/".to_string(),
            client_provided_name: "mail-dispatch".to_string(),
            connection_timeout: 30_000,
            heartbeat: 60,
            automatic_recovery: true,
        }
    }
}

impl BrokerSettings {
    /// `host:port/vhost`, without credentials, for log lines.
    pub fn endpoint(&self) -> String {
        format!("{}:{}{}", self.host, self.port, display_vhost(&self.virtual_host))
    }
}

fn display_vhost(vhost: &str) -> String {
    if vhost.starts_with('/') {
        vhost.to_string()
    } else {
        format!("/{}", vhost)
    }
}

/// Settings for the SMTP relay used to send mail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub sender_name: String,
    pub sender_email: String,
    /// Require STARTTLS. When false the relay upgrades opportunistically.
    pub use_starttls: bool,
    /// Connection timeout in seconds.
    pub timeout: u64,
}

impl Default for SmtpSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 587,
            username: String::new(),
            password: String::new(),
            sender_name: "Mailer".to_string(),
            sender_email: "no-reply@localhost".to_string(),
            use_starttls: true,
            timeout: 10,
        }
    }
}

/// Settings for the dispatch worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub queue_name: String,
    pub consumer_tag: Option<String>,
    pub prefetch_count: u16,
    /// Deliveries a job gets before it is moved to the dead-letter queue.
    pub max_retries: u32,
    /// Upper bound for one send-and-record cycle, in seconds.
    pub handler_timeout: Option<u64>,
    /// Retry jobs whose send failed with a transient SMTP error, after recording the attempt.
    pub requeue_transient_failures: bool,
    /// File receiving one JSON delivery attempt record per line.
    pub attempt_log: PathBuf,
    /// Delay before resubscribing after the broker connection is lost, in seconds.
    pub reconnect_delay: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            queue_name: "mail_sharp".to_string(),
            consumer_tag: None,
            prefetch_count: 1,
            max_retries: 3,
            handler_timeout: None,
            requeue_transient_failures: false,
            attempt_log: PathBuf::from("delivery-attempts.jsonl"),
            reconnect_delay: 5,
        }
    }
}

impl WorkerSettings {
    /// Consumer configuration for the worker's queue.
    pub fn consumer_config(&self) -> ConsumerConfig {
        let mut builder = ConsumerConfig::builder(self.queue_name.clone())
            .prefetch_count(self.prefetch_count)
            .max_retries(self.max_retries);
        if let Some(tag) = &self.consumer_tag {
            builder = builder.consumer_tag(tag.clone());
        }
        if let Some(secs) = self.handler_timeout {
            builder = builder.handler_timeout(Duration::from_secs(secs));
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_defaults_match_local_rabbitmq() {
        let settings = BrokerSettings::default();
        assert_eq!(settings.host, "localhost");
        assert_eq!(settings.port, 5672);
        assert_eq!(settings.username, "guest");
        assert_eq!(settings.password, "guest");
        assert_eq!(settings.virtual_host, "/");
        assert!(settings.automatic_recovery);
        assert_eq!(settings.endpoint(), "localhost:5672/");
    }

    #[test]
    fn broker_settings_from_prefixed_env() {
        std::env::set_var("CFGTEST_BROKER_HOST", "rabbit.internal");
        std::env::set_var("CFGTEST_BROKER_PORT", "5673");
        std::env::set_var("CFGTEST_BROKER_VIRTUAL_HOST", "mail");
        std::env::set_var("CFGTEST_BROKER_AUTOMATIC_RECOVERY", "false");

        let settings = BrokerSettings::from_env_with_prefix("CFGTEST_BROKER").unwrap();

        assert_eq!(settings.host, "rabbit.internal");
        assert_eq!(settings.port, 5673);
        assert_eq!(settings.virtual_host, "mail");
        assert!(!settings.automatic_recovery);
        // untouched fields keep their defaults
        assert_eq!(settings.username, "guest");
        assert_eq!(settings.endpoint(), "rabbit.internal:5673/mail");

        std::env::remove_var("CFGTEST_BROKER_HOST");
        std::env::remove_var("CFGTEST_BROKER_PORT");
        std::env::remove_var("CFGTEST_BROKER_VIRTUAL_HOST");
        std::env::remove_var("CFGTEST_BROKER_AUTOMATIC_RECOVERY");
    }

    #[test]
    fn smtp_settings_from_prefixed_env() {
        std::env::set_var("CFGTEST_SMTP_HOST", "smtp.example.com");
        std::env::set_var("CFGTEST_SMTP_USE_STARTTLS", "false");

        let settings = SmtpSettings::from_env_with_prefix("CFGTEST_SMTP").unwrap();

        assert_eq!(settings.host, "smtp.example.com");
        assert_eq!(settings.port, 587);
        assert!(!settings.use_starttls);

        std::env::remove_var("CFGTEST_SMTP_HOST");
        std::env::remove_var("CFGTEST_SMTP_USE_STARTTLS");
    }

    #[test]
    fn worker_settings_build_consumer_config() {
        let settings = WorkerSettings {
            handler_timeout: Some(30),
            prefetch_count: 4,
            max_retries: 5,
            ..Default::default()
        };
        let config = settings.consumer_config();

        assert_eq!(config.queue_name, "mail_sharp");
        assert_eq!(config.consumer_tag, "mail_sharp_consumer");
        assert_eq!(config.prefetch_count, 4);
        assert_eq!(config.handler_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.retry_policy.max_retries, 5);
        assert!(!config.auto_ack);
    }
}
