//! Lazily established, shared broker connection.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::broker::{BrokerChannel, BrokerConnection, Connector};
use crate::config::BrokerSettings;
use crate::error::QueueError;

/// Owns the single broker connection of the process.
///
/// The connection is opened on first use and reopened when it is found closed.
/// Every channel is multiplexed over it; callers get channels through
/// [`open_channel`](ConnectionManager::open_channel) and never hold the connection
/// across a reconnect.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    settings: BrokerSettings,
    connection: Mutex<Option<Arc<dyn BrokerConnection>>>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, settings: BrokerSettings) -> Self {
        Self {
            connector,
            settings,
            connection: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    /// Returns the open connection, connecting first if there is none.
    ///
    /// Check and creation happen under one lock, so concurrent callers never open
    /// a second connection. Connection failures are logged and returned as is.
    pub async fn acquire_connection(&self) -> Result<Arc<dyn BrokerConnection>, QueueError> {
        let mut current = self.connection.lock().await;

        if let Some(connection) = current.as_ref() {
            if connection.is_open() {
                return Ok(connection.clone());
            }
            if !self.settings.automatic_recovery {
                log::error!(
                    "RabbitMQ connection to {} is closed and automatic recovery is disabled",
                    self.settings.endpoint()
                );
                return Err(QueueError::connectivity(format!(
                    "connection to {} is closed",
                    self.settings.endpoint()
                )));
            }
            log::warn!(
                "RabbitMQ connection to {} is closed, reconnecting...",
                self.settings.endpoint()
            );
            *current = None;
        }

        match self.connector.connect(&self.settings).await {
            Ok(connection) => {
                log::info!(
                    "RabbitMQ connection established to {} as '{}'",
                    self.settings.endpoint(),
                    self.settings.client_provided_name
                );
                *current = Some(connection.clone());
                Ok(connection)
            }
            Err(e) => {
                log::error!("Failed to connect to RabbitMQ at {}: {}", self.settings.endpoint(), e);
                Err(e)
            }
        }
    }

    /// Opens a new channel on the managed connection.
    pub async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, QueueError> {
        let connection = self.acquire_connection().await?;
        connection.create_channel().await.map_err(|e| {
            log::error!("Failed to open a channel on {}: {}", self.settings.endpoint(), e);
            e
        })
    }

    /// Closes the managed connection, if any. A later acquire reconnects.
    pub async fn shutdown(&self) -> Result<(), QueueError> {
        let Some(connection) = self.connection.lock().await.take() else {
            return Ok(());
        };
        if connection.is_open() {
            connection.close().await?;
        }
        log::info!("RabbitMQ connection to {} closed", self.settings.endpoint());
        Ok(())
    }
}
