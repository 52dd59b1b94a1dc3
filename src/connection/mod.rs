//! AMQP connection ownership and recovery.
//!
//! One [`ConnectionManager`] per process owns the broker connection and the
//! single channel every publisher and listener shares. Collaborators receive
//! it by `Arc` rather than reaching for a global, so tests can wire a
//! manager of their own.
//!
//! Boot is fail-fast: [`ConnectionManager::connect`] makes one attempt and
//! errors out so the process never claims readiness without a broker.
//! Established connections that later drop are recovered by
//! [`ConnectionManager::ensure_channel`], which backs off exponentially
//! (with jitter) and logs every attempt. Publishes never wait on recovery;
//! they use the fail-fast [`ConnectionManager::channel`] accessor.

use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use lapin::options::{ConfirmSelectOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::bus::amqp::AmqpConfig;
use crate::bus::{BusError, Result};

struct Active {
    connection: Connection,
    channel: Channel,
}

/// Owns the process-wide AMQP connection, channel, and exchange topology.
pub struct ConnectionManager {
    url: String,
    exchange: String,
    reconnect_min_delay: Duration,
    reconnect_max_delay: Duration,
    state: RwLock<Option<Active>>,
    // Serializes reconnect attempts so consumers don't race to redial.
    reconnect_lock: Mutex<()>,
}

impl ConnectionManager {
    /// Connect once and declare the shared topic exchange. Makes a single
    /// attempt; an unreachable broker is the caller's error to handle.
    pub async fn connect(config: &AmqpConfig) -> Result<Arc<Self>> {
        let manager = Arc::new(Self {
            url: config.url.clone(),
            exchange: config.exchange.clone(),
            reconnect_min_delay: config.reconnect_min_delay,
            reconnect_max_delay: config.reconnect_max_delay,
            state: RwLock::new(None),
            reconnect_lock: Mutex::new(()),
        });

        let active = manager.establish().await?;
        *manager.state.write().await = Some(active);

        info!(
            exchange = %config.exchange,
            url = %config.url,
            "Connected to AMQP"
        );
        Ok(manager)
    }

    /// The topic exchange this process publishes to.
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Floor of the reconnect backoff window.
    pub fn reconnect_min_delay(&self) -> Duration {
        self.reconnect_min_delay
    }

    /// Ceiling of the reconnect backoff window.
    pub fn reconnect_max_delay(&self) -> Duration {
        self.reconnect_max_delay
    }

    /// One full connection attempt: dial, open the channel, enable publisher
    /// confirms, declare the exchange.
    async fn establish(&self) -> Result<Active> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| BusError::Connection(format!("Failed to connect: {}", e)))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| {
                BusError::Connection(format!("Failed to enable publisher confirms: {}", e))
            })?;

        channel
            .exchange_declare(
                &self.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Connection(format!("Failed to declare exchange: {}", e)))?;

        Ok(Active {
            connection,
            channel,
        })
    }

    /// Fail-fast channel accessor. Errors with [`BusError::NotConnected`]
    /// while the connection is down instead of blocking on recovery.
    pub async fn channel(&self) -> Result<Channel> {
        let state = self.state.read().await;
        match state.as_ref() {
            Some(active) if active.connection.status().connected() => Ok(active.channel.clone()),
            _ => Err(BusError::NotConnected),
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.channel().await.is_ok()
    }

    /// Channel accessor that redials with exponential backoff until the
    /// broker is reachable again. Consumer loops call this; it does not
    /// return until there is a live channel.
    pub async fn ensure_channel(&self) -> Channel {
        if let Ok(channel) = self.channel().await {
            return channel;
        }

        let _guard = self.reconnect_lock.lock().await;
        // Another task may have reconnected while we waited for the lock.
        if let Ok(channel) = self.channel().await {
            return channel;
        }

        let backoff_builder = ExponentialBuilder::default()
            .with_min_delay(self.reconnect_min_delay)
            .with_max_delay(self.reconnect_max_delay)
            .with_jitter();
        let mut backoff_iter = backoff_builder.build();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.establish().await {
                Ok(active) => {
                    let channel = active.channel.clone();
                    *self.state.write().await = Some(active);
                    info!(attempt, url = %self.url, "Reconnected to AMQP");
                    return channel;
                }
                Err(e) => {
                    let delay = backoff_iter.next().unwrap_or(self.reconnect_max_delay);
                    warn!(
                        attempt,
                        backoff_ms = %delay.as_millis(),
                        error = %e,
                        "Reconnect attempt failed, retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
