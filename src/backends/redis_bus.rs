//! Redis Pub/Sub invalidation bus
//!
//! Publishing enqueues the encoded event on a bounded queue drained by a
//! single task, so the writer never waits on Redis and events leave this
//! process in publish order. Subscribing runs a reconnecting Pub/Sub loop;
//! messages published while the subscriber was disconnected are lost, so
//! every reconnect is reported to the handler as a gap.

use crate::error::{CacheError, CacheResult};
use crate::invalidation::{InvalidationConfig, InvalidationEvent, Subscription};
use crate::traits::{InvalidationBus, InvalidationHandler};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

const BACKEND: &str = "redis-bus";

/// Invalidation bus over a Redis Pub/Sub channel
pub struct RedisBus {
    client: redis::Client,
    config: InvalidationConfig,
    queue: mpsc::Sender<String>,
    publish_errors: Arc<AtomicU64>,
}

impl RedisBus {
    /// Connect to `REDIS_URL`, defaulting to `redis://127.0.0.1:6379`
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::BackendUnavailable`] if the connection cannot be established.
    pub async fn new(config: InvalidationConfig) -> CacheResult<Self> {
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        Self::with_url(&redis_url, config).await
    }

    /// Connect the publisher and start draining the publish queue
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::BackendUnavailable`] if the URL is invalid or the
    /// publishing connection cannot be established.
    pub async fn with_url(redis_url: &str, config: InvalidationConfig) -> CacheResult<Self> {
        let client = redis::Client::open(redis_url).map_err(|e| CacheError::backend(BACKEND, e))?;
        let connection = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| CacheError::backend(BACKEND, e))?;

        let (queue, rx) = mpsc::channel(config.publish_queue_capacity.max(1));
        let publish_errors = Arc::new(AtomicU64::new(0));
        tokio::spawn(Self::drain_queue(
            connection,
            config.channel.clone(),
            rx,
            Arc::clone(&publish_errors),
        ));

        info!(channel = %config.channel, "Redis invalidation bus connected");
        Ok(Self {
            client,
            config,
            queue,
            publish_errors,
        })
    }

    /// Events the background publisher failed to send to Redis
    #[must_use]
    pub fn publish_errors(&self) -> u64 {
        self.publish_errors.load(Ordering::Relaxed)
    }

    /// Exits once every `RedisBus` handle is gone and the queue is empty
    async fn drain_queue(
        mut connection: ConnectionManager,
        channel: String,
        mut rx: mpsc::Receiver<String>,
        publish_errors: Arc<AtomicU64>,
    ) {
        while let Some(payload) = rx.recv().await {
            let published: redis::RedisResult<usize> = connection.publish(&channel, &payload).await;
            match published {
                Ok(receivers) => debug!(receivers = receivers, "[Bus] Published to Redis"),
                Err(e) => {
                    publish_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "[Bus] Failed to publish invalidation event");
                }
            }
        }
        debug!("[Bus] Publish queue closed");
    }

    /// Returns `Ok` only on shutdown; every other exit is a lost connection
    async fn run_subscriber_loop(
        client: &redis::Client,
        channel: &str,
        handler: &Arc<dyn InvalidationHandler>,
        reconnected: bool,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        info!(channel = %channel, "Subscribed to invalidation channel");
        if reconnected {
            // Events sent while disconnected are gone.
            handler.on_gap();
        }

        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                msg = stream.next() => {
                    let Some(msg) = msg else {
                        anyhow::bail!("Pub/Sub message stream ended");
                    };
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(e) => {
                            warn!(error = %e, "[Bus] Failed to read message payload");
                            continue;
                        }
                    };
                    match InvalidationEvent::from_json(&payload) {
                        Ok(event) => handler.on_event(&event),
                        Err(e) => warn!(error = %e, "[Bus] Dropping undecodable message"),
                    }
                }
                _ = shutdown_rx.recv() => return Ok(()),
            }
        }
    }
}

#[async_trait]
impl InvalidationBus for RedisBus {
    async fn publish(&self, event: &InvalidationEvent) -> CacheResult<()> {
        let payload = event.to_json()?;
        self.queue.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                CacheError::backend(BACKEND, "publish queue full")
            }
            mpsc::error::TrySendError::Closed(_) => {
                CacheError::backend(BACKEND, "publisher stopped")
            }
        })
    }

    async fn subscribe(&self, handler: Arc<dyn InvalidationHandler>) -> CacheResult<Subscription> {
        let client = self.client.clone();
        let channel = self.config.channel.clone();
        let reconnect_delay = self.config.reconnect_delay;
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);

        let task = tokio::spawn(async move {
            let mut disconnected = false;
            loop {
                match Self::run_subscriber_loop(
                    &client,
                    &channel,
                    &handler,
                    disconnected,
                    &mut shutdown_rx,
                )
                .await
                {
                    Ok(()) => {
                        info!("Invalidation subscriber shutting down");
                        break;
                    }
                    Err(e) => {
                        error!(
                            error = %e,
                            delay_ms = reconnect_delay.as_millis(),
                            "Invalidation subscriber error, reconnecting"
                        );
                        disconnected = true;
                        tokio::select! {
                            () = tokio::time::sleep(reconnect_delay) => {}
                            _ = shutdown_rx.recv() => {
                                info!("Invalidation subscriber shutting down");
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(Subscription::new(task, shutdown_tx))
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
