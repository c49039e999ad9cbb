/// Share publishing - hands accepted shares to downstream accounting
///
/// The Redis publisher pushes each share as JSON on the `shares` pub/sub
/// channel. Publishing never blocks a session: shares go through a bounded
/// queue drained by a background task.

use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ProxyError, Result};
use crate::metrics::prometheus as metrics;

pub const SHARES_CHANNEL: &str = "shares";
pub const QUEUE_CAPACITY: usize = 1024;

/// Published record of one accepted share.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Share {
    pub submitter: String,
    /// Share difficulty the miner was working at.
    pub difficulty: u64,
    pub net_difficulty: u64,
    pub subsidy: f64,
    /// Miner IP.
    pub host: String,
    /// Name of the proxy instance that accepted it.
    pub server: String,
    pub valid: bool,
    #[serde(default)]
    pub block: bool,
    pub job: String,
    pub height: u64,
    pub timestamp: i64,
}

pub trait SharePublisher: Send + Sync {
    /// Fire-and-forget; an error means the share was not queued.
    fn publish(&self, share: Share) -> Result<()>;
}

/// Logs shares instead of publishing them, for runs without Redis.
#[derive(Debug, Default)]
pub struct LogPublisher;

impl SharePublisher for LogPublisher {
    fn publish(&self, share: Share) -> Result<()> {
        info!(
            submitter = %share.submitter,
            job = %share.job,
            height = share.height,
            difficulty = share.difficulty,
            block = share.block,
            "Share accepted"
        );
        Ok(())
    }
}

pub struct RedisPublisher {
    queue: mpsc::Sender<Share>,
}

impl RedisPublisher {
    /// Open the client and start the publish task. Connection is lazy.
    pub fn spawn(redis_url: &str, shutdown: CancellationToken) -> Result<(Self, JoinHandle<()>)> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| ProxyError::Publish(format!("Failed to create Redis client: {}", e)))?;

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let handle = tokio::spawn(run_publisher(client, rx, shutdown));

        Ok((Self { queue: tx }, handle))
    }
}

impl SharePublisher for RedisPublisher {
    fn publish(&self, share: Share) -> Result<()> {
        self.queue.try_send(share).map_err(|e| {
            metrics::inc_publish_dropped();
            ProxyError::Publish(format!("queue unavailable: {}", e))
        })
    }
}

async fn run_publisher(
    client: redis::Client,
    mut rx: mpsc::Receiver<Share>,
    shutdown: CancellationToken,
) {
    let mut conn: Option<redis::aio::ConnectionManager> = None;

    loop {
        let share = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = rx.recv() => match next {
                Some(share) => share,
                None => break,
            },
        };

        let payload = match serde_json::to_string(&share) {
            Ok(p) => p,
            Err(e) => {
                warn!("Failed to encode share: {}", e);
                continue;
            }
        };

        if conn.is_none() {
            match client.get_connection_manager().await {
                Ok(manager) => conn = Some(manager),
                Err(e) => {
                    metrics::inc_publish_errors();
                    warn!("Failed to get Redis connection manager: {}", e);
                    continue;
                }
            }
        }

        if let Some(manager) = conn.as_mut() {
            let published: redis::RedisResult<i64> = manager.publish(SHARES_CHANNEL, payload).await;
            match published {
                Ok(receivers) => debug!(receivers, job = %share.job, "Share published"),
                Err(e) => {
                    metrics::inc_publish_errors();
                    warn!("Share publish failed: {}", e);
                    conn = None;
                }
            }
        }
    }

    debug!("Share publisher stopped");
}
