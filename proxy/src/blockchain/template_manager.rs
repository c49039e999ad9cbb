/// Block Template Manager - polls the node for work and fans it out
///
/// Each new template (height or previous block changed) becomes a `Work`
/// snapshot in the job book and a clean-jobs `mining.notify` to every
/// registered session.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Notify as Wake;
use tokio::time;
use tokio_util::sync::CancellationToken;

use super::rpc_client::RpcCall;
use crate::error::{ProxyError, Result};
use crate::jobs::{JobBook, Work};
use crate::metrics::prometheus as metrics;
use crate::pow::{compact_to_target, target_to_difficulty, Difficulty, Uint256};
use crate::stratum::protocol::Response;
use crate::stratum::registry::SessionRegistry;

pub const DEFAULT_N: u32 = 200;
pub const DEFAULT_K: u32 = 9;

/// Template fields converted to header byte order.
///
/// The node reports hashes in display order and integers as plain numbers;
/// the header carries hashes reversed and integers little-endian, which is
/// what the byte-swapped values below encode when written big-endian.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockTemplate {
    pub height: u64,
    pub version: u32,
    pub prev_hash: Uint256,
    pub merkle_root: Uint256,
    pub reserved: Uint256,
    pub ntime: u32,
    pub nbits: u32,
    pub target: Uint256,
    pub block: Vec<u8>,
    pub subsidy: f64,
    pub n: u32,
    pub k: u32,
    pub difficulty: Difficulty,
}

fn missing(field: &str) -> ProxyError {
    ProxyError::Rpc(format!("block template missing {}", field))
}

fn u64_field(value: &Value, field: &str) -> Result<u64> {
    value
        .get(field)
        .and_then(|v| v.as_u64())
        .ok_or_else(|| missing(field))
}

fn narrow(field: &str, v: u64) -> Result<u32> {
    u32::try_from(v)
        .map_err(|_| ProxyError::Rpc(format!("block template {} out of range: {}", field, v)))
}

fn u32_field(value: &Value, field: &str) -> Result<u32> {
    narrow(field, u64_field(value, field)?)
}

/// Optional `u32`, `default` when absent. A present value must fit.
fn u32_field_or(value: &Value, field: &str, default: u32) -> Result<u32> {
    match value.get(field).and_then(|v| v.as_u64()) {
        Some(v) => narrow(field, v),
        None => Ok(default),
    }
}

/// 32-byte hash in display order, returned in header order.
fn hash_field(value: &Value, field: &str) -> Result<Option<Uint256>> {
    let s = match value.get(field).and_then(|v| v.as_str()) {
        Some(s) => s,
        None => return Ok(None),
    };
    let mut h = Uint256::from_hex(s)
        .map_err(|e| ProxyError::Rpc(format!("block template {}: {}", field, e)))?;
    h.0.reverse();
    Ok(Some(h))
}

impl BlockTemplate {
    pub fn from_rpc_response(value: &Value) -> Result<Self> {
        let height = u64_field(value, "height")?;
        let version = u32_field(value, "version")?;
        let curtime = u32_field(value, "curtime")?;

        let prev_hash =
            hash_field(value, "previousblockhash")?.ok_or_else(|| missing("previousblockhash"))?;
        let merkle_root = hash_field(value, "merkleroot")?.ok_or_else(|| missing("merkleroot"))?;
        let reserved = hash_field(value, "reserved")?.unwrap_or(Uint256::ZERO);

        let bits = value
            .get("bits")
            .and_then(|v| v.as_str())
            .ok_or_else(|| missing("bits"))?;
        let bits = u32::from_str_radix(bits, 16)
            .map_err(|e| ProxyError::Rpc(format!("block template bits: {}", e)))?;
        let nbits = bits.swap_bytes();

        // `target` is a plain number in display order; no reversal.
        let target = match value.get("target").and_then(|v| v.as_str()) {
            Some(s) => Uint256::from_hex(s)
                .map_err(|e| ProxyError::Rpc(format!("block template target: {}", e)))?,
            None => compact_to_target(nbits)?,
        };

        let block = match value.get("block").and_then(|v| v.as_str()) {
            Some(s) => hex::decode(s)
                .map_err(|e| ProxyError::Rpc(format!("block template block: {}", e)))?,
            None => Vec::new(),
        };

        Ok(Self {
            height,
            version: version.swap_bytes(),
            prev_hash,
            merkle_root,
            reserved,
            ntime: curtime.swap_bytes(),
            nbits,
            target,
            block,
            subsidy: value.get("subsidy").and_then(|v| v.as_f64()).unwrap_or(0.0),
            n: u32_field_or(value, "n", DEFAULT_N)?,
            k: u32_field_or(value, "k", DEFAULT_K)?,
            difficulty: value
                .get("difficulty")
                .and_then(|v| v.as_u64())
                .unwrap_or_else(|| target_to_difficulty(&target)),
        })
    }

    /// Job id is assigned when the work is recorded in a `JobBook`.
    pub fn into_work(self) -> Work {
        Work {
            job_id: String::new(),
            version: self.version,
            prev_hash: self.prev_hash,
            merkle_root: self.merkle_root,
            reserved: self.reserved,
            ntime: self.ntime,
            nbits: self.nbits,
            height: self.height,
            target: self.target,
            raw_block: self.block,
            n: self.n,
            k: self.k,
            at: Utc::now(),
            difficulty: self.difficulty,
            subsidy: self.subsidy,
        }
    }
}

pub struct TemplateManager {
    rpc: Arc<dyn RpcCall>,
    jobs: Arc<JobBook>,
    registry: Arc<SessionRegistry>,
    update_interval: Duration,
    last: Mutex<Option<(u64, Uint256)>>,
    wake: Arc<Wake>,
}

impl TemplateManager {
    pub fn new(
        rpc: Arc<dyn RpcCall>,
        jobs: Arc<JobBook>,
        registry: Arc<SessionRegistry>,
        update_interval: Duration,
    ) -> Self {
        tracing::info!(
            interval_secs = update_interval.as_secs(),
            "Template manager initialized"
        );

        Self {
            rpc,
            jobs,
            registry,
            update_interval,
            last: Mutex::new(None),
            wake: Arc::new(Wake::new()),
        }
    }

    /// Signal that wakes the poll loop early, e.g. after a block is found.
    pub fn refresh_signal(&self) -> Arc<Wake> {
        self.wake.clone()
    }

    async fn fetch(&self) -> Result<BlockTemplate> {
        let response = self.rpc.call("getblocktemplate", json!([])).await?;
        BlockTemplate::from_rpc_response(&response)
    }

    /// Fetch once. Returns the new work if the template changed.
    pub async fn refresh(&self) -> Result<Option<Arc<Work>>> {
        let template = self.fetch().await?;
        let key = (template.height, template.prev_hash);

        {
            let mut last = self.last.lock();
            if last.as_ref() == Some(&key) {
                return Ok(None);
            }
            *last = Some(key);
        }

        Ok(Some(self.publish(template)))
    }

    /// Record and broadcast the current template even if it is unchanged.
    pub async fn force_update(&self) -> Result<Arc<Work>> {
        let template = self.fetch().await?;
        *self.last.lock() = Some((template.height, template.prev_hash));
        Ok(self.publish(template))
    }

    fn publish(&self, template: BlockTemplate) -> Arc<Work> {
        let work = self.jobs.insert(template.into_work());

        metrics::set_template_height(work.height);
        metrics::inc_template_updates();

        let delivered = self.registry.broadcast(&Response::Notify(work.notify(true)));
        metrics::inc_job_broadcasts();

        tracing::info!(
            job = %work.job_id,
            height = work.height,
            difficulty = work.difficulty,
            sessions = delivered,
            "New block template"
        );
        work
    }

    /// Poll until cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = time::interval(self.update_interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
                _ = self.wake.notified() => {}
            }

            if let Err(e) = self.refresh().await {
                metrics::inc_template_fetch_errors();
                tracing::error!("Failed to fetch block template: {}", e);
            }
        }

        tracing::debug!("Template manager stopped");
    }
}
