use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Timeouts {
    /// First message (subscribe) deadline, seconds.
    pub init: u64,
    pub write: u64,
    /// Per-read deadline once a session is active.
    pub inactivity: u64,
    pub keepalive: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            init: 10,
            write: 15,
            inactivity: 180,
            keepalive: 30,
        }
    }
}

impl Timeouts {
    pub fn init(&self) -> Duration {
        Duration::from_secs(self.init)
    }

    pub fn write(&self) -> Duration {
        Duration::from_secs(self.write)
    }

    pub fn inactivity(&self) -> Duration {
        Duration::from_secs(self.inactivity)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive)
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Config {
    pub listen: String,
    pub rpc_url: String,
    pub rpc_timeout_secs: u64,
    /// Empty disables share publishing to Redis.
    pub redis_url: String,
    pub testnet: bool,
    pub share_difficulty: u64,
    pub notify_secs: u64,
    /// 16 hex chars; filled with a random id at load time when unset.
    pub server_id: Option<String>,
    pub server_name: String,
    pub require_authorize: bool,
    pub validate_address: bool,
    pub job_cache_limit: usize,
    /// Outbound messages a session may have queued before broadcast drops it.
    pub session_queue: usize,
    pub timeouts: Timeouts,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:3333".to_string(),
            rpc_url: "http://127.0.0.1:8232/".to_string(),
            rpc_timeout_secs: 30,
            redis_url: String::new(),
            testnet: false,
            share_difficulty: 1,
            notify_secs: 10,
            server_id: None,
            server_name: "mining-proxy".to_string(),
            require_authorize: false,
            validate_address: false,
            job_cache_limit: 256,
            session_queue: 64,
            timeouts: Timeouts::default(),
        }
    }
}

fn parse_bool(v: &str) -> bool {
    matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

impl Config {
    /// Defaults, then the JSON file named by `$CONFIG` (or `config.json`),
    /// then `PROXY_*` environment overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var("CONFIG").unwrap_or_else(|_| "config.json".to_string());
        let file = match std::fs::read_to_string(&path) {
            Ok(txt) => Some(txt),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e).with_context(|| format!("reading {}", path)),
        };

        let cfg = Self::from_sources(file.as_deref(), |key| std::env::var(key).ok())
            .with_context(|| format!("loading config ({})", path))?;
        Ok(cfg)
    }

    pub fn from_sources(file: Option<&str>, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = match file {
            Some(txt) => serde_json::from_str::<Config>(txt).context("parsing config file")?,
            None => Config::default(),
        };

        if let Some(v) = env("PROXY_LISTEN") {
            cfg.listen = v;
        }
        if let Some(v) = env("PROXY_RPC_URL") {
            cfg.rpc_url = v;
        }
        if let Some(v) = env("PROXY_REDIS_URL") {
            cfg.redis_url = v;
        }
        if let Some(v) = env("PROXY_TESTNET") {
            cfg.testnet = parse_bool(&v);
        }
        if let Some(v) = env("PROXY_SHARE_DIFFICULTY") {
            cfg.share_difficulty = v
                .parse()
                .map_err(|e| anyhow!("PROXY_SHARE_DIFFICULTY: {}", e))?;
        }
        if let Some(v) = env("PROXY_NOTIFY_SECS") {
            cfg.notify_secs = v.parse().unwrap_or(10);
        }
        if let Some(v) = env("PROXY_SERVER_ID") {
            cfg.server_id = Some(v);
        }
        if let Some(v) = env("PROXY_REQUIRE_AUTHORIZE") {
            cfg.require_authorize = parse_bool(&v);
        }
        if let Some(v) = env("PROXY_VALIDATE_ADDRESS") {
            cfg.validate_address = parse_bool(&v);
        }

        if cfg.notify_secs == 0 {
            cfg.notify_secs = 10;
        }
        if cfg.job_cache_limit == 0 {
            cfg.job_cache_limit = 256;
        }
        if cfg.session_queue == 0 {
            cfg.session_queue = 64;
        }

        if cfg.server_id.is_none() {
            cfg.server_id = Some(hex::encode(random_server_id()));
        }
        // Fail at startup rather than on first use.
        cfg.server_id()?;

        Ok(cfg)
    }

    /// Instance id placed in front of every nonce partition.
    pub fn server_id(&self) -> Result<[u8; 8]> {
        match &self.server_id {
            Some(s) => {
                let bytes = hex::decode(s).map_err(|e| anyhow!("server_id: {}", e))?;
                <[u8; 8]>::try_from(bytes.as_slice())
                    .map_err(|_| anyhow!("server_id must be 8 bytes, got {}", bytes.len()))
            }
            None => Ok(random_server_id()),
        }
    }

    pub fn notify_interval(&self) -> Duration {
        Duration::from_secs(self.notify_secs)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }
}

fn random_server_id() -> [u8; 8] {
    let mut id = [0u8; 8];
    id.copy_from_slice(&uuid::Uuid::new_v4().as_bytes()[..8]);
    id
}
