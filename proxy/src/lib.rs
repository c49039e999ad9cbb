pub mod blockchain;
pub mod config;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod pow;
pub mod shares;
pub mod stratum;

pub use error::{ProxyError, Result};
