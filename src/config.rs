use std::{env, net::SocketAddr, path::PathBuf};

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub api_key: String,
    pub data_root: PathBuf,
    pub compress_chunks: bool,
    pub rate_limit_per_minute: u32,
    pub rate_limit_burst: u32,
    pub response_budget_bytes: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let bind_addr = env::var("BIOGRAPH_STAGING_BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse::<SocketAddr>()
            .context("Invalid BIOGRAPH_STAGING_BIND_ADDR")?;

        let api_key = env::var("BIOGRAPH_STAGING_API_KEY")
            .context("BIOGRAPH_STAGING_API_KEY is required")?;

        let data_root = PathBuf::from(
            env::var("BIOGRAPH_STAGING_DATA_ROOT").unwrap_or_else(|_| "/data/staging".to_string()),
        );

        let compress_chunks = env::var("BIOGRAPH_STAGING_COMPRESS")
            .ok()
            .and_then(|v| v.parse::<bool>().ok())
            .unwrap_or(true);

        let rate_limit_per_minute = env::var("BIOGRAPH_STAGING_RATE_LIMIT_PER_MINUTE")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(120);

        let rate_limit_burst = env::var("BIOGRAPH_STAGING_RATE_LIMIT_BURST")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(30);

        let response_budget_bytes = env::var("BIOGRAPH_STAGING_RESPONSE_BUDGET_BYTES")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(4 * 1024 * 1024);

        Ok(Self {
            bind_addr,
            api_key,
            data_root,
            compress_chunks,
            rate_limit_per_minute,
            rate_limit_burst,
            response_budget_bytes,
        })
    }
}
