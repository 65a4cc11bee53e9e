use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    net::{SocketAddr, ToSocketAddrs},
    time::Duration,
};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub api_key: Option<String>,
    pub request_timeout: Duration,
    pub max_concurrent_queries: usize,
    pub strict_duplicates: bool,
    pub session_pool_size: u32,
    pub connect_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    tsbridge_listen_addr: Option<String>,
    #[serde(default)]
    tsbridge_listen_host: Option<String>,
    #[serde(default)]
    tsbridge_listen_port: Option<u16>,
    #[serde(default)]
    tsbridge_api_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    tsbridge_request_timeout_secs: u64,
    #[serde(default = "default_max_concurrent_queries")]
    tsbridge_max_concurrent_queries: usize,
    #[serde(default)]
    tsbridge_strict_duplicates: bool,
    #[serde(default = "default_session_pool_size")]
    tsbridge_session_pool_size: u32,
    #[serde(default = "default_connect_timeout_secs")]
    tsbridge_connect_timeout_secs: u64,
}

const fn default_timeout_secs() -> u64 {
    30
}

const fn default_max_concurrent_queries() -> usize {
    4
}

const fn default_session_pool_size() -> u32 {
    1
}

const fn default_connect_timeout_secs() -> u64 {
    10
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let raw: RawConfig =
            envy::from_env().context("failed to parse TSBRIDGE_* environment variables")?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self> {
        let listen_addr = resolve_addr(
            raw.tsbridge_listen_addr,
            raw.tsbridge_listen_host,
            raw.tsbridge_listen_port,
        )?;

        Ok(Self {
            listen_addr,
            api_key: raw.tsbridge_api_key.filter(|key| !key.is_empty()),
            request_timeout: Duration::from_secs(raw.tsbridge_request_timeout_secs.max(1)),
            max_concurrent_queries: raw.tsbridge_max_concurrent_queries.max(1),
            strict_duplicates: raw.tsbridge_strict_duplicates,
            session_pool_size: raw.tsbridge_session_pool_size.max(1),
            connect_timeout: Duration::from_secs(raw.tsbridge_connect_timeout_secs.max(1)),
        })
    }
}

fn resolve_addr(
    addr: Option<String>,
    host: Option<String>,
    port: Option<u16>,
) -> Result<SocketAddr> {
    if let Some(addr) = addr {
        return addr
            .to_socket_addrs()
            .context("invalid TSBRIDGE_LISTEN_ADDR value")?
            .next()
            .context("TSBRIDGE_LISTEN_ADDR resolved to no addresses");
    }

    let host = host.unwrap_or_else(|| "0.0.0.0".to_string());
    let port = port.unwrap_or(8490);
    let combined = format!("{}:{}", host, port);
    combined
        .to_socket_addrs()
        .context("invalid listen host/port combination")?
        .next()
        .context("listen address resolved to no targets")
}
