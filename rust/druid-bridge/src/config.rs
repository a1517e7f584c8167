use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::{
    net::{SocketAddr, ToSocketAddrs},
    time::Duration,
};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub druid_url: String,
    pub basic_auth: Option<BasicAuth>,
    pub api_key: Option<String>,
    pub request_timeout: Duration,
    /// Time zone used for `day` buckets, e.g. `Asia/Shanghai`.
    pub period_granularity: Option<String>,
    /// Replaces `postAggregations` on every native query when set.
    pub post_aggregations_override: Option<Vec<Value>>,
}

#[derive(Debug, Clone)]
pub struct BasicAuth {
    pub username: String,
    pub password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    druid_bridge_listen_addr: Option<String>,
    #[serde(default)]
    druid_bridge_listen_host: Option<String>,
    #[serde(default)]
    druid_bridge_listen_port: Option<u16>,
    #[serde(default)]
    druid_bridge_druid_url: Option<String>,
    #[serde(default)]
    druid_url: Option<String>,
    #[serde(default)]
    druid_bridge_basic_auth_user: Option<String>,
    #[serde(default)]
    druid_bridge_basic_auth_password: Option<String>,
    #[serde(default)]
    druid_bridge_api_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    druid_bridge_request_timeout_secs: u64,
    #[serde(default)]
    druid_bridge_period_granularity: Option<String>,
    #[serde(default)]
    druid_bridge_raw_post_aggregators: Option<String>,
}

const fn default_timeout_secs() -> u64 {
    30
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let raw: RawConfig =
            envy::from_env().context("failed to parse DRUID_BRIDGE_* environment variables")?;

        let listen_addr = resolve_addr(
            raw.druid_bridge_listen_addr,
            raw.druid_bridge_listen_host,
            raw.druid_bridge_listen_port,
        )?;

        let druid_url = raw
            .druid_bridge_druid_url
            .or(raw.druid_url)
            .and_then(non_empty)
            .context("DRUID_BRIDGE_DRUID_URL or DRUID_URL must be set")?;

        let basic_auth = raw
            .druid_bridge_basic_auth_user
            .and_then(non_empty)
            .map(|username| BasicAuth {
                username,
                password: raw.druid_bridge_basic_auth_password,
            });

        let post_aggregations_override = raw
            .druid_bridge_raw_post_aggregators
            .as_deref()
            .and_then(parse_post_aggregations_override);

        Ok(Self {
            listen_addr,
            druid_url: druid_url.trim_end_matches('/').to_string(),
            basic_auth,
            api_key: raw.druid_bridge_api_key.and_then(non_empty),
            request_timeout: Duration::from_secs(raw.druid_bridge_request_timeout_secs.max(1)),
            period_granularity: raw.druid_bridge_period_granularity.and_then(non_empty),
            post_aggregations_override,
        })
    }

    /// Config for running the engine in-process without reading the environment.
    pub fn embedded(druid_url: String) -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            druid_url: druid_url.trim_end_matches('/').to_string(),
            basic_auth: None,
            api_key: None,
            request_timeout: Duration::from_secs(default_timeout_secs()),
            period_granularity: None,
            post_aggregations_override: None,
        }
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_post_aggregations_override(text: &str) -> Option<Vec<Value>> {
    if text.trim().is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Array(items)) => Some(items),
        Ok(Value::Object(map)) => Some(vec![Value::Object(map)]),
        Ok(other) => {
            warn!(value = %other, "ignoring raw post-aggregator override: expected object or array");
            None
        }
        Err(err) => {
            warn!(error = %err, "ignoring unparseable raw post-aggregator override");
            None
        }
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
            .context("invalid DRUID_BRIDGE_LISTEN_ADDR value")?
            .next()
            .context("DRUID_BRIDGE_LISTEN_ADDR resolved to no addresses");
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
