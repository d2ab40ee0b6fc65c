//! Configuration (spec §6 "Configuration (enumerated)"). YAML file +
//! environment-variable overrides via `figment`, matching
//! `ando-core::config::AndoConfig::load`'s shape.

use crate::header::HeaderMap;
use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendProtocol {
    Http,
    Https,
}

impl Default for BackendProtocol {
    fn default() -> Self {
        BackendProtocol::Http
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeConfig {
    /// `None` means "infer from the presence of key/cert files" — left
    /// to the concrete edge adapter, since this crate has no TLS
    /// material of its own to inspect.
    #[serde(default)]
    pub ssl: Option<bool>,
    #[serde(default = "default_edge_port")]
    pub port: u16,
    #[serde(default)]
    pub quiet: bool,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self { ssl: None, port: default_edge_port(), quiet: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub protocol: BackendProtocol,
    #[serde(default = "default_backend_port")]
    pub port: u16,
    #[serde(default = "default_backend_host")]
    pub host: String,
    #[serde(default)]
    pub quiet: bool,
}

impl BackendConfig {
    /// spec §6: "Warn if protocol=https and host is loopback."
    pub fn warn_https_loopback(&self) -> bool {
        self.protocol == BackendProtocol::Https && is_loopback_host(&self.host)
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self { protocol: BackendProtocol::default(), port: default_backend_port(), host: default_backend_host(), quiet: false }
    }
}

fn is_loopback_host(host: &str) -> bool {
    host == "localhost" || host.parse::<std::net::IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackpressureOptions {
    #[serde(default = "default_max_stacked_buffers")]
    pub max_stacked_buffers: usize,
}

impl Default for BackpressureOptions {
    fn default() -> Self {
        Self { max_stacked_buffers: default_max_stacked_buffers() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyOptions {
    #[serde(default)]
    pub backpressure: BackpressureOptions,
    /// Headers added to every forwarded request.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// `method → route pattern`, default `{"any": "/*"}`.
    #[serde(default = "default_routes")]
    pub routes: HashMap<String, String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            backpressure: BackpressureOptions::default(),
            headers: HashMap::new(),
            routes: default_routes(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl ProxyOptions {
    pub fn extra_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (k, v) in &self.headers {
            headers.push(k, v);
        }
        headers
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientOptions {
    #[serde(default = "default_true")]
    pub pipelining: bool,
    #[serde(default = "default_reconnection_attempts")]
    pub reconnection_attempts: u32,
    #[serde(default = "default_reconnection_delay_ms")]
    pub reconnection_delay_ms: u64,
    #[serde(default = "default_keep_alive_ms")]
    pub keep_alive_ms: u64,
    #[serde(default = "default_keep_alive_initial_delay_ms")]
    pub keep_alive_initial_delay_ms: u64,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_max_connections_by_host")]
    pub max_connections_by_host: usize,
    #[serde(default = "default_connection_watcher_interval_ms")]
    pub connection_watcher_interval_ms: u64,
    #[serde(default = "default_max_pipelined_requests_by_connection")]
    pub max_pipelined_requests_by_connection: usize,
    #[serde(default = "default_max_stacked_buffers")]
    pub max_stacked_buffers: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            pipelining: default_true(),
            reconnection_attempts: default_reconnection_attempts(),
            reconnection_delay_ms: default_reconnection_delay_ms(),
            keep_alive_ms: default_keep_alive_ms(),
            keep_alive_initial_delay_ms: default_keep_alive_initial_delay_ms(),
            connection_timeout_ms: default_connection_timeout_ms(),
            max_connections_by_host: default_max_connections_by_host(),
            connection_watcher_interval_ms: default_connection_watcher_interval_ms(),
            max_pipelined_requests_by_connection: default_max_pipelined_requests_by_connection(),
            max_stacked_buffers: default_max_stacked_buffers(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub edge: EdgeConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub proxy: ProxyOptions,
    #[serde(default)]
    pub client: ClientOptions,
}

impl GatewayConfig {
    /// Load from `path` (if given), falling back to a handful of default
    /// locations, then apply `PROXY_`-prefixed environment overrides
    /// (e.g. `PROXY_BACKEND__PORT`), matching `AndoConfig::load`.
    pub fn load(config_path: Option<&str>) -> anyhow::Result<Self> {
        let mut figment = Figment::new();

        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        } else {
            for default_path in &["proxy.yaml", "/etc/uwsrp/proxy.yaml", "config/proxy.yaml"] {
                if std::path::Path::new(default_path).exists() {
                    figment = figment.merge(Yaml::file(default_path));
                    break;
                }
            }
        }

        figment = figment.merge(Env::prefixed("PROXY_").split("__"));

        let config: Self = figment.extract()?;
        Ok(config)
    }
}

fn default_true() -> bool {
    true
}

fn default_edge_port() -> u16 {
    3000
}

fn default_backend_port() -> u16 {
    35974
}

fn default_backend_host() -> String {
    "127.0.0.1".to_string()
}

fn default_max_stacked_buffers() -> usize {
    4096
}

fn default_routes() -> HashMap<String, String> {
    let mut m = HashMap::new();
    m.insert("any".to_string(), "/*".to_string());
    m
}

fn default_timeout_ms() -> u64 {
    300_000
}

fn default_reconnection_attempts() -> u32 {
    3
}

fn default_reconnection_delay_ms() -> u64 {
    1000
}

fn default_keep_alive_ms() -> u64 {
    5000
}

fn default_keep_alive_initial_delay_ms() -> u64 {
    1000
}

fn default_connection_timeout_ms() -> u64 {
    5000
}

fn default_max_connections_by_host() -> usize {
    10
}

fn default_connection_watcher_interval_ms() -> u64 {
    1000
}

fn default_max_pipelined_requests_by_connection() -> usize {
    100_000
}
