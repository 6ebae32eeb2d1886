//! The orchestrator configuration file: controller endpoints, credentials,
//! and the handful of deployment constants. Everything the original kept as
//! process-wide module state lives here instead and is threaded through an
//! explicit context.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use sdfabric_controllers::http::Endpoint;

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl EndpointConfig {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            base_url: self.url.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub compute: EndpointConfig,
    pub sdn: EndpointConfig,
    #[serde(default)]
    pub telemetry: Option<EndpointConfig>,
    #[serde(default)]
    pub sflow: Option<EndpointConfig>,

    /// Availability zone used for host pinning (`<zone>:<hostname>`).
    #[serde(default = "default_zone")]
    pub availability_zone: String,

    /// Physical port rate every HTB hierarchy is capped at, bits/s.
    #[serde(default = "default_total_rate")]
    pub qos_total_rate_bps: u64,

    /// How long to wait for a created server to become active.
    #[serde(default = "default_create_timeout")]
    pub create_timeout_secs: u64,

    /// Connect+read timeout for every controller call.
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,

    /// The rotation budget shared by all links in dynamic-flow mode.
    #[serde(default = "default_dynflow_interval")]
    pub dynamic_flow_interval_secs: u64,
}

fn default_zone() -> String {
    "nova".to_owned()
}

fn default_total_rate() -> u64 {
    95_000_000
}

fn default_create_timeout() -> u64 {
    120
}

fn default_http_timeout() -> u64 {
    10
}

fn default_dynflow_interval() -> u64 {
    60
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn create_timeout(&self) -> Duration {
        Duration::from_secs(self.create_timeout_secs)
    }
}
