use serde::Deserialize;

use vbpool_common::types::{parse_ramp_hours, Environment};

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    pub database_url: String,
    /// Tag prefix applied to every provider VM.
    #[serde(default = "default_tag")]
    pub tag: String,
    #[serde(default = "default_environment")]
    pub environment: Environment,
    /// Bound the ops API imposes on one assignment request.
    #[serde(default = "default_assign_timeout_secs")]
    pub assign_timeout_secs: u64,
    #[serde(default)]
    pub pools: Vec<PoolEntry>,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

/// One (provider, region, size-class) pool.
#[derive(Debug, Deserialize)]
pub struct PoolEntry {
    pub provider: String,
    pub region: String,
    #[serde(default)]
    pub large: bool,
    #[serde(default)]
    pub min_size: u64,
    /// Zero means unbounded.
    #[serde(default)]
    pub limit_size: u64,
    #[serde(default = "default_min_uptime_minutes")]
    pub min_uptime_minutes: i64,
    /// `"a,b"` UTC hour window; empty means no window.
    #[serde(default)]
    pub ramp_down_hours: String,
    #[serde(default)]
    pub ramp_up_hours: String,
}

impl PoolEntry {
    pub fn ramp_down(&self) -> Option<(i64, i64)> {
        parse_ramp_hours(&self.ramp_down_hours)
    }

    pub fn ramp_up(&self) -> Option<(i64, i64)> {
        parse_ramp_hours(&self.ramp_up_hours)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ProvidersConfig {
    pub hetzner: Option<ProviderCredentials>,
    pub digitalocean: Option<ProviderCredentials>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderCredentials {
    pub token: String,
    /// Provider-side placement slug (e.g. "ash", "nyc1").
    pub location: String,
    /// Golden image the VMs boot and rebuild from.
    pub image: String,
    /// Wildcard-cert domain session hosts are published under.
    pub host_domain: String,
    #[serde(default)]
    pub ssh_keys: Vec<String>,
    #[serde(default)]
    pub network_id: Option<String>,
    #[serde(default)]
    pub snapshot_source_vmid: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub large_size: Option<String>,
}

fn default_http_port() -> u16 {
    8080
}

fn default_tag() -> String {
    "vbrowser".to_string()
}

fn default_environment() -> Environment {
    Environment::Development
}

fn default_assign_timeout_secs() -> u64 {
    90
}

fn default_min_uptime_minutes() -> i64 {
    50
}

impl ServerConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn credentials_for(&self, provider: &str) -> Option<&ProviderCredentials> {
        match provider {
            "hetzner" => self.providers.hetzner.as_ref(),
            "digitalocean" => self.providers.digitalocean.as_ref(),
            _ => None,
        }
    }
}
