use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// VM metadata projected from a provider API record.
///
/// This is the only view of a provider-side VM the controller ever sees.
/// Everything except `id` (stable external identifier) and `host` (consumed
/// by the readiness probe) is opaque pass-through for the session layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmDescriptor {
    pub id: String,
    /// Session credential. By contract this is the VM's name; adapters
    /// rotate it on reboot (rename + rebuild where needed).
    pub pass: String,
    /// Routable host, path-terminated (`<label>.<domain>/`). The probe
    /// derives the health URL from this.
    pub host: String,
    pub private_ip: String,
    /// Provider-side lifecycle state string, unparsed.
    pub state: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub creation_date: Option<DateTime<Utc>>,
    pub provider: String,
    pub large: bool,
    pub region: String,
}

/// Deployment mode. Controls the readiness probe's boot-age gate and is
/// carried in config rather than read from the process environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    Development,
}

impl Environment {
    pub fn is_production(self) -> bool {
        matches!(self, Environment::Production)
    }
}

/// Pool identity: `providerId + ("Large"|"") + region`.
pub fn pool_name(provider_id: &str, large: bool, region: &str) -> String {
    format!(
        "{}{}{}",
        provider_id,
        if large { "Large" } else { "" },
        region
    )
}

/// Provider-side tag for every VM a pool owns: `tagPrefix + region + ("Large"|"")`.
pub fn pool_tag(tag_prefix: &str, large: bool, region: &str) -> String {
    format!(
        "{}{}{}",
        tag_prefix,
        region,
        if large { "Large" } else { "" }
    )
}

/// Per-pool counts by lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolCounts {
    pub staging: u64,
    pub available: u64,
    pub used: u64,
}

impl PoolCounts {
    pub fn total(&self) -> u64 {
        self.staging + self.available + self.used
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignedVm {
    pub vmid: String,
    pub room_id: String,
    pub uid: String,
    pub assign_time: DateTime<Utc>,
    /// Cached descriptor from the leased record, when one had been fetched.
    pub descriptor: Option<VmDescriptor>,
}

/// Ramp window config values, parsed from `"a,b"` strings.
///
/// Anything other than exactly two comma-separated integers yields no
/// window: an unset or empty value must not become an adjustment.
pub fn parse_ramp_hours(raw: &str) -> Option<(i64, i64)> {
    let parts: Vec<&str> = raw.split(',').collect();
    if parts.len() != 2 {
        return None;
    }
    let a = parts[0].trim().parse().ok()?;
    let b = parts[1].trim().parse().ok()?;
    Some((a, b))
}
