use vbpool_common::types::{pool_tag, Environment};

/// Sizing and placement policy for one pool. Identity and policy are
/// data; the provider adapter contributes only its capability set.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Pool region label (part of the pool name, not the provider slug).
    pub region: String,
    pub large: bool,
    /// VMs always kept warm; the shrink loop never cuts below this.
    pub min_size: u64,
    /// Upper bound on pool size. Zero means unbounded.
    pub limit_size: u64,
    /// Uptime-mod-hour floor (minutes) gating shrink eligibility.
    pub min_uptime_minutes: i64,
    /// Tag prefix applied to provider VMs.
    pub tag_prefix: String,
    pub environment: Environment,
    /// UTC hour window during which the low watermark is halved.
    pub ramp_down_hours: Option<(i64, i64)>,
    /// UTC hour window during which the low watermark grows by half.
    pub ramp_up_hours: Option<(i64, i64)>,
}

impl PoolConfig {
    pub fn pool_tag(&self) -> String {
        pool_tag(&self.tag_prefix, self.large, &self.region)
    }

    pub fn min_uptime_secs(&self) -> i64 {
        self.min_uptime_minutes * 60
    }
}
