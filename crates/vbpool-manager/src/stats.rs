use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Bounded telemetry rings keep the last few observations only; this is
/// ops visibility, not a metrics pipeline.
const RING_CAP: usize = 25;

#[derive(Default)]
pub struct PoolStats {
    start_ms: Mutex<VecDeque<i64>>,
    stage_retries: Mutex<VecDeque<i64>>,
    stage_fails: Mutex<VecDeque<String>>,
    launches: AtomicU64,
    staging_fails: AtomicU64,
}

impl PoolStats {
    /// Lease latency, milliseconds from request to commit.
    pub fn record_start_ms(&self, ms: i64) {
        push_capped(&self.start_ms, ms);
    }

    /// Staging attempts a VM took to come ready.
    pub fn record_stage_retries(&self, retries: i64) {
        push_capped(&self.stage_retries, retries);
    }

    /// A VM that never came ready: remembered by vmid and counted.
    pub fn record_stage_fail(&self, vmid: &str) {
        push_capped(&self.stage_fails, vmid.to_string());
        self.staging_fails.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_launch(&self) {
        self.launches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            start_ms: lock(&self.start_ms).iter().copied().collect(),
            stage_retries: lock(&self.stage_retries).iter().copied().collect(),
            stage_fails: lock(&self.stage_fails).iter().cloned().collect(),
            launches: self.launches.load(Ordering::Relaxed),
            staging_fails: self.staging_fails.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot serialized under the external metric names.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    #[serde(rename = "vBrowserStartMS")]
    pub start_ms: Vec<i64>,
    #[serde(rename = "vBrowserStageRetries")]
    pub stage_retries: Vec<i64>,
    #[serde(rename = "vBrowserStageFails")]
    pub stage_fails: Vec<String>,
    #[serde(rename = "vBrowserLaunches")]
    pub launches: u64,
    #[serde(rename = "vBrowserStagingFails")]
    pub staging_fails: u64,
}

fn push_capped<T>(ring: &Mutex<VecDeque<T>>, value: T) {
    let mut ring = lock(ring);
    if ring.len() == RING_CAP {
        ring.pop_front();
    }
    ring.push_back(value);
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rings_are_capped_and_fifo() {
        let stats = PoolStats::default();
        for i in 0..30 {
            stats.record_start_ms(i);
        }
        let snap = stats.snapshot();
        assert_eq!(snap.start_ms.len(), 25);
        assert_eq!(snap.start_ms.first(), Some(&5));
        assert_eq!(snap.start_ms.last(), Some(&29));
    }

    #[test]
    fn stage_fail_feeds_ring_and_counter() {
        let stats = PoolStats::default();
        stats.record_stage_fail("vm-1");
        stats.record_stage_fail("vm-2");
        let snap = stats.snapshot();
        assert_eq!(snap.stage_fails, vec!["vm-1".to_string(), "vm-2".to_string()]);
        assert_eq!(snap.staging_fails, 2);
    }

    #[test]
    fn snapshot_uses_external_metric_names() {
        let stats = PoolStats::default();
        stats.record_launch();
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["vBrowserLaunches"], 1);
        assert!(json["vBrowserStartMS"].as_array().unwrap().is_empty());
        assert!(json.get("vBrowserStageFails").is_some());
    }
}
