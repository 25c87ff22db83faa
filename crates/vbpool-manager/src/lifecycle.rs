//! The five background loops.
//!
//! Each loop is an independent tokio task with a try/log/continue
//! envelope: no error escapes a tick. The loops are not serialized with
//! each other; every critical section is an atomic store primitive. The
//! tick bodies are public so they can be driven deterministically.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, timeout_at, Duration, Instant};

use crate::manager::PoolManager;

const GROW_TICK_SECS: u64 = 5;
const SHRINK_TICK_SECS: u64 = 30;
const STATS_TICK_SECS: u64 = 10;
const CLEANUP_TICK_SECS: u64 = 300;
/// Spacer between reclaim targets, rate-limiting the provider API.
const CLEANUP_SPACER_SECS: u64 = 2;
const STAGING_SLEEP_SECS: u64 = 1;
/// Wall budget for one staging pass; stragglers carry over.
const STAGING_PASS_BUDGET_SECS: u64 = 30;
/// Heartbeats older than this no longer protect a leased VM from reclaim.
const HEARTBEAT_KEEP_WINDOW_SECS: i64 = 300;

/// Descriptor refetch cadence after the first fetch at `min_retries + 1`.
const DESCRIPTOR_FETCH_EVERY: i32 = 20;
/// Power-cycle recovery cadence for staging rows that stay unready.
const RECOVERY_EVERY: i32 = 150;
/// Staging attempts after which a VM is recycled instead of probed again.
const GIVE_UP_RETRIES: i32 = 240;

impl PoolManager {
    /// Launches the grow, shrink, staging-check, reconcile and stats
    /// loops. Call once per pool; [`PoolManager::shutdown`] stops them.
    pub fn start_background_jobs(self: &Arc<Self>) {
        tracing::info!(pool = %self.pool_name(), "[VMWORKER] starting background jobs");
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tasks.push(tokio::spawn(Self::grow_loop(Arc::clone(self))));
        tasks.push(tokio::spawn(Self::shrink_loop(Arc::clone(self))));
        tasks.push(tokio::spawn(Self::staging_loop(Arc::clone(self))));
        tasks.push(tokio::spawn(Self::cleanup_loop(Arc::clone(self))));
        tasks.push(tokio::spawn(Self::stats_loop(Arc::clone(self))));
    }

    /// Stops scheduling new iterations and waits for in-flight ones.
    pub async fn shutdown(&self) {
        tracing::info!(pool = %self.pool_name(), "[VMWORKER] stopping background jobs");
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<_> = {
            let mut tasks = self
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            tasks.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn grow_loop(mgr: Arc<Self>) {
        let mut shutdown = mgr.shutdown_tx.subscribe();
        let mut tick = interval(Duration::from_secs(GROW_TICK_SECS));
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => {
                    if let Err(e) = mgr.grow_tick().await {
                        tracing::error!(pool = %mgr.pool_name(), error = %e, "Grow tick failed");
                    }
                }
            }
        }
    }

    async fn shrink_loop(mgr: Arc<Self>) {
        let mut shutdown = mgr.shutdown_tx.subscribe();
        let mut tick = interval(Duration::from_secs(SHRINK_TICK_SECS));
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => {
                    if let Err(e) = mgr.shrink_tick().await {
                        tracing::error!(pool = %mgr.pool_name(), error = %e, "Shrink tick failed");
                    }
                }
            }
        }
    }

    async fn staging_loop(mgr: Arc<Self>) {
        let mut shutdown = mgr.shutdown_tx.subscribe();
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = mgr.staging_pass().await {
                tracing::error!(pool = %mgr.pool_name(), error = %e, "[CHECKSTAGING] pass failed");
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = sleep(Duration::from_secs(STAGING_SLEEP_SECS)) => {}
            }
        }
    }

    async fn cleanup_loop(mgr: Arc<Self>) {
        let mut shutdown = mgr.shutdown_tx.subscribe();
        let mut tick = interval(Duration::from_secs(CLEANUP_TICK_SECS));
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => {
                    if let Err(e) = mgr.cleanup_tick().await {
                        tracing::error!(pool = %mgr.pool_name(), error = %e, "[CLEANUP] pass failed");
                    }
                }
            }
        }
    }

    async fn stats_loop(mgr: Arc<Self>) {
        let mut shutdown = mgr.shutdown_tx.subscribe();
        let mut tick = interval(Duration::from_secs(STATS_TICK_SECS));
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => {
                    if let Err(e) = mgr.stats_tick().await {
                        tracing::error!(pool = %mgr.pool_name(), error = %e, "[STATS] tick failed");
                    }
                }
            }
        }
    }

    /// One launch per tick when the warm set is under the low watermark.
    /// Growth linear in ticks is the rate limit on provider API calls.
    pub async fn grow_tick(&self) -> anyhow::Result<()> {
        let counts = self.store.counts(self.pool_name()).await?;
        let (low, _) = self.buffers();
        let warm = counts.staging + counts.available;
        let under_limit = self.config.limit_size == 0 || counts.total() < self.config.limit_size;
        if warm < low && under_limit {
            self.start_vm_wrapper().await?;
        }
        Ok(())
    }

    /// Decommissions at most one VM per tick once `available` exceeds the
    /// high watermark. Eligibility keeps `min_size` rows and clusters
    /// deletions near billing-hour boundaries.
    pub async fn shrink_tick(&self) -> anyhow::Result<()> {
        let available = self
            .store
            .count(self.pool_name(), Some(vbpool_storage::VmState::Available))
            .await?;
        let (_, high) = self.buffers();
        if available <= high {
            return Ok(());
        }

        let deleted = self
            .store
            .delete_oldest_eligible(
                self.pool_name(),
                self.config.min_size,
                self.config.min_uptime_secs(),
                Utc::now(),
            )
            .await?;

        if let Some(vmid) = deleted {
            tracing::info!(pool = %self.pool_name(), vmid = %vmid, available, high, "[RESIZE-UNLAUNCH] decommissioning");
            match self.provider.terminate_vm(&vmid).await {
                Ok(()) => tracing::info!(pool = %self.pool_name(), vmid = %vmid, "[TERMINATE] VM terminated"),
                Err(e) if e.is_not_found() => {
                    tracing::debug!(pool = %self.pool_name(), vmid = %vmid, "[TERMINATE] VM already gone");
                }
                Err(e) => {
                    // Record is gone either way; the orphan VM is swept by
                    // the reconcile loop.
                    tracing::warn!(pool = %self.pool_name(), vmid = %vmid, error = %e, "[TERMINATE] failed");
                }
            }
        }
        Ok(())
    }

    /// One staging pass: probe every staging row concurrently, settle
    /// against the wall budget, abandon (not cancel) stragglers; their
    /// own timeouts bound them.
    pub async fn staging_pass(self: &Arc<Self>) -> anyhow::Result<()> {
        let rows = self.store.list_staging(self.pool_name()).await?;
        if rows.is_empty() {
            return Ok(());
        }

        let mut set = JoinSet::new();
        for row in rows {
            let mgr = Arc::clone(self);
            set.spawn(async move {
                if let Err(e) = mgr.check_staging_vm(&row.vmid).await {
                    tracing::warn!(pool = %mgr.pool_name(), vmid = %row.vmid, error = %e, "[CHECKSTAGING] check failed");
                }
            });
        }

        let deadline = Instant::now() + Duration::from_secs(STAGING_PASS_BUDGET_SECS);
        loop {
            match timeout_at(deadline, set.join_next()).await {
                Ok(Some(Ok(()))) => {}
                Ok(Some(Err(e))) => {
                    tracing::error!(pool = %self.pool_name(), error = %e, "[CHECKSTAGING] task panicked");
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(pool = %self.pool_name(), "[CHECKSTAGING] pass budget exhausted");
                    set.detach_all();
                    break;
                }
            }
        }
        Ok(())
    }

    /// Readiness protocol for one staging row.
    pub(crate) async fn check_staging_vm(&self, vmid: &str) -> anyhow::Result<()> {
        let pool = self.pool_name();
        let Some(attempt) = self.store.increment_retries(pool, vmid).await? else {
            // Promoted or deleted since the pass listed it.
            return Ok(());
        };
        let retries = attempt.retries;
        let min_retries = self.provider.min_retries();

        // Floor the wait to the provider's reboot time before spending
        // probe or API calls on it.
        if retries < min_retries {
            return Ok(());
        }

        let mut descriptor = attempt.data;

        // Fetch once the floor has passed, then throttle to every Nth
        // attempt to spare the provider API.
        if retries == min_retries + 1 || retries % DESCRIPTOR_FETCH_EVERY == 0 {
            match self.provider.get_vm(vmid).await {
                Ok(Some(fetched)) => {
                    if !fetched.host.is_empty() {
                        self.store.set_descriptor(pool, vmid, &fetched).await?;
                    }
                    descriptor = Some(fetched);
                }
                Ok(None) => {
                    tracing::debug!(pool, vmid, retries, "[CHECKSTAGING] descriptor incomplete");
                }
                Err(e) if e.is_not_found() => {
                    tracing::warn!(pool, vmid, "[CHECKSTAGING] VM gone at provider, dropping record");
                    self.store.delete_record(pool, vmid).await?;
                    self.stats.record_stage_fail(vmid);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(pool, vmid, error = %e, "[CHECKSTAGING] descriptor fetch failed");
                }
            }
        }

        let host = descriptor
            .as_ref()
            .map(|d| d.host.as_str())
            .filter(|h| !h.is_empty());

        let ready = match host {
            Some(host) => self.probe.check(host).await,
            None => false,
        };

        if ready {
            if self.store.mark_available(pool, vmid, Utc::now()).await? {
                self.stats.record_stage_retries(i64::from(retries));
                tracing::info!(pool, vmid, retries, "[CHECKSTAGING] VM ready");
            }
            return Ok(());
        }

        if retries >= GIVE_UP_RETRIES {
            tracing::warn!(pool, vmid, retries, "[CHECKSTAGING] giving up, recycling VM");
            self.stats.record_stage_fail(vmid);
            self.reset_vm(vmid, None).await;
            return Ok(());
        }

        if retries % RECOVERY_EVERY == 0 {
            tracing::info!(pool, vmid, retries, "[CHECKSTAGING] power-cycle recovery");
            if let Err(e) = self.provider.power_on(vmid).await {
                tracing::warn!(pool, vmid, error = %e, "[CHECKSTAGING] power on failed");
            }
            if let Err(e) = self.provider.attach_to_network(vmid).await {
                tracing::warn!(pool, vmid, error = %e, "[CHECKSTAGING] network attach failed");
            }
        }

        Ok(())
    }

    /// Reconciles provider truth with the store: every tagged VM outside
    /// the keep-set (live records or fresh heartbeats) is reset, which
    /// falls through to terminate when no record exists. A listing failure
    /// aborts the pass with no partial action.
    pub async fn cleanup_tick(&self) -> anyhow::Result<()> {
        let pool = self.pool_name();
        let tag = self.config.pool_tag();
        let vms = self.provider.list_vms(&tag).await?;
        let keep = self
            .store
            .keep_set(
                pool,
                Utc::now() - ChronoDuration::seconds(HEARTBEAT_KEEP_WINDOW_SECS),
            )
            .await?;

        for vm in vms {
            if keep.contains(&vm.id) {
                continue;
            }
            tracing::info!(pool, vmid = %vm.id, "[CLEANUP] reclaiming VM outside keep-set");
            self.reset_vm(&vm.id, None).await;
            sleep(Duration::from_secs(CLEANUP_SPACER_SECS)).await;
        }
        Ok(())
    }

    pub async fn stats_tick(&self) -> anyhow::Result<()> {
        let counts = self.store.counts(self.pool_name()).await?;
        let (low, high) = self.buffers();
        tracing::info!(
            pool = %self.pool_name(),
            current_size = counts.total(),
            available = counts.available,
            staging = counts.staging,
            used = counts.used,
            low_watermark = low,
            high_watermark = high,
            "[STATS] pool size"
        );
        Ok(())
    }
}
