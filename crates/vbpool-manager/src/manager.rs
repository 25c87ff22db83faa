use anyhow::Context;
use chrono::{Timelike, Utc};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use crate::buffer::pool_buffers;
use crate::config::PoolConfig;
use crate::probe::ReadinessProbe;
use crate::stats::{PoolStats, StatsSnapshot};
use vbpool_common::name::vm_name;
use vbpool_common::types::{pool_name, AssignedVm, PoolCounts};
use vbpool_provider::VmProvider;
use vbpool_storage::{VmState, VmStore};

/// Controller for one pool of browser VMs.
///
/// Holds the provider adapter by capability set; pool identity and policy
/// are plain data in [`PoolConfig`]. All methods are safe to call
/// concurrently with the background loops; coordination happens in the
/// store.
pub struct PoolManager {
    pub(crate) config: PoolConfig,
    pub(crate) provider: Arc<dyn VmProvider>,
    pub(crate) store: Arc<VmStore>,
    pub(crate) probe: ReadinessProbe,
    pub(crate) stats: PoolStats,
    pool: String,
    pub(crate) shutdown_tx: watch::Sender<bool>,
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PoolManager {
    pub fn new(
        config: PoolConfig,
        provider: Arc<dyn VmProvider>,
        store: Arc<VmStore>,
    ) -> anyhow::Result<Self> {
        let probe = ReadinessProbe::new(config.environment)?;
        let pool = pool_name(provider.id(), config.large, &config.region);
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            config,
            provider,
            store,
            probe,
            stats: PoolStats::default(),
            pool,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn pool_name(&self) -> &str {
        &self.pool
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub async fn counts(&self) -> anyhow::Result<PoolCounts> {
        Ok(self.store.counts(&self.pool).await?)
    }

    /// Current watermarks for the wall-clock hour.
    pub fn buffers(&self) -> (u64, u64) {
        pool_buffers(
            self.config.limit_size,
            Utc::now().hour(),
            self.config.ramp_down_hours,
            self.config.ramp_up_hours,
        )
    }

    /// Leases one VM to `(room_id, uid)`.
    ///
    /// Runs in its own transaction, isolated from the background loops.
    /// Loops until a VM is leased or the room leaves the demand queue;
    /// the caller is expected to bound the wait. Every failure mode
    /// surfaces as `None`; callers cannot (and need not) distinguish a
    /// cancelled room from a store error.
    pub async fn assign_vm(self: &Arc<Self>, room_id: &str, uid: &str) -> Option<AssignedVm> {
        let started = Instant::now();

        let txn = match self.store.begin().await {
            Ok(txn) => txn,
            Err(e) => {
                tracing::warn!(pool = %self.pool, error = %e, "[ASSIGN] could not open transaction");
                return None;
            }
        };

        // Warm-on-demand: a pool with no standing minimum launches on the
        // first request. The launch goes through its own write path while
        // this transaction stays open; the rare double-launch under
        // contention is reclaimed by the shrink loop.
        if self.config.min_size == 0 {
            match VmStore::count_in(&txn, &self.pool, Some(VmState::Available)).await {
                Ok(0) => {
                    let mgr = Arc::clone(self);
                    tokio::spawn(async move {
                        if let Err(e) = mgr.start_vm_wrapper().await {
                            tracing::warn!(pool = %mgr.pool, error = %e, "[ASSIGN] on-demand launch failed");
                        }
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(pool = %self.pool, error = %e, "[ASSIGN] available count failed");
                    let _ = txn.rollback().await;
                    return None;
                }
            }
        }

        // The transaction is re-opened per attempt: under snapshot
        // isolation a single one would never observe VMs promoted after
        // its first read. The lease statement is the critical section
        // either way.
        let mut txn = txn;
        let leased = loop {
            // Liveness: a room that cancelled its request gets no VM.
            match VmStore::is_room_waiting_in(&txn, room_id).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::info!(pool = %self.pool, room_id, "[ASSIGN] room left the queue");
                    let _ = txn.rollback().await;
                    return None;
                }
                Err(e) => {
                    tracing::warn!(pool = %self.pool, error = %e, "[ASSIGN] queue check failed");
                    let _ = txn.rollback().await;
                    return None;
                }
            }

            match VmStore::lease_next_available_in(&txn, &self.pool, room_id, uid, Utc::now()).await
            {
                Ok(Some(vm)) => break vm,
                Ok(None) => {
                    let _ = txn.rollback().await;
                    sleep(Duration::from_secs(1)).await;
                    txn = match self.store.begin().await {
                        Ok(txn) => txn,
                        Err(e) => {
                            tracing::warn!(pool = %self.pool, error = %e, "[ASSIGN] could not reopen transaction");
                            return None;
                        }
                    };
                }
                Err(e) => {
                    tracing::warn!(pool = %self.pool, error = %e, "[ASSIGN] lease failed");
                    let _ = txn.rollback().await;
                    return None;
                }
            }
        };

        self.stats.record_start_ms(started.elapsed().as_millis() as i64);

        if let Err(e) = txn.commit().await {
            tracing::warn!(pool = %self.pool, error = %e, "[ASSIGN] commit failed");
            return None;
        }

        tracing::info!(
            pool = %self.pool,
            vmid = %leased.vmid,
            room_id,
            uid,
            wait_ms = started.elapsed().as_millis() as i64,
            "[ASSIGN] VM leased"
        );

        Some(AssignedVm {
            vmid: leased.vmid,
            room_id: leased.room_id,
            uid: leased.uid,
            assign_time: leased.assign_time,
            descriptor: leased.data,
        })
    }

    /// Returns a VM to staging: reboot (with credential rotation at the
    /// adapter) plus a clean record. With a `uid`, only the current lessee
    /// may reset, so a stale client cannot recycle a reassigned VM. A VM
    /// with no record is terminated outright so nothing leaks.
    pub async fn reset_vm(&self, vmid: &str, uid: Option<&str>) {
        if let Some(uid) = uid {
            match self.store.get(&self.pool, vmid).await {
                Ok(Some(row)) if row.uid.as_deref() == Some(uid) => {}
                Ok(_) => {
                    tracing::info!(pool = %self.pool, vmid, uid, "[RESET] lessee mismatch, ignoring");
                    return;
                }
                Err(e) => {
                    tracing::warn!(pool = %self.pool, vmid, error = %e, "[RESET] record lookup failed");
                    return;
                }
            }
        }

        if let Err(e) = self.provider.reboot_vm(vmid).await {
            // Transient reboot failures still restage the record; a VM
            // that is actually gone surfaces as 404 on the next staging
            // fetch and the row is dropped there.
            tracing::warn!(pool = %self.pool, vmid, error = %e, "[RESET] reboot failed");
        }

        match self.store.reset_to_staging(&self.pool, vmid, Utc::now()).await {
            Ok(true) => {
                tracing::info!(pool = %self.pool, vmid, "[RESET] VM restaged");
            }
            Ok(false) => {
                tracing::info!(pool = %self.pool, vmid, "[TERMINATE] no record for VM, terminating");
                if let Err(e) = self.provider.terminate_vm(vmid).await {
                    tracing::warn!(pool = %self.pool, vmid, error = %e, "[TERMINATE] failed");
                }
            }
            Err(e) => {
                tracing::warn!(pool = %self.pool, vmid, error = %e, "[RESET] record update failed");
            }
        }
    }

    pub async fn get_available_vbrowsers(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.store.list_vmids(&self.pool, VmState::Available).await?)
    }

    pub async fn get_staging_vbrowsers(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.store.list_vmids(&self.pool, VmState::Staging).await?)
    }

    /// Heartbeat relay for a leased VM's client.
    pub async fn record_heartbeat(&self, vmid: &str) -> anyhow::Result<bool> {
        Ok(self.store.touch_heartbeat(&self.pool, vmid, Utc::now()).await?)
    }

    /// Provisions one VM and registers it in `staging`. Shared by the grow
    /// loop and the warm-on-demand branch of the assignment protocol.
    pub(crate) async fn start_vm_wrapper(&self) -> anyhow::Result<()> {
        let name = vm_name();
        let vmid = self
            .provider
            .start_vm(&name)
            .await
            .context("provider start_vm")?;
        // A VM launched but not recorded is an orphan until the reconcile
        // loop sweeps it; the insert is therefore last.
        self.store.insert_staging(&self.pool, &vmid, Utc::now()).await?;
        self.stats.record_launch();
        tracing::info!(pool = %self.pool, vmid = %vmid, "[RESIZE-LAUNCH] VM requested");
        Ok(())
    }

    /// Operational snapshot refresh, off the hot path.
    pub async fn update_snapshot(&self) -> anyhow::Result<String> {
        let image = self.provider.update_snapshot().await?;
        tracing::info!(pool = %self.pool, image = %image, "[VMWORKER] snapshot updated");
        Ok(image)
    }
}
