use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, LockBehavior, LockType};
use sea_orm::{
    ActiveValue::Set, ColumnTrait, Condition, ConnectionTrait, DbBackend, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Select, TransactionTrait,
};
use std::collections::HashSet;

use crate::entities::vm_record::{self, Column as VmCol, Entity as VmEntity, VmState};
use crate::error::Result;
use crate::store::VmStore;
use vbpool_common::types::VmDescriptor;

/// Outcome of a successful lease: the row is now `used` and bound to the
/// lessee; `data` carries the descriptor cached before the transition.
#[derive(Debug, Clone)]
pub struct LeasedVm {
    pub id: i64,
    pub vmid: String,
    pub room_id: String,
    pub uid: String,
    pub assign_time: DateTime<Utc>,
    pub data: Option<VmDescriptor>,
}

/// Snapshot returned by [`VmStore::increment_retries`].
#[derive(Debug, Clone)]
pub struct StagingAttempt {
    pub vmid: String,
    pub retries: i32,
    pub data: Option<VmDescriptor>,
}

/// `FOR UPDATE SKIP LOCKED` where the backend has row locks. SQLite
/// serializes writers, so the clause is both unsupported and unneeded
/// there.
fn with_row_lock(q: Select<VmEntity>, backend: DbBackend) -> Select<VmEntity> {
    if backend == DbBackend::Postgres {
        q.lock_with_behavior(LockType::Update, LockBehavior::SkipLocked)
    } else {
        q
    }
}

fn parse_descriptor(raw: Option<&str>) -> Option<VmDescriptor> {
    raw.and_then(|s| serde_json::from_str(s).ok())
}

impl VmStore {
    pub async fn count(&self, pool: &str, state: Option<VmState>) -> Result<u64> {
        Self::count_in(&self.db, pool, state).await
    }

    /// Count on an arbitrary connection, so the assignment transaction can
    /// observe its own view.
    pub async fn count_in<C: ConnectionTrait>(
        conn: &C,
        pool: &str,
        state: Option<VmState>,
    ) -> Result<u64> {
        let mut q = VmEntity::find().filter(VmCol::Pool.eq(pool));
        if let Some(state) = state {
            q = q.filter(VmCol::State.eq(state));
        }
        Ok(q.count(conn).await?)
    }

    /// Per-state counts for one pool, single round trip.
    pub async fn counts(&self, pool: &str) -> Result<vbpool_common::types::PoolCounts> {
        let rows: Vec<(VmState, i64)> = VmEntity::find()
            .select_only()
            .column(VmCol::State)
            .column_as(VmCol::Id.count(), "cnt")
            .filter(VmCol::Pool.eq(pool))
            .group_by(VmCol::State)
            .into_tuple()
            .all(&self.db)
            .await?;

        let mut counts = vbpool_common::types::PoolCounts::default();
        for (state, n) in rows {
            let n = n as u64;
            match state {
                VmState::Staging => counts.staging = n,
                VmState::Available => counts.available = n,
                VmState::Used => counts.used = n,
            }
        }
        Ok(counts)
    }

    /// Registers a freshly provisioned VM in `staging`.
    pub async fn insert_staging(
        &self,
        pool: &str,
        vmid: &str,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let am = vm_record::ActiveModel {
            pool: Set(pool.to_owned()),
            vmid: Set(vmid.to_owned()),
            state: Set(VmState::Staging),
            creation_time: Set(now),
            retries: Set(0),
            ..Default::default()
        };
        let res = VmEntity::insert(am).exec(&self.db).await?;
        Ok(res.last_insert_id)
    }

    /// Atomic lease: binds the lowest-id `available` row to `(room_id, uid)`
    /// and moves it to `used`, returning the previously cached descriptor.
    ///
    /// Single-row skip-locked selection means concurrent callers never
    /// collide on a row; each attempt takes at most one.
    pub async fn lease_next_available_in<C: ConnectionTrait>(
        conn: &C,
        pool: &str,
        room_id: &str,
        uid: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<LeasedVm>> {
        let q = VmEntity::find()
            .filter(VmCol::Pool.eq(pool))
            .filter(VmCol::State.eq(VmState::Available))
            .order_by_asc(VmCol::Id)
            .limit(1);
        let row = match with_row_lock(q, conn.get_database_backend()).one(conn).await? {
            Some(row) => row,
            None => return Ok(None),
        };

        // The state guard makes the transition atomic on backends without
        // row locks: losing a race reads as "no VM" and the caller retries.
        let res = VmEntity::update_many()
            .col_expr(VmCol::State, Expr::value(VmState::Used))
            .col_expr(VmCol::RoomId, Expr::value(Some(room_id.to_owned())))
            .col_expr(VmCol::Uid, Expr::value(Some(uid.to_owned())))
            .col_expr(VmCol::AssignTime, Expr::value(Some(now)))
            .filter(VmCol::Id.eq(row.id))
            .filter(VmCol::State.eq(VmState::Available))
            .exec(conn)
            .await?;
        if res.rows_affected == 0 {
            return Ok(None);
        }

        Ok(Some(LeasedVm {
            id: row.id,
            vmid: row.vmid,
            room_id: room_id.to_owned(),
            uid: uid.to_owned(),
            assign_time: now,
            data: parse_descriptor(row.data.as_deref()),
        }))
    }

    /// Atomic oldest-eligible decommission.
    ///
    /// Walks `available` rows in id order, keeps the first `min_size`
    /// untouchable, and deletes the first whose uptime-mod-hour exceeds
    /// `min_uptime_secs`, i.e. a VM approaching its next billing hour.
    /// Returns the deleted row's vmid.
    pub async fn delete_oldest_eligible(
        &self,
        pool: &str,
        min_size: u64,
        min_uptime_secs: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<String>> {
        let txn = self.db.begin().await?;
        let backend = txn.get_database_backend();

        // The whole remainder past the protected prefix is scanned:
        // eligibility is modular in age, so any position can be the only
        // row currently in its eligible phase.
        let q = VmEntity::find()
            .filter(VmCol::Pool.eq(pool))
            .filter(VmCol::State.eq(VmState::Available))
            .order_by_asc(VmCol::Id)
            .offset(min_size)
            .limit(i64::MAX as u64);
        let candidates = with_row_lock(q, backend).all(&txn).await?;

        let eligible = candidates
            .into_iter()
            .find(|r| uptime_mod_hour_secs(now, r.creation_time) > min_uptime_secs);

        match eligible {
            Some(row) => {
                // Guarded so a row leased between select and delete stays
                // leased instead of being decommissioned under its user.
                let res = VmEntity::delete_many()
                    .filter(VmCol::Id.eq(row.id))
                    .filter(VmCol::State.eq(VmState::Available))
                    .exec(&txn)
                    .await?;
                if res.rows_affected == 0 {
                    txn.rollback().await?;
                    return Ok(None);
                }
                txn.commit().await?;
                Ok(Some(row.vmid))
            }
            None => {
                txn.rollback().await?;
                Ok(None)
            }
        }
    }

    /// Bumps the staging attempt counter and returns the new value with the
    /// cached descriptor. `None` when the row has already left `staging`.
    pub async fn increment_retries(&self, pool: &str, vmid: &str) -> Result<Option<StagingAttempt>> {
        let txn = self.db.begin().await?;

        let res = VmEntity::update_many()
            .col_expr(VmCol::Retries, Expr::col(VmCol::Retries).add(1))
            .filter(VmCol::Pool.eq(pool))
            .filter(VmCol::Vmid.eq(vmid))
            .filter(VmCol::State.eq(VmState::Staging))
            .exec(&txn)
            .await?;
        if res.rows_affected == 0 {
            txn.rollback().await?;
            return Ok(None);
        }

        let row = VmEntity::find()
            .filter(VmCol::Pool.eq(pool))
            .filter(VmCol::Vmid.eq(vmid))
            .one(&txn)
            .await?;
        txn.commit().await?;

        Ok(row.map(|row| StagingAttempt {
            vmid: row.vmid,
            retries: row.retries,
            data: parse_descriptor(row.data.as_deref()),
        }))
    }

    /// Persists a freshly fetched provider descriptor on a staging row.
    pub async fn set_descriptor(
        &self,
        pool: &str,
        vmid: &str,
        descriptor: &VmDescriptor,
    ) -> Result<()> {
        let json = serde_json::to_string(descriptor)?;
        VmEntity::update_many()
            .col_expr(VmCol::Data, Expr::value(Some(json)))
            .filter(VmCol::Pool.eq(pool))
            .filter(VmCol::Vmid.eq(vmid))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// staging → available. Returns false when the row was gone.
    pub async fn mark_available(&self, pool: &str, vmid: &str, now: DateTime<Utc>) -> Result<bool> {
        let res = VmEntity::update_many()
            .col_expr(VmCol::State, Expr::value(VmState::Available))
            .col_expr(VmCol::ReadyTime, Expr::value(Some(now)))
            .filter(VmCol::Pool.eq(pool))
            .filter(VmCol::Vmid.eq(vmid))
            .filter(VmCol::State.eq(VmState::Staging))
            .exec(&self.db)
            .await?;
        Ok(res.rows_affected > 0)
    }

    /// Returns a row to `staging` with a clean slate: lessee, retries,
    /// heartbeat, readiness and cached descriptor all cleared.
    pub async fn reset_to_staging(&self, pool: &str, vmid: &str, now: DateTime<Utc>) -> Result<bool> {
        let res = VmEntity::update_many()
            .col_expr(VmCol::State, Expr::value(VmState::Staging))
            .col_expr(VmCol::RoomId, Expr::value(Option::<String>::None))
            .col_expr(VmCol::Uid, Expr::value(Option::<String>::None))
            .col_expr(VmCol::Retries, Expr::value(0))
            .col_expr(VmCol::HeartbeatTime, Expr::value(Option::<DateTime<Utc>>::None))
            .col_expr(VmCol::ReadyTime, Expr::value(Option::<DateTime<Utc>>::None))
            .col_expr(VmCol::AssignTime, Expr::value(Option::<DateTime<Utc>>::None))
            .col_expr(VmCol::Data, Expr::value(Option::<String>::None))
            .col_expr(VmCol::ResetTime, Expr::value(Some(now)))
            .filter(VmCol::Pool.eq(pool))
            .filter(VmCol::Vmid.eq(vmid))
            .exec(&self.db)
            .await?;
        Ok(res.rows_affected > 0)
    }

    pub async fn delete_record(&self, pool: &str, vmid: &str) -> Result<bool> {
        let res = VmEntity::delete_many()
            .filter(VmCol::Pool.eq(pool))
            .filter(VmCol::Vmid.eq(vmid))
            .exec(&self.db)
            .await?;
        Ok(res.rows_affected > 0)
    }

    pub async fn get(&self, pool: &str, vmid: &str) -> Result<Option<vm_record::Model>> {
        Ok(VmEntity::find()
            .filter(VmCol::Pool.eq(pool))
            .filter(VmCol::Vmid.eq(vmid))
            .one(&self.db)
            .await?)
    }

    pub async fn list_vmids(&self, pool: &str, state: VmState) -> Result<Vec<String>> {
        Ok(VmEntity::find()
            .select_only()
            .column(VmCol::Vmid)
            .filter(VmCol::Pool.eq(pool))
            .filter(VmCol::State.eq(state))
            .order_by_asc(VmCol::Id)
            .into_tuple()
            .all(&self.db)
            .await?)
    }

    pub async fn list_staging(&self, pool: &str) -> Result<Vec<vm_record::Model>> {
        Ok(VmEntity::find()
            .filter(VmCol::Pool.eq(pool))
            .filter(VmCol::State.eq(VmState::Staging))
            .order_by_asc(VmCol::Id)
            .all(&self.db)
            .await?)
    }

    /// The reconciler's keep-set: vmids in `staging`/`available`, plus any
    /// row with a heartbeat after `heartbeat_cutoff`. Everything else the
    /// provider still runs under our tag is fair game for reclaim.
    pub async fn keep_set(
        &self,
        pool: &str,
        heartbeat_cutoff: DateTime<Utc>,
    ) -> Result<HashSet<String>> {
        let rows: Vec<String> = VmEntity::find()
            .select_only()
            .column(VmCol::Vmid)
            .filter(VmCol::Pool.eq(pool))
            .filter(
                Condition::any()
                    .add(VmCol::State.is_in([VmState::Staging, VmState::Available]))
                    .add(VmCol::HeartbeatTime.gt(heartbeat_cutoff)),
            )
            .into_tuple()
            .all(&self.db)
            .await?;
        Ok(rows.into_iter().collect())
    }

    /// Client liveness ping for a leased VM.
    pub async fn touch_heartbeat(&self, pool: &str, vmid: &str, now: DateTime<Utc>) -> Result<bool> {
        let res = VmEntity::update_many()
            .col_expr(VmCol::HeartbeatTime, Expr::value(Some(now)))
            .filter(VmCol::Pool.eq(pool))
            .filter(VmCol::Vmid.eq(vmid))
            .filter(VmCol::State.eq(VmState::Used))
            .exec(&self.db)
            .await?;
        Ok(res.rows_affected > 0)
    }
}

/// Seconds of uptime into the current billing hour.
pub(crate) fn uptime_mod_hour_secs(now: DateTime<Utc>, creation: DateTime<Utc>) -> i64 {
    (now - creation).num_seconds().rem_euclid(3600)
}
