use chrono::{Duration, Utc};
use sea_orm::{ActiveValue::Set, EntityTrait};
use tempfile::TempDir;

use crate::entities::vm_record::{self, VmState};
use crate::store::vm::uptime_mod_hour_secs;
use crate::VmStore;
use vbpool_common::types::VmDescriptor;

async fn setup() -> (TempDir, VmStore) {
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite://{}/pool.db?mode=rwc", dir.path().display());
    let store = VmStore::connect(&url).await.unwrap();
    (dir, store)
}

fn descriptor(vmid: &str) -> VmDescriptor {
    VmDescriptor {
        id: vmid.to_string(),
        pass: "cafe".into(),
        host: format!("{vmid}.vb.example.com/"),
        private_ip: "10.0.0.9".into(),
        state: "running".into(),
        tags: vec!["vbrowserUS".into()],
        creation_date: None,
        provider: "Hetzner".into(),
        large: false,
        region: "US".into(),
    }
}

async fn seed_vm(store: &VmStore, pool: &str, vmid: &str, state: VmState, age_secs: i64) -> i64 {
    let now = Utc::now();
    let am = vm_record::ActiveModel {
        pool: Set(pool.to_owned()),
        vmid: Set(vmid.to_owned()),
        state: Set(state),
        creation_time: Set(now - Duration::seconds(age_secs)),
        ready_time: Set(matches!(state, VmState::Available | VmState::Used).then_some(now)),
        retries: Set(0),
        ..Default::default()
    };
    vm_record::Entity::insert(am)
        .exec(store.db())
        .await
        .unwrap()
        .last_insert_id
}

#[tokio::test]
async fn lease_takes_lowest_id_first() {
    let (_dir, store) = setup().await;
    seed_vm(&store, "HetznerUS", "vm-a", VmState::Available, 60).await;
    seed_vm(&store, "HetznerUS", "vm-b", VmState::Available, 30).await;
    seed_vm(&store, "HetznerUS", "vm-c", VmState::Available, 10).await;
    store
        .set_descriptor("HetznerUS", "vm-a", &descriptor("vm-a"))
        .await
        .unwrap();

    let leased = VmStore::lease_next_available_in(store.db(), "HetznerUS", "roomA", "uidA", Utc::now())
        .await
        .unwrap()
        .expect("a VM should be leased");

    assert_eq!(leased.vmid, "vm-a");
    assert_eq!(leased.data.unwrap().id, "vm-a");

    let row = store.get("HetznerUS", "vm-a").await.unwrap().unwrap();
    assert_eq!(row.state, VmState::Used);
    assert_eq!(row.room_id.as_deref(), Some("roomA"));
    assert_eq!(row.uid.as_deref(), Some("uidA"));
    assert!(row.assign_time.is_some());
}

#[tokio::test]
async fn lease_returns_none_on_empty_pool() {
    let (_dir, store) = setup().await;
    seed_vm(&store, "HetznerUS", "vm-a", VmState::Staging, 5).await;

    let leased = VmStore::lease_next_available_in(store.db(), "HetznerUS", "roomA", "uidA", Utc::now())
        .await
        .unwrap();
    assert!(leased.is_none());
}

#[tokio::test]
async fn concurrent_leases_never_share_a_vm() {
    let (_dir, store) = setup().await;
    let store = std::sync::Arc::new(store);
    for i in 0..3 {
        seed_vm(&store, "HetznerUS", &format!("vm-{i}"), VmState::Available, 60).await;
    }

    // Each assigner retries like the assignment protocol does, until it
    // leases a VM or the pool is drained.
    let mut handles = Vec::new();
    for i in 0..6 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let leased = VmStore::lease_next_available_in(
                    store.db(),
                    "HetznerUS",
                    &format!("room-{i}"),
                    &format!("uid-{i}"),
                    Utc::now(),
                )
                .await
                .unwrap();
                if let Some(vm) = leased {
                    break Some(vm.vmid);
                }
                if store
                    .count("HetznerUS", Some(VmState::Available))
                    .await
                    .unwrap()
                    == 0
                {
                    break None;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        }));
    }

    let mut leased = Vec::new();
    for h in handles {
        if let Some(vmid) = h.await.unwrap() {
            leased.push(vmid);
        }
    }

    let total = leased.len();
    leased.sort();
    leased.dedup();
    assert_eq!(leased.len(), total, "no VM may be leased twice");
    assert_eq!(leased.len(), 3, "every VM must be leased exactly once");
    assert_eq!(store.count("HetznerUS", Some(VmState::Available)).await.unwrap(), 0);
}

#[tokio::test]
async fn counts_partition_the_pool() {
    let (_dir, store) = setup().await;
    seed_vm(&store, "HetznerUS", "s1", VmState::Staging, 5).await;
    seed_vm(&store, "HetznerUS", "a1", VmState::Available, 5).await;
    seed_vm(&store, "HetznerUS", "a2", VmState::Available, 5).await;
    seed_vm(&store, "HetznerUS", "u1", VmState::Used, 5).await;
    seed_vm(&store, "DOEU", "other", VmState::Available, 5).await;

    let counts = store.counts("HetznerUS").await.unwrap();
    assert_eq!(counts.staging, 1);
    assert_eq!(counts.available, 2);
    assert_eq!(counts.used, 1);
    assert_eq!(counts.total(), store.count("HetznerUS", None).await.unwrap());
}

#[tokio::test]
async fn reset_clears_lessee_and_counters() {
    let (_dir, store) = setup().await;
    seed_vm(&store, "HetznerUS", "vm-a", VmState::Available, 60).await;
    VmStore::lease_next_available_in(store.db(), "HetznerUS", "roomA", "uidA", Utc::now())
        .await
        .unwrap()
        .unwrap();

    assert!(store.reset_to_staging("HetznerUS", "vm-a", Utc::now()).await.unwrap());

    let row = store.get("HetznerUS", "vm-a").await.unwrap().unwrap();
    assert_eq!(row.state, VmState::Staging);
    assert_eq!(row.retries, 0);
    assert!(row.room_id.is_none());
    assert!(row.uid.is_none());
    assert!(row.ready_time.is_none());
    assert!(row.assign_time.is_none());
    assert!(row.heartbeat_time.is_none());
    assert!(row.data.is_none());
    assert!(row.reset_time.is_some());

    // Idempotent on a row already back in staging.
    assert!(store.reset_to_staging("HetznerUS", "vm-a", Utc::now()).await.unwrap());
    // And reports the miss for an unknown vmid.
    assert!(!store.reset_to_staging("HetznerUS", "nope", Utc::now()).await.unwrap());
}

#[tokio::test]
async fn mark_available_only_promotes_staging_rows() {
    let (_dir, store) = setup().await;
    seed_vm(&store, "HetznerUS", "vm-a", VmState::Staging, 5).await;

    assert!(store.mark_available("HetznerUS", "vm-a", Utc::now()).await.unwrap());
    let row = store.get("HetznerUS", "vm-a").await.unwrap().unwrap();
    assert_eq!(row.state, VmState::Available);
    assert!(row.ready_time.is_some());

    // Second promotion is a no-op: the row is no longer staging.
    assert!(!store.mark_available("HetznerUS", "vm-a", Utc::now()).await.unwrap());
}

#[tokio::test]
async fn increment_retries_counts_up_and_skips_promoted_rows() {
    let (_dir, store) = setup().await;
    seed_vm(&store, "HetznerUS", "vm-a", VmState::Staging, 5).await;
    store
        .set_descriptor("HetznerUS", "vm-a", &descriptor("vm-a"))
        .await
        .unwrap();

    let first = store.increment_retries("HetznerUS", "vm-a").await.unwrap().unwrap();
    assert_eq!(first.retries, 1);
    assert_eq!(first.data.unwrap().id, "vm-a");
    let second = store.increment_retries("HetznerUS", "vm-a").await.unwrap().unwrap();
    assert_eq!(second.retries, 2);

    store.mark_available("HetznerUS", "vm-a", Utc::now()).await.unwrap();
    assert!(store.increment_retries("HetznerUS", "vm-a").await.unwrap().is_none());
}

#[tokio::test]
async fn shrink_skips_protected_prefix_and_gates_on_uptime() {
    let (_dir, store) = setup().await;
    // 45 min into the hour: below a 50-minute floor.
    seed_vm(&store, "HetznerUS", "young", VmState::Available, 45 * 60).await;
    // 52 min into the hour: past the floor, but protected by min_size=1...
    seed_vm(&store, "HetznerUS", "old-1", VmState::Available, 52 * 60).await;
    // ...only if it is in the prefix; it is not, "young" is.
    seed_vm(&store, "HetznerUS", "old-2", VmState::Available, 112 * 60).await;

    let floor = 50 * 60;

    // min_size=3: everything protected.
    assert!(store
        .delete_oldest_eligible("HetznerUS", 3, floor, Utc::now())
        .await
        .unwrap()
        .is_none());

    // min_size=1: "young" is protected by position; "old-1" is the first
    // eligible candidate (52 min mod hour > 50 min).
    let deleted = store
        .delete_oldest_eligible("HetznerUS", 1, floor, Utc::now())
        .await
        .unwrap();
    assert_eq!(deleted.as_deref(), Some("old-1"));

    // "old-2" is 112 min old = 52 min into its second hour: still eligible.
    let deleted = store
        .delete_oldest_eligible("HetznerUS", 1, floor, Utc::now())
        .await
        .unwrap();
    assert_eq!(deleted.as_deref(), Some("old-2"));

    // Only "young" remains and it is both protected and ineligible.
    assert!(store
        .delete_oldest_eligible("HetznerUS", 0, floor, Utc::now())
        .await
        .unwrap()
        .is_none());
    assert_eq!(store.count("HetznerUS", Some(VmState::Available)).await.unwrap(), 1);
}

#[tokio::test]
async fn keep_set_spares_live_rows_only() {
    let (_dir, store) = setup().await;
    let now = Utc::now();
    seed_vm(&store, "HetznerUS", "stage", VmState::Staging, 5).await;
    seed_vm(&store, "HetznerUS", "avail", VmState::Available, 5).await;
    seed_vm(&store, "HetznerUS", "live", VmState::Used, 5).await;
    seed_vm(&store, "HetznerUS", "dead", VmState::Used, 5).await;
    store.touch_heartbeat("HetznerUS", "live", now).await.unwrap();

    let keep = store
        .keep_set("HetznerUS", now - Duration::minutes(5))
        .await
        .unwrap();

    assert!(keep.contains("stage"));
    assert!(keep.contains("avail"));
    assert!(keep.contains("live"));
    assert!(!keep.contains("dead"), "stale-heartbeat lease must be reclaimable");
}

#[tokio::test]
async fn heartbeat_only_lands_on_leased_rows() {
    let (_dir, store) = setup().await;
    seed_vm(&store, "HetznerUS", "avail", VmState::Available, 5).await;
    assert!(!store.touch_heartbeat("HetznerUS", "avail", Utc::now()).await.unwrap());
}

#[tokio::test]
async fn room_queue_round_trip() {
    let (_dir, store) = setup().await;
    let now = Utc::now();

    assert!(!store.is_room_waiting("roomA").await.unwrap());
    store.enqueue_room("roomA", now).await.unwrap();
    // Re-enqueue of a waiting room is a no-op, not an error.
    store.enqueue_room("roomA", now).await.unwrap();
    assert!(store.is_room_waiting("roomA").await.unwrap());

    assert!(store.dequeue_room("roomA").await.unwrap());
    assert!(!store.dequeue_room("roomA").await.unwrap());
    assert!(!store.is_room_waiting("roomA").await.unwrap());
}

#[test]
fn uptime_mod_hour_wraps_every_hour() {
    let now = Utc::now();
    assert_eq!(uptime_mod_hour_secs(now, now - Duration::minutes(45)), 2700);
    assert_eq!(uptime_mod_hour_secs(now, now - Duration::minutes(60)), 0);
    assert_eq!(uptime_mod_hour_secs(now, now - Duration::minutes(112)), 3120);
}
