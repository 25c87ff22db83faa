//! Durable state for the VM pools.
//!
//! One row per managed VM, keyed `(pool, vmid)`, plus the externally-owned
//! `room_queue` membership table. All cross-task coordination in the pool
//! controller goes through this store: the lease and decommission
//! primitives take single-row locks (skip-locked on Postgres) so the
//! concurrent control loops never need in-process locking.

pub mod entities;
pub mod error;
pub mod store;

#[cfg(test)]
mod tests;

pub use entities::vm_record;
pub use entities::VmState;
pub use error::{Result, StorageError};
pub use store::{LeasedVm, StagingAttempt, VmStore};
