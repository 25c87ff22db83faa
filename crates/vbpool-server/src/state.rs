use std::collections::HashMap;
use std::sync::Arc;

use vbpool_manager::PoolManager;
use vbpool_storage::VmStore;

#[derive(Clone)]
pub struct AppState {
    /// Managers keyed by pool name.
    pub pools: Arc<HashMap<String, Arc<PoolManager>>>,
    pub store: Arc<VmStore>,
    pub assign_timeout_secs: u64,
}

impl AppState {
    pub fn pool(&self, name: &str) -> Option<&Arc<PoolManager>> {
        self.pools.get(name)
    }
}
