use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use quasar_common::{HealthSnapshot, HealthStatus};

/// Process-wide health view, replaced as a whole after every probe cycle.
pub struct HealthState {
    snapshots: ArcSwap<HashMap<String, HealthSnapshot>>,
    ttl_ms: u64,
    cycles: AtomicU64,
}

impl HealthState {
    pub fn new(ttl: Duration) -> Self {
        Self {
            snapshots: ArcSwap::from_pointee(HashMap::new()),
            ttl_ms: ttl.as_millis() as u64,
            cycles: AtomicU64::new(0),
        }
    }

    pub fn ttl_ms(&self) -> u64 {
        self.ttl_ms
    }

    /// Number of cycles published so far.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> Arc<HashMap<String, HealthSnapshot>> {
        self.snapshots.load_full()
    }

    pub fn get(&self, endpoint_id: &str) -> Option<HealthSnapshot> {
        self.snapshots.load().get(endpoint_id).cloned()
    }

    /// TTL-adjusted status. `None` means the endpoint has never been probed.
    pub fn effective_status(&self, endpoint_id: &str, now_ms: u64) -> Option<HealthStatus> {
        self.snapshots
            .load()
            .get(endpoint_id)
            .map(|s| s.effective_status(now_ms, self.ttl_ms))
    }

    /// Swaps in the result of one probe cycle. Entries for endpoints no longer in
    /// `live` are dropped so a cycle that raced a deregistration cannot resurrect them.
    pub fn publish(&self, results: HashMap<String, HealthSnapshot>, live: &HashSet<String>) {
        let next: HashMap<String, HealthSnapshot> = results
            .into_iter()
            .filter(|(id, _)| live.contains(id))
            .collect();
        self.snapshots.store(Arc::new(next));
        self.cycles.fetch_add(1, Ordering::AcqRel);
    }

    pub fn remove(&self, endpoint_id: &str) {
        self.snapshots.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.remove(endpoint_id);
            next
        });
    }
}
