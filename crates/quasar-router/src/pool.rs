use std::sync::Arc;

use arc_swap::ArcSwap;
use quasar_common::{Endpoint, PoolKind};

/// Endpoint membership for every pool.
///
/// Readers take a lock-free snapshot; writers replace the whole list, so a
/// reader never sees a half-applied change.
pub struct UpstreamPools {
    endpoints: ArcSwap<Vec<Arc<Endpoint>>>,
}

impl UpstreamPools {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        let mut list: Vec<Arc<Endpoint>> = Vec::with_capacity(endpoints.len());
        for ep in endpoints {
            if list.iter().any(|e| e.id == ep.id) {
                tracing::warn!(endpoint=%ep.id, "duplicate endpoint in configuration, ignoring");
                continue;
            }
            list.push(Arc::new(ep));
        }
        Self {
            endpoints: ArcSwap::from_pointee(list),
        }
    }

    /// Endpoints of `pool`, in configuration order with managed endpoints appended.
    pub fn members(&self, pool: PoolKind) -> Vec<Arc<Endpoint>> {
        self.endpoints
            .load()
            .iter()
            .filter(|e| e.pool == pool)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<Endpoint>> {
        self.endpoints.load().iter().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Endpoint>> {
        self.endpoints.load().iter().find(|e| e.id == id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.endpoints.load().iter().any(|e| e.id == id)
    }

    /// Adds `endpoint`, or replaces the entry with the same id in place.
    pub fn upsert(&self, endpoint: Endpoint) {
        let endpoint = Arc::new(endpoint);
        self.endpoints.rcu(|current| {
            let mut next: Vec<Arc<Endpoint>> = current.iter().cloned().collect();
            match next.iter().position(|e| e.id == endpoint.id) {
                Some(i) => next[i] = endpoint.clone(),
                None => next.push(endpoint.clone()),
            }
            next
        });
        tracing::info!(endpoint=%endpoint.id, pool=%endpoint.pool, base_url=%endpoint.base_url, "endpoint registered");
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Endpoint>> {
        let prev = self.endpoints.rcu(|current| {
            current
                .iter()
                .filter(|e| e.id != id)
                .cloned()
                .collect::<Vec<_>>()
        });
        let removed = prev.iter().find(|e| e.id == id).cloned();
        if removed.is_some() {
            tracing::info!(endpoint=%id, "endpoint deregistered");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pools() -> UpstreamPools {
        UpstreamPools::new(vec![
            Endpoint::from_config(PoolKind::Generate, "http://a", None),
            Endpoint::from_config(PoolKind::Embed, "http://e", None),
            Endpoint::from_config(PoolKind::Generate, "http://b", None),
            Endpoint::from_config(PoolKind::Generate, "http://a", None),
        ])
    }

    #[test]
    fn members_keep_order_and_drop_duplicates() {
        let p = pools();
        let ids: Vec<_> = p.members(PoolKind::Generate).iter().map(|e| e.base_url.clone()).collect();
        assert_eq!(ids, vec!["http://a", "http://b"]);
        assert_eq!(p.members(PoolKind::Embed).len(), 1);
    }

    #[test]
    fn upsert_and_remove_managed() {
        let p = pools();
        p.upsert(Endpoint::managed(PoolKind::Generate, "m1", "http://127.0.0.1:9000"));
        assert_eq!(p.members(PoolKind::Generate).len(), 3);

        p.upsert(Endpoint::managed(PoolKind::Generate, "m1", "http://127.0.0.1:9001"));
        let m = p.get("managed:m1").unwrap();
        assert_eq!(m.base_url, "http://127.0.0.1:9001");
        assert_eq!(p.members(PoolKind::Generate).len(), 3);

        assert!(p.remove("managed:m1").is_some());
        assert!(p.remove("managed:m1").is_none());
        assert!(!p.contains("managed:m1"));
    }
}
