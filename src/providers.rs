//! Ordered pool of remote ledger endpoints with failover

use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use tracing::{info, warn};

/// One remote ledger endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEndpoint {
    pub url: String,
    pub name: String,
    pub priority: u32,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

/// Priority-ordered endpoint list.
///
/// `switch_provider` marks the current endpoint inactive and advances to
/// the next active one, wrapping around; once every endpoint has been
/// marked inactive the pool reactivates all of them rather than going
/// dark. A single-endpoint pool never switches.
#[derive(Debug)]
pub struct ProviderPool {
    inner: RwLock<PoolState>,
}

#[derive(Debug)]
struct PoolState {
    endpoints: Vec<ProviderEndpoint>,
    current: usize,
}

impl ProviderPool {
    pub fn new(mut endpoints: Vec<ProviderEndpoint>) -> Self {
        assert!(!endpoints.is_empty(), "provider pool needs at least one endpoint");
        endpoints.sort_by_key(|e| e.priority);
        Self {
            inner: RwLock::new(PoolState {
                endpoints,
                current: 0,
            }),
        }
    }

    /// URL of the currently active endpoint.
    pub fn current_url(&self) -> String {
        let state = self.inner.read().unwrap();
        state.endpoints[state.current].url.clone()
    }

    /// Name of the currently active endpoint.
    pub fn current_name(&self) -> String {
        let state = self.inner.read().unwrap();
        state.endpoints[state.current].name.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark the current endpoint inactive and advance to the next active
    /// one. Returns the new endpoint URL, or None when there is only one
    /// endpoint configured (no-op).
    pub fn switch_provider(&self) -> Option<String> {
        let mut state = self.inner.write().unwrap();
        if state.endpoints.len() < 2 {
            return None;
        }

        let old = state.current;
        state.endpoints[old].is_active = false;
        let old_name = state.endpoints[old].name.clone();

        let n = state.endpoints.len();
        let next = (1..n)
            .map(|step| (old + step) % n)
            .find(|&idx| state.endpoints[idx].is_active);

        let next = match next {
            Some(idx) => idx,
            None => {
                // Every endpoint failed; start the rotation over.
                warn!("all providers marked inactive, reactivating the pool");
                for ep in state.endpoints.iter_mut() {
                    ep.is_active = true;
                }
                (old + 1) % n
            }
        };

        state.current = next;
        let new_name = state.endpoints[next].name.clone();
        let new_url = state.endpoints[next].url.clone();
        info!("provider failover: {} -> {}", old_name, new_name);
        Some(new_url)
    }

    /// Snapshot of endpoint states for status display.
    pub fn snapshot(&self) -> Vec<ProviderEndpoint> {
        self.inner.read().unwrap().endpoints.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(name: &str, priority: u32) -> ProviderEndpoint {
        ProviderEndpoint {
            url: format!("https://{}.example", name),
            name: name.to_string(),
            priority,
            is_active: true,
        }
    }

    #[test]
    fn sorts_by_priority() {
        let pool = ProviderPool::new(vec![endpoint("b", 2), endpoint("a", 1)]);
        assert_eq!(pool.current_name(), "a");
    }

    #[test]
    fn switch_advances_and_wraps() {
        let pool = ProviderPool::new(vec![endpoint("a", 1), endpoint("b", 2), endpoint("c", 3)]);
        assert_eq!(pool.switch_provider(), Some("https://b.example".to_string()));
        assert_eq!(pool.switch_provider(), Some("https://c.example".to_string()));
        // a and b are inactive now; wrapping reactivates the pool
        assert!(pool.switch_provider().is_some());
    }

    #[test]
    fn single_endpoint_is_noop() {
        let pool = ProviderPool::new(vec![endpoint("solo", 1)]);
        assert_eq!(pool.switch_provider(), None);
        assert_eq!(pool.current_name(), "solo");
    }
}
