//! Entities waiting on asset uploads
//!
//! An entity that references an asset whose upload has not been confirmed is
//! recorded here. Confirmation releases every dependent exactly once. If the
//! confirmation never comes the dependents are reported stalled once and then
//! left alone.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyEvent {
    /// An entity is waiting for an asset
    Deferred { asset_id: String, entity_id: String },
    /// The asset was confirmed; its dependents can use it now
    Released {
        asset_id: String,
        entities: Vec<String>,
    },
    /// The asset did not arrive in time
    Stalled {
        asset_id: String,
        entities: Vec<String>,
    },
}

#[derive(Debug)]
struct Waiting {
    entities: Vec<String>,
    since: Instant,
    stalled: bool,
}

#[derive(Debug)]
pub struct AssetDependencies {
    stall_after: Duration,
    waiting: BTreeMap<String, Waiting>,
    confirmed: HashSet<String>,
}

impl AssetDependencies {
    pub fn new(stall_after: Duration) -> Self {
        Self {
            stall_after,
            waiting: BTreeMap::new(),
            confirmed: HashSet::new(),
        }
    }

    pub fn is_confirmed(&self, asset_id: &str) -> bool {
        self.confirmed.contains(asset_id)
    }

    pub fn is_waiting(&self, asset_id: &str) -> bool {
        self.waiting.contains_key(asset_id)
    }

    /// Record that `entity_id` needs `asset_id`
    ///
    /// Returns `false` if the asset is already confirmed and nothing was recorded.
    pub fn register(&mut self, asset_id: &str, entity_id: &str, now: Instant) -> bool {
        if self.confirmed.contains(asset_id) {
            return false;
        }
        let waiting = self
            .waiting
            .entry(asset_id.to_string())
            .or_insert_with(|| Waiting {
                entities: Vec::new(),
                since: now,
                stalled: false,
            });
        if !waiting.entities.iter().any(|e| e == entity_id) {
            waiting.entities.push(entity_id.to_string());
        }
        debug!("{} deferred until asset {} is confirmed", entity_id, asset_id);
        true
    }

    /// The upload of `asset_id` was confirmed; returns its dependents
    pub fn release(&mut self, asset_id: &str) -> Vec<String> {
        self.confirmed.insert(asset_id.to_string());
        self.waiting
            .remove(asset_id)
            .map(|w| w.entities)
            .unwrap_or_default()
    }

    /// An entity changed id (temporary id adopted by the authority)
    pub fn rekey(&mut self, old_id: &str, new_id: &str) {
        for waiting in self.waiting.values_mut() {
            for entity in waiting.entities.iter_mut() {
                if *entity == old_id {
                    *entity = new_id.to_string();
                }
            }
        }
    }

    /// Stop tracking an entity; assets left without dependents are dropped
    pub fn remove_entity(&mut self, entity_id: &str) {
        self.waiting.retain(|_, waiting| {
            waiting.entities.retain(|e| e != entity_id);
            !waiting.entities.is_empty()
        });
    }

    /// Report assets that just crossed the stall threshold
    pub fn poll(&mut self, now: Instant) -> Vec<(String, Vec<String>)> {
        let mut stalled = Vec::new();
        for (asset_id, waiting) in self.waiting.iter_mut() {
            if !waiting.stalled && now >= waiting.since + self.stall_after {
                warn!(
                    "Asset {} unconfirmed after {:?}, {} dependents stalled",
                    asset_id,
                    self.stall_after,
                    waiting.entities.len()
                );
                waiting.stalled = true;
                stalled.push((asset_id.clone(), waiting.entities.clone()));
            }
        }
        stalled
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.waiting
            .values()
            .filter(|w| !w.stalled)
            .map(|w| w.since + self.stall_after)
            .min()
    }

    pub fn clear(&mut self) {
        self.waiting.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_returns_dependents_once() {
        let mut deps = AssetDependencies::new(Duration::from_secs(60));
        let now = Instant::now();
        assert!(deps.register("a1", "s1", now));
        assert!(deps.register("a1", "s2", now));
        assert!(deps.register("a1", "s1", now));

        assert_eq!(deps.release("a1"), vec!["s1".to_string(), "s2".to_string()]);
        assert!(deps.release("a1").is_empty());
        assert!(!deps.register("a1", "s3", now));
    }

    #[test]
    fn test_stall_reported_once() {
        let mut deps = AssetDependencies::new(Duration::from_secs(60));
        let t0 = Instant::now();
        deps.register("a1", "s1", t0);

        assert!(deps.poll(t0 + Duration::from_secs(59)).is_empty());
        assert_eq!(
            deps.poll(t0 + Duration::from_secs(60)),
            vec![("a1".to_string(), vec!["s1".to_string()])]
        );
        assert!(deps.poll(t0 + Duration::from_secs(600)).is_empty());
        assert_eq!(deps.next_deadline(), None);

        // A late confirmation still releases the stalled dependents
        assert_eq!(deps.release("a1"), vec!["s1".to_string()]);
    }

    #[test]
    fn test_rekey_and_remove() {
        let mut deps = AssetDependencies::new(Duration::from_secs(60));
        let now = Instant::now();
        deps.register("a1", "opt_1", now);
        deps.rekey("opt_1", "s9");
        deps.remove_entity("opt_1");
        assert!(deps.is_waiting("a1"));

        deps.remove_entity("s9");
        assert!(!deps.is_waiting("a1"));
    }
}
