//! Watch registry: which attributes are monitored, kept in sync with the
//! entity lifecycle feed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::detect::config::parse_strategy_configs;
use crate::detect::{AttributeEvaluator, StrategyConfig};
use crate::model::AttributeKey;
use crate::ports::WatchSource;

/// Metadata of one attribute on an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeMeta {
    pub name: String,
    /// Only attributes whose datapoints are stored can be monitored.
    #[serde(default)]
    pub store_datapoints: bool,
    /// Raw strategy list; validated when the attribute is watched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anomaly_detection: Option<serde_json::Value>,
}

impl AttributeMeta {
    pub fn has_monitoring(&self) -> bool {
        self.anomaly_detection.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub attributes: Vec<AttributeMeta>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Created(Entity),
    Updated {
        entity_id: String,
        /// Attribute snapshot before the update, when the feed has one.
        previous: Option<Vec<AttributeMeta>>,
        current: Vec<AttributeMeta>,
    },
    Deleted(Entity),
}

/// Attributes of an entity that qualify for monitoring, with their parsed
/// strategies. Attributes with malformed configuration are logged and left
/// out.
pub fn monitored_attributes(entity_id: &str, attributes: &[AttributeMeta]) -> Vec<(AttributeKey, Vec<StrategyConfig>)> {
    attributes
        .iter()
        .filter(|attr| attr.store_datapoints)
        .filter_map(|attr| {
            let raw = attr.anomaly_detection.as_ref()?;
            let key = AttributeKey::new(entity_id, attr.name.clone());
            match parse_strategy_configs(raw) {
                Ok(configs) if configs.is_empty() => {
                    debug!(%key, "monitoring metadata lists no strategies");
                    None
                }
                Ok(configs) => Some((key, configs)),
                Err(e) => {
                    warn!(%key, error = %e, "ignoring attribute with invalid monitoring configuration");
                    None
                }
            }
        })
        .collect()
}

/// A monitored attribute and its evaluator.
#[derive(Debug)]
pub struct WatchedAttribute {
    key: AttributeKey,
    configs: Vec<StrategyConfig>,
    evaluator: Mutex<AttributeEvaluator>,
}

impl WatchedAttribute {
    fn new(key: AttributeKey, configs: Vec<StrategyConfig>) -> Self {
        let evaluator = Mutex::new(AttributeEvaluator::new(key.clone(), &configs));
        Self { key, configs, evaluator }
    }

    pub fn key(&self) -> &AttributeKey {
        &self.key
    }

    pub fn configs(&self) -> &[StrategyConfig] {
        &self.configs
    }

    /// Exclusive access to the evaluator; holds evaluation of this key only.
    pub fn evaluator(&self) -> MutexGuard<'_, AttributeEvaluator> {
        self.evaluator.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Read-mostly map of watched attributes. Lifecycle mutations take the write
/// lock briefly; evaluation clones the entry out and locks only that key.
#[derive(Debug, Default)]
pub struct WatchRegistry {
    attributes: RwLock<HashMap<AttributeKey, Arc<WatchedAttribute>>>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the registry contents with every monitored attribute the
    /// source knows about.
    pub fn load(&self, source: &dyn WatchSource) -> Result<usize> {
        let entities = source
            .list_watched_entities()
            .context("failed to list entities for watch registry")?;
        let mut fresh = HashMap::new();
        for entity in &entities {
            for (key, configs) in monitored_attributes(&entity.id, &entity.attributes) {
                fresh.insert(key.clone(), Arc::new(WatchedAttribute::new(key, configs)));
            }
        }
        let count = fresh.len();
        *self.write() = fresh;
        info!(entities = entities.len(), attributes = count, "watch registry loaded");
        Ok(count)
    }

    /// Start watching `key`, discarding any state held under a previous
    /// configuration.
    pub fn watch(&self, key: AttributeKey, configs: Vec<StrategyConfig>) {
        debug!(%key, strategies = configs.len(), "watching attribute");
        self.write()
            .insert(key.clone(), Arc::new(WatchedAttribute::new(key, configs)));
    }

    pub fn unwatch(&self, key: &AttributeKey) -> bool {
        let removed = self.write().remove(key).is_some();
        if removed {
            debug!(%key, "attribute unwatched");
        }
        removed
    }

    pub fn get(&self, key: &AttributeKey) -> Option<Arc<WatchedAttribute>> {
        self.read().get(key).cloned()
    }

    pub fn contains(&self, key: &AttributeKey) -> bool {
        self.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Watched keys in sorted order.
    pub fn keys(&self) -> Vec<AttributeKey> {
        let mut keys: Vec<_> = self.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn apply(&self, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::Created(entity) => {
                for (key, configs) in monitored_attributes(&entity.id, &entity.attributes) {
                    self.watch(key, configs);
                }
            }
            LifecycleEvent::Updated {
                entity_id,
                previous,
                current,
            } => self.apply_update(entity_id, previous.as_deref(), current),
            LifecycleEvent::Deleted(entity) => {
                let mut attributes = self.write();
                let before = attributes.len();
                attributes.retain(|key, _| key.entity_id != entity.id);
                debug!(entity_id = %entity.id, removed = before - attributes.len(), "entity deleted");
            }
        }
    }

    /// Attributes that lost monitoring are dropped; new or reconfigured ones
    /// get a fresh evaluator; unchanged ones keep their state. Without a
    /// previous snapshot already-watched attributes are left as they are and
    /// only newly monitored ones are added.
    fn apply_update(&self, entity_id: &str, previous: Option<&[AttributeMeta]>, current: &[AttributeMeta]) {
        let monitored: HashMap<AttributeKey, Vec<StrategyConfig>> =
            monitored_attributes(entity_id, current).into_iter().collect();

        let has_snapshot = previous.is_some();
        match previous {
            Some(previous) => {
                for attr in previous.iter().filter(|a| a.has_monitoring()) {
                    let key = AttributeKey::new(entity_id, attr.name.clone());
                    if !monitored.contains_key(&key) {
                        self.unwatch(&key);
                    }
                }
            }
            None => debug!(%entity_id, "update without previous snapshot; skipping removals"),
        }

        for (key, configs) in monitored {
            let keep = match self.get(&key) {
                Some(existing) => !has_snapshot || existing.configs() == configs.as_slice(),
                None => false,
            };
            if !keep {
                self.watch(key, configs);
            }
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<AttributeKey, Arc<WatchedAttribute>>> {
        self.attributes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<AttributeKey, Arc<WatchedAttribute>>> {
        self.attributes.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::StaticWatchSource;
    use serde_json::json;

    fn monitored(name: &str, deviation: f64) -> AttributeMeta {
        AttributeMeta {
            name: name.to_string(),
            store_datapoints: true,
            anomaly_detection: Some(json!([
                {"kind": "range", "deviation_percent": deviation, "timespan": "1h", "minimum_points": 3}
            ])),
        }
    }

    fn plain(name: &str) -> AttributeMeta {
        AttributeMeta {
            name: name.to_string(),
            store_datapoints: true,
            anomaly_detection: None,
        }
    }

    fn entity(id: &str, attributes: Vec<AttributeMeta>) -> Entity {
        Entity {
            id: id.to_string(),
            name: id.to_string(),
            attributes,
        }
    }

    #[test]
    fn test_load_from_source() {
        let mut unstored = monitored("humidity", 10.0);
        unstored.store_datapoints = false;
        let mut broken = monitored("pressure", 10.0);
        broken.anomaly_detection = Some(json!([{"kind": "range"}]));

        let source = StaticWatchSource::new(vec![
            entity("a", vec![monitored("temp", 10.0), plain("name"), unstored, broken]),
            entity("b", vec![monitored("temp", 5.0)]),
        ]);
        let registry = WatchRegistry::new();
        assert_eq!(registry.load(&source).unwrap(), 2);
        assert_eq!(
            registry.keys(),
            vec![AttributeKey::new("a", "temp"), AttributeKey::new("b", "temp")]
        );
    }

    #[test]
    fn test_created_and_deleted() {
        let registry = WatchRegistry::new();
        let e = entity("a", vec![monitored("temp", 10.0), monitored("flow", 10.0)]);
        registry.apply(&LifecycleEvent::Created(e.clone()));
        registry.apply(&LifecycleEvent::Created(entity("b", vec![monitored("temp", 10.0)])));
        assert_eq!(registry.len(), 3);

        registry.apply(&LifecycleEvent::Deleted(e));
        assert_eq!(registry.keys(), vec![AttributeKey::new("b", "temp")]);
    }

    #[test]
    fn test_update_diffs_previous_and_current() {
        let registry = WatchRegistry::new();
        registry.apply(&LifecycleEvent::Created(entity(
            "a",
            vec![monitored("temp", 10.0), monitored("flow", 10.0)],
        )));
        let temp_before = registry.get(&AttributeKey::new("a", "temp")).unwrap();

        registry.apply(&LifecycleEvent::Updated {
            entity_id: "a".to_string(),
            previous: Some(vec![monitored("temp", 10.0), monitored("flow", 10.0), plain("level")]),
            current: vec![monitored("temp", 10.0), plain("flow"), monitored("level", 20.0)],
        });

        assert_eq!(
            registry.keys(),
            vec![AttributeKey::new("a", "level"), AttributeKey::new("a", "temp")]
        );
        // Unchanged configuration keeps the same evaluator.
        let temp_after = registry.get(&AttributeKey::new("a", "temp")).unwrap();
        assert!(Arc::ptr_eq(&temp_before, &temp_after));
    }

    #[test]
    fn test_update_reconfigures_attribute() {
        let registry = WatchRegistry::new();
        registry.apply(&LifecycleEvent::Created(entity("a", vec![monitored("temp", 10.0)])));
        let before = registry.get(&AttributeKey::new("a", "temp")).unwrap();

        registry.apply(&LifecycleEvent::Updated {
            entity_id: "a".to_string(),
            previous: Some(vec![monitored("temp", 10.0)]),
            current: vec![monitored("temp", 25.0)],
        });
        let after = registry.get(&AttributeKey::new("a", "temp")).unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.configs()[0].deviation_percent, 25.0);
    }

    #[test]
    fn test_update_without_previous_only_adds() {
        let registry = WatchRegistry::new();
        registry.apply(&LifecycleEvent::Created(entity("a", vec![monitored("temp", 10.0)])));

        registry.apply(&LifecycleEvent::Updated {
            entity_id: "a".to_string(),
            previous: None,
            current: vec![monitored("temp", 30.0), monitored("flow", 10.0)],
        });
        assert_eq!(
            registry.keys(),
            vec![AttributeKey::new("a", "flow"), AttributeKey::new("a", "temp")]
        );
        // No snapshot to diff against: the watched attribute is left alone.
        let temp = registry.get(&AttributeKey::new("a", "temp")).unwrap();
        assert_eq!(temp.configs()[0].deviation_percent, 10.0);
    }

    #[test]
    fn test_malformed_update_unwatches() {
        let registry = WatchRegistry::new();
        registry.apply(&LifecycleEvent::Created(entity("a", vec![monitored("temp", 10.0)])));
        let mut broken = monitored("temp", 10.0);
        broken.anomaly_detection = Some(json!({"methods": "nope"}));

        registry.apply(&LifecycleEvent::Updated {
            entity_id: "a".to_string(),
            previous: Some(vec![monitored("temp", 10.0)]),
            current: vec![broken],
        });
        assert!(registry.is_empty());
    }
}
