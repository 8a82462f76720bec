//! The read surface of the feature data store.
//!
//! The relay core never writes flag data; replication from upstream is a
//! separate collaborator. Everything here is versioned and opaque: items are
//! JSON values the core forwards without evaluating. A descriptor with no
//! payload is a tombstone — "deleted at version V" — which must propagate to
//! subscribers but is omitted from initial replay snapshots.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::Result;

/// The kinds of versioned data the relay replicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataKind {
    Flag,
    Segment,
    ConfigOverride,
    Metric,
}

impl DataKind {
    /// All kinds, in the order they appear in full-data `put` events.
    pub const ALL: [DataKind; 4] = [
        DataKind::Flag,
        DataKind::Segment,
        DataKind::ConfigOverride,
        DataKind::Metric,
    ];

    /// The current-schema API name, used in stream event paths and the
    /// top-level members of full-data puts.
    pub fn api_name(self) -> &'static str {
        match self {
            DataKind::Flag => "flags",
            DataKind::Segment => "segments",
            DataKind::ConfigOverride => "configurationOverrides",
            DataKind::Metric => "metrics",
        }
    }
}

/// A versioned data item, or a tombstone when `item` is absent.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemDescriptor {
    pub version: u64,
    pub item: Option<Value>,
}

impl ItemDescriptor {
    pub fn new(version: u64, item: Value) -> Self {
        Self {
            version,
            item: Some(item),
        }
    }

    pub fn tombstone(version: u64) -> Self {
        Self {
            version,
            item: None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.item.is_none()
    }
}

/// Read-only feature store interface required by the relay core.
#[async_trait]
pub trait FeatureStore: Send + Sync {
    /// Whether the store has received its initial data set.
    async fn is_initialized(&self) -> bool;

    /// All items of one kind, tombstones included.
    async fn get_all(&self, kind: DataKind) -> Result<Vec<(String, ItemDescriptor)>>;

    /// One item by key, or `None` if the key was never seen.
    async fn get(&self, kind: DataKind, key: &str) -> Result<Option<ItemDescriptor>>;
}

/// In-memory feature store.
///
/// Used by tests and as the default store when no external store is
/// configured. The write surface (`init`, `upsert`) is what the upstream
/// replication collaborator drives; the relay core itself only reads.
#[derive(Default)]
pub struct MemoryFeatureStore {
    initialized: AtomicBool,
    data: RwLock<HashMap<DataKind, BTreeMap<String, ItemDescriptor>>>,
}

impl MemoryFeatureStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the entire data set and mark the store initialized.
    pub async fn init(&self, collections: Vec<(DataKind, Vec<(String, ItemDescriptor)>)>) {
        let mut data = self.data.write().await;
        data.clear();
        for (kind, items) in collections {
            data.insert(kind, items.into_iter().collect());
        }
        self.initialized.store(true, Ordering::SeqCst);
    }

    /// Insert or replace one item. Lower-versioned writes are ignored.
    pub async fn upsert(&self, kind: DataKind, key: &str, descriptor: ItemDescriptor) -> bool {
        let mut data = self.data.write().await;
        let collection = data.entry(kind).or_default();
        match collection.get(key) {
            Some(existing) if existing.version >= descriptor.version => false,
            _ => {
                collection.insert(key.to_string(), descriptor);
                true
            }
        }
    }
}

#[async_trait]
impl FeatureStore for MemoryFeatureStore {
    async fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    async fn get_all(&self, kind: DataKind) -> Result<Vec<(String, ItemDescriptor)>> {
        let data = self.data.read().await;
        Ok(data
            .get(&kind)
            .map(|collection| {
                collection
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get(&self, kind: DataKind, key: &str) -> Result<Option<ItemDescriptor>> {
        let data = self.data.read().await;
        Ok(data.get(&kind).and_then(|collection| collection.get(key)).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn starts_uninitialized() {
        let store = MemoryFeatureStore::new();
        assert!(!store.is_initialized().await);
        assert!(store.get_all(DataKind::Flag).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn init_replaces_data_and_initializes() {
        let store = MemoryFeatureStore::new();
        store
            .init(vec![(
                DataKind::Flag,
                vec![("flag1".into(), ItemDescriptor::new(1, json!({"key": "flag1"})))],
            )])
            .await;

        assert!(store.is_initialized().await);
        let flags = store.get_all(DataKind::Flag).await.unwrap();
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].0, "flag1");
    }

    #[tokio::test]
    async fn upsert_respects_versions() {
        let store = MemoryFeatureStore::new();
        assert!(store
            .upsert(DataKind::Flag, "f", ItemDescriptor::new(2, json!({})))
            .await);
        assert!(!store
            .upsert(DataKind::Flag, "f", ItemDescriptor::new(1, json!({"stale": true})))
            .await);
        assert!(store
            .upsert(DataKind::Flag, "f", ItemDescriptor::tombstone(3))
            .await);

        let item = store.get(DataKind::Flag, "f").await.unwrap().unwrap();
        assert!(item.is_tombstone());
        assert_eq!(item.version, 3);
    }

    #[tokio::test]
    async fn get_unknown_key_is_none() {
        let store = MemoryFeatureStore::new();
        assert!(store.get(DataKind::Segment, "nope").await.unwrap().is_none());
    }
}
