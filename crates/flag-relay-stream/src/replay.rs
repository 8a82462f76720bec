//! Replay repositories: initial-event synthesis for new subscriptions.
//!
//! When a subscriber connects, its hub asks the repository for the initial
//! events. An uninitialized store yields [`RelayError::StoreNotInitialized`]
//! — the SDK stays in "waiting for initial data" until the upstream put
//! propagates. A store read error aborts the replay. Either way the hub logs
//! the failure, sends no initial event, and keeps the subscriber connected
//! for later updates.
//!
//! The flags-only repository coalesces concurrent replays through a shared
//! future keyed by a single in-flight slot: a burst of reconnecting SDKs
//! costs one store scan and one encoded event.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;

use flag_relay_core::error::{RelayError, Result};
use flag_relay_core::store::{DataKind, FeatureStore, ItemDescriptor};

use crate::event::StreamEvent;

/// Synthesizes the audience-appropriate initial events from the store.
#[async_trait]
pub trait ReplayRepository: Send + Sync {
    /// The events a fresh subscription must receive before live updates.
    async fn replay(&self) -> Result<Vec<Arc<StreamEvent>>>;
}

fn drop_tombstones(items: Vec<(String, ItemDescriptor)>) -> Vec<(String, ItemDescriptor)> {
    items.into_iter().filter(|(_, d)| !d.is_tombstone()).collect()
}

/// Full-data replay for the server-side `/all` audience.
pub struct AllDataReplay {
    store: Arc<dyn FeatureStore>,
}

impl AllDataReplay {
    pub fn new(store: Arc<dyn FeatureStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ReplayRepository for AllDataReplay {
    async fn replay(&self) -> Result<Vec<Arc<StreamEvent>>> {
        if !self.store.is_initialized().await {
            return Err(RelayError::StoreNotInitialized);
        }
        let mut collections = Vec::with_capacity(DataKind::ALL.len());
        for kind in DataKind::ALL {
            let items = self.store.get_all(kind).await?;
            collections.push((kind, drop_tombstones(items)));
        }
        Ok(vec![Arc::new(StreamEvent::server_side_put(collections))])
    }
}

// The shared computation's error side must be Clone for every waiter.
type SharedOutcome = std::result::Result<Arc<StreamEvent>, Arc<RelayError>>;
type SharedReplay = Shared<BoxFuture<'static, SharedOutcome>>;

/// Flags-only replay for the legacy server-side `/flags` audience, with
/// single-flight coalescing of the store scan.
pub struct FlagsOnlyReplay {
    store: Arc<dyn FeatureStore>,
    inflight: Mutex<Option<SharedReplay>>,
}

impl FlagsOnlyReplay {
    pub fn new(store: Arc<dyn FeatureStore>) -> Self {
        Self {
            store,
            inflight: Mutex::new(None),
        }
    }

    async fn compute(store: Arc<dyn FeatureStore>) -> SharedOutcome {
        if !store.is_initialized().await {
            return Err(Arc::new(RelayError::StoreNotInitialized));
        }
        match store.get_all(DataKind::Flag).await {
            Ok(flags) => Ok(Arc::new(StreamEvent::flags_only_put(drop_tombstones(flags)))),
            Err(err) => Err(Arc::new(err)),
        }
    }
}

#[async_trait]
impl ReplayRepository for FlagsOnlyReplay {
    async fn replay(&self) -> Result<Vec<Arc<StreamEvent>>> {
        let (shared, creator) = {
            let mut slot = self.inflight.lock().await;
            match slot.as_ref() {
                Some(existing) => (existing.clone(), false),
                None => {
                    let store = Arc::clone(&self.store);
                    let shared: SharedReplay = Self::compute(store).boxed().shared();
                    *slot = Some(shared.clone());
                    (shared, true)
                }
            }
        };

        let result = shared.await;
        if creator {
            // Only the creator clears the slot; late arrivals that cloned
            // the completed future still resolve to the shared result.
            self.inflight.lock().await.take();
        }
        match result {
            Ok(event) => Ok(vec![event]),
            // The shared error is reconstructed for this waiter.
            Err(err) => Err(match &*err {
                RelayError::StoreNotInitialized => RelayError::StoreNotInitialized,
                other => RelayError::store_read(other),
            }),
        }
    }
}

/// Ping replay for the client-side audiences: one ping once the store holds
/// data.
pub struct PingReplay {
    store: Arc<dyn FeatureStore>,
}

impl PingReplay {
    pub fn new(store: Arc<dyn FeatureStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ReplayRepository for PingReplay {
    async fn replay(&self) -> Result<Vec<Arc<StreamEvent>>> {
        if !self.store.is_initialized().await {
            return Err(RelayError::StoreNotInitialized);
        }
        Ok(vec![Arc::new(StreamEvent::ping())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flag_relay_core::store::MemoryFeatureStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn seeded_store() -> Arc<MemoryFeatureStore> {
        let store = Arc::new(MemoryFeatureStore::new());
        store
            .init(vec![
                (
                    DataKind::Flag,
                    vec![
                        ("f1".into(), ItemDescriptor::new(1, json!({"key": "f1"}))),
                        ("dead".into(), ItemDescriptor::tombstone(3)),
                    ],
                ),
                (
                    DataKind::Segment,
                    vec![("s1".into(), ItemDescriptor::new(1, json!({"key": "s1"})))],
                ),
            ])
            .await;
        store
    }

    #[tokio::test]
    async fn all_data_replay_builds_put_without_tombstones() {
        let replay = AllDataReplay::new(seeded_store().await).replay().await.unwrap();
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].name(), "put");

        let body: serde_json::Value = serde_json::from_slice(replay[0].data()).unwrap();
        assert!(body["data"]["flags"]["f1"].is_object());
        assert!(body["data"]["flags"].get("dead").is_none());
        assert!(body["data"]["segments"]["s1"].is_object());
    }

    #[tokio::test]
    async fn uninitialized_store_is_reported() {
        let store = Arc::new(MemoryFeatureStore::new());
        assert!(matches!(
            AllDataReplay::new(store.clone()).replay().await,
            Err(RelayError::StoreNotInitialized)
        ));
        assert!(matches!(
            FlagsOnlyReplay::new(store.clone()).replay().await,
            Err(RelayError::StoreNotInitialized)
        ));
        assert!(matches!(
            PingReplay::new(store).replay().await,
            Err(RelayError::StoreNotInitialized)
        ));
    }

    #[tokio::test]
    async fn ping_replay_emits_one_ping_when_initialized() {
        let replay = PingReplay::new(seeded_store().await).replay().await.unwrap();
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].name(), "ping");
    }

    /// Store double that counts scans and holds each one long enough for
    /// concurrent replays to pile up.
    struct SlowCountingStore {
        inner: Arc<MemoryFeatureStore>,
        scans: AtomicUsize,
    }

    #[async_trait]
    impl FeatureStore for SlowCountingStore {
        async fn is_initialized(&self) -> bool {
            self.inner.is_initialized().await
        }

        async fn get_all(&self, kind: DataKind) -> Result<Vec<(String, ItemDescriptor)>> {
            self.scans.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.inner.get_all(kind).await
        }

        async fn get(&self, kind: DataKind, key: &str) -> Result<Option<ItemDescriptor>> {
            self.inner.get(kind, key).await
        }
    }

    #[tokio::test]
    async fn concurrent_flags_replays_share_one_scan() {
        let store = Arc::new(SlowCountingStore {
            inner: seeded_store().await,
            scans: AtomicUsize::new(0),
        });
        let replay = Arc::new(FlagsOnlyReplay::new(store.clone()));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let replay = Arc::clone(&replay);
            tasks.push(tokio::spawn(async move { replay.replay().await }));
        }

        let mut bodies = Vec::new();
        for task in tasks {
            let events = task.await.unwrap().unwrap();
            assert_eq!(events.len(), 1);
            bodies.push(events[0].data().clone());
        }

        assert_eq!(store.scans.load(Ordering::SeqCst), 1);
        // Every waiter received identical event bytes.
        assert!(bodies.windows(2).all(|pair| pair[0] == pair[1]));
    }

    #[tokio::test]
    async fn flags_replay_recomputes_after_completion() {
        let store = Arc::new(SlowCountingStore {
            inner: seeded_store().await,
            scans: AtomicUsize::new(0),
        });
        let replay = FlagsOnlyReplay::new(store.clone());

        assert_eq!(replay.replay().await.unwrap().len(), 1);
        assert_eq!(replay.replay().await.unwrap().len(), 1);
        assert_eq!(store.scans.load(Ordering::SeqCst), 2);
    }

    /// Store double whose reads always fail.
    struct FailingStore;

    #[async_trait]
    impl FeatureStore for FailingStore {
        async fn is_initialized(&self) -> bool {
            true
        }

        async fn get_all(&self, _kind: DataKind) -> Result<Vec<(String, ItemDescriptor)>> {
            Err(RelayError::store_read("boom"))
        }

        async fn get(&self, _kind: DataKind, _key: &str) -> Result<Option<ItemDescriptor>> {
            Err(RelayError::store_read("boom"))
        }
    }

    #[tokio::test]
    async fn read_errors_abort_replay() {
        let store = Arc::new(FailingStore);
        assert!(matches!(
            AllDataReplay::new(store.clone()).replay().await,
            Err(RelayError::StoreRead { .. })
        ));
        assert!(matches!(
            FlagsOnlyReplay::new(store).replay().await,
            Err(RelayError::StoreRead { .. })
        ));
    }
}
