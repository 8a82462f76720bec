//! The per-environment stream set.
//!
//! Owns one broadcast hub per (audience, credential) combination meaningful
//! for the environment, dispatches data updates to all of them, and runs the
//! heartbeat ticker. Hubs are only ever reached through this owner — the
//! hub map is the single registry, so there are no mutual owning pointers
//! between hubs and the set.
//!
//! One mutex protects the hub map. Publish paths take a snapshot under the
//! lock and publish after releasing it, so a slow hub never blocks map
//! maintenance.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use flag_relay_core::config::StreamConfig;
use flag_relay_core::credential::{Credential, ScopedCredential};
use flag_relay_core::environment::FilterKey;
use flag_relay_core::store::{DataKind, FeatureStore, ItemDescriptor};

use crate::audience::Audience;
use crate::broadcast::{BroadcasterOptions, StreamBroadcaster};
use crate::handlers::StreamHandler;
use crate::replay::{AllDataReplay, FlagsOnlyReplay, PingReplay, ReplayRepository};

type StreamKey = (Audience, Credential);

/// Subscriber counts per hub, for observability endpoints.
#[derive(Debug, Clone)]
pub struct StreamSetStats {
    pub streams: Vec<StreamStat>,
}

#[derive(Debug, Clone)]
pub struct StreamStat {
    pub audience: Audience,
    pub credential: String,
    pub subscribers: usize,
}

/// All SSE fan-out state for one logical environment.
pub struct EnvironmentStreams {
    filter: FilterKey,
    store: Arc<dyn FeatureStore>,
    config: StreamConfig,
    hubs: Mutex<HashMap<StreamKey, Arc<StreamBroadcaster>>>,
    heartbeat_stop: watch::Sender<bool>,
    heartbeat_task: AsyncMutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl EnvironmentStreams {
    pub fn new(
        filter: FilterKey,
        store: Arc<dyn FeatureStore>,
        config: StreamConfig,
    ) -> Arc<Self> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let set = Arc::new(Self {
            filter,
            store,
            config,
            hubs: Mutex::new(HashMap::new()),
            heartbeat_stop: stop_tx,
            heartbeat_task: AsyncMutex::new(None),
            closed: AtomicBool::new(false),
        });

        let task = tokio::spawn(Self::heartbeat_loop(Arc::downgrade(&set), stop_rx));
        // The task slot is only contended by close(), which cannot run
        // before new() returns.
        *set.heartbeat_task
            .try_lock()
            .expect("heartbeat slot free at construction") = Some(task);
        set
    }

    async fn heartbeat_loop(set: Weak<EnvironmentStreams>, mut stop: watch::Receiver<bool>) {
        let interval = match set.upgrade() {
            Some(set) => set.config.heartbeat_interval,
            None => return,
        };
        let mut ticker = tokio::time::interval(interval);
        // The immediate first tick would race new connections' replays.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(set) = set.upgrade() else { break };
                    for (_, hub) in set.hub_snapshot() {
                        hub.publish_comment("");
                    }
                }
                _ = stop.changed() => break,
            }
        }
    }

    fn hub_snapshot(&self) -> Vec<(Audience, Arc<StreamBroadcaster>)> {
        let hubs = self.hubs.lock().expect("hub map lock poisoned");
        hubs.iter()
            .map(|((audience, _), hub)| (*audience, Arc::clone(hub)))
            .collect()
    }

    fn repository_for(&self, audience: Audience) -> Arc<dyn ReplayRepository> {
        match audience {
            Audience::ServerSideAll => Arc::new(AllDataReplay::new(Arc::clone(&self.store))),
            Audience::ServerSideFlagsOnly => {
                Arc::new(FlagsOnlyReplay::new(Arc::clone(&self.store)))
            }
            Audience::MobilePing | Audience::JsClientPing => {
                Arc::new(PingReplay::new(Arc::clone(&self.store)))
            }
        }
    }

    /// Create a hub entry for every audience whose credential kind matches.
    /// Idempotent.
    pub fn add_credential(&self, credential: &Credential) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut hubs = self.hubs.lock().expect("hub map lock poisoned");
        for audience in Audience::ALL {
            if !audience.accepts_credential(credential.kind()) {
                continue;
            }
            let key = (audience, credential.clone());
            if hubs.contains_key(&key) {
                continue;
            }
            let hub = StreamBroadcaster::new(
                audience,
                BroadcasterOptions {
                    allow_cors: audience.allow_cors(),
                    replay_all: true,
                    max_conn_time: self.config.max_conn_time,
                    queue_depth: self.config.subscriber_queue_depth,
                },
            );
            hub.register(
                ScopedCredential::new(credential.clone(), self.filter.clone()),
                self.repository_for(audience),
            );
            hubs.insert(key, hub);
            debug!(credential = %credential, ?audience, "stream hub added");
        }
    }

    /// Close and drop every hub entry keyed by the credential.
    pub fn remove_credential(&self, credential: &Credential) {
        let removed: Vec<Arc<StreamBroadcaster>> = {
            let mut hubs = self.hubs.lock().expect("hub map lock poisoned");
            let keys: Vec<StreamKey> = hubs
                .keys()
                .filter(|(_, cred)| cred == credential)
                .cloned()
                .collect();
            keys.into_iter().filter_map(|key| hubs.remove(&key)).collect()
        };
        for hub in removed {
            hub.close();
        }
        info!(credential = %credential, "stream hubs removed");
    }

    /// Substitute a rotated credential into every hub entry of the same
    /// kind, without disturbing connected subscribers.
    pub fn replace_credential(&self, new: &Credential) {
        let mut hubs = self.hubs.lock().expect("hub map lock poisoned");
        let old_keys: Vec<StreamKey> = hubs
            .keys()
            .filter(|(_, cred)| cred.kind() == new.kind() && cred != new)
            .cloned()
            .collect();
        for (audience, old) in old_keys {
            if let Some(hub) = hubs.remove(&(audience, old.clone())) {
                hub.rekey(
                    &ScopedCredential::new(old.clone(), self.filter.clone()),
                    ScopedCredential::new(new.clone(), self.filter.clone()),
                );
                hubs.insert((audience, new.clone()), hub);
                info!(old = %old, new = %new, ?audience, "stream credential rotated");
            }
        }
    }

    /// Publish the audience-appropriate full `put` (or ping) to every hub.
    pub fn send_all_data_update(
        &self,
        collections: &[(DataKind, Vec<(String, ItemDescriptor)>)],
    ) {
        let snapshot = self.hub_snapshot();
        let mut per_audience = HashMap::new();
        for (audience, hub) in snapshot {
            let event = per_audience
                .entry(audience)
                .or_insert_with(|| audience.initial_event(collections.to_vec()));
            hub.publish(Arc::clone(event));
        }
    }

    /// Publish a patch/delete (server-side) or ping (client-side) for one
    /// changed item.
    pub fn send_single_item_update(&self, kind: DataKind, key: &str, descriptor: &ItemDescriptor) {
        let snapshot = self.hub_snapshot();
        let mut per_audience: HashMap<Audience, _> = HashMap::new();
        for (audience, hub) in snapshot {
            let event = per_audience
                .entry(audience)
                .or_insert_with(|| audience.update_event(kind, key, descriptor));
            if let Some(event) = event {
                hub.publish(Arc::clone(event));
            }
        }
    }

    /// Publish `ping` to client-side audiences only, for changes outside the
    /// core data set that still affect evaluation results.
    pub fn invalidate_client_side_state(&self) {
        for (audience, hub) in self.hub_snapshot() {
            if let Some(event) = audience.invalidate_event() {
                hub.publish(event);
            }
        }
    }

    /// The hub serving an audience for a credential, if one exists.
    pub fn hub_for(&self, audience: Audience, credential: &Credential) -> Option<Arc<StreamBroadcaster>> {
        let hubs = self.hubs.lock().expect("hub map lock poisoned");
        hubs.get(&(audience, credential.clone())).cloned()
    }

    /// An HTTP handler for the audience iff the credential matches a hub and
    /// the audience accepts its kind.
    pub fn handler(&self, audience: Audience, credential: &Credential) -> Option<StreamHandler> {
        let hub = self.hub_for(audience, credential)?;
        hub.handler(
            credential,
            ScopedCredential::new(credential.clone(), self.filter.clone()),
        )
    }

    pub fn stats(&self) -> StreamSetStats {
        let hubs = self.hubs.lock().expect("hub map lock poisoned");
        StreamSetStats {
            streams: hubs
                .iter()
                .map(|((audience, credential), hub)| StreamStat {
                    audience: *audience,
                    credential: credential.masked(),
                    subscribers: hub.subscriber_count(),
                })
                .collect(),
        }
    }

    /// Terminate the heartbeat task and close all hubs. Idempotent; waits
    /// for the ticker to drain.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.heartbeat_stop.send(true);
        if let Some(task) = self.heartbeat_task.lock().await.take() {
            let _ = task.await;
        }
        let hubs: Vec<Arc<StreamBroadcaster>> = {
            let mut map = self.hubs.lock().expect("hub map lock poisoned");
            map.drain().map(|(_, hub)| hub).collect()
        };
        for hub in hubs {
            hub.close();
        }
        info!("environment stream set closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::SseFrame;
    use flag_relay_core::store::MemoryFeatureStore;
    use serde_json::json;
    use std::time::Duration;

    async fn initialized_store() -> Arc<MemoryFeatureStore> {
        let store = Arc::new(MemoryFeatureStore::new());
        store
            .init(vec![(
                DataKind::Flag,
                vec![("f1".into(), ItemDescriptor::new(1, json!({"key": "f1"})))],
            )])
            .await;
        store
    }

    fn test_config() -> StreamConfig {
        StreamConfig {
            heartbeat_interval: Duration::from_secs(3600),
            ..Default::default()
        }
    }

    async fn drain_replay(rx: &mut tokio::sync::mpsc::Receiver<SseFrame>) {
        let frame = rx.recv().await.unwrap();
        assert!(matches!(frame, SseFrame::Event(_)));
    }

    #[tokio::test]
    async fn add_credential_creates_hubs_per_matching_audience() {
        let set =
            EnvironmentStreams::new(FilterKey::default(), initialized_store().await, test_config());
        let sdk = Credential::SdkKey("sdk-1".into());
        let mobile = Credential::MobileKey("mob-1".into());

        set.add_credential(&sdk);
        set.add_credential(&sdk); // idempotent
        set.add_credential(&mobile);

        assert!(set.hub_for(Audience::ServerSideAll, &sdk).is_some());
        assert!(set.hub_for(Audience::ServerSideFlagsOnly, &sdk).is_some());
        assert!(set.hub_for(Audience::MobilePing, &mobile).is_some());
        assert!(set.hub_for(Audience::MobilePing, &sdk).is_none());
        assert_eq!(set.stats().streams.len(), 3);

        set.close().await;
    }

    #[tokio::test]
    async fn single_item_updates_reach_each_audience_in_its_format() {
        let store = initialized_store().await;
        let set = EnvironmentStreams::new(FilterKey::default(), store, test_config());
        let sdk = Credential::SdkKey("sdk-1".into());
        let mobile = Credential::MobileKey("mob-1".into());
        set.add_credential(&sdk);
        set.add_credential(&mobile);

        let all_hub = set.hub_for(Audience::ServerSideAll, &sdk).unwrap();
        let flags_hub = set.hub_for(Audience::ServerSideFlagsOnly, &sdk).unwrap();
        let ping_hub = set.hub_for(Audience::MobilePing, &mobile).unwrap();

        let sdk_scope = ScopedCredential::unfiltered(sdk.clone());
        let mobile_scope = ScopedCredential::unfiltered(mobile.clone());
        let mut all_rx = all_hub.subscribe(&sdk_scope).await.unwrap();
        let mut flags_rx = flags_hub.subscribe(&sdk_scope).await.unwrap();
        let mut ping_rx = ping_hub.subscribe(&mobile_scope).await.unwrap();
        drain_replay(&mut all_rx).await;
        drain_replay(&mut flags_rx).await;
        drain_replay(&mut ping_rx).await;

        // A segment update: /all gets a patch, /flags skips it, clients ping.
        set.send_single_item_update(
            DataKind::Segment,
            "s1",
            &ItemDescriptor::new(2, json!({"key": "s1"})),
        );

        match all_rx.recv().await.unwrap() {
            SseFrame::Event(event) => {
                assert_eq!(event.name(), "patch");
                let body: serde_json::Value = serde_json::from_slice(event.data()).unwrap();
                assert_eq!(body["path"], "/segments/s1");
            }
            SseFrame::Comment(_) => panic!("expected event"),
        }
        match ping_rx.recv().await.unwrap() {
            SseFrame::Event(event) => assert_eq!(event.name(), "ping"),
            SseFrame::Comment(_) => panic!("expected event"),
        }

        // A flag tombstone: /flags gets a legacy delete.
        set.send_single_item_update(DataKind::Flag, "f1", &ItemDescriptor::tombstone(9));
        match flags_rx.recv().await.unwrap() {
            SseFrame::Event(event) => {
                assert_eq!(event.name(), "delete");
                let body: serde_json::Value = serde_json::from_slice(event.data()).unwrap();
                assert_eq!(body["path"], "/f1");
                assert_eq!(body["version"], 9);
            }
            SseFrame::Comment(_) => panic!("expected event"),
        }

        set.close().await;
    }

    #[tokio::test]
    async fn invalidation_pings_client_audiences_only() {
        let set =
            EnvironmentStreams::new(FilterKey::default(), initialized_store().await, test_config());
        let sdk = Credential::SdkKey("sdk-1".into());
        let mobile = Credential::MobileKey("mob-1".into());
        set.add_credential(&sdk);
        set.add_credential(&mobile);

        let all_hub = set.hub_for(Audience::ServerSideAll, &sdk).unwrap();
        let ping_hub = set.hub_for(Audience::MobilePing, &mobile).unwrap();
        let mut all_rx = all_hub
            .subscribe(&ScopedCredential::unfiltered(sdk.clone()))
            .await
            .unwrap();
        let mut ping_rx = ping_hub
            .subscribe(&ScopedCredential::unfiltered(mobile.clone()))
            .await
            .unwrap();
        drain_replay(&mut all_rx).await;
        drain_replay(&mut ping_rx).await;

        set.invalidate_client_side_state();

        match ping_rx.recv().await.unwrap() {
            SseFrame::Event(event) => assert_eq!(event.name(), "ping"),
            SseFrame::Comment(_) => panic!("expected event"),
        }
        // Server-side stream saw nothing.
        assert!(tokio::time::timeout(Duration::from_millis(20), all_rx.recv())
            .await
            .is_err());

        set.close().await;
    }

    #[tokio::test]
    async fn heartbeats_emit_comments_on_every_hub() {
        let store = initialized_store().await;
        let config = StreamConfig {
            heartbeat_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let set = EnvironmentStreams::new(FilterKey::default(), store, config);
        let sdk = Credential::SdkKey("sdk-1".into());
        set.add_credential(&sdk);

        let hub = set.hub_for(Audience::ServerSideAll, &sdk).unwrap();
        let mut rx = hub
            .subscribe(&ScopedCredential::unfiltered(sdk.clone()))
            .await
            .unwrap();
        drain_replay(&mut rx).await;

        tokio::time::sleep(Duration::from_millis(80)).await;
        let mut comments = 0;
        while let Ok(Some(frame)) =
            tokio::time::timeout(Duration::from_millis(10), rx.recv()).await
        {
            if let SseFrame::Comment(_) = frame {
                comments += 1;
            }
        }
        assert!(comments >= 2, "expected at least two heartbeats, got {}", comments);

        set.close().await;
    }

    #[tokio::test]
    async fn credential_rotation_keeps_subscribers() {
        let set =
            EnvironmentStreams::new(FilterKey::default(), initialized_store().await, test_config());
        let old = Credential::SdkKey("sdk-old".into());
        let new = Credential::SdkKey("sdk-new".into());
        set.add_credential(&old);

        let hub = set.hub_for(Audience::ServerSideAll, &old).unwrap();
        let mut rx = hub
            .subscribe(&ScopedCredential::unfiltered(old.clone()))
            .await
            .unwrap();
        drain_replay(&mut rx).await;

        set.replace_credential(&new);
        assert!(set.hub_for(Audience::ServerSideAll, &old).is_none());
        assert!(set.hub_for(Audience::ServerSideAll, &new).is_some());

        // The existing subscriber still receives updates.
        set.send_single_item_update(DataKind::Flag, "f1", &ItemDescriptor::new(2, json!({})));
        assert!(matches!(rx.recv().await.unwrap(), SseFrame::Event(_)));

        set.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_closes_hubs() {
        let set =
            EnvironmentStreams::new(FilterKey::default(), initialized_store().await, test_config());
        let sdk = Credential::SdkKey("sdk-1".into());
        set.add_credential(&sdk);
        let hub = set.hub_for(Audience::ServerSideAll, &sdk).unwrap();

        set.close().await;
        set.close().await;
        assert!(hub.is_closed());
        assert!(set.hub_for(Audience::ServerSideAll, &sdk).is_none());
    }
}
