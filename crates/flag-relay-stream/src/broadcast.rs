//! The SSE broadcast hub.
//!
//! One [`StreamBroadcaster`] exists per (audience, credential) pair inside an
//! environment stream set. It owns the subscriber registry and the replay
//! repositories keyed by scoped credential, fans published events out to
//! every subscriber, and emits heartbeat comments.
//!
//! Slow consumers must not block fast ones: each subscriber is fed through a
//! bounded queue, and a subscriber whose queue overflows is dropped so it
//! reconnects with a fresh replay.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use flag_relay_core::credential::{Credential, ScopedCredential};
use flag_relay_core::error::{RelayError, Result};

use crate::audience::Audience;
use crate::event::StreamEvent;
use crate::handlers::StreamHandler;
use crate::replay::ReplayRepository;

/// Hub configuration, fixed at construction by the owning stream set.
#[derive(Debug, Clone)]
pub struct BroadcasterOptions {
    /// Send permissive CORS headers on the SSE response.
    pub allow_cors: bool,
    /// Send the repository's replay to every new connection regardless of
    /// any `Last-Event-ID` the client presents.
    pub replay_all: bool,
    /// Hard cap on a single connection's duration; the server closes the
    /// stream once exceeded so the client reconnects elsewhere.
    pub max_conn_time: Option<std::time::Duration>,
    /// Bound on each subscriber's outgoing queue.
    pub queue_depth: usize,
}

impl Default for BroadcasterOptions {
    fn default() -> Self {
        Self {
            allow_cors: false,
            replay_all: true,
            max_conn_time: None,
            queue_depth: 64,
        }
    }
}

/// One frame on an SSE connection: a named event or a comment line.
#[derive(Clone)]
pub enum SseFrame {
    Event(Arc<StreamEvent>),
    Comment(String),
}

impl SseFrame {
    /// The wire bytes for this frame. Event frames reuse the event's
    /// memoized encoding.
    pub fn encode(&self) -> Bytes {
        match self {
            SseFrame::Event(event) => event.frame(),
            SseFrame::Comment(text) => {
                let mut frame = Vec::with_capacity(text.len() + 3);
                frame.push(b':');
                frame.extend_from_slice(text.as_bytes());
                frame.extend_from_slice(b"\n\n");
                Bytes::from(frame)
            }
        }
    }
}

struct Subscriber {
    scoped: ScopedCredential,
    sender: mpsc::Sender<SseFrame>,
    connected_at: Instant,
}

/// An SSE broadcaster for one audience on one credential.
pub struct StreamBroadcaster {
    audience: Audience,
    options: BroadcasterOptions,
    subscribers: DashMap<Uuid, Subscriber>,
    repositories: RwLock<HashMap<ScopedCredential, Arc<dyn ReplayRepository>>>,
    closed: AtomicBool,
}

impl StreamBroadcaster {
    pub fn new(audience: Audience, options: BroadcasterOptions) -> Arc<Self> {
        Arc::new(Self {
            audience,
            options,
            subscribers: DashMap::new(),
            repositories: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn audience(&self) -> Audience {
        self.audience
    }

    pub fn options(&self) -> &BroadcasterOptions {
        &self.options
    }

    /// An HTTP handler for this stream iff the credential kind matches the
    /// audience. A mismatch returns `None` and the routing layer surfaces
    /// a 404.
    pub fn handler(
        self: &Arc<Self>,
        credential: &Credential,
        scoped: ScopedCredential,
    ) -> Option<StreamHandler> {
        if !self.audience.accepts_credential(credential.kind()) {
            return None;
        }
        Some(StreamHandler::new(Arc::clone(self), scoped))
    }

    /// Attach (or replace) the replay repository for a scoped credential.
    /// At most one repository exists per scoped credential.
    pub fn register(&self, scoped: ScopedCredential, repository: Arc<dyn ReplayRepository>) {
        let mut repos = self.repositories.write().expect("repository lock poisoned");
        repos.insert(scoped, repository);
    }

    /// Detach the repository for a scoped credential. With
    /// `force_disconnect`, also drop every subscriber attached under it.
    pub fn unregister(&self, scoped: &ScopedCredential, force_disconnect: bool) {
        {
            let mut repos = self.repositories.write().expect("repository lock poisoned");
            repos.remove(scoped);
        }
        if force_disconnect {
            let doomed: Vec<Uuid> = self
                .subscribers
                .iter()
                .filter(|entry| entry.value().scoped == *scoped)
                .map(|entry| *entry.key())
                .collect();
            for id in doomed {
                self.subscribers.remove(&id);
            }
        }
    }

    /// Move a repository (and its subscribers) to a rotated credential
    /// without disconnecting anyone.
    pub fn rekey(&self, old: &ScopedCredential, new: ScopedCredential) {
        let mut repos = self.repositories.write().expect("repository lock poisoned");
        if let Some(repo) = repos.remove(old) {
            repos.insert(new.clone(), repo);
        }
        drop(repos);
        for mut entry in self.subscribers.iter_mut() {
            if entry.value().scoped == *old {
                entry.value_mut().scoped = new.clone();
            }
        }
    }

    /// Open a subscription: replay the initial snapshot into a fresh bounded
    /// channel, then register the channel for live updates. A closed hub
    /// rejects the caller with [`RelayError::Shutdown`]; an unregistered
    /// scope is refused. A failed replay is logged and the subscriber stays
    /// connected with no initial event.
    pub async fn subscribe(&self, scoped: &ScopedCredential) -> Result<mpsc::Receiver<SseFrame>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RelayError::Shutdown);
        }
        let repository = {
            let repos = self.repositories.read().expect("repository lock poisoned");
            repos.get(scoped).cloned()
        }
        .ok_or_else(|| {
            RelayError::precondition(format!("no replay repository for {}", scoped))
        })?;

        let replay = match repository.replay().await {
            Ok(events) => events,
            Err(err) => {
                warn!(credential = %scoped, %err, "replay failed, sending no initial event");
                Vec::new()
            }
        };
        let capacity = self.options.queue_depth.max(replay.len() + 1);
        let (sender, receiver) = mpsc::channel(capacity);
        for event in replay {
            // Capacity covers the whole replay; a failure here means the
            // hub closed mid-subscribe.
            if sender.try_send(SseFrame::Event(event)).is_err() {
                return Err(RelayError::Shutdown);
            }
        }

        let id = Uuid::new_v4();
        self.subscribers.insert(
            id,
            Subscriber {
                scoped: scoped.clone(),
                sender,
                connected_at: Instant::now(),
            },
        );
        debug!(
            audience = ?self.audience,
            credential = %scoped,
            subscribers = self.subscribers.len(),
            "stream subscriber connected"
        );
        Ok(receiver)
    }

    /// Broadcast an event to all current subscribers, dropping any whose
    /// queue has overflowed or whose connection is gone.
    pub fn publish(&self, event: Arc<StreamEvent>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.fan_out(SseFrame::Event(event));
    }

    /// Broadcast an SSE comment (heartbeat). Comments are not data events
    /// and are invisible to SDK event parsers.
    pub fn publish_comment(&self, text: &str) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.fan_out(SseFrame::Comment(text.to_string()));
    }

    fn fan_out(&self, frame: SseFrame) {
        let mut dropped = Vec::new();
        for entry in self.subscribers.iter() {
            match entry.value().sender.try_send(frame.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        audience = ?self.audience,
                        credential = %entry.value().scoped,
                        "subscriber queue overflow, dropping connection"
                    );
                    dropped.push(*entry.key());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dropped.push(*entry.key());
                }
            }
        }
        for id in dropped {
            self.subscribers.remove(&id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// How long the oldest current subscriber has been connected.
    pub fn oldest_connection_age(&self) -> Option<std::time::Duration> {
        self.subscribers
            .iter()
            .map(|entry| entry.value().connected_at.elapsed())
            .max()
    }

    /// Disconnect all subscribers and halt further delivery. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let count = self.subscribers.len();
        self.subscribers.clear();
        self.repositories
            .write()
            .expect("repository lock poisoned")
            .clear();
        info!(audience = ?self.audience, subscribers = count, "stream broadcaster closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::PingReplay;
    use flag_relay_core::credential::CredentialKind;
    use flag_relay_core::environment::FilterKey;
    use flag_relay_core::store::MemoryFeatureStore;

    fn scoped() -> ScopedCredential {
        ScopedCredential::unfiltered(Credential::MobileKey("mob-key".into()))
    }

    async fn hub_with_initialized_store() -> Arc<StreamBroadcaster> {
        let hub = StreamBroadcaster::new(Audience::MobilePing, BroadcasterOptions::default());
        let store = Arc::new(MemoryFeatureStore::new());
        store.init(vec![]).await;
        hub.register(scoped(), Arc::new(PingReplay::new(store)));
        hub
    }

    #[tokio::test]
    async fn subscribe_replays_then_receives_updates() {
        let hub = hub_with_initialized_store().await;
        let mut rx = hub.subscribe(&scoped()).await.unwrap();

        // Initial replay for a ping audience is one ping.
        let first = rx.recv().await.unwrap();
        assert_eq!(&first.encode()[..], b"event: ping\ndata:  \n\n");

        hub.publish(Arc::new(StreamEvent::ping()));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, SseFrame::Event(_)));
    }

    #[tokio::test]
    async fn subscribe_without_repository_is_refused() {
        let hub = StreamBroadcaster::new(Audience::MobilePing, BroadcasterOptions::default());
        assert!(matches!(
            hub.subscribe(&scoped()).await,
            Err(RelayError::PreconditionViolation { .. })
        ));
    }

    #[tokio::test]
    async fn handler_requires_matching_credential_kind() {
        let hub = hub_with_initialized_store().await;
        let mobile = Credential::MobileKey("mob-key".into());
        let sdk = Credential::SdkKey("sdk-key".into());
        assert!(hub.handler(&mobile, scoped()).is_some());
        assert!(hub.handler(&sdk, ScopedCredential::unfiltered(sdk.clone())).is_none());
        assert_eq!(mobile.kind(), CredentialKind::MobileKey);
    }

    #[tokio::test]
    async fn comments_are_not_events() {
        let hub = hub_with_initialized_store().await;
        let mut rx = hub.subscribe(&scoped()).await.unwrap();
        rx.recv().await.unwrap(); // replay

        hub.publish_comment("");
        let frame = rx.recv().await.unwrap();
        assert_eq!(&frame.encode()[..], b":\n\n");
    }

    #[tokio::test]
    async fn overflowing_subscriber_is_dropped() {
        let hub = StreamBroadcaster::new(
            Audience::MobilePing,
            BroadcasterOptions {
                queue_depth: 2,
                ..Default::default()
            },
        );
        let store = Arc::new(MemoryFeatureStore::new());
        store.init(vec![]).await;
        hub.register(scoped(), Arc::new(PingReplay::new(store)));

        let rx = hub.subscribe(&scoped()).await.unwrap();
        assert_eq!(hub.subscriber_count(), 1);

        // Nobody drains rx; the queue fills (replay took one slot) and the
        // subscriber is dropped on overflow.
        for _ in 0..4 {
            hub.publish(Arc::new(StreamEvent::ping()));
        }
        assert_eq!(hub.subscriber_count(), 0);
        drop(rx);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_halts_delivery() {
        let hub = hub_with_initialized_store().await;
        let mut rx = hub.subscribe(&scoped()).await.unwrap();
        rx.recv().await.unwrap(); // replay

        hub.close();
        hub.close();
        assert!(hub.is_closed());
        assert_eq!(hub.subscriber_count(), 0);
        // Channel is closed once the subscriber is dropped.
        assert!(rx.recv().await.is_none());
        // A caller that raced the shutdown can tell it apart from success.
        assert!(matches!(
            hub.subscribe(&scoped()).await,
            Err(RelayError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn rekey_moves_repository_and_subscribers() {
        let hub = hub_with_initialized_store().await;
        let _rx = hub.subscribe(&scoped()).await.unwrap();

        let rotated =
            ScopedCredential::unfiltered(Credential::MobileKey("mob-key-rotated".into()));
        hub.rekey(&scoped(), rotated.clone());

        // Old scope no longer subscribes; new one does.
        assert!(hub.subscribe(&scoped()).await.is_err());
        assert!(hub.subscribe(&rotated).await.is_ok());
        assert_eq!(hub.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn unregister_with_force_disconnects() {
        let hub = hub_with_initialized_store().await;
        let _rx = hub.subscribe(&scoped()).await.unwrap();
        assert_eq!(hub.subscriber_count(), 1);

        hub.unregister(&scoped(), true);
        assert_eq!(hub.subscriber_count(), 0);
        assert!(hub.subscribe(&scoped()).await.is_err());
    }

    #[test]
    fn filter_scopes_are_distinct_repository_keys() {
        let cred = Credential::SdkKey("sdk-1".into());
        let a = ScopedCredential::new(cred.clone(), FilterKey::new("a"));
        let b = ScopedCredential::new(cred, FilterKey::new("b"));
        assert_ne!(a.routing_key(), b.routing_key());
    }
}
