//! The per-environment summarizing relay.
//!
//! Maintains one processor/sender pair per request-metadata tuple. Queues
//! are created lazily on first enqueue, marked active on every enqueue, and
//! retired by the periodic cleanup task after two quiet sweeps:
//! initial → active → idle → closed. The common case is a single constant
//! metadata, so the single-queue fast path skips cleanup entirely.
//!
//! The enqueue path takes the queue-map lock only to look up or create the
//! queue, then dispatches events outside it so processor work for one
//! metadata never blocks another.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use serde_json::value::RawValue;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use flag_relay_core::config::EventsConfig;
use flag_relay_core::credential::Credential;
use flag_relay_core::error::{RelayError, Result};
use flag_relay_core::store::FeatureStore;

use crate::metadata::EventPayloadMetadata;
use crate::processor::{EventProcessor, SummarizingProcessor};
use crate::sender::{DelegatingEventSender, EventSender, HttpEventSender};
use crate::translator::{EventTranslator, TranslatedEvent};

struct QueueState {
    processor: Arc<dyn EventProcessor>,
    sender: Arc<DelegatingEventSender>,
    active: Arc<AtomicBool>,
    tags: Option<String>,
}

/// The bank of per-metadata event processors for one environment.
pub struct EventRelay {
    config: EventsConfig,
    client: reqwest::Client,
    credential: RwLock<Credential>,
    translator: EventTranslator,
    /// `None` after close; enqueues against a closed relay are rejected.
    queues: Mutex<Option<HashMap<EventPayloadMetadata, QueueState>>>,
    stop: watch::Sender<bool>,
    tasks: AsyncMutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl EventRelay {
    pub fn new(
        store: Arc<dyn FeatureStore>,
        credential: Credential,
        config: EventsConfig,
        client: reqwest::Client,
    ) -> Arc<Self> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let flush_interval = config.flush_interval;
        let cleanup_interval = config.effective_cleanup_interval();

        let relay = Arc::new(Self {
            config,
            client,
            credential: RwLock::new(credential),
            translator: EventTranslator::new(store),
            queues: Mutex::new(Some(HashMap::new())),
            stop: stop_tx,
            tasks: AsyncMutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        let flush_task = tokio::spawn(Self::periodic(
            Arc::downgrade(&relay),
            stop_rx.clone(),
            flush_interval,
            |relay| relay.flush(),
        ));
        let cleanup_task = tokio::spawn(Self::periodic(
            Arc::downgrade(&relay),
            stop_rx,
            cleanup_interval,
            |relay| relay.cleanup_pass(),
        ));
        *relay
            .tasks
            .try_lock()
            .expect("task slot free at construction") = vec![flush_task, cleanup_task];
        relay
    }

    async fn periodic(
        relay: Weak<EventRelay>,
        mut stop: watch::Receiver<bool>,
        interval: Duration,
        tick: fn(&EventRelay),
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(relay) = relay.upgrade() else { break };
                    tick(&relay);
                }
                _ = stop.changed() => break,
            }
        }
    }

    fn new_queue(&self, metadata: &EventPayloadMetadata) -> QueueState {
        let credential = self
            .credential
            .read()
            .expect("credential lock poisoned")
            .clone();
        let http = Arc::new(HttpEventSender::new(
            self.client.clone(),
            &self.config,
            &credential,
            metadata.tags.clone(),
        ));
        let sender = DelegatingEventSender::new(http as Arc<dyn EventSender>);
        let processor = Arc::new(SummarizingProcessor::new(
            Arc::clone(&sender),
            self.config.capacity,
        ));
        info!(schema = metadata.schema_version, "event queue created");
        QueueState {
            processor,
            sender,
            active: Arc::new(AtomicBool::new(true)),
            tags: metadata.tags.clone(),
        }
    }

    /// Translate and dispatch a batch of raw events under one metadata
    /// tuple. Bad events are dropped individually; the batch continues.
    /// A batch that races shutdown is rejected with [`RelayError::Shutdown`]
    /// so the caller can tell the drop from an accepted batch.
    pub async fn enqueue(
        &self,
        metadata: &EventPayloadMetadata,
        events: Vec<Box<RawValue>>,
    ) -> Result<()> {
        let processor = {
            let mut guard = self.queues.lock().expect("queue map lock poisoned");
            let Some(queues) = guard.as_mut() else {
                debug!("relay closed, rejecting {} events", events.len());
                return Err(RelayError::Shutdown);
            };
            let queue = queues
                .entry(metadata.clone())
                .or_insert_with(|| self.new_queue(metadata));
            queue.active.store(true, Ordering::SeqCst);
            Arc::clone(&queue.processor)
        };

        for raw in events {
            match self.translator.translate(&raw, metadata.schema_version).await {
                Ok(TranslatedEvent::Evaluation(data)) => processor.record_evaluation(data),
                Ok(TranslatedEvent::Custom(data)) => processor.record_custom_event(data),
                Ok(TranslatedEvent::Identify(data)) => processor.record_identify_event(data),
                Ok(TranslatedEvent::Raw(raw)) => processor.record_raw_event(raw),
                Err(err) => warn!(%err, "dropping untranslatable event"),
            }
        }
        Ok(())
    }

    /// Flush every queue's processor. Processors run outside the map lock.
    pub fn flush(&self) {
        let processors: Vec<Arc<dyn EventProcessor>> = {
            let guard = self.queues.lock().expect("queue map lock poisoned");
            match guard.as_ref() {
                Some(queues) => queues.values().map(|q| Arc::clone(&q.processor)).collect(),
                None => return,
            }
        };
        for processor in processors {
            processor.flush();
        }
    }

    /// Substitute a rotated credential into every queue's sender, iff the
    /// replacement is of the same kind as the current credential.
    pub fn replace_credential(&self, new: &Credential) {
        {
            let mut current = self.credential.write().expect("credential lock poisoned");
            if current.kind() != new.kind() {
                warn!(
                    current = %*current,
                    replacement = %new,
                    "credential replacement kind mismatch, ignoring"
                );
                return;
            }
            *current = new.clone();
        }
        let guard = self.queues.lock().expect("queue map lock poisoned");
        if let Some(queues) = guard.as_ref() {
            for queue in queues.values() {
                let http = Arc::new(HttpEventSender::new(
                    self.client.clone(),
                    &self.config,
                    new,
                    queue.tags.clone(),
                ));
                queue.sender.replace(http as Arc<dyn EventSender>);
            }
        }
        info!(credential = %new, "event sender credential rotated");
    }

    /// One cleanup sweep: close queues that saw no activity since the last
    /// sweep, then clear the activity flag on the survivors.
    fn cleanup_pass(&self) {
        let retired: Vec<Arc<dyn EventProcessor>> = {
            let mut guard = self.queues.lock().expect("queue map lock poisoned");
            let Some(queues) = guard.as_mut() else { return };
            if queues.len() <= 1 {
                return;
            }
            let idle: Vec<EventPayloadMetadata> = queues
                .iter()
                .filter(|(_, queue)| !queue.active.load(Ordering::SeqCst))
                .map(|(metadata, _)| metadata.clone())
                .collect();
            let retired = idle
                .iter()
                .filter_map(|metadata| queues.remove(metadata))
                .map(|queue| queue.processor)
                .collect();
            for queue in queues.values() {
                queue.active.store(false, Ordering::SeqCst);
            }
            retired
        };
        if !retired.is_empty() {
            info!(count = retired.len(), "retiring idle event queues");
        }
        for processor in retired {
            processor.close();
        }
    }

    pub fn queue_count(&self) -> usize {
        self.queues
            .lock()
            .expect("queue map lock poisoned")
            .as_ref()
            .map(HashMap::len)
            .unwrap_or(0)
    }

    /// Stop the periodic tasks and close every processor. Idempotent;
    /// enqueues after close are rejected with [`RelayError::Shutdown`].
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.stop.send(true);
        for task in self.tasks.lock().await.drain(..) {
            let _ = task.await;
        }
        let queues = self
            .queues
            .lock()
            .expect("queue map lock poisoned")
            .take();
        if let Some(queues) = queues {
            for queue in queues.into_values() {
                queue.processor.close();
            }
        }
        info!("event relay closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flag_relay_core::store::MemoryFeatureStore;
    use std::time::Duration;
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn raw(json: &str) -> Box<RawValue> {
        RawValue::from_string(json.to_string()).unwrap()
    }

    fn identify_event() -> Box<RawValue> {
        raw(r#"{"kind":"identify","creationDate":1,"user":{"key":"u1"}}"#)
    }

    async fn relay_against(server: &MockServer) -> Arc<EventRelay> {
        let config = EventsConfig {
            events_uri: server.uri(),
            events_path: "/bulk".into(),
            // Long intervals so tests drive flush/cleanup explicitly.
            flush_interval: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        EventRelay::new(
            Arc::new(MemoryFeatureStore::new()),
            Credential::SdkKey("sdk-key-1".into()),
            config,
            reqwest::Client::new(),
        )
    }

    #[tokio::test]
    async fn enqueue_creates_queue_and_flush_delivers_upstream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("Authorization", "sdk-key-1"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let relay = relay_against(&server).await;
        let metadata = EventPayloadMetadata::new(2, None);

        relay.enqueue(&metadata, vec![identify_event()]).await.unwrap();
        assert_eq!(relay.queue_count(), 1);

        relay.flush();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.received_requests().await.unwrap().len(), 1);

        relay.close().await;
    }

    #[tokio::test]
    async fn bad_events_are_dropped_but_the_batch_continues() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;

        let relay = relay_against(&server).await;
        let metadata = EventPayloadMetadata::new(2, None);
        relay
            .enqueue(
                &metadata,
                vec![
                    raw(r#"{"creationDate":1}"#), // no kind
                    identify_event(),
                ],
            )
            .await;

        relay.flush();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);

        relay.close().await;
    }

    #[tokio::test]
    async fn idle_queues_retire_after_two_sweeps() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;

        let relay = relay_against(&server).await;
        let m1 = EventPayloadMetadata::new(2, Some("app=web".into()));
        let m2 = EventPayloadMetadata::new(2, Some("app=ios".into()));
        relay.enqueue(&m1, vec![identify_event()]).await.unwrap();
        relay.enqueue(&m2, vec![identify_event()]).await.unwrap();
        assert_eq!(relay.queue_count(), 2);

        // First sweep: both were active, flags clear, nothing removed.
        relay.cleanup_pass();
        assert_eq!(relay.queue_count(), 2);

        // m1 stays busy; m2 goes quiet and is retired on the second sweep.
        relay.enqueue(&m1, vec![identify_event()]).await.unwrap();
        relay.cleanup_pass();
        assert_eq!(relay.queue_count(), 1);

        // A later enqueue under the retired metadata builds a fresh queue.
        relay.enqueue(&m2, vec![identify_event()]).await.unwrap();
        assert_eq!(relay.queue_count(), 2);

        relay.close().await;
    }

    #[tokio::test]
    async fn single_queue_skips_cleanup() {
        let server = MockServer::start().await;
        let relay = relay_against(&server).await;
        let metadata = EventPayloadMetadata::new(2, None);
        relay.enqueue(&metadata, vec![identify_event()]).await.unwrap();

        relay.cleanup_pass();
        relay.cleanup_pass();
        assert_eq!(relay.queue_count(), 1);

        relay.close().await;
    }

    #[tokio::test]
    async fn close_rejects_future_enqueues() {
        let server = MockServer::start().await;
        let relay = relay_against(&server).await;

        relay.close().await;
        relay.close().await;
        let refused = relay
            .enqueue(&EventPayloadMetadata::new(2, None), vec![identify_event()])
            .await;
        assert!(matches!(refused, Err(RelayError::Shutdown)));
        assert_eq!(relay.queue_count(), 0);
    }

    #[tokio::test]
    async fn credential_rotation_swaps_every_queue_sender() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("Authorization", "sdk-key-2"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let relay = relay_against(&server).await;
        let metadata = EventPayloadMetadata::new(2, None);
        relay.enqueue(&metadata, vec![identify_event()]).await.unwrap();

        // Kind mismatch is ignored.
        relay.replace_credential(&Credential::MobileKey("mob-1".into()));
        // Same kind rotates.
        relay.replace_credential(&Credential::SdkKey("sdk-key-2".into()));

        relay.enqueue(&metadata, vec![identify_event()]).await.unwrap();
        relay.flush();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].headers.get("Authorization").unwrap(),
            "sdk-key-2"
        );

        relay.close().await;
    }
}
