//! Upstream event delivery.
//!
//! Batches are posted as gzip-compressed JSON arrays with the environment's
//! credential in `Authorization` and any request tags forwarded. `5xx`,
//! `408`, and `429` responses are retried with jittered backoff; a `401`
//! disables the sender until the credential is rotated, at which point the
//! owning queue swaps in a fresh sender through the delegating wrapper.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use rand::Rng;
use reqwest::header::{AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;
use tracing::{debug, error, warn};

use flag_relay_core::config::EventsConfig;
use flag_relay_core::credential::Credential;
use flag_relay_core::error::{RelayError, Result};

use crate::metadata::{CURRENT_SCHEMA_VERSION, EVENT_SCHEMA_HEADER, TAGS_HEADER};
use crate::output::OutputEvent;

/// Sends one batch of output events upstream.
#[async_trait]
pub trait EventSender: Send + Sync {
    async fn send_batch(&self, events: &[OutputEvent]) -> Result<()>;
}

/// The HTTP implementation of [`EventSender`].
pub struct HttpEventSender {
    client: reqwest::Client,
    uri: String,
    auth: RwLock<String>,
    tags: Option<String>,
    retry_attempts: u32,
    retry_delay: Duration,
    disabled: AtomicBool,
}

impl HttpEventSender {
    pub fn new(
        client: reqwest::Client,
        config: &EventsConfig,
        credential: &Credential,
        tags: Option<String>,
    ) -> Self {
        Self {
            client,
            uri: format!(
                "{}{}",
                config.events_uri.trim_end_matches('/'),
                config.events_path
            ),
            auth: RwLock::new(credential.auth_value().to_string()),
            tags,
            retry_attempts: config.retry_attempts,
            retry_delay: config.retry_delay,
            disabled: AtomicBool::new(false),
        }
    }

    fn gzip(payload: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(payload)
            .and_then(|_| encoder.finish())
            .map_err(|e| RelayError::Serialization {
                message: format!("gzip: {}", e),
            })
    }

    fn jittered_delay(&self) -> Duration {
        let base = self.retry_delay.as_millis() as u64;
        let jitter = rand::thread_rng().gen_range(0..=base / 2);
        Duration::from_millis(base + jitter)
    }

    async fn post_once(&self, body: Vec<u8>) -> std::result::Result<StatusCode, reqwest::Error> {
        let auth = self.auth.read().expect("auth lock poisoned").clone();
        let mut request = self
            .client
            .post(&self.uri)
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_ENCODING, "gzip")
            .header(AUTHORIZATION, auth)
            .header(EVENT_SCHEMA_HEADER, CURRENT_SCHEMA_VERSION.to_string())
            .body(body);
        if let Some(tags) = &self.tags {
            request = request.header(TAGS_HEADER, tags.clone());
        }
        request.send().await.map(|response| response.status())
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

#[async_trait]
impl EventSender for HttpEventSender {
    async fn send_batch(&self, events: &[OutputEvent]) -> Result<()> {
        if self.disabled.load(Ordering::SeqCst) {
            debug!("sender disabled by earlier 401, dropping batch");
            return Ok(());
        }
        let payload = serde_json::to_vec(events)?;
        let body = Self::gzip(&payload)?;

        let mut attempt = 0;
        loop {
            let failure = match self.post_once(body.clone()).await {
                Ok(status) if status.is_success() => return Ok(()),
                Ok(StatusCode::UNAUTHORIZED) => {
                    error!("events endpoint rejected credential, disabling sender");
                    self.disabled.store(true, Ordering::SeqCst);
                    return Err(RelayError::Unauthorized);
                }
                Ok(status) if !is_retryable(status) => {
                    return Err(RelayError::EventDelivery {
                        message: format!("status {}", status),
                        retryable: false,
                    });
                }
                Ok(status) => format!("status {}", status),
                Err(err) => err.to_string(),
            };

            if attempt >= self.retry_attempts {
                return Err(RelayError::EventDelivery {
                    message: failure,
                    retryable: true,
                });
            }
            attempt += 1;
            warn!(%failure, attempt, "event delivery failed, retrying");
            tokio::time::sleep(self.jittered_delay()).await;
        }
    }
}

/// Wraps the real sender so credential rotation can swap it under a brief
/// lock without disturbing in-flight sends.
pub struct DelegatingEventSender {
    inner: RwLock<Arc<dyn EventSender>>,
}

impl DelegatingEventSender {
    pub fn new(inner: Arc<dyn EventSender>) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(inner),
        })
    }

    /// Atomically substitute the sender used for subsequent batches.
    pub fn replace(&self, inner: Arc<dyn EventSender>) {
        *self.inner.write().expect("sender lock poisoned") = inner;
    }

    pub async fn send_batch(&self, events: &[OutputEvent]) -> Result<()> {
        let sender = self.inner.read().expect("sender lock poisoned").clone();
        sender.send_batch(events).await
    }
}

/// Recording double shared by the processor and relay tests.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingSender {
    batches: std::sync::Mutex<Vec<Vec<OutputEvent>>>,
}

#[cfg(test)]
impl RecordingSender {
    pub(crate) fn batches(&self) -> Vec<Vec<OutputEvent>> {
        self.batches.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl EventSender for RecordingSender {
    async fn send_batch(&self, events: &[OutputEvent]) -> Result<()> {
        self.batches.lock().unwrap().push(events.to_vec());
        Ok(())
    }
}
