//! Request parsing for the event ingestion endpoints.
//!
//! SDKs post JSON arrays of events. The batch is split into raw values
//! without interpreting the individual events — translation happens inside
//! the relay, per event, so one corrupt event cannot reject the batch.

use actix_web::{HttpRequest, HttpResponse};
use serde_json::value::RawValue;
use tracing::{debug, warn};

use flag_relay_core::error::{RelayError, Result};

use crate::metadata::{EventPayloadMetadata, EVENT_SCHEMA_HEADER, TAGS_HEADER, UNSUMMARIZED_HEADER};
use crate::relay::EventRelay;

/// Extract the metadata tuple from the recognized request headers.
///
/// The unsummarized marker is recognized and deliberately ignored: this
/// relay summarizes every payload, which is exactly what the marker asks
/// for, so its presence changes nothing beyond a log line.
pub fn metadata_from_request(req: &HttpRequest) -> EventPayloadMetadata {
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
    };
    if req.headers().contains_key(UNSUMMARIZED_HEADER) {
        debug!("payload carries the unsummarized marker; events are summarized here");
    }
    EventPayloadMetadata::from_headers(header(EVENT_SCHEMA_HEADER), header(TAGS_HEADER))
}

/// Split a posted body into raw events without parsing their contents.
pub fn parse_event_batch(body: &[u8]) -> Result<Vec<Box<RawValue>>> {
    serde_json::from_slice(body)
        .map_err(|e| RelayError::invalid_event(format!("event batch is not a JSON array: {}", e)))
}

/// Accept one event post for an already-resolved environment relay.
pub async fn accept_events(relay: &EventRelay, req: &HttpRequest, body: &[u8]) -> HttpResponse {
    let batch = match parse_event_batch(body) {
        Ok(batch) => batch,
        Err(err) => {
            warn!(%err, "rejecting event post");
            return HttpResponse::BadRequest().finish();
        }
    };
    let metadata = metadata_from_request(req);
    match relay.enqueue(&metadata, batch).await {
        Ok(()) => HttpResponse::Accepted().finish(),
        // The environment is being torn down; tell the SDK to go elsewhere.
        Err(err) => {
            warn!(%err, "event post arrived during shutdown");
            HttpResponse::ServiceUnavailable().finish()
        }
    }
}
