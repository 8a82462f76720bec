//! The legacy event model.
//!
//! Older SDKs post `feature`, `identify`, and `custom` events in several
//! pre-current schemas. Contexts (or old-style users) are handled in
//! *preserialized* mode: only the kind and key are decoded, and the original
//! bytes are retained and re-emitted verbatim so privacy transformations the
//! SDK already applied survive the round trip.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;

use flag_relay_core::error::{RelayError, Result};

/// A context kept as raw bytes, with only enough decoded to identify it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PreserializedContext {
    raw: Box<RawValue>,
}

/// The decoded identity of a preserialized context.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextKeys {
    /// Context kind; old-style users have no kind and default to `user`.
    pub kind: String,
    pub key: String,
}

impl PreserializedContext {
    pub fn from_raw(raw: Box<RawValue>) -> Self {
        Self { raw }
    }

    /// The verbatim bytes, exactly as received.
    pub fn raw(&self) -> &RawValue {
        &self.raw
    }

    /// Decode the kind and key without touching anything else.
    pub fn keys(&self) -> Result<ContextKeys> {
        #[derive(Deserialize)]
        struct Minimal {
            #[serde(default)]
            kind: Option<String>,
            #[serde(default)]
            key: Option<String>,
        }
        let minimal: Minimal = serde_json::from_str(self.raw.get())
            .map_err(|e| RelayError::invalid_event(format!("unreadable context: {}", e)))?;
        Ok(ContextKeys {
            kind: minimal.kind.unwrap_or_else(|| "user".to_string()),
            key: minimal
                .key
                .ok_or_else(|| RelayError::invalid_event("context has no key"))?,
        })
    }
}

/// Pick the event's context: `context` wins over `user`; neither is an error.
pub(crate) fn choose_context(
    user: Option<PreserializedContext>,
    context: Option<PreserializedContext>,
) -> Result<PreserializedContext> {
    context.or(user).ok_or(RelayError::NoUserOrContext)
}

/// A legacy `feature` (evaluation) event.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyFeatureEvent {
    pub creation_date: u64,
    pub key: String,
    #[serde(default)]
    pub user: Option<PreserializedContext>,
    #[serde(default)]
    pub context: Option<PreserializedContext>,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub version: Option<u64>,
    #[serde(default)]
    pub variation: Option<usize>,
    #[serde(default)]
    pub reason: Option<Value>,
    #[serde(default)]
    pub track_events: Option<bool>,
    #[serde(default)]
    pub debug_events_until_date: Option<u64>,
    #[serde(default)]
    pub prereq_of: Option<String>,
}

/// A legacy `identify` event.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyIdentifyEvent {
    pub creation_date: u64,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub user: Option<PreserializedContext>,
    #[serde(default)]
    pub context: Option<PreserializedContext>,
}

/// A legacy `custom` event.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyCustomEvent {
    pub creation_date: u64,
    pub key: String,
    #[serde(default)]
    pub user: Option<PreserializedContext>,
    #[serde(default)]
    pub context: Option<PreserializedContext>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub metric_value: Option<f64>,
}
