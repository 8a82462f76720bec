//! Legacy-to-current event translation.
//!
//! Incoming blobs are dispatched on their `kind` property. The three known
//! kinds parse into typed inputs; anything else passes through untouched so
//! future event kinds survive the relay unmodified.
//!
//! Feature events are the subtle case. What the translator must fill in
//! depends on the payload schema version:
//!
//! - **v1** (no schema header): the variation index was never sent. When the
//!   event has a `version` the flag existed, so the store is consulted and
//!   the index inferred by matching `value` against the flag's variation
//!   list. First match wins, by deep JSON equality — identical serializations
//!   of semantically distinct variations resolve to the earlier index, and
//!   that behavior is load-bearing for parity with old pipelines.
//! - **v2**: explicit `trackEvents` / `debugEventsUntilDate` on the event are
//!   trusted without touching the store. When both are absent they might
//!   genuinely be unset, but the store is the only way to know.
//! - Any schema: no `version` means the flag did not exist at evaluation
//!   time; the store is not consulted and nothing is inferred.
//!
//! A store failure fails only the event that needed the store; the rest of
//! the batch continues.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::value::RawValue;
use serde_json::Value;

use flag_relay_core::error::{RelayError, Result};
use flag_relay_core::store::{DataKind, FeatureStore};

use crate::input::{choose_context, LegacyCustomEvent, LegacyFeatureEvent, LegacyIdentifyEvent};
use crate::output::{CustomEventData, EvaluationData, IdentifyEventData};

/// Translation output: a tagged sum the dispatcher switches on.
#[derive(Debug)]
pub enum TranslatedEvent {
    Evaluation(EvaluationData),
    Custom(CustomEventData),
    Identify(IdentifyEventData),
    /// Unknown kind, forwarded byte-for-byte.
    Raw(Box<RawValue>),
}

/// Flag properties the legacy schemas omitted.
#[derive(Debug, Default, Clone)]
struct FlagProperties {
    variations: Option<Vec<Value>>,
    track_events: bool,
    debug_events_until_date: Option<u64>,
}

/// Translates legacy event blobs into current-schema inputs.
pub struct EventTranslator {
    store: Arc<dyn FeatureStore>,
}

impl EventTranslator {
    pub fn new(store: Arc<dyn FeatureStore>) -> Self {
        Self { store }
    }

    /// Translate one event blob under the given payload schema version.
    pub async fn translate(&self, raw: &RawValue, schema_version: u32) -> Result<TranslatedEvent> {
        #[derive(Deserialize)]
        struct KindOnly {
            #[serde(default)]
            kind: Option<String>,
        }
        let kind = serde_json::from_str::<KindOnly>(raw.get())
            .map_err(|e| RelayError::invalid_event(e))?
            .kind
            .filter(|k| !k.is_empty())
            .ok_or_else(|| RelayError::invalid_event("event has no kind"))?;

        match kind.as_str() {
            "feature" => self.translate_feature(raw, schema_version).await,
            "identify" => translate_identify(raw),
            "custom" => translate_custom(raw),
            _ => Ok(TranslatedEvent::Raw(raw.to_owned())),
        }
    }

    async fn translate_feature(
        &self,
        raw: &RawValue,
        schema_version: u32,
    ) -> Result<TranslatedEvent> {
        let event: LegacyFeatureEvent =
            serde_json::from_str(raw.get()).map_err(RelayError::invalid_event)?;
        let context = choose_context(event.user, event.context)?;

        let mut variation = event.variation;
        let mut require_full_event = event.track_events.unwrap_or(false);
        let mut debug_until = event.debug_events_until_date;

        // No version means the flag did not exist at evaluation time; there
        // is nothing to look up.
        if event.version.is_some() {
            if schema_version < 2 {
                let flag = self.flag_properties(&event.key).await?;
                variation = flag
                    .variations
                    .as_ref()
                    .and_then(|variations| variations.iter().position(|v| *v == event.value));
                require_full_event = flag.track_events;
                debug_until = flag.debug_events_until_date;
            } else if event.track_events.is_none() && event.debug_events_until_date.is_none() {
                let flag = self.flag_properties(&event.key).await?;
                require_full_event = flag.track_events;
                debug_until = flag.debug_events_until_date;
            }
        }

        Ok(TranslatedEvent::Evaluation(EvaluationData {
            creation_date: event.creation_date,
            key: event.key,
            context,
            value: event.value,
            default: event.default,
            variation,
            version: event.version,
            reason: event.reason,
            prereq_of: event.prereq_of,
            require_full_event,
            debug_events_until_date: debug_until,
        }))
    }

    async fn flag_properties(&self, key: &str) -> Result<FlagProperties> {
        let descriptor = self.store.get(DataKind::Flag, key).await?;
        let Some(flag) = descriptor.and_then(|d| d.item) else {
            // The flag is gone from the store; translate with what we have.
            return Ok(FlagProperties::default());
        };
        Ok(FlagProperties {
            variations: flag
                .get("variations")
                .and_then(Value::as_array)
                .map(|a| a.to_vec()),
            track_events: flag
                .get("trackEvents")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            debug_events_until_date: flag.get("debugEventsUntilDate").and_then(Value::as_u64),
        })
    }
}

fn translate_identify(raw: &RawValue) -> Result<TranslatedEvent> {
    let event: LegacyIdentifyEvent =
        serde_json::from_str(raw.get()).map_err(RelayError::invalid_event)?;
    let context = choose_context(event.user, event.context)?;
    Ok(TranslatedEvent::Identify(IdentifyEventData {
        creation_date: event.creation_date,
        context,
        key: event.key,
    }))
}

fn translate_custom(raw: &RawValue) -> Result<TranslatedEvent> {
    let event: LegacyCustomEvent =
        serde_json::from_str(raw.get()).map_err(RelayError::invalid_event)?;
    let context = choose_context(event.user, event.context)?;
    Ok(TranslatedEvent::Custom(CustomEventData {
        creation_date: event.creation_date,
        key: event.key,
        context,
        data: event.data,
        metric_value: event.metric_value,
    }))
}
