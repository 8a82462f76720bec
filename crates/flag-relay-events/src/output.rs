//! Current-schema output events.
//!
//! These are what the relay posts upstream: full-fidelity `feature` and
//! `debug` events, `index`/`identify`/`custom` events, the per-flush
//! `summary` event, and raw pass-throughs for event kinds the relay does
//! not recognize.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::value::RawValue;
use serde_json::Value;

use crate::input::PreserializedContext;

/// One output event. Untagged: every variant carries its own `kind` member,
/// and raw pass-throughs serialize their original bytes verbatim.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OutputEvent {
    Feature(FeatureEventBody),
    Index(IndexEventBody),
    Identify(IdentifyEventBody),
    Custom(CustomEventBody),
    Summary(SummaryEventBody),
    Raw(Box<RawValue>),
}

impl OutputEvent {
    /// The `kind` member of the serialized event, for tests and logging.
    pub fn kind(&self) -> &str {
        match self {
            OutputEvent::Feature(body) => body.kind,
            OutputEvent::Index(_) => "index",
            OutputEvent::Identify(_) => "identify",
            OutputEvent::Custom(_) => "custom",
            OutputEvent::Summary(_) => "summary",
            OutputEvent::Raw(_) => "raw",
        }
    }
}

/// A full-fidelity evaluation event: `kind` is `feature`, or `debug` for
/// debug copies.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureEventBody {
    pub kind: &'static str,
    pub creation_date: u64,
    pub key: String,
    pub context: PreserializedContext,
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variation: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prereq_of: Option<String>,
}

/// Announces a context the summarizer has seen, once per context key.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEventBody {
    pub kind: &'static str,
    pub creation_date: u64,
    pub context: PreserializedContext,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyEventBody {
    pub kind: &'static str,
    pub creation_date: u64,
    pub context: PreserializedContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomEventBody {
    pub kind: &'static str,
    pub creation_date: u64,
    pub key: String,
    pub context: PreserializedContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric_value: Option<f64>,
}

/// The per-flush rollup of evaluation counters.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryEventBody {
    pub kind: &'static str,
    pub start_date: u64,
    pub end_date: u64,
    pub features: BTreeMap<String, FlagSummary>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    pub context_kinds: Vec<String>,
    pub counters: Vec<FlagCounter>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagCounter {
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variation: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    pub count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unknown: Option<bool>,
}

/// What the legacy translator hands the processor: the evaluation payload
/// plus the delivery directives that never serialize upstream themselves.
#[derive(Debug, Clone)]
pub struct EvaluationData {
    pub creation_date: u64,
    pub key: String,
    pub context: PreserializedContext,
    pub value: Value,
    pub default: Option<Value>,
    pub variation: Option<usize>,
    pub version: Option<u64>,
    pub reason: Option<Value>,
    pub prereq_of: Option<String>,
    /// Emit a full `feature` event, not just summary counters.
    pub require_full_event: bool,
    /// Emit `debug` copies until this epoch-millisecond timestamp.
    pub debug_events_until_date: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct IdentifyEventData {
    pub creation_date: u64,
    pub context: PreserializedContext,
    pub key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CustomEventData {
    pub creation_date: u64,
    pub key: String,
    pub context: PreserializedContext,
    pub data: Option<Value>,
    pub metric_value: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, value::RawValue};

    fn context() -> PreserializedContext {
        PreserializedContext::from_raw(
            RawValue::from_string(r#"{"key":"userkey"}"#.to_string()).unwrap(),
        )
    }

    #[test]
    fn feature_event_serializes_with_kind_and_context_bytes() {
        let event = OutputEvent::Feature(FeatureEventBody {
            kind: "feature",
            creation_date: 1000,
            key: "flagkey".into(),
            context: context(),
            value: json!("b"),
            default: None,
            variation: Some(1),
            version: Some(11),
            reason: None,
            prereq_of: None,
        });
        let body: Value = serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(body["kind"], "feature");
        assert_eq!(body["creationDate"], 1000);
        assert_eq!(body["variation"], 1);
        assert_eq!(body["context"]["key"], "userkey");
        assert!(body.get("default").is_none());
    }

    #[test]
    fn raw_events_pass_through_verbatim() {
        let original = r#"{"kind":"alias","key":"a","previousKey":"b"}"#;
        let event = OutputEvent::Raw(RawValue::from_string(original.to_string()).unwrap());
        assert_eq!(serde_json::to_string(&event).unwrap(), original);
    }

    #[test]
    fn summary_counters_serialize_camel_case() {
        let event = OutputEvent::Summary(SummaryEventBody {
            kind: "summary",
            start_date: 10,
            end_date: 20,
            features: BTreeMap::from([(
                "flagkey".to_string(),
                FlagSummary {
                    default: Some(json!("a")),
                    context_kinds: vec!["user".into()],
                    counters: vec![FlagCounter {
                        value: json!("b"),
                        variation: Some(1),
                        version: Some(11),
                        count: 3,
                        unknown: None,
                    }],
                },
            )]),
        });
        let body: Value = serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(body["startDate"], 10);
        assert_eq!(body["features"]["flagkey"]["contextKinds"][0], "user");
        assert_eq!(body["features"]["flagkey"]["counters"][0]["count"], 3);
    }
}
