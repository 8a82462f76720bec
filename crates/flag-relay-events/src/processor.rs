//! The summarizing event processor.
//!
//! One processor exists per request-metadata tuple. Evaluations feed a
//! counter rollup keyed by (flag key, variation, version) and emit index
//! events so upstream knows the contexts involved; full-fidelity `feature`
//! events and timed `debug` copies are emitted only when the flag asks for
//! them. Every flush drains the buffer plus one summary event into a batch
//! handed to the sender.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, warn};

use crate::output::{
    CustomEventBody, CustomEventData, EvaluationData, FeatureEventBody, FlagCounter, FlagSummary,
    IdentifyEventBody, IdentifyEventData, IndexEventBody, OutputEvent, SummaryEventBody,
};
use crate::sender::DelegatingEventSender;

/// The dispatch surface the relay drives for each translated event.
pub trait EventProcessor: Send + Sync {
    fn record_evaluation(&self, data: EvaluationData);
    fn record_custom_event(&self, data: CustomEventData);
    fn record_identify_event(&self, data: IdentifyEventData);
    fn record_raw_event(&self, raw: Box<serde_json::value::RawValue>);
    /// Drain buffered events (plus the summary rollup) to the sender.
    fn flush(&self);
    /// Final flush, then drop everything that arrives afterwards.
    fn close(&self);
}

type CounterKey = (String, Option<usize>, Option<u64>);

#[derive(Default)]
struct FlagSummaryState {
    default: Option<serde_json::Value>,
    context_kinds: BTreeSet<String>,
    counters: HashMap<CounterKey, (serde_json::Value, u64, bool)>,
}

#[derive(Default)]
struct ProcessorState {
    buffer: Vec<OutputEvent>,
    features: BTreeMap<String, FlagSummaryState>,
    start_date: u64,
    end_date: u64,
    indexed_contexts: HashSet<String>,
    overflowed: bool,
}

fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Buffering, summarizing implementation of [`EventProcessor`].
pub struct SummarizingProcessor {
    sender: Arc<DelegatingEventSender>,
    capacity: usize,
    state: Mutex<ProcessorState>,
    closed: AtomicBool,
}

impl SummarizingProcessor {
    pub fn new(sender: Arc<DelegatingEventSender>, capacity: usize) -> Self {
        Self {
            sender,
            capacity,
            state: Mutex::new(ProcessorState::default()),
            closed: AtomicBool::new(false),
        }
    }

    fn push(state: &mut ProcessorState, capacity: usize, event: OutputEvent) {
        if state.buffer.len() >= capacity {
            if !state.overflowed {
                warn!("event buffer full, dropping events until next flush");
                state.overflowed = true;
            }
            return;
        }
        state.buffer.push(event);
    }

    /// Index each context once per flush window.
    fn maybe_index(state: &mut ProcessorState, capacity: usize, data: &EvaluationData) {
        let Ok(keys) = data.context.keys() else {
            warn!("context with no key in evaluation event, not indexing");
            return;
        };
        if state.indexed_contexts.insert(keys.key) {
            Self::push(
                state,
                capacity,
                OutputEvent::Index(IndexEventBody {
                    kind: "index",
                    creation_date: data.creation_date,
                    context: data.context.clone(),
                }),
            );
        }
    }

    fn feature_body(kind: &'static str, data: &EvaluationData) -> FeatureEventBody {
        FeatureEventBody {
            kind,
            creation_date: data.creation_date,
            key: data.key.clone(),
            context: data.context.clone(),
            value: data.value.clone(),
            default: data.default.clone(),
            variation: data.variation,
            version: data.version,
            reason: data.reason.clone(),
            prereq_of: data.prereq_of.clone(),
        }
    }

    fn drain(&self) -> Vec<OutputEvent> {
        let mut state = self.state.lock().expect("processor state lock poisoned");
        let mut batch = std::mem::take(&mut state.buffer);

        if !state.features.is_empty() {
            let features = std::mem::take(&mut state.features)
                .into_iter()
                .map(|(flag_key, summary)| {
                    let mut counters: Vec<(CounterKey, (serde_json::Value, u64, bool))> =
                        summary.counters.into_iter().collect();
                    counters.sort_by(|(a, _), (b, _)| a.cmp(b));
                    (
                        flag_key,
                        FlagSummary {
                            default: summary.default,
                            context_kinds: summary.context_kinds.into_iter().collect(),
                            counters: counters
                                .into_iter()
                                .map(|((_, variation, version), (value, count, unknown))| {
                                    FlagCounter {
                                        value,
                                        variation,
                                        version,
                                        count,
                                        unknown: unknown.then_some(true),
                                    }
                                })
                                .collect(),
                        },
                    )
                })
                .collect();
            batch.push(OutputEvent::Summary(SummaryEventBody {
                kind: "summary",
                start_date: state.start_date,
                end_date: state.end_date,
                features,
            }));
        }

        *state = ProcessorState::default();
        batch
    }
}

impl EventProcessor for SummarizingProcessor {
    fn record_evaluation(&self, data: EvaluationData) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.lock().expect("processor state lock poisoned");

        Self::maybe_index(&mut state, self.capacity, &data);

        if data.require_full_event {
            let body = Self::feature_body("feature", &data);
            Self::push(&mut state, self.capacity, OutputEvent::Feature(body));
        }
        if data
            .debug_events_until_date
            .is_some_and(|until| until > now_millis())
        {
            let body = Self::feature_body("debug", &data);
            Self::push(&mut state, self.capacity, OutputEvent::Feature(body));
        }

        if state.start_date == 0 || data.creation_date < state.start_date {
            state.start_date = data.creation_date;
        }
        state.end_date = state.end_date.max(data.creation_date);

        let summary = state.features.entry(data.key.clone()).or_default();
        if summary.default.is_none() {
            summary.default = data.default.clone();
        }
        if let Ok(keys) = data.context.keys() {
            summary.context_kinds.insert(keys.kind);
        }
        let counter_key = (data.value.to_string(), data.variation, data.version);
        let unknown = data.version.is_none();
        summary
            .counters
            .entry(counter_key)
            .and_modify(|(_, count, _)| *count += 1)
            .or_insert((data.value, 1, unknown));
    }

    fn record_custom_event(&self, data: CustomEventData) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.lock().expect("processor state lock poisoned");
        Self::push(
            &mut state,
            self.capacity,
            OutputEvent::Custom(CustomEventBody {
                kind: "custom",
                creation_date: data.creation_date,
                key: data.key,
                context: data.context,
                data: data.data,
                metric_value: data.metric_value,
            }),
        );
    }

    fn record_identify_event(&self, data: IdentifyEventData) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.lock().expect("processor state lock poisoned");
        Self::push(
            &mut state,
            self.capacity,
            OutputEvent::Identify(IdentifyEventBody {
                kind: "identify",
                creation_date: data.creation_date,
                context: data.context,
                key: data.key,
            }),
        );
    }

    fn record_raw_event(&self, raw: Box<serde_json::value::RawValue>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.lock().expect("processor state lock poisoned");
        Self::push(&mut state, self.capacity, OutputEvent::Raw(raw));
    }

    fn flush(&self) {
        let batch = self.drain();
        if batch.is_empty() {
            return;
        }
        debug!(events = batch.len(), "flushing event batch");
        let sender = Arc::clone(&self.sender);
        tokio::spawn(async move {
            if let Err(err) = sender.send_batch(&batch).await {
                warn!(%err, "event batch delivery failed");
            }
        });
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.flush();
    }
}
