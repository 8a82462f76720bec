//! # Flag Relay Events
//!
//! The analytics event bridge: accepts event batches posted by older SDKs,
//! translates them into the current event schema, summarizes them per
//! request-metadata tuple, and forwards them upstream.
//!
//! - [`metadata`] — the request-metadata tuple keying the queue map
//! - [`input`] — the legacy event model, with contexts kept preserialized
//! - [`output`] — current-schema output events
//! - [`translator`] — legacy-to-current translation, consulting the store
//!   where the legacy schema omitted flag properties
//! - [`processor`] — the summarizing event processor
//! - [`relay`] — the per-environment bank of per-metadata processors
//! - [`sender`] — gzip-compressed upstream delivery with retry and
//!   credential rotation
//! - [`ingestion`] — request parsing helpers for the HTTP surface

pub mod ingestion;
pub mod input;
pub mod metadata;
pub mod output;
pub mod processor;
pub mod relay;
pub mod sender;
pub mod translator;

pub use metadata::EventPayloadMetadata;
pub use processor::{EventProcessor, SummarizingProcessor};
pub use relay::EventRelay;
pub use sender::{DelegatingEventSender, EventSender, HttpEventSender};
pub use translator::{EventTranslator, TranslatedEvent};
