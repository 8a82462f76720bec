//! # Flag Relay Stream
//!
//! The per-environment SSE fan-out engine:
//! - [`event`] — canonical stream event bodies (`put`, `patch`, `delete`,
//!   `ping`), lazily encoded and memoized
//! - [`audience`] — the capability set distinguishing server-side full,
//!   server-side flags-only, mobile ping, and JS client ping streams
//! - [`broadcast`] — one SSE broadcaster per (audience, credential) with
//!   bounded per-subscriber queues
//! - [`replay`] — initial-snapshot synthesis from the feature store,
//!   single-flight coalesced where scans are expensive
//! - [`stream_set`] — the per-environment owner of all hubs, dispatching
//!   data updates and heartbeats
//! - [`handlers`] — actix-web glue producing `text/event-stream` responses

pub mod audience;
pub mod broadcast;
pub mod event;
pub mod handlers;
pub mod replay;
pub mod stream_set;

pub use audience::Audience;
pub use broadcast::{BroadcasterOptions, SseFrame, StreamBroadcaster};
pub use event::StreamEvent;
pub use replay::{AllDataReplay, FlagsOnlyReplay, PingReplay, ReplayRepository};
pub use stream_set::{EnvironmentStreams, StreamSetStats};
