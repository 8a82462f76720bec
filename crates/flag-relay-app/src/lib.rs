//! # Flag Relay App
//!
//! The top-level relay service. [`relay::RelayEnvironments`] owns every
//! per-environment lifecycle (store, stream set, event relay) and is the
//! action handler the topology layer drives; [`routes`] exposes the SSE and
//! event-ingestion endpoints over actix-web.

pub mod relay;
pub mod routes;

pub use relay::{MemoryStoreFactory, RelayEnvironments, StoreFactory};
