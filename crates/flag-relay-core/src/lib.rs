//! # Flag Relay Core
//!
//! Shared domain model for the flag-relay streaming core:
//! - Relay-wide error types with transient/permanent categorization
//! - Credentials and filter-scoped credentials
//! - Environment, project, and filter identifiers
//! - The read-only feature store interface consumed by the fan-out engine
//! - Configuration structures for the stream and event subsystems
//!
//! The crates building on this one are `flag-relay-stream` (SSE fan-out),
//! `flag-relay-topology` (autoconfig routing), and `flag-relay-events`
//! (legacy analytics event bridging).

pub mod config;
pub mod credential;
pub mod environment;
pub mod error;
pub mod store;

pub use config::{EventsConfig, RelayConfig, StreamConfig};
pub use credential::{Credential, CredentialKind, ScopedCredential};
pub use environment::{
    EnvironmentId, EnvironmentParams, ExpiringSdkKey, FilterId, FilterKey, FilterParams,
    ProjectKey,
};
pub use error::{ErrorCategory, RelayError, Result};
pub use store::{DataKind, FeatureStore, ItemDescriptor, MemoryFeatureStore};
