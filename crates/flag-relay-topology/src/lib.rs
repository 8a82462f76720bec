//! # Flag Relay Topology
//!
//! The control plane of the relay: reacts to autoconfiguration messages by
//! deciding which logical environments must exist.
//!
//! - [`messages`] — the autoconfig input interface and the downstream action
//!   handler interface
//! - [`manager`] — per-project bookkeeping of default environments and
//!   payload filters, emitting the environment x filter cross-product
//! - [`router`] — dispatches autoconfig messages to the right project
//!   manager, creating managers lazily
//!
//! This layer never touches data or streams; it only issues add/update/
//! delete commands against the handler that owns the data plane.

pub mod manager;
pub mod messages;
pub mod router;

pub use manager::EnvironmentManager;
pub use messages::{ConfigUpdateHandler, EnvironmentActionHandler};
pub use router::ProjectRouter;
