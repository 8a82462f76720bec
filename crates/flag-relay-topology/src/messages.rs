//! The two interfaces the topology layer sits between.
//!
//! Autoconfiguration messages arrive through [`ConfigUpdateHandler`]; the
//! topology layer turns them into per-logical-environment commands on an
//! [`EnvironmentActionHandler`]. Callers must serialize messages for a
//! single project; messages for different projects may be concurrent.

use flag_relay_core::credential::Credential;
use flag_relay_core::environment::{
    EnvironmentId, EnvironmentParams, FilterId, FilterKey, FilterParams,
};

/// The autoconfig message interface: what the upstream configuration source
/// calls into.
pub trait ConfigUpdateHandler: Send + Sync {
    fn add_environment(&self, params: EnvironmentParams);
    fn update_environment(&self, params: EnvironmentParams);
    fn delete_environment(&self, env_id: &EnvironmentId);
    fn add_filter(&self, params: FilterParams);
    fn delete_filter(&self, filter_id: &FilterId);
    /// The configuration source has delivered its full environment set.
    fn received_all_environments(&self);
}

/// The downstream command interface: what actually owns per-environment
/// state (stream sets, event relays) and reacts to topology changes.
///
/// Implementations must be thread-safe; commands for different projects may
/// arrive concurrently.
pub trait EnvironmentActionHandler: Send + Sync {
    /// A logical environment (default or filtered) came into existence.
    fn add_environment(&self, params: EnvironmentParams);
    /// A logical environment's parameters changed (names, credentials).
    fn update_environment(&self, params: EnvironmentParams);
    /// A logical environment went away.
    fn delete_environment(&self, env_id: &EnvironmentId, filter: &FilterKey);
    /// A deprecated credential reached its expiry and must stop serving.
    fn key_expired(&self, env_id: &EnvironmentId, filter: &FilterKey, key: Credential);
    /// Forwarded unchanged from the autoconfig source.
    fn received_all_environments(&self);
}
