//! Per-project environment and filter bookkeeping.
//!
//! For N default environments and K active filters the manager maintains
//! N x (K + 1) logical environments: every default, plus every default
//! scoped to every filter. Adding a filter fans out one add per existing
//! environment; adding an environment fans out one add per existing filter.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use flag_relay_core::credential::Credential;
use flag_relay_core::environment::{
    EnvironmentId, EnvironmentParams, FilterId, FilterKey, FilterParams, ProjectKey,
};

use crate::messages::EnvironmentActionHandler;

struct FilterState {
    key: FilterKey,
    env_ids: HashSet<EnvironmentId>,
}

/// Tracks one project's default environments and filters, emitting
/// cross-product commands to the action handler.
pub struct EnvironmentManager {
    project_key: ProjectKey,
    defaults: HashMap<EnvironmentId, EnvironmentParams>,
    filters: HashMap<FilterId, FilterState>,
    handler: Arc<dyn EnvironmentActionHandler>,
}

impl EnvironmentManager {
    pub fn new(project_key: ProjectKey, handler: Arc<dyn EnvironmentActionHandler>) -> Self {
        Self {
            project_key,
            defaults: HashMap::new(),
            filters: HashMap::new(),
            handler,
        }
    }

    pub fn project_key(&self) -> &ProjectKey {
        &self.project_key
    }

    /// Register a new default environment and its per-filter variants.
    /// Adding the same environment twice is a no-op.
    pub fn add_environment(&mut self, params: EnvironmentParams) {
        if self.defaults.contains_key(&params.env_id) {
            debug!(env = %params.env_id, "environment already managed, ignoring add");
            return;
        }
        self.defaults.insert(params.env_id.clone(), params.clone());
        self.handler.add_environment(params.clone());
        for filter in self.filters.values_mut() {
            filter.env_ids.insert(params.env_id.clone());
            self.handler
                .add_environment(params.with_filter(filter.key.clone()));
        }
    }

    /// Propagate a parameter change to the default and every filtered
    /// variant. Unknown environments are ignored.
    pub fn update_environment(&mut self, params: EnvironmentParams) {
        if !self.defaults.contains_key(&params.env_id) {
            warn!(env = %params.env_id, "update for unmanaged environment, ignoring");
            return;
        }
        self.defaults.insert(params.env_id.clone(), params.clone());
        self.handler.update_environment(params.clone());
        for filter in self.filters.values() {
            self.handler
                .update_environment(params.with_filter(filter.key.clone()));
        }
    }

    /// Remove an environment and every filtered variant. Returns whether
    /// this manager knew the environment.
    pub fn delete_environment(&mut self, env_id: &EnvironmentId) -> bool {
        if self.defaults.remove(env_id).is_none() {
            return false;
        }
        self.handler.delete_environment(env_id, &FilterKey::default());
        for filter in self.filters.values_mut() {
            self.handler.delete_environment(env_id, &filter.key);
            filter.env_ids.remove(env_id);
        }
        true
    }

    /// Register a new filter: one additional logical environment per
    /// existing default. Adding the same filter twice is a no-op.
    pub fn add_filter(&mut self, params: FilterParams) {
        if self.filters.contains_key(&params.id) {
            debug!(filter = %params.id, "filter already managed, ignoring add");
            return;
        }
        let mut env_ids = HashSet::new();
        for env in self.defaults.values() {
            env_ids.insert(env.env_id.clone());
            self.handler.add_environment(env.with_filter(params.key.clone()));
        }
        self.filters.insert(
            params.id,
            FilterState {
                key: params.key,
                env_ids,
            },
        );
    }

    /// Remove a filter and every logical environment it produced. Returns
    /// whether this manager knew the filter.
    pub fn delete_filter(&mut self, filter_id: &FilterId) -> bool {
        let Some(filter) = self.filters.remove(filter_id) else {
            return false;
        };
        for env_id in &filter.env_ids {
            self.handler.delete_environment(env_id, &filter.key);
        }
        true
    }

    /// A credential expired: notify the default and every filtered variant.
    pub fn key_expired(&self, env_id: &EnvironmentId, key: Credential) {
        self.handler
            .key_expired(env_id, &FilterKey::default(), key.clone());
        for filter in self.filters.values() {
            self.handler.key_expired(env_id, &filter.key, key.clone());
        }
    }

    /// Snapshot of all logical environment ids under management, sorted.
    pub fn environments(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .defaults
            .values()
            .map(EnvironmentParams::logical_id)
            .collect();
        for filter in self.filters.values() {
            for env_id in &filter.env_ids {
                ids.push(format!("{}/{}", env_id, filter.key));
            }
        }
        ids.sort();
        ids
    }

    /// Snapshot of the active filter keys, sorted.
    pub fn filters(&self) -> Vec<FilterKey> {
        let mut keys: Vec<FilterKey> = self.filters.values().map(|f| f.key.clone()).collect();
        keys.sort();
        keys
    }
}
