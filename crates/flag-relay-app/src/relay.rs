//! The top-level relay object.
//!
//! [`RelayEnvironments`] owns one store, one stream set, and one event relay
//! per logical environment, and is the action handler the topology layer
//! drives. Everything else reaches environment state by credential lookup;
//! nothing holds owning pointers back into this registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, info, warn};

use flag_relay_core::config::RelayConfig;
use flag_relay_core::credential::Credential;
use flag_relay_core::environment::{EnvironmentId, EnvironmentParams, FilterKey};
use flag_relay_core::error::{RelayError, Result};
use flag_relay_core::store::{DataKind, FeatureStore, ItemDescriptor, MemoryFeatureStore};
use flag_relay_events::relay::EventRelay;
use flag_relay_stream::audience::Audience;
use flag_relay_stream::handlers::StreamHandler;
use flag_relay_stream::stream_set::EnvironmentStreams;
use flag_relay_topology::messages::EnvironmentActionHandler;

/// Creates the data store backing one logical environment.
pub trait StoreFactory: Send + Sync {
    fn create(&self, params: &EnvironmentParams) -> Arc<dyn FeatureStore>;
}

/// Default factory: an in-memory store per logical environment, written by
/// the upstream replication collaborator.
pub struct MemoryStoreFactory;

impl StoreFactory for MemoryStoreFactory {
    fn create(&self, _params: &EnvironmentParams) -> Arc<dyn FeatureStore> {
        Arc::new(MemoryFeatureStore::new())
    }
}

struct EnvironmentState {
    params: EnvironmentParams,
    store: Arc<dyn FeatureStore>,
    streams: Arc<EnvironmentStreams>,
    events: Arc<EventRelay>,
}

/// Owner of all per-environment lifecycles, keyed by logical environment id.
pub struct RelayEnvironments {
    config: RelayConfig,
    client: reqwest::Client,
    store_factory: Arc<dyn StoreFactory>,
    environments: Mutex<HashMap<String, EnvironmentState>>,
    credentials: Mutex<HashMap<Credential, EnvironmentId>>,
    closed: AtomicBool,
}

impl RelayEnvironments {
    pub fn new(config: RelayConfig, store_factory: Arc<dyn StoreFactory>) -> Arc<Self> {
        Arc::new(Self {
            config,
            client: reqwest::Client::new(),
            store_factory,
            environments: Mutex::new(HashMap::new()),
            credentials: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn logical_key(env_id: &EnvironmentId, filter: &FilterKey) -> String {
        if filter.is_default() {
            env_id.to_string()
        } else {
            format!("{}/{}", env_id, filter)
        }
    }

    fn state_for(
        &self,
        credential: &Credential,
        filter: &FilterKey,
    ) -> Option<(Arc<EnvironmentStreams>, Arc<EventRelay>)> {
        let env_id = {
            let credentials = self.credentials.lock().expect("credential index poisoned");
            credentials.get(credential).cloned()?
        };
        let key = Self::logical_key(&env_id, filter);
        let environments = self.environments.lock().expect("environment map poisoned");
        let state = environments.get(&key)?;
        Some((Arc::clone(&state.streams), Arc::clone(&state.events)))
    }

    /// Resolve a credential to its environment state, distinguishing the
    /// failure modes: a key known under another kind is a kind mismatch
    /// ("not my endpoint", a 404), an unknown key fails authorization, and
    /// a known key with an unknown filter never had that logical variant.
    fn resolve_state(
        &self,
        credential: &Credential,
        filter: &FilterKey,
    ) -> Result<(Arc<EnvironmentStreams>, Arc<EventRelay>)> {
        if let Some(state) = self.state_for(credential, filter) {
            return Ok(state);
        }
        let (same_kind, other_kind) = {
            let credentials = self.credentials.lock().expect("credential index poisoned");
            (
                credentials.contains_key(credential),
                credentials.keys().any(|known| {
                    known.auth_value() == credential.auth_value()
                        && known.kind() != credential.kind()
                }),
            )
        };
        if same_kind {
            Err(RelayError::precondition(format!(
                "no environment for filter '{}'",
                filter
            )))
        } else if other_kind {
            Err(RelayError::CredentialKindMismatch)
        } else {
            Err(RelayError::Unauthorized)
        }
    }

    /// The SSE handler for an audience. Kind mismatches and unknown filters
    /// surface as 404, unknown credentials as 401.
    pub fn stream_handler(
        &self,
        audience: Audience,
        credential: &Credential,
        filter: &FilterKey,
    ) -> Result<StreamHandler> {
        let (streams, _) = self.resolve_state(credential, filter)?;
        streams
            .handler(audience, credential)
            .ok_or(RelayError::CredentialKindMismatch)
    }

    /// The event relay for a posting credential's environment.
    pub fn events_relay(&self, credential: &Credential) -> Result<Arc<EventRelay>> {
        let (_, events) = self.resolve_state(credential, &FilterKey::default())?;
        Ok(events)
    }

    /// The data store for a credential's environment, for the replication
    /// collaborator and diagnostics.
    pub fn store_for(&self, credential: &Credential) -> Option<Arc<dyn FeatureStore>> {
        let env_id = {
            let credentials = self.credentials.lock().expect("credential index poisoned");
            credentials.get(credential).cloned()?
        };
        let environments = self.environments.lock().expect("environment map poisoned");
        environments
            .get(&env_id.to_string())
            .map(|state| Arc::clone(&state.store))
    }

    fn streams_for_env(&self, env_id: &EnvironmentId) -> Vec<Arc<EnvironmentStreams>> {
        let environments = self.environments.lock().expect("environment map poisoned");
        environments
            .values()
            .filter(|state| state.params.env_id == *env_id)
            .map(|state| Arc::clone(&state.streams))
            .collect()
    }

    /// Fan a full data set out to every logical variant of an environment.
    pub fn push_all_data(
        &self,
        env_id: &EnvironmentId,
        collections: &[(DataKind, Vec<(String, ItemDescriptor)>)],
    ) {
        for streams in self.streams_for_env(env_id) {
            streams.send_all_data_update(collections);
        }
    }

    /// Fan a single-item change out to every logical variant.
    pub fn push_item_update(
        &self,
        env_id: &EnvironmentId,
        kind: DataKind,
        key: &str,
        descriptor: &ItemDescriptor,
    ) {
        for streams in self.streams_for_env(env_id) {
            streams.send_single_item_update(kind, key, descriptor);
        }
    }

    /// Ping client-side audiences of every logical variant.
    pub fn invalidate_client_side(&self, env_id: &EnvironmentId) {
        for streams in self.streams_for_env(env_id) {
            streams.invalidate_client_side_state();
        }
    }

    pub fn environment_count(&self) -> usize {
        self.environments.lock().expect("environment map poisoned").len()
    }

    /// Tear down every environment. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let states: Vec<EnvironmentState> = {
            let mut environments = self.environments.lock().expect("environment map poisoned");
            environments.drain().map(|(_, state)| state).collect()
        };
        self.credentials
            .lock()
            .expect("credential index poisoned")
            .clear();
        for state in states {
            state.streams.close().await;
            state.events.close().await;
        }
        info!("relay environments closed");
    }

    fn index_credentials(&self, params: &EnvironmentParams) {
        let mut credentials = self.credentials.lock().expect("credential index poisoned");
        for credential in params.credentials() {
            credentials.entry(credential).or_insert_with(|| params.env_id.clone());
        }
    }

    fn unindex_credentials(&self, params: &EnvironmentParams) {
        let mut credentials = self.credentials.lock().expect("credential index poisoned");
        for credential in params.credentials() {
            credentials.remove(&credential);
        }
    }

    /// Apply a credential transition for one kind on an updated environment.
    fn apply_rotation(
        &self,
        streams: &EnvironmentStreams,
        env_id: &EnvironmentId,
        old: Option<Credential>,
        new: Option<Credential>,
        keep_old: bool,
    ) {
        let mut credentials = self.credentials.lock().expect("credential index poisoned");
        match (old, new) {
            (Some(old), Some(new)) if old != new => {
                if keep_old {
                    // The deprecated key keeps serving until expiry.
                    streams.add_credential(&new);
                } else {
                    streams.replace_credential(&new);
                    credentials.remove(&old);
                }
                credentials.insert(new, env_id.clone());
            }
            (None, Some(new)) => {
                streams.add_credential(&new);
                credentials.insert(new, env_id.clone());
            }
            (Some(old), None) => {
                streams.remove_credential(&old);
                credentials.remove(&old);
            }
            _ => {}
        }
    }
}

impl EnvironmentActionHandler for RelayEnvironments {
    fn add_environment(&self, params: EnvironmentParams) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let key = params.logical_id();
        let mut environments = self.environments.lock().expect("environment map poisoned");
        if environments.contains_key(&key) {
            debug!(env = %key, "environment already exists, ignoring add");
            return;
        }

        let store = self.store_factory.create(&params);
        let streams = EnvironmentStreams::new(
            params.filter_key.clone(),
            Arc::clone(&store),
            self.config.stream.clone(),
        );
        for credential in params.credentials() {
            streams.add_credential(&credential);
        }
        let events = EventRelay::new(
            Arc::clone(&store),
            Credential::SdkKey(params.sdk_key.clone()),
            self.config.events.clone(),
            self.client.clone(),
        );

        info!(env = %key, "environment added");
        environments.insert(
            key,
            EnvironmentState {
                params: params.clone(),
                store,
                streams,
                events,
            },
        );
        drop(environments);
        self.index_credentials(&params);
    }

    fn update_environment(&self, params: EnvironmentParams) {
        let key = params.logical_id();
        let (old, streams, events) = {
            let mut environments = self.environments.lock().expect("environment map poisoned");
            let Some(state) = environments.get_mut(&key) else {
                warn!(env = %key, "update for unknown environment, ignoring");
                return;
            };
            let old = std::mem::replace(&mut state.params, params.clone());
            (old, Arc::clone(&state.streams), Arc::clone(&state.events))
        };

        // SDK key rotation: the old key keeps serving when the update names
        // it as a still-valid expiring key.
        let keep_old_sdk = params.expiring_sdk_key.as_ref().is_some_and(|expiring| {
            expiring.key == old.sdk_key && expiring.expiry > Utc::now()
        });
        if old.sdk_key != params.sdk_key {
            self.apply_rotation(
                &streams,
                &params.env_id,
                Some(Credential::SdkKey(old.sdk_key.clone())),
                Some(Credential::SdkKey(params.sdk_key.clone())),
                keep_old_sdk,
            );
            events.replace_credential(&Credential::SdkKey(params.sdk_key.clone()));
        }
        self.apply_rotation(
            &streams,
            &params.env_id,
            old.mobile_key.clone().map(Credential::MobileKey),
            params.mobile_key.clone().map(Credential::MobileKey),
            false,
        );
        self.apply_rotation(
            &streams,
            &params.env_id,
            old.env_client_id.clone().map(Credential::EnvironmentId),
            params.env_client_id.clone().map(Credential::EnvironmentId),
            false,
        );
        info!(env = %key, "environment updated");
    }

    fn delete_environment(&self, env_id: &EnvironmentId, filter: &FilterKey) {
        let key = Self::logical_key(env_id, filter);
        let state = {
            let mut environments = self.environments.lock().expect("environment map poisoned");
            environments.remove(&key)
        };
        let Some(state) = state else {
            debug!(env = %key, "delete for unknown environment, ignoring");
            return;
        };
        if filter.is_default() {
            self.unindex_credentials(&state.params);
        }
        info!(env = %key, "environment deleted");
        // Closure drains tickers and subscribers; it does not need to block
        // the autoconfig message loop.
        tokio::spawn(async move {
            state.streams.close().await;
            state.events.close().await;
        });
    }

    fn key_expired(&self, env_id: &EnvironmentId, filter: &FilterKey, key: Credential) {
        let key_name = Self::logical_key(env_id, filter);
        let streams = {
            let mut environments = self.environments.lock().expect("environment map poisoned");
            let Some(state) = environments.get_mut(&key_name) else {
                debug!(env = %key_name, "key expiry for unknown environment, ignoring");
                return;
            };
            if state
                .params
                .expiring_sdk_key
                .as_ref()
                .is_some_and(|expiring| expiring.key == key.auth_value())
            {
                state.params.expiring_sdk_key = None;
            }
            Arc::clone(&state.streams)
        };
        streams.remove_credential(&key);
        if filter.is_default() {
            self.credentials
                .lock()
                .expect("credential index poisoned")
                .remove(&key);
        }
        info!(env = %key_name, credential = %key, "expired credential removed");
    }

    fn received_all_environments(&self) {
        info!(
            environments = self.environment_count(),
            "received full environment set from configuration source"
        );
    }
}
