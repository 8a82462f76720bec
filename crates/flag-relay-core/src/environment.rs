//! Environment, project, and filter identifiers.
//!
//! An *environment* is the unit of isolation: it owns credentials and a data
//! set. A *filter* scopes the data set delivered to an SDK; the default
//! filter is the empty string and means "all data, unfiltered". The pair
//! `(environment id, filter key)` is a *logical environment* — the unit
//! managed by the fan-out engine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::credential::Credential;

/// Unique environment id. Unique across all projects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentId(pub String);

impl EnvironmentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique filter id. Unique across all projects, like environment ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterId(pub String);

impl FilterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Human-readable filter key. The empty string is the default filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterKey(pub String);

impl FilterKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Whether this is the default (unfiltered) key.
    pub fn is_default(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FilterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Project key, grouping environments and filters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectKey(pub String);

impl ProjectKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
}

impl fmt::Display for ProjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A deprecated SDK key that keeps serving existing streams until expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpiringSdkKey {
    pub key: String,
    pub expiry: DateTime<Utc>,
}

/// Parameters describing one environment, as delivered by autoconfiguration.
///
/// `filter_key` is default for the environment itself; the per-filter logical
/// variants are derived with [`EnvironmentParams::with_filter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentParams {
    pub env_id: EnvironmentId,
    pub project_key: ProjectKey,
    pub project_name: String,
    pub env_key: String,
    pub env_name: String,
    pub sdk_key: String,
    #[serde(default)]
    pub expiring_sdk_key: Option<ExpiringSdkKey>,
    #[serde(default)]
    pub mobile_key: Option<String>,
    #[serde(default)]
    pub env_client_id: Option<String>,
    #[serde(default)]
    pub filter_key: FilterKey,
}

impl EnvironmentParams {
    /// The same environment scoped to a payload filter.
    pub fn with_filter(&self, filter_key: FilterKey) -> Self {
        let mut params = self.clone();
        params.filter_key = filter_key;
        params
    }

    /// Logical environment id: `env-id` for the default filter,
    /// `env-id/filter-key` otherwise.
    pub fn logical_id(&self) -> String {
        if self.filter_key.is_default() {
            self.env_id.to_string()
        } else {
            format!("{}/{}", self.env_id, self.filter_key)
        }
    }

    /// All credentials this environment currently owns, including a
    /// still-valid expiring SDK key.
    pub fn credentials(&self) -> Vec<Credential> {
        let mut creds = vec![Credential::SdkKey(self.sdk_key.clone())];
        if let Some(expiring) = &self.expiring_sdk_key {
            if expiring.expiry > Utc::now() {
                creds.push(Credential::SdkKey(expiring.key.clone()));
            }
        }
        if let Some(key) = &self.mobile_key {
            creds.push(Credential::MobileKey(key.clone()));
        }
        if let Some(id) = &self.env_client_id {
            creds.push(Credential::EnvironmentId(id.clone()));
        }
        creds
    }
}

/// Parameters describing one payload filter, as delivered by autoconfiguration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterParams {
    pub id: FilterId,
    pub project_key: ProjectKey,
    pub key: FilterKey,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> EnvironmentParams {
        EnvironmentParams {
            env_id: EnvironmentId::new("env-1"),
            project_key: ProjectKey::new("proj"),
            project_name: "Project".into(),
            env_key: "production".into(),
            env_name: "Production".into(),
            sdk_key: "sdk-key-1".into(),
            expiring_sdk_key: None,
            mobile_key: Some("mob-key-1".into()),
            env_client_id: Some("cid-1".into()),
            filter_key: FilterKey::default(),
        }
    }

    #[test]
    fn logical_id_formats_filtered_variants() {
        let env = params();
        assert_eq!(env.logical_id(), "env-1");
        assert_eq!(env.with_filter(FilterKey::new("foo")).logical_id(), "env-1/foo");
    }

    #[test]
    fn with_filter_only_changes_the_filter() {
        let env = params();
        let filtered = env.with_filter(FilterKey::new("foo"));
        assert_eq!(filtered.env_id, env.env_id);
        assert_eq!(filtered.sdk_key, env.sdk_key);
        assert_eq!(filtered.filter_key, FilterKey::new("foo"));
    }

    #[test]
    fn credentials_cover_all_kinds() {
        let creds = params().credentials();
        assert_eq!(creds.len(), 3);
        assert!(creds.contains(&Credential::SdkKey("sdk-key-1".into())));
        assert!(creds.contains(&Credential::MobileKey("mob-key-1".into())));
        assert!(creds.contains(&Credential::EnvironmentId("cid-1".into())));
    }

    #[test]
    fn expired_sdk_key_is_not_a_credential() {
        let mut env = params();
        env.expiring_sdk_key = Some(ExpiringSdkKey {
            key: "sdk-old".into(),
            expiry: Utc::now() - chrono::Duration::hours(1),
        });
        assert!(!env
            .credentials()
            .contains(&Credential::SdkKey("sdk-old".into())));

        env.expiring_sdk_key = Some(ExpiringSdkKey {
            key: "sdk-old".into(),
            expiry: Utc::now() + chrono::Duration::hours(1),
        });
        assert!(env
            .credentials()
            .contains(&Credential::SdkKey("sdk-old".into())));
    }
}
