//! Credentials and filter-scoped credentials.
//!
//! Every environment owns up to three credentials, one per SDK audience
//! class. A credential paired with a payload-filter key forms a
//! [`ScopedCredential`], the unit of routing for SDK streams: the same SDK
//! key under two different filters addresses two distinct logical endpoints.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::environment::FilterKey;

/// The class of a credential, which determines the audiences it can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CredentialKind {
    /// Server-side SDK key (`sdk-...`).
    SdkKey,
    /// Mobile SDK key (`mob-...`).
    MobileKey,
    /// Client-side environment id, passed in URLs rather than headers.
    EnvironmentId,
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CredentialKind::SdkKey => "sdk-key",
            CredentialKind::MobileKey => "mobile-key",
            CredentialKind::EnvironmentId => "environment-id",
        };
        f.write_str(name)
    }
}

/// A credential presented by an SDK to identify its environment.
///
/// `Display` and `Debug` mask the key material; use [`Credential::auth_value`]
/// for the raw value when constructing upstream requests or map keys.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Credential {
    SdkKey(String),
    MobileKey(String),
    EnvironmentId(String),
}

impl Credential {
    pub fn kind(&self) -> CredentialKind {
        match self {
            Credential::SdkKey(_) => CredentialKind::SdkKey,
            Credential::MobileKey(_) => CredentialKind::MobileKey,
            Credential::EnvironmentId(_) => CredentialKind::EnvironmentId,
        }
    }

    /// The raw credential value, as sent in `Authorization` headers.
    pub fn auth_value(&self) -> &str {
        match self {
            Credential::SdkKey(v) | Credential::MobileKey(v) | Credential::EnvironmentId(v) => v,
        }
    }

    /// Masked rendering safe for logs: everything but the last four
    /// characters is elided. Environment ids are not secret and render
    /// in full.
    pub fn masked(&self) -> String {
        match self {
            Credential::EnvironmentId(v) => v.clone(),
            Credential::SdkKey(v) | Credential::MobileKey(v) => {
                if v.len() <= 4 {
                    "****".to_string()
                } else {
                    format!("****{}", &v[v.len() - 4..])
                }
            }
        }
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind(), self.masked())
    }
}

/// A credential scoped to a payload filter.
///
/// Two scoped credentials with the same credential but different filter keys
/// are distinct logical endpoints. The string form appends `/<filter-key>`
/// for non-default filters; `/` is not a legal character in either half.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ScopedCredential {
    pub credential: Credential,
    pub filter: FilterKey,
}

impl ScopedCredential {
    pub fn new(credential: Credential, filter: FilterKey) -> Self {
        Self { credential, filter }
    }

    /// An unfiltered scope for the credential.
    pub fn unfiltered(credential: Credential) -> Self {
        Self {
            credential,
            filter: FilterKey::default(),
        }
    }

    /// The full routing key, containing raw key material. Not for logs.
    pub fn routing_key(&self) -> String {
        if self.filter.is_default() {
            self.credential.auth_value().to_string()
        } else {
            format!("{}/{}", self.credential.auth_value(), self.filter)
        }
    }

    pub fn masked(&self) -> String {
        if self.filter.is_default() {
            self.credential.masked()
        } else {
            format!("{}/{}", self.credential.masked(), self.filter)
        }
    }
}

impl fmt::Display for ScopedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked())
    }
}

impl fmt::Debug for ScopedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked())
    }
}
