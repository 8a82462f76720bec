//! Audience kinds and their encoding capabilities.
//!
//! The fan-out engine is polymorphic over four audiences. Rather than a
//! trait object per audience, the capability set is modeled directly on the
//! enum: which credential kind is valid, and how to encode initial snapshots,
//! per-item updates, deletions, and invalidations. The client-side audiences
//! answer every encoding with `ping` — their SDKs re-poll on any change.

use std::sync::Arc;

use flag_relay_core::credential::CredentialKind;
use flag_relay_core::store::{DataKind, ItemDescriptor};

use crate::event::StreamEvent;

/// One of the supported SDK audience classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Audience {
    /// Server-side SDKs on the `/all` stream: full data, current schema.
    ServerSideAll,
    /// Old server-side SDKs on the `/flags` stream: flags only, bare paths.
    ServerSideFlagsOnly,
    /// Mobile SDKs: ping stream.
    MobilePing,
    /// Browser JS SDKs: ping stream.
    JsClientPing,
}

impl Audience {
    pub const ALL: [Audience; 4] = [
        Audience::ServerSideAll,
        Audience::ServerSideFlagsOnly,
        Audience::MobilePing,
        Audience::JsClientPing,
    ];

    /// Whether a credential of the given kind may open this stream.
    pub fn accepts_credential(self, kind: CredentialKind) -> bool {
        match self {
            Audience::ServerSideAll | Audience::ServerSideFlagsOnly => {
                kind == CredentialKind::SdkKey
            }
            Audience::MobilePing => kind == CredentialKind::MobileKey,
            Audience::JsClientPing => kind == CredentialKind::EnvironmentId,
        }
    }

    pub fn is_client_side(self) -> bool {
        matches!(self, Audience::MobilePing | Audience::JsClientPing)
    }

    /// Client-side streams get permissive CORS headers; server-side SDKs
    /// never run in browsers.
    pub fn allow_cors(self) -> bool {
        self.is_client_side()
    }

    /// The initial event for a fresh subscription, given a store snapshot.
    pub fn initial_event(
        self,
        collections: Vec<(DataKind, Vec<(String, ItemDescriptor)>)>,
    ) -> Arc<StreamEvent> {
        match self {
            Audience::ServerSideAll => Arc::new(StreamEvent::server_side_put(collections)),
            Audience::ServerSideFlagsOnly => {
                let flags = collections
                    .into_iter()
                    .find(|(kind, _)| *kind == DataKind::Flag)
                    .map(|(_, items)| items)
                    .unwrap_or_default();
                Arc::new(StreamEvent::flags_only_put(flags))
            }
            Audience::MobilePing | Audience::JsClientPing => Arc::new(StreamEvent::ping()),
        }
    }

    /// The event for a single-item change, or `None` when this audience does
    /// not carry the kind. Tombstones become `delete` events for server-side
    /// audiences; client-side audiences get exactly one `ping` regardless of
    /// kind or deletion.
    pub fn update_event(
        self,
        kind: DataKind,
        key: &str,
        descriptor: &ItemDescriptor,
    ) -> Option<Arc<StreamEvent>> {
        match self {
            Audience::ServerSideAll => Some(Arc::new(match &descriptor.item {
                Some(item) => StreamEvent::server_side_patch(kind, key, item.clone()),
                None => StreamEvent::server_side_delete(kind, key, descriptor.version),
            })),
            Audience::ServerSideFlagsOnly => {
                if kind != DataKind::Flag {
                    return None;
                }
                Some(Arc::new(match &descriptor.item {
                    Some(item) => StreamEvent::flags_only_patch(key, item.clone()),
                    None => StreamEvent::flags_only_delete(key, descriptor.version),
                }))
            }
            Audience::MobilePing | Audience::JsClientPing => Some(Arc::new(StreamEvent::ping())),
        }
    }

    /// The event for an out-of-band change that affects evaluation results
    /// without touching the core data set. Server-side audiences have
    /// nothing to send; client-side audiences re-poll on ping.
    pub fn invalidate_event(self) -> Option<Arc<StreamEvent>> {
        if self.is_client_side() {
            Some(Arc::new(StreamEvent::ping()))
        } else {
            None
        }
    }
}
