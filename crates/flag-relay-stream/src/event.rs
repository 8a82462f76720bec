//! Canonical SSE event bodies for the streaming endpoints.
//!
//! The on-wire formats here are compatibility-critical: server-side SDKs
//! parse `put`/`patch`/`delete` bodies structurally, and the legacy
//! flags-only stream uses bare paths (`/<key>`) and a bare flag map where the
//! current schema nests them under kind names.
//!
//! Encoding is lazy and memoized: one event instance may be fanned out to
//! thousands of subscribers, so the body is computed on the first call to
//! [`StreamEvent::data`] and cached. An event published to zero subscribers
//! is never encoded at all.

use bytes::Bytes;
use once_cell::sync::OnceCell;
use serde_json::{json, Map, Value};

use flag_relay_core::store::{DataKind, ItemDescriptor};

/// One encodable stream event: a name plus a lazily rendered data body.
pub struct StreamEvent {
    name: &'static str,
    payload: Payload,
    data: OnceCell<Bytes>,
    frame: OnceCell<Bytes>,
}

enum Payload {
    /// Full-data `put`: all kinds nested under their API names, tombstones
    /// filtered out, missing kinds rendered as empty objects.
    AllDataPut {
        collections: Vec<(DataKind, Vec<(String, ItemDescriptor)>)>,
    },
    /// Legacy flags-only `put`: a bare flag map; tombstones serialize as
    /// `null` (an empty data field would make SSE clients drop the event,
    /// and old SDKs expect the key to be present).
    FlagsOnlyPut {
        flags: Vec<(String, ItemDescriptor)>,
    },
    Patch {
        path: String,
        data: Value,
    },
    Delete {
        path: String,
        version: u64,
    },
    Ping,
}

impl StreamEvent {
    /// Full-data `put` for the server-side `/all` stream.
    pub fn server_side_put(collections: Vec<(DataKind, Vec<(String, ItemDescriptor)>)>) -> Self {
        Self::new("put", Payload::AllDataPut { collections })
    }

    /// Legacy `put` for the server-side `/flags` stream.
    pub fn flags_only_put(flags: Vec<(String, ItemDescriptor)>) -> Self {
        Self::new("put", Payload::FlagsOnlyPut { flags })
    }

    /// Current-schema `patch`: path is `/<kindApiName>/<key>`.
    pub fn server_side_patch(kind: DataKind, key: &str, data: Value) -> Self {
        Self::new(
            "patch",
            Payload::Patch {
                path: format!("/{}/{}", kind.api_name(), key),
                data,
            },
        )
    }

    /// Legacy flags-only `patch`: path is `/<key>`.
    pub fn flags_only_patch(key: &str, data: Value) -> Self {
        Self::new(
            "patch",
            Payload::Patch {
                path: format!("/{}", key),
                data,
            },
        )
    }

    /// Current-schema `delete`: path is `/<kindApiName>/<key>`.
    pub fn server_side_delete(kind: DataKind, key: &str, version: u64) -> Self {
        Self::new(
            "delete",
            Payload::Delete {
                path: format!("/{}/{}", kind.api_name(), key),
                version,
            },
        )
    }

    /// Legacy flags-only `delete`: path is `/<key>`.
    pub fn flags_only_delete(key: &str, version: u64) -> Self {
        Self::new(
            "delete",
            Payload::Delete {
                path: format!("/{}", key),
                version,
            },
        )
    }

    /// Client-side `ping`. The data field is a literal single space: an
    /// empty data field causes SSE clients to drop the event.
    pub fn ping() -> Self {
        Self::new("ping", Payload::Ping)
    }

    fn new(name: &'static str, payload: Payload) -> Self {
        Self {
            name,
            payload,
            data: OnceCell::new(),
            frame: OnceCell::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The event data body, rendered on first use and cached.
    pub fn data(&self) -> &Bytes {
        self.data.get_or_init(|| self.payload.render())
    }

    /// The complete SSE frame (`event:` + `data:` lines), cached. The
    /// returned `Bytes` clones by reference count, so fan-out to many
    /// subscribers never re-encodes.
    pub fn frame(&self) -> Bytes {
        self.frame
            .get_or_init(|| {
                let data = self.data();
                let mut frame = Vec::with_capacity(self.name.len() + data.len() + 16);
                frame.extend_from_slice(b"event: ");
                frame.extend_from_slice(self.name.as_bytes());
                frame.extend_from_slice(b"\ndata: ");
                frame.extend_from_slice(data);
                frame.extend_from_slice(b"\n\n");
                Bytes::from(frame)
            })
            .clone()
    }

    /// Whether the body has been rendered yet. Test hook for the laziness
    /// contract.
    #[doc(hidden)]
    pub fn is_encoded(&self) -> bool {
        self.data.get().is_some()
    }
}

impl Payload {
    fn render(&self) -> Bytes {
        let body = match self {
            Payload::AllDataPut { collections } => {
                let mut data = Map::new();
                for kind in DataKind::ALL {
                    let items = collections
                        .iter()
                        .find(|(k, _)| *k == kind)
                        .map(|(_, items)| items.as_slice())
                        .unwrap_or(&[]);
                    let mut object = Map::new();
                    for (key, descriptor) in items {
                        if let Some(item) = &descriptor.item {
                            object.insert(key.clone(), item.clone());
                        }
                    }
                    data.insert(kind.api_name().to_string(), Value::Object(object));
                }
                json!({"path": "/", "data": data}).to_string()
            }
            Payload::FlagsOnlyPut { flags } => {
                let mut object = Map::new();
                for (key, descriptor) in flags {
                    object.insert(key.clone(), descriptor.item.clone().unwrap_or(Value::Null));
                }
                Value::Object(object).to_string()
            }
            Payload::Patch { path, data } => json!({"path": path, "data": data}).to_string(),
            Payload::Delete { path, version } => {
                json!({"path": path, "version": version}).to_string()
            }
            Payload::Ping => " ".to_string(),
        };
        Bytes::from(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(event: &StreamEvent) -> Value {
        serde_json::from_slice(event.data()).unwrap()
    }

    #[test]
    fn server_side_put_nests_kinds_and_filters_tombstones() {
        let event = StreamEvent::server_side_put(vec![
            (
                DataKind::Flag,
                vec![
                    ("flag1".into(), ItemDescriptor::new(1, json!({"key": "flag1", "on": true}))),
                    ("gone".into(), ItemDescriptor::tombstone(4)),
                ],
            ),
            (
                DataKind::Segment,
                vec![("seg1".into(), ItemDescriptor::new(2, json!({"key": "seg1"})))],
            ),
        ]);
        assert_eq!(event.name(), "put");

        let body = parse(&event);
        assert_eq!(body["path"], "/");
        assert_eq!(body["data"]["flags"]["flag1"]["on"], json!(true));
        assert!(body["data"]["flags"].get("gone").is_none());
        assert!(body["data"]["segments"]["seg1"].is_object());
        assert_eq!(body["data"]["configurationOverrides"], json!({}));
        assert_eq!(body["data"]["metrics"], json!({}));
    }

    #[test]
    fn flags_only_put_is_a_bare_map_with_null_tombstones() {
        let event = StreamEvent::flags_only_put(vec![
            ("flag1".into(), ItemDescriptor::new(1, json!({"key": "flag1", "on": true}))),
            ("flag2".into(), ItemDescriptor::new(1, json!({"key": "flag2", "on": false}))),
            ("gone".into(), ItemDescriptor::tombstone(9)),
        ]);

        let body = parse(&event);
        assert_eq!(body["flag1"]["on"], json!(true));
        assert_eq!(body["flag2"]["on"], json!(false));
        assert_eq!(body["gone"], Value::Null);
        assert!(body.get("path").is_none());
    }

    #[test]
    fn patch_paths_differ_between_schemas() {
        let current = StreamEvent::server_side_patch(DataKind::Flag, "f1", json!({"version": 2}));
        assert_eq!(parse(&current)["path"], "/flags/f1");

        let metric = StreamEvent::server_side_patch(DataKind::Metric, "m1", json!({}));
        assert_eq!(parse(&metric)["path"], "/metrics/m1");

        let legacy = StreamEvent::flags_only_patch("f1", json!({"version": 2}));
        assert_eq!(parse(&legacy)["path"], "/f1");
    }

    #[test]
    fn delete_carries_version() {
        let event = StreamEvent::server_side_delete(DataKind::Segment, "s1", 7);
        let body = parse(&event);
        assert_eq!(body["path"], "/segments/s1");
        assert_eq!(body["version"], 7);
        assert!(body.get("data").is_none());
    }

    #[test]
    fn ping_data_is_a_single_space() {
        let event = StreamEvent::ping();
        assert_eq!(event.name(), "ping");
        assert_eq!(&event.data()[..], b" ");
        assert_eq!(&event.frame()[..], b"event: ping\ndata:  \n\n");
    }

    #[test]
    fn encoding_is_lazy_and_memoized() {
        let event = StreamEvent::server_side_put(vec![]);
        assert!(!event.is_encoded());

        let first = event.data().clone();
        assert!(event.is_encoded());
        let second = event.data().clone();
        // Memoized: same backing buffer, not a re-render.
        assert_eq!(first.as_ptr(), second.as_ptr());
    }
}
