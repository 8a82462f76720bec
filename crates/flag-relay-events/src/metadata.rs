//! Request metadata extracted from incoming event posts.
//!
//! Batches that share the same metadata are summarized together; the tuple
//! is the key of the relay's processor map. In practice a given SDK
//! instance sends constant metadata, so the map almost always has one entry.

/// Header carrying the legacy payload schema version. Absent means 1.
pub const EVENT_SCHEMA_HEADER: &str = "X-LaunchDarkly-Event-Schema";
/// Header marking payloads that still need summarization.
pub const UNSUMMARIZED_HEADER: &str = "X-LaunchDarkly-Unsummarized";
/// Opaque tags header, propagated upstream unchanged.
pub const TAGS_HEADER: &str = "X-LaunchDarkly-Tags";

/// The schema version this relay emits upstream.
pub const CURRENT_SCHEMA_VERSION: u32 = 4;

/// The metadata tuple of one incoming event post.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventPayloadMetadata {
    /// Legacy payload schema version; 1 when the header is absent.
    pub schema_version: u32,
    /// Opaque tags to forward upstream, when present.
    pub tags: Option<String>,
}

impl EventPayloadMetadata {
    pub fn new(schema_version: u32, tags: Option<String>) -> Self {
        Self {
            schema_version,
            tags,
        }
    }

    /// Build from raw header values. An unparsable schema header falls back
    /// to version 1, matching the oldest SDKs that never sent it.
    pub fn from_headers(schema: Option<&str>, tags: Option<&str>) -> Self {
        Self {
            schema_version: schema.and_then(|v| v.trim().parse().ok()).unwrap_or(1),
            tags: tags.map(str::to_string),
        }
    }
}

impl Default for EventPayloadMetadata {
    fn default() -> Self {
        Self {
            schema_version: 1,
            tags: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_schema_header_means_version_one() {
        assert_eq!(EventPayloadMetadata::from_headers(None, None).schema_version, 1);
        assert_eq!(EventPayloadMetadata::from_headers(Some("junk"), None).schema_version, 1);
        assert_eq!(EventPayloadMetadata::from_headers(Some("3"), None).schema_version, 3);
    }

    #[test]
    fn distinct_tags_are_distinct_map_keys() {
        let a = EventPayloadMetadata::from_headers(Some("2"), Some("app=web"));
        let b = EventPayloadMetadata::from_headers(Some("2"), Some("app=ios"));
        let c = EventPayloadMetadata::from_headers(Some("2"), Some("app=web"));
        assert_ne!(a, b);
        assert_eq!(a, c);
    }
}
