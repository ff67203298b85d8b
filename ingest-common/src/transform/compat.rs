//! Detection of legacy payload shapes, reported alongside outward-facing responses. The report
//! is additive metadata only and never changes what the transformer produces.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{CollectionNames, LegacyShape, RecordKind, CREATED_AT, LEGACY_CREATED_AT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaRevision {
    Legacy,
    Current,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityReport {
    pub revision: SchemaRevision,
    pub legacy_shapes: Vec<LegacyShape>,
    pub deprecated_fields: Vec<String>,
    pub migration_available: bool,
}

impl CompatibilityReport {
    fn from_findings(legacy_shapes: Vec<LegacyShape>, deprecated_fields: Vec<String>) -> Self {
        let migration_available = !legacy_shapes.is_empty();
        Self {
            revision: if migration_available {
                SchemaRevision::Legacy
            } else {
                SchemaRevision::Current
            },
            legacy_shapes,
            deprecated_fields,
            migration_available,
        }
    }
}

/// Constructed per consumer and passed to whatever needs it. Holds no mutable state.
#[derive(Debug, Clone)]
pub struct SchemaCompatibilityService {
    collections: CollectionNames,
}

impl SchemaCompatibilityService {
    pub fn new(namespace: &str) -> Self {
        Self {
            collections: CollectionNames::new(namespace),
        }
    }

    pub fn detect(&self, collection: &str, payload: &Value) -> CompatibilityReport {
        let Value::Object(fields) = payload else {
            return CompatibilityReport::from_findings(Vec::new(), Vec::new());
        };

        let mut shapes = Vec::new();
        let mut deprecated = Vec::new();

        match self.collections.kind_of(collection) {
            RecordKind::Post => {
                if is_string(fields, "text") {
                    shapes.push(LegacyShape::StringText);
                }
                if uses_legacy_timestamp(fields) {
                    shapes.push(LegacyShape::SnakeCaseTimestamp);
                }
                if is_string(fields, "tags") {
                    shapes.push(LegacyShape::CommaSeparatedTags);
                }
                if !has(fields, "langs") && is_string(fields, "lang") {
                    shapes.push(LegacyShape::SingleLang);
                }
                if !has(fields, "reply") && is_string(fields, "replyTo") {
                    shapes.push(LegacyShape::ReplyToString);
                }
                if has(fields, "entities") {
                    deprecated.push("entities".to_owned());
                }
            }
            RecordKind::Profile => {
                if is_string(fields, "description") {
                    shapes.push(LegacyShape::StringDescription);
                }
                if uses_legacy_timestamp(fields) {
                    shapes.push(LegacyShape::SnakeCaseTimestamp);
                }
                if has(fields, "avatarUrl") {
                    deprecated.push("avatarUrl".to_owned());
                }
            }
            RecordKind::Follow => {
                if uses_legacy_timestamp(fields) {
                    shapes.push(LegacyShape::SnakeCaseTimestamp);
                }
            }
            RecordKind::Other => {}
        }

        CompatibilityReport::from_findings(shapes, deprecated)
    }
}

fn has(fields: &Map<String, Value>, key: &str) -> bool {
    !matches!(fields.get(key), None | Some(Value::Null))
}

fn is_string(fields: &Map<String, Value>, key: &str) -> bool {
    matches!(fields.get(key), Some(Value::String(_)))
}

fn uses_legacy_timestamp(fields: &Map<String, Value>) -> bool {
    !has(fields, CREATED_AT) && has(fields, LEGACY_CREATED_AT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::RecordTransformer;
    use crate::types::RecordRef;
    use serde_json::json;

    fn service() -> SchemaCompatibilityService {
        SchemaCompatibilityService::new("pub.example")
    }

    #[test]
    fn test_current_post_is_current() {
        let report = service().detect(
            "pub.example.post",
            &json!({"text": [{"$type": "text", "text": "hi"}], "createdAt": "2024-05-01T12:00:00Z"}),
        );

        assert_eq!(report.revision, SchemaRevision::Current);
        assert!(report.legacy_shapes.is_empty());
        assert!(!report.migration_available);
    }

    #[test]
    fn test_legacy_post() {
        let report = service().detect(
            "pub.example.post",
            &json!({
                "text": "hi",
                "created_at": "2024-05-01T12:00:00Z",
                "entities": [{"type": "mention"}]
            }),
        );

        assert_eq!(report.revision, SchemaRevision::Legacy);
        assert_eq!(
            report.legacy_shapes,
            vec![LegacyShape::StringText, LegacyShape::SnakeCaseTimestamp]
        );
        assert_eq!(report.deprecated_fields, vec!["entities"]);
        assert!(report.migration_available);
    }

    #[test]
    fn test_deprecated_field_alone_needs_no_migration() {
        let report = service().detect(
            "pub.example.profile",
            &json!({"displayName": "Alice", "avatarUrl": "https://cdn.example.com/a.png"}),
        );

        assert_eq!(report.revision, SchemaRevision::Current);
        assert_eq!(report.deprecated_fields, vec!["avatarUrl"]);
        assert!(!report.migration_available);
    }

    #[test]
    fn test_agrees_with_transformer_provenance() {
        let payload = json!({
            "text": "hi",
            "created_at": "2024-05-01T12:00:00Z",
            "tags": "a,b",
            "lang": "en",
            "replyTo": "at://did:plc:bob/pub.example.post/1"
        });
        let target = RecordRef {
            repo: "did:plc:alice".to_owned(),
            collection: "pub.example.post".to_owned(),
            rkey: "1".to_owned(),
        };

        let record = RecordTransformer::new("pub.example")
            .transform(&target, &payload, "bafy")
            .unwrap();
        let report = service().detect("pub.example.post", &payload);

        assert_eq!(report.legacy_shapes, record.source_shapes);
    }

    #[test]
    fn test_non_object_and_unmodelled() {
        assert_eq!(
            service().detect("pub.example.post", &json!("text")).revision,
            SchemaRevision::Current
        );
        assert!(service()
            .detect("pub.example.widget", &json!({"text": "legacy?"}))
            .legacy_shapes
            .is_empty());
    }
}
