//! # Transform
//!
//! Turns raw record payloads, in any shape that was ever valid, into one canonical current-shape
//! record. Required fields are checked before anything else so that a record missing one fails
//! the same way whichever schema revision it otherwise looks like.
//!
//! Transforms are pure: the same payload always yields the same record.
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::filter::namespace_prefix;
use crate::metrics_consts::LEGACY_SHAPES;
use crate::types::RecordRef;

pub mod compat;
pub mod text;

pub use compat::{CompatibilityReport, SchemaCompatibilityService, SchemaRevision};
pub use text::{RichText, TextSegment, TextSource};

use text::type_name;

const CREATED_AT: &str = "createdAt";
const LEGACY_CREATED_AT: &str = "created_at";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("{collection} record is not a JSON object")]
    NotAnObject { collection: String },
    #[error("{collection} record is missing required field {field}")]
    MissingField {
        collection: String,
        field: &'static str,
    },
    #[error("{collection} record has invalid {field}: {reason}")]
    InvalidField {
        collection: String,
        field: &'static str,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Post,
    Profile,
    Follow,
    Other,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Post => "post",
            RecordKind::Profile => "profile",
            RecordKind::Follow => "follow",
            RecordKind::Other => "other",
        }
    }
}

/// Historical payload shapes we still accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegacyShape {
    /// Post `text` as a bare string instead of inline elements.
    StringText,
    /// Profile `description` as a bare string instead of inline elements.
    StringDescription,
    /// `created_at` instead of `createdAt`.
    SnakeCaseTimestamp,
    /// `tags` as one comma separated string.
    CommaSeparatedTags,
    /// A single `lang` string instead of a `langs` list.
    SingleLang,
    /// `replyTo` string instead of a `reply` object.
    ReplyToString,
}

impl LegacyShape {
    pub fn as_str(&self) -> &'static str {
        match self {
            LegacyShape::StringText => "string_text",
            LegacyShape::StringDescription => "string_description",
            LegacyShape::SnakeCaseTimestamp => "snake_case_timestamp",
            LegacyShape::CommaSeparatedTags => "comma_separated_tags",
            LegacyShape::SingleLang => "single_lang",
            LegacyShape::ReplyToString => "reply_to_string",
        }
    }
}

impl fmt::Display for LegacyShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub text: RichText,
    pub tags: Vec<String>,
    pub langs: Vec<String>,
    pub reply_parent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub display_name: String,
    pub description: Option<RichText>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Follow {
    pub subject: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordBody {
    Post(Post),
    Profile(Profile),
    Follow(Follow),
    /// A collection under our namespace that we do not model. Kept as-is.
    Other { value: Value },
}

/// A record in its current shape, ready for the sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub uri: String,
    pub repo: String,
    pub collection: String,
    pub rkey: String,
    pub cid: String,
    pub body: RecordBody,
    /// Plain text projection used by search.
    pub text: String,
    pub created_at: Option<DateTime<Utc>>,
    /// Legacy shapes found in the source payload. Provenance only.
    pub source_shapes: Vec<LegacyShape>,
}

impl CanonicalRecord {
    pub fn kind(&self) -> RecordKind {
        match self.body {
            RecordBody::Post(_) => RecordKind::Post,
            RecordBody::Profile(_) => RecordKind::Profile,
            RecordBody::Follow(_) => RecordKind::Follow,
            RecordBody::Other { .. } => RecordKind::Other,
        }
    }

    pub fn target(&self) -> RecordRef {
        RecordRef {
            repo: self.repo.clone(),
            collection: self.collection.clone(),
            rkey: self.rkey.clone(),
        }
    }
}

/// Full collection names for the kinds we model under one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionNames {
    post: String,
    profile: String,
    follow: String,
}

impl CollectionNames {
    pub fn new(namespace: &str) -> Self {
        let prefix = namespace_prefix(namespace);
        Self {
            post: format!("{prefix}post"),
            profile: format!("{prefix}profile"),
            follow: format!("{prefix}follow"),
        }
    }

    pub fn kind_of(&self, collection: &str) -> RecordKind {
        if collection == self.post {
            RecordKind::Post
        } else if collection == self.profile {
            RecordKind::Profile
        } else if collection == self.follow {
            RecordKind::Follow
        } else {
            RecordKind::Other
        }
    }
}

/// Required fields per kind, each with the keys it may appear under.
const POST_FIELDS: &[(&str, &[&str])] = &[
    ("text", &["text"]),
    (CREATED_AT, &[CREATED_AT, LEGACY_CREATED_AT]),
];
const PROFILE_FIELDS: &[(&str, &[&str])] = &[("displayName", &["displayName"])];
const FOLLOW_FIELDS: &[(&str, &[&str])] = &[
    ("subject", &["subject"]),
    (CREATED_AT, &[CREATED_AT, LEGACY_CREATED_AT]),
];

fn required_fields(kind: RecordKind) -> &'static [(&'static str, &'static [&'static str])] {
    match kind {
        RecordKind::Post => POST_FIELDS,
        RecordKind::Profile => PROFILE_FIELDS,
        RecordKind::Follow => FOLLOW_FIELDS,
        RecordKind::Other => &[],
    }
}

#[derive(Debug, Clone)]
pub struct RecordTransformer {
    collections: CollectionNames,
}

impl RecordTransformer {
    pub fn new(namespace: &str) -> Self {
        Self {
            collections: CollectionNames::new(namespace),
        }
    }

    pub fn kind_of(&self, collection: &str) -> RecordKind {
        self.collections.kind_of(collection)
    }

    pub fn transform(
        &self,
        target: &RecordRef,
        payload: &Value,
        cid: &str,
    ) -> Result<CanonicalRecord, TransformError> {
        let collection = target.collection.as_str();
        let Value::Object(fields) = payload else {
            return Err(TransformError::NotAnObject {
                collection: collection.to_owned(),
            });
        };

        let kind = self.kind_of(collection);

        for &(field, keys) in required_fields(kind) {
            if !keys.iter().any(|key| present(fields, key)) {
                return Err(TransformError::MissingField {
                    collection: collection.to_owned(),
                    field,
                });
            }
        }

        let mut reader = FieldReader {
            collection,
            fields,
            shapes: Vec::new(),
        };

        let (body, text, created_at) = match kind {
            RecordKind::Post => reader.post()?,
            RecordKind::Profile => reader.profile()?,
            RecordKind::Follow => reader.follow()?,
            RecordKind::Other => reader.other(),
        };

        for shape in &reader.shapes {
            metrics::counter!(LEGACY_SHAPES, "shape" => shape.as_str()).increment(1);
        }

        Ok(CanonicalRecord {
            uri: target.uri(),
            repo: target.repo.clone(),
            collection: collection.to_owned(),
            rkey: target.rkey.clone(),
            cid: cid.to_owned(),
            body,
            text,
            created_at,
            source_shapes: reader.shapes,
        })
    }
}

fn present(fields: &Map<String, Value>, key: &str) -> bool {
    !matches!(fields.get(key), None | Some(Value::Null))
}

struct FieldReader<'a> {
    collection: &'a str,
    fields: &'a Map<String, Value>,
    shapes: Vec<LegacyShape>,
}

type Parsed = (RecordBody, String, Option<DateTime<Utc>>);

impl<'a> FieldReader<'a> {
    fn post(&mut self) -> Result<Parsed, TransformError> {
        let text = self.rich_text("text", LegacyShape::StringText)?.unwrap_or_default();
        let created_at = self.created_at()?;
        let tags = self.tags()?;
        let langs = self.langs()?;
        let reply_parent = self.reply_parent()?;

        let projection = text.plain_text();
        let body = RecordBody::Post(Post {
            text,
            tags,
            langs,
            reply_parent,
        });

        Ok((body, projection, created_at))
    }

    fn profile(&mut self) -> Result<Parsed, TransformError> {
        let display_name = self.string("displayName")?.unwrap_or_default();
        let description = self.rich_text("description", LegacyShape::StringDescription)?;
        let created_at = self.created_at()?;

        let mut projection = display_name.clone();
        if let Some(description) = &description {
            let description = description.plain_text();
            if !description.is_empty() {
                projection.push('\n');
                projection.push_str(&description);
            }
        }

        let body = RecordBody::Profile(Profile {
            display_name,
            description,
        });

        Ok((body, projection, created_at))
    }

    fn follow(&mut self) -> Result<Parsed, TransformError> {
        let subject = self.string("subject")?.unwrap_or_default();
        let created_at = self.created_at()?;

        Ok((RecordBody::Follow(Follow { subject }), String::new(), created_at))
    }

    /// Unmodelled collections never fail: we keep what we can use and the raw value.
    fn other(&mut self) -> Parsed {
        let projection = self
            .fields
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let created_at = self.created_at().ok().flatten();

        (
            RecordBody::Other {
                value: Value::Object(self.fields.clone()),
            },
            projection,
            created_at,
        )
    }

    fn invalid(&self, field: &'static str, reason: impl Into<String>) -> TransformError {
        TransformError::InvalidField {
            collection: self.collection.to_owned(),
            field,
            reason: reason.into(),
        }
    }

    fn note(&mut self, shape: LegacyShape) {
        if !self.shapes.contains(&shape) {
            self.shapes.push(shape);
        }
    }

    fn get(&self, key: &str) -> Option<&'a Value> {
        match self.fields.get(key) {
            None | Some(Value::Null) => None,
            Some(value) => Some(value),
        }
    }

    fn string(&self, field: &'static str) -> Result<Option<String>, TransformError> {
        match self.get(field) {
            None => Ok(None),
            Some(Value::String(value)) => Ok(Some(value.clone())),
            Some(other) => Err(self.invalid(field, format!("expected a string, got {}", type_name(other)))),
        }
    }

    fn rich_text(
        &mut self,
        field: &'static str,
        legacy: LegacyShape,
    ) -> Result<Option<RichText>, TransformError> {
        let Some(value) = self.get(field) else {
            return Ok(None);
        };

        let (text, source) = RichText::from_value(value).map_err(|reason| self.invalid(field, reason))?;
        if source == TextSource::Bare {
            self.note(legacy);
        }

        Ok(Some(text))
    }

    fn created_at(&mut self) -> Result<Option<DateTime<Utc>>, TransformError> {
        let raw = match (self.get(CREATED_AT), self.get(LEGACY_CREATED_AT)) {
            (Some(value), _) => value,
            (None, Some(value)) => {
                self.note(LegacyShape::SnakeCaseTimestamp);
                value
            }
            (None, None) => return Ok(None),
        };

        let Value::String(raw) = raw else {
            return Err(self.invalid(CREATED_AT, format!("expected a string, got {}", type_name(raw))));
        };

        DateTime::parse_from_rfc3339(raw)
            .map(|parsed| Some(parsed.with_timezone(&Utc)))
            .map_err(|e| self.invalid(CREATED_AT, format!("{raw:?} is not an RFC 3339 timestamp: {e}")))
    }

    fn tags(&mut self) -> Result<Vec<String>, TransformError> {
        match self.get("tags") {
            None => Ok(Vec::new()),
            Some(Value::String(joined)) => {
                self.note(LegacyShape::CommaSeparatedTags);
                Ok(joined
                    .split(',')
                    .map(str::trim)
                    .filter(|tag| !tag.is_empty())
                    .map(str::to_owned)
                    .collect())
            }
            Some(Value::Array(tags)) => self.string_list("tags", tags),
            Some(other) => Err(self.invalid("tags", format!("expected a list, got {}", type_name(other)))),
        }
    }

    fn langs(&mut self) -> Result<Vec<String>, TransformError> {
        match (self.get("langs"), self.get("lang")) {
            (Some(Value::Array(langs)), _) => self.string_list("langs", langs),
            (Some(other), _) => Err(self.invalid("langs", format!("expected a list, got {}", type_name(other)))),
            (None, Some(Value::String(lang))) => {
                self.note(LegacyShape::SingleLang);
                Ok(vec![lang.clone()])
            }
            (None, Some(other)) => Err(self.invalid("lang", format!("expected a string, got {}", type_name(other)))),
            (None, None) => Ok(Vec::new()),
        }
    }

    fn reply_parent(&mut self) -> Result<Option<String>, TransformError> {
        match (self.get("reply"), self.get("replyTo")) {
            (Some(Value::Object(reply)), _) => match reply.get("parent") {
                Some(Value::String(uri)) => Ok(Some(uri.clone())),
                Some(Value::Object(parent)) => match parent.get("uri") {
                    Some(Value::String(uri)) => Ok(Some(uri.clone())),
                    _ => Err(self.invalid("reply", "parent has no uri")),
                },
                _ => Err(self.invalid("reply", "missing parent")),
            },
            (Some(other), _) => Err(self.invalid("reply", format!("expected an object, got {}", type_name(other)))),
            (None, Some(Value::String(uri))) => {
                self.note(LegacyShape::ReplyToString);
                Ok(Some(uri.clone()))
            }
            (None, Some(other)) => Err(self.invalid("replyTo", format!("expected a string, got {}", type_name(other)))),
            (None, None) => Ok(None),
        }
    }

    fn string_list(&self, field: &'static str, values: &[Value]) -> Result<Vec<String>, TransformError> {
        values
            .iter()
            .map(|value| match value {
                Value::String(value) => Ok(value.clone()),
                other => Err(self.invalid(field, format!("expected strings, got {}", type_name(other)))),
            })
            .collect()
    }
}
