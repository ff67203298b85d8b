//! # Types
//!
//! Frames and operations as they travel from the upstream relay into the pipeline.
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The kind of change an operation applies to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }

    /// Parse an upstream action name. Unknown names yield `None` so the caller can reject them.
    pub fn parse(action: &str) -> Option<Action> {
        match action {
            "create" => Some(Action::Create),
            "update" => Some(Action::Update),
            "delete" => Some(Action::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An operation exactly as the relay sent it. Nothing about it has been validated yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireOperation {
    pub action: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<Value>,
}

/// A commit to a single repository, carrying one or more operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitFrame {
    pub seq: i64,
    pub repo: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    pub ops: Vec<WireOperation>,
}

/// One decoded message from the firehose.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameEvent {
    Commit(CommitFrame),
    /// Identity, account and other non-commit events. Nothing to index, but they still occupy
    /// a sequence number that must be handled.
    Other { seq: i64 },
    Malformed {
        seq: Option<i64>,
        raw: String,
        error: String,
    },
}

impl FrameEvent {
    /// Decode a JSON frame. Decoding never fails outright: anything we cannot make sense of
    /// becomes `Malformed`, keeping the sequence number when one can be recovered.
    pub fn decode(text: &str) -> FrameEvent {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                return FrameEvent::Malformed {
                    seq: None,
                    raw: text.to_owned(),
                    error: e.to_string(),
                }
            }
        };

        let Some(seq) = value.get("seq").and_then(Value::as_i64) else {
            return FrameEvent::Malformed {
                seq: None,
                raw: text.to_owned(),
                error: "frame has no sequence number".to_owned(),
            };
        };

        if value.get("ops").is_none() {
            return FrameEvent::Other { seq };
        }

        match serde_json::from_value::<CommitFrame>(value) {
            Ok(frame) => FrameEvent::Commit(frame),
            Err(e) => FrameEvent::Malformed {
                seq: Some(seq),
                raw: text.to_owned(),
                error: e.to_string(),
            },
        }
    }

    pub fn seq(&self) -> Option<i64> {
        match self {
            FrameEvent::Commit(frame) => Some(frame.seq),
            FrameEvent::Other { seq } => Some(*seq),
            FrameEvent::Malformed { seq, .. } => *seq,
        }
    }
}

/// Identity of a record in the index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordRef {
    pub repo: String,
    pub collection: String,
    pub rkey: String,
}

impl RecordRef {
    pub fn uri(&self) -> String {
        format!("at://{}/{}/{}", self.repo, self.collection, self.rkey)
    }
}

/// A structurally valid operation, produced by `CommitHandler::parse_operation`.
#[derive(Debug, Clone, PartialEq)]
pub struct RepoOperation {
    pub seq: i64,
    pub action: Action,
    pub target: RecordRef,
    pub cid: Option<String>,
    pub record: Option<Value>,
}
