//! # Commit
//!
//! Structural validation of repository operations. Stateless: no I/O, no configuration.
use thiserror::Error;

use crate::types::{Action, RecordRef, RepoOperation, WireOperation};

/// Enumeration of reasons an operation is structurally unusable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommitError {
    #[error("malformed record path {0:?}")]
    MalformedPath(String),
    #[error("{0:?} is not a valid action")]
    UnknownAction(String),
    #[error("{action} on {path} must carry {expected}")]
    InvalidPayload {
        action: Action,
        path: String,
        expected: &'static str,
    },
}

/// The two halves of a `collection/rkey` path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordPath {
    pub collection: String,
    pub rkey: String,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CommitHandler;

impl CommitHandler {
    pub fn new() -> Self {
        Self
    }

    /// Create and update must carry both a payload and a content hash, delete must carry
    /// neither. Anything else, including an unknown action, is invalid.
    pub fn validate_operation(&self, op: &WireOperation) -> bool {
        match Action::parse(&op.action) {
            Some(action) => shape_matches(action, op),
            None => false,
        }
    }

    pub fn parse_path(&self, path: &str) -> Result<RecordPath, CommitError> {
        let malformed = || CommitError::MalformedPath(path.to_owned());

        let (collection, rkey) = path.split_once('/').ok_or_else(malformed)?;

        if !is_valid_collection(collection) || !is_valid_rkey(rkey) {
            return Err(malformed());
        }

        Ok(RecordPath {
            collection: collection.to_owned(),
            rkey: rkey.to_owned(),
        })
    }

    /// Validate and parse an operation in one step, keeping the reason for rejection.
    pub fn parse_operation(
        &self,
        seq: i64,
        repo: &str,
        op: &WireOperation,
    ) -> Result<RepoOperation, CommitError> {
        let action =
            Action::parse(&op.action).ok_or_else(|| CommitError::UnknownAction(op.action.clone()))?;

        if !shape_matches(action, op) {
            return Err(CommitError::InvalidPayload {
                action,
                path: op.path.clone(),
                expected: match action {
                    Action::Delete => "neither a payload nor a content hash",
                    Action::Create | Action::Update => "both a payload and a content hash",
                },
            });
        }

        let RecordPath { collection, rkey } = self.parse_path(&op.path)?;

        Ok(RepoOperation {
            seq,
            action,
            target: RecordRef {
                repo: repo.to_owned(),
                collection,
                rkey,
            },
            cid: op.cid.clone(),
            record: op.record.clone(),
        })
    }
}

fn shape_matches(action: Action, op: &WireOperation) -> bool {
    match action {
        Action::Create | Action::Update => op.record.is_some() && op.cid.is_some(),
        Action::Delete => op.record.is_none() && op.cid.is_none(),
    }
}

fn is_valid_collection(collection: &str) -> bool {
    collection.contains('.')
        && collection
            .split('.')
            .all(|segment| !segment.is_empty() && segment.chars().all(is_nsid_char))
}

fn is_nsid_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-'
}

fn is_valid_rkey(rkey: &str) -> bool {
    !rkey.is_empty()
        && rkey != "."
        && rkey != ".."
        && rkey
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':' | '~'))
}
