//! A scripted transport for driving the consumer without a relay.
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use ingest_common::types::{CommitFrame, FrameEvent, WireOperation};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::transport::{FirehoseTransport, FrameResult, Subscription};

enum Script {
    /// Deliver the frames, then report the subscription closed.
    Session(Vec<FrameEvent>),
    /// Deliver the frames and keep the subscription open.
    OpenSession(Vec<FrameEvent>),
    Failure(String),
    Hang,
}

/// Every `subscribe` call consumes the next script. With no scripts left subscribing fails.
#[derive(Default)]
pub struct ChannelTransport {
    scripts: Mutex<VecDeque<Script>>,
    subscribed_from: Mutex<Vec<Option<i64>>>,
    open: Mutex<Vec<mpsc::Sender<FrameResult>>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_session(&self, frames: Vec<FrameEvent>) {
        lock(&self.scripts).push_back(Script::Session(frames));
    }

    pub fn push_open_session(&self, frames: Vec<FrameEvent>) {
        lock(&self.scripts).push_back(Script::OpenSession(frames));
    }

    pub fn push_failure(&self, message: &str) {
        lock(&self.scripts).push_back(Script::Failure(message.to_owned()));
    }

    /// The next subscribe never completes, exercising the connect timeout.
    pub fn push_hang(&self) {
        lock(&self.scripts).push_back(Script::Hang);
    }

    /// The cursor passed to each `subscribe`, in call order.
    pub fn subscribed_from(&self) -> Vec<Option<i64>> {
        lock(&self.subscribed_from).clone()
    }
}

#[async_trait]
impl FirehoseTransport for ChannelTransport {
    async fn subscribe(&self, cursor: Option<i64>) -> Result<Subscription, TransportError> {
        lock(&self.subscribed_from).push(cursor);
        let script = lock(&self.scripts).pop_front();

        let (frames, close) = match script {
            None => return Err(TransportError::Closed("no relay scripted".to_owned())),
            Some(Script::Failure(message)) => return Err(TransportError::Closed(message)),
            Some(Script::Hang) => return std::future::pending().await,
            Some(Script::Session(frames)) => (frames, true),
            Some(Script::OpenSession(frames)) => (frames, false),
        };

        let (sender, receiver) = mpsc::channel(frames.len() + 1);
        for frame in frames {
            if sender.try_send(Ok(frame)).is_err() {
                return Err(TransportError::Closed("script buffer full".to_owned()));
            }
        }

        if close {
            if sender
                .try_send(Err(TransportError::Closed("script finished".to_owned())))
                .is_err()
            {
                return Err(TransportError::Closed("script buffer full".to_owned()));
            }
        } else {
            lock(&self.open).push(sender);
        }

        Ok(Subscription::new(receiver, None))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn create(path: &str, record: Value) -> WireOperation {
    WireOperation {
        action: "create".to_owned(),
        path: path.to_owned(),
        cid: Some(format!("bafy-{}", path.replace('/', "-"))),
        record: Some(record),
    }
}

pub fn delete(path: &str) -> WireOperation {
    WireOperation {
        action: "delete".to_owned(),
        path: path.to_owned(),
        cid: None,
        record: None,
    }
}

pub fn commit(seq: i64, repo: &str, ops: Vec<WireOperation>) -> FrameEvent {
    FrameEvent::Commit(CommitFrame {
        seq,
        repo: repo.to_owned(),
        time: None,
        ops,
    })
}
