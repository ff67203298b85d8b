use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Subscribed,
    /// Shut down, or out of reconnection attempts. Only an operator brings it back.
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub state: ConsumerState,
    pub consecutive_failures: u32,
    pub last_frame_at: Option<DateTime<Utc>>,
    pub last_sequence: Option<i64>,
    pub last_error: Option<String>,
}

/// Outcome of a probe. Answers 200 when healthy, 500 otherwise, with the snapshot in the body
/// for debugging.
#[derive(Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    pub snapshot: HealthSnapshot,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{:?}", self.snapshot);
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

/// Shared view of where the consumer state machine is. Written by the consumer, read by probes.
#[derive(Clone)]
pub struct ConsumerHealth {
    inner: Arc<RwLock<HealthSnapshot>>,
}

impl Default for ConsumerHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerHealth {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HealthSnapshot {
                state: ConsumerState::Disconnected,
                consecutive_failures: 0,
                last_frame_at: None,
                last_sequence: None,
                last_error: None,
            })),
        }
    }

    fn update(&self, f: impl FnOnce(&mut HealthSnapshot)) {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard);
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn state(&self) -> ConsumerState {
        self.snapshot().state
    }

    pub fn set_state(&self, state: ConsumerState) {
        self.update(|s| s.state = state);
    }

    pub fn connected(&self) {
        self.update(|s| {
            s.state = ConsumerState::Subscribed;
            s.consecutive_failures = 0;
            s.last_error = None;
        });
    }

    pub fn disconnected(&self, consecutive_failures: u32, error: &str) {
        self.update(|s| {
            s.state = ConsumerState::Disconnected;
            s.consecutive_failures = consecutive_failures;
            s.last_error = Some(error.to_owned());
        });
    }

    pub fn record_frame(&self, sequence: Option<i64>) {
        self.update(|s| {
            s.last_frame_at = Some(Utc::now());
            if sequence.is_some() {
                s.last_sequence = sequence;
            }
        });
    }

    /// Alive unless stopped. Reconnecting counts as alive.
    pub fn liveness(&self) -> HealthStatus {
        let snapshot = self.snapshot();
        HealthStatus {
            healthy: snapshot.state != ConsumerState::Stopped,
            snapshot,
        }
    }

    pub fn readiness(&self) -> HealthStatus {
        let snapshot = self.snapshot();
        HealthStatus {
            healthy: snapshot.state == ConsumerState::Subscribed,
            snapshot,
        }
    }
}
