use std::time::Instant;

use axum::body::Body;
use axum::extract::{MatchedPath, Query, State};
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use ingest_common::dlq::{DeadLetterEntry, DeadLetterError, DeadLetterQueue, ListOptions, ListOrder};
use ingest_common::transform::{CompatibilityReport, SchemaCompatibilityService};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::health::{ConsumerHealth, HealthStatus};

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 500;

#[derive(Clone)]
pub struct AdminState {
    pub dlq: DeadLetterQueue,
    pub compat: SchemaCompatibilityService,
    pub health: ConsumerHealth,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(readiness))
        .route("/_liveness", get(liveness))
        .route("/_dlq", get(list_dead_letters))
        .with_state(state)
}

pub async fn index() -> &'static str {
    "firehose consumer"
}

async fn readiness(State(state): State<AdminState>) -> HealthStatus {
    state.health.readiness()
}

async fn liveness(State(state): State<AdminState>) -> HealthStatus {
    state.health.liveness()
}

#[derive(Debug, Default, Deserialize)]
pub struct DlqQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub collection: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DlqEntryView {
    #[serde(flatten)]
    pub entry: DeadLetterEntry,
    /// Legacy shapes in the stored record, if there is one.
    pub compatibility: Option<CompatibilityReport>,
}

#[derive(Debug, Serialize)]
pub struct DlqPage {
    pub entries: Vec<DlqEntryView>,
    pub limit: i64,
    pub offset: i64,
}

pub struct AdminError(DeadLetterError);

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        error!("dead letter listing failed: {}", self.0);
        (StatusCode::SERVICE_UNAVAILABLE, self.0.to_string()).into_response()
    }
}

async fn list_dead_letters(
    State(state): State<AdminState>,
    Query(query): Query<DlqQuery>,
) -> Result<Json<DlqPage>, AdminError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0).max(0);

    let entries = state
        .dlq
        .list(&ListOptions {
            limit,
            offset,
            collection: query.collection,
            max_retry_count: None,
            order: ListOrder::NewestFirst,
        })
        .await
        .map_err(AdminError)?;

    let entries = entries
        .into_iter()
        .map(|entry| DlqEntryView {
            compatibility: compatibility_of(&state.compat, &entry),
            entry,
        })
        .collect();

    Ok(Json(DlqPage {
        entries,
        limit,
        offset,
    }))
}

fn compatibility_of(
    compat: &SchemaCompatibilityService,
    entry: &DeadLetterEntry,
) -> Option<CompatibilityReport> {
    let payload = entry.decode_payload().ok()?;
    let record = payload.operation?.record?;
    Some(compat.detect(&entry.collection, &record))
}

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Add the prometheus endpoint and middleware to a router, should be called last.
pub fn setup_metrics_routes(router: Router) -> Result<Router, BuildError> {
    let recorder_handle = setup_metrics_recorder()?;

    Ok(router
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_metrics)))
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const BUCKETS: &[f64] = &[
        1.0, 5.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2000.0, 5000.0, 10000.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(BUCKETS)?
        .install_recorder()
}

/// Middleware to record some common HTTP metrics
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };

    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}
