//! Process-wide counters, shared by every task and read by the HTTP endpoint
//! and the statistics pusher. The registry is an instance owned by the
//! orchestrator and handed out as an `Arc` at construction time, so there is
//! no ambient global state and tests stay hermetic.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Response, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;
use tracing::info;

use crate::error::{Error, Result};

const TASK_LABEL: &str = "task";

// The registry is created with this prefix, and the prometheus client library
// appends the `_total` suffix for counters, so `events` below is exposed as
// `sinker_events_total`.
const REGISTRY_PREFIX: &str = "sinker";

const EVENTS_TOTAL: &str = "events";
const EVENTS_SUCCESS: &str = "events_success";
const EVENTS_ERROR: &str = "events_error";
const RECONNECT_TOTAL: &str = "reconnect";
const CONSUMER_ERROR_TOTAL: &str = "consumer_error";
const PUSH_ERROR_TOTAL: &str = "push_error";

pub(crate) type LabeledCounter = Family<Vec<(String, String)>, Counter>;

/// All counters of the sinker. Increments are atomic; concurrent increments
/// from many tasks are never lost and reads never observe torn values.
pub struct SinkerMetrics {
    // Only the text encoder takes the lock; increments go through the
    // lock-free counter families.
    registry: parking_lot::Mutex<Registry>,

    pub(crate) events_total: LabeledCounter,
    pub(crate) events_success: LabeledCounter,
    pub(crate) events_error: LabeledCounter,
    pub(crate) reconnect_total: LabeledCounter,
    pub(crate) consumer_error_total: LabeledCounter,
    pub(crate) push_error_total: LabeledCounter,
}

impl SinkerMetrics {
    pub fn new() -> Self {
        let metrics = Self {
            registry: parking_lot::Mutex::new(Registry::default()),
            events_total: LabeledCounter::default(),
            events_success: LabeledCounter::default(),
            events_error: LabeledCounter::default(),
            reconnect_total: LabeledCounter::default(),
            consumer_error_total: LabeledCounter::default(),
            push_error_total: LabeledCounter::default(),
        };

        {
            let mut guard = metrics.registry.lock();
            let registry = guard.sub_registry_with_prefix(REGISTRY_PREFIX);
            registry.register(
                EVENTS_TOTAL,
                "A Counter to keep track of the total number of records consumed from the stream",
                metrics.events_total.clone(),
            );
            registry.register(
                EVENTS_SUCCESS,
                "A Counter to keep track of the total number of rows durably written to the store",
                metrics.events_success.clone(),
            );
            registry.register(
                EVENTS_ERROR,
                "A Counter to keep track of the total number of records lost to parse or write failures",
                metrics.events_error.clone(),
            );
            registry.register(
                RECONNECT_TOTAL,
                "A Counter to keep track of the total number of store reconnect attempts",
                metrics.reconnect_total.clone(),
            );
            registry.register(
                CONSUMER_ERROR_TOTAL,
                "A Counter to keep track of the total number of stream consumer errors",
                metrics.consumer_error_total.clone(),
            );
            registry.register(
                PUSH_ERROR_TOTAL,
                "A Counter to keep track of the total number of failed statistics pushes",
                metrics.push_error_total.clone(),
            );
        }

        metrics
    }

    /// Renders the current snapshot in the OpenMetrics text format.
    pub fn encode_snapshot(&self) -> Result<String> {
        let registry = self.registry.lock();
        let mut buffer = String::new();
        encode(&mut buffer, &registry)
            .map_err(|err| Error::Metrics(format!("Encoding snapshot: {err}")))?;
        Ok(buffer)
    }
}

impl Default for SinkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Labels identifying one task in every counter family.
pub(crate) fn task_labels(task_name: &str) -> Vec<(String, String)> {
    vec![(TASK_LABEL.to_string(), task_name.to_string())]
}

async fn metrics_handler(State(metrics): State<Arc<SinkerMetrics>>) -> impl IntoResponse {
    match metrics.encode_snapshot() {
        Ok(buffer) => Response::builder()
            .status(StatusCode::OK)
            .header(
                axum::http::header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )
            .body(Body::from(buffer))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn livez() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

/// Serves `/metrics` and `/livez` until the process exits. Spawned once by
/// the binary; the handle is intentionally not joined.
pub async fn start_metrics_server(addr: SocketAddr, metrics: Arc<SinkerMetrics>) -> Result<()> {
    let router = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/livez", get(livez))
        .with_state(metrics);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|err| Error::Metrics(format!("Binding metrics endpoint {addr}: {err}")))?;
    info!(?addr, "Serving metrics endpoint");
    axum::serve(listener, router)
        .await
        .map_err(|err| Error::Metrics(format!("Metrics endpoint: {err}")))
}
