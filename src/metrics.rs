use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use metrics::gauge;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;

use crate::ingest::{FeedError, FeedSender, Notice};
use crate::latency::OperationSnapshot;
use crate::leader::LeadershipHealth;
use crate::pipeline::Pipeline;
use crate::resilience::{BreakerStats, RateLimitStats};
use crate::store::DedupTotals;

/// Everything the outward status surface reports, in one serializable value.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub generated_at: DateTime<Utc>,
    pub instance_id: String,
    pub leader: Option<LeadershipHealth>,
    pub dedup: DedupTotals,
    pub processed_rows: u64,
    pub scheduled_pending: usize,
    pub breakers: Vec<BreakerStats>,
    pub rate_limits: Vec<RateLimitStats>,
    pub latency: Vec<OperationSnapshot>,
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder. Fails if another recorder is installed.
    pub fn init() -> anyhow::Result<Self> {
        // Use default buckets to avoid API differences across crate versions.
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;

        gauge!("radar_build_info", "version" => env!("CARGO_PKG_VERSION")).set(1.0);

        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}

async fn status(State(pipeline): State<Arc<Pipeline>>) -> Json<StatusSnapshot> {
    Json(pipeline.snapshot())
}

/// `/status` as JSON, for the external dashboard.
pub fn status_router(pipeline: Arc<Pipeline>) -> Router {
    Router::new()
        .route("/status", get(status))
        .with_state(pipeline)
}

#[derive(Debug, Serialize)]
struct FeedAck {
    status: &'static str,
    source: String,
}

async fn push_notice(
    State(tx): State<FeedSender>,
    Json(notice): Json<Notice>,
) -> (StatusCode, Json<FeedAck>) {
    let source = tx.source().to_string();
    let (code, status) = match tx.try_push(notice) {
        Ok(()) => (StatusCode::ACCEPTED, "queued"),
        Err(FeedError::Full(_)) => (StatusCode::TOO_MANY_REQUESTS, "feed full"),
        Err(FeedError::Closed(_)) => (StatusCode::SERVICE_UNAVAILABLE, "feed closed"),
    };
    (code, Json(FeedAck { status, source }))
}

/// `POST /feed` takes one JSON notice for the push feed. A full channel
/// answers 429 instead of queueing without bound.
pub fn feed_router(tx: FeedSender) -> Router {
    Router::new()
        .route("/feed", post(push_notice))
        .with_state(tx)
}
