//! Prometheus scrape endpoint

use axum::{Router, http::header, response::IntoResponse, routing::get};
use prometheus::{Encoder, TextEncoder};

use crate::error::AppError;
use crate::metrics::REGISTRY;

/// GET /metrics
///
/// Text exposition of every instrument registered by `init_metrics`.
async fn scrape() -> Result<impl IntoResponse, AppError> {
    let encoder = TextEncoder::new();
    let body = encoder
        .encode_to_string(&REGISTRY.gather())
        .map_err(|e| anyhow::anyhow!("failed to encode metrics: {e}"))?;

    Ok(([(header::CONTENT_TYPE, encoder.format_type().to_string())], body))
}

/// Router serving `/metrics`, generic over the caller's state
pub fn metrics_router<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new().route("/metrics", get(scrape))
}
