//! Well-known endpoints
//!
//! - /.well-known/webfinger
//! - /.well-known/nodeinfo
//! - /.well-known/host-meta

use axum::{
    Router,
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Json},
    routing::get,
};
use serde::Deserialize;

use crate::AppState;
use crate::error::AppError;
use crate::federation::webfinger::host_meta_xml;
use crate::metrics::{HTTP_REQUEST_DURATION_SECONDS, HTTP_REQUESTS_TOTAL};

/// Create well-known router
///
/// Routes:
/// - GET /.well-known/webfinger
/// - GET /.well-known/nodeinfo
/// - GET /.well-known/host-meta
/// - GET /nodeinfo/2.0
pub fn wellknown_router() -> Router<AppState> {
    Router::new()
        .route("/.well-known/webfinger", get(webfinger))
        .route("/.well-known/nodeinfo", get(nodeinfo_links))
        .route("/.well-known/host-meta", get(host_meta))
        .route("/nodeinfo/2.0", get(nodeinfo))
}

/// WebFinger query parameters
#[derive(Debug, Deserialize)]
struct WebFingerQuery {
    resource: String,
}

/// GET /.well-known/webfinger
///
/// Responds to WebFinger queries for local blogs.
///
/// Query: ?resource=acct:alias@domain
async fn webfinger(
    State(state): State<AppState>,
    Query(query): Query<WebFingerQuery>,
) -> Result<impl IntoResponse, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["GET", "/.well-known/webfinger"])
        .start_timer();

    let response = state.federation.webfinger(&query.resource).await?;

    HTTP_REQUESTS_TOTAL
        .with_label_values(&["GET", "/.well-known/webfinger", "200"])
        .inc();

    Ok((
        [(header::CONTENT_TYPE, "application/jrd+json; charset=utf-8")],
        Json(response),
    ))
}

/// GET /.well-known/nodeinfo
///
/// Returns links to nodeinfo documents.
async fn nodeinfo_links(State(state): State<AppState>) -> Json<serde_json::Value> {
    let base_url = state.config.server.base_url();
    Json(serde_json::json!({
        "links": [
            {
                "rel": "http://nodeinfo.diaspora.software/ns/schema/2.0",
                "href": format!("{}/nodeinfo/2.0", base_url)
            }
        ]
    }))
}

/// GET /nodeinfo/2.0
///
/// Returns NodeInfo 2.0 document.
async fn nodeinfo(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    Ok(Json(state.federation.nodeinfo().await?))
}

/// GET /.well-known/host-meta
///
/// Returns host-meta XML for WebFinger discovery.
async fn host_meta(State(state): State<AppState>) -> impl IntoResponse {
    let xml = host_meta_xml(&state.config.server.base_url());
    ([(header::CONTENT_TYPE, "application/xrd+xml; charset=utf-8")], xml)
}
