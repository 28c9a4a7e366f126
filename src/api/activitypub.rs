//! ActivityPub endpoints
//!
//! - Actor profile
//! - Inbox (activity receiving)
//! - Outbox
//! - Followers/Following collections
//!
//! Every blog is reachable under `/api/collections/:alias` and under the
//! short `/:alias` form.

use axum::body::Bytes;
use axum::{
    Router,
    extract::{OriginalUri, Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::AppError;
use crate::federation::client::ACTIVITY_JSON;
use crate::federation::signature::InboundRequest;
use crate::metrics::{
    FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL, HTTP_REQUEST_DURATION_SECONDS,
    HTTP_REQUESTS_TOTAL,
};

/// Create ActivityPub router
///
/// Routes (each also mounted without the `/api/collections` prefix):
/// - GET /api/collections/:alias - Actor profile
/// - POST /api/collections/:alias/inbox - Blog inbox
/// - GET /api/collections/:alias/outbox - Outbox
/// - GET /api/collections/:alias/followers - Followers collection
/// - GET /api/collections/:alias/following - Following collection
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/api/collections/:alias", get(actor))
        .route("/api/collections/:alias/inbox", post(inbox))
        .route("/api/collections/:alias/outbox", get(outbox))
        .route("/api/collections/:alias/followers", get(followers))
        .route("/api/collections/:alias/following", get(following))
        .route("/:alias", get(actor))
        .route("/:alias/inbox", post(inbox))
        .route("/:alias/outbox", get(outbox))
        .route("/:alias/followers", get(followers))
        .route("/:alias/following", get(following))
}

/// `?page=n` on collection endpoints
#[derive(Debug, Deserialize)]
struct PageQuery {
    page: Option<i64>,
}

/// ActivityPub JSON with the cache policy shared by all actor documents.
fn activity_json<T: Serialize>(body: &T) -> Result<Response, AppError> {
    let body = serde_json::to_vec(body)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to serialize response: {}", e)))?;

    Ok((
        [
            (header::CONTENT_TYPE, ACTIVITY_JSON),
            (header::CACHE_CONTROL, "public, max-age=60"),
        ],
        body,
    )
        .into_response())
}

fn wants_activity_json(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|accept| {
            accept.contains("application/activity+json") || accept.contains("application/ld+json")
        })
}

/// GET /api/collections/:alias
///
/// Returns the ActivityPub Actor document of a blog, or of the instance
/// actor when `alias` is the instance domain. The HTML blog page is served
/// elsewhere, so other representations are refused.
///
/// Content-Type: application/activity+json
async fn actor(
    State(state): State<AppState>,
    Path(alias): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["GET", "/api/collections/:alias"])
        .start_timer();

    if !wants_activity_json(&headers) {
        return Err(AppError::NotAcceptable);
    }

    let person = state.federation.actor(&alias).await?;

    HTTP_REQUESTS_TOTAL
        .with_label_values(&["GET", "/api/collections/:alias", "200"])
        .inc();

    activity_json(&person)
}

/// POST /api/collections/:alias/inbox
///
/// Receives incoming ActivityPub activities.
///
/// # Steps
/// 1. Resolve the blog
/// 2. Verify HTTP Signature and decide on the activity
/// 3. Acknowledge, finishing the work on a background task
async fn inbox(
    State(state): State<AppState>,
    Path(alias): Path<String>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["POST", "/api/collections/:alias/inbox"])
        .start_timer();
    let _fed_timer = FEDERATION_REQUEST_DURATION_SECONDS
        .with_label_values(&["inbound"])
        .start_timer();

    let blog = state.federation.find_blog(&alias).await?;

    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    let request = InboundRequest {
        method: "POST",
        path_and_query,
        headers: &headers,
        body: &body,
    };

    let task = match state.inbox.receive(&blog, &request).await {
        Ok(task) => task,
        Err(error) => {
            let status = match &error {
                AppError::SignatureInvalid => "unauthorized",
                _ => "rejected",
            };
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&["inbound", status])
                .inc();
            return Err(error);
        }
    };

    state.inbox.spawn(task);

    FEDERATION_REQUESTS_TOTAL
        .with_label_values(&["inbound", "success"])
        .inc();
    HTTP_REQUESTS_TOTAL
        .with_label_values(&["POST", "/api/collections/:alias/inbox", "200"])
        .inc();

    Ok(StatusCode::OK)
}

/// GET /api/collections/:alias/outbox
///
/// Returns the Outbox collection, or one page of it with `?page=n`.
async fn outbox(
    State(state): State<AppState>,
    Path(alias): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Response, AppError> {
    let outbox = state.federation.outbox(&alias, query.page).await?;
    activity_json(&outbox)
}

/// GET /api/collections/:alias/followers
async fn followers(
    State(state): State<AppState>,
    Path(alias): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Response, AppError> {
    let followers = state.federation.followers(&alias, query.page).await?;
    activity_json(&followers)
}

/// GET /api/collections/:alias/following
///
/// Blogs follow nobody; always empty.
async fn following(
    State(state): State<AppState>,
    Path(alias): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Response, AppError> {
    let following = state.federation.following(&alias, query.page).await?;
    activity_json(&following)
}
