//! HTTP API for the coordinator
//!
//! JSON over HTTP for Connect, UpdateMembership and ShouldServe; server-sent
//! events for StreamMembership. Health and Prometheus endpoints sit alongside.

use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::{Error, Result, METRICS};
use crate::coordinator::service::Zero;
use crate::coordinator::state::{Group, Member, Tablet};
use async_stream::stream;
use axum::{
    extract::State,
    http::{header, StatusCode},
    middleware,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

/// Group reports carry every tablet of a group.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Clone)]
pub struct CoordState {
    pub zero: Arc<Zero>,
}

/// Error body: `{ "error": "..." }` with a status derived from the error.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.to_http_status();
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Cancelled when the handler future is dropped, e.g. on client disconnect.
fn request_token() -> (CancellationToken, tokio_util::sync::DropGuard) {
    let token = CancellationToken::new();
    let guard = token.clone().drop_guard();
    (token, guard)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RemoveNodeRequest {
    pub node_id: u64,
    pub group_id: u32,
}

async fn connect(
    State(state): State<CoordState>,
    Json(member): Json<Member>,
) -> ApiResult<impl IntoResponse> {
    let (cancel, _guard) = request_token();
    let conn = state.zero.connect(member, &cancel).await?;
    Ok(Json(conn))
}

async fn update_membership(
    State(state): State<CoordState>,
    Json(report): Json<Group>,
) -> ApiResult<impl IntoResponse> {
    let (cancel, _guard) = request_token();
    state.zero.update_membership(report, &cancel).await?;
    Ok(Json(json!({ "data": "OK" })))
}

async fn should_serve(
    State(state): State<CoordState>,
    Json(tablet): Json<Tablet>,
) -> ApiResult<impl IntoResponse> {
    let (cancel, _guard) = request_token();
    let owner = state.zero.should_serve(tablet, &cancel).await?;
    Ok(Json(owner))
}

async fn remove_node(
    State(state): State<CoordState>,
    Json(req): Json<RemoveNodeRequest>,
) -> ApiResult<impl IntoResponse> {
    let (cancel, _guard) = request_token();
    state
        .zero
        .remove_node(req.node_id, req.group_id, &cancel)
        .await?;
    Ok(Json(json!({ "data": "OK" })))
}

/// How a finished stream producer ended, if abnormally.
async fn stream_failure(producer: JoinHandle<Result<()>>) -> Option<Error> {
    match producer.await {
        Ok(Ok(())) | Ok(Err(Error::Cancelled)) | Ok(Err(Error::StreamClosed)) => None,
        Ok(Err(e)) => Some(e),
        Err(e) => Some(Error::Internal(format!("membership stream task failed: {}", e))),
    }
}

/// Snapshots as SSE `membership` events, one per stream interval. A failure
/// before the first snapshot is an error response; a later one ends the
/// stream with an `error` event.
async fn stream_membership(
    State(state): State<CoordState>,
) -> ApiResult<Sse<impl futures_util::Stream<Item = std::result::Result<Event, Infallible>>>> {
    let (tx, mut rx) = mpsc::channel(1);
    let (cancel, guard) = request_token();
    let zero = state.zero.clone();
    let producer = tokio::spawn(async move { zero.stream_membership(tx, &cancel).await });

    let Some(first) = rx.recv().await else {
        let err = stream_failure(producer).await.unwrap_or(Error::StreamClosed);
        warn!("Membership stream failed before first snapshot: {}", err);
        return Err(err.into());
    };

    let events = stream! {
        // Dropping the response body stops the producer.
        let _guard = guard;
        let mut next = Some(first);
        let mut encode_failed = false;
        while let Some(snapshot) = next.take() {
            match serde_json::to_string(&snapshot) {
                Ok(data) => yield Ok(Event::default().event("membership").data(data)),
                Err(e) => {
                    yield Ok(Event::default().event("error").data(e.to_string()));
                    encode_failed = true;
                    break;
                }
            }
            next = rx.recv().await;
        }
        if !encode_failed {
            if let Some(e) = stream_failure(producer).await {
                warn!("Membership stream failed: {}", e);
                yield Ok(Event::default().event("error").data(e.to_string()));
            }
        }
    };
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn get_state(State(state): State<CoordState>) -> ApiResult<impl IntoResponse> {
    let (cancel, _guard) = request_token();
    let snapshot = state.zero.latest_membership_state(&cancel).await?;
    Ok(Json(snapshot))
}

async fn get_state_raw(State(state): State<CoordState>) -> ApiResult<impl IntoResponse> {
    let bytes = state.zero.marshal_membership_state()?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], bytes))
}

async fn known_groups(State(state): State<CoordState>) -> impl IntoResponse {
    Json(json!({ "groups": state.zero.known_groups() }))
}

async fn health(State(state): State<CoordState>) -> impl IntoResponse {
    let gateway = state.zero.gateway();
    Json(json!({
        "status": "healthy",
        "role": if gateway.is_leader() { "Leader" } else { "Follower" },
        "is_leader": gateway.is_leader(),
        "leader_id": gateway.leader_id(),
        "version": crate::VERSION,
    }))
}

/// Ready once some coordinator is leader.
async fn health_ready(State(state): State<CoordState>) -> impl IntoResponse {
    let gateway = state.zero.gateway();
    match gateway.leader_id() {
        Some(leader) => (
            StatusCode::OK,
            Json(json!({
                "ready": true,
                "leader_id": leader,
                "is_leader": gateway.is_leader(),
            })),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "ready": false,
                "is_leader": false,
                "reason": "No Raft leader",
            })),
        ),
    }
}

async fn health_live() -> impl IntoResponse {
    Json(json!({
        "alive": true,
        "version": crate::VERSION,
        "timestamp": crate::common::timestamp_now(),
    }))
}

async fn metrics(State(state): State<CoordState>) -> impl IntoResponse {
    state.zero.cluster().inspect(|s| {
        METRICS.groups.set(s.groups.len() as u64);
        METRICS
            .members
            .set(s.groups.values().map(|g| g.members.len() as u64).sum());
        METRICS
            .tablets
            .set(s.groups.values().map(|g| g.tablets.len() as u64).sum());
    });
    let role = if state.zero.gateway().is_leader() { 1 } else { 0 };
    let mut out = METRICS.to_prometheus();
    out.push_str("# HELP minizero_is_leader Whether this node leads the coordinator group\n");
    out.push_str("# TYPE minizero_is_leader gauge\n");
    out.push_str(&format!("minizero_is_leader {}\n", role));
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        out,
    )
}

pub fn create_router(state: CoordState) -> Router {
    Router::new()
        .route("/connect", post(connect))
        .route("/membership", post(update_membership))
        .route("/membership/stream", get(stream_membership))
        .route("/tablet", post(should_serve))
        .route("/remove", post(remove_node))
        .route("/state", get(get_state))
        .route("/state/raw", get(get_state_raw))
        .route("/groups", get(known_groups))
        .route("/health", get(health))
        .route("/health/ready", get(health_ready))
        .route("/health/live", get(health_live))
        .route("/metrics", get(metrics))
        .layer(middleware::from_fn(request_tracing_middleware))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
