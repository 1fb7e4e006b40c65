//! Dispatch endpoints: resolve the target model, acquire a slot and relay
//! the backend's response.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::Response;
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use uuid::Uuid;

use crate::backend::ByteStream;
use crate::error::{Error, Result};
use crate::pool::SlotGuard;
use crate::state::AppState;

/// Build the dispatch router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/chat/completions", post(chat_completions))
        .route("/completions", post(completions))
}

/// POST /v1/chat/completions - forwarded to the target model instance.
async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Response> {
    dispatch(state, "/v1/chat/completions", body).await
}

/// POST /v1/completions - forwarded to the target model instance.
async fn completions(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Response> {
    dispatch(state, "/v1/completions", body).await
}

/// Common dispatch path: extract the model id, acquire a ready slot (loading
/// and evicting per pool policy), forward the payload and relay the response
/// bytes. Acquisition errors surface before any generation is attempted.
async fn dispatch(state: Arc<AppState>, path: &'static str, body: Value) -> Result<Response> {
    let model = body
        .get("model")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::InvalidRequest("model is required".to_string()))?
        .to_string();

    if !state.registry.contains(&model) {
        return Err(Error::ModelNotFound(model));
    }

    let request_id = Uuid::new_v4();
    tracing::debug!(%request_id, model = %model, path, "Dispatching request");

    let guard = state.pool.acquire(&model).await?;
    let response = guard.handle().generate(path, body).await?;

    // The guard rides along with the body stream so the slot's in-flight
    // claim is released when the stream ends, fails, or the client
    // disconnects.
    let stream = hold_guard(response.body, guard);

    Response::builder()
        .status(response.status)
        .header(header::CONTENT_TYPE, response.content_type)
        .body(Body::from_stream(stream))
        .map_err(|e| Error::Internal(e.to_string()))
}

fn hold_guard(body: ByteStream, guard: SlotGuard) -> impl Stream<Item = Result<Bytes>> {
    futures_util::stream::unfold((body, guard), |(mut body, guard)| async move {
        body.next().await.map(|chunk| (chunk, (body, guard)))
    })
}
