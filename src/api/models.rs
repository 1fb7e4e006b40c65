//! Model status and control-plane endpoints.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::pool::SlotStatus;
use crate::registry::{ModelCapability, ModelDescriptor};
use crate::state::AppState;

/// Build the models router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/models", get(list_models))
        .route("/models/:id", get(get_model))
        .route("/models/load", post(load_model))
        .route("/models/unload", post(unload_model))
}

/// OpenAI-compatible model list response, extended with lifecycle status.
#[derive(Debug, Serialize)]
struct ModelsResponse {
    object: &'static str,
    data: Vec<ModelData>,
}

#[derive(Debug, Serialize)]
struct ModelData {
    id: String,
    object: &'static str,
    created: i64,
    owned_by: &'static str,
    capabilities: Vec<ModelCapability>,
    status: SlotStatus,
}

impl ModelData {
    fn new(descriptor: &ModelDescriptor, status: SlotStatus, created: i64) -> Self {
        Self {
            id: descriptor.id.clone(),
            object: "model",
            created,
            owned_by: "local",
            capabilities: descriptor.capabilities.clone(),
            status,
        }
    }
}

/// Request body for the load/unload control endpoints.
#[derive(Debug, Deserialize)]
struct ControlRequest {
    model: String,
}

#[derive(Debug, Serialize)]
struct ControlResponse {
    accepted: bool,
}

/// GET /v1/models - All registered models merged with their current slot
/// status; models without a slot report `unloaded`.
async fn list_models(State(state): State<Arc<AppState>>) -> Result<Json<ModelsResponse>> {
    let created = chrono::Utc::now().timestamp();
    let data = state
        .registry
        .all()
        .into_iter()
        .map(|descriptor| {
            let status = state.pool.status_of(&descriptor.id);
            ModelData::new(descriptor, status, created)
        })
        .collect();

    Ok(Json(ModelsResponse {
        object: "list",
        data,
    }))
}

/// GET /v1/models/{id} - Single-model status.
async fn get_model(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ModelData>> {
    let descriptor = state
        .registry
        .get(&id)
        .ok_or_else(|| Error::ModelNotFound(id.clone()))?;
    let status = state.pool.status_of(&id);
    Ok(Json(ModelData::new(
        descriptor,
        status,
        chrono::Utc::now().timestamp(),
    )))
}

/// POST /v1/models/load - Start loading a model. Returns as soon as the load
/// is accepted; progress is observable via the status endpoints.
async fn load_model(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ControlRequest>,
) -> Result<Json<ControlResponse>> {
    if !state.registry.contains(&request.model) {
        return Err(Error::ModelNotFound(request.model));
    }

    let pool = state.pool.clone();
    let model = request.model;
    tokio::spawn(async move {
        if let Err(e) = pool.explicit_load(&model).await {
            tracing::warn!("Control-plane load of {} failed: {}", model, e);
        }
    });

    Ok(Json(ControlResponse { accepted: true }))
}

/// POST /v1/models/unload - Unload a model. Rejects with `busy` while the
/// model is loading or has requests in flight.
async fn unload_model(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ControlRequest>,
) -> Result<Json<ControlResponse>> {
    if !state.registry.contains(&request.model) {
        return Err(Error::ModelNotFound(request.model));
    }

    state.pool.explicit_unload(&request.model).await?;
    Ok(Json(ControlResponse { accepted: true }))
}
