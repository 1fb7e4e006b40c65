//! HTTP API: dispatch, status and control-plane endpoints.

pub mod dispatch;
pub mod health;
pub mod models;

use std::sync::Arc;

use axum::Router;

use crate::state::AppState;

/// Build the /v1 API router. The auth gate is layered on top of this in
/// `main`, so every route here is behind the API key; /health is not.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .merge(dispatch::router())
        .merge(models::router())
}
