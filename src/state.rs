//! Shared application state.

use std::sync::Arc;

use crate::config::Config;
use crate::pool::SlotPool;
use crate::registry::ModelRegistry;

/// Shared application state passed to all handlers.
pub struct AppState {
    pub config: Config,
    pub registry: Arc<ModelRegistry>,
    pub pool: Arc<SlotPool>,
}

impl AppState {
    pub fn new(config: Config, registry: Arc<ModelRegistry>, pool: Arc<SlotPool>) -> Self {
        Self {
            config,
            registry,
            pool,
        }
    }
}
