//! Inference backend abstraction.
//!
//! The router never talks to a model directly; it asks a backend to start an
//! instance for a descriptor, forwards generate requests through the returned
//! handle, and stops the handle on unload. The production backend runs one
//! llama-server subprocess per model; tests substitute an in-process mock.

mod process;

pub use process::ProcessBackend;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

use crate::error::Result;
use crate::registry::ModelDescriptor;

/// Body chunks relayed from a backend to the caller.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Response to a generate call: status and content type from the backend,
/// body as an incrementally consumable byte stream (works for both buffered
/// JSON responses and SSE token streams).
pub struct GenerateResponse {
    pub status: u16,
    pub content_type: String,
    pub body: ByteStream,
}

/// Starts model instances.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Start an instance for the given model and wait until it is ready to
    /// serve requests. Potentially slow (seconds to tens of seconds).
    async fn start(&self, descriptor: &ModelDescriptor) -> Result<Arc<dyn BackendHandle>>;
}

/// A running model instance. Exclusively owned by its pool slot; the slot
/// hands out clones only while requests are attached to it.
#[async_trait]
pub trait BackendHandle: Send + Sync {
    /// Forward a generate request to the instance and relay its response.
    async fn generate(&self, path: &str, payload: serde_json::Value) -> Result<GenerateResponse>;

    /// Stop the instance and release its resources.
    async fn stop(&self) -> Result<()>;
}
