//! Test scaffolding: an in-process backend that records lifecycle calls.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream;

use crate::backend::{BackendHandle, GenerateResponse, InferenceBackend};
use crate::error::{Error, Result};
use crate::registry::ModelDescriptor;

#[derive(Default)]
struct MockState {
    start_attempts: AtomicUsize,
    starts: AtomicUsize,
    stops: AtomicUsize,
    stopped: Mutex<Vec<String>>,
    fail_next: Mutex<HashSet<String>>,
}

/// Backend whose instances are plain in-process objects. Start latency and
/// one-shot start failures are scriptable; start/stop calls are counted.
pub struct MockBackend {
    state: Arc<MockState>,
    start_delay: Duration,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState::default()),
            start_delay: Duration::ZERO,
        }
    }

    /// A backend whose start takes `millis` to complete, long enough for
    /// concurrent callers to pile up on the loading slot.
    pub fn with_start_delay(millis: u64) -> Self {
        Self {
            state: Arc::new(MockState::default()),
            start_delay: Duration::from_millis(millis),
        }
    }

    /// Make the next start of `model_id` fail; later starts succeed.
    pub fn fail_next_start_of(&self, model_id: &str) {
        self.state
            .fail_next
            .lock()
            .unwrap()
            .insert(model_id.to_string());
    }

    /// Successful starts.
    pub fn starts(&self) -> usize {
        self.state.starts.load(Ordering::SeqCst)
    }

    /// Start attempts, including scripted failures.
    pub fn start_attempts(&self) -> usize {
        self.state.start_attempts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.state.stops.load(Ordering::SeqCst)
    }

    /// Model ids stopped so far, in stop order.
    pub fn stopped_models(&self) -> Vec<String> {
        self.state.stopped.lock().unwrap().clone()
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InferenceBackend for MockBackend {
    async fn start(&self, descriptor: &ModelDescriptor) -> Result<Arc<dyn BackendHandle>> {
        self.state.start_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        if self.state.fail_next.lock().unwrap().remove(&descriptor.id) {
            return Err(Error::Backend(format!(
                "simulated start failure for {}",
                descriptor.id
            )));
        }
        self.state.starts.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockHandle {
            model_id: descriptor.id.clone(),
            state: self.state.clone(),
        }))
    }
}

pub struct MockHandle {
    model_id: String,
    state: Arc<MockState>,
}

#[async_trait]
impl BackendHandle for MockHandle {
    async fn generate(&self, path: &str, payload: serde_json::Value) -> Result<GenerateResponse> {
        let body = serde_json::json!({
            "model": self.model_id,
            "path": path,
            "echo": payload,
        });
        let bytes = Bytes::from(
            serde_json::to_vec(&body).map_err(|e| Error::Internal(e.to_string()))?,
        );
        let chunks: Vec<Result<Bytes>> = vec![Ok(bytes)];
        Ok(GenerateResponse {
            status: 200,
            content_type: "application/json".to_string(),
            body: Box::pin(stream::iter(chunks)),
        })
    }

    async fn stop(&self) -> Result<()> {
        self.state.stops.fetch_add(1, Ordering::SeqCst);
        self.state.stopped.lock().unwrap().push(self.model_id.clone());
        Ok(())
    }
}
