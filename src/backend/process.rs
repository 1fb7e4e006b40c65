//! llama-server subprocess backend.
//!
//! Each model instance is a llama-server process bound to a local port. Start
//! spawns the process and polls its /health endpoint until it responds; stop
//! sends SIGTERM and force-kills after a timeout; generate proxies the request
//! body to the instance's HTTP API and relays the response bytes.

use std::collections::HashSet;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::TryStreamExt;
use reqwest::Client;
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::sync::RwLock;

use super::{BackendHandle, GenerateResponse, InferenceBackend};
use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::registry::ModelDescriptor;

const HEALTH_CHECK_INTERVAL_MS: u64 = 200;

/// Tracks ports handed out to running instances so two instances never share
/// one when a fixed base port is configured.
struct PortAllocator {
    base_port: Option<u16>,
    used: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    fn new(base_port: Option<u16>) -> Self {
        Self {
            base_port,
            used: Mutex::new(HashSet::new()),
        }
    }

    fn lock_used(&self) -> MutexGuard<'_, HashSet<u16>> {
        self.used.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn allocate(&self) -> Result<u16> {
        if let Some(base) = self.base_port {
            let mut used = self.lock_used();
            for offset in 0..100u16 {
                let port = base.saturating_add(offset);
                if used.insert(port) {
                    return Ok(port);
                }
            }
            Err(Error::Internal(format!(
                "No available ports in range {}-{}",
                base,
                base.saturating_add(100)
            )))
        } else {
            // OS-assigned port
            let listener = TcpListener::bind("127.0.0.1:0")
                .await
                .map_err(|e| Error::Internal(format!("Failed to bind for port allocation: {}", e)))?;
            let port = listener
                .local_addr()
                .map_err(|e| Error::Internal(format!("Failed to get local addr: {}", e)))?
                .port();
            drop(listener);
            self.lock_used().insert(port);
            Ok(port)
        }
    }

    fn release(&self, port: u16) {
        self.lock_used().remove(&port);
    }
}

/// A running llama-server instance for a specific model.
pub struct ProcessHandle {
    model_id: String,
    port: u16,
    http_client: Client,
    process: RwLock<Option<Child>>,
    ports: Arc<PortAllocator>,
    shutdown_timeout_secs: u64,
}

impl ProcessHandle {
    /// Check if the server process is still alive.
    async fn is_process_alive(&self) -> bool {
        let mut process = self.process.write().await;
        if let Some(ref mut child) = *process {
            matches!(child.try_wait(), Ok(None))
        } else {
            false
        }
    }

    /// Terminate the server process gracefully (SIGTERM, then kill on timeout).
    async fn terminate(&self) {
        let mut process_guard = self.process.write().await;
        if let Some(mut child) = process_guard.take() {
            #[cfg(unix)]
            {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;

                if let Some(pid) = child.id() {
                    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                }
            }

            let wait_result = tokio::time::timeout(
                Duration::from_secs(self.shutdown_timeout_secs),
                child.wait(),
            )
            .await;

            match wait_result {
                Ok(Ok(status)) => {
                    tracing::debug!("llama-server for {} exited with {}", self.model_id, status);
                }
                Ok(Err(e)) => {
                    tracing::warn!("Error waiting for llama-server {}: {}", self.model_id, e);
                }
                Err(_timeout) => {
                    tracing::warn!(
                        "llama-server {} didn't stop gracefully, killing",
                        self.model_id
                    );
                    let _ = child.kill().await;
                }
            }
        }
        self.ports.release(self.port);
    }
}

#[async_trait]
impl BackendHandle for ProcessHandle {
    async fn generate(&self, path: &str, payload: serde_json::Value) -> Result<GenerateResponse> {
        let url = format!("http://127.0.0.1:{}{}", self.port, path);
        tracing::debug!("Proxying generate request for {} to {}", self.model_id, url);

        let response = self
            .http_client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::Backend(format!("{}: {}", self.model_id, e)))?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/json")
            .to_string();

        let model_id = self.model_id.clone();
        let body = response
            .bytes_stream()
            .map_err(move |e| Error::Backend(format!("{}: {}", model_id, e)));

        Ok(GenerateResponse {
            status,
            content_type,
            body: Box::pin(body),
        })
    }

    async fn stop(&self) -> Result<()> {
        self.terminate().await;
        Ok(())
    }
}

/// Backend that runs one llama-server process per model.
pub struct ProcessBackend {
    config: BackendConfig,
    http_client: Client,
    ports: Arc<PortAllocator>,
}

impl ProcessBackend {
    pub fn new(config: BackendConfig) -> Self {
        let ports = Arc::new(PortAllocator::new(config.base_port));
        Self {
            config,
            http_client: Client::new(),
            ports,
        }
    }

    fn spawn_instance(&self, descriptor: &ModelDescriptor, port: u16) -> Result<Child> {
        let mut cmd = Command::new(&self.config.server_binary);

        // Wrapper arguments (e.g., toolbox run -c llamacpp llama-server)
        // must come before the llama-server specific flags.
        for arg in &self.config.server_args {
            cmd.arg(arg);
        }
        cmd.arg("-m")
            .arg(&descriptor.source)
            .arg("--host")
            .arg("127.0.0.1")
            .arg("--port")
            .arg(port.to_string());

        if let Some(gpu_layers) = self.config.gpu_layers {
            cmd.arg("-ngl").arg(gpu_layers.to_string());
        }

        if let Some(ctx_size) = self.config.context_size {
            cmd.arg("-c").arg(ctx_size.to_string());
        }

        for arg in &self.config.extra_args {
            cmd.arg(arg);
        }

        cmd.stdin(Stdio::null()).kill_on_drop(true);

        if self.config.log_server_output {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        cmd.spawn().map_err(|e| {
            Error::LoadFailed(format!(
                "Failed to spawn llama-server for {}: {}. Binary: {}",
                descriptor.id, e, self.config.server_binary
            ))
        })
    }

    /// Poll the instance's health endpoint until it responds or the startup
    /// timeout elapses.
    async fn wait_for_ready(&self, handle: &ProcessHandle) -> Result<()> {
        let timeout = Duration::from_secs(self.config.startup_timeout_secs);
        let start = Instant::now();
        let health_url = format!("http://127.0.0.1:{}/health", handle.port);

        loop {
            if start.elapsed() > timeout {
                return Err(Error::LoadFailed(format!(
                    "llama-server startup timeout for {} after {:?}",
                    handle.model_id,
                    start.elapsed()
                )));
            }

            if !handle.is_process_alive().await {
                return Err(Error::LoadFailed(format!(
                    "llama-server process died during startup for {}",
                    handle.model_id
                )));
            }

            if let Ok(resp) = self.http_client.get(&health_url).send().await {
                if resp.status().is_success() {
                    tracing::info!(
                        "llama-server ready for {} on port {} ({:?})",
                        handle.model_id,
                        handle.port,
                        start.elapsed()
                    );
                    return Ok(());
                }
            }

            tokio::time::sleep(Duration::from_millis(HEALTH_CHECK_INTERVAL_MS)).await;
        }
    }
}

#[async_trait]
impl InferenceBackend for ProcessBackend {
    async fn start(&self, descriptor: &ModelDescriptor) -> Result<Arc<dyn BackendHandle>> {
        if !descriptor.source.exists() {
            return Err(Error::LoadFailed(format!(
                "Model file not found: {}",
                descriptor.source.display()
            )));
        }

        let port = self.ports.allocate().await?;

        let process = match self.spawn_instance(descriptor, port) {
            Ok(p) => p,
            Err(e) => {
                self.ports.release(port);
                return Err(e);
            }
        };

        tracing::info!(
            "Spawned llama-server for {} on port {} (pid: {:?})",
            descriptor.id,
            port,
            process.id()
        );

        let handle = Arc::new(ProcessHandle {
            model_id: descriptor.id.clone(),
            port,
            http_client: self.http_client.clone(),
            process: RwLock::new(Some(process)),
            ports: self.ports.clone(),
            shutdown_timeout_secs: self.config.shutdown_timeout_secs,
        });

        if let Err(e) = self.wait_for_ready(&handle).await {
            handle.terminate().await;
            return Err(e);
        }

        Ok(handle)
    }
}
