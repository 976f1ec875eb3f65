//! The interface every execution backend implements

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cradle_spec::{AgentSpecification, RuntimeKind, SpecError};
use serde_json::{Map, Value};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::result::ExecutionResult;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("{runtime} runtime is not available: {message}")]
    Unavailable { runtime: RuntimeKind, message: String },

    #[error("deployment to {runtime} failed: {message}")]
    Deploy { runtime: RuntimeKind, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Spec(#[from] SpecError),
}

/// Cached health flag plus the time it was last refreshed
#[derive(Debug)]
pub struct HealthState {
    healthy: AtomicBool,
    last_check: Mutex<DateTime<Utc>>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            last_check: Mutex::new(Utc::now()),
        }
    }
}

impl HealthState {
    pub fn record(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
        *self.last_check.lock().unwrap_or_else(|e| e.into_inner()) = Utc::now();
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn last_check(&self) -> DateTime<Utc> {
        *self.last_check.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Uniform deploy/execute/remove surface over one backend.
///
/// `execute_agent` never fails: problems are reported as a FAILED (or TIMEOUT)
/// [`ExecutionResult`]. `remove_agent` is idempotent and returns false for
/// unknown deployment ids.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    fn kind(&self) -> RuntimeKind;

    /// Liveness check against the backend
    async fn is_available(&self) -> bool;

    /// Materialize the spec on this backend and return its deployment id
    async fn deploy_agent(&self, spec: &AgentSpecification) -> Result<String, RuntimeError>;

    async fn execute_agent(&self, deployment_id: &str, trigger_data: Map<String, Value>)
    -> ExecutionResult;

    async fn remove_agent(&self, deployment_id: &str) -> bool;

    fn capabilities(&self) -> Vec<&'static str> {
        vec!["basic_execution"]
    }

    fn health(&self) -> &HealthState;

    /// Check the backend and cache the answer
    async fn health_check(&self) -> bool {
        let healthy = self.is_available().await;
        self.health().record(healthy);
        healthy
    }

    fn is_healthy(&self) -> bool {
        self.health().is_healthy()
    }
}
