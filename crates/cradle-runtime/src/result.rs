//! Execution outcome shared by every runtime

use chrono::{DateTime, Utc};
use cradle_spec::RuntimeKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Instant;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failed,
    Running,
    Timeout,
    Cancelled,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Running => write!(f, "running"),
            Self::Timeout => write!(f, "timeout"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Result of one agent run on one backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Deployment id at the adapter level, agent id at the orchestrator level
    pub agent_id: String,
    pub status: ExecutionStatus,
    pub message: String,
    pub output: Map<String, Value>,
    /// Seconds
    pub execution_time: f64,
    pub timestamp: DateTime<Utc>,
    pub runtime_used: Option<RuntimeKind>,
}

impl ExecutionResult {
    pub fn new(agent_id: impl Into<String>, status: ExecutionStatus, message: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            status,
            message: message.into(),
            output: Map::new(),
            execution_time: 0.0,
            timestamp: Utc::now(),
            runtime_used: None,
        }
    }

    pub fn success(agent_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(agent_id, ExecutionStatus::Success, message)
    }

    pub fn failed(agent_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(agent_id, ExecutionStatus::Failed, message)
    }

    pub fn with_output(mut self, output: Map<String, Value>) -> Self {
        self.output = output;
        self
    }

    pub fn with_runtime(mut self, runtime: RuntimeKind) -> Self {
        self.runtime_used = Some(runtime);
        self
    }

    /// Record the time elapsed since `started`
    pub fn elapsed_since(mut self, started: Instant) -> Self {
        self.execution_time = started.elapsed().as_secs_f64();
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}
