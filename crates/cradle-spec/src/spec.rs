//! Agent specification types and serialization

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Errors produced while loading or checking a specification
#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yml::Error),

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("specification is invalid: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// What starts an agent run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Schedule,
    HttpWebhook,
    RssFeed,
    FileWatch,
    MessageQueue,
    Manual,
}

/// The kind of work a single step performs
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    HttpRequest,
    TransformData,
    FilterData,
    DatabaseQuery,
    SendMessage,
    GenerateContent,
    ParseRss,
    Conditional,
    Loop,
    Delay,
    CustomCode,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::HttpRequest => "http_request",
            Self::TransformData => "transform_data",
            Self::FilterData => "filter_data",
            Self::DatabaseQuery => "database_query",
            Self::SendMessage => "send_message",
            Self::GenerateContent => "generate_content",
            Self::ParseRss => "parse_rss",
            Self::Conditional => "conditional",
            Self::Loop => "loop",
            Self::Delay => "delay",
            Self::CustomCode => "custom_code",
        };
        write!(f, "{}", s)
    }
}

/// Execution backend an agent can be deployed to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    Local,
    N8n,
    Docker,
}

impl RuntimeKind {
    pub const ALL: [RuntimeKind; 3] = [Self::Local, Self::N8n, Self::Docker];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::N8n => "n8n",
            Self::Docker => "docker",
        }
    }
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RuntimeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "n8n" => Ok(Self::N8n),
            "docker" => Ok(Self::Docker),
            other => Err(format!("unknown runtime kind: {}", other)),
        }
    }
}

fn default_true() -> bool {
    true
}

/// A trigger that starts the agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trigger {
    #[serde(rename = "type")]
    pub kind: TriggerKind,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Trigger {
    pub fn new(kind: TriggerKind) -> Self {
        Self {
            kind,
            config: Map::new(),
            enabled: true,
        }
    }

    /// Schedule trigger for a cron expression, evaluated in UTC
    pub fn schedule(cron: impl Into<String>) -> Self {
        let mut trigger = Self::new(TriggerKind::Schedule);
        trigger.config.insert("cron".to_string(), Value::String(cron.into()));
        trigger
            .config
            .insert("timezone".to_string(), Value::String("UTC".to_string()));
        trigger
    }

    pub fn manual() -> Self {
        Self::new(TriggerKind::Manual)
    }

    /// The cron string of a schedule trigger
    pub fn cron_expr(&self) -> Option<&str> {
        if self.kind != TriggerKind::Schedule {
            return None;
        }
        self.config.get("cron").and_then(|v| v.as_str())
    }
}

/// What happens to the whole run when a step fails
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorAction {
    #[default]
    Abort,
    Continue,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ErrorHandling {
    #[serde(default)]
    pub on_error: ErrorAction,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Fixed,
    #[default]
    Exponential,
}

/// Upper bound on any single retry delay
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(3600);

fn default_max_attempts() -> u32 {
    1
}

fn default_base_delay_ms() -> u64 {
    500
}

/// Per-step retry configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: Backoff::default(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based count of failures so far),
    /// never longer than [`MAX_RETRY_DELAY`]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = Duration::from_millis(self.base_delay_ms);
        let delay = match self.backoff {
            Backoff::Fixed => base,
            Backoff::Exponential => base.saturating_mul(2u32.saturating_pow(attempt.min(16))),
        };
        delay.min(MAX_RETRY_DELAY)
    }
}

/// One step of the agent pipeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: StepKind,
    #[serde(default)]
    pub config: Map<String, Value>,
    /// local input name -> reference (`step:<id>:<key>` or a context key)
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    /// step output key -> context alias
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    #[serde(default)]
    pub error_handling: ErrorHandling,
    #[serde(default, alias = "retry_config")]
    pub retry: RetryPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl Step {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            config: Map::new(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            error_handling: ErrorHandling::default(),
            retry: RetryPolicy::default(),
            condition: None,
        }
    }

    pub fn with_config(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.config.insert(key.to_string(), value.into());
        self
    }

    pub fn with_input(mut self, name: &str, reference: &str) -> Self {
        self.inputs.insert(name.to_string(), reference.to_string());
        self
    }

    pub fn with_output(mut self, key: &str, alias: &str) -> Self {
        self.outputs.insert(key.to_string(), alias.to_string());
        self
    }

    pub fn continue_on_error(mut self) -> Self {
        self.error_handling.on_error = ErrorAction::Continue;
        self
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }

    pub fn config_u64(&self, key: &str) -> Option<u64> {
        self.config.get(key).and_then(|v| v.as_u64())
    }
}

/// Split a `step:<id>:<key>` reference into its step id and key
pub fn parse_step_reference(reference: &str) -> Option<(&str, &str)> {
    let rest = reference.strip_prefix("step:")?;
    match rest.split_once(':') {
        Some((id, key)) => Some((id, key)),
        None => Some((rest, "")),
    }
}

fn default_max_execution_time() -> u64 {
    300
}
fn default_max_memory_mb() -> u64 {
    512
}
fn default_max_cpu_percent() -> u32 {
    80
}
fn default_priority() -> String {
    "normal".to_string()
}

/// Resource and latency bounds for a run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sla {
    /// Seconds
    #[serde(default = "default_max_execution_time")]
    pub max_execution_time: u64,
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u64,
    #[serde(default = "default_max_cpu_percent")]
    pub max_cpu_percent: u32,
    #[serde(default = "default_priority")]
    pub priority: String,
}

impl Default for Sla {
    fn default() -> Self {
        Self {
            max_execution_time: default_max_execution_time(),
            max_memory_mb: default_max_memory_mb(),
            max_cpu_percent: default_max_cpu_percent(),
            priority: default_priority(),
        }
    }
}

impl Sla {
    pub fn max_execution(&self) -> Duration {
        Duration::from_secs(self.max_execution_time)
    }
}

/// Symbolic secret references, e.g. `telegram_token -> secret://telegram/bot_token`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Secrets {
    #[serde(default)]
    pub references: BTreeMap<String, String>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metadata {
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub created_by: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub documentation_url: String,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            created_at: Utc::now(),
            created_by: String::new(),
            version: default_version(),
            tags: Vec::new(),
            description: String::new(),
            documentation_url: String::new(),
        }
    }
}

fn default_runtime_preferences() -> Vec<RuntimeKind> {
    vec![RuntimeKind::Local, RuntimeKind::N8n]
}

/// Complete, backend-neutral description of an agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSpecification {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub owner: String,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub sla: Sla,
    #[serde(default)]
    pub secrets: Secrets,
    #[serde(default = "default_runtime_preferences")]
    pub runtime_preferences: Vec<RuntimeKind>,
    #[serde(default)]
    pub environment_variables: BTreeMap<String, String>,
}

impl AgentSpecification {
    /// Create an empty spec with a generated id
    pub fn new(name: impl Into<String>, owner: impl Into<String>) -> Self {
        let owner = owner.into();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            owner: owner.clone(),
            triggers: Vec::new(),
            steps: Vec::new(),
            metadata: Metadata {
                created_by: owner,
                ..Metadata::default()
            },
            sla: Sla::default(),
            secrets: Secrets::default(),
            runtime_preferences: default_runtime_preferences(),
            environment_variables: BTreeMap::new(),
        }
    }

    /// Assign a fresh id when the source document left it blank
    fn ensure_id(mut self) -> Self {
        if self.id.trim().is_empty() {
            self.id = uuid::Uuid::new_v4().to_string();
        }
        self
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Cron strings of all enabled schedule triggers
    pub fn schedule_expressions(&self) -> Vec<&str> {
        self.triggers
            .iter()
            .filter(|t| t.enabled)
            .filter_map(|t| t.cron_expr())
            .collect()
    }

    pub fn to_value(&self) -> Result<Value, SpecError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: Value) -> Result<Self, SpecError> {
        let spec: Self = serde_json::from_value(value)?;
        Ok(spec.ensure_id())
    }

    pub fn to_json(&self) -> Result<String, SpecError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, SpecError> {
        let spec: Self = serde_json::from_str(json)?;
        Ok(spec.ensure_id())
    }

    pub fn to_yaml(&self) -> Result<String, SpecError> {
        Ok(serde_yml::to_string(self)?)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, SpecError> {
        let spec: Self = serde_yml::from_str(yaml)?;
        Ok(spec.ensure_id())
    }

    /// Load a spec file, choosing YAML for `.yaml`/`.yml` and JSON otherwise
    pub fn from_path(path: &Path) -> Result<Self, SpecError> {
        let content = std::fs::read_to_string(path).map_err(|source| SpecError::Io {
            path: path.display().to_string(),
            source,
        })?;
        if is_yaml_path(path) {
            Self::from_yaml(&content)
        } else {
            Self::from_json(&content)
        }
    }

    /// Write the spec to a file, format chosen by extension like [`Self::from_path`]
    pub fn write_to(&self, path: &Path) -> Result<(), SpecError> {
        let content = if is_yaml_path(path) {
            self.to_yaml()?
        } else {
            self.to_json()?
        };
        std::fs::write(path, content).map_err(|source| SpecError::Io {
            path: path.display().to_string(),
            source,
        })
    }
}

fn is_yaml_path(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}
