//! In-process runtime that interprets agent steps directly

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cradle_spec::{AgentSpecification, ErrorAction, RuntimeKind, Step, StepKind};
use rand::seq::SliceRandom;
use reqwest::Client;
use serde_json::{Map, Value, json};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, error, info, warn};

use crate::adapter::{HealthState, RuntimeAdapter, RuntimeError};
use crate::result::ExecutionResult;
use crate::rss::{fetch_feed_source, parse_feed};
use crate::services::{ContentGenerator, LogSender, MessageSender, StubGenerator};

#[derive(Debug, Clone)]
pub struct LocalConfig {
    /// Concurrent executions across all deployments
    pub max_concurrent: usize,
    /// Upper bound for `delay` steps
    pub max_delay: Duration,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            max_delay: Duration::from_secs(60),
        }
    }
}

/// Item keys a filter step has already passed, oldest first
#[derive(Default)]
struct SeenKeys {
    order: VecDeque<String>,
    keys: HashSet<String>,
}

impl SeenKeys {
    const CAPACITY: usize = 1000;

    /// Returns false when the key was already seen
    fn insert(&mut self, key: String) -> bool {
        if !self.keys.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > Self::CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
        true
    }
}

struct LocalDeployment {
    spec: Arc<AgentSpecification>,
    deployed_at: DateTime<Utc>,
    executions: u64,
}

pub struct LocalRuntime {
    deployments: RwLock<HashMap<String, LocalDeployment>>,
    semaphore: Semaphore,
    config: LocalConfig,
    client: Client,
    generator: Arc<dyn ContentGenerator>,
    sender: Arc<dyn MessageSender>,
    /// agent id -> memory_key -> item keys already passed by a filter step
    seen: Mutex<HashMap<String, HashMap<String, SeenKeys>>>,
    health: HealthState,
}

impl LocalRuntime {
    pub fn new(config: LocalConfig) -> Self {
        Self {
            deployments: RwLock::new(HashMap::new()),
            semaphore: Semaphore::new(config.max_concurrent.max(1)),
            config,
            client: Client::new(),
            generator: Arc::new(StubGenerator),
            sender: Arc::new(LogSender),
            seen: Mutex::new(HashMap::new()),
            health: HealthState::default(),
        }
    }

    pub fn with_generator(mut self, generator: Arc<dyn ContentGenerator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn with_sender(mut self, sender: Arc<dyn MessageSender>) -> Self {
        self.sender = sender;
        self
    }

    pub async fn deployment_count(&self) -> usize {
        self.deployments.read().await.len()
    }

    /// Agents with filter state held in memory
    #[cfg(test)]
    fn tracked_filter_agents(&self) -> usize {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Run one step, retrying per its retry policy
    async fn run_step(&self, agent_id: &str, step: &Step, ctx: &Map<String, Value>) -> Result<Map<String, Value>> {
        let attempts = step.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match self.execute_step(agent_id, step, ctx).await {
                Ok(output) => return Ok(output),
                Err(e) if attempt + 1 < attempts => {
                    let delay = step.retry.delay_for(attempt);
                    warn!(
                        "Step {} attempt {}/{} failed: {:#}; retrying in {:?}",
                        step.id,
                        attempt + 1,
                        attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn execute_step(&self, agent_id: &str, step: &Step, ctx: &Map<String, Value>) -> Result<Map<String, Value>> {
        let inputs = resolve_inputs(step, ctx);
        debug!("Executing step {} ({})", step.id, step.kind);
        match step.kind {
            StepKind::HttpRequest => self.http_request(step).await.context("HTTP request failed"),
            StepKind::ParseRss => self.parse_rss(step, &inputs).await.context("RSS parsing failed"),
            StepKind::GenerateContent => self
                .generate_content(step, &inputs)
                .await
                .context("Content generation failed"),
            StepKind::SendMessage => self
                .send_message(step, &inputs)
                .await
                .context("Message sending failed"),
            StepKind::TransformData => {
                transform_data(step, &inputs, ctx).context("Data transformation failed")
            }
            StepKind::FilterData => self
                .filter_data(agent_id, step, &inputs)
                .context("Data filtering failed"),
            StepKind::Delay => self.delay(step).await,
            other => bail!("Unsupported step type: {}", other),
        }
    }

    async fn http_request(&self, step: &Step) -> Result<Map<String, Value>> {
        let url = step.config_str("url").unwrap_or_default();
        if url.is_empty() {
            bail!("url is required");
        }
        let method_name = step.config_str("method").unwrap_or("GET").to_uppercase();
        let method = reqwest::Method::from_bytes(method_name.as_bytes())
            .map_err(|_| anyhow!("invalid HTTP method {}", method_name))?;
        let timeout = Duration::from_secs(step.config_u64("timeout").unwrap_or(30));

        let mut request = self.client.request(method, url).timeout(timeout);
        if let Some(headers) = step.config.get("headers").and_then(Value::as_object) {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name.as_str(), value);
                }
            }
        }
        if matches!(method_name.as_str(), "POST" | "PUT" | "PATCH") {
            let body = step.config.get("data").cloned().unwrap_or_else(|| json!({}));
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let mut headers = Map::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.to_string(), Value::String(value.to_string()));
            }
        }
        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/json"));
        let text = response.text().await?;
        let data = if is_json {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        } else {
            Value::String(text)
        };

        let mut out = Map::new();
        out.insert("status_code".into(), json!(status));
        out.insert("response_data".into(), data);
        out.insert("headers".into(), Value::Object(headers));
        Ok(out)
    }

    async fn parse_rss(&self, step: &Step, inputs: &Map<String, Value>) -> Result<Map<String, Value>> {
        let url = inputs
            .get("url")
            .and_then(Value::as_str)
            .or_else(|| step.config_str("url"))
            .unwrap_or_default();
        if url.is_empty() {
            bail!("url is required");
        }
        let max_items = step.config_u64("max_items").unwrap_or(10) as usize;
        let timeout = Duration::from_secs(step.config_u64("timeout").unwrap_or(30));

        let body = fetch_feed_source(&self.client, url, timeout).await?;
        let feed = parse_feed(&body, max_items)?;
        debug!("Parsed {} items from {}", feed.items.len(), url);

        let mut out = Map::new();
        out.insert("feed_title".into(), Value::String(feed.title));
        out.insert("total_items".into(), json!(feed.items.len()));
        out.insert("items".into(), serde_json::to_value(&feed.items)?);
        Ok(out)
    }

    async fn generate_content(
        &self,
        step: &Step,
        inputs: &Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        let template = step
            .config_str("prompt_template")
            .or_else(|| step.config_str("prompt"))
            .unwrap_or("{topic}");
        let model = step.config_str("model").unwrap_or_default();
        let max_tokens = step.config_u64("max_tokens").unwrap_or(500) as u32;

        let mut out = Map::new();
        out.insert("model_used".into(), Value::String(self.generator.name().to_string()));

        let pieces = match inputs.get("items") {
            Some(Value::Array(items)) => {
                let mut pieces = Vec::with_capacity(items.len());
                for item in items {
                    let mut vars = inputs.clone();
                    if let Value::Object(fields) = item {
                        for (k, v) in fields {
                            vars.insert(k.clone(), v.clone());
                        }
                        if let Some(desc) = fields.get("description") {
                            vars.entry("content").or_insert_with(|| desc.clone());
                        }
                    }
                    let prompt = render_template(template, &vars);
                    pieces.push(self.generator.generate(&prompt, model, max_tokens).await?);
                }
                pieces
            }
            Some(Value::Null) => Vec::new(),
            _ => {
                let prompt = render_template(template, inputs);
                vec![self.generator.generate(&prompt, model, max_tokens).await?]
            }
        };

        if pieces.is_empty() {
            debug!("Step {}: no items to generate content for", step.id);
        }
        out.insert("items_processed".into(), json!(pieces.len()));
        out.insert("generated_content".into(), Value::String(pieces.join("\n\n")));
        Ok(out)
    }

    async fn send_message(&self, step: &Step, inputs: &Map<String, Value>) -> Result<Map<String, Value>> {
        let platform = step.config_str("platform").unwrap_or("telegram");
        let chat_id = step.config_str("chat_id").unwrap_or_default();
        let parse_mode = step.config_str("parse_mode");
        let text = match inputs.get("content") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => step.config_str("message").unwrap_or_default().to_string(),
            Some(other) => other.to_string(),
        };

        let mut out = Map::new();
        out.insert("platform".into(), Value::String(platform.to_string()));
        out.insert("chat_id".into(), Value::String(chat_id.to_string()));

        if text.trim().is_empty() {
            debug!("Step {}: nothing to send", step.id);
            out.insert("message_sent".into(), Value::Bool(false));
            return Ok(out);
        }

        self.sender.send(platform, chat_id, &text, parse_mode).await?;
        out.insert("message_sent".into(), Value::Bool(true));
        Ok(out)
    }

    fn filter_data(&self, agent_id: &str, step: &Step, inputs: &Map<String, Value>) -> Result<Map<String, Value>> {
        let items = match inputs.get("items") {
            Some(Value::Array(items)) => items.clone(),
            Some(Value::Null) | None => Vec::new(),
            Some(other) => bail!("items must be a list, got {}", other),
        };
        let memory_key = step
            .config_str("memory_key")
            .map(str::to_string)
            .unwrap_or_else(|| format!("filter_{}", step.id));
        let field = step.config_str("dedupe_by").unwrap_or("link");
        let limit = step.config_u64("max_items").map(|n| n as usize);

        let total = items.len();
        let mut kept = Vec::new();
        {
            let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
            let seen = seen
                .entry(agent_id.to_string())
                .or_default()
                .entry(memory_key)
                .or_default();
            for item in items {
                if limit.is_some_and(|n| kept.len() >= n) {
                    break;
                }
                let key = match item.get(field) {
                    Some(Value::String(s)) => s.clone(),
                    Some(v) => v.to_string(),
                    None => item.to_string(),
                };
                if seen.insert(key) {
                    kept.push(item);
                }
            }
        }

        let mut out = Map::new();
        out.insert("filtered_count".into(), json!(kept.len()));
        out.insert("total_count".into(), json!(total));
        out.insert("items".into(), Value::Array(kept));
        Ok(out)
    }

    async fn delay(&self, step: &Step) -> Result<Map<String, Value>> {
        let requested = step
            .config_u64("duration_ms")
            .map(Duration::from_millis)
            .or_else(|| step.config_u64("seconds").map(Duration::from_secs))
            .unwrap_or_default();
        let actual = requested.min(self.config.max_delay);
        tokio::time::sleep(actual).await;
        let mut out = Map::new();
        out.insert("delayed_ms".into(), json!(actual.as_millis() as u64));
        Ok(out)
    }
}

/// Look up each declared input in the context. Step references are stored in
/// the context under their full `step:<id>:<key>` name, so both reference
/// forms resolve with a plain lookup.
fn resolve_inputs(step: &Step, ctx: &Map<String, Value>) -> Map<String, Value> {
    step.inputs
        .iter()
        .map(|(name, reference)| (name.clone(), ctx.get(reference).cloned().unwrap_or(Value::Null)))
        .collect()
}

fn merge_output(ctx: &mut Map<String, Value>, step: &Step, output: Map<String, Value>) {
    for (key, alias) in &step.outputs {
        if let Some(value) = output.get(key) {
            ctx.insert(alias.clone(), value.clone());
            ctx.insert(format!("step:{}:{}", step.id, alias), value.clone());
        }
    }
    for (key, value) in output {
        ctx.insert(format!("step:{}:{}", step.id, key), value.clone());
        ctx.insert(key, value);
    }
}

fn push_error(ctx: &mut Map<String, Value>, step: &Step, message: &str) {
    let entry = json!({ "step": step.id, "error": message });
    match ctx.get_mut("errors") {
        Some(Value::Array(errors)) => errors.push(entry),
        _ => {
            ctx.insert("errors".into(), Value::Array(vec![entry]));
        }
    }
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
    }
}

/// Guard conditions name a context key; a leading `!` negates
fn condition_holds(condition: &str, ctx: &Map<String, Value>) -> bool {
    let condition = condition.trim();
    match condition.strip_prefix('!') {
        Some(key) => !is_truthy(ctx.get(key.trim())),
        None => is_truthy(ctx.get(condition)),
    }
}

/// Replace `{name}` placeholders with values from `vars`
fn render_template(template: &str, vars: &Map<String, Value>) -> String {
    let mut rendered = template.to_string();
    for (key, value) in vars {
        let placeholder = format!("{{{}}}", key);
        if !rendered.contains(&placeholder) {
            continue;
        }
        let text = match value {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        rendered = rendered.replace(&placeholder, &text);
    }
    rendered
}

fn transform_data(
    step: &Step,
    inputs: &Map<String, Value>,
    ctx: &Map<String, Value>,
) -> Result<Map<String, Value>> {
    let operation = step
        .config_str("operation")
        .or_else(|| step.config_str("transformation"))
        .unwrap_or("identity");
    let input = inputs
        .get("data")
        .or_else(|| inputs.values().next())
        .cloned()
        .or_else(|| ctx.get(step.config_str("input_key").unwrap_or("data")).cloned())
        .unwrap_or(Value::Null);

    let as_text = |v: &Value| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    let result = match operation {
        "identity" => input,
        "to_upper" => Value::String(as_text(&input).to_uppercase()),
        "to_lower" => Value::String(as_text(&input).to_lowercase()),
        "pick_random" => {
            let choices = step
                .config
                .get("choices")
                .and_then(Value::as_array)
                .or_else(|| input.as_array())
                .cloned()
                .unwrap_or_default();
            choices
                .choose(&mut rand::thread_rng())
                .cloned()
                .ok_or_else(|| anyhow!("no choices to pick from"))?
        }
        other => bail!("unknown transformation: {}", other),
    };

    let mut out = Map::new();
    out.insert("transformed_data".into(), result);
    Ok(out)
}

#[async_trait]
impl RuntimeAdapter for LocalRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Local
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn deploy_agent(&self, spec: &AgentSpecification) -> Result<String, RuntimeError> {
        let mut deployments = self.deployments.write().await;
        let base = format!("local_{}_{}", spec.id, Utc::now().timestamp());
        let mut deployment_id = base.clone();
        let mut n = 1;
        while deployments.contains_key(&deployment_id) {
            deployment_id = format!("{}_{}", base, n);
            n += 1;
        }
        deployments.insert(
            deployment_id.clone(),
            LocalDeployment {
                spec: Arc::new(spec.clone()),
                deployed_at: Utc::now(),
                executions: 0,
            },
        );
        info!("Agent {} deployed locally with ID {}", spec.name, deployment_id);
        Ok(deployment_id)
    }

    async fn execute_agent(
        &self,
        deployment_id: &str,
        trigger_data: Map<String, Value>,
    ) -> ExecutionResult {
        let started = Instant::now();
        let spec = match self.deployments.read().await.get(deployment_id) {
            Some(deployment) => {
                debug!(
                    "Running {} (deployed {})",
                    deployment_id,
                    deployment.deployed_at.to_rfc3339()
                );
                deployment.spec.clone()
            }
            None => {
                return ExecutionResult::failed(deployment_id, "Agent not found in local runtime")
                    .with_runtime(RuntimeKind::Local);
            }
        };

        let _permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                return ExecutionResult::failed(deployment_id, "Local runtime is shutting down")
                    .with_runtime(RuntimeKind::Local);
            }
        };

        let mut ctx = trigger_data;
        for step in &spec.steps {
            if let Some(condition) = &step.condition {
                if !condition_holds(condition, &ctx) {
                    debug!("Skipping step {}: condition '{}' is false", step.id, condition);
                    continue;
                }
            }

            match self.run_step(&spec.id, step, &ctx).await {
                Ok(output) => merge_output(&mut ctx, step, output),
                Err(e) => {
                    let message = format!("{:#}", e);
                    match step.error_handling.on_error {
                        ErrorAction::Continue => {
                            warn!("Step {} failed, continuing: {}", step.name, message);
                            push_error(&mut ctx, step, &message);
                        }
                        ErrorAction::Abort => {
                            error!("Step {} failed in {}: {}", step.name, deployment_id, message);
                            return ExecutionResult::failed(
                                deployment_id,
                                format!("Step {} failed: {}", step.name, message),
                            )
                            .with_runtime(RuntimeKind::Local)
                            .elapsed_since(started);
                        }
                    }
                }
            }
        }

        if let Some(deployment) = self.deployments.write().await.get_mut(deployment_id) {
            deployment.executions += 1;
        }

        ExecutionResult::success(deployment_id, "Agent executed successfully")
            .with_output(ctx)
            .with_runtime(RuntimeKind::Local)
            .elapsed_since(started)
    }

    async fn remove_agent(&self, deployment_id: &str) -> bool {
        let mut deployments = self.deployments.write().await;
        let Some(deployment) = deployments.remove(deployment_id) else {
            return false;
        };
        info!(
            "Agent {} removed from local runtime after {} executions",
            deployment_id, deployment.executions
        );

        let agent_id = &deployment.spec.id;
        if !deployments.values().any(|d| d.spec.id == *agent_id) {
            self.seen
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(agent_id);
        }
        true
    }

    fn capabilities(&self) -> Vec<&'static str> {
        vec![
            "basic_execution",
            "http_requests",
            "rss_parsing",
            "content_generation",
            "message_sending",
            "data_transformation",
            "data_filtering",
            "delays",
        ]
    }

    fn health(&self) -> &HealthState {
        &self.health
    }
}
