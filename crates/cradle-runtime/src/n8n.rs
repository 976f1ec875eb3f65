//! n8n REST API runtime: agents become workflows

use async_trait::async_trait;
use cradle_spec::{AgentSpecification, RuntimeKind, Step, StepKind, TriggerKind};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::adapter::{HealthState, RuntimeAdapter, RuntimeError};
use crate::result::ExecutionResult;

#[derive(Clone, Default)]
pub struct N8nConfig {
    pub api_url: String,
    pub username: String,
    pub password: String,
    pub api_key: Option<String>,
}

impl std::fmt::Debug for N8nConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("N8nConfig")
            .field("api_url", &self.api_url)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

struct Workflow {
    workflow_id: String,
    agent_name: String,
}

pub struct N8nRuntime {
    client: Client,
    config: N8nConfig,
    workflows: RwLock<HashMap<String, Workflow>>,
    health: HealthState,
}

impl N8nRuntime {
    pub fn new(mut config: N8nConfig) -> Result<Self, RuntimeError> {
        let client = Client::builder().timeout(Duration::from_secs(60)).build()?;
        config.api_url = config.api_url.trim_end_matches('/').to_string();
        Ok(Self {
            client,
            config,
            workflows: RwLock::new(HashMap::new()),
            health: HealthState::default(),
        })
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        let mut builder = builder;
        if !self.config.username.is_empty() {
            builder = builder.basic_auth(&self.config.username, Some(&self.config.password));
        }
        if let Some(key) = &self.config.api_key {
            builder = builder.header("X-N8N-API-KEY", key);
        }
        builder
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_url, path)
    }
}

/// Translate a spec into an n8n workflow document: the first trigger becomes
/// the start node and supported steps are chained after it in order.
pub fn spec_to_workflow(spec: &AgentSpecification) -> Value {
    let mut nodes = Vec::new();

    if let Some(trigger) = spec.triggers.first() {
        let node = match trigger.kind {
            TriggerKind::Schedule => json!({
                "parameters": {
                    "rule": {
                        "interval": [{
                            "field": "cronExpression",
                            "value": trigger.cron_expr().unwrap_or("0 9 * * *"),
                        }]
                    }
                },
                "name": "Schedule Trigger",
                "type": "n8n-nodes-base.scheduleTrigger",
                "typeVersion": 1,
                "position": [250, 300],
            }),
            _ => json!({
                "parameters": {},
                "name": "Manual Trigger",
                "type": "n8n-nodes-base.manualTrigger",
                "typeVersion": 1,
                "position": [250, 300],
            }),
        };
        nodes.push(node);
    }

    for (index, step) in spec.steps.iter().enumerate() {
        match step_to_node(step, index) {
            Some(node) => nodes.push(node),
            None => debug!("Step {} ({}) has no n8n node equivalent", step.id, step.kind),
        }
    }

    let mut connections = Map::new();
    for pair in nodes.windows(2) {
        let (Some(from), Some(to)) = (pair[0]["name"].as_str(), pair[1]["name"].as_str()) else {
            continue;
        };
        connections.insert(
            from.to_string(),
            json!({ "main": [[{ "node": to, "type": "main", "index": 0 }]] }),
        );
    }

    json!({
        "name": spec.name,
        "nodes": nodes,
        "connections": connections,
        "settings": {},
    })
}

fn step_to_node(step: &Step, index: usize) -> Option<Value> {
    let position = json!([250 + (index as i64 + 1) * 200, 300]);
    match step.kind {
        StepKind::HttpRequest => Some(json!({
            "parameters": {
                "url": step.config_str("url").unwrap_or_default(),
                "method": step.config_str("method").unwrap_or("GET"),
                "options": {},
            },
            "name": step.name,
            "type": "n8n-nodes-base.httpRequest",
            "typeVersion": 1,
            "position": position,
        })),
        StepKind::ParseRss => Some(json!({
            "parameters": { "url": step.config_str("url").unwrap_or_default() },
            "name": step.name,
            "type": "n8n-nodes-base.rssFeedRead",
            "typeVersion": 1,
            "position": position,
        })),
        _ => None,
    }
}

fn workflow_id_of(body: &Value) -> Option<String> {
    match body.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl RuntimeAdapter for N8nRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::N8n
    }

    async fn is_available(&self) -> bool {
        if self.config.api_url.is_empty() {
            return false;
        }
        let request = self
            .authed(self.client.get(self.url("/workflows")))
            .timeout(Duration::from_secs(10));
        match request.send().await {
            Ok(response) => response.status() == StatusCode::OK,
            Err(e) => {
                warn!("n8n not available: {}", e);
                false
            }
        }
    }

    async fn deploy_agent(&self, spec: &AgentSpecification) -> Result<String, RuntimeError> {
        let workflow = spec_to_workflow(spec);
        let response = self
            .authed(self.client.post(self.url("/workflows")))
            .json(&workflow)
            .timeout(Duration::from_secs(30))
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::CREATED {
            let text = response.text().await.unwrap_or_default();
            error!("n8n deployment of {} failed: {} {}", spec.name, status, text);
            return Err(RuntimeError::Deploy {
                runtime: RuntimeKind::N8n,
                message: format!("{} {}", status, text),
            });
        }

        let body: Value = response.json().await?;
        let workflow_id = workflow_id_of(&body).ok_or_else(|| RuntimeError::Deploy {
            runtime: RuntimeKind::N8n,
            message: "response carried no workflow id".to_string(),
        })?;
        let deployment_id = format!("n8n_{}", workflow_id);

        self.workflows.write().await.insert(
            deployment_id.clone(),
            Workflow {
                workflow_id,
                agent_name: spec.name.clone(),
            },
        );
        info!("Agent {} deployed to n8n with ID {}", spec.name, deployment_id);
        Ok(deployment_id)
    }

    async fn execute_agent(
        &self,
        deployment_id: &str,
        trigger_data: Map<String, Value>,
    ) -> ExecutionResult {
        let started = Instant::now();
        let workflow_id = match self.workflows.read().await.get(deployment_id) {
            Some(workflow) => {
                debug!("Executing n8n workflow for {}", workflow.agent_name);
                workflow.workflow_id.clone()
            }
            None => {
                return ExecutionResult::failed(deployment_id, "Workflow not found in n8n runtime")
                    .with_runtime(RuntimeKind::N8n);
            }
        };

        let response = self
            .authed(self.client.post(self.url(&format!("/workflows/{}/execute", workflow_id))))
            .json(&trigger_data)
            .send()
            .await;

        let result = match response {
            Ok(response) if response.status() == StatusCode::OK => {
                let output = match response.json::<Value>().await {
                    Ok(Value::Object(map)) => map,
                    Ok(other) => {
                        let mut map = Map::new();
                        map.insert("data".into(), other);
                        map
                    }
                    Err(_) => Map::new(),
                };
                ExecutionResult::success(deployment_id, "Workflow executed successfully")
                    .with_output(output)
            }
            Ok(response) => ExecutionResult::failed(
                deployment_id,
                format!("n8n execution failed: {}", response.status()),
            ),
            Err(e) => ExecutionResult::failed(deployment_id, format!("n8n execution error: {}", e)),
        };
        result.with_runtime(RuntimeKind::N8n).elapsed_since(started)
    }

    async fn remove_agent(&self, deployment_id: &str) -> bool {
        let workflow_id = match self.workflows.read().await.get(deployment_id) {
            Some(workflow) => workflow.workflow_id.clone(),
            None => return false,
        };

        let response = self
            .authed(self.client.delete(self.url(&format!("/workflows/{}", workflow_id))))
            .timeout(Duration::from_secs(30))
            .send()
            .await;

        match response {
            Ok(response) if response.status() == StatusCode::OK => {
                self.workflows.write().await.remove(deployment_id);
                info!("Workflow {} removed from n8n", deployment_id);
                true
            }
            Ok(response) => {
                error!("Failed to remove n8n workflow: {}", response.status());
                false
            }
            Err(e) => {
                error!("Error removing n8n workflow: {}", e);
                false
            }
        }
    }

    fn capabilities(&self) -> Vec<&'static str> {
        vec![
            "basic_execution",
            "http_requests",
            "rss_parsing",
            "scheduled_triggers",
            "webhook_triggers",
            "visual_workflows",
        ]
    }

    fn health(&self) -> &HealthState {
        &self.health
    }
}
