//! Runtime orchestration
//!
//! Owns every configured [`RuntimeAdapter`], picks a primary backend for each
//! agent, runs agents under an [`ExecutionPolicy`], and drives the schedule
//! dispatch and health monitor loops.

use chrono::{DateTime, Utc};
use cradle_memory::MemoryStore;
use cradle_runtime::{ExecutionResult, ExecutionStatus, RuntimeAdapter, RuntimeError};
use cradle_scheduler::{Job, JobRunner, ScheduleEvent, ScheduleSpec, SchedulerConfig};
use cradle_spec::{AgentSpecification, RuntimeKind};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How an execution request is mapped onto backends
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPolicy {
    /// Always the primary backend, never anything else
    PrimaryOnly,
    /// Primary first, then other healthy deployments, then an emergency local deploy
    #[default]
    Failover,
    /// Rotate over healthy deployments by execution count
    LoadBalance,
    /// Run on every healthy deployment, first success wins
    Redundant,
}

impl std::fmt::Display for ExecutionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PrimaryOnly => write!(f, "primary_only"),
            Self::Failover => write!(f, "failover"),
            Self::LoadBalance => write!(f, "load_balance"),
            Self::Redundant => write!(f, "redundant"),
        }
    }
}

impl std::str::FromStr for ExecutionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "primary_only" => Ok(Self::PrimaryOnly),
            "failover" => Ok(Self::Failover),
            "load_balance" => Ok(Self::LoadBalance),
            "redundant" => Ok(Self::Redundant),
            other => Err(format!("unknown execution policy: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub execution_policy: ExecutionPolicy,
    pub health_check_interval: Duration,
    pub scheduler: SchedulerConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            execution_policy: ExecutionPolicy::default(),
            health_check_interval: Duration::from_secs(60),
            scheduler: SchedulerConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("no available runtime for agent {0}")]
    NoRuntimeAvailable(String),

    #[error("invalid agent specification: {0}")]
    InvalidSpec(String),

    #[error(transparent)]
    Deploy(#[from] RuntimeError),

    #[error("agent not found: {0}")]
    UnknownAgent(String),

    #[error("runtime {0} is not configured")]
    UnknownRuntime(RuntimeKind),
}

/// An agent as the orchestrator tracks it
#[derive(Debug, Clone)]
pub struct DeployedAgent {
    pub spec: AgentSpecification,
    /// Backend kind and backend-local deployment id, in deployment order
    pub deployments: Vec<(RuntimeKind, String)>,
    pub primary_runtime: RuntimeKind,
    pub created_at: DateTime<Utc>,
    pub last_execution: Option<DateTime<Utc>>,
    pub execution_count: u64,
    pub success_count: u64,
    pub error_count: u64,
}

impl DeployedAgent {
    fn new(spec: AgentSpecification, primary_runtime: RuntimeKind, deployments: Vec<(RuntimeKind, String)>) -> Self {
        Self {
            spec,
            deployments,
            primary_runtime,
            created_at: Utc::now(),
            last_execution: None,
            execution_count: 0,
            success_count: 0,
            error_count: 0,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.spec.id
    }

    pub fn deployment(&self, kind: RuntimeKind) -> Option<&str> {
        self.deployments
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, id)| id.as_str())
    }

    pub fn is_deployed_to(&self, kind: RuntimeKind) -> bool {
        self.deployment(kind).is_some()
    }

    fn record(&mut self, result: &ExecutionResult) {
        self.execution_count += 1;
        self.last_execution = Some(result.timestamp);
        if result.is_success() {
            self.success_count += 1;
        } else {
            self.error_count += 1;
        }
    }

    pub fn status(&self) -> AgentStatus {
        AgentStatus {
            agent_id: self.spec.id.clone(),
            name: self.spec.name.clone(),
            primary_runtime: self.primary_runtime,
            deployments: self.deployments.iter().map(|(kind, _)| *kind).collect(),
            created_at: self.created_at,
            last_execution: self.last_execution,
            execution_count: self.execution_count,
            success_count: self.success_count,
            error_count: self.error_count,
            success_rate: self.success_count as f64 / self.execution_count.max(1) as f64,
            scheduled_jobs: 0,
        }
    }
}

/// Read model for one agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub agent_id: String,
    pub name: String,
    pub primary_runtime: RuntimeKind,
    pub deployments: Vec<RuntimeKind>,
    pub created_at: DateTime<Utc>,
    pub last_execution: Option<DateTime<Utc>>,
    pub execution_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub success_rate: f64,
    #[serde(default)]
    pub scheduled_jobs: usize,
}

/// Read model for one backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeStatus {
    pub name: RuntimeKind,
    pub healthy: bool,
    pub available: bool,
    pub capabilities: Vec<String>,
    pub last_health_check: DateTime<Utc>,
}

/// Per-agent state plus the single-flight guard for its executions
struct AgentSlot {
    agent_id: String,
    state: Mutex<DeployedAgent>,
    run_lock: tokio::sync::Mutex<()>,
    retired: AtomicBool,
}

impl AgentSlot {
    fn new(agent: DeployedAgent) -> Self {
        Self {
            agent_id: agent.agent_id().to_string(),
            state: Mutex::new(agent),
            run_lock: tokio::sync::Mutex::new(()),
            retired: AtomicBool::new(false),
        }
    }

    fn state(&self) -> MutexGuard<'_, DeployedAgent> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("Agent state mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn primary(&self) -> RuntimeKind {
        self.state().primary_runtime
    }

    fn is_deployed_to(&self, kind: RuntimeKind) -> bool {
        self.state().is_deployed_to(kind)
    }

    fn execution_count(&self) -> u64 {
        self.state().execution_count
    }
}

pub struct RuntimeOrchestrator {
    /// Sorted in discovery order: local, n8n, docker
    adapters: Vec<Arc<dyn RuntimeAdapter>>,
    agents: RwLock<HashMap<String, Arc<AgentSlot>>>,
    memory: Arc<dyn MemoryStore>,
    config: OrchestratorConfig,
    jobs: JobRunner,
    events: Mutex<Option<mpsc::UnboundedReceiver<ScheduleEvent>>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RuntimeOrchestrator {
    pub fn new(
        mut adapters: Vec<Arc<dyn RuntimeAdapter>>,
        memory: Arc<dyn MemoryStore>,
        config: OrchestratorConfig,
    ) -> Self {
        adapters.sort_by_key(|adapter| adapter.kind());
        adapters.dedup_by_key(|adapter| adapter.kind());

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let jobs = JobRunner::with_config(event_tx, config.scheduler.clone());

        info!(
            "Runtime orchestrator initialized with runtimes [{}], policy {}",
            adapters
                .iter()
                .map(|a| a.kind().as_str())
                .collect::<Vec<_>>()
                .join(", "),
            config.execution_policy
        );

        Self {
            adapters,
            agents: RwLock::new(HashMap::new()),
            memory,
            config,
            jobs,
            events: Mutex::new(Some(event_rx)),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn execution_policy(&self) -> ExecutionPolicy {
        self.config.execution_policy
    }

    /// Configured backend kinds in discovery order
    pub fn runtimes(&self) -> Vec<RuntimeKind> {
        self.adapters.iter().map(|a| a.kind()).collect()
    }

    pub fn adapter(&self, kind: RuntimeKind) -> Option<&Arc<dyn RuntimeAdapter>> {
        self.adapters.iter().find(|a| a.kind() == kind)
    }

    /// Check every backend and return the healthy ones in discovery order
    pub async fn available_runtimes(&self) -> Vec<RuntimeKind> {
        let mut available = Vec::new();
        for adapter in &self.adapters {
            if adapter.health_check().await {
                available.push(adapter.kind());
            } else {
                debug!("Runtime {} is unavailable", adapter.kind());
            }
        }
        available
    }

    /// First healthy preference, else the first healthy backend
    pub async fn select_runtime(&self, spec: &AgentSpecification) -> Result<RuntimeKind, OrchestratorError> {
        let available = self.available_runtimes().await;
        choose_runtime(spec, &available)
    }

    /// Validate, deploy to the primary backend (and every other healthy one
    /// under the redundant policy) and register schedule triggers
    pub async fn deploy_agent(&self, spec: AgentSpecification) -> Result<String, OrchestratorError> {
        let errors = spec.validate();
        if !errors.is_empty() {
            return Err(OrchestratorError::InvalidSpec(errors.join("; ")));
        }

        let agent_id = spec.id.clone();
        if self.agents.read().await.contains_key(&agent_id) {
            warn!("Agent {} is already deployed, replacing it", agent_id);
            self.remove_agent(&agent_id).await;
        }

        let available = self.available_runtimes().await;
        let primary = choose_runtime(&spec, &available)?;
        let adapter = self
            .adapter(primary)
            .ok_or(OrchestratorError::UnknownRuntime(primary))?;

        let mut deployments = vec![(primary, adapter.deploy_agent(&spec).await?)];

        if self.config.execution_policy == ExecutionPolicy::Redundant {
            for kind in available.iter().copied().filter(|k| *k != primary) {
                let Some(adapter) = self.adapter(kind) else {
                    continue;
                };
                match adapter.deploy_agent(&spec).await {
                    Ok(deployment_id) => deployments.push((kind, deployment_id)),
                    Err(e) => warn!("Failed to deploy {} to {}: {}", spec.name, kind, e),
                }
            }
        }

        let scheduled = self.schedule_agent(&spec).await;
        info!(
            "Agent {} deployed with ID {} (primary {}, {} deployment(s), {} schedule(s))",
            spec.name,
            agent_id,
            primary,
            deployments.len(),
            scheduled
        );

        let slot = Arc::new(AgentSlot::new(DeployedAgent::new(spec, primary, deployments)));
        self.agents.write().await.insert(agent_id.clone(), slot);
        Ok(agent_id)
    }

    /// Deploy an existing agent onto one more backend
    pub async fn add_deployment(&self, agent_id: &str, kind: RuntimeKind) -> Result<String, OrchestratorError> {
        let slot = self
            .slot(agent_id)
            .await
            .ok_or_else(|| OrchestratorError::UnknownAgent(agent_id.to_string()))?;
        let _guard = slot.run_lock.lock().await;

        let existing = slot.state().deployment(kind).map(str::to_string);
        if let Some(existing) = existing {
            return Ok(existing);
        }
        let deployment_id = self.deploy_into(&slot, kind).await?;
        info!("Agent {} additionally deployed to {} as {}", agent_id, kind, deployment_id);
        Ok(deployment_id)
    }

    /// Run an agent under the configured policy
    pub async fn execute_agent(&self, agent_id: &str, trigger_data: Map<String, Value>) -> ExecutionResult {
        let Some(slot) = self.slot(agent_id).await else {
            return ExecutionResult::failed(agent_id, "Agent not found");
        };

        let _guard = slot.run_lock.lock().await;
        if slot.retired.load(Ordering::SeqCst) {
            return ExecutionResult::failed(agent_id, "Agent not found");
        }

        match self.config.execution_policy {
            ExecutionPolicy::PrimaryOnly => {
                let primary = slot.primary();
                self.execute_in_runtime(&slot, primary, &trigger_data).await
            }
            ExecutionPolicy::Failover => self.execute_with_failover(&slot, &trigger_data).await,
            ExecutionPolicy::LoadBalance => self.execute_with_load_balance(&slot, &trigger_data).await,
            ExecutionPolicy::Redundant => self.execute_redundant(&slot, &trigger_data).await,
        }
    }

    /// Tear down every deployment and forget the agent. False when the agent is
    /// unknown or any backend refused the teardown.
    pub async fn remove_agent(&self, agent_id: &str) -> bool {
        let Some(slot) = self.agents.write().await.remove(agent_id) else {
            warn!("Attempted to remove unknown agent: {}", agent_id);
            return false;
        };

        self.jobs.cancel_agent(agent_id).await;

        let _guard = slot.run_lock.lock().await;
        slot.retired.store(true, Ordering::SeqCst);
        let deployments = slot.state().deployments.clone();

        let mut all_removed = true;
        for (kind, deployment_id) in deployments {
            let removed = match self.adapter(kind) {
                Some(adapter) => adapter.remove_agent(&deployment_id).await,
                None => false,
            };
            if !removed {
                warn!("Failed to remove deployment {} from {}", deployment_id, kind);
                all_removed = false;
            }
        }

        info!("Agent {} removed", agent_id);
        all_removed
    }

    pub async fn get_agent_status(&self, agent_id: &str) -> Option<AgentStatus> {
        let slot = self.slot(agent_id).await?;
        let mut status = slot.state().status();
        status.scheduled_jobs = self.jobs.jobs_for(agent_id).await.len();
        Some(status)
    }

    /// Every deployed agent, oldest first
    pub async fn list_agents(&self) -> Vec<AgentStatus> {
        let slots: Vec<Arc<AgentSlot>> = self.agents.read().await.values().cloned().collect();
        let mut statuses = Vec::with_capacity(slots.len());
        for slot in slots {
            let mut status = slot.state().status();
            status.scheduled_jobs = self.jobs.jobs_for(&slot.agent_id).await.len();
            statuses.push(status);
        }
        statuses.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
        statuses
    }

    pub async fn get_runtime_status(&self) -> Vec<RuntimeStatus> {
        let mut statuses = Vec::with_capacity(self.adapters.len());
        for adapter in &self.adapters {
            statuses.push(RuntimeStatus {
                name: adapter.kind(),
                healthy: adapter.is_healthy(),
                available: adapter.is_available().await,
                capabilities: adapter.capabilities().into_iter().map(str::to_string).collect(),
                last_health_check: adapter.health().last_check(),
            });
        }
        statuses
    }

    /// Refresh the health flag of every backend
    pub async fn force_health_check(&self) -> BTreeMap<RuntimeKind, bool> {
        let mut results = BTreeMap::new();
        for adapter in &self.adapters {
            let healthy = adapter.health_check().await;
            if !healthy {
                warn!("Runtime {} failed its health check", adapter.kind());
            }
            results.insert(adapter.kind(), healthy);
        }
        results
    }

    /// Spawn the schedule dispatch loop and the health monitor
    pub fn start(self: &Arc<Self>) {
        let Some(mut events) = self.events.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            warn!("Runtime orchestrator already started");
            return;
        };

        let this = Arc::clone(self);
        let token = self.shutdown.clone();
        let dispatch = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        let orchestrator = Arc::clone(&this);
                        tokio::spawn(async move {
                            orchestrator.run_scheduled(event).await;
                        });
                    }
                }
            }
            debug!("Schedule dispatch loop stopped");
        });

        let this = Arc::clone(self);
        let token = self.shutdown.clone();
        let period = self.config.health_check_interval.max(Duration::from_millis(100));
        let health = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        this.force_health_check().await;
                    }
                }
            }
            debug!("Health monitor stopped");
        });

        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend([dispatch, health]);
        info!("Runtime orchestrator started (health check every {:?})", period);
    }

    /// Cancel background loops and scheduled jobs, waiting up to 5s for each loop
    pub async fn stop(&self) {
        info!("Stopping runtime orchestrator");
        self.shutdown.cancel();
        self.jobs.stop_all().await;

        let handles: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!("Background task did not stop within 5s");
            }
        }
    }

    async fn slot(&self, agent_id: &str) -> Option<Arc<AgentSlot>> {
        self.agents.read().await.get(agent_id).cloned()
    }

    async fn schedule_agent(&self, spec: &AgentSpecification) -> usize {
        let mut scheduled = 0;
        for expr in spec.schedule_expressions() {
            let schedule = match ScheduleSpec::parse(expr) {
                Ok(schedule) => schedule,
                Err(e) => {
                    warn!("Agent {} has an unschedulable trigger '{}': {:#}", spec.name, expr, e);
                    continue;
                }
            };
            match self.jobs.add_job(Job::new(&spec.id, schedule)).await {
                Ok(job_id) => {
                    info!("Scheduled agent {} with cron: {} (job {})", spec.name, expr, job_id);
                    scheduled += 1;
                }
                Err(e) => warn!("Failed to schedule agent {}: {:#}", spec.name, e),
            }
        }
        scheduled
    }

    async fn run_scheduled(&self, event: ScheduleEvent) {
        let mut trigger_data = Map::new();
        trigger_data.insert("trigger".into(), json!("schedule"));
        trigger_data.insert("job_id".into(), json!(event.job_id));
        trigger_data.insert("fired_at".into(), json!(event.fired_at.to_rfc3339()));

        let result = self.execute_agent(&event.agent_id, trigger_data).await;
        if result.is_success() {
            info!("Scheduled execution of {}: {}", event.agent_id, result.status);
        } else {
            error!(
                "Scheduled execution failed for {}: {} ({})",
                event.agent_id, result.status, result.message
            );
        }
    }

    /// Deploy the slot's spec onto `kind` without taking the run lock
    async fn deploy_into(&self, slot: &AgentSlot, kind: RuntimeKind) -> Result<String, OrchestratorError> {
        let adapter = self.adapter(kind).ok_or(OrchestratorError::UnknownRuntime(kind))?;
        let spec = slot.state().spec.clone();
        let deployment_id = adapter.deploy_agent(&spec).await?;
        slot.state().deployments.push((kind, deployment_id.clone()));
        Ok(deployment_id)
    }

    /// One attempt on one backend: SLA-bounded, counted and remembered
    async fn execute_in_runtime(
        &self,
        slot: &AgentSlot,
        kind: RuntimeKind,
        trigger_data: &Map<String, Value>,
    ) -> ExecutionResult {
        let (name, deployment_id, limit) = {
            let state = slot.state();
            (
                state.spec.name.clone(),
                state.deployment(kind).map(str::to_string),
                state.spec.sla.max_execution(),
            )
        };

        let Some(deployment_id) = deployment_id else {
            return ExecutionResult::failed(&slot.agent_id, format!("Agent not deployed in runtime {}", kind));
        };
        let Some(adapter) = self.adapter(kind) else {
            return ExecutionResult::failed(&slot.agent_id, format!("Runtime {} is not configured", kind))
                .with_runtime(kind);
        };

        debug!("Executing {} in {} as {}", name, kind, deployment_id);
        let started = Instant::now();
        let mut result = match tokio::time::timeout(limit, adapter.execute_agent(&deployment_id, trigger_data.clone())).await
        {
            Ok(result) => result,
            Err(_) => {
                warn!("Agent {} exceeded its {:?} limit in {}", name, limit, kind);
                ExecutionResult::new(
                    &deployment_id,
                    ExecutionStatus::Timeout,
                    format!("Execution exceeded {}s limit", limit.as_secs()),
                )
                .elapsed_since(started)
            }
        };
        result.agent_id = slot.agent_id.clone();
        result.runtime_used = Some(kind);

        slot.state().record(&result);
        self.remember(slot, &name, kind, &result).await;
        result
    }

    async fn remember(&self, slot: &AgentSlot, name: &str, kind: RuntimeKind, result: &ExecutionResult) {
        let mut metadata = Map::new();
        metadata.insert("type".into(), json!("agent_execution"));
        metadata.insert("agent_id".into(), json!(slot.agent_id));
        metadata.insert("runtime".into(), json!(kind.as_str()));
        metadata.insert("status".into(), json!(result.status.to_string()));
        metadata.insert("execution_time".into(), json!(result.execution_time));
        metadata.insert("timestamp".into(), json!(result.timestamp.to_rfc3339()));

        let content = format!("[agent_execution] {}: {} in {}", name, result.status, kind);
        if let Err(e) = self.memory.store(&content, metadata).await {
            warn!("Failed to record execution of {}: {:#}", slot.agent_id, e);
        }
    }

    fn healthy_deployments(&self, slot: &AgentSlot) -> Vec<RuntimeKind> {
        self.adapters
            .iter()
            .filter(|a| a.is_healthy() && slot.is_deployed_to(a.kind()))
            .map(|a| a.kind())
            .collect()
    }

    async fn execute_with_failover(&self, slot: &AgentSlot, trigger_data: &Map<String, Value>) -> ExecutionResult {
        let primary = slot.primary();

        if self.adapter(primary).is_some_and(|a| a.is_healthy()) {
            let result = self.execute_in_runtime(slot, primary, trigger_data).await;
            if result.is_success() {
                return result;
            }
            warn!(
                "Primary runtime {} failed for {} ({}), trying failover",
                primary, slot.agent_id, result.message
            );
        }

        for kind in self.available_runtimes().await {
            if kind == primary || !slot.is_deployed_to(kind) {
                continue;
            }
            info!("Trying failover to {}", kind);
            let result = self.execute_in_runtime(slot, kind, trigger_data).await;
            if result.is_success() {
                return result;
            }
        }

        if !slot.is_deployed_to(RuntimeKind::Local) {
            match self.deploy_into(slot, RuntimeKind::Local).await {
                Ok(deployment_id) => {
                    warn!("Emergency local deployment of {} as {}", slot.agent_id, deployment_id);
                    return self.execute_in_runtime(slot, RuntimeKind::Local, trigger_data).await;
                }
                Err(e) => error!("Emergency local deployment failed: {}", e),
            }
        }

        ExecutionResult::failed(&slot.agent_id, "All runtimes failed")
    }

    async fn execute_with_load_balance(&self, slot: &AgentSlot, trigger_data: &Map<String, Value>) -> ExecutionResult {
        let healthy = self.healthy_deployments(slot);
        if healthy.is_empty() {
            return ExecutionResult::failed(&slot.agent_id, "No healthy runtimes available");
        }
        let kind = healthy[(slot.execution_count() % healthy.len() as u64) as usize];
        debug!("Load balancing {} onto {}", slot.agent_id, kind);
        self.execute_in_runtime(slot, kind, trigger_data).await
    }

    async fn execute_redundant(&self, slot: &AgentSlot, trigger_data: &Map<String, Value>) -> ExecutionResult {
        let mut results = Vec::new();
        for kind in self.healthy_deployments(slot) {
            results.push(self.execute_in_runtime(slot, kind, trigger_data).await);
        }
        debug!(
            "Redundant run of {} finished on {} runtime(s), {} succeeded",
            slot.agent_id,
            results.len(),
            results.iter().filter(|r| r.is_success()).count()
        );

        match results.iter().position(|r| r.is_success()) {
            Some(index) => results.swap_remove(index),
            None => results
                .pop()
                .unwrap_or_else(|| ExecutionResult::failed(&slot.agent_id, "No runtimes available")),
        }
    }
}

fn choose_runtime(spec: &AgentSpecification, available: &[RuntimeKind]) -> Result<RuntimeKind, OrchestratorError> {
    if let Some(preferred) = spec
        .runtime_preferences
        .iter()
        .copied()
        .find(|kind| available.contains(kind))
    {
        info!("Selected preferred runtime {} for agent {}", preferred, spec.name);
        return Ok(preferred);
    }
    match available.first() {
        Some(&fallback) => {
            info!("Selected fallback runtime {} for agent {}", fallback, spec.name);
            Ok(fallback)
        }
        None => Err(OrchestratorError::NoRuntimeAvailable(spec.name.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cradle_memory::InMemoryStore;
    use cradle_runtime::HealthState;
    use cradle_spec::{Step, StepKind, Trigger};
    use std::sync::atomic::AtomicUsize;

    struct MockAdapter {
        kind: RuntimeKind,
        available: AtomicBool,
        succeed: AtomicBool,
        delay: Duration,
        runs: AtomicUsize,
        checks: AtomicUsize,
        removed: AtomicUsize,
        health: HealthState,
    }

    impl MockAdapter {
        fn build(kind: RuntimeKind, available: bool, succeed: bool, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                kind,
                available: AtomicBool::new(available),
                succeed: AtomicBool::new(succeed),
                delay,
                runs: AtomicUsize::new(0),
                checks: AtomicUsize::new(0),
                removed: AtomicUsize::new(0),
                health: HealthState::default(),
            })
        }

        fn ok(kind: RuntimeKind) -> Arc<Self> {
            Self::build(kind, true, true, Duration::ZERO)
        }

        fn failing(kind: RuntimeKind) -> Arc<Self> {
            Self::build(kind, true, false, Duration::ZERO)
        }

        fn down(kind: RuntimeKind) -> Arc<Self> {
            Self::build(kind, false, true, Duration::ZERO)
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RuntimeAdapter for MockAdapter {
        fn kind(&self) -> RuntimeKind {
            self.kind
        }

        async fn is_available(&self) -> bool {
            self.checks.fetch_add(1, Ordering::SeqCst);
            self.available.load(Ordering::SeqCst)
        }

        async fn deploy_agent(&self, spec: &AgentSpecification) -> Result<String, RuntimeError> {
            Ok(format!("{}_{}", self.kind, spec.id))
        }

        async fn execute_agent(&self, deployment_id: &str, _trigger_data: Map<String, Value>) -> ExecutionResult {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.succeed.load(Ordering::SeqCst) {
                ExecutionResult::success(deployment_id, "ok")
            } else {
                ExecutionResult::failed(deployment_id, "mock failure")
            }
        }

        async fn remove_agent(&self, _deployment_id: &str) -> bool {
            self.removed.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn health(&self) -> &HealthState {
            &self.health
        }
    }

    fn spec(preferences: &[RuntimeKind]) -> AgentSpecification {
        let mut spec = AgentSpecification::new("Digest", "tests");
        spec.triggers.push(Trigger::manual());
        spec.steps.push(Step::new("noop", "No-op", StepKind::Delay));
        spec.runtime_preferences = preferences.to_vec();
        spec
    }

    fn orchestrator(
        adapters: &[Arc<MockAdapter>],
        policy: ExecutionPolicy,
    ) -> (Arc<RuntimeOrchestrator>, Arc<InMemoryStore>) {
        let memory = Arc::new(InMemoryStore::new());
        let adapters: Vec<Arc<dyn RuntimeAdapter>> = adapters
            .iter()
            .map(|a| Arc::clone(a) as Arc<dyn RuntimeAdapter>)
            .collect();
        let config = OrchestratorConfig {
            execution_policy: policy,
            ..Default::default()
        };
        let orchestrator = RuntimeOrchestrator::new(adapters, memory.clone(), config);
        (Arc::new(orchestrator), memory)
    }

    #[test]
    fn test_policy_parse_and_display() {
        for policy in [
            ExecutionPolicy::PrimaryOnly,
            ExecutionPolicy::Failover,
            ExecutionPolicy::LoadBalance,
            ExecutionPolicy::Redundant,
        ] {
            assert_eq!(policy.to_string().parse::<ExecutionPolicy>().unwrap(), policy);
        }
        assert_eq!("load-balance".parse::<ExecutionPolicy>().unwrap(), ExecutionPolicy::LoadBalance);
        assert!("round_robin".parse::<ExecutionPolicy>().is_err());
        assert_eq!(ExecutionPolicy::default(), ExecutionPolicy::Failover);
    }

    #[tokio::test]
    async fn test_adapters_sorted_in_discovery_order() {
        let docker = MockAdapter::ok(RuntimeKind::Docker);
        let local = MockAdapter::ok(RuntimeKind::Local);
        let (orch, _) = orchestrator(&[docker, local], ExecutionPolicy::Failover);
        assert_eq!(orch.runtimes(), vec![RuntimeKind::Local, RuntimeKind::Docker]);
    }

    #[tokio::test]
    async fn test_unhealthy_preference_falls_back() {
        let local = MockAdapter::ok(RuntimeKind::Local);
        let n8n = MockAdapter::down(RuntimeKind::N8n);
        let (orch, _) = orchestrator(&[local, n8n], ExecutionPolicy::Failover);

        let id = orch.deploy_agent(spec(&[RuntimeKind::N8n])).await.unwrap();
        let status = orch.get_agent_status(&id).await.unwrap();
        assert_eq!(status.primary_runtime, RuntimeKind::Local);
        assert_eq!(status.deployments, vec![RuntimeKind::Local]);
    }

    #[tokio::test]
    async fn test_no_healthy_runtime_is_an_error() {
        let n8n = MockAdapter::down(RuntimeKind::N8n);
        let (orch, _) = orchestrator(&[n8n], ExecutionPolicy::Failover);

        let err = orch.deploy_agent(spec(&[RuntimeKind::N8n])).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NoRuntimeAvailable(_)));
        assert!(orch.list_agents().await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_spec_rejected() {
        let local = MockAdapter::ok(RuntimeKind::Local);
        let (orch, _) = orchestrator(&[local.clone()], ExecutionPolicy::Failover);

        let mut bad = spec(&[RuntimeKind::Local]);
        bad.steps.clear();
        let err = orch.deploy_agent(bad).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidSpec(ref m) if m.contains("step")));
    }

    #[tokio::test]
    async fn test_oversized_interval_rejected_at_deploy() {
        let local = MockAdapter::ok(RuntimeKind::Local);
        let (orch, _) = orchestrator(&[local], ExecutionPolicy::Failover);

        let mut long = spec(&[RuntimeKind::Local]);
        long.triggers = vec![Trigger::schedule("every 1000000000000 hours")];
        let err = orch.deploy_agent(long).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidSpec(ref m) if m.contains("every")));
        assert!(orch.list_agents().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_agent() {
        let (orch, _) = orchestrator(&[MockAdapter::ok(RuntimeKind::Local)], ExecutionPolicy::Failover);
        let result = orch.execute_agent("nope", Map::new()).await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.message, "Agent not found");
        assert!(orch.get_agent_status("nope").await.is_none());
    }

    #[tokio::test]
    async fn test_failover_to_next_deployment() {
        let local = MockAdapter::failing(RuntimeKind::Local);
        let n8n = MockAdapter::ok(RuntimeKind::N8n);
        let (orch, memory) = orchestrator(&[local.clone(), n8n.clone()], ExecutionPolicy::Failover);

        let id = orch.deploy_agent(spec(&[RuntimeKind::Local])).await.unwrap();
        let deployment = orch.add_deployment(&id, RuntimeKind::N8n).await.unwrap();
        assert_eq!(orch.add_deployment(&id, RuntimeKind::N8n).await.unwrap(), deployment);

        let result = orch.execute_agent(&id, Map::new()).await;
        assert!(result.is_success());
        assert_eq!(result.runtime_used, Some(RuntimeKind::N8n));
        assert_eq!(result.agent_id, id);

        let status = orch.get_agent_status(&id).await.unwrap();
        assert_eq!(status.execution_count, 2);
        assert_eq!(status.success_count, 1);
        assert_eq!(status.error_count, 1);
        assert_eq!(status.success_rate, 0.5);
        assert!(status.last_execution.is_some());

        let records = memory
            .get_similar("agent execution", 10, Some("agent_execution"))
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().any(|r| r.content == "[agent_execution] Digest: failed in local"));
        assert!(records.iter().any(|r| r.metadata_str("runtime") == Some("n8n")));
    }

    #[tokio::test]
    async fn test_failover_rechecks_fallback_runtimes() {
        let local = MockAdapter::failing(RuntimeKind::Local);
        let n8n = MockAdapter::ok(RuntimeKind::N8n);
        let docker = MockAdapter::ok(RuntimeKind::Docker);
        let (orch, _) = orchestrator(
            &[local.clone(), n8n.clone(), docker.clone()],
            ExecutionPolicy::Failover,
        );

        let id = orch.deploy_agent(spec(&[RuntimeKind::Local])).await.unwrap();
        orch.add_deployment(&id, RuntimeKind::N8n).await.unwrap();
        orch.add_deployment(&id, RuntimeKind::Docker).await.unwrap();

        // n8n recovered since the last sweep, docker went down
        n8n.health().record(false);
        docker.available.store(false, Ordering::SeqCst);

        let result = orch.execute_agent(&id, Map::new()).await;
        assert!(result.is_success());
        assert_eq!(result.runtime_used, Some(RuntimeKind::N8n));
        assert_eq!(docker.runs(), 0);
        assert!(n8n.is_healthy());
        assert!(!docker.is_healthy());
    }

    #[tokio::test]
    async fn test_failover_emergency_local_deploy() {
        let local = MockAdapter::ok(RuntimeKind::Local);
        let n8n = MockAdapter::failing(RuntimeKind::N8n);
        let (orch, _) = orchestrator(&[local.clone(), n8n], ExecutionPolicy::Failover);

        let id = orch.deploy_agent(spec(&[RuntimeKind::N8n])).await.unwrap();
        let result = orch.execute_agent(&id, Map::new()).await;
        assert!(result.is_success());
        assert_eq!(result.runtime_used, Some(RuntimeKind::Local));

        let status = orch.get_agent_status(&id).await.unwrap();
        assert_eq!(status.deployments, vec![RuntimeKind::N8n, RuntimeKind::Local]);
    }

    #[tokio::test]
    async fn test_failover_all_failed() {
        let n8n = MockAdapter::failing(RuntimeKind::N8n);
        let (orch, _) = orchestrator(&[n8n], ExecutionPolicy::Failover);

        let id = orch.deploy_agent(spec(&[RuntimeKind::N8n])).await.unwrap();
        let result = orch.execute_agent(&id, Map::new()).await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.message, "All runtimes failed");
    }

    #[tokio::test]
    async fn test_primary_only_never_falls_back() {
        let local = MockAdapter::failing(RuntimeKind::Local);
        let n8n = MockAdapter::ok(RuntimeKind::N8n);
        let (orch, _) = orchestrator(&[local, n8n.clone()], ExecutionPolicy::PrimaryOnly);

        let id = orch.deploy_agent(spec(&[RuntimeKind::Local])).await.unwrap();
        orch.add_deployment(&id, RuntimeKind::N8n).await.unwrap();

        let result = orch.execute_agent(&id, Map::new()).await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.runtime_used, Some(RuntimeKind::Local));
        assert_eq!(n8n.runs(), 0);
    }

    #[tokio::test]
    async fn test_load_balance_spreads_runs() {
        let adapters = [
            MockAdapter::ok(RuntimeKind::Local),
            MockAdapter::ok(RuntimeKind::N8n),
            MockAdapter::ok(RuntimeKind::Docker),
        ];
        let (orch, _) = orchestrator(&adapters, ExecutionPolicy::LoadBalance);

        let id = orch.deploy_agent(spec(&[RuntimeKind::Local])).await.unwrap();
        orch.add_deployment(&id, RuntimeKind::N8n).await.unwrap();
        orch.add_deployment(&id, RuntimeKind::Docker).await.unwrap();

        for _ in 0..10 {
            assert!(orch.execute_agent(&id, Map::new()).await.is_success());
        }
        for adapter in &adapters {
            assert!((3..=4).contains(&adapter.runs()), "{} ran {} times", adapter.kind, adapter.runs());
        }
    }

    #[tokio::test]
    async fn test_load_balance_without_healthy_runtime() {
        let local = MockAdapter::ok(RuntimeKind::Local);
        let (orch, _) = orchestrator(&[local.clone()], ExecutionPolicy::LoadBalance);

        let id = orch.deploy_agent(spec(&[RuntimeKind::Local])).await.unwrap();
        local.health().record(false);
        let result = orch.execute_agent(&id, Map::new()).await;
        assert_eq!(result.message, "No healthy runtimes available");
        assert_eq!(local.runs(), 0);
    }

    #[tokio::test]
    async fn test_redundant_deploys_everywhere() {
        let local = MockAdapter::failing(RuntimeKind::Local);
        let n8n = MockAdapter::ok(RuntimeKind::N8n);
        let docker = MockAdapter::ok(RuntimeKind::Docker);
        let (orch, _) = orchestrator(
            &[local.clone(), n8n.clone(), docker.clone()],
            ExecutionPolicy::Redundant,
        );

        let id = orch.deploy_agent(spec(&[RuntimeKind::Local])).await.unwrap();
        let status = orch.get_agent_status(&id).await.unwrap();
        assert_eq!(status.deployments.len(), 3);

        let result = orch.execute_agent(&id, Map::new()).await;
        assert!(result.is_success());
        assert_eq!(result.runtime_used, Some(RuntimeKind::N8n));
        assert_eq!(local.runs(), 1);
        assert_eq!(n8n.runs(), 1);
        assert_eq!(docker.runs(), 1);

        let status = orch.get_agent_status(&id).await.unwrap();
        assert_eq!(status.execution_count, 3);
        assert_eq!(status.success_count, 2);
    }

    #[tokio::test]
    async fn test_redundant_returns_last_failure() {
        let local = MockAdapter::failing(RuntimeKind::Local);
        let docker = MockAdapter::failing(RuntimeKind::Docker);
        let (orch, _) = orchestrator(&[local, docker], ExecutionPolicy::Redundant);

        let id = orch.deploy_agent(spec(&[RuntimeKind::Local])).await.unwrap();
        let result = orch.execute_agent(&id, Map::new()).await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.runtime_used, Some(RuntimeKind::Docker));
    }

    #[tokio::test]
    async fn test_sla_timeout() {
        let slow = MockAdapter::build(RuntimeKind::Local, true, true, Duration::from_secs(10));
        let (orch, _) = orchestrator(&[slow], ExecutionPolicy::PrimaryOnly);

        let mut spec = spec(&[RuntimeKind::Local]);
        spec.sla.max_execution_time = 1;
        let id = orch.deploy_agent(spec).await.unwrap();

        let result = orch.execute_agent(&id, Map::new()).await;
        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert_eq!(result.runtime_used, Some(RuntimeKind::Local));
        assert_eq!(orch.get_agent_status(&id).await.unwrap().error_count, 1);
    }

    #[tokio::test]
    async fn test_remove_agent() {
        let local = MockAdapter::ok(RuntimeKind::Local);
        let (orch, _) = orchestrator(&[local.clone()], ExecutionPolicy::Failover);

        let mut spec = spec(&[RuntimeKind::Local]);
        spec.triggers.push(Trigger::schedule("0 9,15,20 * * *"));
        let id = orch.deploy_agent(spec).await.unwrap();
        assert_eq!(orch.get_agent_status(&id).await.unwrap().scheduled_jobs, 1);

        assert!(orch.remove_agent(&id).await);
        assert!(orch.get_agent_status(&id).await.is_none());
        assert!(orch.list_agents().await.is_empty());
        assert_eq!(local.removed.load(Ordering::SeqCst), 1);
        assert!(orch.jobs.jobs_for(&id).await.is_empty());

        assert!(!orch.remove_agent(&id).await);
        assert_eq!(orch.execute_agent(&id, Map::new()).await.message, "Agent not found");
    }

    #[tokio::test]
    async fn test_schedules_registered() {
        let (orch, _) = orchestrator(&[MockAdapter::ok(RuntimeKind::Local)], ExecutionPolicy::Failover);

        let mut spec = spec(&[RuntimeKind::Local]);
        spec.triggers.push(Trigger::schedule("0 */4 * * *"));
        spec.triggers.push(Trigger::schedule("every 2 hours"));
        // Passes the character check but is not a real schedule
        spec.triggers.push(Trigger::schedule("99 99 * * *"));
        let mut disabled = Trigger::schedule("*/5 * * * *");
        disabled.enabled = false;
        spec.triggers.push(disabled);

        let id = orch.deploy_agent(spec).await.unwrap();
        assert_eq!(orch.get_agent_status(&id).await.unwrap().scheduled_jobs, 2);
    }

    #[tokio::test]
    async fn test_redeploy_replaces_agent() {
        let local = MockAdapter::ok(RuntimeKind::Local);
        let (orch, _) = orchestrator(&[local.clone()], ExecutionPolicy::Failover);

        let spec = spec(&[RuntimeKind::Local]);
        orch.deploy_agent(spec.clone()).await.unwrap();
        orch.deploy_agent(spec).await.unwrap();
        assert_eq!(orch.list_agents().await.len(), 1);
        assert_eq!(local.removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_runtime_status_and_health_loop() {
        let local = MockAdapter::ok(RuntimeKind::Local);
        let docker = MockAdapter::down(RuntimeKind::Docker);
        let memory = Arc::new(InMemoryStore::new());
        let config = OrchestratorConfig {
            health_check_interval: Duration::from_millis(100),
            ..Default::default()
        };
        let orch = Arc::new(RuntimeOrchestrator::new(
            vec![
                local.clone() as Arc<dyn RuntimeAdapter>,
                docker.clone() as Arc<dyn RuntimeAdapter>,
            ],
            memory,
            config,
        ));

        orch.start();
        tokio::time::sleep(Duration::from_millis(250)).await;
        orch.stop().await;
        assert!(docker.checks.load(Ordering::SeqCst) >= 2);

        let statuses = orch.get_runtime_status().await;
        assert_eq!(statuses.len(), 2);
        assert!(statuses[0].healthy);
        assert!(!statuses[1].healthy);
        assert!(!statuses[1].available);
        assert_eq!(statuses[0].capabilities, vec!["basic_execution".to_string()]);

        let health = orch.force_health_check().await;
        assert_eq!(health.get(&RuntimeKind::Local), Some(&true));
        assert_eq!(health.get(&RuntimeKind::Docker), Some(&false));
    }
}
