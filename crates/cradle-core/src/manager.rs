//! Agent manager: the entry point that wires agent creation, the
//! orchestrator and documentation search together

use anyhow::Result;
use cradle_memory::MemoryStore;
use cradle_runtime::ExecutionResult;
use cradle_spec::{AgentPlan, AgentSpecification, AgentSpecificationFactory};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::docs::{DOCS_COLLECTION, DocHit, chunk_text, clean_markdown, format_context};
use crate::orchestrator::{AgentStatus, OrchestratorError, RuntimeOrchestrator, RuntimeStatus};

const DEFAULT_OWNER: &str = "cradle";

/// Facade over one orchestrator and its memory store
pub struct AgentManager {
    orchestrator: Arc<RuntimeOrchestrator>,
    memory: Arc<dyn MemoryStore>,
    owner: String,
}

impl AgentManager {
    pub fn new(orchestrator: Arc<RuntimeOrchestrator>, memory: Arc<dyn MemoryStore>) -> Self {
        info!(
            "AgentManager: initialized with runtimes [{}]",
            orchestrator
                .runtimes()
                .iter()
                .map(|k| k.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Self {
            orchestrator,
            memory,
            owner: DEFAULT_OWNER.to_string(),
        }
    }

    /// Owner recorded on agents created through the factory helpers
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn orchestrator(&self) -> &Arc<RuntimeOrchestrator> {
        &self.orchestrator
    }

    pub async fn deploy_spec(&self, spec: AgentSpecification) -> Result<String, OrchestratorError> {
        let name = spec.name.clone();
        let agent_id = self.orchestrator.deploy_agent(spec).await?;
        info!("AgentManager: deployed agent '{}' as {}", name, agent_id);
        Ok(agent_id)
    }

    pub async fn create_rss_agent(
        &self,
        name: &str,
        rss_url: &str,
        chat_id: &str,
        schedule: Option<&str>,
        style: Option<&str>,
    ) -> Result<String, OrchestratorError> {
        let spec =
            AgentSpecificationFactory::rss_monitor(name, &self.owner, rss_url, chat_id, schedule, style);
        self.deploy_spec(spec).await
    }

    pub async fn create_content_agent(
        &self,
        name: &str,
        template_id: &str,
        chat_id: &str,
        topics: &[String],
        schedule: Option<&str>,
    ) -> Result<String, OrchestratorError> {
        let spec = AgentSpecificationFactory::content_generator(
            name,
            &self.owner,
            template_id,
            chat_id,
            topics,
            schedule,
        );
        self.deploy_spec(spec).await
    }

    /// Build and deploy an agent from a loose plan
    pub async fn create_from_plan(&self, plan: AgentPlan) -> Result<String, OrchestratorError> {
        let spec = plan
            .into_spec(&self.owner)
            .map_err(OrchestratorError::InvalidSpec)?;
        self.deploy_spec(spec).await
    }

    pub async fn execute_agent(&self, agent_id: &str, trigger_data: Map<String, Value>) -> ExecutionResult {
        let result = self.orchestrator.execute_agent(agent_id, trigger_data).await;
        debug!(
            "AgentManager: {} finished with {} ({})",
            agent_id, result.status, result.message
        );
        result
    }

    pub async fn remove_agent(&self, agent_id: &str) -> bool {
        self.orchestrator.remove_agent(agent_id).await
    }

    pub async fn list_agents(&self) -> Vec<AgentStatus> {
        self.orchestrator.list_agents().await
    }

    pub async fn get_agent_status(&self, agent_id: &str) -> Option<AgentStatus> {
        self.orchestrator.get_agent_status(agent_id).await
    }

    pub async fn runtime_status(&self) -> Vec<RuntimeStatus> {
        self.orchestrator.get_runtime_status().await
    }

    /// Clean, chunk and store one documentation page. Returns the number of
    /// chunks stored.
    pub async fn index_document(&self, source_file: &str, url: &str, markdown: &str) -> Result<usize> {
        let cleaned = clean_markdown(markdown);
        if cleaned.is_empty() {
            warn!("AgentManager: {} has no indexable text", source_file);
            return Ok(0);
        }

        let chunks = chunk_text(&cleaned);
        for (index, chunk) in chunks.iter().enumerate() {
            let mut metadata = Map::new();
            metadata.insert("type".into(), json!("n8n_doc"));
            metadata.insert("source_file".into(), json!(source_file));
            metadata.insert("chunk_index".into(), json!(index));
            metadata.insert("url".into(), json!(url));
            self.memory
                .store_in(DOCS_COLLECTION, chunk, metadata)
                .await?;
        }
        debug!("AgentManager: indexed {} chunk(s) from {}", chunks.len(), source_file);
        Ok(chunks.len())
    }

    /// Best matching documentation chunks for a query
    pub async fn search_docs(&self, query: &str, k: usize) -> Result<Vec<DocHit>> {
        let records = self.memory.query(DOCS_COLLECTION, query, k).await?;
        Ok(records.iter().map(DocHit::from_record).collect())
    }

    /// Documentation context for a prompt; empty when nothing matches
    pub async fn build_docs_context(&self, query: &str, k: usize) -> Result<String> {
        let hits = self.search_docs(query, k).await?;
        Ok(format_context(&hits))
    }
}
