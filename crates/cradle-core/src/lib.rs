//! cradle-core - orchestration for declarative agents
//!
//! This crate provides:
//! - `RuntimeOrchestrator`: runtime selection, execution policies (primary-only,
//!   failover, load-balance, redundant), schedule dispatch and health monitoring
//! - `AgentManager`: the facade used by the CLI to create, run and inspect agents
//! - n8n documentation chunking and search over the memory store

pub mod docs;
pub mod manager;
pub mod orchestrator;

pub use docs::{DOCS_COLLECTION, DocHit};
pub use manager::AgentManager;
pub use orchestrator::{
    AgentStatus, DeployedAgent, ExecutionPolicy, OrchestratorConfig, OrchestratorError,
    RuntimeOrchestrator, RuntimeStatus,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crate_exports() {
        let _ = std::mem::size_of::<RuntimeOrchestrator>();
        let _ = std::mem::size_of::<AgentManager>();
        let _ = std::mem::size_of::<AgentStatus>();
        let _ = std::mem::size_of::<ExecutionPolicy>();
    }

    #[test]
    fn test_package_metadata() {
        assert_eq!(env!("CARGO_PKG_LICENSE"), "MIT");
        assert!(!env!("CARGO_PKG_DESCRIPTION").is_empty());
    }
}
