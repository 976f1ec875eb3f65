//! cradle-runtime - execution backends for agent specifications
//!
//! This crate provides:
//! - The `RuntimeAdapter` trait shared by every backend
//! - An in-process `LocalRuntime` that interprets steps directly
//! - `N8nRuntime` (workflows over the n8n REST API) and `DockerRuntime` (images via the docker CLI)
//! - Collaborator traits for content generation and message delivery
//! - A small RSS/Atom reader used by `parse_rss` steps

pub mod adapter;
pub mod docker;
pub mod local;
pub mod n8n;
pub mod result;
pub mod rss;
pub mod services;

pub use adapter::{HealthState, RuntimeAdapter, RuntimeError};
pub use docker::{DockerConfig, DockerRuntime};
pub use local::{LocalConfig, LocalRuntime};
pub use n8n::{N8nConfig, N8nRuntime};
pub use result::{ExecutionResult, ExecutionStatus};
pub use services::{
    ContentGenerator, LogSender, MessageSender, OllamaGenerator, StubGenerator, TelegramSender,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crate_exports() {
        let _ = std::mem::size_of::<LocalRuntime>();
        let _ = std::mem::size_of::<N8nRuntime>();
        let _ = std::mem::size_of::<DockerRuntime>();
        let _ = std::mem::size_of::<ExecutionResult>();
    }

    #[test]
    fn test_package_metadata() {
        assert_eq!(env!("CARGO_PKG_LICENSE"), "MIT");
        assert!(!env!("CARGO_PKG_DESCRIPTION").is_empty());
    }
}
