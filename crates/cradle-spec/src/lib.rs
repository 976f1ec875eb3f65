//! cradle-spec - neutral agent specification format
//!
//! This crate provides:
//! - The `AgentSpecification` data model (triggers, steps, SLA, secrets, runtime preferences)
//! - JSON and YAML round-tripping through serde
//! - Structural validation returning human-readable errors
//! - Factory helpers for the stock RSS monitor and content generator agents

pub mod factory;
pub mod spec;
pub mod validate;

pub use factory::{AgentPlan, AgentSpecificationFactory, PlanKind};
pub use spec::{
    AgentSpecification, Backoff, ErrorAction, ErrorHandling, Metadata, RetryPolicy, RuntimeKind,
    MAX_RETRY_DELAY, Secrets, Sla, SpecError, Step, StepKind, Trigger, TriggerKind,
    parse_step_reference,
};
pub use validate::{
    MAX_INTERVAL_SECS, MAX_RETRY_BASE_DELAY_MS, PRIORITIES, is_interval_shorthand, is_loose_cron,
};
