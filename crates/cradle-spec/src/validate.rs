//! Structural validation for agent specifications

use crate::spec::{AgentSpecification, SpecError, TriggerKind, parse_step_reference};
use std::collections::HashSet;

/// Accepted values for `sla.priority`
pub const PRIORITIES: [&str; 4] = ["low", "normal", "high", "critical"];

/// Character-class check for cron strings.
///
/// Accepts digits, `*`, `-`, `,`, `/` and whitespace. It does not check field
/// counts or ranges; the scheduler parses expressions properly when it
/// registers them.
pub fn is_loose_cron(expr: &str) -> bool {
    let trimmed = expr.trim();
    !trimmed.is_empty()
        && trimmed
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_whitespace() || matches!(c, '*' | '-' | ',' | '/'))
}

/// Longest period the interval shorthand may describe (ten years)
pub const MAX_INTERVAL_SECS: u64 = 10 * 365 * 24 * 3600;

/// Longest base delay a step retry policy may ask for (one hour)
pub const MAX_RETRY_BASE_DELAY_MS: u64 = 3_600_000;

/// Legacy `every N hours` / `every N minutes` schedule form, at most ten years
pub fn is_interval_shorthand(expr: &str) -> bool {
    let parts: Vec<String> = expr.split_whitespace().map(str::to_lowercase).collect();
    let [every, count, unit] = parts.as_slice() else {
        return false;
    };
    let unit_secs: u64 = match unit.trim_end_matches('s') {
        "hour" => 3600,
        "minute" | "min" => 60,
        _ => return false,
    };
    every == "every"
        && count
            .parse::<u64>()
            .ok()
            .filter(|n| *n > 0)
            .and_then(|n| n.checked_mul(unit_secs))
            .is_some_and(|secs| secs <= MAX_INTERVAL_SECS)
}

impl AgentSpecification {
    /// Check the spec and return every problem found. Empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("Agent name is required".to_string());
        }
        if self.owner.trim().is_empty() {
            errors.push("Agent owner is required".to_string());
        }
        if self.triggers.is_empty() {
            errors.push("At least one trigger is required".to_string());
        }
        if self.steps.is_empty() {
            errors.push("At least one step is required".to_string());
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                errors.push(format!("Step '{}' has an empty id", step.name));
            } else if !seen.insert(step.id.as_str()) {
                errors.push(format!("Duplicate step ID: {}", step.id));
            }
        }

        for step in &self.steps {
            for (input, reference) in &step.inputs {
                if let Some((target, _)) = parse_step_reference(reference) {
                    if !seen.contains(target) {
                        errors.push(format!(
                            "Step {} input '{}' references unknown step: {}",
                            step.id, input, target
                        ));
                    }
                }
            }
            if step.retry.max_attempts == 0 {
                errors.push(format!("Step {} retry max_attempts must be at least 1", step.id));
            }
            if step.retry.base_delay_ms > MAX_RETRY_BASE_DELAY_MS {
                errors.push(format!(
                    "Step {} retry base_delay_ms must be at most {}, got {}",
                    step.id, MAX_RETRY_BASE_DELAY_MS, step.retry.base_delay_ms
                ));
            }
        }

        for trigger in &self.triggers {
            if trigger.kind != TriggerKind::Schedule {
                continue;
            }
            match trigger.cron_expr() {
                Some(cron) if is_loose_cron(cron) || is_interval_shorthand(cron) => {}
                Some(cron) => errors.push(format!("Invalid cron expression: {}", cron)),
                None => errors.push("Schedule trigger is missing a cron expression".to_string()),
            }
        }

        if self.sla.max_execution_time == 0 {
            errors.push("SLA max_execution_time must be positive".to_string());
        }
        if self.sla.max_memory_mb == 0 {
            errors.push("SLA max_memory_mb must be positive".to_string());
        }
        if !(1..=100).contains(&self.sla.max_cpu_percent) {
            errors.push(format!(
                "SLA max_cpu_percent must be between 1 and 100, got {}",
                self.sla.max_cpu_percent
            ));
        }
        if !PRIORITIES.contains(&self.sla.priority.as_str()) {
            errors.push(format!("Invalid SLA priority: {}", self.sla.priority));
        }

        errors
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_empty()
    }

    /// Like [`Self::validate`] but as a `Result`
    pub fn ensure_valid(&self) -> Result<(), SpecError> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(SpecError::Invalid(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{Step, StepKind, Trigger};

    fn valid_spec() -> AgentSpecification {
        let mut spec = AgentSpecification::new("Watcher", "alice");
        spec.triggers.push(Trigger::schedule("0 9,15,20 * * *"));
        spec.steps
            .push(Step::new("a", "First", StepKind::HttpRequest).with_output("body", "page"));
        spec.steps
            .push(Step::new("b", "Second", StepKind::TransformData).with_input("text", "step:a:page"));
        spec
    }

    #[test]
    fn test_valid_spec_passes() {
        assert!(valid_spec().validate().is_empty());
        assert!(valid_spec().ensure_valid().is_ok());
    }

    #[test]
    fn test_missing_triggers_and_steps() {
        let spec = AgentSpecification::new("Empty", "alice");
        let errors = spec.validate();
        assert!(errors.iter().any(|e| e.contains("trigger")));
        assert!(errors.iter().any(|e| e.contains("step")));
    }

    #[test]
    fn test_duplicate_step_ids() {
        let mut spec = valid_spec();
        spec.steps.push(Step::new("a", "Again", StepKind::Delay));
        let errors = spec.validate();
        assert_eq!(errors, vec!["Duplicate step ID: a".to_string()]);
    }

    #[test]
    fn test_dangling_reference() {
        let mut spec = valid_spec();
        spec.steps[1]
            .inputs
            .insert("other".to_string(), "step:ghost:data".to_string());
        let errors = spec.validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("ghost"));
    }

    #[test]
    fn test_plain_context_reference_is_fine() {
        let mut spec = valid_spec();
        spec.steps[1]
            .inputs
            .insert("seed".to_string(), "trigger_value".to_string());
        assert!(spec.is_valid());
    }

    #[test]
    fn test_cron_character_check() {
        assert!(is_loose_cron("*/5 * * * *"));
        assert!(is_loose_cron("0 9,15,20 * * 1-5"));
        assert!(!is_loose_cron("every 4 hours"));
        assert!(!is_loose_cron(""));
        assert!(is_interval_shorthand("every 4 hours"));
        assert!(is_interval_shorthand("Every 15 minutes"));
        assert!(!is_interval_shorthand("every 0 hours"));
        assert!(!is_interval_shorthand("every day"));
        assert!(is_interval_shorthand("every 87600 hours"));
        assert!(!is_interval_shorthand("every 87601 hours"));
        assert!(!is_interval_shorthand("every 18446744073709551615 hours"));

        let mut spec = valid_spec();
        spec.triggers.push(Trigger::schedule("@daily"));
        assert!(spec.validate()[0].contains("@daily"));
    }

    #[test]
    fn test_oversized_interval_rejected() {
        let mut spec = valid_spec();
        spec.triggers = vec![Trigger::schedule("every 1000000000000 hours")];
        let errors = spec.validate();
        assert_eq!(errors, vec!["Invalid cron expression: every 1000000000000 hours".to_string()]);
    }

    #[test]
    fn test_retry_base_delay_bound() {
        let mut spec = valid_spec();
        spec.steps[0].retry.base_delay_ms = u64::MAX;
        let errors = spec.validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("base_delay_ms"));

        spec.steps[0].retry.base_delay_ms = MAX_RETRY_BASE_DELAY_MS;
        assert!(spec.is_valid());
    }

    #[test]
    fn test_sla_bounds() {
        let mut spec = valid_spec();
        spec.sla.max_cpu_percent = 0;
        spec.sla.max_memory_mb = 0;
        spec.sla.priority = "urgent".to_string();
        let errors = spec.validate();
        assert_eq!(errors.len(), 3);

        spec.sla.max_cpu_percent = 100;
        spec.sla.max_memory_mb = 64;
        spec.sla.priority = "critical".to_string();
        assert!(spec.is_valid());
    }

    #[test]
    fn test_ensure_valid_collects_messages() {
        let spec = AgentSpecification::new("", "");
        match spec.ensure_valid() {
            Err(SpecError::Invalid(errors)) => assert!(errors.len() >= 4),
            other => panic!("expected invalid, got {:?}", other),
        }
    }
}
