//! Ready-made specifications for the stock agent types

use crate::spec::{AgentSpecification, RuntimeKind, Step, StepKind, Trigger};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_RSS_SCHEDULE: &str = "0 9,15,20 * * *";
pub const DEFAULT_CONTENT_SCHEDULE: &str = "0 */4 * * *";
pub const DEFAULT_STYLE: &str = "informative style";

/// Builders for the RSS monitor and content generator agents
pub struct AgentSpecificationFactory;

impl AgentSpecificationFactory {
    /// Feed -> unseen items -> rewritten posts -> Telegram
    pub fn rss_monitor(
        name: &str,
        owner: &str,
        rss_url: &str,
        chat_id: &str,
        schedule: Option<&str>,
        style: Option<&str>,
    ) -> AgentSpecification {
        let mut spec = AgentSpecification::new(name, owner);
        let style = style.unwrap_or(DEFAULT_STYLE);

        spec.triggers
            .push(Trigger::schedule(schedule.unwrap_or(DEFAULT_RSS_SCHEDULE)));

        spec.steps.push(
            Step::new("fetch_rss", "Fetch RSS feed", StepKind::ParseRss)
                .with_config("url", rss_url)
                .with_config("max_items", 5)
                .with_config("include_content", true)
                .with_output("items", "rss_data"),
        );
        spec.steps.push(
            Step::new("filter_new", "Filter new items", StepKind::FilterData)
                .with_config("memory_key", format!("rss_last_check_{}", spec.id))
                .with_config("dedupe_by", "link")
                .with_input("items", "step:fetch_rss:rss_data")
                .with_output("items", "new_items"),
        );
        spec.steps.push(
            Step::new("generate_content", "Generate content", StepKind::GenerateContent)
                .with_config(
                    "prompt_template",
                    format!(
                        "Rewrite this news item in {}. Title: {{title}}, Content: {{content}}",
                        style
                    ),
                )
                .with_config("model", "mistral")
                .with_config("max_tokens", 500)
                .with_input("items", "step:filter_new:new_items")
                .with_output("generated_content", "content_data"),
        );
        spec.steps.push(telegram_step(chat_id));

        spec.secrets.references.insert(
            "telegram_token".to_string(),
            "secret://telegram/bot_token".to_string(),
        );
        spec.metadata.description = format!("RSS monitor for {}", rss_url);
        spec.metadata.tags = vec!["rss".into(), "telegram".into(), "content".into()];
        spec.sla.max_execution_time = 180;
        spec.runtime_preferences = vec![RuntimeKind::Local, RuntimeKind::N8n, RuntimeKind::Docker];
        spec
    }

    /// Random topic -> templated post -> Telegram
    pub fn content_generator(
        name: &str,
        owner: &str,
        template_id: &str,
        chat_id: &str,
        topics: &[String],
        schedule: Option<&str>,
    ) -> AgentSpecification {
        let mut spec = AgentSpecification::new(name, owner);

        spec.triggers
            .push(Trigger::schedule(schedule.unwrap_or(DEFAULT_CONTENT_SCHEDULE)));

        let choices: Vec<Value> = topics.iter().cloned().map(Value::String).collect();
        spec.steps.push(
            Step::new("select_topic", "Select topic", StepKind::TransformData)
                .with_config("operation", "pick_random")
                .with_config("choices", choices)
                .with_output("transformed_data", "current_topic"),
        );
        spec.steps.push(
            Step::new("generate_content", "Generate content", StepKind::GenerateContent)
                .with_config("template_id", template_id)
                .with_config(
                    "prompt_template",
                    format!("[{}] Write a short post about {{topic}}", template_id),
                )
                .with_config("model", "mistral")
                .with_config("max_tokens", 800)
                .with_input("topic", "step:select_topic:current_topic")
                .with_output("generated_content", "content_data"),
        );
        spec.steps.push(telegram_step(chat_id));

        spec.secrets.references.insert(
            "telegram_token".to_string(),
            "secret://telegram/bot_token".to_string(),
        );
        spec.metadata.description = format!("Content generator for topics: {}", topics.join(", "));
        spec.metadata.tags = vec!["content".into(), "telegram".into(), "generator".into()];
        spec.runtime_preferences = vec![RuntimeKind::Local, RuntimeKind::Docker];
        spec
    }
}

fn telegram_step(chat_id: &str) -> Step {
    Step::new("send_telegram", "Send to Telegram", StepKind::SendMessage)
        .with_config("platform", "telegram")
        .with_config("chat_id", chat_id)
        .with_config("parse_mode", "HTML")
        .with_input("content", "step:generate_content:content_data")
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    RssMonitor,
    ContentGenerator,
}

/// Loose agent description as produced by planners and older config files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPlan {
    #[serde(rename = "type")]
    pub kind: PlanKind,
    pub name: String,
    #[serde(default)]
    pub chat_id: String,
    #[serde(default)]
    pub rss_url: Option<String>,
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
}

impl AgentPlan {
    /// Build the full specification for this plan
    pub fn into_spec(self, owner: &str) -> Result<AgentSpecification, String> {
        match self.kind {
            PlanKind::RssMonitor => {
                let rss_url = self
                    .rss_url
                    .filter(|u| !u.trim().is_empty())
                    .ok_or_else(|| format!("plan '{}' has no rss_url", self.name))?;
                Ok(AgentSpecificationFactory::rss_monitor(
                    &self.name,
                    owner,
                    &rss_url,
                    &self.chat_id,
                    self.schedule.as_deref(),
                    self.style.as_deref(),
                ))
            }
            PlanKind::ContentGenerator => {
                if self.topics.is_empty() {
                    return Err(format!("plan '{}' has no topics", self.name));
                }
                let template_id = self.template_id.as_deref().unwrap_or("default");
                Ok(AgentSpecificationFactory::content_generator(
                    &self.name,
                    owner,
                    template_id,
                    &self.chat_id,
                    &self.topics,
                    self.schedule.as_deref(),
                ))
            }
        }
    }
}
