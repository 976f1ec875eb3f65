//! Narrow collaborator interfaces used by the local runtime: content
//! generation (LLM) and message delivery (Telegram)

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

/// Produces text from a prompt
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    fn name(&self) -> &str;

    /// `model` may be empty, meaning the generator's default
    async fn generate(&self, prompt: &str, model: &str, max_tokens: u32) -> Result<String>;
}

/// Delivers a message to a chat
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(
        &self,
        platform: &str,
        chat_id: &str,
        text: &str,
        parse_mode: Option<&str>,
    ) -> Result<()>;
}

/// Deterministic generator used when no LLM is configured
#[derive(Debug, Default, Clone)]
pub struct StubGenerator;

#[async_trait]
impl ContentGenerator for StubGenerator {
    fn name(&self) -> &str {
        "stub"
    }

    async fn generate(&self, prompt: &str, _model: &str, _max_tokens: u32) -> Result<String> {
        let head: String = prompt.chars().take(50).collect();
        Ok(format!("Generated content for prompt: {}...", head))
    }
}

/// Ollama `/api/generate` client
#[derive(Clone)]
pub struct OllamaGenerator {
    client: Client,
    base_url: String,
    default_model: String,
}

impl std::fmt::Debug for OllamaGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OllamaGenerator")
            .field("client", &"<reqwest::Client>")
            .field("base_url", &self.base_url)
            .field("default_model", &self.default_model)
            .finish()
    }
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

impl OllamaGenerator {
    pub fn new(base_url: impl Into<String>, default_model: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            default_model: default_model.into(),
        })
    }
}

#[async_trait]
impl ContentGenerator for OllamaGenerator {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn generate(&self, prompt: &str, model: &str, max_tokens: u32) -> Result<String> {
        let model = if model.is_empty() {
            self.default_model.as_str()
        } else {
            model
        };
        let url = format!("{}/api/generate", self.base_url);
        let body = serde_json::json!({
            "model": model,
            "prompt": prompt,
            "stream": false,
            "options": { "num_predict": max_tokens },
        });

        debug!("Sending generate request to Ollama ({})", model);

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("Failed to send request to Ollama API")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow!(
                "Ollama request failed with status {}: {}",
                status,
                error_text
            ));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .context("Failed to parse Ollama API response")?;
        Ok(parsed.response.trim().to_string())
    }
}

/// Sender that only logs what it would have sent
#[derive(Debug, Default, Clone)]
pub struct LogSender;

#[async_trait]
impl MessageSender for LogSender {
    async fn send(
        &self,
        platform: &str,
        chat_id: &str,
        text: &str,
        _parse_mode: Option<&str>,
    ) -> Result<()> {
        let preview: String = text.chars().take(100).collect();
        info!("Sending message to {} chat {}: {}...", platform, chat_id, preview);
        Ok(())
    }
}

/// Telegram Bot API `sendMessage` client
#[derive(Clone)]
pub struct TelegramSender {
    client: Client,
    api_base: String,
    bot_token: String,
}

impl std::fmt::Debug for TelegramSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramSender")
            .field("api_base", &self.api_base)
            .field("bot_token", &"[REDACTED]")
            .finish()
    }
}

#[derive(Deserialize)]
struct TelegramResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

impl TelegramSender {
    pub fn new(api_base: impl Into<String>, bot_token: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            bot_token: bot_token.into(),
        })
    }
}

#[async_trait]
impl MessageSender for TelegramSender {
    async fn send(
        &self,
        platform: &str,
        chat_id: &str,
        text: &str,
        parse_mode: Option<&str>,
    ) -> Result<()> {
        if platform != "telegram" {
            bail!("unsupported messaging platform: {}", platform);
        }
        if chat_id.is_empty() {
            bail!("chat_id is required");
        }

        let url = format!("{}/bot{}/sendMessage", self.api_base, self.bot_token);
        let mut body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        });
        if let Some(mode) = parse_mode {
            body["parse_mode"] = serde_json::Value::String(mode.to_string());
        }

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("Failed to send Telegram message")?;

        let status = response.status();
        let parsed: TelegramResponse = response
            .json()
            .await
            .with_context(|| format!("Unexpected Telegram response (status {})", status))?;
        if !parsed.ok {
            bail!(
                "Telegram rejected message: {}",
                parsed.description.unwrap_or_else(|| status.to_string())
            );
        }
        debug!("Telegram message delivered to {}", chat_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stub_generator_is_deterministic() {
        let generator = StubGenerator;
        let a = generator.generate("Write about Rust", "mistral", 100).await.unwrap();
        let b = generator.generate("Write about Rust", "", 10).await.unwrap();
        assert_eq!(a, b);
        assert!(a.contains("Write about Rust"));
    }

    #[tokio::test]
    async fn test_log_sender_accepts_anything() {
        assert!(LogSender.send("telegram", "1", "hello", Some("HTML")).await.is_ok());
    }

    #[tokio::test]
    async fn test_telegram_rejects_other_platforms() {
        let sender = TelegramSender::new("http://127.0.0.1:9", "token").unwrap();
        let err = sender.send("slack", "1", "hi", None).await.unwrap_err();
        assert!(err.to_string().contains("unsupported"));
    }

    #[test]
    fn test_debug_hides_token() {
        let sender = TelegramSender::new("https://api.telegram.org", "123:secret").unwrap();
        let debug = format!("{:?}", sender);
        assert!(!debug.contains("secret"));
    }
}
