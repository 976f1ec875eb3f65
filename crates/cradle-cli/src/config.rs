use anyhow::{Context, Result};
use cradle_core::{ExecutionPolicy, OrchestratorConfig};
use cradle_runtime::{DockerConfig, LocalConfig, N8nConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CradleConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub local: LocalSection,
    #[serde(default)]
    pub n8n: N8nSection,
    #[serde(default)]
    pub docker: DockerSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub telegram: TelegramSection,
    #[serde(default)]
    pub memory: MemorySection,
    #[serde(default)]
    pub agents: AgentsSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default)]
    pub execution_policy: ExecutionPolicy,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
}

fn default_health_check_interval() -> u64 {
    60
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            execution_policy: ExecutionPolicy::default(),
            health_check_interval_secs: default_health_check_interval(),
        }
    }
}

impl OrchestratorSection {
    pub fn to_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            execution_policy: self.execution_policy,
            health_check_interval: Duration::from_secs(self.health_check_interval_secs.max(1)),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalSection {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
}

fn default_max_concurrent() -> usize {
    5
}

fn default_max_delay() -> u64 {
    60
}

impl Default for LocalSection {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_delay_secs: default_max_delay(),
        }
    }
}

impl LocalSection {
    pub fn to_runtime_config(&self) -> LocalConfig {
        LocalConfig {
            max_concurrent: self.max_concurrent.max(1),
            max_delay: Duration::from_secs(self.max_delay_secs),
        }
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct N8nSection {
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub api_key: String,
}

impl std::fmt::Debug for N8nSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("N8nSection")
            .field("api_url", &self.api_url)
            .field("username", &self.username)
            .field("password", &mask_secret(&self.password))
            .field("api_key", &mask_secret(&self.api_key))
            .finish()
    }
}

impl N8nSection {
    pub fn enabled(&self) -> bool {
        !self.api_url.trim().is_empty()
    }

    pub fn to_runtime_config(&self) -> N8nConfig {
        N8nConfig {
            api_url: self.api_url.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            api_key: Some(self.api_key.clone()).filter(|k| !k.is_empty()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_docker_bin")]
    pub docker_bin: String,
    #[serde(default = "default_base_image")]
    pub base_image: String,
    #[serde(default = "default_build_dir")]
    pub build_dir: String,
    #[serde(default = "default_build_timeout")]
    pub build_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_docker_bin() -> String {
    "docker".to_string()
}

fn default_base_image() -> String {
    "alpine:3.20".to_string()
}

fn default_build_dir() -> String {
    "~/.cradle/docker_agents".to_string()
}

fn default_build_timeout() -> u64 {
    300
}

impl Default for DockerSection {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            docker_bin: default_docker_bin(),
            base_image: default_base_image(),
            build_dir: default_build_dir(),
            build_timeout_secs: default_build_timeout(),
        }
    }
}

impl DockerSection {
    pub fn to_runtime_config(&self) -> DockerConfig {
        DockerConfig {
            docker_bin: self.docker_bin.clone(),
            base_image: self.base_image.clone(),
            build_dir: expand_path(&self.build_dir),
            build_timeout: Duration::from_secs(self.build_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
}

fn default_llm_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_llm_model() -> String {
    "mistral".to_string()
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_llm_base_url(),
            model: default_llm_model(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct TelegramSection {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default = "default_telegram_api_base")]
    pub api_base: String,
}

impl std::fmt::Debug for TelegramSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramSection")
            .field("bot_token", &mask_secret(&self.bot_token))
            .field("api_base", &self.api_base)
            .finish()
    }
}

fn default_telegram_api_base() -> String {
    "https://api.telegram.org".to_string()
}

impl Default for TelegramSection {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            api_base: default_telegram_api_base(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySection {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String {
    "~/.cradle/memory.db".to_string()
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsSection {
    #[serde(default = "default_agents_dir")]
    pub dir: String,
    #[serde(default = "default_owner")]
    pub owner: String,
}

fn default_agents_dir() -> String {
    "~/.cradle/agents".to_string()
}

fn default_owner() -> String {
    "cradle".to_string()
}

impl Default for AgentsSection {
    fn default() -> Self {
        Self {
            dir: default_agents_dir(),
            owner: default_owner(),
        }
    }
}

impl CradleConfig {
    /// Load from `custom_path`, or `~/.cradle/config.toml`. A missing default
    /// file falls back to built-in defaults; a missing explicit file is an error.
    pub fn load(custom_path: &Option<PathBuf>) -> Result<Self> {
        let path = match custom_path {
            Some(path) => path.clone(),
            None => {
                let path = config_dir().join("config.toml");
                if !path.exists() {
                    info!("No config at {}, using defaults", path.display());
                    return Ok(Self::default());
                }
                path
            }
        };
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = std::fs::metadata(path) {
                let mode = metadata.permissions().mode();
                if mode & 0o077 != 0 {
                    anyhow::bail!(
                        "Config file {:?} has overly permissive permissions ({:o}). \
                         It may contain secrets. Fix with: chmod 600 {:?}",
                        path,
                        mode & 0o777,
                        path
                    );
                }
            }
        }

        let content = std::fs::read_to_string(path).with_context(|| {
            format!(
                "Failed to read config at {}. Run `cradle init` first.",
                path.display()
            )
        })?;

        let config: Self = toml::from_str(&expand_env_vars(&content))
            .with_context(|| format!("Failed to parse config at {}", path.display()))?;

        if is_hardcoded(&content, "bot_token", &config.telegram.bot_token) {
            warn!(
                "Telegram bot token is hardcoded in config file. Use bot_token = \"${{TELEGRAM_BOT_TOKEN}}\" instead"
            );
        }
        if is_hardcoded(&content, "password", &config.n8n.password) {
            warn!("n8n password is hardcoded in config file. Use password = \"${{N8N_PASSWORD}}\" instead");
        }

        Ok(config)
    }

    /// Copy with every secret masked, for display
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.n8n.password = mask_secret(&copy.n8n.password);
        copy.n8n.api_key = mask_secret(&copy.n8n.api_key);
        copy.telegram.bot_token = mask_secret(&copy.telegram.bot_token);
        copy
    }

    pub fn agents_dir(&self) -> PathBuf {
        expand_path(&self.agents.dir)
    }

    pub fn db_path(&self) -> PathBuf {
        expand_path(&self.memory.db_path)
    }
}

/// Non-empty secret whose raw config line does not reference an env var
fn is_hardcoded(raw: &str, key: &str, value: &str) -> bool {
    !value.is_empty()
        && raw
            .lines()
            .map(str::trim)
            .filter(|line| line.starts_with(key))
            .any(|line| !line.contains("${"))
}

/// Environment variables that `${NAME}` references may expand
const ALLOWED_ENV_VARS: &[&str] = &[
    "N8N_API_URL",
    "N8N_USER",
    "N8N_PASSWORD",
    "N8N_API_KEY",
    "TELEGRAM_BOT_TOKEN",
    "OLLAMA_BASE_URL",
    "OLLAMA_MODEL",
    "CRADLE_HOME",
    "HOME",
    "USER",
];

/// Replace allowlisted `${VAR}` references; unknown names are left in place
fn expand_env_vars(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start..].find('}') else {
            break;
        };
        let name = &rest[start + 2..start + len];
        out.push_str(&rest[..start]);
        if ALLOWED_ENV_VARS.contains(&name) {
            out.push_str(&std::env::var(name).unwrap_or_default());
        } else {
            warn!(
                "Skipping expansion of unrecognized env var '{}' in config (not in allowlist)",
                name
            );
            out.push_str(&rest[start..=start + len]);
        }
        rest = &rest[start + len + 1..];
    }
    out.push_str(rest);
    out
}

pub fn mask_secret(s: &str) -> String {
    if s.is_empty() {
        return "(empty)".to_string();
    }
    let chars: Vec<char> = s.chars().collect();
    if chars.len() > 7 {
        let prefix: String = chars[..3].iter().collect();
        let suffix: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", prefix, suffix)
    } else {
        "***".to_string()
    }
}

/// `~/x` relative to the home directory, anything else as given
pub fn expand_path(raw: &str) -> PathBuf {
    match raw.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(raw),
    }
}

/// `$CRADLE_HOME`, or `~/.cradle`
pub fn config_dir() -> PathBuf {
    match std::env::var("CRADLE_HOME") {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".cradle"),
    }
}

pub const DEFAULT_CONFIG: &str = include_str!("../../../config/default.toml");

#[cfg(test)]
mod tests {
    use super::*;

    fn write_private(dir: &Path, content: &str) -> PathBuf {
        let path = dir.join("config.toml");
        std::fs::write(&path, content).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();
        }
        path
    }

    #[test]
    fn test_default_template_parses() {
        let config: CradleConfig = toml::from_str(&expand_env_vars(DEFAULT_CONFIG)).unwrap();
        assert_eq!(config.orchestrator.execution_policy, ExecutionPolicy::Failover);
        assert_eq!(config.orchestrator.health_check_interval_secs, 60);
        assert_eq!(config.local.max_concurrent, 5);
        assert!(config.docker.enabled);
        assert!(!config.llm.enabled);
        assert_eq!(config.agents.owner, "cradle");
    }

    #[test]
    fn test_sections_default_when_missing() {
        let config: CradleConfig = toml::from_str("[orchestrator]\nexecution_policy = \"load_balance\"\n").unwrap();
        assert_eq!(config.orchestrator.execution_policy, ExecutionPolicy::LoadBalance);
        assert_eq!(config.orchestrator.health_check_interval_secs, 60);
        assert_eq!(config.docker.base_image, "alpine:3.20");
        assert_eq!(config.telegram.api_base, "https://api.telegram.org");
        assert!(!config.n8n.enabled());
        assert!(config.n8n.to_runtime_config().api_key.is_none());
    }

    #[test]
    fn test_unknown_policy_rejected() {
        let parsed = toml::from_str::<CradleConfig>("[orchestrator]\nexecution_policy = \"random\"\n");
        assert!(parsed.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_private(
            dir.path(),
            "[n8n]\napi_url = \"http://n8n:5678/api/v1\"\nusername = \"admin\"\n\n[local]\nmax_concurrent = 2\n",
        );
        let config = CradleConfig::load(&Some(path)).unwrap();
        assert!(config.n8n.enabled());
        assert_eq!(config.local.to_runtime_config().max_concurrent, 2);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = CradleConfig::load(&Some(dir.path().join("nope.toml"))).unwrap_err();
        assert!(err.to_string().contains("cradle init"));
    }

    #[cfg(unix)]
    #[test]
    fn test_world_readable_config_refused() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = write_private(dir.path(), "");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        let err = CradleConfig::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("chmod 600"));
    }

    #[test]
    fn test_env_expansion_allowlist() {
        let home = std::env::var("HOME").unwrap_or_default();
        assert_eq!(expand_env_vars("dir = \"${HOME}/x\""), format!("dir = \"{}/x\"", home));
        assert_eq!(expand_env_vars("key = \"${AWS_SECRET}\""), "key = \"${AWS_SECRET}\"");
        assert_eq!(expand_env_vars("broken ${HOME"), "broken ${HOME");
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret(""), "(empty)");
        assert_eq!(mask_secret("short"), "***");
        assert_eq!(mask_secret("123456:ABCDEFGH"), "123...EFGH");

        let mut config = CradleConfig::default();
        config.telegram.bot_token = "123456:ABCDEFGH".to_string();
        assert!(!format!("{:?}", config).contains("ABCDEFGH"));
        assert_eq!(config.redacted().telegram.bot_token, "123...EFGH");
    }

    #[test]
    fn test_hardcoded_detection() {
        assert!(is_hardcoded("bot_token = \"123:abc\"", "bot_token", "123:abc"));
        assert!(!is_hardcoded("bot_token = \"${TELEGRAM_BOT_TOKEN}\"", "bot_token", "123:abc"));
        assert!(!is_hardcoded("bot_token = \"\"", "bot_token", ""));
    }

    #[test]
    fn test_expand_path() {
        assert_eq!(expand_path("/tmp/agents"), PathBuf::from("/tmp/agents"));
        assert!(expand_path("~/.cradle/agents").ends_with(".cradle/agents"));
    }
}
