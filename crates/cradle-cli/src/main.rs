use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cradle_core::{AgentManager, RuntimeOrchestrator};
use cradle_memory::{MemoryStore, SqliteMemory};
use cradle_runtime::{
    DockerRuntime, ExecutionResult, LocalRuntime, N8nRuntime, OllamaGenerator, RuntimeAdapter,
    TelegramSender,
};
use cradle_spec::{AgentPlan, AgentSpecification, AgentSpecificationFactory};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::CradleConfig;

#[derive(Parser)]
#[command(name = "cradle")]
#[command(version)]
#[command(about = "Cradle: declarative agents on local, n8n and Docker runtimes")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the config directory, default config and agents directory
    Init,

    /// Show current configuration with secrets masked
    Config,

    /// Check an agent specification file
    Validate {
        /// Spec file (.json, .yaml or .yml)
        file: PathBuf,
    },

    /// Validate a spec and install it into the agents directory
    Deploy {
        file: PathBuf,
    },

    /// Deploy a spec and execute it once
    Run {
        file: PathBuf,

        /// Trigger data as a JSON object
        #[arg(long)]
        data: Option<String>,
    },

    /// Remove an installed agent by id
    Remove {
        agent_id: String,
    },

    /// List installed agents
    Status,

    /// Show runtime health and capabilities
    Runtimes,

    /// Deploy every installed agent and run schedules until interrupted
    Start,

    /// Create an RSS monitor agent
    NewRss {
        name: String,
        #[arg(long)]
        url: String,
        #[arg(long)]
        chat_id: String,
        #[arg(long)]
        schedule: Option<String>,
        #[arg(long)]
        style: Option<String>,
    },

    /// Create a content generator agent
    NewContent {
        name: String,
        #[arg(long)]
        template: String,
        #[arg(long)]
        chat_id: String,
        /// Comma separated topics
        #[arg(long, value_delimiter = ',', required = true)]
        topics: Vec<String>,
        #[arg(long)]
        schedule: Option<String>,
    },

    /// Turn a JSON agent plan into an installed agent
    ImportPlan {
        file: PathBuf,
    },

    /// Index a directory of n8n markdown documentation
    IndexDocs {
        dir: PathBuf,

        /// Base URL the relative file paths are appended to
        #[arg(long, default_value = "https://docs.n8n.io")]
        base_url: String,
    },

    /// Search indexed n8n documentation
    Docs {
        query: String,
        #[arg(short, default_value_t = 6)]
        k: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match cli.command {
        Commands::Init => cmd_init().await,
        Commands::Config => cmd_config(&cli.config).await,
        Commands::Validate { file } => cmd_validate(&file).await,
        Commands::Deploy { file } => cmd_deploy(&cli.config, &file).await,
        Commands::Run { file, data } => cmd_run(&cli.config, &file, data.as_deref()).await,
        Commands::Remove { agent_id } => cmd_remove(&cli.config, &agent_id).await,
        Commands::Status => cmd_status(&cli.config).await,
        Commands::Runtimes => cmd_runtimes(&cli.config).await,
        Commands::Start => cmd_start(&cli.config).await,
        Commands::NewRss {
            name,
            url,
            chat_id,
            schedule,
            style,
        } => {
            let cfg = CradleConfig::load(&cli.config)?;
            let spec = AgentSpecificationFactory::rss_monitor(
                &name,
                &cfg.agents.owner,
                &url,
                &chat_id,
                schedule.as_deref(),
                style.as_deref(),
            );
            install_spec(&cfg, &spec)
        }
        Commands::NewContent {
            name,
            template,
            chat_id,
            topics,
            schedule,
        } => {
            let cfg = CradleConfig::load(&cli.config)?;
            let spec = AgentSpecificationFactory::content_generator(
                &name,
                &cfg.agents.owner,
                &template,
                &chat_id,
                &topics,
                schedule.as_deref(),
            );
            install_spec(&cfg, &spec)
        }
        Commands::ImportPlan { file } => cmd_import_plan(&cli.config, &file).await,
        Commands::IndexDocs { dir, base_url } => cmd_index_docs(&cli.config, &dir, &base_url).await,
        Commands::Docs { query, k } => cmd_docs(&cli.config, &query, k).await,
    }
}

async fn cmd_init() -> Result<()> {
    let config_dir = config::config_dir();
    tokio::fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

    let config_path = config_dir.join("config.toml");
    if config_path.exists() {
        warn!("Config already exists at {}", config_path.display());
    } else {
        tokio::fs::write(&config_path, config::DEFAULT_CONFIG).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&config_path, std::fs::Permissions::from_mode(0o600)).await?;
        }
        info!("Created default config at {}", config_path.display());
    }

    let cfg = CradleConfig::load(&Some(config_path))?;
    let agents_dir = cfg.agents_dir();
    tokio::fs::create_dir_all(&agents_dir).await?;
    info!("Agents directory: {}", agents_dir.display());

    println!("Cradle initialized in {}", config_dir.display());
    println!("Edit config.toml, then install agents with `cradle deploy <spec>`.");
    Ok(())
}

async fn cmd_config(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = CradleConfig::load(config_path)?;
    println!("{}", toml::to_string_pretty(&cfg.redacted())?);
    Ok(())
}

async fn cmd_validate(file: &Path) -> Result<()> {
    let spec = AgentSpecification::from_path(file)?;
    let errors = spec.validate();
    if errors.is_empty() {
        println!("{} ({}) is valid", spec.name, spec.id);
        return Ok(());
    }
    for error in &errors {
        println!("  - {}", error);
    }
    anyhow::bail!("{} validation error(s) in {}", errors.len(), file.display())
}

async fn cmd_deploy(config_path: &Option<PathBuf>, file: &Path) -> Result<()> {
    let cfg = CradleConfig::load(config_path)?;
    let spec = AgentSpecification::from_path(file)?;
    install_spec(&cfg, &spec)
}

async fn cmd_run(config_path: &Option<PathBuf>, file: &Path, data: Option<&str>) -> Result<()> {
    let cfg = CradleConfig::load(config_path)?;
    let spec = AgentSpecification::from_path(file)?;
    let trigger_data = parse_trigger_data(data)?;

    let manager = build_manager(&cfg)?;
    let (agent_id, result) = run_once(&manager, spec, trigger_data).await?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.is_success() {
        anyhow::bail!("Agent {} finished with {}: {}", agent_id, result.status, result.message);
    }
    Ok(())
}

/// Deploy, execute once and tear the agent back down.
async fn run_once(
    manager: &AgentManager,
    spec: AgentSpecification,
    trigger_data: Map<String, Value>,
) -> Result<(String, ExecutionResult)> {
    let agent_id = manager.deploy_spec(spec).await?;
    let result = manager.execute_agent(&agent_id, trigger_data).await;
    if !manager.remove_agent(&agent_id).await {
        warn!("Teardown of {} reported nothing removed", agent_id);
    }
    Ok((agent_id, result))
}

async fn cmd_remove(config_path: &Option<PathBuf>, agent_id: &str) -> Result<()> {
    let cfg = CradleConfig::load(config_path)?;
    let mut removed = 0;
    for (path, spec) in installed_specs(&cfg.agents_dir())? {
        if spec.id == agent_id {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
            removed += 1;
        }
    }
    if removed == 0 {
        anyhow::bail!("No installed agent with id {}", agent_id);
    }
    println!("Removed {}", agent_id);
    Ok(())
}

async fn cmd_status(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = CradleConfig::load(config_path)?;
    let specs = installed_specs(&cfg.agents_dir())?;
    if specs.is_empty() {
        println!("No agents installed in {}", cfg.agents_dir().display());
        return Ok(());
    }
    for (_, spec) in specs {
        let schedules = spec.schedule_expressions().join(", ");
        let runtimes = spec
            .runtime_preferences
            .iter()
            .map(|k| k.as_str())
            .collect::<Vec<_>>()
            .join(" > ");
        println!(
            "{}  {}  [{}]  {}",
            spec.id,
            spec.name,
            runtimes,
            if schedules.is_empty() { "manual".to_string() } else { schedules }
        );
    }
    Ok(())
}

async fn cmd_runtimes(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = CradleConfig::load(config_path)?;
    let manager = build_manager(&cfg)?;
    manager.orchestrator().force_health_check().await;
    let status = manager.runtime_status().await;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn cmd_start(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = CradleConfig::load(config_path)?;
    info!("Starting Cradle...");

    let manager = build_manager(&cfg)?;
    let mut deployed = 0;
    for (path, spec) in installed_specs(&cfg.agents_dir())? {
        match manager.deploy_spec(spec).await {
            Ok(_) => deployed += 1,
            Err(e) => warn!("Skipping {}: {}", path.display(), e),
        }
    }
    info!("{} agent(s) deployed", deployed);

    manager.orchestrator().start();
    info!("Cradle is running. Press Ctrl+C to stop.");

    signal::ctrl_c().await?;
    info!("Shutting down...");
    manager.orchestrator().stop().await;
    info!("Cradle stopped");
    Ok(())
}

async fn cmd_import_plan(config_path: &Option<PathBuf>, file: &Path) -> Result<()> {
    let cfg = CradleConfig::load(config_path)?;
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read plan {}", file.display()))?;
    let plan: AgentPlan = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse plan {}", file.display()))?;
    let spec = plan.into_spec(&cfg.agents.owner).map_err(anyhow::Error::msg)?;
    install_spec(&cfg, &spec)
}

async fn cmd_index_docs(config_path: &Option<PathBuf>, dir: &Path, base_url: &str) -> Result<()> {
    let cfg = CradleConfig::load(config_path)?;
    let manager = build_manager(&cfg)?;

    let mut files = Vec::new();
    collect_markdown(dir, &mut files)?;
    files.sort();

    let mut chunks = 0;
    for path in &files {
        let relative = path.strip_prefix(dir).unwrap_or(path);
        let source_file = relative.to_string_lossy().replace('\\', "/");
        let url = doc_url(base_url, &source_file);
        let markdown = match std::fs::read_to_string(path) {
            Ok(markdown) => markdown,
            Err(e) => {
                warn!("Skipping {}: {}", path.display(), e);
                continue;
            }
        };
        chunks += manager.index_document(&source_file, &url, &markdown).await?;
    }
    println!("Indexed {} chunk(s) from {} file(s)", chunks, files.len());
    Ok(())
}

async fn cmd_docs(config_path: &Option<PathBuf>, query: &str, k: usize) -> Result<()> {
    let cfg = CradleConfig::load(config_path)?;
    let manager = build_manager(&cfg)?;
    let context = manager.build_docs_context(query, k).await?;
    if context.is_empty() {
        println!("No documentation matches '{}'", query);
    } else {
        println!("{}", context);
    }
    Ok(())
}

/// Wire memory, the configured runtimes and the orchestrator together
fn build_manager(cfg: &CradleConfig) -> Result<AgentManager> {
    let memory: Arc<dyn MemoryStore> = Arc::new(
        SqliteMemory::open(cfg.db_path()).context("Failed to open memory database")?,
    );

    let mut local = LocalRuntime::new(cfg.local.to_runtime_config());
    if cfg.llm.enabled {
        local = local.with_generator(Arc::new(OllamaGenerator::new(
            &cfg.llm.base_url,
            &cfg.llm.model,
        )?));
        info!("Content generation via Ollama at {}", cfg.llm.base_url);
    }
    if !cfg.telegram.bot_token.is_empty() {
        local = local.with_sender(Arc::new(TelegramSender::new(
            &cfg.telegram.api_base,
            &cfg.telegram.bot_token,
        )?));
        info!("Telegram delivery enabled");
    }

    let mut adapters: Vec<Arc<dyn RuntimeAdapter>> = vec![Arc::new(local)];
    if cfg.n8n.enabled() {
        adapters.push(Arc::new(N8nRuntime::new(cfg.n8n.to_runtime_config())?));
        info!("n8n runtime at {}", cfg.n8n.api_url);
    }
    if cfg.docker.enabled {
        adapters.push(Arc::new(DockerRuntime::new(cfg.docker.to_runtime_config())));
    }

    let orchestrator = Arc::new(RuntimeOrchestrator::new(
        adapters,
        memory.clone(),
        cfg.orchestrator.to_config(),
    ));
    Ok(AgentManager::new(orchestrator, memory).with_owner(&cfg.agents.owner))
}

/// Validate and write a spec to `<agents dir>/<id>.yaml`
fn install_spec(cfg: &CradleConfig, spec: &AgentSpecification) -> Result<()> {
    spec.ensure_valid()?;
    let dir = cfg.agents_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create agents dir: {}", dir.display()))?;
    let path = dir.join(format!("{}.yaml", spec.id));
    spec.write_to(&path)?;
    println!("Installed {} ({}) at {}", spec.name, spec.id, path.display());
    Ok(())
}

/// Every parseable spec in the agents directory, sorted by file name
fn installed_specs(dir: &Path) -> Result<Vec<(PathBuf, AgentSpecification)>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read agents dir: {}", dir.display()))?
    {
        let path = entry?.path();
        let is_spec = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("json" | "yaml" | "yml")
        );
        if is_spec {
            paths.push(path);
        }
    }
    paths.sort();

    let mut specs = Vec::new();
    for path in paths {
        match AgentSpecification::from_path(&path) {
            Ok(spec) => specs.push((path, spec)),
            Err(e) => warn!("Ignoring unreadable spec {}: {}", path.display(), e),
        }
    }
    Ok(specs)
}

fn parse_trigger_data(data: Option<&str>) -> Result<Map<String, Value>> {
    let Some(raw) = data else {
        return Ok(Map::new());
    };
    match serde_json::from_str::<Value>(raw).context("--data must be valid JSON")? {
        Value::Object(map) => Ok(map),
        _ => anyhow::bail!("--data must be a JSON object"),
    }
}

fn collect_markdown(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read docs dir: {}", dir.display()))?
    {
        let path = entry?.path();
        if path.is_dir() {
            collect_markdown(&path, out)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some("md") {
            out.push(path);
        }
    }
    Ok(())
}

/// `nodes/cron.md` under `https://docs.n8n.io` -> `https://docs.n8n.io/nodes/cron/`
fn doc_url(base_url: &str, source_file: &str) -> String {
    let page = source_file.trim_end_matches(".md");
    let page = page.strip_suffix("index").unwrap_or(page).trim_end_matches('/');
    if page.is_empty() {
        format!("{}/", base_url.trim_end_matches('/'))
    } else {
        format!("{}/{}/", base_url.trim_end_matches('/'), page)
    }
}
