//! Docker CLI runtime: each agent becomes an image built from a generated bundle

use async_trait::async_trait;
use chrono::Utc;
use cradle_spec::{AgentSpecification, RuntimeKind};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::adapter::{HealthState, RuntimeAdapter, RuntimeError};
use crate::result::{ExecutionResult, ExecutionStatus};

#[derive(Debug, Clone)]
pub struct DockerConfig {
    pub docker_bin: String,
    pub base_image: String,
    /// Where per-agent bundles are written
    pub build_dir: PathBuf,
    pub build_timeout: Duration,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            base_image: "alpine:3.20".to_string(),
            build_dir: PathBuf::from("docker_agents"),
            build_timeout: Duration::from_secs(300),
        }
    }
}

struct Container {
    image: String,
    bundle_dir: PathBuf,
    spec: AgentSpecification,
}

pub struct DockerRuntime {
    config: DockerConfig,
    containers: RwLock<HashMap<String, Container>>,
    health: HealthState,
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Write Dockerfile, agent_spec.json and run.sh for `spec` into `dir`
pub async fn write_bundle(dir: &Path, spec: &AgentSpecification, base_image: &str) -> Result<(), RuntimeError> {
    tokio::fs::create_dir_all(dir).await?;

    let dockerfile = format!(
        "FROM {}\n\nWORKDIR /app\n\nCOPY agent_spec.json .\nCOPY run.sh .\nRUN chmod +x run.sh\n\nCMD [\"./run.sh\"]\n",
        base_image
    );
    tokio::fs::write(dir.join("Dockerfile"), dockerfile).await?;
    tokio::fs::write(dir.join("agent_spec.json"), spec.to_json()?).await?;

    let mut script = String::from("#!/bin/sh\nset -e\n");
    script.push_str(&format!("echo {}\n", shell_quote(&format!("Executing agent: {}", spec.name))));
    script.push_str("echo \"Timestamp: $(date -u +%Y-%m-%dT%H:%M:%SZ)\"\n");
    for step in &spec.steps {
        let line = format!("Executing step: {} ({})", step.name, step.kind);
        script.push_str(&format!("echo {}\n", shell_quote(&line)));
    }
    script.push_str("echo 'Agent execution completed'\n");
    tokio::fs::write(dir.join("run.sh"), script).await?;
    Ok(())
}

/// Arguments for `docker run`, with SLA limits and environment applied
pub fn run_args(image: &str, spec: &AgentSpecification, trigger_data: &Map<String, Value>) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--rm".to_string(),
        "--memory".to_string(),
        format!("{}m", spec.sla.max_memory_mb),
        "--cpus".to_string(),
        format!("{:.2}", spec.sla.max_cpu_percent as f64 / 100.0),
    ];
    for (key, value) in &spec.environment_variables {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }
    if !trigger_data.is_empty() {
        args.push("-e".to_string());
        args.push(format!("TRIGGER_DATA={}", Value::Object(trigger_data.clone())));
    }
    args.push(image.to_string());
    args
}

impl DockerRuntime {
    pub fn new(config: DockerConfig) -> Self {
        Self {
            config,
            containers: RwLock::new(HashMap::new()),
            health: HealthState::default(),
        }
    }

    async fn docker(&self, args: &[String], timeout: Duration) -> Result<Output, RuntimeError> {
        debug!("{} {}", self.config.docker_bin, args.join(" "));
        let child = Command::new(&self.config.docker_bin)
            .args(args)
            .kill_on_drop(true)
            .output();
        match tokio::time::timeout(timeout, child).await {
            Ok(output) => Ok(output?),
            Err(_) => Err(RuntimeError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("docker {} timed out after {:?}", args.first().map(String::as_str).unwrap_or(""), timeout),
            ))),
        }
    }
}

#[async_trait]
impl RuntimeAdapter for DockerRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Docker
    }

    async fn is_available(&self) -> bool {
        match self
            .docker(&["--version".to_string()], Duration::from_secs(10))
            .await
        {
            Ok(output) => output.status.success(),
            Err(e) => {
                debug!("docker not available: {}", e);
                false
            }
        }
    }

    async fn deploy_agent(&self, spec: &AgentSpecification) -> Result<String, RuntimeError> {
        let image = format!("agent_{}_{}", spec.id, Utc::now().timestamp()).to_lowercase();
        let deployment_id = format!("docker_{}", image);
        let bundle_dir = self.config.build_dir.join(&image);

        write_bundle(&bundle_dir, spec, &self.config.base_image).await?;

        let args = vec![
            "build".to_string(),
            "-t".to_string(),
            image.clone(),
            bundle_dir.display().to_string(),
        ];
        let output = self.docker(&args, self.config.build_timeout).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            error!("Docker build for {} failed: {}", spec.name, stderr.trim());
            if let Err(e) = tokio::fs::remove_dir_all(&bundle_dir).await {
                warn!("Failed to clean up {}: {}", bundle_dir.display(), e);
            }
            return Err(RuntimeError::Deploy {
                runtime: RuntimeKind::Docker,
                message: format!("docker build failed: {}", stderr.trim()),
            });
        }

        self.containers.write().await.insert(
            deployment_id.clone(),
            Container {
                image,
                bundle_dir,
                spec: spec.clone(),
            },
        );
        info!("Agent {} deployed to Docker with ID {}", spec.name, deployment_id);
        Ok(deployment_id)
    }

    async fn execute_agent(
        &self,
        deployment_id: &str,
        trigger_data: Map<String, Value>,
    ) -> ExecutionResult {
        let started = Instant::now();
        let (args, limit) = match self.containers.read().await.get(deployment_id) {
            Some(container) => (
                run_args(&container.image, &container.spec, &trigger_data),
                container.spec.sla.max_execution(),
            ),
            None => {
                return ExecutionResult::failed(deployment_id, "Container not found in Docker runtime")
                    .with_runtime(RuntimeKind::Docker);
            }
        };

        let result = match self.docker(&args, limit).await {
            Ok(output) if output.status.success() => {
                let mut out = Map::new();
                out.insert(
                    "stdout".into(),
                    Value::String(String::from_utf8_lossy(&output.stdout).into_owned()),
                );
                out.insert(
                    "stderr".into(),
                    Value::String(String::from_utf8_lossy(&output.stderr).into_owned()),
                );
                ExecutionResult::success(deployment_id, "Container executed successfully").with_output(out)
            }
            Ok(output) => ExecutionResult::failed(
                deployment_id,
                format!(
                    "Container execution failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ),
            Err(RuntimeError::Io(e)) if e.kind() == std::io::ErrorKind::TimedOut => {
                ExecutionResult::new(deployment_id, ExecutionStatus::Timeout, e.to_string())
            }
            Err(e) => ExecutionResult::failed(deployment_id, format!("Docker execution error: {}", e)),
        };
        result.with_runtime(RuntimeKind::Docker).elapsed_since(started)
    }

    async fn remove_agent(&self, deployment_id: &str) -> bool {
        let Some(container) = self.containers.write().await.remove(deployment_id) else {
            return false;
        };

        let args = vec!["rmi".to_string(), container.image.clone()];
        match self.docker(&args, Duration::from_secs(60)).await {
            Ok(output) if !output.status.success() => warn!(
                "docker rmi {} failed: {}",
                container.image,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(e) => warn!("docker rmi {} failed: {}", container.image, e),
            Ok(_) => {}
        }

        match tokio::fs::remove_dir_all(&container.bundle_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                error!("Error removing Docker agent bundle: {}", e);
                return false;
            }
        }
        info!("Docker agent {} removed", deployment_id);
        true
    }

    fn capabilities(&self) -> Vec<&'static str> {
        vec![
            "basic_execution",
            "isolation",
            "scalability",
            "resource_limits",
            "containerization",
        ]
    }

    fn health(&self) -> &HealthState {
        &self.health
    }
}
