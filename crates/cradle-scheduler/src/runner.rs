//! Tokio task runner for scheduled jobs
//!
//! Each job runs as its own task that sleeps until the next occurrence and
//! then emits a [`ScheduleEvent`]. Jobs are tracked by id and can be
//! cancelled individually, per agent, or all at once.

use crate::job::{Job, ScheduleEvent};
use anyhow::{Result, anyhow};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of concurrently scheduled jobs
    pub max_jobs: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { max_jobs: 1000 }
    }
}

struct ActiveJob {
    agent_id: String,
    token: CancellationToken,
}

/// Manages the lifecycle of job tasks
pub struct JobRunner {
    config: SchedulerConfig,

    event_tx: mpsc::UnboundedSender<ScheduleEvent>,

    /// job_id -> running task
    active_jobs: Arc<RwLock<HashMap<String, ActiveJob>>>,

    shutdown_token: CancellationToken,
}

impl JobRunner {
    pub fn new(event_tx: mpsc::UnboundedSender<ScheduleEvent>) -> Self {
        Self::with_config(event_tx, SchedulerConfig::default())
    }

    pub fn with_config(
        event_tx: mpsc::UnboundedSender<ScheduleEvent>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            config,
            event_tx,
            active_jobs: Arc::new(RwLock::new(HashMap::new())),
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Start a job and return its id
    pub async fn add_job(&self, job: Job) -> Result<String> {
        let mut jobs = self.active_jobs.write().await;
        if jobs.len() >= self.config.max_jobs {
            anyhow::bail!("Maximum scheduled jobs reached: {}", self.config.max_jobs);
        }
        if self.shutdown_token.is_cancelled() {
            return Err(anyhow!("Scheduler is shut down"));
        }
        if job.schedule.next_after(Utc::now()).is_none() {
            anyhow::bail!("Schedule for {} never fires", job.description());
        }

        info!("Scheduling {}", job.description());

        let token = CancellationToken::new();
        jobs.insert(
            job.id.clone(),
            ActiveJob {
                agent_id: job.agent_id.clone(),
                token: token.clone(),
            },
        );
        drop(jobs);

        let job_id = job.id.clone();
        self.spawn_job(job, token);
        Ok(job_id)
    }

    /// Cancel one job
    pub async fn cancel_job(&self, job_id: &str) -> bool {
        match self.active_jobs.write().await.remove(job_id) {
            Some(active) => {
                info!("Cancelling job {}", job_id);
                active.token.cancel();
                true
            }
            None => {
                warn!("Attempted to cancel unknown job: {}", job_id);
                false
            }
        }
    }

    /// Cancel every job belonging to an agent, returning how many were cancelled
    pub async fn cancel_agent(&self, agent_id: &str) -> usize {
        let mut jobs = self.active_jobs.write().await;
        let ids: Vec<String> = jobs
            .iter()
            .filter(|(_, job)| job.agent_id == agent_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            if let Some(job) = jobs.remove(id) {
                job.token.cancel();
            }
        }
        if !ids.is_empty() {
            info!("Cancelled {} job(s) for agent {}", ids.len(), agent_id);
        }
        ids.len()
    }

    pub async fn stop_all(&self) {
        info!("Stopping all scheduled jobs");
        self.shutdown_token.cancel();

        let mut jobs = self.active_jobs.write().await;
        for (id, job) in jobs.drain() {
            debug!("Cancelling job: {}", id);
            job.token.cancel();
        }
    }

    pub async fn active_count(&self) -> usize {
        self.active_jobs.read().await.len()
    }

    pub async fn is_running(&self, job_id: &str) -> bool {
        self.active_jobs.read().await.contains_key(job_id)
    }

    pub async fn jobs_for(&self, agent_id: &str) -> Vec<String> {
        self.active_jobs
            .read()
            .await
            .iter()
            .filter(|(_, job)| job.agent_id == agent_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn spawn_job(&self, job: Job, cancel_token: CancellationToken) {
        let event_tx = self.event_tx.clone();
        let global_shutdown = self.shutdown_token.clone();
        let active_jobs = self.active_jobs.clone();

        tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let next = match job.schedule.next_after(now) {
                    Some(n) => n,
                    None => {
                        error!("No next occurrence for {}", job.description());
                        break;
                    }
                };

                let duration: Duration = (next - now).to_std().unwrap_or(Duration::from_secs(60));
                let wake_time = Instant::now() + duration;

                debug!("Job {} next run at {} (in {:?})", job.id, next, duration);

                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Job {} cancelled", job.id);
                        break;
                    }
                    _ = global_shutdown.cancelled() => {
                        debug!("Job {} stopped due to global shutdown", job.id);
                        break;
                    }
                    _ = sleep_until(wake_time) => {
                        if let Err(e) = event_tx.send(ScheduleEvent::new(&job)) {
                            error!("Failed to send schedule event: {}", e);
                            break;
                        }
                        debug!("Job {} fired for agent {}", job.id, job.agent_id);
                    }
                }
            }

            // Entry may already be gone if cancel_job() removed it
            let mut jobs = active_jobs.write().await;
            if jobs.remove(&job.id).is_some() {
                debug!("Job {} cleaned up from active jobs", job.id);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ScheduleSpec;

    fn fast_job(agent: &str) -> Job {
        Job::new(agent, ScheduleSpec::every(Duration::from_millis(30)))
    }

    #[tokio::test]
    async fn test_runner_creation() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let runner = JobRunner::new(tx);
        assert_eq!(runner.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_job_fires_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let runner = JobRunner::new(tx);
        let job_id = runner.add_job(fast_job("agent-a")).await.unwrap();
        assert!(runner.is_running(&job_id).await);

        for _ in 0..2 {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("Timeout waiting for event")
                .expect("Channel closed");
            assert_eq!(event.agent_id, "agent-a");
            assert_eq!(event.job_id, job_id);
        }

        runner.stop_all().await;
    }

    #[tokio::test]
    async fn test_cancel_agent_only_touches_its_jobs() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let runner = JobRunner::new(tx);

        let cron = ScheduleSpec::parse("0 9,15,20 * * *").unwrap();
        runner.add_job(Job::new("a", cron.clone())).await.unwrap();
        runner.add_job(Job::new("a", cron.clone())).await.unwrap();
        let b = runner.add_job(Job::new("b", cron)).await.unwrap();

        assert_eq!(runner.jobs_for("a").await.len(), 2);
        assert_eq!(runner.cancel_agent("a").await, 2);
        assert_eq!(runner.cancel_agent("a").await, 0);
        assert_eq!(runner.active_count().await, 1);
        assert!(runner.is_running(&b).await);
    }

    #[tokio::test]
    async fn test_cancelled_job_stops_firing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let runner = JobRunner::new(tx);
        let job_id = runner.add_job(fast_job("agent-a")).await.unwrap();
        assert!(runner.cancel_job(&job_id).await);
        assert!(!runner.cancel_job(&job_id).await);

        // Drain anything that raced the cancellation, then expect silence
        tokio::time::sleep(Duration::from_millis(50)).await;
        while rx.try_recv().is_ok() {}
        let quiet = tokio::time::timeout(Duration::from_millis(150), rx.recv()).await;
        assert!(quiet.is_err());
    }

    #[tokio::test]
    async fn test_stop_all_jobs() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let runner = JobRunner::new(tx);
        for i in 0..3 {
            runner.add_job(fast_job(&format!("agent-{}", i))).await.unwrap();
        }
        assert_eq!(runner.active_count().await, 3);

        runner.stop_all().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runner.active_count().await, 0);
        assert!(runner.add_job(fast_job("late")).await.is_err());
    }

    #[tokio::test]
    async fn test_max_jobs() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let runner = JobRunner::with_config(tx, SchedulerConfig { max_jobs: 2 });
        runner.add_job(fast_job("a")).await.unwrap();
        runner.add_job(fast_job("b")).await.unwrap();
        assert!(runner.add_job(fast_job("c")).await.is_err());
        runner.stop_all().await;
    }
}
