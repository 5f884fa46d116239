//! Timers for the enabled entries of an instance's `cron.config`.

use std::collections::HashMap;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use uuid::Uuid;

use crate::server::{CronDocument, CronEntry};

#[derive(thiserror::Error, Debug)]
pub enum CronError {
    #[error("Invalid cron expression: {0}")]
    InvalidExpression(String),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] JobSchedulerError),
}

/// A job came due. The supervisor runs it like an interactive command.
#[derive(Debug, Clone)]
pub struct CronFiring {
    pub hash: String,
    pub entry: CronEntry,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReloadReport {
    pub scheduled: Vec<String>,
    /// Enabled entries whose expression would not parse.
    pub invalid: Vec<String>,
}

/// SHA-256 hex of the options' canonical JSON; the entry's id in `cron.config`.
pub fn hash_options(options: &Value) -> String {
    let canonical = serde_json::to_string(options).unwrap_or_default();
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// Classic 5-field expressions get a leading seconds field.
pub fn normalize_expression(source: &str) -> String {
    let trimmed = source.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    }
}

pub struct CronScheduler {
    server_name: String,
    scheduler: JobScheduler,
    jobs: HashMap<String, Uuid>,
    firings: mpsc::UnboundedSender<CronFiring>,
}

impl CronScheduler {
    pub async fn new(server_name: &str, firings: mpsc::UnboundedSender<CronFiring>) -> Result<Self, CronError> {
        let scheduler = JobScheduler::new().await?;
        scheduler.start().await?;
        Ok(Self {
            server_name: server_name.to_string(),
            scheduler,
            jobs: HashMap::new(),
            firings,
        })
    }

    /// Drop every job, then schedule each enabled entry afresh.
    pub async fn reload(&mut self, crons: &CronDocument) -> Result<ReloadReport, CronError> {
        self.stop_all().await?;

        let mut report = ReloadReport::default();
        for (hash, entry) in crons.iter().filter(|(_, e)| e.enabled) {
            match self.schedule(hash, entry).await {
                Ok(id) => {
                    self.jobs.insert(hash.clone(), id);
                    report.scheduled.push(hash.clone());
                }
                Err(CronError::InvalidExpression(source)) => {
                    tracing::warn!("[{}] Invalid cron expression '{}' for job {}", self.server_name, source, hash);
                    report.invalid.push(hash.clone());
                }
                Err(e) => return Err(e),
            }
        }
        tracing::info!("[{}] {} cron job(s) scheduled", self.server_name, report.scheduled.len());
        Ok(report)
    }

    async fn schedule(&self, hash: &str, entry: &CronEntry) -> Result<Uuid, CronError> {
        let expression = normalize_expression(&entry.source);
        let tx = self.firings.clone();
        let firing = CronFiring { hash: hash.to_string(), entry: entry.clone() };

        let job = Job::new_async(expression.as_str(), move |_uuid, _lock| {
            let tx = tx.clone();
            let firing = firing.clone();
            Box::pin(async move {
                let _ = tx.send(firing);
            })
        })
        .map_err(|_| CronError::InvalidExpression(entry.source.clone()))?;

        Ok(self.scheduler.add(job).await?)
    }

    pub async fn stop_all(&mut self) -> Result<(), CronError> {
        for (_, id) in self.jobs.drain() {
            self.scheduler.remove(&id).await?;
        }
        Ok(())
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub async fn shutdown(&mut self) -> Result<(), CronError> {
        self.stop_all().await?;
        self.scheduler.shutdown().await?;
        Ok(())
    }
}
