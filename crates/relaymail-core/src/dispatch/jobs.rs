//! Job manager - creates send jobs and applies operator actions

use crate::delivery::ServerRegistry;
use crate::error::JobError;
use crate::routing::{select, SelectionState, Strategy};
use chrono::{DateTime, Utc};
use relaymail_common::types::{CampaignId, JobId, StrategyKind, VariantId};
use relaymail_storage::{
    CampaignRepository, CampaignVariant, JobStatus, NewJobItem, NewSendJob, Page,
    RecipientRepository, Repositories, SendJob, SendJobRepository,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

const RECIPIENT_PAGE_SIZE: i64 = 500;

/// Request to create a send job
#[derive(Debug, Clone, Deserialize)]
pub struct CreateJobRequest {
    pub campaign_id: CampaignId,
    #[serde(default)]
    pub servers: Vec<String>,
    /// Defaults to the configured routing strategy
    #[serde(default)]
    pub strategy: Option<StrategyKind>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dry_run_limit: Option<i32>,
}

/// What a retry re-processes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryAction {
    /// Reset failed items to pending first
    Failed,
    /// Only continue the remaining pending items
    Pending,
}

/// Job manager
pub struct JobManager {
    jobs: Arc<dyn SendJobRepository>,
    campaigns: Arc<dyn CampaignRepository>,
    recipients: Arc<dyn RecipientRepository>,
    registry: Arc<ServerRegistry>,
    default_strategy: StrategyKind,
}

impl JobManager {
    /// Create a new job manager
    pub fn new(
        repos: &Repositories,
        registry: Arc<ServerRegistry>,
        default_strategy: StrategyKind,
    ) -> Self {
        Self {
            jobs: repos.jobs.clone(),
            campaigns: repos.campaigns.clone(),
            recipients: repos.recipients.clone(),
            registry,
            default_strategy,
        }
    }

    /// Expand a campaign into a job with one item per recipient
    pub async fn create_job(&self, request: CreateJobRequest) -> Result<SendJob, JobError> {
        let servers = self.validate_servers(&request.servers)?;

        if let Some(limit) = request.dry_run_limit {
            if limit < 1 {
                return Err(JobError::InvalidRequest(
                    "dry_run_limit must be at least 1".to_string(),
                ));
            }
        }

        let campaign = self
            .campaigns
            .get(request.campaign_id)
            .await?
            .ok_or(JobError::CampaignNotFound(request.campaign_id))?;
        let variants = self.campaigns.variants(campaign.id).await?;

        let kind = request.strategy.unwrap_or(self.default_strategy);
        let strategy = Strategy::for_servers(kind, &servers, |name| self.registry.weight(name));
        let mut state = SelectionState::new();
        let key = campaign.id.to_string();

        let cap = request.dry_run_limit.map(|n| n as usize);
        let mut items: Vec<NewJobItem> = Vec::new();
        let mut offset = 0;

        'pages: loop {
            let page = self
                .recipients
                .list_by_list(campaign.recipient_list_id, RECIPIENT_PAGE_SIZE, offset)
                .await?;
            if page.items.is_empty() {
                break;
            }
            offset += page.items.len() as i64;

            for recipient in page.items {
                if cap.is_some_and(|cap| items.len() >= cap) {
                    break 'pages;
                }

                let index = items.len();
                let server = select(&strategy, &key, &servers, &mut state)
                    .map(|i| servers[i].clone())
                    .ok_or_else(|| JobError::InvalidRequest("no servers given".to_string()))?;

                items.push(NewJobItem {
                    recipient_id: recipient.id,
                    variant_id: pick_variant(&variants, index),
                    server_name: server,
                });
            }

            if offset >= page.total {
                break;
            }
        }

        let status = match request.scheduled_at {
            Some(at) if at > Utc::now() => JobStatus::Scheduled,
            _ => JobStatus::Running,
        };

        let item_count = items.len();
        let job = self
            .jobs
            .create(
                NewSendJob {
                    campaign_id: campaign.id,
                    status,
                    servers,
                    strategy: kind,
                    dry_run_limit: request.dry_run_limit,
                    scheduled_at: request.scheduled_at,
                },
                items,
            )
            .await?;

        info!(
            job_id = %job.id,
            campaign_id = %campaign.id,
            items = item_count,
            status = %status,
            strategy = %kind,
            "Send job created"
        );

        Ok(job)
    }

    /// Get a job with its stats
    pub async fn get(&self, id: JobId) -> Result<SendJob, JobError> {
        self.jobs.get(id).await?.ok_or(JobError::NotFound(id))
    }

    /// List jobs, newest first
    pub async fn list(
        &self,
        status: Option<JobStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Page<SendJob>, JobError> {
        Ok(self.jobs.list(status, limit, offset).await?)
    }

    pub async fn pause(&self, id: JobId) -> Result<SendJob, JobError> {
        self.apply(id, &[JobStatus::Running], JobStatus::Paused, "pause")
            .await
    }

    pub async fn resume(&self, id: JobId) -> Result<SendJob, JobError> {
        self.apply(id, &[JobStatus::Paused], JobStatus::Running, "resume")
            .await
    }

    pub async fn cancel(&self, id: JobId) -> Result<SendJob, JobError> {
        self.apply(
            id,
            &[JobStatus::Scheduled, JobStatus::Running, JobStatus::Paused],
            JobStatus::Cancelled,
            "cancel",
        )
        .await
    }

    /// Put a stopped job back to running, optionally re-queueing its failures
    pub async fn retry(&self, id: JobId, action: RetryAction) -> Result<SendJob, JobError> {
        const RETRYABLE: &[JobStatus] = &[
            JobStatus::Paused,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ];

        let job = self.get(id).await?;
        check_transition(&job, RETRYABLE, JobStatus::Running, "retry")?;

        if action == RetryAction::Failed {
            let reset = self.jobs.reset_failed_items(id).await?;
            info!(job_id = %id, reset, "Failed items reset to pending");
        }

        self.apply(id, RETRYABLE, JobStatus::Running, "retry").await?;
        self.jobs.refresh_stats(id).await?;

        info!(job_id = %id, ?action, "Job retried");
        self.get(id).await
    }

    async fn apply(
        &self,
        id: JobId,
        from: &[JobStatus],
        to: JobStatus,
        action: &'static str,
    ) -> Result<SendJob, JobError> {
        let job = self.get(id).await?;
        let current = check_transition(&job, from, to, action)?;

        match self.jobs.transition(id, from, to).await? {
            Some(job) => {
                info!(job_id = %id, from = %current, to = %to, "Job {}", action);
                Ok(job)
            }
            // lost a race with the engine or another operator
            None => {
                let now = self.get(id).await?;
                Err(JobError::InvalidTransition {
                    from: now.status_enum().unwrap_or(current),
                    action,
                })
            }
        }
    }

    fn validate_servers(&self, requested: &[String]) -> Result<Vec<String>, JobError> {
        if requested.is_empty() {
            return Err(JobError::InvalidRequest(
                "at least one server is required".to_string(),
            ));
        }

        let mut servers: Vec<String> = Vec::with_capacity(requested.len());
        for name in requested {
            if !self.registry.contains(name) {
                return Err(JobError::InvalidRequest(format!(
                    "server {} is not configured",
                    name
                )));
            }
            if !servers.contains(name) {
                servers.push(name.clone());
            }
        }
        Ok(servers)
    }
}

fn check_transition(
    job: &SendJob,
    from: &[JobStatus],
    to: JobStatus,
    action: &'static str,
) -> Result<JobStatus, JobError> {
    let current = job.status_enum().ok_or_else(|| {
        JobError::InvalidRequest(format!("job {} has unknown status {}", job.id, job.status))
    })?;

    if from.contains(&current) && current.can_transition_to(to) {
        Ok(current)
    } else {
        Err(JobError::InvalidTransition {
            from: current,
            action,
        })
    }
}

/// Variant for the `index`-th item: cumulative weight buckets over `index % total`
fn pick_variant(variants: &[CampaignVariant], index: usize) -> Option<VariantId> {
    let total: u64 = variants.iter().map(|v| v.weight.max(0) as u64).sum();
    if total == 0 {
        return None;
    }

    let point = index as u64 % total;
    let mut cumulative = 0;
    for variant in variants {
        cumulative += variant.weight.max(0) as u64;
        if point < cumulative {
            return Some(variant.id);
        }
    }
    None
}
