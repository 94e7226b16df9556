//! In-process store implementing every repository trait
//!
//! Used for `backend = "memory"` and throughout the test suites. Rows live
//! behind one `RwLock`, so every trait call is atomic with respect to the others.

use crate::models::{
    Campaign, CampaignVariant, DeploymentStatus, Domain, DomainConfig, DomainDeployment,
    ItemStatus, JobStats, JobStatus, NewJobItem, NewSend, NewSendJob, Page, Recipient, SendRecord,
    SendJob, SendJobItem, SendStatus, Template, UpdateDomain,
};
use crate::repository::domains::apply_domain_update;
use crate::repository::send_jobs::stats_from_counts;
use crate::repository::{
    ApiKey, ApiKeyRepository, CampaignRepository, DomainRepository, RecipientRepository,
    SendJobRepository, SendRepository, TemplateRepository, VariableRepository,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relaymail_common::types::{
    ApiKeyId, CampaignId, DomainId, JobId, JobItemId, RecipientId, SendId, TemplateId,
};
use relaymail_common::Result;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    domains: HashMap<DomainId, Domain>,
    deployments: Vec<DomainDeployment>,
    jobs: HashMap<JobId, SendJob>,
    items: Vec<SendJobItem>,
    sends: HashMap<SendId, SendRecord>,
    api_keys: Vec<ApiKey>,
    templates: HashMap<TemplateId, Template>,
    campaigns: HashMap<CampaignId, Campaign>,
    variants: Vec<CampaignVariant>,
    recipients: Vec<Recipient>,
    variables: HashMap<String, String>,
}

/// In-memory repository implementation
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_domain(&self, domain: Domain) {
        self.tables.write().await.domains.insert(domain.id, domain);
    }

    pub async fn insert_api_key(&self, key: ApiKey) {
        self.tables.write().await.api_keys.push(key);
    }

    pub async fn insert_template(&self, template: Template) {
        self.tables
            .write()
            .await
            .templates
            .insert(template.id, template);
    }

    pub async fn insert_campaign(&self, campaign: Campaign) {
        self.tables
            .write()
            .await
            .campaigns
            .insert(campaign.id, campaign);
    }

    pub async fn insert_variant(&self, variant: CampaignVariant) {
        self.tables.write().await.variants.push(variant);
    }

    pub async fn insert_recipient(&self, recipient: Recipient) {
        self.tables.write().await.recipients.push(recipient);
    }

    /// Overwrite an item's status directly, bypassing transition guards
    pub async fn force_item_status(&self, id: JobItemId, status: ItemStatus) {
        let mut tables = self.tables.write().await;
        if let Some(item) = tables.items.iter_mut().find(|i| i.id == id) {
            item.status = status.to_string();
        }
    }

    /// All items of a job in creation order
    pub async fn job_items(&self, job_id: JobId) -> Vec<SendJobItem> {
        self.tables
            .read()
            .await
            .items
            .iter()
            .filter(|i| i.job_id == job_id)
            .cloned()
            .collect()
    }

    pub async fn sends(&self) -> Vec<SendRecord> {
        self.tables.read().await.sends.values().cloned().collect()
    }
}

fn update_item(
    tables: &mut Tables,
    id: JobItemId,
    from: ItemStatus,
    apply: impl FnOnce(&mut SendJobItem),
) -> bool {
    let from = from.to_string();
    match tables
        .items
        .iter_mut()
        .find(|i| i.id == id && i.status == from)
    {
        Some(item) => {
            apply(item);
            item.updated_at = Utc::now();
            true
        }
        None => false,
    }
}

#[async_trait]
impl DomainRepository for MemoryStore {
    async fn get_by_name(&self, name: &str) -> Result<Option<DomainConfig>> {
        let name = name.to_ascii_lowercase();
        let tables = self.tables.read().await;

        let Some(domain) = tables.domains.values().find(|d| d.name == name).cloned() else {
            return Ok(None);
        };

        let mut deployments: Vec<DomainDeployment> = tables
            .deployments
            .iter()
            .filter(|d| d.domain_id == domain.id)
            .cloned()
            .collect();
        deployments.sort_by(|a, b| {
            a.position
                .cmp(&b.position)
                .then_with(|| a.server_name.cmp(&b.server_name))
        });

        Ok(Some(DomainConfig { domain, deployments }))
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Page<Domain>> {
        let tables = self.tables.read().await;
        let mut all: Vec<Domain> = tables.domains.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        let total = all.len() as i64;
        Ok(Page::new(paginate(all, limit, offset), total))
    }

    async fn update(&self, id: DomainId, input: UpdateDomain) -> Result<Option<Domain>> {
        let mut tables = self.tables.write().await;
        Ok(tables.domains.get_mut(&id).map(|domain| {
            apply_domain_update(domain, input);
            domain.clone()
        }))
    }

    async fn upsert_deployment(
        &self,
        domain_id: DomainId,
        server_name: &str,
        status: DeploymentStatus,
        deployed_hash: Option<&str>,
        last_error: Option<&str>,
    ) -> Result<DomainDeployment> {
        let mut tables = self.tables.write().await;
        let deployed_at = (status == DeploymentStatus::Deployed).then(Utc::now);

        if let Some(existing) = tables
            .deployments
            .iter_mut()
            .find(|d| d.domain_id == domain_id && d.server_name == server_name)
        {
            existing.status = status.to_string();
            if let Some(hash) = deployed_hash {
                existing.deployed_hash = Some(hash.to_string());
            }
            existing.last_error = last_error.map(str::to_string);
            if deployed_at.is_some() {
                existing.deployed_at = deployed_at;
            }
            return Ok(existing.clone());
        }

        let position = tables
            .deployments
            .iter()
            .filter(|d| d.domain_id == domain_id)
            .map(|d| d.position + 1)
            .max()
            .unwrap_or(0);

        let deployment = DomainDeployment {
            id: Uuid::now_v7(),
            domain_id,
            server_name: server_name.to_string(),
            status: status.to_string(),
            deployed_hash: deployed_hash.map(str::to_string),
            position,
            last_error: last_error.map(str::to_string),
            deployed_at,
        };
        tables.deployments.push(deployment.clone());
        Ok(deployment)
    }

    async fn delete_deployment(&self, domain_id: DomainId, server_name: &str) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let before = tables.deployments.len();
        tables
            .deployments
            .retain(|d| !(d.domain_id == domain_id && d.server_name == server_name));
        Ok(tables.deployments.len() < before)
    }

    async fn mark_outdated(&self, domain_id: DomainId, current_hash: &str) -> Result<u64> {
        let mut tables = self.tables.write().await;
        let deployed = DeploymentStatus::Deployed.to_string();
        let mut changed = 0;

        for deployment in tables.deployments.iter_mut().filter(|d| {
            d.domain_id == domain_id
                && d.status == deployed
                && d.deployed_hash.as_deref() != Some(current_hash)
        }) {
            deployment.status = DeploymentStatus::Outdated.to_string();
            changed += 1;
        }

        Ok(changed)
    }
}

#[async_trait]
impl SendJobRepository for MemoryStore {
    async fn create(&self, input: NewSendJob, items: Vec<NewJobItem>) -> Result<SendJob> {
        let mut tables = self.tables.write().await;
        let now = Utc::now();
        let total = items.len() as i64;

        let job = SendJob {
            id: Uuid::now_v7(),
            campaign_id: input.campaign_id,
            status: input.status.to_string(),
            servers: serde_json::to_value(&input.servers).unwrap_or_default(),
            strategy: input.strategy.to_string(),
            dry_run_limit: input.dry_run_limit,
            scheduled_at: input.scheduled_at,
            total,
            pending: total,
            queued: 0,
            sent: 0,
            failed: 0,
            created_at: now,
            updated_at: now,
            started_at: (input.status == JobStatus::Running).then_some(now),
            completed_at: None,
        };

        for item in items {
            tables.items.push(SendJobItem {
                id: Uuid::now_v7(),
                job_id: job.id,
                recipient_id: item.recipient_id,
                variant_id: item.variant_id,
                server_name: item.server_name,
                status: ItemStatus::Pending.to_string(),
                remote_message_id: None,
                last_error: None,
                last_checked_at: None,
                created_at: now,
                updated_at: now,
            });
        }

        tables.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: JobId) -> Result<Option<SendJob>> {
        Ok(self.tables.read().await.jobs.get(&id).cloned())
    }

    async fn list(
        &self,
        status: Option<JobStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Page<SendJob>> {
        let tables = self.tables.read().await;
        let status = status.map(|s| s.to_string());
        let mut matching: Vec<SendJob> = tables
            .jobs
            .values()
            .filter(|j| status.as_ref().map_or(true, |s| &j.status == s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        let total = matching.len() as i64;
        Ok(Page::new(paginate(matching, limit, offset), total))
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<SendJob>> {
        let tables = self.tables.read().await;
        let status = status.to_string();
        let mut jobs: Vec<SendJob> = tables
            .jobs
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn due_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<SendJob>> {
        let tables = self.tables.read().await;
        let scheduled = JobStatus::Scheduled.to_string();
        Ok(tables
            .jobs
            .values()
            .filter(|j| j.status == scheduled && j.scheduled_at.map_or(true, |at| at <= now))
            .cloned()
            .collect())
    }

    async fn transition(
        &self,
        id: JobId,
        from: &[JobStatus],
        to: JobStatus,
    ) -> Result<Option<SendJob>> {
        let mut tables = self.tables.write().await;
        let Some(job) = tables.jobs.get_mut(&id) else {
            return Ok(None);
        };
        let allowed = job
            .status_enum()
            .map_or(false, |current| from.contains(&current));
        if !allowed {
            return Ok(None);
        }

        let now = Utc::now();
        job.status = to.to_string();
        job.updated_at = now;
        if to == JobStatus::Running {
            job.started_at.get_or_insert(now);
            job.completed_at = None;
        } else if to.is_terminal() {
            job.completed_at = Some(now);
        }
        Ok(Some(job.clone()))
    }

    async fn pending_items(&self, job_id: JobId, limit: i64) -> Result<Vec<SendJobItem>> {
        let tables = self.tables.read().await;
        let pending = ItemStatus::Pending.to_string();
        Ok(tables
            .items
            .iter()
            .filter(|i| i.job_id == job_id && i.status == pending)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn queued_items(&self, limit: i64) -> Result<Vec<SendJobItem>> {
        let tables = self.tables.read().await;
        let queued = ItemStatus::Queued.to_string();
        let mut items: Vec<SendJobItem> = tables
            .items
            .iter()
            .filter(|i| i.status == queued && i.remote_message_id.is_some())
            .cloned()
            .collect();
        // None sorts before Some, so unchecked items come first
        items.sort_by_key(|i| (i.last_checked_at, i.updated_at));
        items.truncate(limit.max(0) as usize);
        Ok(items)
    }

    async fn mark_items_checked(&self, ids: &[JobItemId]) -> Result<()> {
        let mut tables = self.tables.write().await;
        let now = Utc::now();
        for item in tables.items.iter_mut().filter(|i| ids.contains(&i.id)) {
            item.last_checked_at = Some(now);
        }
        Ok(())
    }

    async fn get_item(&self, id: JobItemId) -> Result<Option<SendJobItem>> {
        Ok(self
            .tables
            .read()
            .await
            .items
            .iter()
            .find(|i| i.id == id)
            .cloned())
    }

    async fn mark_item_queued(&self, id: JobItemId, remote_message_id: &str) -> Result<bool> {
        let mut tables = self.tables.write().await;
        Ok(update_item(&mut tables, id, ItemStatus::Pending, |item| {
            item.status = ItemStatus::Queued.to_string();
            item.remote_message_id = Some(remote_message_id.to_string());
            item.last_error = None;
        }))
    }

    async fn mark_item_failed(
        &self,
        id: JobItemId,
        from: ItemStatus,
        error: &str,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        Ok(update_item(&mut tables, id, from, |item| {
            item.status = ItemStatus::Failed.to_string();
            item.last_error = Some(error.to_string());
        }))
    }

    async fn mark_item_sent(&self, id: JobItemId) -> Result<bool> {
        let mut tables = self.tables.write().await;
        Ok(update_item(&mut tables, id, ItemStatus::Queued, |item| {
            item.status = ItemStatus::Sent.to_string();
        }))
    }

    async fn reset_failed_items(&self, job_id: JobId) -> Result<u64> {
        let mut tables = self.tables.write().await;
        let failed = ItemStatus::Failed.to_string();
        let now = Utc::now();
        let mut changed = 0;

        for item in tables
            .items
            .iter_mut()
            .filter(|i| i.job_id == job_id && i.status == failed)
        {
            item.status = ItemStatus::Pending.to_string();
            item.last_error = None;
            item.remote_message_id = None;
            item.last_checked_at = None;
            item.updated_at = now;
            changed += 1;
        }

        Ok(changed)
    }

    async fn refresh_stats(&self, job_id: JobId) -> Result<JobStats> {
        let mut tables = self.tables.write().await;

        let mut counts: HashMap<&str, i64> = HashMap::new();
        for item in tables.items.iter().filter(|i| i.job_id == job_id) {
            *counts.entry(item.status.as_str()).or_default() += 1;
        }
        let stats = stats_from_counts(counts);

        if let Some(job) = tables.jobs.get_mut(&job_id) {
            job.total = stats.total;
            job.pending = stats.pending;
            job.queued = stats.queued;
            job.sent = stats.sent;
            job.failed = stats.failed;
            job.updated_at = Utc::now();
        }

        Ok(stats)
    }
}

#[async_trait]
impl SendRepository for MemoryStore {
    async fn create(&self, input: NewSend) -> Result<SendRecord> {
        let now = Utc::now();
        let send = SendRecord {
            id: Uuid::now_v7(),
            api_key_id: input.api_key_id,
            from_address: input.from_address,
            to_address: input.to_address,
            domain: input.domain,
            server_name: input.server_name,
            status: SendStatus::Pending.to_string(),
            remote_message_id: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        self.tables.write().await.sends.insert(send.id, send.clone());
        Ok(send)
    }

    async fn get(&self, id: SendId) -> Result<Option<SendRecord>> {
        Ok(self.tables.read().await.sends.get(&id).cloned())
    }

    async fn finish(
        &self,
        id: SendId,
        status: SendStatus,
        remote_message_id: Option<&str>,
        last_error: Option<&str>,
    ) -> Result<Option<SendRecord>> {
        let mut tables = self.tables.write().await;
        let pending = SendStatus::Pending.to_string();
        Ok(tables
            .sends
            .get_mut(&id)
            .filter(|s| s.status == pending)
            .map(|send| {
                send.status = status.to_string();
                send.remote_message_id = remote_message_id.map(str::to_string);
                send.last_error = last_error.map(str::to_string);
                send.updated_at = Utc::now();
                send.clone()
            }))
    }
}

#[async_trait]
impl ApiKeyRepository for MemoryStore {
    async fn find_by_prefix(&self, prefix: &str) -> Result<Vec<ApiKey>> {
        let tables = self.tables.read().await;
        Ok(tables
            .api_keys
            .iter()
            .filter(|k| k.key_prefix == prefix && !k.is_expired())
            .take(10)
            .cloned()
            .collect())
    }

    async fn update_last_used(&self, id: ApiKeyId) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(key) = tables.api_keys.iter_mut().find(|k| k.id == id) {
            key.last_used_at = Some(Utc::now());
        }
        Ok(())
    }
}

#[async_trait]
impl TemplateRepository for MemoryStore {
    async fn get(&self, id: TemplateId) -> Result<Option<Template>> {
        Ok(self.tables.read().await.templates.get(&id).cloned())
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<Template>> {
        let tables = self.tables.read().await;
        Ok(tables.templates.values().find(|t| t.name == name).cloned())
    }
}

#[async_trait]
impl CampaignRepository for MemoryStore {
    async fn get(&self, id: CampaignId) -> Result<Option<Campaign>> {
        Ok(self.tables.read().await.campaigns.get(&id).cloned())
    }

    async fn variants(&self, campaign_id: CampaignId) -> Result<Vec<CampaignVariant>> {
        let tables = self.tables.read().await;
        Ok(tables
            .variants
            .iter()
            .filter(|v| v.campaign_id == campaign_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RecipientRepository for MemoryStore {
    async fn get(&self, id: RecipientId) -> Result<Option<Recipient>> {
        let tables = self.tables.read().await;
        Ok(tables.recipients.iter().find(|r| r.id == id).cloned())
    }

    async fn list_by_list(
        &self,
        recipient_list_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Page<Recipient>> {
        let tables = self.tables.read().await;
        let matching: Vec<Recipient> = tables
            .recipients
            .iter()
            .filter(|r| r.recipient_list_id == recipient_list_id)
            .cloned()
            .collect();
        let total = matching.len() as i64;
        Ok(Page::new(paginate(matching, limit, offset), total))
    }
}

#[async_trait]
impl VariableRepository for MemoryStore {
    async fn all(&self) -> Result<HashMap<String, String>> {
        Ok(self.tables.read().await.variables.clone())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.tables
            .write()
            .await
            .variables
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

fn paginate<T>(rows: Vec<T>, limit: i64, offset: i64) -> Vec<T> {
    rows.into_iter()
        .skip(offset.max(0) as usize)
        .take(limit.max(0) as usize)
        .collect()
}
