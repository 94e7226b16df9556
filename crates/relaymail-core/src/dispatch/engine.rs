//! Campaign dispatch engine - polls running jobs and delivers their items
//!
//! Each tick promotes due scheduled jobs, reconciles queued items against
//! their MTA, then drives every running job one batch forward. All jobs in a
//! tick share one semaphore, so at most `concurrency` sends are in flight.

use crate::content::{ContentResolver, ContentSource, RenderContext};
use crate::delivery::{OutboundMessage, ServerRegistry};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use relaymail_common::config::EngineConfig;
use relaymail_common::types::{JobId, JobItemId, VariantId};
use relaymail_storage::{
    Campaign, CampaignRepository, CampaignVariant, ItemStatus, JobStatus, RecipientRepository,
    Repositories, SendJob, SendJobItem, SendJobRepository,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Header carrying the job id on campaign messages
pub const JOB_HEADER: &str = "X-Relaymail-Job";

/// Header carrying the item id on campaign messages
pub const ITEM_HEADER: &str = "X-Relaymail-Item";

/// What one tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Scheduled jobs moved to running
    pub promoted: usize,
    /// Queued items moved to a terminal status
    pub reconciled: usize,
    /// Items handed to an MTA
    pub queued: usize,
    /// Items that failed at dispatch
    pub failed: usize,
    /// Items accepted by an MTA whose queued status is not stored yet
    pub unrecorded: usize,
    /// Jobs moved to completed or failed
    pub finished: usize,
}

#[derive(Debug, Default)]
struct JobReport {
    queued: usize,
    failed: usize,
    unrecorded: usize,
    finished: bool,
}

/// Where one dispatched item ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Queued,
    Failed,
    /// The MTA took the message but the store did not record it
    Unrecorded,
}

/// Attempts at storing the queued status before giving up for this tick
const RECORD_ATTEMPTS: u32 = 3;

/// Campaign data shared by every item of one job batch
struct JobContext {
    campaign: Campaign,
    campaign_vars: HashMap<String, String>,
    variants: HashMap<VariantId, CampaignVariant>,
    global: HashMap<String, String>,
}

#[derive(Clone)]
struct Worker {
    jobs: Arc<dyn SendJobRepository>,
    campaigns: Arc<dyn CampaignRepository>,
    recipients: Arc<dyn RecipientRepository>,
    resolver: Arc<ContentResolver>,
    registry: Arc<ServerRegistry>,
    semaphore: Arc<Semaphore>,
    batch_size: i64,
    reconcile_batch_size: i64,
    /// Remote ids of delivered items whose queued write failed; never resent
    unrecorded: Arc<Mutex<HashMap<JobItemId, String>>>,
}

/// Campaign dispatch engine
pub struct DispatchEngine {
    worker: Worker,
    poll_interval: Duration,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DispatchEngine {
    /// Create a new engine
    pub fn new(
        repos: &Repositories,
        resolver: Arc<ContentResolver>,
        registry: Arc<ServerRegistry>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            worker: Worker {
                jobs: repos.jobs.clone(),
                campaigns: repos.campaigns.clone(),
                recipients: repos.recipients.clone(),
                resolver,
                registry,
                semaphore: Arc::new(Semaphore::new(config.concurrency.max(1))),
                batch_size: config.batch_size,
                reconcile_batch_size: config.reconcile_batch_size,
                unrecorded: Arc::new(Mutex::new(HashMap::new())),
            },
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the polling loop. Calling it again while running does nothing.
    pub fn start(&self) {
        let mut handle = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if handle.is_some() {
            warn!("Dispatch engine already started");
            return;
        }

        let worker = self.worker.clone();
        let cancel = self.cancel.clone();
        let every = self.poll_interval;

        info!(
            "Dispatch engine started (concurrency: {}, batch: {}, interval: {}s)",
            worker.semaphore.available_permits(),
            worker.batch_size,
            every.as_secs()
        );

        *handle = Some(tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                worker.tick(&cancel).await;
            }

            info!("Dispatch engine stopped");
        }));
    }

    /// Signal the loop to stop and wait for the in-flight tick to drain
    pub async fn stop(&self) {
        self.cancel.cancel();

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Dispatch engine task failed: {}", e);
            }
        }
    }

    /// Whether `stop` has been called
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run one tick inline
    pub async fn tick(&self) -> TickReport {
        self.worker.tick(&self.cancel).await
    }
}

impl Worker {
    async fn tick(&self, cancel: &CancellationToken) -> TickReport {
        let mut report = TickReport::default();

        match self.promote_scheduled().await {
            Ok(n) => report.promoted = n,
            Err(e) => error!("Error promoting scheduled jobs: {:#}", e),
        }

        if let Err(e) = self.reconcile(&mut report).await {
            error!("Error reconciling queued items: {:#}", e);
        }

        if let Err(e) = self.drive_running_jobs(cancel, &mut report).await {
            error!("Error driving running jobs: {:#}", e);
        }

        if report != TickReport::default() {
            debug!(?report, "Dispatch tick finished");
        }
        report
    }

    async fn promote_scheduled(&self) -> Result<usize> {
        let due = self.jobs.due_scheduled(Utc::now()).await?;
        let mut promoted = 0;

        for job in due {
            if self
                .jobs
                .transition(job.id, &[JobStatus::Scheduled], JobStatus::Running)
                .await?
                .is_some()
            {
                info!(job_id = %job.id, "Scheduled job started");
                promoted += 1;
            }
        }

        Ok(promoted)
    }

    async fn reconcile(&self, report: &mut TickReport) -> Result<()> {
        let items = self.jobs.queued_items(self.reconcile_batch_size).await?;
        if items.is_empty() {
            return Ok(());
        }

        debug!("Reconciling {} queued items", items.len());

        // stamp before asking so items still in flight rotate to the back
        let ids: Vec<JobItemId> = items.iter().map(|i| i.id).collect();
        self.jobs.mark_items_checked(&ids).await?;

        let mut set = JoinSet::new();
        for item in items {
            let permit = self.semaphore.clone().acquire_owned().await?;
            let worker = self.clone();
            set.spawn(async move {
                let changed = worker.reconcile_item(&item).await;
                drop(permit);
                changed.then_some(item.job_id)
            });
        }

        let mut touched: HashSet<JobId> = HashSet::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Some(job_id)) => {
                    report.reconciled += 1;
                    touched.insert(job_id);
                }
                Ok(None) => {}
                Err(e) => error!("Reconcile task error: {}", e),
            }
        }

        for job_id in touched {
            match self.reevaluate_finished(job_id).await {
                Ok(true) => report.finished += 1,
                Ok(false) => {}
                Err(e) => error!("Failed to refresh job {}: {:#}", job_id, e),
            }
        }

        Ok(())
    }

    /// Refresh counters and correct the outcome of a job that finished
    /// while some of its items were still queued
    async fn reevaluate_finished(&self, job_id: JobId) -> Result<bool> {
        let stats = self.jobs.refresh_stats(job_id).await?;

        let Some(job) = self.jobs.get(job_id).await? else {
            return Ok(false);
        };
        let Some(current) = job
            .status_enum()
            .filter(|s| matches!(s, JobStatus::Completed | JobStatus::Failed))
        else {
            return Ok(false);
        };
        let Some(terminal) = stats.terminal_status().filter(|t| *t != current) else {
            return Ok(false);
        };

        let moved = self
            .jobs
            .transition(job_id, &[current], terminal)
            .await?
            .is_some();
        if moved {
            info!(
                job_id = %job_id,
                from = %current,
                to = %terminal,
                sent = stats.sent,
                failed = stats.failed,
                "Job outcome revised after reconciliation"
            );
        }
        Ok(moved)
    }

    /// Check one queued item against its MTA; errors leave it queued
    async fn reconcile_item(&self, item: &SendJobItem) -> bool {
        let Some(remote_id) = item.remote_message_id.as_deref() else {
            return false;
        };
        let Some(client) = self.registry.get(&item.server_name) else {
            debug!(item_id = %item.id, server = %item.server_name, "Server not configured, skipping reconcile");
            return false;
        };

        let remote = match client.status(remote_id).await {
            Ok(remote) => remote,
            Err(e) => {
                debug!(item_id = %item.id, remote_id = %remote_id, error = %e, "Status check failed");
                return false;
            }
        };

        let updated = match remote.terminal_item_status() {
            Some(ItemStatus::Sent) => self.jobs.mark_item_sent(item.id).await,
            Some(_) => {
                let error = remote
                    .last_error
                    .clone()
                    .unwrap_or_else(|| format!("remote status {}", remote.status));
                self.jobs
                    .mark_item_failed(item.id, ItemStatus::Queued, &error)
                    .await
            }
            None => return false,
        };

        match updated {
            Ok(true) => {
                info!(
                    item_id = %item.id,
                    job_id = %item.job_id,
                    remote_status = %remote.status,
                    "Reconciled queued item"
                );
                true
            }
            Ok(false) => false,
            Err(e) => {
                debug!(item_id = %item.id, error = %e, "Failed to store reconciled status");
                false
            }
        }
    }

    async fn drive_running_jobs(
        &self,
        cancel: &CancellationToken,
        report: &mut TickReport,
    ) -> Result<()> {
        let jobs = self.jobs.list_by_status(JobStatus::Running).await?;

        let mut set = JoinSet::new();
        for job in jobs {
            if cancel.is_cancelled() {
                debug!("Shutdown requested, not starting further jobs");
                break;
            }
            let worker = self.clone();
            let job_id = job.id;
            set.spawn(async move { (job_id, worker.drive_job(job).await) });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(job_report))) => {
                    report.queued += job_report.queued;
                    report.failed += job_report.failed;
                    report.unrecorded += job_report.unrecorded;
                    report.finished += usize::from(job_report.finished);
                }
                Ok((job_id, Err(e))) => error!("Error processing job {}: {:#}", job_id, e),
                Err(e) => error!("Job task error: {}", e),
            }
        }

        Ok(())
    }

    /// Advance one running job by a single batch
    async fn drive_job(&self, job: SendJob) -> Result<JobReport> {
        let items = self.jobs.pending_items(job.id, self.batch_size).await?;

        if items.is_empty() {
            let stats = self.jobs.refresh_stats(job.id).await?;
            let Some(terminal) = stats.terminal_status() else {
                return Ok(JobReport::default());
            };

            let finished = self
                .jobs
                .transition(job.id, &[JobStatus::Running], terminal)
                .await?
                .is_some();
            if finished {
                info!(
                    job_id = %job.id,
                    status = %terminal,
                    sent = stats.sent,
                    queued = stats.queued,
                    failed = stats.failed,
                    "Job finished"
                );
            }
            return Ok(JobReport {
                finished,
                ..Default::default()
            });
        }

        let mut report = JobReport::default();
        let items = self.record_unrecorded(items, &mut report).await;
        if items.is_empty() {
            self.jobs.refresh_stats(job.id).await?;
            return Ok(report);
        }

        debug!("Dispatching {} items for job {}", items.len(), job.id);

        let context = Arc::new(
            self.load_context(&job)
                .await
                .map_err(|e| format!("{:#}", e)),
        );

        let mut set = JoinSet::new();
        for item in items {
            let permit = self.semaphore.clone().acquire_owned().await?;
            let worker = self.clone();
            let context = context.clone();
            set.spawn(async move {
                let outcome = worker.dispatch_item(&context, &item).await;
                drop(permit);
                outcome
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(ItemOutcome::Queued) => report.queued += 1,
                Ok(ItemOutcome::Failed) => report.failed += 1,
                Ok(ItemOutcome::Unrecorded) => report.unrecorded += 1,
                Err(e) => error!("Dispatch task error: {}", e),
            }
        }

        self.jobs.refresh_stats(job.id).await?;
        Ok(report)
    }

    async fn load_context(&self, job: &SendJob) -> Result<JobContext> {
        let campaign = self
            .campaigns
            .get(job.campaign_id)
            .await?
            .ok_or_else(|| anyhow!("campaign {} not found", job.campaign_id))?;

        let variants = self
            .campaigns
            .variants(campaign.id)
            .await?
            .into_iter()
            .map(|v| (v.id, v))
            .collect();

        let global = self.resolver.global_variables().await?;

        Ok(JobContext {
            campaign_vars: campaign.variables_map(),
            campaign,
            variants,
            global,
        })
    }

    /// Store the queued status for pending items an MTA already accepted.
    ///
    /// Returns the items that still need sending.
    async fn record_unrecorded(
        &self,
        items: Vec<SendJobItem>,
        report: &mut JobReport,
    ) -> Vec<SendJobItem> {
        let known = self.unrecorded.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if known.is_empty() {
            return items;
        }

        let mut remaining = Vec::with_capacity(items.len());
        for item in items {
            let Some(remote_id) = known.get(&item.id) else {
                remaining.push(item);
                continue;
            };
            if self.record_queued(&item, remote_id).await == ItemOutcome::Queued {
                info!(item_id = %item.id, remote_id = %remote_id, "Recorded previously delivered item");
                report.queued += 1;
            } else {
                report.unrecorded += 1;
            }
        }
        remaining
    }

    /// `pending → queued` with a few retries. Items that still cannot be
    /// stored are remembered so the next pass records them instead of
    /// sending the message again.
    async fn record_queued(&self, item: &SendJobItem, remote_id: &str) -> ItemOutcome {
        let mut attempt = 1;
        let result = loop {
            match self.jobs.mark_item_queued(item.id, remote_id).await {
                Err(e) if attempt < RECORD_ATTEMPTS => {
                    debug!(item_id = %item.id, attempt, error = %e, "Retrying queued status write");
                    tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                    attempt += 1;
                }
                result => break result,
            }
        };

        let mut unrecorded = self.unrecorded.lock().unwrap_or_else(|e| e.into_inner());
        match result {
            Ok(true) => {
                unrecorded.remove(&item.id);
                ItemOutcome::Queued
            }
            Ok(false) => {
                unrecorded.remove(&item.id);
                warn!(
                    item_id = %item.id,
                    remote_id = %remote_id,
                    "Item left pending before its queued status was stored"
                );
                ItemOutcome::Unrecorded
            }
            Err(e) => {
                unrecorded.insert(item.id, remote_id.to_string());
                error!(
                    item_id = %item.id,
                    remote_id = %remote_id,
                    error = %e,
                    "Delivered item could not be marked queued"
                );
                ItemOutcome::Unrecorded
            }
        }
    }

    /// Send one item and record the outcome
    async fn dispatch_item(
        &self,
        context: &std::result::Result<JobContext, String>,
        item: &SendJobItem,
    ) -> ItemOutcome {
        let outcome = match context {
            Ok(context) => self.send_item(context, item).await,
            Err(e) => Err(anyhow!("{}", e)),
        };

        match outcome {
            Ok(remote_id) => {
                debug!(
                    item_id = %item.id,
                    server = %item.server_name,
                    remote_id = %remote_id,
                    "Item queued"
                );
                self.record_queued(item, &remote_id).await
            }
            Err(e) => {
                let error_text = format!("{:#}", e);
                warn!(
                    item_id = %item.id,
                    server = %item.server_name,
                    error = %error_text,
                    "Item dispatch failed"
                );
                if let Err(e) = self
                    .jobs
                    .mark_item_failed(item.id, ItemStatus::Pending, &error_text)
                    .await
                {
                    error!("Failed to mark item {} as failed: {}", item.id, e);
                }
                ItemOutcome::Failed
            }
        }
    }

    async fn send_item(&self, context: &JobContext, item: &SendJobItem) -> Result<String> {
        let recipient = self
            .recipients
            .get(item.recipient_id)
            .await?
            .ok_or_else(|| anyhow!("recipient {} not found", item.recipient_id))?;

        let variant = item.variant_id.and_then(|id| context.variants.get(&id));
        let source = ContentSource::for_campaign(&context.campaign, variant);
        let render = RenderContext {
            global: Some(context.global.clone()),
            campaign: context.campaign_vars.clone(),
            recipient: recipient.variables_map(),
            recipient_email: Some(recipient.email.clone()),
            recipient_name: recipient.name.clone(),
        };
        let content = self.resolver.resolve(&source, &render).await?;

        // no re-routing: the server was fixed when the job was created
        let client = self
            .registry
            .get(&item.server_name)
            .ok_or_else(|| anyhow!("server {} is not configured", item.server_name))?;

        let message = OutboundMessage {
            from: context.campaign.from_address.clone(),
            to: recipient.email,
            reply_to: context.campaign.reply_to.clone(),
            subject: content.subject,
            html: content.html,
            text: content.text,
            headers: HashMap::from([
                (JOB_HEADER.to_string(), item.job_id.to_string()),
                (ITEM_HEADER.to_string(), item.id.to_string()),
            ]),
        };

        client
            .send(&message)
            .await
            .with_context(|| format!("delivery via {} failed", item.server_name))
    }
}
