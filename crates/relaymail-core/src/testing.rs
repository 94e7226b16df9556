//! Test doubles shared by the unit tests

use crate::delivery::{ClientError, DomainSpec, MtaClient, OutboundMessage, RemoteStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relaymail_common::types::{JobId, JobItemId, SendId};
use relaymail_common::{Error, Result as StoreResult};
use relaymail_storage::{
    ItemStatus, JobStats, JobStatus, MemoryStore, NewJobItem, NewSend, NewSendJob, Page, SendJob,
    SendJobItem, SendJobRepository, SendRecord, SendRepository, SendStatus,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Scriptable in-process MTA
pub struct MockMta {
    name: String,
    failure: Option<String>,
    delay: Option<Duration>,
    sent: Mutex<Vec<OutboundMessage>>,
    statuses: Mutex<HashMap<String, RemoteStatus>>,
    pushed: Mutex<Vec<DomainSpec>>,
    status_calls: AtomicUsize,
}

impl MockMta {
    fn build(name: &str, failure: Option<String>, delay: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            failure,
            delay,
            sent: Mutex::new(Vec::new()),
            statuses: Mutex::new(HashMap::new()),
            pushed: Mutex::new(Vec::new()),
            status_calls: AtomicUsize::new(0),
        })
    }

    /// Accepts every message
    pub fn ok(name: &str) -> Arc<Self> {
        Self::build(name, None, None)
    }

    /// Fails every call with a transport error
    pub fn failing(error: &str) -> Arc<Self> {
        Self::build("failing", Some(error.to_string()), None)
    }

    /// Accepts every message after sleeping
    pub fn slow(name: &str, delay: Duration) -> Arc<Self> {
        Self::build(name, None, Some(delay))
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn pushed(&self) -> Vec<DomainSpec> {
        self.pushed.lock().unwrap().clone()
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn set_status(&self, remote_id: &str, status: &str, last_error: Option<&str>) {
        self.statuses.lock().unwrap().insert(
            remote_id.to_string(),
            RemoteStatus {
                status: status.to_string(),
                last_error: last_error.map(str::to_string),
            },
        );
    }

    fn fail(&self) -> Result<(), ClientError> {
        match &self.failure {
            Some(error) => Err(ClientError::Transport(error.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl MtaClient for MockMta {
    async fn send(&self, message: &OutboundMessage) -> Result<String, ClientError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.fail()?;
        let mut sent = self.sent.lock().unwrap();
        sent.push(message.clone());
        Ok(format!("{}-{}", self.name, sent.len()))
    }

    async fn status(&self, remote_id: &str) -> Result<RemoteStatus, ClientError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.fail()?;
        self.statuses
            .lock()
            .unwrap()
            .get(remote_id)
            .cloned()
            .ok_or_else(|| ClientError::Status {
                code: 404,
                body: "unknown message".to_string(),
            })
    }

    async fn health(&self) -> Result<(), ClientError> {
        self.fail()
    }

    async fn push_domain(&self, domain: &DomainSpec) -> Result<(), ClientError> {
        self.fail()?;
        self.pushed.lock().unwrap().push(domain.clone());
        Ok(())
    }

    async fn remove_domain(&self, _name: &str) -> Result<(), ClientError> {
        self.fail()
    }
}

/// Job store whose `mark_item_queued` errors for the first `failures` calls
pub struct FlakyJobs {
    inner: Arc<MemoryStore>,
    failures: AtomicUsize,
    queued_calls: AtomicUsize,
}

impl FlakyJobs {
    pub fn new(inner: Arc<MemoryStore>, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failures: AtomicUsize::new(failures),
            queued_calls: AtomicUsize::new(0),
        })
    }

    pub fn queued_calls(&self) -> usize {
        self.queued_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SendJobRepository for FlakyJobs {
    async fn create(&self, input: NewSendJob, items: Vec<NewJobItem>) -> StoreResult<SendJob> {
        SendJobRepository::create(&*self.inner, input, items).await
    }

    async fn get(&self, id: JobId) -> StoreResult<Option<SendJob>> {
        SendJobRepository::get(&*self.inner, id).await
    }

    async fn list(
        &self,
        status: Option<JobStatus>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Page<SendJob>> {
        SendJobRepository::list(&*self.inner, status, limit, offset).await
    }

    async fn list_by_status(&self, status: JobStatus) -> StoreResult<Vec<SendJob>> {
        self.inner.list_by_status(status).await
    }

    async fn due_scheduled(&self, now: DateTime<Utc>) -> StoreResult<Vec<SendJob>> {
        self.inner.due_scheduled(now).await
    }

    async fn transition(
        &self,
        id: JobId,
        from: &[JobStatus],
        to: JobStatus,
    ) -> StoreResult<Option<SendJob>> {
        self.inner.transition(id, from, to).await
    }

    async fn pending_items(&self, job_id: JobId, limit: i64) -> StoreResult<Vec<SendJobItem>> {
        self.inner.pending_items(job_id, limit).await
    }

    async fn queued_items(&self, limit: i64) -> StoreResult<Vec<SendJobItem>> {
        self.inner.queued_items(limit).await
    }

    async fn mark_items_checked(&self, ids: &[JobItemId]) -> StoreResult<()> {
        self.inner.mark_items_checked(ids).await
    }

    async fn get_item(&self, id: JobItemId) -> StoreResult<Option<SendJobItem>> {
        self.inner.get_item(id).await
    }

    async fn mark_item_queued(&self, id: JobItemId, remote_message_id: &str) -> StoreResult<bool> {
        self.queued_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Database("connection reset".to_string()));
        }
        self.inner.mark_item_queued(id, remote_message_id).await
    }

    async fn mark_item_failed(
        &self,
        id: JobItemId,
        from: ItemStatus,
        error: &str,
    ) -> StoreResult<bool> {
        self.inner.mark_item_failed(id, from, error).await
    }

    async fn mark_item_sent(&self, id: JobItemId) -> StoreResult<bool> {
        self.inner.mark_item_sent(id).await
    }

    async fn reset_failed_items(&self, job_id: JobId) -> StoreResult<u64> {
        self.inner.reset_failed_items(job_id).await
    }

    async fn refresh_stats(&self, job_id: JobId) -> StoreResult<JobStats> {
        self.inner.refresh_stats(job_id).await
    }
}

/// Send store that accepts records but cannot finish them
pub struct UnfinishableSends {
    inner: Arc<MemoryStore>,
}

impl UnfinishableSends {
    pub fn new(inner: Arc<MemoryStore>) -> Arc<Self> {
        Arc::new(Self { inner })
    }
}

#[async_trait]
impl SendRepository for UnfinishableSends {
    async fn create(&self, input: NewSend) -> StoreResult<SendRecord> {
        SendRepository::create(&*self.inner, input).await
    }

    async fn get(&self, id: SendId) -> StoreResult<Option<SendRecord>> {
        SendRepository::get(&*self.inner, id).await
    }

    async fn finish(
        &self,
        _id: SendId,
        _status: SendStatus,
        _remote_message_id: Option<&str>,
        _last_error: Option<&str>,
    ) -> StoreResult<Option<SendRecord>> {
        Err(Error::Database("disk full".to_string()))
    }
}
