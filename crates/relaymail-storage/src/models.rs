//! Database models

use chrono::{DateTime, Utc};
use relaymail_common::types::{
    ApiKeyId, CampaignId, DomainId, JobId, JobItemId, RecipientId, SendId, StrategyKind,
    TemplateId, VariantId,
};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use std::collections::HashMap;

/// A filtered/paginated read: the page of rows plus the total match count
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: i64) -> Self {
        Self { items, total }
    }
}

/// How the MTA treats mail from a domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    Production,
    Sandbox,
    Redirect,
    Bcc,
}

impl std::fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryMode::Production => write!(f, "production"),
            DeliveryMode::Sandbox => write!(f, "sandbox"),
            DeliveryMode::Redirect => write!(f, "redirect"),
            DeliveryMode::Bcc => write!(f, "bcc"),
        }
    }
}

impl std::str::FromStr for DeliveryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "production" => Ok(DeliveryMode::Production),
            "sandbox" => Ok(DeliveryMode::Sandbox),
            "redirect" => Ok(DeliveryMode::Redirect),
            "bcc" => Ok(DeliveryMode::Bcc),
            _ => Err(format!("Invalid delivery mode: {}", s)),
        }
    }
}

/// Sender domain model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Domain {
    pub id: DomainId,
    pub name: String,
    pub delivery_mode: String,
    pub redirect_to: Option<String>,
    pub bcc_to: Option<String>,
    pub dkim_selector: Option<String>,
    pub dkim_enabled: bool,
    pub rate_limit_per_minute: i32,
    pub rate_limit_per_hour: i32,
    pub config_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Domain {
    /// A production domain with no limits and a freshly computed hash
    pub fn new(name: &str) -> Self {
        let now = Utc::now();
        let mut domain = Self {
            id: uuid::Uuid::now_v7(),
            name: name.to_ascii_lowercase(),
            delivery_mode: DeliveryMode::Production.to_string(),
            redirect_to: None,
            bcc_to: None,
            dkim_selector: None,
            dkim_enabled: false,
            rate_limit_per_minute: 0,
            rate_limit_per_hour: 0,
            config_hash: String::new(),
            created_at: now,
            updated_at: now,
        };
        domain.config_hash = domain.compute_config_hash();
        domain
    }

    /// Get delivery mode enum
    pub fn delivery_mode_enum(&self) -> Option<DeliveryMode> {
        self.delivery_mode.parse().ok()
    }

    /// Hash over every field an MTA needs to know about.
    ///
    /// A deployment whose stored hash differs from this value is outdated.
    pub fn compute_config_hash(&self) -> String {
        let fields = [
            self.name.as_str(),
            self.delivery_mode.as_str(),
            self.redirect_to.as_deref().unwrap_or(""),
            self.bcc_to.as_deref().unwrap_or(""),
            self.dkim_selector.as_deref().unwrap_or(""),
            if self.dkim_enabled { "1" } else { "0" },
            &self.rate_limit_per_minute.to_string(),
            &self.rate_limit_per_hour.to_string(),
        ];

        let mut hasher = Sha256::new();
        for field in fields {
            hasher.update(field.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }
}

/// Deployment status of a domain on one MTA server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Deployed,
    Outdated,
    Failed,
}

impl DeploymentStatus {
    /// Outdated deployments keep serving traffic until they are re-synced
    pub fn is_routable(&self) -> bool {
        matches!(self, DeploymentStatus::Deployed | DeploymentStatus::Outdated)
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeploymentStatus::Deployed => write!(f, "deployed"),
            DeploymentStatus::Outdated => write!(f, "outdated"),
            DeploymentStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deployed" => Ok(DeploymentStatus::Deployed),
            "outdated" => Ok(DeploymentStatus::Outdated),
            "failed" => Ok(DeploymentStatus::Failed),
            _ => Err(format!("Invalid deployment status: {}", s)),
        }
    }
}

/// Domain deployment model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DomainDeployment {
    pub id: uuid::Uuid,
    pub domain_id: DomainId,
    pub server_name: String,
    pub status: String,
    pub deployed_hash: Option<String>,
    pub position: i32,
    pub last_error: Option<String>,
    pub deployed_at: Option<DateTime<Utc>>,
}

impl DomainDeployment {
    /// Get status enum
    pub fn status_enum(&self) -> Option<DeploymentStatus> {
        self.status.parse().ok()
    }
}

/// A domain together with its deployments, ordered by position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    pub domain: Domain,
    pub deployments: Vec<DomainDeployment>,
}

impl DomainConfig {
    /// Server names of deployments eligible for routing, in deployment order
    pub fn routable_servers(&self) -> Vec<String> {
        self.deployments
            .iter()
            .filter(|d| d.status_enum().is_some_and(|s| s.is_routable()))
            .map(|d| d.server_name.clone())
            .collect()
    }

    /// Server names whose deployment needs a re-sync
    pub fn outdated_servers(&self) -> Vec<String> {
        self.deployments
            .iter()
            .filter(|d| d.status_enum() == Some(DeploymentStatus::Outdated))
            .map(|d| d.server_name.clone())
            .collect()
    }
}

/// Mutable domain settings
///
/// For the nullable fields, a missing key leaves the value alone and an
/// explicit `null` clears it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateDomain {
    pub delivery_mode: Option<DeliveryMode>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub redirect_to: Option<Option<String>>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub bcc_to: Option<Option<String>>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub dkim_selector: Option<Option<String>>,
    pub dkim_enabled: Option<bool>,
    pub rate_limit_per_minute: Option<i32>,
    pub rate_limit_per_hour: Option<i32>,
}

/// Distinguish a present `null` from an absent key
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Send job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Draft,
    Scheduled,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Whether an operator or the engine may move a job from `self` to `next`
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Draft, Scheduled)
                | (Draft, Running)
                | (Scheduled, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Scheduled, Cancelled)
                | (Running, Cancelled)
                | (Paused, Cancelled)
                // re-runs
                | (Completed, Running)
                | (Failed, Running)
                | (Cancelled, Running)
        )
    }

    /// Whether the job has finished (completed, failed or cancelled)
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Draft => write!(f, "draft"),
            JobStatus::Scheduled => write!(f, "scheduled"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Paused => write!(f, "paused"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(JobStatus::Draft),
            "scheduled" => Ok(JobStatus::Scheduled),
            "running" => Ok(JobStatus::Running),
            "paused" => Ok(JobStatus::Paused),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// Aggregate item counts for a job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub total: i64,
    pub pending: i64,
    pub queued: i64,
    pub sent: i64,
    pub failed: i64,
}

impl JobStats {
    /// Terminal status once no items remain pending, `None` while work remains.
    ///
    /// Queued items were accepted by an MTA and count as successes.
    pub fn terminal_status(&self) -> Option<JobStatus> {
        if self.pending > 0 {
            return None;
        }
        if self.failed > 0 && self.sent + self.queued == 0 {
            Some(JobStatus::Failed)
        } else {
            Some(JobStatus::Completed)
        }
    }
}

/// Send job model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SendJob {
    pub id: JobId,
    pub campaign_id: CampaignId,
    pub status: String,
    pub servers: serde_json::Value,
    pub strategy: String,
    pub dry_run_limit: Option<i32>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub total: i64,
    pub pending: i64,
    pub queued: i64,
    pub sent: i64,
    pub failed: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SendJob {
    /// Get status enum
    pub fn status_enum(&self) -> Option<JobStatus> {
        self.status.parse().ok()
    }

    /// Get strategy enum, falling back to round robin for unknown names
    pub fn strategy_enum(&self) -> StrategyKind {
        self.strategy.parse().unwrap_or_default()
    }

    /// Get the chosen servers as a vector
    pub fn servers_vec(&self) -> Vec<String> {
        serde_json::from_value(self.servers.clone()).unwrap_or_default()
    }

    /// Snapshot of the persisted aggregate counters
    pub fn stats(&self) -> JobStats {
        JobStats {
            total: self.total,
            pending: self.pending,
            queued: self.queued,
            sent: self.sent,
            failed: self.failed,
        }
    }
}

/// Create send job input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSendJob {
    pub campaign_id: CampaignId,
    pub status: JobStatus,
    pub servers: Vec<String>,
    pub strategy: StrategyKind,
    pub dry_run_limit: Option<i32>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// Send job item status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Queued,
    Sent,
    Failed,
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemStatus::Pending => write!(f, "pending"),
            ItemStatus::Queued => write!(f, "queued"),
            ItemStatus::Sent => write!(f, "sent"),
            ItemStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ItemStatus::Pending),
            "queued" => Ok(ItemStatus::Queued),
            "sent" => Ok(ItemStatus::Sent),
            "failed" => Ok(ItemStatus::Failed),
            _ => Err(format!("Invalid item status: {}", s)),
        }
    }
}

/// Send job item model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SendJobItem {
    pub id: JobItemId,
    pub job_id: JobId,
    pub recipient_id: RecipientId,
    pub variant_id: Option<VariantId>,
    pub server_name: String,
    pub status: String,
    pub remote_message_id: Option<String>,
    pub last_error: Option<String>,
    /// Last time reconciliation asked the MTA about this item
    pub last_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SendJobItem {
    /// Get status enum
    pub fn status_enum(&self) -> Option<ItemStatus> {
        self.status.parse().ok()
    }
}

/// Create send job item input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJobItem {
    pub recipient_id: RecipientId,
    pub variant_id: Option<VariantId>,
    pub server_name: String,
}

/// Direct send status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStatus {
    Pending,
    Sent,
    Failed,
}

impl std::fmt::Display for SendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendStatus::Pending => write!(f, "pending"),
            SendStatus::Sent => write!(f, "sent"),
            SendStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Direct (API-triggered) send record
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SendRecord {
    pub id: SendId,
    pub api_key_id: Option<ApiKeyId>,
    pub from_address: String,
    pub to_address: String,
    pub domain: String,
    pub server_name: String,
    pub status: String,
    pub remote_message_id: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Create send input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSend {
    pub api_key_id: Option<ApiKeyId>,
    pub from_address: String,
    pub to_address: String,
    pub domain: String,
    pub server_name: String,
}

/// Stored message template
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Template {
    pub id: TemplateId,
    pub name: String,
    pub subject: String,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Template {
    pub fn new(name: &str, subject: &str, html_body: Option<&str>, text_body: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::now_v7(),
            name: name.to_string(),
            subject: subject.to_string(),
            html_body: html_body.map(str::to_string),
            text_body: text_body.map(str::to_string),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Campaign model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub name: String,
    pub from_address: String,
    pub reply_to: Option<String>,
    pub template_id: Option<TemplateId>,
    pub subject: Option<String>,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
    pub variables: serde_json::Value,
    pub recipient_list_id: uuid::Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    /// A campaign with raw content and no variables
    pub fn new(name: &str, from_address: &str, recipient_list_id: uuid::Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::now_v7(),
            name: name.to_string(),
            from_address: from_address.to_string(),
            reply_to: None,
            template_id: None,
            subject: None,
            html_body: None,
            text_body: None,
            variables: serde_json::json!({}),
            recipient_list_id,
            created_at: now,
            updated_at: now,
        }
    }

    /// Campaign-level template variables
    pub fn variables_map(&self) -> HashMap<String, String> {
        json_to_string_map(&self.variables)
    }
}

/// Campaign variant (A/B content alternative)
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CampaignVariant {
    pub id: VariantId,
    pub campaign_id: CampaignId,
    pub name: String,
    pub weight: i32,
    pub template_id: Option<TemplateId>,
    pub subject: Option<String>,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
}

/// Recipient model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Recipient {
    pub id: RecipientId,
    pub recipient_list_id: uuid::Uuid,
    pub email: String,
    pub name: Option<String>,
    pub variables: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Recipient {
    pub fn new(recipient_list_id: uuid::Uuid, email: &str, name: Option<&str>) -> Self {
        Self {
            id: uuid::Uuid::now_v7(),
            recipient_list_id,
            email: email.to_string(),
            name: name.map(str::to_string),
            variables: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    /// Recipient-level template variables
    pub fn variables_map(&self) -> HashMap<String, String> {
        json_to_string_map(&self.variables)
    }
}

/// Flatten a JSON object into string values; non-objects yield an empty map
pub fn json_to_string_map(value: &serde_json::Value) -> HashMap<String, String> {
    let Some(obj) = value.as_object() else {
        return HashMap::new();
    };

    obj.iter()
        .map(|(key, value)| {
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            };
            (key.clone(), value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn domain() -> Domain {
        Domain {
            id: uuid::Uuid::new_v4(),
            name: "example.com".to_string(),
            delivery_mode: "production".to_string(),
            redirect_to: None,
            bcc_to: None,
            dkim_selector: Some("s1".to_string()),
            dkim_enabled: true,
            rate_limit_per_minute: 0,
            rate_limit_per_hour: 0,
            config_hash: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_config_hash_tracks_mutable_fields() {
        let a = domain();
        let mut b = a.clone();
        assert_eq!(a.compute_config_hash(), b.compute_config_hash());

        b.delivery_mode = "sandbox".to_string();
        assert_ne!(a.compute_config_hash(), b.compute_config_hash());

        // timestamps are not part of the configuration
        let mut c = a.clone();
        c.updated_at = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(a.compute_config_hash(), c.compute_config_hash());
    }

    #[test]
    fn test_update_distinguishes_null_from_missing() {
        let mut d = domain();
        d.redirect_to = Some("qa@example.com".to_string());
        d.bcc_to = Some("audit@example.com".to_string());

        let update: UpdateDomain = serde_json::from_value(serde_json::json!({
            "redirect_to": null,
            "dkim_selector": "s2"
        }))
        .unwrap();
        assert_eq!(update.redirect_to, Some(None));
        assert_eq!(update.bcc_to, None);

        let before = d.compute_config_hash();
        crate::repository::domains::apply_domain_update(&mut d, update);
        assert_eq!(d.redirect_to, None);
        assert_eq!(d.bcc_to.as_deref(), Some("audit@example.com"));
        assert_eq!(d.dkim_selector.as_deref(), Some("s2"));
        assert_ne!(d.config_hash, before);
    }

    #[test]
    fn test_terminal_status() {
        let running = JobStats { total: 3, pending: 1, queued: 0, sent: 1, failed: 1 };
        assert_eq!(running.terminal_status(), None);

        let mixed = JobStats { total: 3, pending: 0, queued: 0, sent: 1, failed: 2 };
        assert_eq!(mixed.terminal_status(), Some(JobStatus::Completed));

        let all_failed = JobStats { total: 2, pending: 0, queued: 0, sent: 0, failed: 2 };
        assert_eq!(all_failed.terminal_status(), Some(JobStatus::Failed));

        let accepted = JobStats { total: 2, pending: 0, queued: 1, sent: 0, failed: 1 };
        assert_eq!(accepted.terminal_status(), Some(JobStatus::Completed));
    }

    #[test]
    fn test_job_transitions() {
        assert!(JobStatus::Running.can_transition_to(JobStatus::Paused));
        assert!(JobStatus::Paused.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Scheduled.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Paused));
        assert!(!JobStatus::Cancelled.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Scheduled.can_transition_to(JobStatus::Paused));
    }

    #[test]
    fn test_json_to_string_map() {
        let map = json_to_string_map(&serde_json::json!({
            "plan": "pro",
            "seats": 5,
            "trial": false,
            "note": null
        }));
        assert_eq!(map["plan"], "pro");
        assert_eq!(map["seats"], "5");
        assert_eq!(map["trial"], "false");
        assert_eq!(map["note"], "");

        assert!(json_to_string_map(&serde_json::json!([1, 2])).is_empty());
    }
}
