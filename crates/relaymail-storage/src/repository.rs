//! Repository layer for data access

pub mod api_keys;
pub mod campaigns;
pub mod domains;
pub mod recipients;
pub mod send_jobs;
pub mod sends;
pub mod templates;
pub mod variables;

pub use api_keys::{ApiKey, ApiKeyRepository, DbApiKeyRepository, SCOPE_ADMIN, SCOPE_SEND};
pub use campaigns::{CampaignRepository, DbCampaignRepository};
pub use domains::{DbDomainRepository, DomainRepository};
pub use recipients::{DbRecipientRepository, RecipientRepository};
pub use send_jobs::{DbSendJobRepository, SendJobRepository};
pub use sends::{DbSendRepository, SendRepository};
pub use templates::{DbTemplateRepository, TemplateRepository};
pub use variables::{DbVariableRepository, VariableRepository};

use crate::db::DatabasePool;
use crate::memory::MemoryStore;
use std::sync::Arc;

/// Every repository the pipeline needs, behind trait objects
#[derive(Clone)]
pub struct Repositories {
    pub domains: Arc<dyn DomainRepository>,
    pub jobs: Arc<dyn SendJobRepository>,
    pub sends: Arc<dyn SendRepository>,
    pub api_keys: Arc<dyn ApiKeyRepository>,
    pub templates: Arc<dyn TemplateRepository>,
    pub campaigns: Arc<dyn CampaignRepository>,
    pub recipients: Arc<dyn RecipientRepository>,
    pub variables: Arc<dyn VariableRepository>,
}

impl Repositories {
    /// PostgreSQL-backed repositories sharing one pool
    pub fn postgres(pool: DatabasePool) -> Self {
        Self {
            domains: Arc::new(DbDomainRepository::new(pool.clone())),
            jobs: Arc::new(DbSendJobRepository::new(pool.clone())),
            sends: Arc::new(DbSendRepository::new(pool.clone())),
            api_keys: Arc::new(DbApiKeyRepository::new(pool.clone())),
            templates: Arc::new(DbTemplateRepository::new(pool.clone())),
            campaigns: Arc::new(DbCampaignRepository::new(pool.clone())),
            recipients: Arc::new(DbRecipientRepository::new(pool.clone())),
            variables: Arc::new(DbVariableRepository::new(pool)),
        }
    }

    /// In-process repositories sharing one store
    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Self {
            domains: store.clone(),
            jobs: store.clone(),
            sends: store.clone(),
            api_keys: store.clone(),
            templates: store.clone(),
            campaigns: store.clone(),
            recipients: store.clone(),
            variables: store,
        }
    }
}
