//! Error types for the dispatch pipeline

use crate::delivery::ClientError;
use relaymail_common::types::{CampaignId, JobId};
use relaymail_storage::JobStatus;
use thiserror::Error;

/// Errors surfaced to synchronous send callers
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Domain not found: {0}")]
    DomainNotFound(String),

    #[error("No servers available for domain {0}")]
    NoServersAvailable(String),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Delivery via {server} failed: {source}")]
    ServerFailed {
        server: String,
        #[source]
        source: ClientError,
    },

    #[error("All {attempts} servers failed for domain {domain}: {last}")]
    AllServersFailed {
        domain: String,
        attempts: u32,
        #[source]
        last: ClientError,
    },

    #[error(transparent)]
    Storage(#[from] relaymail_common::Error),
}

impl DispatchError {
    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            DispatchError::InvalidRequest(_) => 400,
            DispatchError::DomainNotFound(_) => 404,
            DispatchError::TemplateNotFound(_) => 404,
            DispatchError::NoServersAvailable(_) => 503,
            DispatchError::ServerFailed { .. } => 502,
            DispatchError::AllServersFailed { .. } => 502,
            DispatchError::Storage(e) => e.status_code(),
        }
    }

    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::InvalidRequest(_) => "INVALID_REQUEST",
            DispatchError::DomainNotFound(_) => "DOMAIN_NOT_FOUND",
            DispatchError::TemplateNotFound(_) => "TEMPLATE_NOT_FOUND",
            DispatchError::NoServersAvailable(_) => "NO_SERVERS_AVAILABLE",
            DispatchError::ServerFailed { .. } => "SERVER_FAILED",
            DispatchError::AllServersFailed { .. } => "ALL_SERVERS_FAILED",
            DispatchError::Storage(e) => e.code(),
        }
    }
}

/// Job manager errors
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Campaign not found: {0}")]
    CampaignNotFound(CampaignId),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Cannot {action} a job in status {from}")]
    InvalidTransition {
        from: JobStatus,
        action: &'static str,
    },

    #[error(transparent)]
    Storage(#[from] relaymail_common::Error),
}

impl JobError {
    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            JobError::NotFound(_) | JobError::CampaignNotFound(_) => 404,
            JobError::InvalidRequest(_) => 400,
            JobError::InvalidTransition { .. } => 409,
            JobError::Storage(e) => e.status_code(),
        }
    }

    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            JobError::NotFound(_) => "JOB_NOT_FOUND",
            JobError::CampaignNotFound(_) => "CAMPAIGN_NOT_FOUND",
            JobError::InvalidRequest(_) => "INVALID_REQUEST",
            JobError::InvalidTransition { .. } => "INVALID_TRANSITION",
            JobError::Storage(e) => e.code(),
        }
    }
}
