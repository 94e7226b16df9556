//! Common types for relaymail

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for domains
pub type DomainId = Uuid;

/// Unique identifier for send jobs
pub type JobId = Uuid;

/// Unique identifier for send job items
pub type JobItemId = Uuid;

/// Unique identifier for direct sends
pub type SendId = Uuid;

/// Unique identifier for API keys
pub type ApiKeyId = Uuid;

/// Unique identifier for templates
pub type TemplateId = Uuid;

/// Unique identifier for campaigns
pub type CampaignId = Uuid;

/// Unique identifier for campaign variants
pub type VariantId = Uuid;

/// Unique identifier for recipients
pub type RecipientId = Uuid;

/// Server selection strategy name, as configured or stored on a job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    RoundRobin,
    Weighted,
    FirstHealthy,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyKind::RoundRobin => write!(f, "round_robin"),
            StrategyKind::Weighted => write!(f, "weighted"),
            StrategyKind::FirstHealthy => write!(f, "first_healthy"),
        }
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" | "" => Ok(StrategyKind::RoundRobin),
            "weighted" => Ok(StrategyKind::Weighted),
            "first_healthy" => Ok(StrategyKind::FirstHealthy),
            other => Err(crate::Error::Validation(format!(
                "Unknown selection strategy: {}",
                other
            ))),
        }
    }
}

/// Email address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmailAddress {
    pub local: String,
    pub domain: String,
}

impl EmailAddress {
    /// Create a new email address
    pub fn new(local: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            domain: domain.into(),
        }
    }

    /// Parse a bare (`user@domain`) or display-name (`Name <user@domain>`) address.
    ///
    /// The domain is case-folded; the local part is kept as written.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let addr = match (s.rfind('<'), s.rfind('>')) {
            (Some(start), Some(end)) if start < end => &s[start + 1..end],
            _ => s,
        };

        let (local, domain) = addr.trim().rsplit_once('@')?;
        let domain = domain.trim();
        if local.is_empty() || domain.is_empty() {
            return None;
        }

        Some(Self::new(local, domain.to_ascii_lowercase()))
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

impl std::str::FromStr for EmailAddress {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| crate::Error::Validation("Invalid email address".to_string()))
    }
}

/// Extract the case-folded domain of a bare or display-name address
pub fn sender_domain(address: &str) -> Option<String> {
    EmailAddress::parse(address).map(|a| a.domain)
}
