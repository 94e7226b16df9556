//! relaymail core - routing, content resolution and campaign dispatch
//!
//! This crate holds the send pipeline: MTA clients and their registry, the
//! domain router with failover, template rendering, per-key rate limiting,
//! direct sends, domain sync, and the campaign dispatch engine.

pub mod content;
pub mod delivery;
pub mod dispatch;
pub mod error;
pub mod ratelimit;
pub mod routing;
pub mod send;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use content::{ContentResolver, ContentSource, RenderContext, RenderedContent, TemplateRef};
pub use delivery::{ClientError, HttpMtaClient, MtaClient, OutboundMessage, ServerHealth, ServerRegistry};
pub use dispatch::{CreateJobRequest, DispatchEngine, JobManager, RetryAction, TickReport};
pub use error::{DispatchError, JobError};
pub use ratelimit::{RateLimiter, RemainingQuota};
pub use routing::{Delivery, DomainRouter, Route};
pub use send::{SendRequest, SendResponse, SendService};
pub use sync::DomainSync;
