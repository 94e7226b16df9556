//! Delivery - HTTP clients for MTA servers and the registry that owns them

mod client;
mod registry;

pub use client::{ClientError, DomainSpec, HttpMtaClient, MtaClient, OutboundMessage, RemoteStatus};
pub use registry::{ServerHealth, ServerRegistry};
