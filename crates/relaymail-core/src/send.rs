//! Direct send service - one message, routed and delivered synchronously

use crate::content::{ContentResolver, ContentSource, RenderContext, TemplateRef};
use crate::delivery::OutboundMessage;
use crate::error::DispatchError;
use crate::routing::DomainRouter;
use relaymail_common::types::{sender_domain, EmailAddress, SendId, TemplateId};
use relaymail_storage::{ApiKey, NewSend, SendRecord, SendRepository, SendStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Direct send request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SendRequest {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub template_id: Option<TemplateId>,
    #[serde(default)]
    pub template_name: Option<String>,
    /// Recipient-level variables for template rendering
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default)]
    pub recipient_name: Option<String>,
    /// Preferred server, used when eligible
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Direct send result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendResponse {
    pub id: SendId,
    pub status: SendStatus,
    pub server_name: String,
    pub remote_message_id: Option<String>,
}

/// Direct send service
pub struct SendService {
    sends: Arc<dyn SendRepository>,
    resolver: Arc<ContentResolver>,
    router: Arc<DomainRouter>,
}

impl SendService {
    /// Create a new send service
    pub fn new(
        sends: Arc<dyn SendRepository>,
        resolver: Arc<ContentResolver>,
        router: Arc<DomainRouter>,
    ) -> Self {
        Self {
            sends,
            resolver,
            router,
        }
    }

    /// Validate, render, route and deliver one message, recording the outcome
    pub async fn send_now(
        &self,
        request: SendRequest,
        api_key: Option<&ApiKey>,
    ) -> Result<SendResponse, DispatchError> {
        let template = template_ref(&request)?;

        let to = EmailAddress::parse(&request.to).ok_or_else(|| {
            DispatchError::InvalidRequest(format!("invalid recipient address: {:?}", request.to))
        })?;
        let domain = sender_domain(&request.from).ok_or_else(|| {
            DispatchError::InvalidRequest(format!("invalid sender address: {:?}", request.from))
        })?;

        if let Some(key) = api_key {
            if !key.allows_domain(&domain) {
                return Err(DispatchError::InvalidRequest(format!(
                    "API key {} may not send from {}",
                    key.key_prefix, domain
                )));
            }
        }

        let source = ContentSource {
            template,
            subject: request.subject.clone(),
            html: request.html.clone(),
            text: request.text.clone(),
        };
        let ctx = RenderContext {
            global: None,
            campaign: HashMap::new(),
            recipient: request.variables.clone(),
            recipient_email: Some(to.to_string()),
            recipient_name: request.recipient_name.clone(),
        };
        let content = self.resolver.resolve(&source, &ctx).await?;

        let route = self
            .router
            .route(&request.from, request.server.as_deref())
            .await?;

        let record = self
            .sends
            .create(NewSend {
                api_key_id: api_key.map(|k| k.id),
                from_address: request.from.clone(),
                to_address: request.to.clone(),
                domain: route.domain.clone(),
                server_name: route.primary.clone(),
            })
            .await?;

        let message = OutboundMessage {
            from: request.from,
            to: request.to,
            reply_to: request.reply_to,
            subject: content.subject,
            html: content.html,
            text: content.text,
            headers: request.headers,
        };

        match self.router.deliver(&route, &message).await {
            Ok(delivery) => {
                // the message is gone; a failed audit write must not turn into an error
                if let Err(store_err) = self
                    .sends
                    .finish(
                        record.id,
                        SendStatus::Sent,
                        Some(&delivery.remote_message_id),
                        None,
                    )
                    .await
                {
                    error!(
                        send_id = %record.id,
                        remote_id = %delivery.remote_message_id,
                        error = %store_err,
                        "Failed to record delivered send"
                    );
                }

                info!(
                    send_id = %record.id,
                    domain = %route.domain,
                    server = %delivery.server_name,
                    attempts = delivery.attempts,
                    "Message sent"
                );

                Ok(SendResponse {
                    id: record.id,
                    status: SendStatus::Sent,
                    server_name: delivery.server_name,
                    remote_message_id: Some(delivery.remote_message_id),
                })
            }
            Err(e) => {
                let error_text = e.to_string();
                if let Err(store_err) = self
                    .sends
                    .finish(record.id, SendStatus::Failed, None, Some(&error_text))
                    .await
                {
                    warn!("Failed to record send {} failure: {}", record.id, store_err);
                }
                warn!(send_id = %record.id, domain = %route.domain, error = %error_text, "Message send failed");
                Err(e)
            }
        }
    }

    /// Look up a recorded send
    pub async fn get(&self, id: SendId) -> Result<Option<SendRecord>, DispatchError> {
        Ok(self.sends.get(id).await?)
    }
}

fn template_ref(request: &SendRequest) -> Result<Option<TemplateRef>, DispatchError> {
    match (&request.template_id, &request.template_name) {
        (Some(_), Some(_)) => Err(DispatchError::InvalidRequest(
            "template_id and template_name are mutually exclusive".to_string(),
        )),
        (Some(id), None) => Ok(Some(TemplateRef::Id(*id))),
        (None, Some(name)) => Ok(Some(TemplateRef::Name(name.clone()))),
        (None, None) => Ok(None),
    }
}
