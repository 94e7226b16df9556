//! Content resolver - turns raw fields or a template reference into a message body

use crate::error::DispatchError;
use regex::{Captures, Regex};
use relaymail_common::types::TemplateId;
use relaymail_storage::{
    Campaign, CampaignVariant, Template, TemplateRepository, VariableRepository,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{([^{}]*)\}\}").expect("valid placeholder pattern")
});

/// Reference to a stored template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateRef {
    Id(TemplateId),
    Name(String),
}

impl std::fmt::Display for TemplateRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TemplateRef::Id(id) => write!(f, "{}", id),
            TemplateRef::Name(name) => write!(f, "{}", name),
        }
    }
}

/// Where a message's content comes from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentSource {
    pub template: Option<TemplateRef>,
    pub subject: Option<String>,
    pub html: Option<String>,
    pub text: Option<String>,
}

impl ContentSource {
    /// Content for one campaign item: the variant's content when it carries
    /// any, otherwise the campaign's own
    pub fn for_campaign(campaign: &Campaign, variant: Option<&CampaignVariant>) -> Self {
        if let Some(v) = variant {
            let has_content = v.template_id.is_some()
                || v.subject.is_some()
                || v.html_body.is_some()
                || v.text_body.is_some();
            if has_content {
                return Self {
                    template: v.template_id.map(TemplateRef::Id),
                    subject: v.subject.clone(),
                    html: v.html_body.clone(),
                    text: v.text_body.clone(),
                };
            }
        }

        Self {
            template: campaign.template_id.map(TemplateRef::Id),
            subject: campaign.subject.clone(),
            html: campaign.html_body.clone(),
            text: campaign.text_body.clone(),
        }
    }
}

/// Variables and recipient data available while rendering
#[derive(Debug, Clone, Default)]
pub struct RenderContext {
    /// Global variables; fetched from storage when `None`
    pub global: Option<HashMap<String, String>>,
    pub campaign: HashMap<String, String>,
    pub recipient: HashMap<String, String>,
    pub recipient_email: Option<String>,
    pub recipient_name: Option<String>,
}

/// A rendered subject/HTML/text triple
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedContent {
    pub subject: String,
    pub html: Option<String>,
    pub text: Option<String>,
}

/// Content resolver
pub struct ContentResolver {
    templates: Arc<dyn TemplateRepository>,
    variables: Arc<dyn VariableRepository>,
}

impl ContentResolver {
    /// Create a new content resolver
    pub fn new(
        templates: Arc<dyn TemplateRepository>,
        variables: Arc<dyn VariableRepository>,
    ) -> Self {
        Self {
            templates,
            variables,
        }
    }

    /// Global variables, for callers rendering many messages with one context
    pub async fn global_variables(&self) -> Result<HashMap<String, String>, DispatchError> {
        Ok(self.variables.all().await?)
    }

    /// Resolve a content source into concrete content
    pub async fn resolve(
        &self,
        source: &ContentSource,
        ctx: &RenderContext,
    ) -> Result<RenderedContent, DispatchError> {
        let Some(reference) = &source.template else {
            return raw_content(source);
        };

        let template = self.find_template(reference).await?;

        let fetched;
        let global = match &ctx.global {
            Some(global) => global,
            None => {
                fetched = self.variables.all().await?;
                &fetched
            }
        };

        let mut vars = merge_variables(global, &ctx.campaign, &ctx.recipient);
        inject_builtins(&mut vars, ctx);

        Ok(RenderedContent {
            subject: render_template(&template.subject, &vars),
            html: template.html_body.as_deref().map(|h| render_template(h, &vars)),
            text: template.text_body.as_deref().map(|t| render_template(t, &vars)),
        })
    }

    async fn find_template(&self, reference: &TemplateRef) -> Result<Template, DispatchError> {
        let found = match reference {
            TemplateRef::Id(id) => self.templates.get(*id).await?,
            TemplateRef::Name(name) => self.templates.get_by_name(name).await?,
        };
        found.ok_or_else(|| DispatchError::TemplateNotFound(reference.to_string()))
    }
}

fn raw_content(source: &ContentSource) -> Result<RenderedContent, DispatchError> {
    let present = |field: &Option<String>| field.as_deref().map_or(false, |s| !s.is_empty());
    if !present(&source.subject) && !present(&source.html) && !present(&source.text) {
        return Err(DispatchError::InvalidRequest(
            "subject, html or text is required when no template is given".to_string(),
        ));
    }

    Ok(RenderedContent {
        subject: source.subject.clone().unwrap_or_default(),
        html: source.html.clone(),
        text: source.text.clone(),
    })
}

/// Merge variable maps; later maps overwrite earlier ones on key collision
pub fn merge_variables(
    global: &HashMap<String, String>,
    campaign: &HashMap<String, String>,
    recipient: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut merged = global.clone();
    for layer in [campaign, recipient] {
        merged.extend(layer.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    merged
}

fn inject_builtins(vars: &mut HashMap<String, String>, ctx: &RenderContext) {
    if let Some(email) = &ctx.recipient_email {
        vars.insert("email".to_string(), email.clone());
        vars.insert("recipient_email".to_string(), email.clone());
    }
    if let Some(name) = &ctx.recipient_name {
        vars.insert("name".to_string(), name.clone());
        vars.insert("recipient_name".to_string(), name.clone());
    }
}

/// Substitute `{{ key }}` placeholders in one pass.
///
/// Keys are trimmed. Unknown keys are left exactly as written, and
/// substituted values are never scanned again.
pub fn render_template(template: &str, vars: &HashMap<String, String>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| match vars.get(caps[1].trim()) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}
