//! Template registry and renderer.
//!
//! Templates are Handlebars sources in strict mode, so a reference to a key
//! absent from the context fails with [`RenderError::MissingVariable`] instead
//! of rendering an empty string. Subject and plain-text bodies are rendered
//! without HTML escaping; HTML bodies are escaped.

mod theme;

pub use theme::{BrandTheme, ColorScheme, Logo, TextBlock};

use crate::error::RenderError;
use crate::models::RenderedMessage;
use handlebars::{Handlebars, RenderErrorReason};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Name of the built-in pass-through template (`subject` and `body` keys).
pub const NOTICE_TEMPLATE: &str = "notice";
/// Name of the built-in themed verification code template.
pub const VERIFICATION_TEMPLATE: &str = "monkey_verification";

/// A message template: subject, plain-text body and optional HTML body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTemplate {
    pub id: String,
    pub subject: String,
    pub text_body: String,
    pub html_body: Option<String>,
}

impl MessageTemplate {
    pub fn new(
        id: impl Into<String>,
        subject: impl Into<String>,
        text_body: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            subject: subject.into(),
            text_body: text_body.into(),
            html_body: None,
        }
    }

    pub fn with_html(mut self, html_body: impl Into<String>) -> Self {
        self.html_body = Some(html_body.into());
        self
    }

    /// Template whose bodies are read from disk. A missing or unreadable file
    /// is reported as [`RenderError::InvalidTemplate`].
    pub fn from_files(
        id: impl Into<String>,
        subject: impl Into<String>,
        text_path: impl AsRef<Path>,
        html_path: Option<&Path>,
    ) -> Result<Self, RenderError> {
        let id = id.into();
        let read = |path: &Path| {
            fs::read_to_string(path).map_err(|e| RenderError::InvalidTemplate {
                template: id.clone(),
                details: format!("{}: {e}", path.display()),
            })
        };

        let text_body = read(text_path.as_ref())?;
        let html_body = html_path.map(read).transpose()?;
        Ok(Self {
            id,
            subject: subject.into(),
            text_body,
            html_body,
        })
    }

    fn sources(&self) -> impl Iterator<Item = &str> {
        [
            Some(self.subject.as_str()),
            Some(self.text_body.as_str()),
            self.html_body.as_deref(),
        ]
        .into_iter()
        .flatten()
    }
}

/// Registry of named templates.
pub struct TemplateRegistry {
    plain: Handlebars<'static>,
    html: Handlebars<'static>,
    templates: HashMap<String, MessageTemplate>,
}

impl TemplateRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        let mut plain = Handlebars::new();
        plain.set_strict_mode(true);
        plain.register_escape_fn(handlebars::no_escape);

        let mut html = Handlebars::new();
        html.set_strict_mode(true);

        Self {
            plain,
            html,
            templates: HashMap::new(),
        }
    }

    /// Registry preloaded with the `notice` and `monkey_verification` templates.
    pub fn with_builtins() -> Result<Self, RenderError> {
        let mut registry = Self::new();
        registry.register(MessageTemplate::new(
            NOTICE_TEMPLATE,
            NOTICE_SUBJECT_TEMPLATE,
            NOTICE_TEXT_TEMPLATE,
        ))?;
        registry.register(
            MessageTemplate::new(
                VERIFICATION_TEMPLATE,
                VERIFICATION_SUBJECT_TEMPLATE,
                VERIFICATION_TEXT_TEMPLATE,
            )
            .with_html(VERIFICATION_HTML_TEMPLATE),
        )?;
        Ok(registry)
    }

    /// Compile and register a template, replacing any previous one with the same id.
    pub fn register(&mut self, template: MessageTemplate) -> Result<(), RenderError> {
        let invalid = |e: handlebars::TemplateError| RenderError::InvalidTemplate {
            template: template.id.clone(),
            details: e.to_string(),
        };

        self.plain
            .register_template_string(&subject_key(&template.id), &template.subject)
            .map_err(invalid)?;
        self.plain
            .register_template_string(&text_key(&template.id), &template.text_body)
            .map_err(invalid)?;
        match &template.html_body {
            Some(html) => self
                .html
                .register_template_string(&html_key(&template.id), html)
                .map_err(invalid)?,
            None => self.html.unregister_template(&html_key(&template.id)),
        }

        debug!(template = %template.id, "Registered template");
        self.templates.insert(template.id.clone(), template);
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.templates.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&MessageTemplate> {
        self.templates.get(id)
    }

    /// Whether any part of the template references `variable` in a Handlebars expression.
    pub fn mentions(&self, id: &str, variable: &str) -> bool {
        self.templates
            .get(id)
            .is_some_and(|t| t.sources().any(|src| expression_mentions(src, variable)))
    }

    /// Render the template against `context`. Pure: equal inputs give equal output.
    pub fn render(&self, id: &str, context: &Value) -> Result<RenderedMessage, RenderError> {
        let template = self
            .templates
            .get(id)
            .ok_or_else(|| RenderError::TemplateNotFound(id.to_string()))?;

        let subject = render_with(&self.plain, id, &subject_key(id), context)?;
        let text_body = render_with(&self.plain, id, &text_key(id), context)?;
        let html_body = match template.html_body {
            Some(_) => Some(render_with(&self.html, id, &html_key(id), context)?),
            None => None,
        };

        Ok(RenderedMessage {
            subject: subject.trim().to_string(),
            text_body,
            html_body,
        })
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TemplateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<_> = self.templates.keys().collect();
        ids.sort();
        f.debug_struct("TemplateRegistry").field("templates", &ids).finish()
    }
}

fn subject_key(id: &str) -> String {
    format!("{id}_subject")
}

fn text_key(id: &str) -> String {
    format!("{id}_text")
}

fn html_key(id: &str) -> String {
    format!("{id}_html")
}

fn render_with(
    engine: &Handlebars<'static>,
    template: &str,
    key: &str,
    context: &Value,
) -> Result<String, RenderError> {
    engine.render(key, context).map_err(|e| match e.reason() {
        RenderErrorReason::MissingVariable(path) => RenderError::MissingVariable {
            template: template.to_string(),
            variable: path.clone().unwrap_or_default(),
        },
        _ => RenderError::Render {
            template: template.to_string(),
            details: e.to_string(),
        },
    })
}

fn expression_mentions(source: &str, variable: &str) -> bool {
    let mut rest = source;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            return false;
        };
        let expression = &after[..end];
        let mentioned = expression
            .split(|c: char| {
                c.is_whitespace() || matches!(c, '{' | '}' | '#' | '/' | '~' | '&' | '(' | ')')
            })
            .any(|token| {
                token == variable
                    || token
                        .strip_prefix(variable)
                        .is_some_and(|t| t.starts_with('.'))
            });
        if mentioned {
            return true;
        }
        rest = &after[end..];
    }
    false
}

// ============================================================================
// Built-in templates
// ============================================================================

const NOTICE_SUBJECT_TEMPLATE: &str = "{{subject}}";
const NOTICE_TEXT_TEMPLATE: &str = "{{body}}";

const VERIFICATION_SUBJECT_TEMPLATE: &str = "{{title_text}}";

const VERIFICATION_TEXT_TEMPLATE: &str = r#"{{title_text}}

{{description}}

Your verification code: {{verification_code}}

{{reasons}}

{{footer_text}}
"#;

const VERIFICATION_HTML_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>{{title_text}}</title>
</head>
<body style="margin: 0; padding: 0; background-color: {{secondary_color}}; font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; color: {{text_color}};">
    <table role="presentation" style="width: 100%; border-collapse: collapse;">
        <tr>
            <td style="padding: 40px 0; text-align: center;">
                {{#if logo_url}}<a href="{{logo_link}}"><img src="{{logo_url}}" alt="logo" style="max-height: 64px;"></a>{{/if}}
            </td>
        </tr>
        <tr>
            <td style="padding: 0 24px;">
                <table role="presentation" style="max-width: 600px; margin: 0 auto; background: #ffffff; border-top: 4px solid {{primary_color}}; border-radius: 8px;">
                    <tr>
                        <td style="padding: 32px;">
                            <h1 style="margin: 0 0 16px; color: {{primary_color}};">{{title_text}}</h1>
                            <p style="margin: 0 0 24px; line-height: 1.6;">{{{description_html}}}</p>
                            <p style="margin: 0 0 24px; padding: 16px; text-align: center; font-size: 28px; letter-spacing: 6px; font-weight: bold; background-color: {{tertiary_color}}; border-radius: 6px;">{{verification_code}}</p>
                            <p style="margin: 0; font-size: 13px; line-height: 1.6;">{{{reasons_html}}}</p>
                        </td>
                    </tr>
                </table>
            </td>
        </tr>
        <tr>
            <td style="padding: 24px; text-align: center; font-size: 12px;">{{{footer_html}}}</td>
        </tr>
    </table>
</body>
</html>
"#;
