//! Brand theme for the built-in verification template.

use crate::models::{ContextValue, NotificationRequest};
use std::collections::BTreeMap;

/// Colours used by themed templates. Missing `#` prefixes are added.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColorScheme {
    pub primary: String,
    pub secondary: String,
    pub tertiary: Option<String>,
    pub text: Option<String>,
}

impl ColorScheme {
    pub fn new(primary: impl AsRef<str>, secondary: impl AsRef<str>) -> Self {
        Self {
            primary: hex(primary.as_ref()),
            secondary: hex(secondary.as_ref()),
            tertiary: None,
            text: None,
        }
    }

    pub fn with_tertiary(mut self, color: impl AsRef<str>) -> Self {
        self.tertiary = Some(hex(color.as_ref()));
        self
    }

    pub fn with_text(mut self, color: impl AsRef<str>) -> Self {
        self.text = Some(hex(color.as_ref()));
        self
    }
}

impl Default for ColorScheme {
    fn default() -> Self {
        Self::new("#2D6CDF", "#F4F6FB")
    }
}

fn hex(color: &str) -> String {
    let color = color.trim();
    if color.starts_with('#') {
        color.to_string()
    } else {
        format!("#{color}")
    }
}

/// Logo image and the link it points to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Logo {
    pub link: String,
    pub url: String,
}

/// Free text blocks. Newlines become `<br>` in HTML output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextBlock {
    pub title: String,
    pub description: String,
    pub footer: String,
    pub reasons: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrandTheme {
    pub colors: ColorScheme,
    pub logo: Option<Logo>,
    pub text: TextBlock,
}

impl BrandTheme {
    pub fn new(colors: ColorScheme) -> Self {
        Self {
            colors,
            logo: None,
            text: TextBlock {
                title: "Verify your email".to_string(),
                ..TextBlock::default()
            },
        }
    }

    pub fn with_logo(mut self, link: impl Into<String>, url: impl Into<String>) -> Self {
        self.logo = Some(Logo {
            link: link.into(),
            url: url.into(),
        });
        self
    }

    pub fn with_text(mut self, text: TextBlock) -> Self {
        self.text = text;
        self
    }

    /// Template variables for this theme. Every key is always present.
    pub fn context(&self) -> BTreeMap<String, ContextValue> {
        let text_color = self.colors.text.clone().unwrap_or_else(|| "#1F2933".to_string());
        let tertiary = self
            .colors
            .tertiary
            .clone()
            .unwrap_or_else(|| self.colors.secondary.clone());
        let (logo_link, logo_url) = self
            .logo
            .as_ref()
            .map(|l| (l.link.clone(), l.url.clone()))
            .unwrap_or_default();

        let pairs = [
            ("primary_color", self.colors.primary.clone()),
            ("secondary_color", self.colors.secondary.clone()),
            ("tertiary_color", tertiary),
            ("text_color", text_color),
            ("logo_link", logo_link),
            ("logo_url", logo_url),
            ("title_text", self.text.title.clone()),
            ("description", self.text.description.clone()),
            ("description_html", html_lines(&self.text.description)),
            ("footer_text", self.text.footer.clone()),
            ("footer_html", html_lines(&self.text.footer)),
            ("reasons", self.text.reasons.clone()),
            ("reasons_html", html_lines(&self.text.reasons)),
        ];

        pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), ContextValue::Text(v)))
            .collect()
    }

    /// Merge the theme variables into a request. Keys the caller already set win.
    pub fn apply(&self, mut request: NotificationRequest) -> NotificationRequest {
        for (key, value) in self.context() {
            request.context.entry(key).or_insert(value);
        }
        request
    }
}

impl Default for BrandTheme {
    fn default() -> Self {
        Self::new(ColorScheme::default())
    }
}

fn html_lines(text: &str) -> String {
    handlebars::html_escape(text).replace('\n', "<br>")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_colors_get_hash_prefix() {
        let colors = ColorScheme::new("ff0000", "#00ff00").with_tertiary(" 0000ff ");
        assert_eq!(colors.primary, "#ff0000");
        assert_eq!(colors.secondary, "#00ff00");
        assert_eq!(colors.tertiary.as_deref(), Some("#0000ff"));
    }

    #[test]
    fn test_context_has_every_key() {
        let context = BrandTheme::default().context();
        for key in [
            "primary_color",
            "secondary_color",
            "tertiary_color",
            "text_color",
            "logo_link",
            "logo_url",
            "title_text",
            "description",
            "footer_text",
            "reasons",
        ] {
            assert!(context.contains_key(key), "missing {key}");
        }
    }

    #[test]
    fn test_html_text_is_escaped_before_line_breaks() {
        let theme = BrandTheme::default().with_text(TextBlock {
            description: "a < b\nsecond line".into(),
            ..TextBlock::default()
        });

        let context = theme.context();

        assert_eq!(
            context["description_html"],
            ContextValue::Text("a &lt; b<br>second line".into())
        );
        assert_eq!(context["description"], ContextValue::Text("a < b\nsecond line".into()));
    }

    #[test]
    fn test_apply_keeps_caller_values() {
        let request = NotificationRequest::new("monkey_verification", ["a@x.io"])
            .with_var("title_text", "Custom");

        let request = BrandTheme::default()
            .with_logo("https://x.io", "https://x.io/l.png")
            .apply(request);

        assert_eq!(request.context["title_text"], ContextValue::Text("Custom".into()));
        assert_eq!(request.context["logo_url"], ContextValue::Text("https://x.io/l.png".into()));
    }
}
