use serde::{Deserialize, Serialize};

/// Target markup family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Markup {
    #[default]
    Markdown,
    Html,
    Text,
}

/// Knobs controlling how segments are emitted for one destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatStyle {
    pub markup: Markup,
    /// Emit native link syntax whose visible text differs from the target.
    /// When off, the target is shown next to the text.
    pub allow_hidden_url: bool,
    /// Render a link whose text equals its target as the bare target.
    pub ignore_links_matching_text: bool,
    pub escape_html: bool,
    pub escape_markdown: bool,
    pub line_break: String,
}

impl FormatStyle {
    pub fn markdown() -> Self {
        Self {
            markup: Markup::Markdown,
            allow_hidden_url: true,
            ignore_links_matching_text: true,
            escape_html: false,
            escape_markdown: true,
            line_break: "\n".to_string(),
        }
    }

    pub fn html() -> Self {
        Self {
            markup: Markup::Html,
            allow_hidden_url: true,
            ignore_links_matching_text: true,
            escape_html: true,
            escape_markdown: false,
            line_break: "<br />".to_string(),
        }
    }

    pub fn text() -> Self {
        Self {
            markup: Markup::Text,
            allow_hidden_url: false,
            ignore_links_matching_text: true,
            escape_html: false,
            escape_markdown: false,
            line_break: "\n".to_string(),
        }
    }

    pub fn with_hidden_urls(mut self, allow: bool) -> Self {
        self.allow_hidden_url = allow;
        self
    }

    pub fn with_line_break(mut self, line_break: impl Into<String>) -> Self {
        self.line_break = line_break.into();
        self
    }
}

impl Default for FormatStyle {
    fn default() -> Self {
        Self::markdown()
    }
}
