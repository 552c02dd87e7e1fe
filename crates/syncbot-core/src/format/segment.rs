use serde::{Deserialize, Serialize};

/// A run of text sharing one set of formatting attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextSegment {
    pub text: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_bold: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_italic: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_strikethrough: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_code: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
}

impl TextSegment {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn bold(mut self) -> Self {
        self.is_bold = true;
        self
    }

    pub fn italic(mut self) -> Self {
        self.is_italic = true;
        self
    }

    pub fn link(mut self, target: impl Into<String>) -> Self {
        self.link_target = Some(target.into());
        self
    }

    /// Whether `other` carries exactly the same formatting.
    pub fn same_style(&self, other: &Self) -> bool {
        self.is_bold == other.is_bold
            && self.is_italic == other.is_italic
            && self.is_strikethrough == other.is_strikethrough
            && self.is_code == other.is_code
            && self.link_target == other.link_target
    }

    fn is_styled(&self) -> bool {
        self.is_bold || self.is_italic || self.is_strikethrough || self.is_code
    }
}

/// Platform-neutral unit of formatted text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Segment {
    LineBreak,
    Text(TextSegment),
}

impl Segment {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(TextSegment::plain(text))
    }

    pub fn as_text(&self) -> Option<&TextSegment> {
        match self {
            Self::Text(seg) => Some(seg),
            Self::LineBreak => None,
        }
    }
}

impl From<TextSegment> for Segment {
    fn from(seg: TextSegment) -> Self {
        Self::Text(seg)
    }
}

/// Concatenates the visible text of `segments`, ignoring formatting.
pub fn plain_text(segments: &[Segment]) -> String {
    let mut out = String::new();
    for seg in segments {
        match seg {
            Segment::LineBreak => out.push('\n'),
            Segment::Text(t) => out.push_str(&t.text),
        }
    }
    out
}

/// Merges adjacent text segments with identical formatting and drops empty ones.
pub fn normalize(segments: Vec<Segment>) -> Vec<Segment> {
    let mut out: Vec<Segment> = Vec::with_capacity(segments.len());
    for seg in segments {
        match seg {
            Segment::Text(t) if t.text.is_empty() => {}
            Segment::Text(t) => {
                if let Some(Segment::Text(prev)) = out.last_mut()
                    && prev.same_style(&t)
                {
                    prev.text.push_str(&t.text);
                    continue;
                }
                out.push(Segment::Text(t));
            }
            Segment::LineBreak => out.push(Segment::LineBreak),
        }
    }
    out
}

/// Splits formatting off whitespace at the edges of styled segments.
///
/// Markup delimiters must hug non-whitespace text, so `"*hi *"` style output
/// would not parse back. The whitespace is moved into plain neighbours.
pub(crate) fn detach_edge_whitespace(segments: &[Segment]) -> Vec<Segment> {
    let mut out = Vec::with_capacity(segments.len());
    for seg in segments {
        let Segment::Text(t) = seg else {
            out.push(seg.clone());
            continue;
        };
        if !t.is_styled() || t.text.trim().is_empty() {
            out.push(seg.clone());
            continue;
        }
        let trimmed_start = t.text.trim_start();
        let lead = &t.text[..t.text.len() - trimmed_start.len()];
        let core = trimmed_start.trim_end();
        let tail = &trimmed_start[core.len()..];

        let unstyled = |text: &str| {
            Segment::Text(TextSegment {
                text: text.to_string(),
                link_target: t.link_target.clone(),
                ..Default::default()
            })
        };
        if !lead.is_empty() {
            out.push(unstyled(lead));
        }
        out.push(Segment::Text(TextSegment {
            text: core.to_string(),
            ..t.clone()
        }));
        if !tail.is_empty() {
            out.push(unstyled(tail));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_merges_same_style() {
        let merged = normalize(vec![
            Segment::Text(TextSegment::plain("a").bold()),
            Segment::Text(TextSegment::plain("b").bold()),
            Segment::text(""),
            Segment::text("c"),
        ]);
        assert_eq!(
            merged,
            vec![
                Segment::Text(TextSegment::plain("ab").bold()),
                Segment::text("c")
            ]
        );
    }

    #[test]
    fn detach_moves_whitespace_out_of_bold() {
        let segs = detach_edge_whitespace(&[Segment::Text(TextSegment::plain(" hi ").bold())]);
        assert_eq!(
            segs,
            vec![
                Segment::text(" "),
                Segment::Text(TextSegment::plain("hi").bold()),
                Segment::text(" "),
            ]
        );
    }

    #[test]
    fn plain_text_renders_breaks() {
        let segs = vec![Segment::text("a"), Segment::LineBreak, Segment::text("b")];
        assert_eq!(plain_text(&segs), "a\nb");
    }
}
