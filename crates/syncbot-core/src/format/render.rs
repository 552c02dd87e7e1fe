use super::segment::{Segment, TextSegment, detach_edge_whitespace, normalize};
use super::style::{FormatStyle, Markup};
use super::WORD_JOINER;

const MARKDOWN_ESCAPED: &[char] = &['\\', '*', '_', '~', '`', '[', ']'];

/// Renders `segments` for a destination using `style`.
pub fn format_segments(segments: &[Segment], style: &FormatStyle) -> String {
    let segments = detach_edge_whitespace(&normalize(segments.to_vec()));
    let mut pieces: Vec<String> = Vec::new();
    let mut i = 0;
    while i < segments.len() {
        match &segments[i] {
            Segment::LineBreak => {
                pieces.push(style.line_break.clone());
                i += 1;
            }
            Segment::Text(t) => match &t.link_target {
                None => {
                    pieces.push(styled(t, style));
                    i += 1;
                }
                Some(target) => {
                    let start = i;
                    while let Some(Segment::Text(next)) = segments.get(i) {
                        if next.link_target.as_ref() != Some(target) {
                            break;
                        }
                        i += 1;
                    }
                    let group: Vec<&TextSegment> =
                        segments[start..i].iter().filter_map(Segment::as_text).collect();
                    pieces.push(render_link(&group, target, style));
                }
            },
        }
    }
    if style.markup != Markup::Markdown {
        return pieces.concat();
    }
    let mut out = String::new();
    for piece in pieces {
        if needs_joiner(out.chars().last(), piece.chars().next()) {
            out.push(WORD_JOINER);
        }
        out.push_str(&piece);
    }
    out
}

/// An `_` touching a word char does not toggle italics when read back.
fn needs_joiner(left: Option<char>, right: Option<char>) -> bool {
    match (left, right) {
        (Some('_'), Some(r)) => r.is_alphanumeric(),
        (Some(l), Some('_')) => l.is_alphanumeric(),
        _ => false,
    }
}

/// Keeps `http(s)://` in plain text from being read back as a link.
fn break_bare_urls(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find("http") {
        let tail = &rest[pos..];
        out.push_str(&rest[..pos]);
        if tail.starts_with("http://") || tail.starts_with("https://") {
            out.push(WORD_JOINER);
        }
        out.push_str("http");
        rest = &tail[4..];
    }
    out.push_str(rest);
    out
}

/// Escapes markdown delimiters with backslashes.
pub fn escape_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if MARKDOWN_ESCAPED.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Escapes the characters HTML treats specially.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

fn escape(text: &str, style: &FormatStyle) -> String {
    let text = if style.escape_markdown {
        escape_markdown(text)
    } else {
        text.to_string()
    };
    if style.escape_html {
        escape_html(&text)
    } else {
        text
    }
}

fn styled(seg: &TextSegment, style: &FormatStyle) -> String {
    if seg.text.trim().is_empty() {
        return escape(&seg.text, style);
    }
    match style.markup {
        Markup::Text => escape(&seg.text, style),
        Markup::Markdown => {
            if seg.is_code {
                return format!("`{}`", seg.text.replace('`', "'"));
            }
            let mut text = break_bare_urls(&escape(&seg.text, style));
            for (on, marker) in [
                (seg.is_strikethrough, "~"),
                (seg.is_italic, "_"),
                (seg.is_bold, "*"),
            ] {
                if on {
                    text = format!("{marker}{text}{marker}");
                }
            }
            text
        }
        Markup::Html => {
            let mut text = escape(&seg.text, style);
            for (on, tag) in [
                (seg.is_code, "code"),
                (seg.is_strikethrough, "s"),
                (seg.is_italic, "i"),
                (seg.is_bold, "b"),
            ] {
                if on {
                    text = format!("<{tag}>{text}</{tag}>");
                }
            }
            text
        }
    }
}

fn render_link(group: &[&TextSegment], target: &str, style: &FormatStyle) -> String {
    let visible: String = group.iter().map(|t| t.text.as_str()).collect();
    if style.ignore_links_matching_text && links_match(&visible, target) {
        return match style.markup {
            Markup::Html => escape_html(target),
            _ => target.to_string(),
        };
    }
    let inner: String = group.iter().map(|t| styled(t, style)).collect();
    match (style.markup, style.allow_hidden_url) {
        (Markup::Markdown, true) => {
            format!("[{inner}]({})", target.replace(')', "\\)"))
        }
        (Markup::Html, true) => {
            format!("<a href=\"{}\">{inner}</a>", escape_html(target))
        }
        (Markup::Html, false) => {
            let href = escape_html(target);
            format!("{inner} (<a href=\"{href}\">{href}</a>)")
        }
        _ => format!("{inner} ({target})"),
    }
}

fn links_match(text: &str, target: &str) -> bool {
    fn bare(s: &str) -> &str {
        let s = s.trim();
        let s = s
            .strip_prefix("https://")
            .or_else(|| s.strip_prefix("http://"))
            .unwrap_or(s);
        s.trim_end_matches('/')
    }
    bare(text).eq_ignore_ascii_case(bare(target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{parse_html, parse_markdown};

    fn sample() -> Vec<Segment> {
        vec![
            Segment::text("Hello "),
            Segment::Text(TextSegment::plain("world").bold()),
            Segment::text(" and "),
            Segment::Text(TextSegment::plain("more").italic()),
            Segment::LineBreak,
            Segment::Text(TextSegment::plain("site").link("https://x.org/a")),
        ]
    }

    #[test]
    fn markdown_round_trip() {
        let text = format_segments(&sample(), &FormatStyle::markdown());
        assert_eq!(text, "Hello *world* and _more_\n[site](https://x.org/a)");
        assert_eq!(parse_markdown(&text), sample());
    }

    #[test]
    fn html_rendering() {
        let text = format_segments(&sample(), &FormatStyle::html());
        assert_eq!(
            text,
            "Hello <b>world</b> and <i>more</i><br /><a href=\"https://x.org/a\">site</a>"
        );
    }

    #[test]
    fn text_rendering_shows_targets() {
        let text = format_segments(&sample(), &FormatStyle::text());
        assert_eq!(text, "Hello world and more\nsite (https://x.org/a)");
    }

    #[test]
    fn matching_link_text_collapses_to_url() {
        let segs = vec![Segment::Text(
            TextSegment::plain("x.org").link("https://x.org/"),
        )];
        assert_eq!(format_segments(&segs, &FormatStyle::markdown()), "https://x.org/");
    }

    #[test]
    fn bold_whitespace_is_moved_outside_markers() {
        let segs = vec![
            Segment::text("a"),
            Segment::Text(TextSegment::plain(" b ").bold()),
            Segment::text("c"),
        ];
        assert_eq!(format_segments(&segs, &FormatStyle::markdown()), "a *b* c");
    }

    #[test]
    fn markdown_escaping() {
        let segs = vec![Segment::text("2*3 [x]")];
        let text = format_segments(&segs, &FormatStyle::markdown());
        assert_eq!(text, "2\\*3 \\[x\\]");
        assert_eq!(parse_markdown(&text), segs);
    }

    #[test]
    fn styles_inside_words_survive_markdown() {
        let styles: [fn(TextSegment) -> TextSegment; 3] =
            [TextSegment::italic, TextSegment::bold, |t| t.italic().bold()];
        for style in styles {
            for (before, after) in [("a", "c"), ("a", " c"), ("a ", "c"), ("x", "")] {
                let segs = normalize(vec![
                    Segment::text(before),
                    Segment::Text(style(TextSegment::plain("b"))),
                    Segment::text(after),
                ]);
                let text = format_segments(&segs, &FormatStyle::markdown());
                assert_eq!(parse_markdown(&text), segs, "{text:?}");
            }
        }
    }

    #[test]
    fn bare_urls_in_plain_text_stay_plain() {
        let segs = vec![Segment::text("see http://x.org now")];
        for style in [FormatStyle::markdown(), FormatStyle::html()] {
            let text = format_segments(&segs, &style);
            let back = match style.markup {
                Markup::Html => parse_html(&text),
                _ => parse_markdown(&text),
            };
            assert_eq!(back, segs, "{text:?}");
        }
    }
}
