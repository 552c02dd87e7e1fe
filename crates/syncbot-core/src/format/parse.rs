//! Markdown and HTML subsets into [`Segment`] lists.
//!
//! HTML is lowered into the same markup the markdown reader understands.
//! Literal markup characters inside HTML text are percent-escaped on the way
//! in, so the reader can toggle on every delimiter without guessing, and are
//! decoded again once segments are built.

use std::fmt::Write as _;

use super::WORD_JOINER;
use super::segment::{Segment, TextSegment, normalize};

/// Characters that carry meaning in the markdown subset.
const SPECIAL: &[char] = &['\\', '*', '_', '~', '`', '[', ']', '(', ')'];

/// Parses the markdown subset: `*bold*`, `**bold**`, `_italic_`, `~strike~`,
/// `` `code` ``, `[text](url)`, bare `http(s)://` links and backslash escapes.
/// Word joiners are dropped; a URL right after one stays plain text.
pub fn parse_markdown(input: &str) -> Vec<Segment> {
    normalize(Reader::new(input, false).run())
}

/// Parses the HTML subset: `b/strong`, `i/em`, `s/strike/del`, `code/pre`,
/// `a href`, `br` and paragraph breaks. Unknown tags are dropped and only
/// anchors make links.
pub fn parse_html(input: &str) -> Vec<Segment> {
    let markup = html_to_markup(input);
    let segments = Reader::new(&markup, true)
        .run()
        .into_iter()
        .map(|seg| match seg {
            Segment::Text(mut t) => {
                t.text = percent_decode(&t.text);
                t.link_target = t.link_target.map(|l| percent_decode(&l));
                Segment::Text(t)
            }
            other => other,
        })
        .collect();
    normalize(segments)
}

/// Removes markdown backslash escapes.
pub fn unescape_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\'
            && let Some(&next) = chars.peek()
            && SPECIAL.contains(&next)
        {
            out.push(next);
            chars.next();
            continue;
        }
        out.push(c);
    }
    out
}

// ─── Reader ──────────────────────────────────────────────────────────────────

struct Reader {
    chars: Vec<char>,
    /// Every delimiter toggles; used for HTML-derived markup where literal
    /// delimiters were escaped beforehand.
    lenient: bool,
    out: Vec<Segment>,
    buf: String,
    style: TextSegment,
    /// Index of the closing `]` and of the final `)` of the open link.
    link_end: Option<(usize, usize)>,
}

impl Reader {
    fn new(input: &str, lenient: bool) -> Self {
        Self {
            chars: input.chars().filter(|&c| c != '\r').collect(),
            lenient,
            out: Vec::new(),
            buf: String::new(),
            style: TextSegment::default(),
            link_end: None,
        }
    }

    fn flush(&mut self) {
        if !self.buf.is_empty() {
            let mut seg = self.style.clone();
            seg.text = std::mem::take(&mut self.buf);
            self.out.push(Segment::Text(seg));
        }
    }

    fn flag(&mut self, marker: char) -> &mut bool {
        match marker {
            '*' => &mut self.style.is_bold,
            '_' => &mut self.style.is_italic,
            '~' => &mut self.style.is_strikethrough,
            _ => &mut self.style.is_code,
        }
    }

    fn toggle(&mut self, marker: char) {
        self.flush();
        let flag = self.flag(marker);
        *flag = !*flag;
    }

    fn at(&self, i: usize) -> Option<char> {
        self.chars.get(i).copied()
    }

    fn run(mut self) -> Vec<Segment> {
        let n = self.chars.len();
        let mut i = 0;
        while i < n {
            if let Some((close, end)) = self.link_end
                && i == close
            {
                self.flush();
                self.style.link_target = None;
                self.link_end = None;
                i = end + 1;
                continue;
            }

            let c = self.chars[i];
            match c {
                '\\' if self.at(i + 1).is_some_and(|n| SPECIAL.contains(&n)) => {
                    self.buf.push(self.chars[i + 1]);
                    i += 2;
                    continue;
                }
                '\n' => {
                    self.flush();
                    self.out.push(Segment::LineBreak);
                }
                '`' => {
                    if self.style.is_code || self.can_open(i, 1, '`') {
                        self.toggle('`');
                    } else {
                        self.buf.push(c);
                    }
                }
                _ if self.style.is_code && !self.lenient => self.buf.push(c),
                WORD_JOINER if !self.lenient => {}
                '*' | '_' | '~' => {
                    let width = if c == '*' && self.at(i + 1) == Some('*') {
                        2
                    } else {
                        1
                    };
                    let active = *self.flag(c);
                    let accepted = if active {
                        self.can_close(i, width, c)
                    } else {
                        self.can_open(i, width, c)
                    };
                    if accepted {
                        self.toggle(c);
                        i += width;
                        continue;
                    }
                    self.buf.push(c);
                }
                '[' if self.link_end.is_none() => {
                    if let Some((close, end, target)) = self.find_link(i) {
                        self.flush();
                        self.style.link_target = Some(target);
                        self.link_end = Some((close, end));
                    } else {
                        self.buf.push(c);
                    }
                }
                'h' if self.link_end.is_none() && !self.lenient => {
                    if let Some(end) = self.bare_url(i) {
                        self.flush();
                        let url: String = self.chars[i..end].iter().collect();
                        let mut seg = self.style.clone();
                        seg.text = url.clone();
                        seg.link_target = Some(url);
                        self.out.push(Segment::Text(seg));
                        i = end;
                        continue;
                    }
                    self.buf.push(c);
                }
                _ => self.buf.push(c),
            }
            i += 1;
        }
        self.flush();
        self.out
    }

    fn can_open(&self, i: usize, width: usize, marker: char) -> bool {
        if self.lenient {
            return true;
        }
        let Some(next) = self.at(i + width) else {
            return false;
        };
        if next.is_whitespace() || next == marker {
            return false;
        }
        if marker == '_' && i > 0 && self.chars[i - 1].is_alphanumeric() {
            return false;
        }
        let limit = self.link_end.map_or(self.chars.len(), |(close, _)| close);
        let mut j = i + width + 1;
        while j < limit {
            let c = self.chars[j];
            if c == '\n' {
                return false;
            }
            if c == '\\' {
                j += 2;
                continue;
            }
            if c == marker && self.can_close(j, width, marker) {
                return true;
            }
            j += 1;
        }
        false
    }

    fn can_close(&self, i: usize, width: usize, marker: char) -> bool {
        if self.lenient {
            return true;
        }
        if i == 0 || self.chars[i - 1].is_whitespace() {
            return false;
        }
        if marker == '_' && self.at(i + width).is_some_and(char::is_alphanumeric) {
            return false;
        }
        true
    }

    /// Locates `](target)` for a `[` at `start`.
    fn find_link(&self, start: usize) -> Option<(usize, usize, String)> {
        let mut j = start + 1;
        let close = loop {
            match self.at(j)? {
                '\\' => j += 2,
                '\n' if !self.lenient => return None,
                '[' => return None,
                ']' => break j,
                _ => j += 1,
            }
        };
        if close == start + 1 || self.at(close + 1) != Some('(') {
            return None;
        }
        let mut target = String::new();
        let mut k = close + 2;
        loop {
            match self.at(k)? {
                '\\' => {
                    target.push(self.at(k + 1)?);
                    k += 2;
                }
                ')' => break,
                c if c.is_whitespace() && !self.lenient => return None,
                c => {
                    target.push(c);
                    k += 1;
                }
            }
        }
        if target.is_empty() {
            return None;
        }
        Some((close, k, target))
    }

    /// Returns the end index of a bare URL starting at `i`.
    fn bare_url(&self, i: usize) -> Option<usize> {
        if i > 0 {
            let prev = self.chars[i - 1];
            if !(prev.is_whitespace() || prev == '(' || prev == '<') {
                return None;
            }
        }
        let rest: String = self.chars[i..self.chars.len().min(i + 8)].iter().collect();
        let scheme = if rest.starts_with("https://") {
            8
        } else if rest.starts_with("http://") {
            7
        } else {
            return None;
        };
        let mut end = i;
        while end < self.chars.len() && !self.chars[end].is_whitespace() {
            end += 1;
        }
        while end > i + scheme && matches!(self.chars[end - 1], '.' | ',' | ';' | ':' | '!' | '?' | ')' | '>' | '\'' | '"') {
            end -= 1;
        }
        (end > i + scheme).then_some(end)
    }
}

// ─── HTML lowering ───────────────────────────────────────────────────────────

fn html_to_markup(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut links: Vec<Option<String>> = Vec::new();
    let mut rest = input;
    while let Some(lt) = rest.find('<') {
        push_text(&mut out, &rest[..lt]);
        let after = &rest[lt + 1..];
        let Some(gt) = after.find('>') else {
            push_text(&mut out, &rest[lt..]);
            return out;
        };
        apply_tag(&mut out, &mut links, &after[..gt]);
        rest = &after[gt + 1..];
    }
    push_text(&mut out, rest);
    out
}

fn apply_tag(out: &mut String, links: &mut Vec<Option<String>>, tag: &str) {
    let closing = tag.starts_with('/');
    let name = tag
        .trim_start_matches('/')
        .split(|c: char| c.is_whitespace() || c == '/')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    match name.as_str() {
        "b" | "strong" => out.push('*'),
        "i" | "em" => out.push('_'),
        "s" | "strike" | "del" => out.push('~'),
        "code" | "pre" => out.push('`'),
        "br" => out.push('\n'),
        "p" | "div" if closing => out.push('\n'),
        "a" if !closing => {
            let href = attribute(tag, "href");
            if href.is_some() {
                out.push('[');
            }
            links.push(href);
        }
        "a" => {
            if let Some(Some(href)) = links.pop() {
                out.push_str("](");
                out.push_str(&percent_escape(&decode_entities(&href)));
                out.push(')');
            }
        }
        _ => {}
    }
}

fn attribute(tag: &str, name: &str) -> Option<String> {
    let lower = tag.to_ascii_lowercase();
    let pos = lower.find(&format!("{name}="))?;
    let value = &tag[pos + name.len() + 1..];
    let (quote, body) = match value.chars().next()? {
        q @ ('"' | '\'') => (Some(q), &value[1..]),
        _ => (None, value),
    };
    let end = match quote {
        Some(q) => body.find(q)?,
        None => body.find(char::is_whitespace).unwrap_or(body.len()),
    };
    Some(body[..end].to_string())
}

fn push_text(out: &mut String, raw: &str) {
    out.push_str(&percent_escape(&decode_entities(raw)));
}

fn percent_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c == '%' || SPECIAL.contains(&c) {
            let _ = write!(out, "%{:02X}", c as u32);
        } else {
            out.push(c);
        }
    }
    out
}

fn percent_decode(text: &str) -> String {
    urlencoding::decode(text)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| text.to_string())
}

fn decode_entities(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let Some(semi) = tail.find(';').filter(|&s| s <= 10) else {
            out.push('&');
            rest = &tail[1..];
            continue;
        };
        let entity = &tail[1..semi];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            "nbsp" => Some(' '),
            _ => entity
                .strip_prefix("#x")
                .or_else(|| entity.strip_prefix("#X"))
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|d| d.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &tail[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bold(text: &str) -> Segment {
        Segment::Text(TextSegment::plain(text).bold())
    }

    #[test]
    fn markdown_basic_styles() {
        let segs = parse_markdown("hi *there* _you_ ~old~ `x*y`");
        assert_eq!(
            segs,
            vec![
                Segment::text("hi "),
                bold("there"),
                Segment::text(" "),
                Segment::Text(TextSegment::plain("you").italic()),
                Segment::text(" "),
                Segment::Text(TextSegment {
                    text: "old".into(),
                    is_strikethrough: true,
                    ..Default::default()
                }),
                Segment::text(" "),
                Segment::Text(TextSegment {
                    text: "x*y".into(),
                    is_code: true,
                    ..Default::default()
                }),
            ]
        );
    }

    #[test]
    fn markdown_double_star_is_bold() {
        assert_eq!(parse_markdown("**loud**"), vec![bold("loud")]);
    }

    #[test]
    fn markdown_unmatched_markers_are_literal() {
        assert_eq!(parse_markdown("2 * 3 = 6"), vec![Segment::text("2 * 3 = 6")]);
        assert_eq!(parse_markdown("snake_case_name"), vec![Segment::text("snake_case_name")]);
    }

    #[test]
    fn markdown_links_and_bare_urls() {
        let segs = parse_markdown("see [*docs*](https://x.org/a) or https://y.org.");
        assert_eq!(
            segs,
            vec![
                Segment::text("see "),
                Segment::Text(TextSegment::plain("docs").bold().link("https://x.org/a")),
                Segment::text(" or "),
                Segment::Text(TextSegment::plain("https://y.org").link("https://y.org")),
                Segment::text("."),
            ]
        );
    }

    #[test]
    fn markdown_escapes_and_line_breaks() {
        let segs = parse_markdown("a\\*b\r\nc");
        assert_eq!(
            segs,
            vec![Segment::text("a*b"), Segment::LineBreak, Segment::text("c")]
        );
    }

    #[test]
    fn html_subset() {
        let segs = parse_html(
            "<b>bold</b> and <a href=\"https://x.org/?a=1&amp;b=2\">link &amp; more</a><br>a*b_c",
        );
        assert_eq!(
            segs,
            vec![
                bold("bold"),
                Segment::text(" and "),
                Segment::Text(TextSegment::plain("link & more").link("https://x.org/?a=1&b=2")),
                Segment::LineBreak,
                Segment::text("a*b_c"),
            ]
        );
    }

    #[test]
    fn html_line_breaks_inside_links_stay_in_the_link() {
        assert_eq!(
            parse_html("<a href=\"https://x.org\">one<br>two</a>"),
            vec![
                Segment::Text(TextSegment::plain("one").link("https://x.org")),
                Segment::LineBreak,
                Segment::Text(TextSegment::plain("two").link("https://x.org")),
            ]
        );
    }

    #[test]
    fn word_joiners_mark_boundaries() {
        assert_eq!(
            parse_markdown("a\u{2060}_b_\u{2060}c"),
            vec![
                Segment::text("a"),
                Segment::Text(TextSegment::plain("b").italic()),
                Segment::text("c"),
            ]
        );
        assert_eq!(
            parse_markdown("see \u{2060}https://x.org"),
            vec![Segment::text("see https://x.org")]
        );
    }

    #[test]
    fn html_whitespace_inside_tags_keeps_style() {
        let segs = parse_html("x<i> y </i>z");
        assert_eq!(
            segs,
            vec![
                Segment::text("x"),
                Segment::Text(TextSegment::plain(" y ").italic()),
                Segment::text("z"),
            ]
        );
    }

    #[test]
    fn html_percent_literals_survive() {
        assert_eq!(parse_html("100% [sure]"), vec![Segment::text("100% [sure]")]);
    }

    #[test]
    fn entity_decoding() {
        assert_eq!(decode_entities("&lt;&#65;&#x42;&unknown; & x"), "<AB&unknown; & x");
    }

    #[test]
    fn unescape_strips_backslashes() {
        assert_eq!(unescape_markdown("a\\_b\\q"), "a_b\\q");
    }
}
