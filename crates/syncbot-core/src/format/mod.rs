//! Platform-neutral rich text.
//!
//! Every inbound message body is normalized into a list of [`Segment`]s and
//! rendered per destination with a [`FormatStyle`]:
//!
//! ```text
//! markdown ─┐                       ┌─► markdown
//!           ├─► Vec<Segment> ──────►├─► html
//! html ─────┘                       └─► plain text
//! ```
//!
//! For any style that allows hidden URLs, rendering to markdown and parsing
//! back yields the same segments for non-whitespace text runs.
//!
//! Markdown output may carry U+2060 WORD JOINER where a marker touches a
//! word or where plain text holds a bare URL. The markdown reader treats it
//! as a boundary and drops it.

mod parse;
mod render;
mod segment;
mod style;

pub use parse::{parse_html, parse_markdown, unescape_markdown};
pub use render::{escape_html, escape_markdown, format_segments};
pub use segment::{Segment, TextSegment, normalize, plain_text};
pub use style::{FormatStyle, Markup};

/// Invisible separator between markup and the text around it.
const WORD_JOINER: char = '\u{2060}';

/// Parses `input` according to its markup family.
pub fn parse(input: &str, markup: Markup) -> Vec<Segment> {
    match markup {
        Markup::Markdown => parse_markdown(input),
        Markup::Html => parse_html(input),
        Markup::Text => normalize(
            input
                .split('\n')
                .enumerate()
                .flat_map(|(i, line)| {
                    let brk = (i > 0).then_some(Segment::LineBreak);
                    brk.into_iter().chain(std::iter::once(Segment::text(line)))
                })
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_taken_literally() {
        assert_eq!(
            parse("*not bold*\nnext", Markup::Text),
            vec![
                Segment::text("*not bold*"),
                Segment::LineBreak,
                Segment::text("next")
            ]
        );
    }
}
