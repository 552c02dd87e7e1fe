//! Conversation filter expressions.
//!
//! ```text
//! expr  := and ("or" and)*
//! and   := atom ("and" atom)*
//! atom  := "(" expr ")" | term
//! term  := key ":" value | words        (bare words mean text:<words>)
//! ```
//!
//! Keys: `text`, `id`, `chat_id`, `type`, `minusers`, `maxusers`,
//! `random`, `tag`. Operators are case-insensitive.

use crate::error::{FilterError, FilterResult};

/// The supported term keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermKind {
    Text,
    Id,
    ChatId,
    Type,
    MinUsers,
    MaxUsers,
    Random,
    Tag,
}

impl TermKind {
    fn parse(key: &str) -> Option<Self> {
        Some(match key.to_ascii_lowercase().as_str() {
            "text" => Self::Text,
            "id" => Self::Id,
            "chat_id" => Self::ChatId,
            "type" => Self::Type,
            "minusers" => Self::MinUsers,
            "maxusers" => Self::MaxUsers,
            "random" => Self::Random,
            "tag" => Self::Tag,
            _ => return None,
        })
    }

    fn is_numeric(self) -> bool {
        matches!(self, Self::MinUsers | Self::MaxUsers | Self::Random)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Term(TermKind, String),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Open,
    Close,
    And,
    Or,
    Word(String),
}

fn tokenize(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    let flush = |word: &mut String, tokens: &mut Vec<Token>| {
        if word.is_empty() {
            return;
        }
        let w = std::mem::take(word);
        tokens.push(match w.to_ascii_lowercase().as_str() {
            "and" => Token::And,
            "or" => Token::Or,
            _ => Token::Word(w),
        });
    };
    for ch in input.chars() {
        match ch {
            '(' => {
                flush(&mut word, &mut tokens);
                tokens.push(Token::Open);
            }
            ')' => {
                flush(&mut word, &mut tokens);
                tokens.push(Token::Close);
            }
            c if c.is_whitespace() => flush(&mut word, &mut tokens),
            c => word.push(c),
        }
    }
    flush(&mut word, &mut tokens);
    tokens
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expr(&mut self) -> FilterResult<Filter> {
        let mut parts = vec![self.and()?];
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            parts.push(self.and()?);
        }
        Ok(collapse(parts, Filter::Or))
    }

    fn and(&mut self) -> FilterResult<Filter> {
        let mut parts = vec![self.atom()?];
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            parts.push(self.atom()?);
        }
        Ok(collapse(parts, Filter::And))
    }

    fn atom(&mut self) -> FilterResult<Filter> {
        match self.next() {
            Some(Token::Open) => {
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err(FilterError::Syntax("missing ')'".into())),
                }
            }
            Some(Token::Word(first)) => {
                // Adjacent words form one term: `my room` -> text:"my room".
                let mut words = vec![first];
                while let Some(Token::Word(w)) = self.peek() {
                    words.push(w.clone());
                    self.pos += 1;
                }
                term(&words.join(" "))
            }
            Some(Token::Close) => Err(FilterError::Syntax("unexpected ')'".into())),
            Some(Token::And | Token::Or) => {
                Err(FilterError::Syntax("operator without left operand".into()))
            }
            None => Err(FilterError::Syntax("unexpected end of filter".into())),
        }
    }
}

fn collapse(mut parts: Vec<Filter>, wrap: fn(Vec<Filter>) -> Filter) -> Filter {
    if parts.len() == 1 {
        parts.remove(0)
    } else {
        wrap(parts)
    }
}

fn term(raw: &str) -> FilterResult<Filter> {
    let Some((key, value)) = raw.split_once(':') else {
        return Ok(Filter::Term(TermKind::Text, raw.to_string()));
    };
    let kind = TermKind::parse(key).ok_or_else(|| FilterError::UnknownTerm(key.to_string()))?;
    if kind.is_numeric() && value.trim().parse::<usize>().is_err() {
        return Err(FilterError::InvalidNumber {
            term: key.to_string(),
            value: value.to_string(),
        });
    }
    Ok(Filter::Term(kind, value.trim().to_string()))
}

/// Parses a filter expression.
pub fn parse(input: &str) -> FilterResult<Filter> {
    let mut parser = Parser {
        tokens: tokenize(input),
        pos: 0,
    };
    if parser.tokens.is_empty() {
        return Err(FilterError::Syntax("empty filter".into()));
    }
    let filter = parser.expr()?;
    if parser.pos < parser.tokens.len() {
        return Err(FilterError::Syntax("trailing tokens".into()));
    }
    Ok(filter)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(kind: TermKind, v: &str) -> Filter {
        Filter::Term(kind, v.to_string())
    }

    #[test]
    fn bare_words_are_text() {
        assert_eq!(parse("ops room").unwrap(), t(TermKind::Text, "ops room"));
    }

    #[test]
    fn precedence_and_parentheses() {
        assert_eq!(
            parse("type:GROUP and minusers:3 or id:x").unwrap(),
            Filter::Or(vec![
                Filter::And(vec![t(TermKind::Type, "GROUP"), t(TermKind::MinUsers, "3")]),
                t(TermKind::Id, "x"),
            ])
        );
        assert_eq!(
            parse("type:GROUP AND (tag:ops OR tag:dev)").unwrap(),
            Filter::And(vec![
                t(TermKind::Type, "GROUP"),
                Filter::Or(vec![t(TermKind::Tag, "ops"), t(TermKind::Tag, "dev")]),
            ])
        );
    }

    #[test]
    fn errors() {
        assert_eq!(parse("bogus:1"), Err(FilterError::UnknownTerm("bogus".into())));
        assert!(matches!(parse("maxusers:lots"), Err(FilterError::InvalidNumber { .. })));
        assert!(matches!(parse("(id:x"), Err(FilterError::Syntax(_))));
        assert!(matches!(parse("and id:x"), Err(FilterError::Syntax(_))));
        assert!(matches!(parse(""), Err(FilterError::Syntax(_))));
        assert!(matches!(parse("id:x )"), Err(FilterError::Syntax(_))));
    }
}
