/// One argument produced by [`shell_split`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgToken {
    pub text: String,
    /// The token was quoted or escaped; argument preprocessors skip it.
    pub verbatim: bool,
}

impl ArgToken {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            verbatim: false,
        }
    }
}

/// Simple shell-like argument splitting for plain text.
///
/// Handles:
/// - Whitespace-separated arguments
/// - Quoted strings (single and double quotes)
/// - Backslash escapes, inside double quotes and in bare words
///
/// Unbalanced quotes run to the end of the input.
pub fn shell_split(input: &str) -> Vec<ArgToken> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut verbatim = false;
    let mut started = false;
    let mut in_single_quote = false;
    let mut in_double_quote = false;
    let mut escape_next = false;

    for ch in input.chars() {
        if escape_next {
            current.push(ch);
            escape_next = false;
            continue;
        }

        match ch {
            '\\' if !in_single_quote => {
                escape_next = true;
                verbatim = true;
                started = true;
            }
            '\'' if !in_double_quote => {
                in_single_quote = !in_single_quote;
                verbatim = true;
                started = true;
            }
            '"' if !in_single_quote => {
                in_double_quote = !in_double_quote;
                verbatim = true;
                started = true;
            }
            c if c.is_whitespace() && !in_single_quote && !in_double_quote => {
                if started {
                    args.push(ArgToken {
                        text: std::mem::take(&mut current),
                        verbatim,
                    });
                    verbatim = false;
                    started = false;
                }
            }
            _ => {
                current.push(ch);
                started = true;
            }
        }
    }

    if started {
        args.push(ArgToken {
            text: current,
            verbatim,
        });
    }

    args
}

/// Token texts only.
pub fn split_words(input: &str) -> Vec<String> {
    shell_split(input).into_iter().map(|t| t.text).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_split_simple() {
        assert_eq!(split_words("/bot echo hello world"), vec!["/bot", "echo", "hello", "world"]);
    }

    #[test]
    fn test_shell_split_quoted() {
        let args = shell_split(r#"/bot rename "ops room" test"#);
        assert_eq!(args[2], ArgToken { text: "ops room".into(), verbatim: true });
        assert_eq!(args[3], ArgToken::plain("test"));
    }

    #[test]
    fn test_shell_split_mixed_quotes() {
        assert_eq!(
            split_words(r#"/cmd "double's quote" 'single"s quote'"#),
            vec!["/cmd", "double's quote", r#"single"s quote"#]
        );
    }

    #[test]
    fn test_backslash_marks_verbatim() {
        let args = shell_split(r"tagsuser \@me @me");
        assert_eq!(args[1], ArgToken { text: "@me".into(), verbatim: true });
        assert_eq!(args[2], ArgToken::plain("@me"));
    }

    #[test]
    fn test_empty_quotes_make_an_argument() {
        let args = shell_split(r#"nick """#);
        assert_eq!(args.len(), 2);
        assert_eq!(args[1].text, "");
    }

    #[test]
    fn test_shell_split_whitespace_only() {
        assert!(shell_split("   \t  ").is_empty());
    }
}
