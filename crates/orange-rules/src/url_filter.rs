//! URL filter patterns.
//!
//! Supported syntax:
//! - `||example.com^` domain anchor: host or any subdomain, any scheme
//! - `|https://` / `foo|` left and right anchors
//! - `*` any run of characters
//! - `^` separator: anything but a letter, digit or `_ - . %`, or end of URL

use url::{Position, Url};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Wildcard,
    Separator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartAnchor {
    None,
    Left,
    Domain,
}

/// A compiled `urlFilter`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlFilter {
    raw: String,
    start: StartAnchor,
    anchor_end: bool,
    tokens: Vec<Token>,
    case_sensitive: bool,
}

impl UrlFilter {
    /// Compile a filter. Returns `None` for an empty or anchor-only pattern.
    pub fn parse(raw: &str, case_sensitive: bool) -> Option<Self> {
        let mut body = raw;
        let start = if let Some(rest) = body.strip_prefix("||") {
            body = rest;
            StartAnchor::Domain
        } else if let Some(rest) = body.strip_prefix('|') {
            body = rest;
            StartAnchor::Left
        } else {
            StartAnchor::None
        };

        let anchor_end = match body.strip_suffix('|') {
            Some(rest) => {
                body = rest;
                true
            }
            None => false,
        };

        let body = if case_sensitive {
            body.to_string()
        } else {
            body.to_lowercase()
        };

        let mut tokens = Vec::new();
        let mut literal = String::new();
        for c in body.chars() {
            match c {
                '*' | '^' => {
                    if !literal.is_empty() {
                        tokens.push(Token::Literal(std::mem::take(&mut literal)));
                    }
                    let token = if c == '*' { Token::Wildcard } else { Token::Separator };
                    // Consecutive wildcards collapse
                    if !(token == Token::Wildcard && tokens.last() == Some(&Token::Wildcard)) {
                        tokens.push(token);
                    }
                }
                _ => literal.push(c),
            }
        }
        if !literal.is_empty() {
            tokens.push(Token::Literal(literal));
        }

        let has_literal = tokens.iter().any(|t| matches!(t, Token::Literal(_)));
        if !has_literal {
            return None;
        }
        if start == StartAnchor::Domain && !matches!(tokens.first(), Some(Token::Literal(_))) {
            return None;
        }

        Some(Self {
            raw: raw.to_string(),
            start,
            anchor_end,
            tokens,
            case_sensitive,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Check a URL against this filter.
    pub fn matches(&self, url: &str) -> bool {
        let parsed = Url::parse(url).ok();
        let text = match &parsed {
            Some(u) => u.as_str(),
            None => url,
        };
        let text = if self.case_sensitive {
            text.to_string()
        } else {
            text.to_lowercase()
        };
        let bytes = text.as_bytes();

        match self.start {
            StartAnchor::Left => self.match_from(bytes, 0),
            StartAnchor::None => (0..=bytes.len()).any(|pos| self.match_from(bytes, pos)),
            StartAnchor::Domain => {
                let Some(parsed) = parsed.as_ref() else {
                    return false;
                };
                let host_start = parsed[..Position::BeforeHost].len();
                let host_end = parsed[..Position::AfterHost].len();
                if host_start >= host_end {
                    return false;
                }
                // Label boundaries within the host
                std::iter::once(host_start)
                    .chain(
                        (host_start..host_end)
                            .filter(|&i| bytes[i] == b'.')
                            .map(|i| i + 1),
                    )
                    .any(|pos| self.match_from(bytes, pos))
            }
        }
    }

    fn match_from(&self, text: &[u8], pos: usize) -> bool {
        match_tokens(&self.tokens, text, pos, self.anchor_end)
    }
}

fn is_separator(b: u8) -> bool {
    !(b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b'%'))
}

fn match_tokens(tokens: &[Token], text: &[u8], pos: usize, anchor_end: bool) -> bool {
    match tokens.split_first() {
        None => !anchor_end || pos == text.len(),
        Some((Token::Literal(lit), rest)) => {
            let lit = lit.as_bytes();
            text.len() >= pos + lit.len()
                && &text[pos..pos + lit.len()] == lit
                && match_tokens(rest, text, pos + lit.len(), anchor_end)
        }
        Some((Token::Separator, rest)) => {
            if pos == text.len() {
                match_tokens(rest, text, pos, anchor_end)
            } else {
                is_separator(text[pos]) && match_tokens(rest, text, pos + 1, anchor_end)
            }
        }
        Some((Token::Wildcard, rest)) => {
            (pos..=text.len()).any(|p| match_tokens(rest, text, p, anchor_end))
        }
    }
}
