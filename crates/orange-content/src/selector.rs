//! Selector matching for the document model.
//!
//! Supports comma-separated lists of compound selectors: a tag (or `*`),
//! `.class`, `#id`, `[attr]` and `[attr="value"]`. Combinators and
//! pseudo-classes are rejected.

use crate::dom::{Document, NodeId};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("Empty selector")]
    Empty,

    #[error("Unsupported selector syntax in '{0}'")]
    Unsupported(String),

    #[error("Malformed selector '{0}'")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AttrTest {
    name: String,
    value: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Compound {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    attrs: Vec<AttrTest>,
}

impl Compound {
    fn matches(&self, doc: &Document, node: NodeId) -> bool {
        let Some(tag) = doc.tag(node) else {
            return false;
        };
        if self.tag.as_deref().is_some_and(|t| t != tag) {
            return false;
        }
        if let Some(id) = &self.id {
            if doc.attr(node, "id") != Some(id.as_str()) {
                return false;
            }
        }
        self.classes.iter().all(|c| doc.has_class(node, c))
            && self.attrs.iter().all(|a| match (&a.value, doc.attr(node, &a.name)) {
                (_, None) => false,
                (None, Some(_)) => true,
                (Some(expected), Some(actual)) => expected == actual,
            })
    }
}

/// Parsed selector list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    alternatives: Vec<Compound>,
}

impl Selector {
    pub fn parse(input: &str) -> Result<Self, SelectorError> {
        let alternatives = split_list(input)
            .into_iter()
            .map(|part| parse_compound(part.trim()))
            .collect::<Result<Vec<_>, _>>()?;
        if alternatives.is_empty() {
            return Err(SelectorError::Empty);
        }
        Ok(Self { alternatives })
    }

    /// Matches nothing.
    pub fn never() -> Self {
        Self {
            alternatives: Vec::new(),
        }
    }

    /// Parse each entry, dropping (and returning) the ones that fail.
    pub fn parse_lenient<S: AsRef<str>>(inputs: &[S]) -> (Option<Self>, Vec<SelectorError>) {
        let mut alternatives = Vec::new();
        let mut errors = Vec::new();
        for input in inputs {
            match Self::parse(input.as_ref()) {
                Ok(selector) => alternatives.extend(selector.alternatives),
                Err(e) => errors.push(e),
            }
        }
        let selector = (!alternatives.is_empty()).then_some(Self { alternatives });
        (selector, errors)
    }

    /// Matches what either selector matches.
    pub fn union(&self, other: &Selector) -> Selector {
        let mut alternatives = self.alternatives.clone();
        alternatives.extend(other.alternatives.iter().cloned());
        Self { alternatives }
    }

    pub fn matches(&self, doc: &Document, node: NodeId) -> bool {
        self.alternatives.iter().any(|c| c.matches(doc, node))
    }

    /// Matching descendants of `scope` in document order.
    pub fn query_all(&self, doc: &Document, scope: NodeId) -> Vec<NodeId> {
        doc.descendants(scope)
            .into_iter()
            .filter(|&n| self.matches(doc, n))
            .collect()
    }

    /// First matching descendant of `scope`.
    pub fn query(&self, doc: &Document, scope: NodeId) -> Option<NodeId> {
        doc.descendants(scope).into_iter().find(|&n| self.matches(doc, n))
    }

    /// `node` itself or its nearest matching ancestor.
    pub fn closest(&self, doc: &Document, node: NodeId) -> Option<NodeId> {
        std::iter::once(node)
            .chain(doc.ancestors(node))
            .find(|&n| self.matches(doc, n))
    }
}

/// Split on commas outside of brackets and quotes.
fn split_list(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut depth = 0usize;
    let mut quote: Option<char> = None;

    for (i, c) in input.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '[') => depth += 1,
            (None, ']') => depth = depth.saturating_sub(1),
            (None, ',') if depth == 0 => {
                parts.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

fn parse_compound(input: &str) -> Result<Compound, SelectorError> {
    if input.is_empty() {
        return Err(SelectorError::Empty);
    }
    let chars: Vec<char> = input.chars().collect();
    let malformed = || SelectorError::Malformed(input.to_string());
    let mut compound = Compound::default();
    let mut i = 0;

    let read_ident = |i: &mut usize| -> String {
        let start = *i;
        while *i < chars.len() && is_ident_char(chars[*i]) {
            *i += 1;
        }
        chars[start..*i].iter().collect()
    };

    if chars[0] == '*' {
        i = 1;
    } else if chars[0].is_ascii_alphabetic() {
        compound.tag = Some(read_ident(&mut i).to_ascii_lowercase());
    }

    while i < chars.len() {
        match chars[i] {
            '.' | '#' => {
                let sigil = chars[i];
                i += 1;
                let ident = read_ident(&mut i);
                if ident.is_empty() {
                    return Err(malformed());
                }
                if sigil == '.' {
                    compound.classes.push(ident);
                } else {
                    compound.id = Some(ident);
                }
            }
            '[' => {
                i += 1;
                let name = read_ident(&mut i);
                if name.is_empty() || i >= chars.len() {
                    return Err(malformed());
                }
                let value = match chars[i] {
                    ']' => None,
                    '=' => {
                        i += 1;
                        let value = match chars.get(i) {
                            Some(&q @ ('"' | '\'')) => {
                                i += 1;
                                let start = i;
                                while i < chars.len() && chars[i] != q {
                                    i += 1;
                                }
                                if i >= chars.len() {
                                    return Err(malformed());
                                }
                                let value: String = chars[start..i].iter().collect();
                                i += 1;
                                value
                            }
                            _ => read_ident(&mut i),
                        };
                        Some(value)
                    }
                    // ~=, ^=, *= and friends
                    _ => return Err(SelectorError::Unsupported(input.to_string())),
                };
                if chars.get(i) != Some(&']') {
                    return Err(malformed());
                }
                i += 1;
                compound.attrs.push(AttrTest { name, value });
            }
            ' ' | '>' | '+' | '~' | ':' => return Err(SelectorError::Unsupported(input.to_string())),
            _ => return Err(malformed()),
        }
    }

    Ok(compound)
}
