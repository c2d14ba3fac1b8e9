//! Case-insensitive keyword matching over page text.

use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};
use tracing::warn;

/// Multi-keyword substring matcher.
///
/// Keywords and haystacks are lowercased, so matching is case-insensitive
/// for non-ASCII text too. Empty keywords are ignored.
#[derive(Debug, Clone)]
pub struct KeywordMatcher {
    automaton: Option<AhoCorasick>,
    keywords: Vec<String>,
}

impl KeywordMatcher {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut keywords: Vec<String> = keywords
            .into_iter()
            .map(|k| k.as_ref().trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        keywords.dedup();

        let automaton = if keywords.is_empty() {
            None
        } else {
            match AhoCorasickBuilder::new()
                .match_kind(MatchKind::LeftmostFirst)
                .build(&keywords)
            {
                Ok(automaton) => Some(automaton),
                Err(e) => {
                    warn!("Keyword automaton build failed, using linear scan: {}", e);
                    None
                }
            }
        };

        Self { automaton, keywords }
    }

    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keywords.len()
    }

    /// First keyword found in `text`.
    pub fn find(&self, text: &str) -> Option<&str> {
        if self.keywords.is_empty() {
            return None;
        }
        let haystack = text.to_lowercase();
        match &self.automaton {
            Some(automaton) => automaton
                .find(&haystack)
                .map(|m| self.keywords[m.pattern().as_usize()].as_str()),
            None => self
                .keywords
                .iter()
                .find(|k| haystack.contains(k.as_str()))
                .map(String::as_str),
        }
    }

    #[inline]
    pub fn is_match(&self, text: &str) -> bool {
        self.find(text).is_some()
    }
}
