//! Per-channel pattern matching.
//!
//! A `PatternMatcher` wraps one compiled regex plus its matching options.
//! Exclusion sub-patterns are evaluated first: a line hitting any exclusion
//! is never a match, regardless of the primary pattern. Inverted mode flips
//! the final verdict after exclusions. The only mutable state is a running
//! match counter, shared safely across reader threads.

use std::sync::atomic::{AtomicU64, Ordering};

use regex::{Regex, RegexBuilder};
use thiserror::Error;

/// Matching options fixed at construction time.
#[derive(Debug, Clone, Default)]
pub struct MatchOptions {
    /// Compile patterns case-insensitively.
    pub ignore_case: bool,
    /// A line that does *not* match the primary pattern counts as a match.
    pub invert: bool,
    /// Stop counting (but not flow) once this many matches were seen.
    /// Advisory to reporting only.
    pub max_count: Option<u64>,
}

#[derive(Debug, Error)]
pub enum PatternError {
    #[error("invalid pattern {pattern:?}: {source}")]
    Invalid {
        pattern: String,
        source: regex::Error,
    },
    #[error("invalid exclusion {pattern:?}: {source}")]
    InvalidExclusion {
        pattern: String,
        source: regex::Error,
    },
}

/// Verdict for one line.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Byte span of the matched sub-string. `None` for inverted matches,
    /// which have no meaningful span.
    pub span: Option<(usize, usize)>,
}

/// One compiled pattern plus options. Stateless apart from the counter.
pub struct PatternMatcher {
    pattern: Regex,
    exclusions: Vec<Regex>,
    options: MatchOptions,
    hits: AtomicU64,
}

impl PatternMatcher {
    pub fn new(
        pattern: &str,
        exclusions: &[String],
        options: MatchOptions,
    ) -> Result<Self, PatternError> {
        let compile = |p: &str| {
            RegexBuilder::new(p)
                .case_insensitive(options.ignore_case)
                .build()
        };

        let primary = compile(pattern).map_err(|source| PatternError::Invalid {
            pattern: pattern.to_string(),
            source,
        })?;

        let mut excl = Vec::with_capacity(exclusions.len());
        for p in exclusions {
            excl.push(
                compile(p).map_err(|source| PatternError::InvalidExclusion {
                    pattern: p.clone(),
                    source,
                })?,
            );
        }

        Ok(Self {
            pattern: primary,
            exclusions: excl,
            options,
            hits: AtomicU64::new(0),
        })
    }

    /// The pattern source, for reporting.
    pub fn pattern_str(&self) -> &str {
        self.pattern.as_str()
    }

    /// Scan one line. Increments the match counter on a hit.
    pub fn check(&self, line: &str) -> MatchResult {
        if self.exclusions.iter().any(|e| e.is_match(line)) {
            return MatchResult {
                matched: false,
                span: None,
            };
        }

        let found = self.pattern.find(line);
        let matched = if self.options.invert {
            found.is_none()
        } else {
            found.is_some()
        };

        if matched {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }

        MatchResult {
            matched,
            span: if self.options.invert {
                None
            } else {
                found.map(|m| (m.start(), m.end()))
            },
        }
    }

    /// Total matches seen, clamped to `max_count` when one is configured.
    pub fn match_count(&self) -> u64 {
        let raw = self.hits.load(Ordering::Relaxed);
        match self.options.max_count {
            Some(cap) => raw.min(cap),
            None => raw,
        }
    }
}
