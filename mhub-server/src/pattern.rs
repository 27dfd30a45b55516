//! Shell-glob topic matching (§4.1 of the broker design: "Match").
//!
//! A pattern is a `/`-delimited sequence of segments. `*` matches any run of
//! characters within a single segment; a segment that is exactly `**` matches
//! zero or more whole segments. The empty pattern string matches every topic.
//!
//! Grounded on the teacher's `nats_pattern.rs` (compile-once enum, validate at
//! construction, `matches`/`as_str`), reworked from dot-separated NATS tokens
//! (`*` = one token, `>` = trailing tokens only) to slash-separated shell globs
//! (`*` = within a segment, `**` = across segments, usable anywhere).

use mhub_core::error::PatternError;
use mhub_core::types::PatternSpec;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Glob(String),
    DoubleStar,
}

/// A single compiled glob pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl CompiledPattern {
    /// Compiles a raw pattern string. The empty string is accepted and
    /// compiles to a segment list that `Matcher` treats as match-all.
    pub fn compile(raw: &str) -> Result<Self, PatternError> {
        let mut segments = Vec::new();
        if !raw.is_empty() {
            for part in raw.split('/') {
                if part == "**" {
                    segments.push(Segment::DoubleStar);
                } else if part.contains("**") {
                    return Err(PatternError::InvalidSpec(format!(
                        "'**' cannot be combined with other text in a segment: {part:?}"
                    )));
                } else if part.contains('*') {
                    segments.push(Segment::Glob(part.to_string()));
                } else {
                    segments.push(Segment::Literal(part.to_string()));
                }
            }
        }
        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, topic: &str) -> bool {
        if self.raw.is_empty() {
            return true;
        }
        let parts: Vec<&str> = topic.split('/').collect();
        match_segments(&self.segments, &parts)
    }
}

fn match_segments(pattern: &[Segment], topic: &[&str]) -> bool {
    match pattern.split_first() {
        None => topic.is_empty(),
        Some((Segment::DoubleStar, rest)) => {
            if match_segments(rest, topic) {
                return true;
            }
            !topic.is_empty() && match_segments(pattern, &topic[1..])
        }
        Some((seg, rest)) => match topic.split_first() {
            None => false,
            Some((head, tail)) => segment_matches(seg, head) && match_segments(rest, tail),
        },
    }
}

fn segment_matches(segment: &Segment, value: &str) -> bool {
    match segment {
        Segment::Literal(lit) => lit == value,
        Segment::Glob(glob) => glob_match(glob, value),
        Segment::DoubleStar => unreachable!("DoubleStar handled by match_segments"),
    }
}

/// Matches a single segment against `*`-glob syntax: `*` stands for any run
/// of characters (possibly empty) within the segment.
fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }

    let mut rest = text;
    for (i, part) in parts.iter().enumerate() {
        if i == 0 {
            if !rest.starts_with(part) {
                return false;
            }
            rest = &rest[part.len()..];
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else if let Some(pos) = rest.find(part) {
            rest = &rest[pos + part.len()..];
        } else {
            return false;
        }
    }
    true
}

/// A predicate over topics, built from zero or more compiled patterns whose
/// union it tests, with support for ANDing two matchers together (used to
/// combine a user's rights pattern with a client-supplied subscribe pattern;
/// see §4.5).
#[derive(Clone)]
pub struct Matcher(Arc<MatcherInner>);

enum MatcherInner {
    Always,
    Never,
    Union(Vec<CompiledPattern>),
    And(Matcher, Matcher),
}

impl Matcher {
    pub fn always() -> Self {
        Matcher(Arc::new(MatcherInner::Always))
    }

    pub fn never() -> Self {
        Matcher(Arc::new(MatcherInner::Never))
    }

    /// Compiles a single raw pattern string into a matcher. An empty string
    /// yields an always-match matcher.
    pub fn single(raw: &str) -> Result<Self, PatternError> {
        if raw.is_empty() {
            return Ok(Self::always());
        }
        Ok(Matcher(Arc::new(MatcherInner::Union(vec![
            CompiledPattern::compile(raw)?,
        ]))))
    }

    /// Compiles an optional pattern spec (§4.1): absent matches everything;
    /// a single string or list of strings matches their union.
    pub fn compile(spec: Option<&PatternSpec>) -> Result<Self, PatternError> {
        let Some(spec) = spec else {
            return Ok(Self::always());
        };
        let raws = spec.patterns();
        if raws.iter().any(|r| r.is_empty()) {
            return Ok(Self::always());
        }
        let mut compiled = Vec::with_capacity(raws.len());
        for raw in &raws {
            compiled.push(CompiledPattern::compile(raw)?);
        }
        Ok(Matcher(Arc::new(MatcherInner::Union(compiled))))
    }

    pub fn and(self, other: Matcher) -> Self {
        Matcher(Arc::new(MatcherInner::And(self, other)))
    }

    pub fn matches(&self, topic: &str) -> bool {
        match &*self.0 {
            MatcherInner::Always => true,
            MatcherInner::Never => false,
            MatcherInner::Union(patterns) => patterns.iter().any(|p| p.matches(topic)),
            MatcherInner::And(a, b) => a.matches(topic) && b.matches(topic),
        }
    }
}
