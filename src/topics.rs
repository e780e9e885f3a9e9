//! Wildcard topic matching.
//!
//! A pattern is a dot-delimited sequence of segments where `*` matches exactly
//! one segment and a trailing `**` matches zero or more remaining segments.
//! Matching is a pure function of (pattern, name).

use crate::error::{BusError, Result};
use crate::types::EventName;
use std::fmt;

/// One parsed pattern segment.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Segment {
    /// Matches only the identical literal segment.
    Literal(String),
    /// `*` — matches exactly one arbitrary segment.
    Single,
    /// `**` — matches zero or more trailing segments; final position only.
    MultiTrailing,
}

/// A validated subscription pattern.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Pattern {
    raw: String,
    segments: Vec<Segment>,
}

impl Pattern {
    /// Parse and validate a pattern string.
    pub fn parse(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(BusError::invalid_pattern(pattern, "empty pattern"));
        }

        let parts: Vec<&str> = pattern.split('.').collect();
        let last = parts.len() - 1;
        let mut segments = Vec::with_capacity(parts.len());

        for (i, part) in parts.iter().enumerate() {
            let segment = match *part {
                "" => {
                    return Err(BusError::invalid_pattern(pattern, "empty segment"));
                }
                "*" => Segment::Single,
                "**" => {
                    if i != last {
                        return Err(BusError::invalid_pattern(
                            pattern,
                            "`**` is only allowed as the final segment",
                        ));
                    }
                    Segment::MultiTrailing
                }
                literal => {
                    if literal.contains('*') {
                        return Err(BusError::invalid_pattern(
                            pattern,
                            "`*` may not appear inside a literal segment",
                        ));
                    }
                    Segment::Literal(literal.to_string())
                }
            };
            segments.push(segment);
        }

        Ok(Pattern {
            raw: pattern.to_string(),
            segments,
        })
    }

    /// The original pattern string.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Evaluate this pattern against a concrete event name.
    pub fn matches(&self, name: &EventName) -> bool {
        let mut name_segments = name.segments();

        for segment in &self.segments {
            match segment {
                // Absorbs everything that remains, including nothing.
                Segment::MultiTrailing => return true,
                Segment::Single => {
                    if name_segments.next().is_none() {
                        return false;
                    }
                }
                Segment::Literal(literal) => match name_segments.next() {
                    Some(part) if part == literal.as_str() => {}
                    _ => return false,
                },
            }
        }

        // Pattern exhausted without `**`: the name must be exhausted too.
        name_segments.next().is_none()
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pattern({})", self.raw)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}
