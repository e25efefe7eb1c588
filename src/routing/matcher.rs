//! Route pattern compilation and path matching.
//!
//! # Responsibilities
//! - Compile a pattern (`/rooms/:id`, `/feed{/:page}`) into segments
//! - Match a concrete request path and extract its parameters
//! - Render a pattern back into a path from a parameter map
//!
//! # Design Decisions
//! - Matching is structural on `/`-delimited segments, no regex
//! - Literal segments are case-sensitive
//! - A single trailing `/` on the request path is ignored
//! - Parameter values are always strings (percent-decoded)
//! - Optional groups contribute zero or one segment and may appear anywhere

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Extracted route parameters, keyed by name.
pub type Params = BTreeMap<String, String>;

/// Errors produced while compiling or rendering a pattern.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("pattern must start with '/': {0:?}")]
    MissingLeadingSlash(String),

    #[error("empty segment in pattern {0:?}")]
    EmptySegment(String),

    #[error("invalid parameter name {name:?} in pattern {pattern:?}")]
    InvalidParamName { pattern: String, name: String },

    #[error("parameter {name:?} declared twice in pattern {pattern:?}")]
    DuplicateParam { pattern: String, name: String },

    #[error("malformed optional group in pattern {0:?}, expected {{/:name}}")]
    MalformedOptional(String),

    #[error("missing value for parameter {name:?} of {pattern:?}")]
    MissingParam { pattern: String, name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Required(String),
    Optional(String),
}

/// A compiled route pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern {
    source: String,
    segments: Vec<Segment>,
}

impl RoutePattern {
    /// Compile a pattern string.
    pub fn compile(pattern: &str) -> Result<Self, PatternError> {
        if !pattern.starts_with('/') && !pattern.starts_with('{') {
            return Err(PatternError::MissingLeadingSlash(pattern.to_string()));
        }

        let mut segments = Vec::new();
        let mut cursor = pattern;
        while !cursor.is_empty() {
            if let Some(group) = cursor.strip_prefix('{') {
                let close = group
                    .find('}')
                    .ok_or_else(|| PatternError::MalformedOptional(pattern.to_string()))?;
                let inner = group[..close]
                    .strip_prefix('/')
                    .ok_or_else(|| PatternError::MalformedOptional(pattern.to_string()))?;
                if !inner.starts_with(':') || inner.contains('/') {
                    return Err(PatternError::MalformedOptional(pattern.to_string()));
                }
                segments.push(parse_segment(pattern, inner, true)?);
                cursor = &group[close + 1..];
            } else if let Some(rest) = cursor.strip_prefix('/') {
                let end = rest.find(|c: char| c == '/' || c == '{').unwrap_or(rest.len());
                let raw = &rest[..end];
                if raw.is_empty() {
                    // "/" and "/feed/" end here; "//" anywhere is an error.
                    if end == rest.len() {
                        break;
                    }
                    return Err(PatternError::EmptySegment(pattern.to_string()));
                }
                segments.push(parse_segment(pattern, raw, false)?);
                cursor = &rest[end..];
            } else {
                return Err(PatternError::MalformedOptional(pattern.to_string()));
            }
        }

        let mut seen = Vec::new();
        for segment in &segments {
            if let Segment::Required(name) | Segment::Optional(name) = segment {
                if seen.contains(&name) {
                    return Err(PatternError::DuplicateParam {
                        pattern: pattern.to_string(),
                        name: name.clone(),
                    });
                }
                seen.push(name);
            }
        }

        Ok(Self {
            source: pattern.to_string(),
            segments,
        })
    }

    /// The pattern text this matcher was compiled from.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Match a request path, returning its parameters on success.
    pub fn match_path(&self, path: &str) -> Option<Params> {
        let rest = path.strip_prefix('/')?;
        let rest = rest.strip_suffix('/').unwrap_or(rest);
        let parts: Vec<&str> = if rest.is_empty() {
            Vec::new()
        } else {
            rest.split('/').collect()
        };
        if parts.iter().any(|p| p.is_empty()) {
            return None;
        }

        let mut params = Params::new();
        if match_segments(&self.segments, &parts, &mut params) {
            Some(params)
        } else {
            None
        }
    }

    /// Render this pattern into a concrete path.
    ///
    /// Values are percent-encoded. Optional parameters are skipped when
    /// absent; parameters the pattern does not name are ignored.
    pub fn to_path(&self, params: &Params) -> Result<String, PatternError> {
        let mut path = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(lit) => {
                    path.push('/');
                    path.push_str(lit);
                }
                Segment::Required(name) => {
                    let value = params.get(name).ok_or_else(|| PatternError::MissingParam {
                        pattern: self.source.clone(),
                        name: name.clone(),
                    })?;
                    path.push('/');
                    path.push_str(&urlencoding::encode(value));
                }
                Segment::Optional(name) => {
                    if let Some(value) = params.get(name) {
                        path.push('/');
                        path.push_str(&urlencoding::encode(value));
                    }
                }
            }
        }
        if path.is_empty() {
            path.push('/');
        }
        Ok(path)
    }
}

impl fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn parse_segment(pattern: &str, raw: &str, optional: bool) -> Result<Segment, PatternError> {
    match raw.strip_prefix(':') {
        Some(name) => {
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(PatternError::InvalidParamName {
                    pattern: pattern.to_string(),
                    name: name.to_string(),
                });
            }
            if optional {
                Ok(Segment::Optional(name.to_string()))
            } else {
                Ok(Segment::Required(name.to_string()))
            }
        }
        None => Ok(Segment::Literal(raw.to_string())),
    }
}

/// Backtracking match; optional groups try to consume a segment first.
fn match_segments(segments: &[Segment], parts: &[&str], params: &mut Params) -> bool {
    let Some((segment, rest)) = segments.split_first() else {
        return parts.is_empty();
    };

    match segment {
        Segment::Literal(lit) => match parts.split_first() {
            Some((part, tail)) if *part == lit.as_str() => match_segments(rest, tail, params),
            _ => false,
        },
        Segment::Required(name) => match parts.split_first() {
            Some((part, tail)) => bind(name, part, tail, rest, params),
            None => false,
        },
        Segment::Optional(name) => {
            if let Some((part, tail)) = parts.split_first() {
                if bind(name, part, tail, rest, params) {
                    return true;
                }
            }
            match_segments(rest, parts, params)
        }
    }
}

fn bind(name: &str, part: &str, tail: &[&str], rest: &[Segment], params: &mut Params) -> bool {
    let Ok(value) = urlencoding::decode(part) else {
        return false;
    };
    params.insert(name.to_string(), value.into_owned());
    if match_segments(rest, tail, params) {
        true
    } else {
        params.remove(name);
        false
    }
}
