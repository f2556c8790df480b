//! Path-template matching for policy objects.
//!
//! Patterns and paths are compared segment by segment (split on `/`):
//! - `*` matches any run of characters inside one segment (possibly empty)
//! - `:name` and `{name}` match exactly one non-empty segment
//! - everything else is compared byte-exact
//!
//! A pattern and a path with a different number of segments never match.
//!
//! The enforcer evaluates policies through [`path_match_operator`], registered
//! under [`PATH_MATCH_FN`](crate::model::PATH_MATCH_FN).

use rhai::Dynamic;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PatternError {
    #[error("pattern `{0}` must start with `/`")]
    NotAbsolute(String),

    #[error("pattern `{pattern}` has a malformed segment `{segment}`")]
    MalformedSegment { pattern: String, segment: String },
}

/// Match a request path against a policy object pattern.
pub fn key_match(path: &str, pattern: &str) -> Result<bool, PatternError> {
    validate_pattern(pattern)?;

    let mut path_segments = path.split('/');
    let mut pattern_segments = pattern.split('/');

    loop {
        match (path_segments.next(), pattern_segments.next()) {
            (None, None) => return Ok(true),
            (Some(seg), Some(pat)) => {
                if !segment_matches(seg, pat) {
                    return Ok(false);
                }
            }
            _ => return Ok(false),
        }
    }
}

/// Check that a pattern is well-formed without matching anything.
pub fn validate_pattern(pattern: &str) -> Result<(), PatternError> {
    if !pattern.starts_with('/') {
        return Err(PatternError::NotAbsolute(pattern.to_string()));
    }

    for segment in pattern.split('/') {
        let malformed = match segment {
            ":" => true,
            s if s.contains('{') || s.contains('}') => !is_brace_param(s),
            s if s.starts_with(':') => s[1..].contains(':'),
            _ => false,
        };
        if malformed {
            return Err(PatternError::MalformedSegment {
                pattern: pattern.to_string(),
                segment: segment.to_string(),
            });
        }
    }

    Ok(())
}

/// Matcher function handed to the casbin enforcer.
///
/// A malformed stored pattern never matches; evaluation carries on with the
/// remaining policies.
pub(crate) fn path_match_operator(path: Dynamic, pattern: Dynamic) -> Dynamic {
    let (path, pattern) = (path.to_string(), pattern.to_string());
    match key_match(&path, &pattern) {
        Ok(matched) => matched.into(),
        Err(err) => {
            warn!(error = %err, "skipping malformed policy object");
            false.into()
        }
    }
}

fn segment_matches(segment: &str, pattern: &str) -> bool {
    if is_param(pattern) {
        return !segment.is_empty();
    }
    if pattern.contains('*') {
        return glob_match(segment.as_bytes(), pattern.as_bytes());
    }
    segment == pattern
}

fn is_param(pattern: &str) -> bool {
    (pattern.len() > 1 && pattern.starts_with(':')) || is_brace_param(pattern)
}

fn is_brace_param(segment: &str) -> bool {
    segment.len() > 2
        && segment.starts_with('{')
        && segment.ends_with('}')
        && !segment[1..segment.len() - 1].contains(['{', '}'])
}

/// Single-segment glob where `*` matches any (possibly empty) byte run.
fn glob_match(text: &[u8], pattern: &[u8]) -> bool {
    let (mut t, mut p) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut resume = 0usize;

    while t < text.len() {
        if p < pattern.len() && pattern[p] == b'*' {
            star = Some(p);
            p += 1;
            resume = t;
        } else if p < pattern.len() && pattern[p] == text[t] {
            p += 1;
            t += 1;
        } else if let Some(s) = star {
            p = s + 1;
            resume += 1;
            t = resume;
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|b| *b == b'*')
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn m(path: &str, pattern: &str) -> bool {
        key_match(path, pattern).unwrap()
    }

    #[test]
    fn literal_paths_match_exactly() {
        assert!(m("/api/v1/customers", "/api/v1/customers"));
        assert!(!m("/api/v1/customers", "/api/v1/Customers"));
        assert!(!m("/api/v1/customers/1", "/api/v1/customers"));
    }

    #[test]
    fn star_stays_inside_one_segment() {
        assert!(m("/api/v1/customers", "/api/v1/*"));
        assert!(m("/api/v1/", "/api/v1/*"));
        assert!(!m("/api/v1/customers/42", "/api/v1/*"));
        assert!(m("/api/v1/customers/42", "/api/v1/*/*"));
        assert!(m("/api/v1/customer-notes", "/api/v1/customer*"));
        assert!(m("/api/v1/orders.csv", "/api/v1/*.csv"));
        assert!(!m("/api/v1/orders.json", "/api/v1/*.csv"));
    }

    #[test]
    fn named_parameters_match_one_segment() {
        assert!(m("/api/v1/customers/42", "/api/v1/customers/:id"));
        assert!(m("/api/v1/customers/42", "/api/v1/customers/{id}"));
        assert!(m("/api/v1/customers/:id", "/api/v1/customers/:id"));
        assert!(!m("/api/v1/customers/", "/api/v1/customers/:id"));
        assert!(!m("/api/v1/customers/42/orders", "/api/v1/customers/:id"));
    }

    #[test]
    fn malformed_patterns_are_errors() {
        assert!(matches!(
            key_match("/a", "a/b"),
            Err(PatternError::NotAbsolute(_))
        ));
        assert!(matches!(
            key_match("/a/b", "/a/{b"),
            Err(PatternError::MalformedSegment { .. })
        ));
        assert!(matches!(
            key_match("/a/b", "/a/:"),
            Err(PatternError::MalformedSegment { .. })
        ));
        assert!(matches!(
            key_match("/a/b", "/a/{}"),
            Err(PatternError::MalformedSegment { .. })
        ));
    }

    #[test]
    fn operator_treats_malformed_patterns_as_no_match() {
        let hit = path_match_operator(Dynamic::from("/api/v1/orders".to_string()), Dynamic::from("/api/v1/*".to_string()));
        assert!(hit.as_bool().unwrap());

        let broken = path_match_operator(Dynamic::from("/api/v1/orders".to_string()), Dynamic::from("/api/v1/{x".to_string()));
        assert!(!broken.as_bool().unwrap());
    }

    proptest! {
        #[test]
        fn every_literal_path_matches_itself(segments in proptest::collection::vec("[a-z0-9_-]{1,8}", 0..6)) {
            let path = format!("/{}", segments.join("/"));
            prop_assert!(key_match(&path, &path).unwrap());
        }
    }
}
