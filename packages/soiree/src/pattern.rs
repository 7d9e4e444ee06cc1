//! Topic names and wildcard patterns.
//!
//! Topics are `.`-separated segments. In subscription patterns `*` matches
//! exactly one segment and `**` matches any number of segments, including
//! none. A bare `**` matches every topic, the empty one included.

use std::cmp::Ordering;

use crate::error::{Result, SoireeError};

pub const SINGLE_WILDCARD: &str = "*";
pub const MULTI_WILDCARD: &str = "**";

const SEPARATOR: char = '.';

/// Trim surrounding whitespace from a topic or pattern.
pub fn normalize_topic_name(name: &str) -> String {
    name.trim().to_string()
}

/// Reject empty names, empty segments and embedded whitespace.
pub fn validate_topic_name(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name.chars().any(char::is_whitespace)
        || name.split(SEPARATOR).any(str::is_empty);

    if invalid {
        return Err(SoireeError::InvalidTopicName {
            name: name.to_string(),
        });
    }

    Ok(())
}

/// Whether `topic` is matched by the subscription `pattern`.
pub fn match_topic_pattern(pattern: &str, topic: &str) -> bool {
    if pattern == topic {
        return true;
    }

    let pattern: Vec<&str> = segments(pattern);
    let topic: Vec<&str> = segments(topic);

    match_segments(&pattern, &topic)
}

fn segments(name: &str) -> Vec<&str> {
    if name.is_empty() {
        Vec::new()
    } else {
        name.split(SEPARATOR).collect()
    }
}

fn match_segments(pattern: &[&str], topic: &[&str]) -> bool {
    match pattern.split_first() {
        None => topic.is_empty(),
        Some((&MULTI_WILDCARD, rest)) => {
            (0..=topic.len()).any(|skip| match_segments(rest, &topic[skip..]))
        }
        Some((&SINGLE_WILDCARD, rest)) => !topic.is_empty() && match_segments(rest, &topic[1..]),
        Some((segment, rest)) => {
            topic.first() == Some(segment) && match_segments(rest, &topic[1..])
        }
    }
}

/// Whether the pattern contains any wildcard segment.
pub fn is_wildcard(pattern: &str) -> bool {
    pattern
        .split(SEPARATOR)
        .any(|s| s == SINGLE_WILDCARD || s == MULTI_WILDCARD)
}

#[derive(Debug, PartialEq, Eq)]
struct Specificity {
    multi_wildcards: usize,
    single_wildcards: usize,
    segments: usize,
    length: usize,
}

impl Specificity {
    fn of(pattern: &str) -> Self {
        let parts: Vec<&str> = pattern.split(SEPARATOR).collect();
        Self {
            multi_wildcards: parts.iter().filter(|p| **p == MULTI_WILDCARD).count(),
            single_wildcards: parts.iter().filter(|p| **p == SINGLE_WILDCARD).count(),
            segments: parts.len(),
            length: pattern.len(),
        }
    }
}

/// Ordering of matched patterns for delivery: fewer `**`, then fewer `*`,
/// then more segments, then longer text, then lexical.
pub fn compare_topic_specificity(a: &str, b: &str) -> Ordering {
    let ka = Specificity::of(a);
    let kb = Specificity::of(b);

    ka.multi_wildcards
        .cmp(&kb.multi_wildcards)
        .then(ka.single_wildcards.cmp(&kb.single_wildcards))
        .then(kb.segments.cmp(&ka.segments))
        .then(kb.length.cmp(&ka.length))
        .then_with(|| a.cmp(b))
}
