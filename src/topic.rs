//! Topic names and binding patterns.
//!
//! Topics are hierarchical, dot-separated routing keys (`user.registered`,
//! `chat.media.processed`). Queue bindings use patterns with the usual topic
//! exchange wildcards: `*` matches exactly one segment, `#` matches zero or
//! more segments. Matching here mirrors what the broker does so that the
//! in-memory bus routes identically to RabbitMQ.

use std::fmt;

use thiserror::Error;

/// Errors raised when validating topic names or binding patterns.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("topic must not be empty")]
    Empty,
    #[error("topic segment must not be empty: {0:?}")]
    EmptySegment(String),
    #[error("invalid character in topic segment {0:?}")]
    InvalidSegment(String),
    #[error("wildcard {wildcard:?} not allowed in topic {topic:?}")]
    WildcardInTopic { topic: String, wildcard: char },
}

pub(crate) fn valid_literal_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// A concrete routing key: non-empty, dot-separated, wildcard-free.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(String);

impl Topic {
    pub fn new(topic: impl Into<String>) -> Result<Self, TopicError> {
        let topic = topic.into();
        if topic.is_empty() {
            return Err(TopicError::Empty);
        }
        for segment in topic.split('.') {
            if segment.is_empty() {
                return Err(TopicError::EmptySegment(topic.clone()));
            }
            if segment == "*" || segment == "#" {
                return Err(TopicError::WildcardInTopic {
                    topic: topic.clone(),
                    wildcard: if segment == "*" { '*' } else { '#' },
                });
            }
            if !valid_literal_segment(segment) {
                return Err(TopicError::InvalidSegment(segment.to_string()));
            }
        }
        Ok(Self(topic))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Topic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A queue binding pattern. Plain topics are valid patterns, so listeners
/// that bind a single event type reuse this type unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPattern(String);

impl TopicPattern {
    pub fn new(pattern: impl Into<String>) -> Result<Self, TopicError> {
        let pattern = pattern.into();
        if pattern.is_empty() {
            return Err(TopicError::Empty);
        }
        for segment in pattern.split('.') {
            if segment.is_empty() {
                return Err(TopicError::EmptySegment(pattern.clone()));
            }
            if segment != "*" && segment != "#" && !valid_literal_segment(segment) {
                return Err(TopicError::InvalidSegment(segment.to_string()));
            }
        }
        Ok(Self(pattern))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when `topic` would be routed to a queue bound with this pattern.
    pub fn matches(&self, topic: &str) -> bool {
        let pattern: Vec<&str> = self.0.split('.').collect();
        let topic: Vec<&str> = topic.split('.').collect();
        segments_match(&pattern, &topic)
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TopicPattern {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn segments_match(pattern: &[&str], topic: &[&str]) -> bool {
    match pattern.split_first() {
        None => topic.is_empty(),
        Some((&"#", rest)) => {
            // `#` absorbs zero segments, or one and stays in play.
            segments_match(rest, topic)
                || (!topic.is_empty() && segments_match(pattern, &topic[1..]))
        }
        Some((&"*", rest)) => match topic.split_first() {
            Some((_, topic_rest)) => segments_match(rest, topic_rest),
            None => false,
        },
        Some((literal, rest)) => match topic.split_first() {
            Some((word, topic_rest)) if word == literal => segments_match(rest, topic_rest),
            _ => false,
        },
    }
}
