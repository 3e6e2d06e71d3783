//! Topic names and subscription patterns.
//!
//! A topic is either empty or a sequence of words (`[A-Za-z0-9_]+`) joined by
//! single dots, e.g. `orders.urgent.retry`.
//!
//! Matching rules:
//! - The empty pattern matches every topic, including the empty topic
//! - Exact match: "orders" matches "orders"
//! - Hierarchical: "orders" matches "orders.urgent" (prefix match with dot separator)
//! - "orders" does NOT match "ordersextra"

use crate::bus::{BusError, Result};

/// Check whether `topic` is syntactically valid.
pub fn is_valid(topic: &str) -> bool {
    if topic.is_empty() {
        return true;
    }
    topic.split('.').all(is_word)
}

fn is_word(word: &str) -> bool {
    !word.is_empty() && word.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Normalize an optional topic or pattern.
///
/// `None` is the empty topic. Invalid input is rejected with
/// [`BusError::InvalidTopic`] carrying the offending value.
pub fn normalize(topic: Option<&str>) -> Result<String> {
    let topic = topic.unwrap_or_default();
    if !is_valid(topic) {
        return Err(BusError::InvalidTopic {
            topic: topic.to_string(),
        });
    }
    Ok(topic.to_string())
}

/// A compiled subscription pattern.
///
/// Reusable, cheap to clone, and safe to share across tasks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Matcher {
    pattern: String,
}

impl Matcher {
    /// Compile a pattern. `None` compiles to the match-everything pattern.
    pub fn compile(pattern: Option<&str>) -> Result<Self> {
        Ok(Self {
            pattern: normalize(pattern)?,
        })
    }

    /// The normalized pattern this matcher was compiled from.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Check if `topic` falls under this pattern.
    pub fn matches(&self, topic: &str) -> bool {
        if self.pattern.is_empty() {
            return true;
        }
        if topic == self.pattern {
            return true;
        }
        // Hierarchical match: pattern is prefix of topic with dot separator
        topic.starts_with(self.pattern.as_str()) && topic[self.pattern.len()..].starts_with('.')
    }
}
