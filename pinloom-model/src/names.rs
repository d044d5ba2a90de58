//! Name grammar for namespaces and topics
//!
//! Names are 1-64 chars of lowercase ASCII letters, digits, dash and
//! underscore. Topic lists are deduplicated and bounded in count.

use thiserror::Error;

/// Maximum length of a single name (namespace or topic).
pub const NAME_MAX_LEN: usize = 64;

/// Maximum number of topics on one message.
pub const TOPICS_MAX_ITEMS: usize = 15;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NameError {
    #[error("name is empty")]
    Empty,
    #[error("name '{0}' exceeds {NAME_MAX_LEN} characters")]
    TooLong(String),
    #[error("name '{0}' contains invalid character '{1}'")]
    BadChar(String, char),
    #[error("duplicate entry '{0}' at index {1}")]
    Duplicate(String, usize),
    #[error("too many items: {0} exceeds the maximum of {TOPICS_MAX_ITEMS}")]
    TooManyItems(usize),
}

/// Validate a single name against the grammar.
pub fn validate_name(name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.len() > NAME_MAX_LEN {
        return Err(NameError::TooLong(name.to_string()));
    }
    for c in name.chars() {
        if !(c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_') {
            return Err(NameError::BadChar(name.to_string(), c));
        }
    }
    Ok(())
}

/// Validate a topic list: each entry a valid name, no duplicates, at most
/// `TOPICS_MAX_ITEMS` entries.
pub fn validate_topics(topics: &[String]) -> Result<(), NameError> {
    for (i, topic) in topics.iter().enumerate() {
        if topics[..i].contains(topic) {
            return Err(NameError::Duplicate(topic.clone(), i));
        }
        validate_name(topic)?;
    }
    if topics.len() > TOPICS_MAX_ITEMS {
        return Err(NameError::TooManyItems(topics.len()));
    }
    Ok(())
}
