//! Word-count token approximation.
//!
//! Not a provider tokenizer. The same estimate is applied before and after
//! substitution; only the delta is meaningful.

use crate::provider::Message;

/// Whitespace-separated words in `text`.
pub fn count_words(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

/// Approximate token count of a conversation.
pub fn approximate_tokens(messages: &[Message]) -> u64 {
    messages.iter().map(|m| count_words(&m.text())).sum()
}
