//! User tag corrections captured for few-shot prompting

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A recorded instance of the user overriding the AI's tag choice
///
/// `message_id` is a soft link: it survives as NULL when the message is
/// permanently deleted, and maintenance purges long-orphaned rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feedback {
    pub id: i64,
    pub account_id: String,
    pub message_id: Option<i64>,
    /// Host portion of the sender address, e.g. `github.com`
    pub sender_domain: String,
    /// Lowercased subject with digit runs collapsed to `#`
    pub subject_pattern: String,
    pub original_tags: Vec<String>,
    pub corrected_tags: Vec<String>,
    /// Snippet of the corrected message for prompt context (<= 200 chars)
    pub context: String,
    pub created_at: DateTime<Utc>,
    /// How many prompts this correction has been formatted into
    pub used_count: i64,
}

/// Collapse digit runs to `#` and lowercase, so `Invoice #1047 due` and
/// `Invoice #1050 due` share a pattern
pub fn subject_pattern(subject: &str) -> String {
    let mut out = String::with_capacity(subject.len());
    let mut in_digits = false;
    for c in subject.chars() {
        if c.is_ascii_digit() {
            if !in_digits {
                out.push('#');
                in_digits = true;
            }
        } else {
            in_digits = false;
            out.extend(c.to_lowercase());
        }
    }
    out
}
