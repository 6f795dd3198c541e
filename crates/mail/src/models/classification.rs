//! Classification verdicts produced by the AI pipeline

use anyhow::bail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            other => bail!("Unknown priority: {}", other),
        }
    }
}

/// One-to-one with a message; a message may be unclassified
///
/// Tags are kept in verdict order but carry set semantics; every tag is
/// drawn from the configured taxonomy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub message_id: i64,
    pub tags: Vec<String>,
    pub priority: Priority,
    pub action_required: bool,
    pub can_archive: bool,
    /// Model self-reported confidence in [0.0, 1.0]
    pub confidence: f32,
    pub model: String,
    pub classified_at: DateTime<Utc>,
}

impl Classification {
    /// The unclassifiable fallback: empty tags, zero confidence
    pub fn empty(message_id: i64, model: &str) -> Self {
        Self {
            message_id,
            tags: Vec::new(),
            priority: Priority::Normal,
            action_required: false,
            can_archive: false,
            confidence: 0.0,
            model: model.to_string(),
            classified_at: Utc::now(),
        }
    }
}
