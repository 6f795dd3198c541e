//! Pending provider-side operations recorded for later propagation

use anyhow::bail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// User-intent mutations the queue can carry to a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingOp {
    MarkRead,
    MarkUnread,
    Trash,
    Restore,
    PermanentDelete,
}

impl PendingOp {
    /// The operation that cancels this one when both are pending
    pub fn inverse(&self) -> Option<PendingOp> {
        match self {
            PendingOp::MarkRead => Some(PendingOp::MarkUnread),
            PendingOp::MarkUnread => Some(PendingOp::MarkRead),
            PendingOp::Trash => Some(PendingOp::Restore),
            PendingOp::Restore => Some(PendingOp::Trash),
            PendingOp::PermanentDelete => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PendingOp::MarkRead => "mark_read",
            PendingOp::MarkUnread => "mark_unread",
            PendingOp::Trash => "trash",
            PendingOp::Restore => "restore",
            PendingOp::PermanentDelete => "permanent_delete",
        }
    }
}

impl std::str::FromStr for PendingOp {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "mark_read" => Ok(PendingOp::MarkRead),
            "mark_unread" => Ok(PendingOp::MarkUnread),
            "trash" => Ok(PendingOp::Trash),
            "restore" => Ok(PendingOp::Restore),
            "permanent_delete" => Ok(PendingOp::PermanentDelete),
            other => bail!("Unknown pending op: {}", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpStatus {
    Pending,
    Completed,
    Failed,
}

impl OpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpStatus::Pending => "pending",
            OpStatus::Completed => "completed",
            OpStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for OpStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "pending" => Ok(OpStatus::Pending),
            "completed" => Ok(OpStatus::Completed),
            "failed" => Ok(OpStatus::Failed),
            other => bail!("Unknown op status: {}", other),
        }
    }
}

/// A queued provider mutation
///
/// `provider_id` is snapshotted at enqueue time so a permanent delete can be
/// pushed after the local row is gone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: i64,
    pub account_id: String,
    pub message_id: i64,
    pub provider_id: String,
    pub op: PendingOp,
    pub status: OpStatus,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}
