//! Durable, transactional local mirror
//!
//! A single SQLite file (WAL journaling) holds accounts, messages,
//! classifications, pending operations, and feedback, plus an FTS5
//! projection over subject/sender/snippet kept in the same transaction
//! as the message upsert.

mod sqlite;

pub use sqlite::{EnqueueOutcome, FolderCounts, MessageStore, MessageUpdate};

use crate::models::Folder;

/// Filters for listing messages; all are conjunctive except `tags`,
/// which matches any-of. Account ids act as tags too.
#[derive(Debug, Clone)]
pub struct MessageFilter {
    pub accounts: Vec<String>,
    pub folder: Option<Folder>,
    pub tags: Vec<String>,
    pub unread_only: bool,
    pub thread_id: Option<String>,
    /// Free text over subject + sender + snippet
    pub search: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for MessageFilter {
    fn default() -> Self {
        Self {
            accounts: Vec::new(),
            folder: None,
            tags: Vec::new(),
            unread_only: false,
            thread_id: None,
            search: None,
            limit: 50,
            offset: 0,
        }
    }
}
