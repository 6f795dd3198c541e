//! Per-account incremental fetch cursors

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use config::ProviderKind;
use serde::{Deserialize, Serialize};

/// Opaque position marker for incremental fetch
///
/// Gmail tracks a mailbox-wide history id. IMAP tracks the highest UID seen
/// per folder, with a timestamp fallback for servers that invalidate UIDs
/// (UIDVALIDITY change).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SyncCursor {
    Gmail {
        history_id: Option<String>,
        /// Fallback bound for when the history id expires
        #[serde(default)]
        last_sync: Option<DateTime<Utc>>,
    },
    Imap {
        /// Logical folder name -> highest UID fetched
        last_uids: BTreeMap<String, u32>,
        last_sync: Option<DateTime<Utc>>,
    },
}

impl SyncCursor {
    pub fn empty(provider: ProviderKind) -> Self {
        match provider {
            ProviderKind::Gmail => SyncCursor::Gmail {
                history_id: None,
                last_sync: None,
            },
            ProviderKind::Imap => SyncCursor::Imap {
                last_uids: BTreeMap::new(),
                last_sync: None,
            },
        }
    }

    /// True when no fetch has ever completed
    pub fn is_initial(&self) -> bool {
        match self {
            SyncCursor::Gmail { history_id, .. } => history_id.is_none(),
            SyncCursor::Imap { last_uids, .. } => last_uids.is_empty(),
        }
    }

    /// Fold the cursor returned by one folder's delta into the account
    /// cursor for the cycle. Gmail keeps the latest history id; IMAP
    /// takes the per-folder UID maximum.
    pub fn merge(&mut self, other: SyncCursor) {
        match (self, other) {
            (
                SyncCursor::Gmail { history_id, last_sync },
                SyncCursor::Gmail {
                    history_id: other_history,
                    last_sync: other_sync,
                },
            ) => {
                if other_history.is_some() {
                    *history_id = other_history;
                }
                if other_sync.is_some() {
                    *last_sync = other_sync;
                }
            }
            (
                SyncCursor::Imap { last_uids, last_sync },
                SyncCursor::Imap {
                    last_uids: other_uids,
                    last_sync: other_sync,
                },
            ) => {
                for (folder, uid) in other_uids {
                    let entry = last_uids.entry(folder).or_insert(0);
                    *entry = (*entry).max(uid);
                }
                if other_sync.is_some() {
                    *last_sync = other_sync;
                }
            }
            // Mismatched kinds only happen on provider reconfiguration;
            // keep the existing cursor
            _ => {}
        }
    }
}
