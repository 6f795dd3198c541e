//! SQLite-backed message store

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration, Utc};
use log::warn;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params, params_from_iter};
use rusqlite_migration::{M, Migrations};

use super::MessageFilter;
use crate::models::{
    Account, Classification, EmailAddress, Feedback, Folder, Message, MessageBody, OpStatus,
    PendingOp, PendingOperation, Priority, SyncCursor,
};
use crate::provider::RemoteMessage;

/// Feedback retention per account
const FEEDBACK_CAP: i64 = 100;
/// Feedback rows older than this are purged
const FEEDBACK_MAX_AGE_DAYS: i64 = 90;
/// Orphaned feedback rows (message deleted) are purged after this long
const FEEDBACK_ORPHAN_DAYS: i64 = 30;
/// Attempts before a pending operation stops retrying
const PENDING_MAX_ATTEMPTS: u32 = 3;

/// Database migrations, applied in order; the user_version pragma tracks
/// the linear schema version (forward-only).
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        r#"
        -- Accounts: runtime sync state; settings live in the config document
        CREATE TABLE accounts (
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL,
            provider TEXT NOT NULL,
            cursor TEXT NOT NULL,
            healthy INTEGER NOT NULL DEFAULT 1,
            last_synced_at TEXT,
            last_error TEXT
        );

        -- Mirrored messages; bodies are zstd-compressed and fetched lazily
        CREATE TABLE messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id TEXT NOT NULL REFERENCES accounts(id),
            provider_id TEXT NOT NULL,
            thread_id TEXT NOT NULL DEFAULT '',
            subject TEXT NOT NULL DEFAULT '',
            sender_name TEXT,
            sender_email TEXT NOT NULL,
            recipients TEXT NOT NULL DEFAULT '[]',
            received_at TEXT NOT NULL,
            snippet TEXT NOT NULL DEFAULT '',
            folder TEXT NOT NULL,
            original_folder TEXT,
            is_unread INTEGER NOT NULL DEFAULT 1,
            has_attachments INTEGER NOT NULL DEFAULT 0,
            provider_labels TEXT NOT NULL DEFAULT '[]',
            labels_pushed INTEGER NOT NULL DEFAULT 1,
            body_text BLOB,  -- zstd compressed
            body_html BLOB,  -- zstd compressed
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (account_id, provider_id)
        );

        CREATE INDEX idx_messages_account ON messages(account_id, received_at DESC);
        CREATE INDEX idx_messages_folder ON messages(folder, received_at DESC);
        CREATE INDEX idx_messages_thread ON messages(thread_id);

        -- One classification per message; messages may be unclassified
        CREATE TABLE classifications (
            message_id INTEGER PRIMARY KEY REFERENCES messages(id) ON DELETE CASCADE,
            tags TEXT NOT NULL,
            priority TEXT NOT NULL,
            action_required INTEGER NOT NULL DEFAULT 0,
            can_archive INTEGER NOT NULL DEFAULT 0,
            confidence REAL NOT NULL DEFAULT 0,
            model TEXT NOT NULL,
            classified_at TEXT NOT NULL
        );

        -- Denormalized tag index for any-of filters and sidebar counts
        CREATE TABLE message_tags (
            message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            tag TEXT NOT NULL,
            PRIMARY KEY (message_id, tag)
        );

        CREATE INDEX idx_message_tags_tag ON message_tags(tag);

        -- User-intent mutations awaiting provider convergence.
        -- provider_id is snapshotted so permanent deletes outlive the row.
        CREATE TABLE pending_operations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id TEXT NOT NULL,
            message_id INTEGER NOT NULL,
            provider_id TEXT NOT NULL,
            op TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            last_attempt_at TEXT,
            last_error TEXT,
            created_at TEXT NOT NULL
        );

        CREATE INDEX idx_pending_account
            ON pending_operations(account_id, status, created_at);
        CREATE INDEX idx_pending_message
            ON pending_operations(account_id, message_id, status);

        -- Tag corrections; message link is soft so rows survive deletion
        CREATE TABLE feedback (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id TEXT NOT NULL,
            message_id INTEGER,
            sender_domain TEXT NOT NULL,
            subject_pattern TEXT NOT NULL,
            original_tags TEXT NOT NULL,
            corrected_tags TEXT NOT NULL,
            context TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            used_count INTEGER NOT NULL DEFAULT 0,
            orphaned_at TEXT
        );

        CREATE INDEX idx_feedback_account ON feedback(account_id, created_at DESC);
        CREATE INDEX idx_feedback_domain
            ON feedback(account_id, sender_domain, created_at DESC);

        -- Full-text projection, maintained in the message upsert transaction
        CREATE VIRTUAL TABLE messages_fts USING fts5(subject, sender, snippet);
        "#,
    )])
}

/// Partial update for a message's mirrored user-intent fields
#[derive(Debug, Clone, Default)]
pub struct MessageUpdate {
    pub is_unread: Option<bool>,
    pub folder: Option<Folder>,
    /// `Some(None)` clears original_folder; `None` leaves it untouched
    pub original_folder: Option<Option<Folder>>,
}

/// Outcome of enqueueing a pending operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new row was inserted
    Inserted(i64),
    /// An identical pending row already existed
    Coalesced,
    /// The enqueue cancelled a pending inverse operation
    Annihilated,
}

/// Per-folder message totals for the sidebar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FolderCounts {
    pub total: i64,
    pub unread: i64,
}

/// The durable local mirror
///
/// A single connection behind a mutex forms the writer lane; WAL mode
/// lets other connections read concurrently.
pub struct MessageStore {
    conn: Mutex<Connection>,
}

impl MessageStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;
        Self::init(conn)
    }

    /// In-memory store for tests
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(mut conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            "#,
        )?;

        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Group mutations into one atomic unit
    pub fn transaction<T>(&self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    // === Accounts ===

    /// Insert or refresh an account row from configuration, preserving
    /// runtime state (cursor, health) across restarts
    pub fn register_account(&self, account: &Account) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO accounts (id, email, provider, cursor)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                email = excluded.email,
                provider = excluded.provider",
            params![
                account.id,
                account.email,
                account.provider.as_str(),
                serde_json::to_string(&account.cursor)?,
            ],
        )?;
        Ok(())
    }

    /// Load persisted runtime state into a config-built account
    pub fn hydrate_account(&self, account: &mut Account) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(String, i64, Option<String>, Option<String>)> = conn
            .query_row(
                "SELECT cursor, healthy, last_synced_at, last_error
                 FROM accounts WHERE id = ?",
                [&account.id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        if let Some((cursor_json, healthy, last_synced_at, last_error)) = row {
            match serde_json::from_str(&cursor_json) {
                Ok(cursor) => account.cursor = cursor,
                Err(e) => warn!("Discarding unreadable cursor for {}: {}", account.id, e),
            }
            account.healthy = healthy != 0;
            account.last_synced_at = last_synced_at.as_deref().map(parse_ts);
            account.last_error = last_error;
        }
        Ok(())
    }

    /// Persist the advanced cursor after a successful cycle
    pub fn save_cursor(&self, account_id: &str, cursor: &SyncCursor) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE accounts SET cursor = ?, last_synced_at = ?, healthy = 1, last_error = NULL
             WHERE id = ?",
            params![serde_json::to_string(cursor)?, now_ts(), account_id],
        )?;
        Ok(())
    }

    pub fn set_account_health(
        &self,
        account_id: &str,
        healthy: bool,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE accounts SET healthy = ?, last_error = ? WHERE id = ?",
            params![healthy, error, account_id],
        )?;
        Ok(())
    }

    // === Messages ===

    /// Insert or update a message observed at the provider, keyed by
    /// (account_id, provider_id). Applying the same payload twice is
    /// indistinguishable from applying it once.
    ///
    /// `preserve_unread`/`preserve_folder` keep the locally-stored value
    /// when a pending operation for that field is still in flight (local
    /// intent wins over observation). Classifications are never touched.
    ///
    /// Returns the local id and whether the row was created.
    pub fn upsert_remote(
        &self,
        account_id: &str,
        remote: &RemoteMessage,
        preserve_unread: bool,
        preserve_folder: bool,
    ) -> Result<(i64, bool)> {
        self.transaction(|tx| {
            let existing: Option<(i64, String)> = tx
                .query_row(
                    "SELECT id, folder FROM messages WHERE account_id = ? AND provider_id = ?",
                    params![account_id, remote.provider_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let now = now_ts();
            let recipients = serde_json::to_string(&remote.recipients)?;
            let labels = serde_json::to_string(&remote.labels)?;

            match existing {
                None => {
                    tx.execute(
                        "INSERT INTO messages
                         (account_id, provider_id, thread_id, subject, sender_name,
                          sender_email, recipients, received_at, snippet, folder,
                          original_folder, is_unread, has_attachments, provider_labels,
                          created_at, updated_at)
                         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, ?, ?, ?, ?)",
                        params![
                            account_id,
                            remote.provider_id,
                            remote.thread_id,
                            remote.subject,
                            remote.sender.name,
                            remote.sender.email,
                            recipients,
                            ts(remote.received_at),
                            remote.snippet,
                            remote.folder.as_str(),
                            remote.is_unread,
                            remote.has_attachments,
                            labels,
                            now,
                            now,
                        ],
                    )?;
                    let id = tx.last_insert_rowid();
                    fts_replace(tx, id, &remote.subject, &remote.sender, &remote.snippet)?;
                    Ok((id, true))
                }
                Some((id, current_folder)) => {
                    tx.execute(
                        "UPDATE messages SET
                            thread_id = ?, subject = ?, sender_name = ?, sender_email = ?,
                            recipients = ?, received_at = ?, snippet = ?,
                            has_attachments = ?, provider_labels = ?, updated_at = ?
                         WHERE id = ?",
                        params![
                            remote.thread_id,
                            remote.subject,
                            remote.sender.name,
                            remote.sender.email,
                            recipients,
                            ts(remote.received_at),
                            remote.snippet,
                            remote.has_attachments,
                            labels,
                            now,
                            id,
                        ],
                    )?;

                    if !preserve_unread {
                        tx.execute(
                            "UPDATE messages SET is_unread = ? WHERE id = ?",
                            params![remote.is_unread, id],
                        )?;
                    }

                    if !preserve_folder {
                        // Adopting a provider-side move into trash records the
                        // restore target; leaving trash clears it.
                        let original: Option<&str> = if remote.folder == Folder::Trash
                            && current_folder != Folder::Trash.as_str()
                        {
                            Some(current_folder.as_str())
                        } else {
                            None
                        };
                        tx.execute(
                            "UPDATE messages SET folder = ?, original_folder = ? WHERE id = ?",
                            params![remote.folder.as_str(), original, id],
                        )?;
                    }

                    fts_replace(tx, id, &remote.subject, &remote.sender, &remote.snippet)?;
                    Ok((id, false))
                }
            }
        })
    }

    pub fn get_message(&self, id: i64) -> Result<Option<Message>> {
        let conn = self.conn.lock().unwrap();
        let msg = conn
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages m WHERE m.id = ?"),
                [id],
                message_from_row,
            )
            .optional()?;
        Ok(msg)
    }

    pub fn get_message_by_provider_id(
        &self,
        account_id: &str,
        provider_id: &str,
    ) -> Result<Option<Message>> {
        let conn = self.conn.lock().unwrap();
        let msg = conn
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages m
                     WHERE m.account_id = ? AND m.provider_id = ?"
                ),
                params![account_id, provider_id],
                message_from_row,
            )
            .optional()?;
        Ok(msg)
    }

    /// Write a user-intent delta. Moving into trash requires the restore
    /// target; leaving trash requires clearing it.
    pub fn update_message(&self, id: i64, update: &MessageUpdate) -> Result<Message> {
        if update.folder == Some(Folder::Trash)
            && !matches!(update.original_folder, Some(Some(_)))
        {
            bail!("Moving a message to trash requires original_folder");
        }

        self.transaction(|tx| {
            if let Some(is_unread) = update.is_unread {
                tx.execute(
                    "UPDATE messages SET is_unread = ?, updated_at = ? WHERE id = ?",
                    params![is_unread, now_ts(), id],
                )?;
            }
            if let Some(folder) = update.folder {
                tx.execute(
                    "UPDATE messages SET folder = ?, updated_at = ? WHERE id = ?",
                    params![folder.as_str(), now_ts(), id],
                )?;
            }
            if let Some(original) = update.original_folder {
                tx.execute(
                    "UPDATE messages SET original_folder = ?, updated_at = ? WHERE id = ?",
                    params![original.map(|f| f.as_str()), now_ts(), id],
                )?;
            }

            tx.query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages m WHERE m.id = ?"),
                [id],
                message_from_row,
            )
            .context("Message disappeared during update")
        })
    }

    /// Remove a message and its classification; feedback keeps its row
    /// with the link nulled out
    pub fn delete_message(&self, id: i64) -> Result<()> {
        self.transaction(|tx| {
            tx.execute(
                "UPDATE feedback SET message_id = NULL, orphaned_at = ?
                 WHERE message_id = ?",
                params![now_ts(), id],
            )?;
            tx.execute("DELETE FROM messages_fts WHERE rowid = ?", [id])?;
            tx.execute("DELETE FROM messages WHERE id = ?", [id])?;
            Ok(())
        })
    }

    /// List messages matching the filter, newest first (received_at desc,
    /// provider_id breaks ties)
    pub fn list_messages(&self, filter: &MessageFilter) -> Result<Vec<Message>> {
        let (where_sql, args) = filter_clauses(filter, true);
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages m
             {where_sql}
             ORDER BY m.received_at DESC, m.provider_id DESC
             LIMIT ? OFFSET ?"
        );

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = args;
        params.push(Box::new(filter.limit as i64));
        params.push(Box::new(filter.offset as i64));

        let messages = stmt
            .query_map(params_from_iter(params.iter().map(|p| p.as_ref())), message_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    /// Tag -> message count over messages matching the non-tag filters.
    /// Account ids are reported as tags alongside AI tags.
    pub fn tag_counts(&self, filter: &MessageFilter) -> Result<BTreeMap<String, i64>> {
        let mut scoped = filter.clone();
        scoped.tags.clear();
        let (where_sql, args) = filter_clauses(&scoped, true);

        let conn = self.conn.lock().unwrap();
        let mut counts = BTreeMap::new();

        let sql = format!(
            "SELECT t.tag, COUNT(*) FROM message_tags t
             JOIN messages m ON m.id = t.message_id
             {where_sql}
             GROUP BY t.tag"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params_from_iter(args.iter().map(|p| p.as_ref())),
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
        )?;
        for row in rows {
            let (tag, count) = row?;
            counts.insert(tag, count);
        }

        let sql = format!(
            "SELECT m.account_id, COUNT(*) FROM messages m {where_sql} GROUP BY m.account_id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params_from_iter(args.iter().map(|p| p.as_ref())),
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
        )?;
        for row in rows {
            let (account, count) = row?;
            counts.insert(account, count);
        }

        Ok(counts)
    }

    /// Folder -> {total, unread} aggregates, optionally scoped to accounts
    pub fn folder_counts(&self, accounts: &[String]) -> Result<BTreeMap<Folder, FolderCounts>> {
        let mut sql = "SELECT folder, COUNT(*), SUM(is_unread) FROM messages".to_string();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if !accounts.is_empty() {
            sql.push_str(&format!(" WHERE account_id IN ({})", placeholders(accounts.len())));
            for account in accounts {
                args.push(Box::new(account.clone()));
            }
        }
        sql.push_str(" GROUP BY folder");

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params_from_iter(args.iter().map(|p| p.as_ref())),
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            },
        )?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let (folder, total, unread) = row?;
            if let Ok(folder) = folder.parse::<Folder>() {
                counts.insert(folder, FolderCounts { total, unread });
            }
        }
        Ok(counts)
    }

    // === Bodies ===

    /// Cache a lazily-fetched body, zstd-compressed
    pub fn save_body(&self, id: i64, body: &MessageBody) -> Result<()> {
        let text = body
            .text
            .as_ref()
            .map(|t| zstd::encode_all(t.as_bytes(), 3))
            .transpose()
            .context("Failed to compress body text")?;
        let html = body
            .html
            .as_ref()
            .map(|h| zstd::encode_all(h.as_bytes(), 3))
            .transpose()
            .context("Failed to compress body html")?;

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE messages SET body_text = ?, body_html = ? WHERE id = ?",
            params![text, html, id],
        )?;
        Ok(())
    }

    /// Cached body, if one was ever fetched
    pub fn get_body(&self, id: i64) -> Result<Option<MessageBody>> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(Option<Vec<u8>>, Option<Vec<u8>>)> = conn
            .query_row(
                "SELECT body_text, body_html FROM messages WHERE id = ?",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((text, html)) = row else {
            return Ok(None);
        };
        if text.is_none() && html.is_none() {
            return Ok(None);
        }

        let decompress = |blob: Vec<u8>| -> Result<String> {
            let bytes = zstd::decode_all(blob.as_slice()).context("Failed to decompress body")?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        };
        Ok(Some(MessageBody {
            text: text.map(decompress).transpose()?,
            html: html.map(decompress).transpose()?,
        }))
    }

    // === Classifications ===

    /// Idempotent replace of a message's classification. Rebuilds the tag
    /// index and flags the message for provider label reconciliation.
    /// Existing feedback rows are never altered.
    pub fn upsert_classification(&self, c: &Classification) -> Result<()> {
        self.transaction(|tx| {
            tx.execute(
                "INSERT INTO classifications
                 (message_id, tags, priority, action_required, can_archive,
                  confidence, model, classified_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(message_id) DO UPDATE SET
                    tags = excluded.tags,
                    priority = excluded.priority,
                    action_required = excluded.action_required,
                    can_archive = excluded.can_archive,
                    confidence = excluded.confidence,
                    model = excluded.model,
                    classified_at = excluded.classified_at",
                params![
                    c.message_id,
                    serde_json::to_string(&c.tags)?,
                    c.priority.as_str(),
                    c.action_required,
                    c.can_archive,
                    c.confidence as f64,
                    c.model,
                    ts(c.classified_at),
                ],
            )?;

            tx.execute("DELETE FROM message_tags WHERE message_id = ?", [c.message_id])?;
            let mut stmt =
                tx.prepare("INSERT OR IGNORE INTO message_tags (message_id, tag) VALUES (?, ?)")?;
            for tag in &c.tags {
                stmt.execute(params![c.message_id, tag])?;
            }

            tx.execute(
                "UPDATE messages SET labels_pushed = 0, updated_at = ? WHERE id = ?",
                params![now_ts(), c.message_id],
            )?;
            Ok(())
        })
    }

    pub fn get_classification(&self, message_id: i64) -> Result<Option<Classification>> {
        let conn = self.conn.lock().unwrap();
        let c = conn
            .query_row(
                "SELECT message_id, tags, priority, action_required, can_archive,
                        confidence, model, classified_at
                 FROM classifications WHERE message_id = ?",
                [message_id],
                classification_from_row,
            )
            .optional()?;
        Ok(c)
    }

    /// Ids of messages without a classification, oldest first so backlog
    /// drains in arrival order
    pub fn unclassified_message_ids(&self, account_id: &str, limit: usize) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT m.id FROM messages m
             LEFT JOIN classifications c ON c.message_id = m.id
             WHERE m.account_id = ? AND c.message_id IS NULL AND m.folder != 'trash'
             ORDER BY m.received_at ASC
             LIMIT ?",
        )?;
        let ids = stmt
            .query_map(params![account_id, limit as i64], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// All message ids for an account (reclassification entry point)
    pub fn message_ids(&self, account_id: &str) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id FROM messages WHERE account_id = ? ORDER BY received_at ASC",
        )?;
        let ids = stmt
            .query_map([account_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Classified messages whose AI labels have not been pushed upstream
    pub fn label_sync_pending(&self, account_id: &str) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT m.id FROM messages m
             JOIN classifications c ON c.message_id = m.id
             WHERE m.account_id = ? AND m.labels_pushed = 0
             ORDER BY m.id",
        )?;
        let ids = stmt
            .query_map([account_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub fn mark_labels_pushed(&self, message_id: i64, labels: &[String]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE messages SET labels_pushed = 1, provider_labels = ? WHERE id = ?",
            params![serde_json::to_string(labels)?, message_id],
        )?;
        Ok(())
    }

    // === Pending operations ===

    /// Enqueue a provider mutation with dedup semantics: a pending inverse
    /// annihilates both, an identical pending op coalesces, anything else
    /// inserts in FIFO position.
    pub fn enqueue_pending(
        &self,
        account_id: &str,
        message_id: i64,
        provider_id: &str,
        op: PendingOp,
    ) -> Result<EnqueueOutcome> {
        self.transaction(|tx| {
            if let Some(inverse) = op.inverse() {
                let cancelled = tx.execute(
                    "DELETE FROM pending_operations
                     WHERE account_id = ? AND message_id = ? AND op = ? AND status = 'pending'",
                    params![account_id, message_id, inverse.as_str()],
                )?;
                if cancelled > 0 {
                    return Ok(EnqueueOutcome::Annihilated);
                }
            }

            let duplicate: Option<i64> = tx
                .query_row(
                    "SELECT id FROM pending_operations
                     WHERE account_id = ? AND message_id = ? AND op = ? AND status = 'pending'",
                    params![account_id, message_id, op.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            if duplicate.is_some() {
                return Ok(EnqueueOutcome::Coalesced);
            }

            tx.execute(
                "INSERT INTO pending_operations
                 (account_id, message_id, provider_id, op, status, attempts, created_at)
                 VALUES (?, ?, ?, ?, 'pending', 0, ?)",
                params![account_id, message_id, provider_id, op.as_str(), now_ts()],
            )?;
            Ok(EnqueueOutcome::Inserted(tx.last_insert_rowid()))
        })
    }

    /// Pending rows for an account in FIFO order
    pub fn pending_operations(&self, account_id: &str, limit: usize) -> Result<Vec<PendingOperation>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, account_id, message_id, provider_id, op, status, attempts,
                    last_attempt_at, last_error, created_at
             FROM pending_operations
             WHERE account_id = ? AND status = 'pending'
             ORDER BY created_at ASC, id ASC
             LIMIT ?",
        )?;
        let ops = stmt
            .query_map(params![account_id, limit as i64], pending_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ops)
    }

    /// Pending op kinds in flight for a message (conflict detection)
    pub fn pending_ops_for_message(
        &self,
        account_id: &str,
        message_id: i64,
    ) -> Result<Vec<PendingOp>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT op FROM pending_operations
             WHERE account_id = ? AND message_id = ? AND status = 'pending'",
        )?;
        let ops = stmt
            .query_map(params![account_id, message_id], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        ops.iter().map(|s| s.parse()).collect()
    }

    /// Same lookup keyed by the provider id snapshot
    pub fn pending_ops_for_provider_id(
        &self,
        account_id: &str,
        provider_id: &str,
    ) -> Result<Vec<PendingOp>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT op FROM pending_operations
             WHERE account_id = ? AND provider_id = ? AND status = 'pending'",
        )?;
        let ops = stmt
            .query_map(params![account_id, provider_id], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        ops.iter().map(|s| s.parse()).collect()
    }

    /// Delete a pending row after the provider acknowledged it
    pub fn delete_pending(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM pending_operations WHERE id = ?", [id])?;
        Ok(())
    }

    /// Record a drain failure; after three attempts the row is marked
    /// failed and stops retrying. Returns the new status.
    pub fn record_pending_failure(&self, id: i64, error: &str) -> Result<OpStatus> {
        self.transaction(|tx| {
            let attempts: u32 = tx.query_row(
                "SELECT attempts FROM pending_operations WHERE id = ?",
                [id],
                |row| row.get(0),
            )?;
            let attempts = attempts + 1;
            let status = if attempts >= PENDING_MAX_ATTEMPTS {
                OpStatus::Failed
            } else {
                OpStatus::Pending
            };
            tx.execute(
                "UPDATE pending_operations
                 SET attempts = ?, status = ?, last_error = ?, last_attempt_at = ?
                 WHERE id = ?",
                params![attempts, status.as_str(), error, now_ts(), id],
            )?;
            Ok(status)
        })
    }

    pub fn count_pending(&self, account_id: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM pending_operations WHERE account_id = ? AND status = 'pending'",
            [account_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Drop failed rows nobody will retry once they are stale
    pub fn purge_failed_pending(&self, older_than_days: i64) -> Result<usize> {
        let cutoff = ts(Utc::now() - Duration::days(older_than_days));
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM pending_operations WHERE status = 'failed' AND created_at < ?",
            [cutoff],
        )?;
        Ok(n)
    }

    // === Feedback ===

    /// Record a user tag correction. No-op when the sets match. Keeps at
    /// most 100 rows per account by trimming the oldest.
    pub fn record_correction(
        &self,
        account_id: &str,
        message: &Message,
        original_tags: &[String],
        corrected_tags: &[String],
    ) -> Result<Option<i64>> {
        let before: HashSet<&str> = original_tags.iter().map(|s| s.as_str()).collect();
        let after: HashSet<&str> = corrected_tags.iter().map(|s| s.as_str()).collect();
        if before == after {
            return Ok(None);
        }

        self.transaction(|tx| {
            tx.execute(
                "INSERT INTO feedback
                 (account_id, message_id, sender_domain, subject_pattern,
                  original_tags, corrected_tags, context, created_at, used_count)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0)",
                params![
                    account_id,
                    message.id,
                    message.sender.domain(),
                    crate::models::subject_pattern(&message.subject),
                    serde_json::to_string(original_tags)?,
                    serde_json::to_string(corrected_tags)?,
                    crate::models::snippet_of(&message.snippet, 200),
                    now_ts(),
                ],
            )?;
            let id = tx.last_insert_rowid();

            tx.execute(
                "DELETE FROM feedback
                 WHERE account_id = ?1 AND id NOT IN (
                    SELECT id FROM feedback WHERE account_id = ?1
                    ORDER BY created_at DESC, id DESC LIMIT ?2
                 )",
                params![account_id, FEEDBACK_CAP],
            )?;
            Ok(Some(id))
        })
    }

    /// Up to `limit` few-shot examples for a new message: at most three
    /// exact sender-domain matches (newest first), recency-filled from
    /// other domains. Bumps used_count on every returned row.
    pub fn select_examples(
        &self,
        account_id: &str,
        sender_domain: &str,
        limit: usize,
    ) -> Result<Vec<Feedback>> {
        self.transaction(|tx| {
            let mut examples = query_feedback(
                tx,
                "SELECT id, account_id, message_id, sender_domain, subject_pattern,
                        original_tags, corrected_tags, context, created_at, used_count
                 FROM feedback
                 WHERE account_id = ? AND sender_domain = ?
                 ORDER BY created_at DESC, id DESC LIMIT ?",
                params![account_id, sender_domain, limit.min(3) as i64],
            )?;

            let remaining = limit.saturating_sub(examples.len());
            if remaining > 0 {
                let fill = query_feedback(
                    tx,
                    "SELECT id, account_id, message_id, sender_domain, subject_pattern,
                            original_tags, corrected_tags, context, created_at, used_count
                     FROM feedback
                     WHERE account_id = ? AND sender_domain != ?
                     ORDER BY created_at DESC, id DESC LIMIT ?",
                    params![account_id, sender_domain, remaining as i64],
                )?;
                examples.extend(fill);
            }

            let mut stmt =
                tx.prepare("UPDATE feedback SET used_count = used_count + 1 WHERE id = ?")?;
            for example in &mut examples {
                stmt.execute([example.id])?;
                example.used_count += 1;
            }
            Ok(examples)
        })
    }

    pub fn get_feedback(&self, id: i64) -> Result<Option<Feedback>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, account_id, message_id, sender_domain, subject_pattern,
                        original_tags, corrected_tags, context, created_at, used_count
                 FROM feedback WHERE id = ?",
                [id],
                feedback_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn count_feedback(&self, account_id: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM feedback WHERE account_id = ?",
            [account_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Remove feedback older than 90 days or orphaned for more than 30
    pub fn purge_feedback(&self) -> Result<usize> {
        let age_cutoff = ts(Utc::now() - Duration::days(FEEDBACK_MAX_AGE_DAYS));
        let orphan_cutoff = ts(Utc::now() - Duration::days(FEEDBACK_ORPHAN_DAYS));
        self.transaction(|tx| {
            let mut purged = tx.execute("DELETE FROM feedback WHERE created_at < ?", [&age_cutoff])?;
            purged += tx.execute(
                "DELETE FROM feedback WHERE message_id IS NULL AND orphaned_at < ?",
                [&orphan_cutoff],
            )?;
            Ok(purged)
        })
    }
}

/// Column list matching [`message_from_row`]
const MESSAGE_COLUMNS: &str = "m.id, m.account_id, m.provider_id, m.thread_id, m.subject,
    m.sender_name, m.sender_email, m.recipients, m.received_at, m.snippet, m.folder,
    m.original_folder, m.is_unread, m.has_attachments, m.provider_labels, m.created_at,
    m.updated_at";

fn message_from_row(row: &Row) -> rusqlite::Result<Message> {
    let recipients: String = row.get(7)?;
    let folder: String = row.get(10)?;
    let original: Option<String> = row.get(11)?;
    let labels: String = row.get(14)?;
    Ok(Message {
        id: row.get(0)?,
        account_id: row.get(1)?,
        provider_id: row.get(2)?,
        thread_id: row.get(3)?,
        subject: row.get(4)?,
        sender: EmailAddress {
            name: row.get(5)?,
            email: row.get(6)?,
        },
        recipients: serde_json::from_str(&recipients).unwrap_or_default(),
        received_at: parse_ts(&row.get::<_, String>(8)?),
        snippet: row.get(9)?,
        folder: folder.parse().unwrap_or(Folder::Inbox),
        original_folder: original.and_then(|f| f.parse().ok()),
        is_unread: row.get(12)?,
        has_attachments: row.get(13)?,
        provider_labels: serde_json::from_str(&labels).unwrap_or_default(),
        created_at: parse_ts(&row.get::<_, String>(15)?),
        updated_at: parse_ts(&row.get::<_, String>(16)?),
    })
}

fn classification_from_row(row: &Row) -> rusqlite::Result<Classification> {
    let tags: String = row.get(1)?;
    let priority: String = row.get(2)?;
    Ok(Classification {
        message_id: row.get(0)?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        priority: priority.parse().unwrap_or(Priority::Normal),
        action_required: row.get(3)?,
        can_archive: row.get(4)?,
        confidence: row.get::<_, f64>(5)? as f32,
        model: row.get(6)?,
        classified_at: parse_ts(&row.get::<_, String>(7)?),
    })
}

fn pending_from_row(row: &Row) -> rusqlite::Result<PendingOperation> {
    let op: String = row.get(4)?;
    let status: String = row.get(5)?;
    Ok(PendingOperation {
        id: row.get(0)?,
        account_id: row.get(1)?,
        message_id: row.get(2)?,
        provider_id: row.get(3)?,
        op: op.parse().unwrap_or(PendingOp::MarkRead),
        status: status.parse().unwrap_or(OpStatus::Pending),
        attempts: row.get(6)?,
        last_attempt_at: row.get::<_, Option<String>>(7)?.as_deref().map(parse_ts),
        last_error: row.get(8)?,
        created_at: parse_ts(&row.get::<_, String>(9)?),
    })
}

fn feedback_from_row(row: &Row) -> rusqlite::Result<Feedback> {
    let original: String = row.get(5)?;
    let corrected: String = row.get(6)?;
    Ok(Feedback {
        id: row.get(0)?,
        account_id: row.get(1)?,
        message_id: row.get(2)?,
        sender_domain: row.get(3)?,
        subject_pattern: row.get(4)?,
        original_tags: serde_json::from_str(&original).unwrap_or_default(),
        corrected_tags: serde_json::from_str(&corrected).unwrap_or_default(),
        context: row.get(7)?,
        created_at: parse_ts(&row.get::<_, String>(8)?),
        used_count: row.get(9)?,
    })
}

fn query_feedback(
    tx: &Transaction,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Feedback>> {
    let mut stmt = tx.prepare(sql)?;
    let rows = stmt
        .query_map(params, feedback_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Keep the FTS projection aligned with a message row
fn fts_replace(
    tx: &Transaction,
    id: i64,
    subject: &str,
    sender: &EmailAddress,
    snippet: &str,
) -> Result<()> {
    tx.execute("DELETE FROM messages_fts WHERE rowid = ?", [id])?;
    tx.execute(
        "INSERT INTO messages_fts (rowid, subject, sender, snippet) VALUES (?, ?, ?, ?)",
        params![id, subject, sender.display(), snippet],
    )?;
    Ok(())
}

/// Build WHERE clauses + bind args for a message filter.
/// `aliased` controls the `m.` prefix on column names.
fn filter_clauses(
    filter: &MessageFilter,
    aliased: bool,
) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
    let m = if aliased { "m." } else { "" };
    let mut clauses: Vec<String> = Vec::new();
    let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if !filter.accounts.is_empty() {
        clauses.push(format!(
            "{m}account_id IN ({})",
            placeholders(filter.accounts.len())
        ));
        for account in &filter.accounts {
            args.push(Box::new(account.clone()));
        }
    }
    if let Some(folder) = filter.folder {
        clauses.push(format!("{m}folder = ?"));
        args.push(Box::new(folder.as_str().to_string()));
    }
    if !filter.tags.is_empty() {
        // Any-of: an AI tag on the message, or the message's account id
        let tag_ph = placeholders(filter.tags.len());
        clauses.push(format!(
            "({m}id IN (SELECT message_id FROM message_tags WHERE tag IN ({tag_ph}))
              OR {m}account_id IN ({tag_ph2}))",
            tag_ph = tag_ph,
            tag_ph2 = placeholders(filter.tags.len()),
        ));
        for tag in &filter.tags {
            args.push(Box::new(tag.clone()));
        }
        for tag in &filter.tags {
            args.push(Box::new(tag.clone()));
        }
    }
    if filter.unread_only {
        clauses.push(format!("{m}is_unread = 1"));
    }
    if let Some(thread_id) = &filter.thread_id {
        clauses.push(format!("{m}thread_id = ?"));
        args.push(Box::new(thread_id.clone()));
    }
    if let Some(search) = &filter.search
        && !search.trim().is_empty()
    {
        clauses.push(format!(
            "{m}id IN (SELECT rowid FROM messages_fts WHERE messages_fts MATCH ?)"
        ));
        args.push(Box::new(fts_query(search)));
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    (where_sql, args)
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Quote free text into an FTS5 prefix query, one term per token
fn fts_query(search: &str) -> String {
    search
        .split_whitespace()
        .map(|token| format!("\"{}\"*", token.replace('"', "")))
        .collect::<Vec<_>>()
        .join(" ")
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn now_ts() -> String {
    ts(Utc::now())
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use config::ProviderKind;

    fn test_store() -> MessageStore {
        let store = MessageStore::open_in_memory().unwrap();
        let account = Account {
            id: "a1".to_string(),
            email: "me@example.com".to_string(),
            provider: ProviderKind::Gmail,
            credential_file: "/tmp/tok".into(),
            label_prefix: "AI".to_string(),
            label_colors: Default::default(),
            imap: None,
            smtp: None,
            cursor: SyncCursor::empty(ProviderKind::Gmail),
            healthy: true,
            last_synced_at: None,
            last_error: None,
        };
        store.register_account(&account).unwrap();
        store
    }

    fn remote(provider_id: &str, subject: &str, age_hours: i64) -> RemoteMessage {
        RemoteMessage {
            provider_id: provider_id.to_string(),
            thread_id: format!("t-{provider_id}"),
            subject: subject.to_string(),
            sender: EmailAddress::with_name("Sender", "sender@example.com"),
            recipients: vec![EmailAddress::new("me@example.com")],
            received_at: Utc::now() - Duration::hours(age_hours),
            snippet: format!("Snippet for {subject}"),
            folder: Folder::Inbox,
            is_unread: true,
            has_attachments: false,
            labels: vec!["INBOX".to_string()],
        }
    }

    fn classification(message_id: i64, tags: &[&str]) -> Classification {
        Classification {
            message_id,
            tags: tags.iter().map(|s| s.to_string()).collect(),
            priority: Priority::Normal,
            action_required: false,
            can_archive: false,
            confidence: 0.9,
            model: "test".to_string(),
            classified_at: Utc::now(),
        }
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let store = test_store();
        let r = remote("p1", "Hello", 1);
        let (id1, created1) = store.upsert_remote("a1", &r, false, false).unwrap();
        let (id2, created2) = store.upsert_remote("a1", &r, false, false).unwrap();
        assert_eq!(id1, id2);
        assert!(created1);
        assert!(!created2);

        let listed = store.list_messages(&MessageFilter::default()).unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[test]
    fn test_upsert_preserves_pending_fields() {
        let store = test_store();
        let (id, _) = store.upsert_remote("a1", &remote("p1", "Hello", 1), false, false).unwrap();
        store
            .update_message(id, &MessageUpdate { is_unread: Some(false), ..Default::default() })
            .unwrap();

        // Provider still reports unread; local intent is in flight
        store.upsert_remote("a1", &remote("p1", "Hello", 1), true, false).unwrap();
        assert!(!store.get_message(id).unwrap().unwrap().is_unread);

        // Without preservation the provider observation wins
        store.upsert_remote("a1", &remote("p1", "Hello", 1), false, false).unwrap();
        assert!(store.get_message(id).unwrap().unwrap().is_unread);
    }

    #[test]
    fn test_remote_trash_records_restore_target() {
        let store = test_store();
        let (id, _) = store.upsert_remote("a1", &remote("p1", "Hello", 1), false, false).unwrap();

        let mut trashed = remote("p1", "Hello", 1);
        trashed.folder = Folder::Trash;
        store.upsert_remote("a1", &trashed, false, false).unwrap();

        let msg = store.get_message(id).unwrap().unwrap();
        assert_eq!(msg.folder, Folder::Trash);
        assert_eq!(msg.original_folder, Some(Folder::Inbox));
    }

    #[test]
    fn test_list_ordering_newest_first() {
        let store = test_store();
        store.upsert_remote("a1", &remote("p-old", "Old", 5), false, false).unwrap();
        store.upsert_remote("a1", &remote("p-new", "New", 1), false, false).unwrap();

        let listed = store.list_messages(&MessageFilter::default()).unwrap();
        assert_eq!(listed[0].subject, "New");
        assert_eq!(listed[1].subject, "Old");
    }

    #[test]
    fn test_list_ordering_ties_break_on_provider_id() {
        let store = test_store();
        let at = Utc.with_ymd_and_hms(2026, 1, 10, 12, 0, 0).unwrap();
        for pid in ["pa", "pc", "pb"] {
            let mut r = remote(pid, pid, 0);
            r.received_at = at;
            store.upsert_remote("a1", &r, false, false).unwrap();
        }
        let listed = store.list_messages(&MessageFilter::default()).unwrap();
        let ids: Vec<&str> = listed.iter().map(|m| m.provider_id.as_str()).collect();
        assert_eq!(ids, vec!["pc", "pb", "pa"]);
    }

    #[test]
    fn test_search_over_projection() {
        let store = test_store();
        store.upsert_remote("a1", &remote("p1", "Quarterly budget review", 1), false, false).unwrap();
        store.upsert_remote("a1", &remote("p2", "Lunch plans", 1), false, false).unwrap();

        let filter = MessageFilter {
            search: Some("budget".to_string()),
            ..Default::default()
        };
        let listed = store.list_messages(&filter).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].provider_id, "p1");
    }

    #[test]
    fn test_tag_filter_any_of_and_account_tags() {
        let store = test_store();
        let (id1, _) = store.upsert_remote("a1", &remote("p1", "One", 1), false, false).unwrap();
        let (_id2, _) = store.upsert_remote("a1", &remote("p2", "Two", 2), false, false).unwrap();
        store.upsert_classification(&classification(id1, &["finance"])).unwrap();

        let filter = MessageFilter {
            tags: vec!["finance".to_string()],
            ..Default::default()
        };
        assert_eq!(store.list_messages(&filter).unwrap().len(), 1);

        // The account id matches as a tag and selects everything in it
        let filter = MessageFilter {
            tags: vec!["a1".to_string()],
            ..Default::default()
        };
        assert_eq!(store.list_messages(&filter).unwrap().len(), 2);
    }

    #[test]
    fn test_tag_counts() {
        let store = test_store();
        let (id1, _) = store.upsert_remote("a1", &remote("p1", "One", 1), false, false).unwrap();
        let (id2, _) = store.upsert_remote("a1", &remote("p2", "Two", 2), false, false).unwrap();
        store.upsert_classification(&classification(id1, &["finance", "invoice"])).unwrap();
        store.upsert_classification(&classification(id2, &["finance"])).unwrap();

        let counts = store.tag_counts(&MessageFilter::default()).unwrap();
        assert_eq!(counts["finance"], 2);
        assert_eq!(counts["invoice"], 1);
        assert_eq!(counts["a1"], 2);
    }

    #[test]
    fn test_folder_counts() {
        let store = test_store();
        let (id, _) = store.upsert_remote("a1", &remote("p1", "One", 1), false, false).unwrap();
        store.upsert_remote("a1", &remote("p2", "Two", 2), false, false).unwrap();
        store
            .update_message(id, &MessageUpdate { is_unread: Some(false), ..Default::default() })
            .unwrap();

        let counts = store.folder_counts(&[]).unwrap();
        let inbox = counts[&Folder::Inbox];
        assert_eq!(inbox.total, 2);
        assert_eq!(inbox.unread, 1);
    }

    #[test]
    fn test_trash_update_requires_original_folder() {
        let store = test_store();
        let (id, _) = store.upsert_remote("a1", &remote("p1", "One", 1), false, false).unwrap();
        let update = MessageUpdate {
            folder: Some(Folder::Trash),
            ..Default::default()
        };
        assert!(store.update_message(id, &update).is_err());
    }

    #[test]
    fn test_delete_message_orphans_feedback() {
        let store = test_store();
        let (id, _) = store.upsert_remote("a1", &remote("p1", "One", 1), false, false).unwrap();
        let msg = store.get_message(id).unwrap().unwrap();
        let fb = store
            .record_correction("a1", &msg, &["dev".to_string()], &["dev".to_string(), "work".to_string()])
            .unwrap()
            .unwrap();

        store.delete_message(id).unwrap();
        assert!(store.get_message(id).unwrap().is_none());
        let feedback = store.get_feedback(fb).unwrap().unwrap();
        assert_eq!(feedback.message_id, None);
    }

    #[test]
    fn test_enqueue_annihilates_inverse() {
        let store = test_store();
        let out = store.enqueue_pending("a1", 1, "p1", PendingOp::MarkRead).unwrap();
        assert!(matches!(out, EnqueueOutcome::Inserted(_)));
        assert_eq!(store.count_pending("a1").unwrap(), 1);

        let out = store.enqueue_pending("a1", 1, "p1", PendingOp::MarkUnread).unwrap();
        assert_eq!(out, EnqueueOutcome::Annihilated);
        assert_eq!(store.count_pending("a1").unwrap(), 0);
    }

    #[test]
    fn test_enqueue_coalesces_duplicates() {
        let store = test_store();
        store.enqueue_pending("a1", 1, "p1", PendingOp::MarkRead).unwrap();
        let out = store.enqueue_pending("a1", 1, "p1", PendingOp::MarkRead).unwrap();
        assert_eq!(out, EnqueueOutcome::Coalesced);
        assert_eq!(store.count_pending("a1").unwrap(), 1);
    }

    #[test]
    fn test_enqueue_distinct_ops_fifo() {
        let store = test_store();
        store.enqueue_pending("a1", 1, "p1", PendingOp::MarkRead).unwrap();
        store.enqueue_pending("a1", 1, "p1", PendingOp::Trash).unwrap();

        let ops = store.pending_operations("a1", 50).unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].op, PendingOp::MarkRead);
        assert_eq!(ops[1].op, PendingOp::Trash);
    }

    #[test]
    fn test_pending_failure_marks_failed_after_three() {
        let store = test_store();
        let EnqueueOutcome::Inserted(id) =
            store.enqueue_pending("a1", 1, "p1", PendingOp::Trash).unwrap()
        else {
            panic!("expected insert");
        };

        assert_eq!(store.record_pending_failure(id, "boom").unwrap(), OpStatus::Pending);
        assert_eq!(store.record_pending_failure(id, "boom").unwrap(), OpStatus::Pending);
        assert_eq!(store.record_pending_failure(id, "boom").unwrap(), OpStatus::Failed);
        assert!(store.pending_operations("a1", 50).unwrap().is_empty());
    }

    #[test]
    fn test_feedback_cap_trims_oldest() {
        let store = test_store();
        let (id, _) = store.upsert_remote("a1", &remote("p1", "One", 1), false, false).unwrap();
        let msg = store.get_message(id).unwrap().unwrap();
        for i in 0..120 {
            store
                .record_correction(
                    "a1",
                    &msg,
                    &[format!("old{i}")],
                    &[format!("new{i}")],
                )
                .unwrap();
        }
        assert_eq!(store.count_feedback("a1").unwrap(), 100);
    }

    #[test]
    fn test_record_correction_noop_on_equal_sets() {
        let store = test_store();
        let (id, _) = store.upsert_remote("a1", &remote("p1", "One", 1), false, false).unwrap();
        let msg = store.get_message(id).unwrap().unwrap();
        let tags = vec!["dev".to_string(), "work".to_string()];
        let reordered = vec!["work".to_string(), "dev".to_string()];
        assert!(store.record_correction("a1", &msg, &tags, &reordered).unwrap().is_none());
        assert_eq!(store.count_feedback("a1").unwrap(), 0);
    }

    #[test]
    fn test_select_examples_prefers_domain() {
        let store = test_store();
        let (id, _) = store.upsert_remote("a1", &remote("p1", "One", 1), false, false).unwrap();
        let mut msg = store.get_message(id).unwrap().unwrap();

        msg.sender = EmailAddress::new("alerts@github.com");
        for i in 0..4 {
            store
                .record_correction("a1", &msg, &[format!("a{i}")], &[format!("b{i}")])
                .unwrap();
        }
        msg.sender = EmailAddress::new("person@elsewhere.net");
        for i in 0..4 {
            store
                .record_correction("a1", &msg, &[format!("c{i}")], &[format!("d{i}")])
                .unwrap();
        }

        let examples = store.select_examples("a1", "github.com", 5).unwrap();
        assert_eq!(examples.len(), 5);
        // At most three from the exact domain, rest filled by recency
        let domain_hits = examples.iter().filter(|e| e.sender_domain == "github.com").count();
        assert_eq!(domain_hits, 3);
        assert!(examples.iter().all(|e| e.used_count == 1));
    }

    #[test]
    fn test_classification_upsert_replaces_tags() {
        let store = test_store();
        let (id, _) = store.upsert_remote("a1", &remote("p1", "One", 1), false, false).unwrap();
        store.upsert_classification(&classification(id, &["dev"])).unwrap();
        store.upsert_classification(&classification(id, &["finance"])).unwrap();

        let c = store.get_classification(id).unwrap().unwrap();
        assert_eq!(c.tags, vec!["finance"]);

        let counts = store.tag_counts(&MessageFilter::default()).unwrap();
        assert!(!counts.contains_key("dev"));
    }

    #[test]
    fn test_unclassified_and_label_sync_tracking() {
        let store = test_store();
        let (id1, _) = store.upsert_remote("a1", &remote("p1", "One", 2), false, false).unwrap();
        let (id2, _) = store.upsert_remote("a1", &remote("p2", "Two", 1), false, false).unwrap();

        assert_eq!(store.unclassified_message_ids("a1", 100).unwrap(), vec![id1, id2]);

        store.upsert_classification(&classification(id1, &["dev"])).unwrap();
        assert_eq!(store.unclassified_message_ids("a1", 100).unwrap(), vec![id2]);
        assert_eq!(store.label_sync_pending("a1").unwrap(), vec![id1]);

        store
            .mark_labels_pushed(id1, &["INBOX".to_string(), "AI/dev".to_string()])
            .unwrap();
        assert!(store.label_sync_pending("a1").unwrap().is_empty());
        let msg = store.get_message(id1).unwrap().unwrap();
        assert!(msg.provider_labels.contains(&"AI/dev".to_string()));
    }

    #[test]
    fn test_body_round_trip() {
        let store = test_store();
        let (id, _) = store.upsert_remote("a1", &remote("p1", "One", 1), false, false).unwrap();
        assert!(store.get_body(id).unwrap().is_none());

        let body = MessageBody {
            text: Some("plain text".to_string()),
            html: Some("<p>plain text</p>".to_string()),
        };
        store.save_body(id, &body).unwrap();
        assert_eq!(store.get_body(id).unwrap().unwrap(), body);
    }

    #[test]
    fn test_cursor_round_trip() {
        let store = test_store();
        let cursor = SyncCursor::Gmail {
            history_id: Some("12345".to_string()),
            last_sync: None,
        };
        store.save_cursor("a1", &cursor).unwrap();

        let config = config::Config::from_json(
            r#"{"accounts": {"a1": {
                "provider": "gmail", "email": "me@example.com",
                "credentialFile": "/tmp/tok"
            }}}"#,
        )
        .unwrap();
        let mut account = Account::from_config("a1", &config, &config.accounts["a1"]);
        store.hydrate_account(&mut account).unwrap();
        assert_eq!(account.cursor, cursor);
        assert!(account.last_synced_at.is_some());
    }
}
