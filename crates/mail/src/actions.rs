//! User-initiated mutations
//!
//! Every mutation lands in the store synchronously (the UI sees it at
//! once) and enqueues the provider-side work as a pending operation; the
//! next sync cycle converges the remote. Tag edits additionally feed the
//! correction history that biases future classifications.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use log::info;

use crate::events::EventBus;
use crate::models::{Classification, Folder, Message, PendingOp, Priority};
use crate::provider::{OutgoingMessage, Provider, ProviderError};
use crate::store::{MessageStore, MessageUpdate};

pub struct ActionHandler {
    store: Arc<MessageStore>,
    #[allow(dead_code)]
    bus: Arc<EventBus>,
}

impl ActionHandler {
    pub fn new(store: Arc<MessageStore>, bus: Arc<EventBus>) -> Self {
        Self { store, bus }
    }

    fn message(&self, message_id: i64) -> Result<Message> {
        self.store
            .get_message(message_id)?
            .with_context(|| format!("no message {message_id}"))
    }

    /// Set the read state locally and queue the provider flag change
    pub fn mark_read(&self, message_id: i64, is_unread: bool) -> Result<Message> {
        let message = self.message(message_id)?;
        let updated = self.store.update_message(
            message_id,
            &MessageUpdate {
                is_unread: Some(is_unread),
                ..Default::default()
            },
        )?;
        let op = if is_unread {
            PendingOp::MarkUnread
        } else {
            PendingOp::MarkRead
        };
        self.store
            .enqueue_pending(&message.account_id, message_id, &message.provider_id, op)?;
        Ok(updated)
    }

    /// Move to trash, remembering the folder to restore into
    pub fn trash(&self, message_id: i64) -> Result<Message> {
        let message = self.message(message_id)?;
        if message.folder == Folder::Trash {
            return Ok(message);
        }
        let updated = self.store.update_message(
            message_id,
            &MessageUpdate {
                folder: Some(Folder::Trash),
                original_folder: Some(Some(message.folder)),
                ..Default::default()
            },
        )?;
        self.store.enqueue_pending(
            &message.account_id,
            message_id,
            &message.provider_id,
            PendingOp::Trash,
        )?;
        Ok(updated)
    }

    /// Move back out of trash into the remembered folder
    pub fn restore(&self, message_id: i64) -> Result<Message> {
        let message = self.message(message_id)?;
        if message.folder != Folder::Trash {
            return Ok(message);
        }
        let target = message.original_folder.unwrap_or(Folder::Inbox);
        let updated = self.store.update_message(
            message_id,
            &MessageUpdate {
                folder: Some(target),
                original_folder: Some(None),
                ..Default::default()
            },
        )?;
        self.store.enqueue_pending(
            &message.account_id,
            message_id,
            &message.provider_id,
            PendingOp::Restore,
        )?;
        Ok(updated)
    }

    /// Remove the message locally and queue the unrecoverable provider
    /// delete. The provider-id snapshot on the queue row outlives the row
    /// being deleted here.
    pub fn permanent_delete(&self, message_id: i64) -> Result<()> {
        let message = self.message(message_id)?;
        self.store.enqueue_pending(
            &message.account_id,
            message_id,
            &message.provider_id,
            PendingOp::PermanentDelete,
        )?;
        self.store.delete_message(message_id)?;
        info!("Permanently deleted message {message_id} locally");
        Ok(())
    }

    /// Replace a message's tag set. A real change is recorded as feedback
    /// (the few-shot history) and flags the message for provider label
    /// reconciliation on the next cycle.
    pub fn update_tags(&self, message_id: i64, new_tags: Vec<String>) -> Result<Classification> {
        for tag in &new_tags {
            if !config::is_valid_tag(tag) {
                bail!("{tag:?} is not a valid tag");
            }
        }

        let message = self.message(message_id)?;
        let existing = self.store.get_classification(message_id)?;
        let original_tags = existing
            .as_ref()
            .map(|c| c.tags.clone())
            .unwrap_or_default();

        self.store
            .record_correction(&message.account_id, &message, &original_tags, &new_tags)?;

        let classification = match existing {
            Some(mut c) => {
                c.tags = new_tags;
                c.classified_at = Utc::now();
                c
            }
            None => Classification {
                message_id,
                tags: new_tags,
                priority: Priority::Normal,
                action_required: false,
                can_archive: false,
                confidence: 1.0,
                model: "user".to_string(),
                classified_at: Utc::now(),
            },
        };
        self.store.upsert_classification(&classification)?;
        Ok(classification)
    }

    /// Deliver an outgoing message through the account's provider.
    /// No durable outbound queue: one retry, then the error surfaces.
    pub fn send(
        &self,
        provider: &mut dyn Provider,
        outgoing: &OutgoingMessage,
    ) -> Result<String> {
        match provider.send(outgoing) {
            Ok(id) => Ok(id),
            Err(e) if e.is_retryable() => {
                info!("Send failed ({e}); retrying once");
                provider.send(outgoing).map_err(|e: ProviderError| e.into())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Account, EmailAddress, SyncCursor};
    use crate::provider::RemoteMessage;
    use crate::store::EnqueueOutcome;
    use config::ProviderKind;

    fn handler_with_message() -> (ActionHandler, Arc<MessageStore>, i64) {
        let store = Arc::new(MessageStore::open_in_memory().unwrap());
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

        let remote = RemoteMessage {
            provider_id: "p1".to_string(),
            thread_id: "t1".to_string(),
            subject: "Hello".to_string(),
            sender: EmailAddress::new("sender@example.com"),
            recipients: vec![],
            received_at: Utc::now(),
            snippet: "hi".to_string(),
            folder: Folder::Inbox,
            is_unread: true,
            has_attachments: false,
            labels: vec![],
        };
        let (id, _) = store.upsert_remote("a1", &remote, false, false).unwrap();

        let bus = Arc::new(EventBus::new());
        (ActionHandler::new(store.clone(), bus), store, id)
    }

    #[test]
    fn test_mark_read_updates_store_and_queues() {
        let (handler, store, id) = handler_with_message();
        let updated = handler.mark_read(id, false).unwrap();
        assert!(!updated.is_unread);

        let ops = store.pending_operations("a1", 50).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].op, PendingOp::MarkRead);
    }

    #[test]
    fn test_read_then_unread_cancels_out() {
        let (handler, store, id) = handler_with_message();
        handler.mark_read(id, false).unwrap();
        let updated = handler.mark_read(id, true).unwrap();

        assert!(updated.is_unread);
        assert_eq!(store.count_pending("a1").unwrap(), 0);
    }

    #[test]
    fn test_trash_then_restore_round_trips() {
        let (handler, store, id) = handler_with_message();

        let trashed = handler.trash(id).unwrap();
        assert_eq!(trashed.folder, Folder::Trash);
        assert_eq!(trashed.original_folder, Some(Folder::Inbox));
        assert_eq!(store.count_pending("a1").unwrap(), 1);

        let restored = handler.restore(id).unwrap();
        assert_eq!(restored.folder, Folder::Inbox);
        assert_eq!(restored.original_folder, None);
        assert_eq!(store.count_pending("a1").unwrap(), 0);
    }

    #[test]
    fn test_permanent_delete_keeps_provider_snapshot() {
        let (handler, store, id) = handler_with_message();
        handler.permanent_delete(id).unwrap();

        assert!(store.get_message(id).unwrap().is_none());
        let ops = store.pending_operations("a1", 50).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].op, PendingOp::PermanentDelete);
        assert_eq!(ops[0].provider_id, "p1");
    }

    #[test]
    fn test_update_tags_records_feedback_once() {
        let (handler, store, id) = handler_with_message();
        store
            .upsert_classification(&Classification {
                message_id: id,
                tags: vec!["dev".to_string()],
                priority: Priority::Normal,
                action_required: false,
                can_archive: false,
                confidence: 0.9,
                model: "m".to_string(),
                classified_at: Utc::now(),
            })
            .unwrap();

        let tags = vec!["dev".to_string(), "work".to_string()];
        let updated = handler.update_tags(id, tags.clone()).unwrap();
        assert_eq!(updated.tags, tags);
        assert_eq!(store.count_feedback("a1").unwrap(), 1);

        // Re-submitting the same set records nothing new
        handler.update_tags(id, tags).unwrap();
        assert_eq!(store.count_feedback("a1").unwrap(), 1);
    }

    #[test]
    fn test_update_tags_rejects_invalid_tokens() {
        let (handler, _store, id) = handler_with_message();
        assert!(handler.update_tags(id, vec!["Not Valid".to_string()]).is_err());
    }

    #[test]
    fn test_trash_enqueue_is_idempotent() {
        let (handler, store, id) = handler_with_message();
        handler.trash(id).unwrap();
        handler.trash(id).unwrap();
        assert_eq!(store.count_pending("a1").unwrap(), 1);

        // Direct duplicate enqueue coalesces too
        let message = store.get_message(id).unwrap().unwrap();
        let out = store
            .enqueue_pending("a1", id, &message.provider_id, PendingOp::Trash)
            .unwrap();
        assert_eq!(out, EnqueueOutcome::Coalesced);
    }
}
