//! Pending-ops queue drain
//!
//! Enqueue semantics (annihilation, coalescing, FIFO) live in the store;
//! this module pushes pending rows to the provider at the start of a sync
//! cycle. Rows are retired on success, retried up to three times on
//! failure, then marked failed and announced on the bus. One row's
//! failure never aborts the drain.

use anyhow::Result;
use log::{debug, info, warn};

use crate::events::{Event, EventBus};
use crate::models::{Folder, OpStatus, PendingOp, PendingOperation};
use crate::provider::{MailFlag, Provider, ProviderError, RetryPolicy};
use crate::store::MessageStore;

/// Rows processed per drain
const DRAIN_BATCH: usize = 50;

/// Push pending operations for one account. Returns the completed and
/// retired rows; the fetch step uses them to tell provider-observed
/// changes apart from echoes of our own writes.
pub fn drain(
    store: &MessageStore,
    bus: &EventBus,
    provider: &mut dyn Provider,
    retry: &RetryPolicy,
    account_id: &str,
) -> Result<Vec<PendingOperation>> {
    let ops = store.pending_operations(account_id, DRAIN_BATCH)?;
    if ops.is_empty() {
        return Ok(Vec::new());
    }
    debug!("Draining {} pending operations for {account_id}", ops.len());

    let mut completed = Vec::new();
    for op in ops {
        match push_op(store, provider, retry, &op) {
            Ok(()) => {
                store.delete_pending(op.id)?;
                completed.push(op);
            }
            Err(e) => {
                warn!(
                    "Pending {} on message {} failed (attempt {}): {e}",
                    op.op.as_str(),
                    op.message_id,
                    op.attempts + 1
                );
                let status = store.record_pending_failure(op.id, &e.to_string())?;
                if status == OpStatus::Failed {
                    info!(
                        "Pending {} on message {} gave up after {} attempts",
                        op.op.as_str(),
                        op.message_id,
                        op.attempts + 1
                    );
                    bus.publish(Event::PendingFailed {
                        operation_id: op.id,
                        error: e.to_string(),
                    });
                }
            }
        }
    }
    Ok(completed)
}

/// Map one pending row onto the corresponding provider call
fn push_op(
    store: &MessageStore,
    provider: &mut dyn Provider,
    retry: &RetryPolicy,
    op: &PendingOperation,
) -> Result<(), ProviderError> {
    let result = match op.op {
        PendingOp::MarkRead => retry.run("mark_read", || {
            provider.set_flags(&op.provider_id, &[MailFlag::Seen], &[MailFlag::Unread])
        }),
        PendingOp::MarkUnread => retry.run("mark_unread", || {
            provider.set_flags(&op.provider_id, &[MailFlag::Unread], &[MailFlag::Seen])
        }),
        PendingOp::Trash => {
            // The local row already sits in trash; its previous folder is
            // the move source
            let Some(message) = lookup(store, op)? else {
                return Ok(());
            };
            let from = message.original_folder.unwrap_or(Folder::Inbox);
            retry.run("trash", || {
                provider.move_message(&op.provider_id, from, Folder::Trash)
            })
        }
        PendingOp::Restore => {
            // The local row was already restored; its current folder is
            // the move target
            let Some(message) = lookup(store, op)? else {
                return Ok(());
            };
            retry.run("restore", || {
                provider.move_message(&op.provider_id, Folder::Trash, message.folder)
            })
        }
        PendingOp::PermanentDelete => retry.run("permanent_delete", || {
            provider.permanent_delete(&op.provider_id)
        }),
    };

    match result {
        // A message that vanished remotely has nothing left to converge
        Err(ProviderError::NotFound(msg)) => {
            debug!("Pending {} target already gone: {msg}", op.op.as_str());
            Ok(())
        }
        other => other,
    }
}

/// Fetch the local message a move op needs; a missing row means the
/// message was permanently deleted and the move is moot
fn lookup(
    store: &MessageStore,
    op: &PendingOperation,
) -> Result<Option<crate::models::Message>, ProviderError> {
    let message = store
        .get_message(op.message_id)
        .map_err(|e| ProviderError::Permanent(format!("store read failed: {e}")))?;
    if message.is_none() {
        debug!(
            "Pending {} references deleted message {}; dropping",
            op.op.as_str(),
            op.message_id
        );
    }
    Ok(message)
}
