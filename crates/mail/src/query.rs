//! Read-side query interface for the façade
//!
//! Thin, composable functions over the store: filtered message pages
//! with their classifications, sidebar aggregates, and single-message
//! reads that pull the body through the provider on first touch.

use std::collections::BTreeMap;

use anyhow::Result;

use crate::models::{Classification, Folder, Message, MessageBody};
use crate::provider::Provider;
use crate::store::{FolderCounts, MessageFilter, MessageStore};

/// A message joined with its classification, as the UI renders it
#[derive(Debug, Clone)]
pub struct MessageView {
    pub message: Message,
    pub classification: Option<Classification>,
}

/// Paginated, filtered message listing, newest first
pub fn list_messages(store: &MessageStore, filter: &MessageFilter) -> Result<Vec<MessageView>> {
    let messages = store.list_messages(filter)?;
    let mut views = Vec::with_capacity(messages.len());
    for message in messages {
        let classification = store.get_classification(message.id)?;
        views.push(MessageView {
            message,
            classification,
        });
    }
    Ok(views)
}

/// Tag -> count for the sidebar, scoped by the non-tag filters
pub fn tag_counts(store: &MessageStore, filter: &MessageFilter) -> Result<BTreeMap<String, i64>> {
    store.tag_counts(filter)
}

/// Folder -> {total, unread} for the sidebar
pub fn folder_counts(
    store: &MessageStore,
    accounts: &[String],
) -> Result<BTreeMap<Folder, FolderCounts>> {
    store.folder_counts(accounts)
}

/// One message with its body, fetching and caching the body on first
/// read. Pass the account's provider when a network fetch is acceptable.
pub fn get_message_with_body(
    store: &MessageStore,
    provider: Option<&mut dyn Provider>,
    message_id: i64,
) -> Result<Option<(MessageView, MessageBody)>> {
    let Some(message) = store.get_message(message_id)? else {
        return Ok(None);
    };
    let classification = store.get_classification(message_id)?;

    let body = match store.get_body(message_id)? {
        Some(body) => body,
        None => match provider {
            Some(provider) => {
                let body = provider.fetch_body(&message.provider_id)?;
                store.save_body(message_id, &body)?;
                body
            }
            None => MessageBody::default(),
        },
    };

    Ok(Some((
        MessageView {
            message,
            classification,
        },
        body,
    )))
}
