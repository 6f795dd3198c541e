//! Mail crate - AI-augmented mailbox orchestration
//!
//! This crate keeps a local, searchable mirror of remote mailboxes
//! consistent with both the providers and a set of AI-derived labels:
//! - Domain models (Account, Message, Classification, PendingOperation)
//! - Provider abstraction over Gmail (REST) and IMAP
//! - Transactional SQLite store with a full-text projection
//! - LLM classifier with a per-account few-shot feedback loop
//! - Pending-ops queue decoupling user actions from the providers
//! - Per-account sync engine and a process-local event bus
//!
//! The HTTP/WebSocket façade lives elsewhere; this crate exposes the
//! query, mutation, and event-subscription surfaces it consumes.

pub mod actions;
pub mod classify;
pub mod events;
pub mod models;
pub mod provider;
pub mod query;
pub mod queue;
pub mod service;
pub mod store;
pub mod sync;

pub use actions::ActionHandler;
pub use classify::{Classify, ClassifyInput, LlmClassifier, Taxonomy};
pub use events::{Event, EventBus, EventReceiver};
pub use models::{
    Account, Classification, EmailAddress, Feedback, Folder, Message, MessageBody, OpStatus,
    PendingOp, PendingOperation, Priority, SyncCursor,
};
pub use provider::{
    FetchDelta, GmailProvider, ImapProvider, MailFlag, OutgoingMessage, Provider, ProviderError,
    RemoteMessage, RetryPolicy, provider_for,
};
pub use query::MessageView;
pub use service::MailService;
pub use store::{EnqueueOutcome, FolderCounts, MessageFilter, MessageStore, MessageUpdate};
pub use sync::{SyncContext, SyncStats, reclassify_account, sync_account};
