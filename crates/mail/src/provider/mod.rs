//! Provider abstraction over heterogeneous mail backends
//!
//! One interface covers everything the sync engine and the pending-ops
//! queue need: incremental fetch, flag/label mutation, folder moves,
//! deletion, and send. Gmail speaks the vendor REST API; IMAP speaks the
//! wire protocol with keyword flags standing in for labels.

mod credentials;
mod gmail;
mod imap;
mod retry;

pub use credentials::{Credentials, read_credentials, write_oauth_token};
pub use gmail::GmailProvider;
pub use imap::ImapProvider;
pub use retry::RetryPolicy;

use std::time::Duration;

use chrono::{DateTime, Utc};
use config::ProviderKind;

use crate::models::{Account, EmailAddress, Folder, MessageBody, SyncCursor};

/// Error taxonomy every provider surfaces
///
/// The retry policy keys off these kinds: only `Transient` and
/// `RateLimited` are retried; `AuthRequired` marks the account unhealthy
/// for the cycle.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("authentication required: {0}")]
    AuthRequired(String),
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("transient network error: {0}")]
    Transient(String),
    #[error("permanent protocol error: {0}")]
    Permanent(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("capability unsupported: {0}")]
    Unsupported(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Transient(_) | ProviderError::RateLimited { .. }
        )
    }
}

/// Flags and labels the queue pushes to providers
///
/// `Seen`/`Unread` map to the provider's native read state (the `\Seen`
/// IMAP flag, the `UNREAD` Gmail label); `Label` carries a mirrored AI
/// label or keyword by full name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailFlag {
    Seen,
    Unread,
    Label(String),
}

/// A message as observed at the provider
#[derive(Debug, Clone)]
pub struct RemoteMessage {
    pub provider_id: String,
    pub thread_id: String,
    pub subject: String,
    pub sender: EmailAddress,
    pub recipients: Vec<EmailAddress>,
    pub received_at: DateTime<Utc>,
    pub snippet: String,
    pub folder: Folder,
    pub is_unread: bool,
    pub has_attachments: bool,
    /// Provider-native labels/keywords on the message
    pub labels: Vec<String>,
}

/// Result of one incremental fetch step
#[derive(Debug, Clone)]
pub struct FetchDelta {
    pub messages: Vec<RemoteMessage>,
    /// Cursor to persist once the cycle commits
    pub cursor: SyncCursor,
    /// False when `max` truncated the delta and more remains
    pub complete: bool,
}

impl FetchDelta {
    /// A delta that observed nothing and leaves the cursor in place
    pub fn empty(cursor: SyncCursor) -> Self {
        Self {
            messages: Vec::new(),
            cursor,
            complete: true,
        }
    }
}

/// An RFC 5322 message to deliver
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub from: EmailAddress,
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub subject: String,
    pub body_text: String,
    pub body_html: Option<String>,
    pub in_reply_to: Option<String>,
}

/// Capability set every provider implements
///
/// Methods take `&mut self` because IMAP sessions are stateful; the sync
/// engine owns one provider per account per cycle.
pub trait Provider: Send {
    /// Validate credentials, refreshing OAuth tokens when possible.
    /// Fails with [`ProviderError::AuthRequired`] when revoked.
    fn authenticate(&mut self) -> Result<(), ProviderError>;

    /// Logical folders available on the remote
    fn list_folders(&mut self) -> Result<Vec<Folder>, ProviderError>;

    /// Fetch at most `max` new or changed messages in `folder` since
    /// `cursor`, returning the advanced cursor
    fn fetch_delta(
        &mut self,
        cursor: &SyncCursor,
        folder: Folder,
        max: usize,
    ) -> Result<FetchDelta, ProviderError>;

    /// Full body parts decoded to UTF-8
    fn fetch_body(&mut self, provider_id: &str) -> Result<MessageBody, ProviderError>;

    /// Add/remove provider-native flags, labels, or keywords
    fn set_flags(
        &mut self,
        provider_id: &str,
        add: &[MailFlag],
        remove: &[MailFlag],
    ) -> Result<(), ProviderError>;

    /// Move a message between logical folders
    fn move_message(
        &mut self,
        provider_id: &str,
        from: Folder,
        to: Folder,
    ) -> Result<(), ProviderError>;

    /// Unrecoverable removal at the provider
    fn permanent_delete(&mut self, provider_id: &str) -> Result<(), ProviderError>;

    /// Deliver a message; returns the new provider id
    fn send(&mut self, outgoing: &OutgoingMessage) -> Result<String, ProviderError>;

    /// Whether arbitrary labels/keywords can be written
    fn supports_keywords(&self) -> bool;

    /// Whether the remote can push change notifications
    fn supports_idle(&self) -> bool;
}

/// Construct the provider for an account. No network traffic happens
/// until [`Provider::authenticate`] is called.
pub fn provider_for(account: &Account) -> Result<Box<dyn Provider>, ProviderError> {
    match account.provider {
        ProviderKind::Gmail => Ok(Box::new(GmailProvider::new(account))),
        ProviderKind::Imap => Ok(Box::new(ImapProvider::new(account)?)),
    }
}

/// Build an outgoing message as a lettre [`lettre::Message`]
pub(crate) fn build_lettre_message(
    outgoing: &OutgoingMessage,
) -> Result<lettre::Message, ProviderError> {
    use lettre::message::MultiPart;

    let mut builder = lettre::Message::builder()
        .from(mailbox(&outgoing.from)?)
        .subject(outgoing.subject.clone());
    for to in &outgoing.to {
        builder = builder.to(mailbox(to)?);
    }
    for cc in &outgoing.cc {
        builder = builder.cc(mailbox(cc)?);
    }
    if let Some(in_reply_to) = &outgoing.in_reply_to {
        builder = builder.in_reply_to(in_reply_to.clone());
    }

    match &outgoing.body_html {
        Some(html) => builder.multipart(MultiPart::alternative_plain_html(
            outgoing.body_text.clone(),
            html.clone(),
        )),
        None => builder.body(outgoing.body_text.clone()),
    }
    .map_err(|e| ProviderError::Permanent(format!("cannot build message: {e}")))
}

/// Render an outgoing message to RFC 5322 bytes
pub(crate) fn build_rfc5322(outgoing: &OutgoingMessage) -> Result<Vec<u8>, ProviderError> {
    Ok(build_lettre_message(outgoing)?.formatted())
}

pub(crate) fn mailbox(
    addr: &EmailAddress,
) -> Result<lettre::message::Mailbox, ProviderError> {
    let parsed: lettre::Address = addr
        .email
        .parse()
        .map_err(|e| ProviderError::Permanent(format!("invalid address {}: {e}", addr.email)))?;
    Ok(lettre::message::Mailbox::new(addr.name.clone(), parsed))
}

/// Decode header/body bytes to UTF-8, tolerating ISO-8859-1 and
/// Windows-1252 the way mail in the wild requires
pub(crate) fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| cp1252_char(b)).collect(),
    }
}

/// Windows-1252 superset of Latin-1: the 0x80..0x9F block carries
/// punctuation instead of C1 controls
fn cp1252_char(b: u8) -> char {
    match b {
        0x80 => '€',
        0x82 => '‚',
        0x83 => 'ƒ',
        0x84 => '„',
        0x85 => '…',
        0x86 => '†',
        0x87 => '‡',
        0x88 => 'ˆ',
        0x89 => '‰',
        0x8A => 'Š',
        0x8B => '‹',
        0x8C => 'Œ',
        0x8E => 'Ž',
        0x91 => '‘',
        0x92 => '’',
        0x93 => '“',
        0x94 => '”',
        0x95 => '•',
        0x96 => '–',
        0x97 => '—',
        0x98 => '˜',
        0x99 => '™',
        0x9A => 'š',
        0x9B => '›',
        0x9C => 'œ',
        0x9E => 'ž',
        0x9F => 'Ÿ',
        other => other as char,
    }
}
