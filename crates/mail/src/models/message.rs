//! Message model and the logical folder set

use anyhow::bail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An email address with optional display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    pub name: Option<String>,
    pub email: String,
}

impl EmailAddress {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            name: None,
            email: email.into(),
        }
    }

    pub fn with_name(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            email: email.into(),
        }
    }

    /// Parse a header-style address like `Ada Lovelace <ada@example.com>`
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        if let Some(open) = s.rfind('<')
            && let Some(close) = s.rfind('>')
            && open < close
        {
            let name = s[..open].trim().trim_matches('"');
            return Self {
                name: (!name.is_empty()).then(|| name.to_string()),
                email: s[open + 1..close].trim().to_string(),
            };
        }
        Self::new(s)
    }

    /// Host portion after the `@`, lowercased; empty when malformed
    pub fn domain(&self) -> String {
        self.email
            .rsplit_once('@')
            .map(|(_, host)| host.to_ascii_lowercase())
            .unwrap_or_default()
    }

    pub fn display(&self) -> String {
        match &self.name {
            Some(name) => format!("{} <{}>", name, self.email),
            None => self.email.clone(),
        }
    }
}

/// Logical folder a message lives in, mapped from provider-native names
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Folder {
    Inbox,
    Sent,
    Drafts,
    Trash,
    Archive,
}

impl Folder {
    /// Folders the sync engine fetches from the provider
    pub const SYNCED: [Folder; 3] = [Folder::Inbox, Folder::Sent, Folder::Trash];

    pub fn as_str(&self) -> &'static str {
        match self {
            Folder::Inbox => "inbox",
            Folder::Sent => "sent",
            Folder::Drafts => "drafts",
            Folder::Trash => "trash",
            Folder::Archive => "archive",
        }
    }
}

impl std::str::FromStr for Folder {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "inbox" => Ok(Folder::Inbox),
            "sent" => Ok(Folder::Sent),
            "drafts" => Ok(Folder::Drafts),
            "trash" => Ok(Folder::Trash),
            "archive" => Ok(Folder::Archive),
            other => bail!("Unknown folder: {}", other),
        }
    }
}

impl std::fmt::Display for Folder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A mirrored message
///
/// The store is the source of truth for user intent (read state, folder);
/// provider-observed metadata is adopted on fetch unless a pending local
/// operation is still in flight for the same field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Local store id (SQLite rowid)
    pub id: i64,
    pub account_id: String,
    /// Provider-native id (Gmail message id, IMAP folder:uid)
    pub provider_id: String,
    pub thread_id: String,
    pub subject: String,
    pub sender: EmailAddress,
    pub recipients: Vec<EmailAddress>,
    pub received_at: DateTime<Utc>,
    /// First ~200 plaintext characters of the body
    pub snippet: String,
    pub folder: Folder,
    /// Folder the message was in before it was trashed; restore target
    pub original_folder: Option<Folder>,
    pub is_unread: bool,
    pub has_attachments: bool,
    /// Provider label/keyword set observed at last fetch
    pub provider_labels: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Full body content, fetched lazily and cached compressed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageBody {
    pub text: Option<String>,
    pub html: Option<String>,
}

impl MessageBody {
    pub fn is_empty(&self) -> bool {
        self.text.is_none() && self.html.is_none()
    }
}

/// Truncate plaintext to a snippet of at most `max` characters,
/// collapsing whitespace runs
pub fn snippet_of(text: &str, max: usize) -> String {
    let mut out = String::with_capacity(max);
    let mut kept = 0;
    let mut last_was_space = true;
    for c in text.chars() {
        let c = if c.is_whitespace() { ' ' } else { c };
        if c == ' ' && last_was_space {
            continue;
        }
        last_was_space = c == ' ';
        out.push(c);
        kept += 1;
        if kept >= max {
            break;
        }
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_parse_address_with_name() {
        let addr = EmailAddress::parse("Ada Lovelace <ada@example.com>");
        assert_eq!(addr.name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(addr.email, "ada@example.com");
    }

    #[test]
    fn test_parse_bare_address() {
        let addr = EmailAddress::parse("ada@example.com");
        assert_eq!(addr.name, None);
        assert_eq!(addr.email, "ada@example.com");
    }

    #[test]
    fn test_parse_quoted_name() {
        let addr = EmailAddress::parse("\"Billing Dept\" <billing@acme.com>");
        assert_eq!(addr.name.as_deref(), Some("Billing Dept"));
        assert_eq!(addr.email, "billing@acme.com");
    }

    #[test]
    fn test_domain() {
        assert_eq!(EmailAddress::new("alerts@GitHub.com").domain(), "github.com");
        assert_eq!(EmailAddress::new("not-an-address").domain(), "");
    }

    #[test]
    fn test_folder_round_trip() {
        for folder in [Folder::Inbox, Folder::Sent, Folder::Drafts, Folder::Trash, Folder::Archive] {
            assert_eq!(Folder::from_str(folder.as_str()).unwrap(), folder);
        }
        assert!(Folder::from_str("junk").is_err());
    }

    #[test]
    fn test_snippet_collapses_whitespace() {
        assert_eq!(snippet_of("Hello\n\n  world  ", 200), "Hello world");
    }

    #[test]
    fn test_snippet_truncates() {
        let long = "a".repeat(500);
        assert_eq!(snippet_of(&long, 200).len(), 200);
    }
}
