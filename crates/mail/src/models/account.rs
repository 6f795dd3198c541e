//! Account model: configuration plus per-account sync state

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use config::{AccountConfig, Config, ImapConfig, ProviderKind, SmtpConfig};

use super::SyncCursor;

/// A configured mail account with its persisted runtime state
///
/// The configuration half is rebuilt from the config document on every
/// trigger; the runtime half (cursor, health, last sync) round-trips
/// through the store.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub email: String,
    pub provider: ProviderKind,
    pub credential_file: PathBuf,
    /// Prefix for provider labels mirrored from AI tags, e.g. `AI` -> `AI/work`
    pub label_prefix: String,
    /// Tag -> Gmail label color overrides
    pub label_colors: BTreeMap<String, String>,
    pub imap: Option<ImapConfig>,
    pub smtp: Option<SmtpConfig>,
    /// Incremental fetch position; provider-specific
    pub cursor: SyncCursor,
    pub healthy: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Account {
    /// Build an account from its config entry, with fresh runtime state
    pub fn from_config(id: &str, config: &Config, account: &AccountConfig) -> Self {
        Self {
            id: id.to_string(),
            email: account.email.clone(),
            provider: account.provider,
            credential_file: account.credential_file.clone(),
            label_prefix: config.label_prefix(account).to_string(),
            label_colors: config.label_colors(account),
            imap: account.imap.clone(),
            smtp: account.smtp.clone(),
            cursor: SyncCursor::empty(account.provider),
            healthy: true,
            last_synced_at: None,
            last_error: None,
        }
    }

    /// Provider label name for an AI tag (`AI` + `work` -> `AI/work`)
    pub fn label_for_tag(&self, tag: &str) -> String {
        if self.label_prefix.is_empty() {
            tag.to_string()
        } else {
            format!("{}/{}", self.label_prefix, tag)
        }
    }

    /// Inverse of [`label_for_tag`]: the tag a mirrored label encodes, if any
    pub fn tag_for_label<'a>(&self, label: &'a str) -> Option<&'a str> {
        if self.label_prefix.is_empty() {
            return Some(label);
        }
        label
            .strip_prefix(self.label_prefix.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
    }
}
