//! Configuration loading for the sift mail service
//!
//! The service reads a single read-only JSON document at startup describing
//! the database location, AI classification settings, sync tuning, and the
//! set of mail accounts. This crate owns the schema, the defaults, and the
//! validation; it knows nothing about providers or storage.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Configuration filename in the sift config directory
const CONFIG_FILE: &str = "config.json";

/// Get the sift config directory (~/.config/sift/)
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("sift"))
}

/// Get the path to a file within the sift config directory
pub fn config_path(filename: &str) -> Option<PathBuf> {
    config_dir().map(|p| p.join(filename))
}

/// Ensure the sift config directory exists
pub fn ensure_config_dir() -> Result<PathBuf> {
    let dir = config_dir().context("Could not determine config directory")?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
    Ok(dir)
}

/// Which remote protocol an account speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Gmail,
    Imap,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Gmail => "gmail",
            ProviderKind::Imap => "imap",
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gmail" => Ok(ProviderKind::Gmail),
            "imap" => Ok(ProviderKind::Imap),
            other => bail!("Unknown provider kind: {}", other),
        }
    }
}

/// Top-level service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    /// Path to the SQLite store. Defaults to `<config dir>/sift.db`.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    /// Account id -> account settings. Ids are opaque and stable.
    pub accounts: BTreeMap<String, AccountConfig>,
}

/// AI classification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AiConfig {
    /// When false, sync runs but skips classification entirely.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_model")]
    pub model: String,
    /// Local LLM endpoint (Ollama-style JSON API).
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Whether the built-in taxonomy is included.
    #[serde(default = "default_true")]
    pub use_default_tags: bool,
    /// Additional taxonomy entries appended to the defaults.
    #[serde(default)]
    pub tags: Vec<TagSpec>,
    /// Entries removed from the default taxonomy.
    #[serde(default)]
    pub exclude_tags: Vec<String>,
    /// Prefix prepended to provider labels mirrored from AI tags.
    #[serde(default = "default_label_prefix")]
    pub label_prefix: String,
    /// Gmail label color overrides, tag name -> hex color.
    #[serde(default)]
    pub label_colors: BTreeMap<String, String>,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: default_model(),
            endpoint: default_endpoint(),
            temperature: default_temperature(),
            use_default_tags: true,
            tags: Vec::new(),
            exclude_tags: Vec::new(),
            label_prefix: default_label_prefix(),
            label_colors: BTreeMap::new(),
        }
    }
}

/// A taxonomy entry: the tag token and the description shown to the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagSpec {
    pub name: String,
    pub description: String,
}

/// Sync engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SyncConfig {
    /// Cap on messages fetched per account per cycle.
    #[serde(default = "default_max_messages")]
    pub max_messages_per_sync: usize,
    /// Seconds between periodic sync triggers.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_messages_per_sync: default_max_messages(),
            interval_secs: default_interval_secs(),
        }
    }
}

/// Per-account configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AccountConfig {
    pub provider: ProviderKind,
    pub email: String,
    /// Path to the credential file (OAuth token bundle or password).
    pub credential_file: PathBuf,
    /// IMAP server settings; required when provider is imap.
    #[serde(default)]
    pub imap: Option<ImapConfig>,
    /// SMTP relay for outgoing mail on imap accounts.
    #[serde(default)]
    pub smtp: Option<SmtpConfig>,
    /// Per-account label overrides.
    #[serde(default)]
    pub labels: Option<LabelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ImapConfig {
    pub host: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    /// Defaults to the account email when absent.
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LabelConfig {
    pub prefix: Option<String>,
    #[serde(default)]
    pub colors: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

fn default_model() -> String {
    "llama3.2".to_string()
}

fn default_endpoint() -> String {
    "http://127.0.0.1:11434".to_string()
}

fn default_temperature() -> f32 {
    0.3
}

fn default_label_prefix() -> String {
    "AI".to_string()
}

fn default_max_messages() -> usize {
    100
}

fn default_interval_secs() -> u64 {
    180
}

fn default_imap_port() -> u16 {
    993
}

fn default_smtp_port() -> u16 {
    587
}

impl Config {
    /// Load configuration from an explicit path, or from the default
    /// location (~/.config/sift/config.json) when `path` is None.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => config_path(CONFIG_FILE).context("Could not determine config directory")?,
        };
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config = Self::from_json(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Parse and validate configuration from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json).context("Invalid config JSON")?;
        config.validate()?;
        Ok(config)
    }

    /// Resolved database file, defaulting into the config directory
    pub fn database_file(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(p) => Ok(p.clone()),
            None => config_path("sift.db").context("Could not determine config directory"),
        }
    }

    /// Effective label prefix for an account (account override wins)
    pub fn label_prefix<'a>(&'a self, account: &'a AccountConfig) -> &'a str {
        account
            .labels
            .as_ref()
            .and_then(|l| l.prefix.as_deref())
            .unwrap_or(&self.ai.label_prefix)
    }

    /// Effective label color map for an account (account entries win)
    pub fn label_colors(&self, account: &AccountConfig) -> BTreeMap<String, String> {
        let mut colors = self.ai.label_colors.clone();
        if let Some(labels) = &account.labels {
            for (tag, color) in &labels.colors {
                colors.insert(tag.clone(), color.clone());
            }
        }
        colors
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=2.0).contains(&self.ai.temperature) {
            bail!("ai.temperature must be between 0.0 and 2.0");
        }
        if self.sync.max_messages_per_sync == 0 {
            bail!("sync.maxMessagesPerSync must be at least 1");
        }
        for (id, account) in &self.accounts {
            if id.trim().is_empty() {
                bail!("Account ids must be non-empty");
            }
            if !account.email.contains('@') {
                bail!("Account {}: email {:?} is not an address", id, account.email);
            }
            if account.provider == ProviderKind::Imap && account.imap.is_none() {
                bail!("Account {}: imap server settings are required", id);
            }
        }
        for tag in &self.ai.tags {
            if !is_valid_tag(&tag.name) {
                bail!("Taxonomy tag {:?} is not lowercase alphanumeric-with-hyphen", tag.name);
            }
        }
        Ok(())
    }
}

/// Tags are lowercase alphanumeric tokens with interior hyphens
pub fn is_valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}
