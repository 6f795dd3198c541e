//! Credential file handling
//!
//! A credential file is either a JSON OAuth token bundle (gmail) or a
//! single-line password (imap). The file must be a regular file owned by
//! the running user with mode at most 0600; OAuth refreshes rewrite it
//! atomically with the same permissions.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::ProviderError;

/// OAuth token bundle stored on disk
///
/// Matches the Google authorized-user layout: the refresh material
/// (refresh_token + client pair) rides along so the service can mint
/// access tokens unattended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OauthToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Unix timestamp of access token expiry
    #[serde(default)]
    pub expires_at: Option<i64>,
}

/// Parsed contents of a credential file
#[derive(Debug, Clone)]
pub enum Credentials {
    Oauth(OauthToken),
    Password(String),
}

/// Read and validate a credential file
pub fn read_credentials(path: &Path) -> Result<Credentials, ProviderError> {
    check_permissions(path)?;

    let content = fs::read_to_string(path).map_err(|e| {
        ProviderError::AuthRequired(format!("unreadable credential file {}: {e}", path.display()))
    })?;

    let trimmed = content.trim();
    if trimmed.starts_with('{') {
        let token: OauthToken = serde_json::from_str(trimmed).map_err(|e| {
            ProviderError::AuthRequired(format!(
                "malformed token bundle {}: {e}",
                path.display()
            ))
        })?;
        Ok(Credentials::Oauth(token))
    } else if trimmed.is_empty() {
        Err(ProviderError::AuthRequired(format!(
            "empty credential file {}",
            path.display()
        )))
    } else {
        // First line only; trailing newlines are editor noise
        let password = trimmed.lines().next().unwrap_or_default().to_string();
        Ok(Credentials::Password(password))
    }
}

/// Rewrite the token bundle after an OAuth refresh.
/// Write-then-rename keeps a crash from truncating the live file.
pub fn write_oauth_token(path: &Path, token: &OauthToken) -> Result<(), ProviderError> {
    let content = serde_json::to_string_pretty(token)
        .map_err(|e| ProviderError::Permanent(format!("token serialization: {e}")))?;

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, &content).map_err(|e| {
        ProviderError::Permanent(format!("cannot write {}: {e}", tmp.display()))
    })?;

    #[cfg(unix)]
    {
        use std::fs::Permissions;
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, Permissions::from_mode(0o600)).map_err(|e| {
            ProviderError::Permanent(format!("cannot chmod {}: {e}", tmp.display()))
        })?;
    }

    fs::rename(&tmp, path).map_err(|e| {
        ProviderError::Permanent(format!("cannot replace {}: {e}", path.display()))
    })?;
    Ok(())
}

fn check_permissions(path: &Path) -> Result<(), ProviderError> {
    let meta = fs::metadata(path).map_err(|e| {
        ProviderError::AuthRequired(format!("missing credential file {}: {e}", path.display()))
    })?;

    if !meta.is_file() {
        return Err(ProviderError::AuthRequired(format!(
            "credential path {} is not a regular file",
            path.display()
        )));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let mode = meta.mode() & 0o777;
        if mode & 0o077 != 0 {
            return Err(ProviderError::AuthRequired(format!(
                "credential file {} has mode {:o}; must be 0600 or stricter",
                path.display(),
                mode
            )));
        }
        let uid = unsafe { libc::geteuid() };
        if meta.uid() != uid {
            return Err(ProviderError::AuthRequired(format!(
                "credential file {} is not owned by the running user",
                path.display()
            )));
        }
    }

    Ok(())
}
