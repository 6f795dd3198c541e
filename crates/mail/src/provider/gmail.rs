//! Gmail provider speaking the vendor REST API
//!
//! Incremental fetch rides the History API; when the stored history id has
//! expired the provider falls back to a timestamp-bounded query. AI tags
//! map to labels under the configured prefix, auto-created with the
//! configured color on first use.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration as StdDuration;

use base64::prelude::*;
use chrono::{DateTime, TimeZone, Utc};
use log::{debug, info, warn};

use crate::models::{Account, EmailAddress, Folder, MessageBody, SyncCursor};

use super::credentials::{Credentials, OauthToken, read_credentials, write_oauth_token};
use super::{FetchDelta, MailFlag, OutgoingMessage, Provider, ProviderError, RemoteMessage};

/// Hard timeout on any single provider HTTP call
const PROVIDER_TIMEOUT: StdDuration = StdDuration::from_secs(60);

/// Gmail API response types
mod api {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Profile {
        pub email_address: String,
        pub history_id: String,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ListMessagesResponse {
        pub messages: Option<Vec<MessageRef>>,
        pub next_page_token: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessageRef {
        pub id: String,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct GmailMessage {
        pub id: String,
        pub thread_id: String,
        pub label_ids: Option<Vec<String>>,
        #[serde(default)]
        pub snippet: String,
        #[serde(default)]
        pub internal_date: String,
        pub payload: Option<MessagePayload>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessagePayload {
        pub headers: Option<Vec<Header>>,
        pub body: Option<PartBody>,
        pub parts: Option<Vec<MessagePart>>,
        pub mime_type: Option<String>,
        pub filename: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Header {
        pub name: String,
        pub value: String,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct PartBody {
        pub data: Option<String>,
        pub attachment_id: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessagePart {
        pub mime_type: Option<String>,
        pub filename: Option<String>,
        pub body: Option<PartBody>,
        pub parts: Option<Vec<MessagePart>>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct HistoryResponse {
        pub history_id: Option<String>,
        pub history: Option<Vec<HistoryRecord>>,
        pub next_page_token: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct HistoryRecord {
        pub messages_added: Option<Vec<MessageChange>>,
        pub labels_added: Option<Vec<MessageChange>>,
        pub labels_removed: Option<Vec<MessageChange>>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessageChange {
        pub message: ChangedMessage,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ChangedMessage {
        pub id: String,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ListLabelsResponse {
        pub labels: Option<Vec<Label>>,
    }

    #[derive(Debug, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Label {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub id: Option<String>,
        pub name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub color: Option<LabelColor>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub label_list_visibility: Option<String>,
    }

    #[derive(Debug, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct LabelColor {
        pub background_color: String,
        pub text_color: String,
    }

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ModifyRequest {
        pub add_label_ids: Vec<String>,
        pub remove_label_ids: Vec<String>,
    }

    #[derive(Debug, Serialize)]
    pub struct SendRequest {
        pub raw: String,
    }

    #[derive(Debug, Deserialize)]
    pub struct SendResponse {
        pub id: String,
    }
}

use api::*;

/// Gmail system label ids
mod labels {
    pub const INBOX: &str = "INBOX";
    pub const SENT: &str = "SENT";
    pub const DRAFT: &str = "DRAFT";
    pub const TRASH: &str = "TRASH";
    pub const UNREAD: &str = "UNREAD";
}

pub struct GmailProvider {
    email: String,
    credential_file: PathBuf,
    label_colors: BTreeMap<String, String>,
    label_prefix: String,
    agent: ureq::Agent,
    access_token: Option<String>,
    /// Label name -> label id, filled lazily
    label_ids: HashMap<String, String>,
    /// Label id -> label name
    label_names: HashMap<String, String>,
}

impl GmailProvider {
    const BASE_URL: &'static str = "https://gmail.googleapis.com/gmail/v1";
    const TOKEN_URL: &'static str = "https://oauth2.googleapis.com/token";

    pub fn new(account: &Account) -> Self {
        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(PROVIDER_TIMEOUT))
            .build()
            .new_agent();
        Self {
            email: account.email.clone(),
            credential_file: account.credential_file.clone(),
            label_colors: account.label_colors.clone(),
            label_prefix: account.label_prefix.clone(),
            agent,
            access_token: None,
            label_ids: HashMap::new(),
            label_names: HashMap::new(),
        }
    }

    fn token(&self) -> Result<&str, ProviderError> {
        self.access_token
            .as_deref()
            .ok_or_else(|| ProviderError::AuthRequired("not authenticated".to_string()))
    }

    /// Exchange the refresh token for a fresh access token and rewrite
    /// the credential file
    fn refresh_token(&mut self, token: &OauthToken) -> Result<String, ProviderError> {
        let (Some(refresh_token), Some(client_id), Some(client_secret)) = (
            token.refresh_token.as_deref(),
            token.client_id.as_deref(),
            token.client_secret.as_deref(),
        ) else {
            return Err(ProviderError::AuthRequired(
                "token expired and bundle has no refresh material".to_string(),
            ));
        };

        #[derive(serde::Deserialize)]
        struct RefreshResponse {
            access_token: String,
            expires_in: Option<u64>,
        }

        let mut response = self
            .agent
            .post(Self::TOKEN_URL)
            .send_form([
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .map_err(|e| match e {
                ureq::Error::StatusCode(400) | ureq::Error::StatusCode(401) => {
                    ProviderError::AuthRequired("refresh token rejected".to_string())
                }
                other => map_transport_error(other),
            })?;

        let refreshed: RefreshResponse = response
            .body_mut()
            .read_json()
            .map_err(|e| ProviderError::Transient(format!("token response: {e}")))?;

        let updated = OauthToken {
            access_token: refreshed.access_token.clone(),
            refresh_token: Some(refresh_token.to_string()),
            client_id: Some(client_id.to_string()),
            client_secret: Some(client_secret.to_string()),
            expires_at: refreshed
                .expires_in
                .map(|secs| Utc::now().timestamp() + secs as i64),
        };
        if let Err(e) = write_oauth_token(&self.credential_file, &updated) {
            // Read-only credential files are allowed; the refresh still
            // serves this cycle
            warn!("Could not persist refreshed token for {}: {}", self.email, e);
        }

        Ok(refreshed.access_token)
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, ProviderError> {
        let token = self.token()?;
        let mut response = self
            .agent
            .get(url)
            .header("Authorization", &format!("Bearer {token}"))
            .call()
            .map_err(map_transport_error)?;
        response
            .body_mut()
            .read_json()
            .map_err(|e| ProviderError::Transient(format!("malformed response: {e}")))
    }

    fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        body: &impl serde::Serialize,
    ) -> Result<T, ProviderError> {
        let token = self.token()?;
        let mut response = self
            .agent
            .post(url)
            .header("Authorization", &format!("Bearer {token}"))
            .send_json(body)
            .map_err(map_transport_error)?;
        response
            .body_mut()
            .read_json()
            .map_err(|e| ProviderError::Transient(format!("malformed response: {e}")))
    }

    /// POST with an empty body, ignoring the response payload
    fn post_empty(&self, url: &str) -> Result<(), ProviderError> {
        let token = self.token()?;
        self.agent
            .post(url)
            .header("Authorization", &format!("Bearer {token}"))
            .send_empty()
            .map_err(map_transport_error)?;
        Ok(())
    }

    fn get_profile(&self) -> Result<Profile, ProviderError> {
        self.get_json(&format!("{}/users/me/profile", Self::BASE_URL))
    }

    fn get_message(&self, id: &str) -> Result<GmailMessage, ProviderError> {
        self.get_json(&format!(
            "{}/users/me/messages/{}?format=full",
            Self::BASE_URL,
            id
        ))
    }

    fn list_message_ids(
        &self,
        label_id: &str,
        query: Option<&str>,
        max: usize,
    ) -> Result<Vec<String>, ProviderError> {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = format!(
                "{}/users/me/messages?maxResults={}&labelIds={}",
                Self::BASE_URL,
                (max - ids.len()).min(500),
                label_id
            );
            if let Some(q) = query {
                url.push_str(&format!("&q={}", urlencoding::encode(q)));
            }
            if let Some(token) = &page_token {
                url.push_str(&format!("&pageToken={token}"));
            }

            let response: ListMessagesResponse = self.get_json(&url)?;
            for message in response.messages.unwrap_or_default() {
                ids.push(message.id);
                if ids.len() >= max {
                    return Ok(ids);
                }
            }
            match response.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(ids)
    }

    /// Walk all history pages since `start`, collecting ids of messages
    /// that were added or had labels changed
    fn changed_ids_since(&self, start: &str) -> Result<(Vec<String>, Option<String>), ProviderError> {
        let mut ids: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut final_history_id = None;
        let mut page_token: Option<String> = None;

        loop {
            let mut url = format!(
                "{}/users/me/history?startHistoryId={}&historyTypes=messageAdded&historyTypes=labelAdded&historyTypes=labelRemoved",
                Self::BASE_URL,
                start
            );
            if let Some(token) = &page_token {
                url.push_str(&format!("&pageToken={token}"));
            }

            let response: HistoryResponse = self.get_json(&url)?;
            if response.history_id.is_some() {
                final_history_id = response.history_id;
            }

            for record in response.history.unwrap_or_default() {
                let changes = record
                    .messages_added
                    .into_iter()
                    .flatten()
                    .chain(record.labels_added.into_iter().flatten())
                    .chain(record.labels_removed.into_iter().flatten());
                for change in changes {
                    if seen.insert(change.message.id.clone()) {
                        ids.push(change.message.id);
                    }
                }
            }

            match response.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok((ids, final_history_id))
    }

    /// Fetch each id in full, skipping individual failures
    fn fetch_messages(&self, ids: &[String]) -> Vec<RemoteMessage> {
        let mut messages = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get_message(id) {
                Ok(raw) => match self.normalize(raw) {
                    Ok(message) => messages.push(message),
                    Err(e) => warn!("Skipping unparseable message {id}: {e}"),
                },
                Err(ProviderError::NotFound(_)) => {
                    debug!("Message {id} vanished before fetch");
                }
                Err(e) => warn!("Skipping message {id}: {e}"),
            }
        }
        messages
    }

    /// Convert a raw API message into the provider-neutral shape
    fn normalize(&self, raw: GmailMessage) -> Result<RemoteMessage, ProviderError> {
        let payload = raw
            .payload
            .as_ref()
            .ok_or_else(|| ProviderError::Permanent(format!("message {} has no payload", raw.id)))?;

        let sender = header(payload, "From")
            .map(|s| EmailAddress::parse(&s))
            .unwrap_or_else(|| EmailAddress::new("unknown@unknown.invalid"));
        let mut recipients: Vec<EmailAddress> = Vec::new();
        for name in ["To", "Cc"] {
            if let Some(value) = header(payload, name) {
                recipients.extend(value.split(',').map(|a| EmailAddress::parse(a.trim())));
            }
        }
        let subject = header(payload, "Subject").unwrap_or_default();

        let internal_ms: i64 = raw.internal_date.parse().unwrap_or(0);
        let received_at = Utc
            .timestamp_millis_opt(internal_ms)
            .single()
            .unwrap_or_else(Utc::now);

        let label_ids = raw.label_ids.unwrap_or_default();
        let label_names: Vec<String> = label_ids
            .iter()
            .map(|id| {
                self.label_names
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| id.clone())
            })
            .collect();

        Ok(RemoteMessage {
            provider_id: raw.id,
            thread_id: raw.thread_id,
            subject,
            sender,
            recipients,
            received_at,
            snippet: crate::models::snippet_of(&decode_entities(&raw.snippet), 200),
            folder: folder_of(&label_ids),
            is_unread: label_ids.iter().any(|l| l == labels::UNREAD),
            has_attachments: has_attachments(payload),
            labels: label_names,
        })
    }

    /// Load the label map once per session
    fn ensure_label_map(&mut self) -> Result<(), ProviderError> {
        if !self.label_ids.is_empty() {
            return Ok(());
        }
        let response: ListLabelsResponse =
            self.get_json(&format!("{}/users/me/labels", Self::BASE_URL))?;
        for label in response.labels.unwrap_or_default() {
            if let Some(id) = label.id {
                self.label_ids.insert(label.name.clone(), id.clone());
                self.label_names.insert(id, label.name);
            }
        }
        Ok(())
    }

    /// Resolve a label name to its id, creating the label (with the
    /// configured color) when missing
    fn label_id(&mut self, name: &str) -> Result<String, ProviderError> {
        self.ensure_label_map()?;
        if let Some(id) = self.label_ids.get(name) {
            return Ok(id.clone());
        }

        let color = self
            .tag_of_label(name)
            .and_then(|tag| self.label_colors.get(tag))
            .map(|background| LabelColor {
                background_color: background.clone(),
                text_color: "#ffffff".to_string(),
            });

        info!("Creating Gmail label {name}");
        let created: Label = self.post_json(
            &format!("{}/users/me/labels", Self::BASE_URL),
            &Label {
                id: None,
                name: name.to_string(),
                color,
                label_list_visibility: Some("labelShow".to_string()),
            },
        )?;
        let id = created
            .id
            .ok_or_else(|| ProviderError::Permanent("label created without id".to_string()))?;
        self.label_ids.insert(name.to_string(), id.clone());
        self.label_names.insert(id.clone(), name.to_string());
        Ok(id)
    }

    fn tag_of_label<'a>(&self, label: &'a str) -> Option<&'a str> {
        if self.label_prefix.is_empty() {
            return Some(label);
        }
        label
            .strip_prefix(self.label_prefix.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
    }

    fn modify(&self, id: &str, add: Vec<String>, remove: Vec<String>) -> Result<(), ProviderError> {
        if add.is_empty() && remove.is_empty() {
            return Ok(());
        }
        let _: GmailMessage = self.post_json(
            &format!("{}/users/me/messages/{}/modify", Self::BASE_URL, id),
            &ModifyRequest {
                add_label_ids: add,
                remove_label_ids: remove,
            },
        )?;
        Ok(())
    }
}

impl Provider for GmailProvider {
    fn authenticate(&mut self) -> Result<(), ProviderError> {
        let credentials = read_credentials(&self.credential_file)?;
        let Credentials::Oauth(token) = credentials else {
            return Err(ProviderError::AuthRequired(format!(
                "{} does not hold an OAuth token bundle",
                self.credential_file.display()
            )));
        };

        let now = Utc::now().timestamp();
        let fresh = token.expires_at.is_some_and(|at| at > now + 300);
        let access_token = if fresh {
            token.access_token.clone()
        } else {
            self.refresh_token(&token)?
        };
        self.access_token = Some(access_token);

        // A profile read both validates the token and primes history state
        let profile = self.get_profile().map_err(|e| match e {
            ProviderError::Permanent(msg) => ProviderError::AuthRequired(msg),
            other => other,
        })?;
        debug!("Authenticated {} (history {})", profile.email_address, profile.history_id);
        Ok(())
    }

    fn list_folders(&mut self) -> Result<Vec<Folder>, ProviderError> {
        Ok(vec![Folder::Inbox, Folder::Sent, Folder::Drafts, Folder::Trash])
    }

    fn fetch_delta(
        &mut self,
        cursor: &SyncCursor,
        folder: Folder,
        max: usize,
    ) -> Result<FetchDelta, ProviderError> {
        let SyncCursor::Gmail { history_id, .. } = cursor else {
            return Err(ProviderError::Permanent(
                "gmail provider handed a non-gmail cursor".to_string(),
            ));
        };
        self.ensure_label_map()?;

        match history_id {
            // Incremental: history covers every folder, so the inbox pass
            // carries the whole delta and the other folders are no-ops.
            Some(start) => {
                if folder != Folder::Inbox {
                    return Ok(FetchDelta::empty(cursor.clone()));
                }
                match self.changed_ids_since(start) {
                    Ok((mut ids, final_history_id)) => {
                        let complete = ids.len() <= max;
                        ids.truncate(max);
                        let messages = self.fetch_messages(&ids);
                        let new_history = if complete {
                            final_history_id.unwrap_or_else(|| start.clone())
                        } else {
                            // More remains; keep the old position so the
                            // next cycle picks it up
                            start.clone()
                        };
                        Ok(FetchDelta {
                            messages,
                            cursor: SyncCursor::Gmail {
                                history_id: Some(new_history),
                                last_sync: Some(Utc::now()),
                            },
                            complete,
                        })
                    }
                    Err(ProviderError::NotFound(_)) => {
                        // History id expired; fall back to a bounded query
                        warn!("Gmail history expired for {}; falling back to timestamp fetch", self.email);
                        let since = match cursor {
                            SyncCursor::Gmail { last_sync: Some(at), .. } => *at,
                            _ => Utc::now() - chrono::Duration::days(7),
                        };
                        self.bounded_fetch(folder, since, max)
                    }
                    Err(e) => Err(e),
                }
            }
            // Initial: bounded list per folder
            None => {
                let label = folder_label(folder).ok_or_else(|| {
                    ProviderError::Unsupported(format!("gmail has no {folder} folder"))
                })?;
                let ids = self.list_message_ids(label, None, max)?;
                let complete = ids.len() < max;
                let messages = self.fetch_messages(&ids);
                let profile = self.get_profile()?;
                Ok(FetchDelta {
                    messages,
                    cursor: SyncCursor::Gmail {
                        history_id: Some(profile.history_id),
                        last_sync: Some(Utc::now()),
                    },
                    complete,
                })
            }
        }
    }

    fn fetch_body(&mut self, provider_id: &str) -> Result<MessageBody, ProviderError> {
        let raw = self.get_message(provider_id)?;
        let payload = raw
            .payload
            .ok_or_else(|| ProviderError::NotFound(format!("{provider_id} has no payload")))?;

        let mut body = MessageBody::default();
        collect_parts(&payload, &mut body);
        Ok(body)
    }

    fn set_flags(
        &mut self,
        provider_id: &str,
        add: &[MailFlag],
        remove: &[MailFlag],
    ) -> Result<(), ProviderError> {
        let mut add_ids: Vec<String> = Vec::new();
        let mut remove_ids: Vec<String> = Vec::new();

        for flag in add {
            match flag {
                MailFlag::Seen => remove_ids.push(labels::UNREAD.to_string()),
                MailFlag::Unread => add_ids.push(labels::UNREAD.to_string()),
                MailFlag::Label(name) => add_ids.push(self.label_id(name)?),
            }
        }
        for flag in remove {
            match flag {
                MailFlag::Seen => add_ids.push(labels::UNREAD.to_string()),
                MailFlag::Unread => remove_ids.push(labels::UNREAD.to_string()),
                MailFlag::Label(name) => {
                    // Removing a label that never existed is a no-op
                    self.ensure_label_map()?;
                    if let Some(id) = self.label_ids.get(name.as_str()) {
                        remove_ids.push(id.clone());
                    }
                }
            }
        }

        add_ids.sort();
        add_ids.dedup();
        remove_ids.sort();
        remove_ids.dedup();
        remove_ids.retain(|id| !add_ids.contains(id));

        self.modify(provider_id, add_ids, remove_ids)
    }

    fn move_message(
        &mut self,
        provider_id: &str,
        from: Folder,
        to: Folder,
    ) -> Result<(), ProviderError> {
        match (from, to) {
            (_, Folder::Trash) => self.post_empty(&format!(
                "{}/users/me/messages/{}/trash",
                Self::BASE_URL,
                provider_id
            )),
            (Folder::Trash, destination) => {
                self.post_empty(&format!(
                    "{}/users/me/messages/{}/untrash",
                    Self::BASE_URL,
                    provider_id
                ))?;
                // Untrash restores previous labels; nudge the folder when
                // the restore target is explicit
                match destination {
                    Folder::Inbox => {
                        self.modify(provider_id, vec![labels::INBOX.to_string()], vec![])
                    }
                    Folder::Archive => {
                        self.modify(provider_id, vec![], vec![labels::INBOX.to_string()])
                    }
                    _ => Ok(()),
                }
            }
            (_, Folder::Archive) => {
                self.modify(provider_id, vec![], vec![labels::INBOX.to_string()])
            }
            (_, Folder::Inbox) => {
                self.modify(provider_id, vec![labels::INBOX.to_string()], vec![])
            }
            (_, other) => Err(ProviderError::Unsupported(format!(
                "gmail cannot move messages into {other}"
            ))),
        }
    }

    fn permanent_delete(&mut self, provider_id: &str) -> Result<(), ProviderError> {
        let token = self.token()?;
        self.agent
            .delete(&format!(
                "{}/users/me/messages/{}",
                Self::BASE_URL,
                provider_id
            ))
            .header("Authorization", &format!("Bearer {token}"))
            .call()
            .map_err(map_transport_error)?;
        Ok(())
    }

    fn send(&mut self, outgoing: &OutgoingMessage) -> Result<String, ProviderError> {
        let rfc5322 = super::build_rfc5322(outgoing)?;
        let raw = BASE64_URL_SAFE_NO_PAD.encode(&rfc5322);
        let response: SendResponse = self.post_json(
            &format!("{}/users/me/messages/send", Self::BASE_URL),
            &SendRequest { raw },
        )?;
        info!("Sent message {} via gmail", response.id);
        Ok(response.id)
    }

    fn supports_keywords(&self) -> bool {
        true
    }

    fn supports_idle(&self) -> bool {
        false
    }
}

impl GmailProvider {
    /// History-expired fallback: timestamp-bounded fetch for one folder
    fn bounded_fetch(
        &mut self,
        folder: Folder,
        since: DateTime<Utc>,
        max: usize,
    ) -> Result<FetchDelta, ProviderError> {
        let label = folder_label(folder)
            .ok_or_else(|| ProviderError::Unsupported(format!("gmail has no {folder} folder")))?;
        let query = format!("after:{}", since.timestamp());
        let ids = self.list_message_ids(label, Some(&query), max)?;
        let complete = ids.len() < max;
        let messages = self.fetch_messages(&ids);
        let profile = self.get_profile()?;
        Ok(FetchDelta {
            messages,
            cursor: SyncCursor::Gmail {
                history_id: Some(profile.history_id),
                last_sync: Some(Utc::now()),
            },
            complete,
        })
    }
}

/// Logical folder -> Gmail system label
fn folder_label(folder: Folder) -> Option<&'static str> {
    match folder {
        Folder::Inbox => Some(labels::INBOX),
        Folder::Sent => Some(labels::SENT),
        Folder::Drafts => Some(labels::DRAFT),
        Folder::Trash => Some(labels::TRASH),
        Folder::Archive => None,
    }
}

/// Gmail label set -> logical folder; trash wins, archive is the absence
/// of any folder label
fn folder_of(label_ids: &[String]) -> Folder {
    let has = |id: &str| label_ids.iter().any(|l| l == id);
    if has(labels::TRASH) {
        Folder::Trash
    } else if has(labels::DRAFT) {
        Folder::Drafts
    } else if has(labels::INBOX) {
        Folder::Inbox
    } else if has(labels::SENT) {
        Folder::Sent
    } else {
        Folder::Archive
    }
}

fn header(payload: &MessagePayload, name: &str) -> Option<String> {
    payload.headers.as_ref()?.iter().find_map(|h| {
        h.name
            .eq_ignore_ascii_case(name)
            .then(|| h.value.clone())
    })
}

fn has_attachments(payload: &MessagePayload) -> bool {
    fn part_has(parts: &[MessagePart]) -> bool {
        parts.iter().any(|p| {
            p.filename.as_deref().is_some_and(|f| !f.is_empty())
                || p.body
                    .as_ref()
                    .is_some_and(|b| b.attachment_id.is_some())
                || p.parts.as_deref().is_some_and(part_has)
        })
    }
    payload.parts.as_deref().is_some_and(part_has)
}

/// Walk parts collecting the first text/plain and text/html bodies
fn collect_parts(payload: &MessagePayload, body: &mut MessageBody) {
    fn decode(data: &str) -> Option<String> {
        let bytes = BASE64_URL_SAFE_NO_PAD.decode(data).ok()?;
        Some(super::decode_text(&bytes))
    }

    let mime = payload.mime_type.as_deref().unwrap_or("");
    if let Some(data) = payload.body.as_ref().and_then(|b| b.data.as_deref()) {
        if mime.starts_with("text/plain") && body.text.is_none() {
            body.text = decode(data);
        } else if mime.starts_with("text/html") && body.html.is_none() {
            body.html = decode(data);
        }
    }

    fn walk(parts: &[MessagePart], body: &mut MessageBody) {
        for part in parts {
            let mime = part.mime_type.as_deref().unwrap_or("");
            if let Some(data) = part.body.as_ref().and_then(|b| b.data.as_deref()) {
                if mime.starts_with("text/plain") && body.text.is_none() {
                    body.text = decode(data);
                } else if mime.starts_with("text/html") && body.html.is_none() {
                    body.html = decode(data);
                }
            }
            if let Some(nested) = &part.parts {
                walk(nested, body);
            }
        }
    }
    if let Some(parts) = &payload.parts {
        walk(parts, body);
    }
}

/// Decode the HTML entities Gmail leaves in snippets
fn decode_entities(s: &str) -> String {
    s.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
}

/// Map ureq-level failures onto the provider error taxonomy
fn map_transport_error(e: ureq::Error) -> ProviderError {
    match e {
        ureq::Error::StatusCode(401) | ureq::Error::StatusCode(403) => {
            ProviderError::AuthRequired(format!("gmail rejected credentials: {e}"))
        }
        ureq::Error::StatusCode(404) => ProviderError::NotFound(e.to_string()),
        ureq::Error::StatusCode(429) => ProviderError::RateLimited { retry_after: None },
        ureq::Error::StatusCode(code) if (400..500).contains(&code) => {
            ProviderError::Permanent(e.to_string())
        }
        other => ProviderError::Transient(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_folder_of_prefers_trash() {
        let labels = vec!["INBOX".to_string(), "TRASH".to_string()];
        assert_eq!(folder_of(&labels), Folder::Trash);
    }

    #[test]
    fn test_folder_of_archive_is_absence() {
        let labels = vec!["IMPORTANT".to_string(), "AI/work".to_string()];
        assert_eq!(folder_of(&labels), Folder::Archive);
    }

    #[test]
    fn test_decode_entities() {
        assert_eq!(decode_entities("Tom &amp; Jerry &lt;3"), "Tom & Jerry <3");
    }

    #[test]
    fn test_map_transport_error_kinds() {
        assert!(matches!(
            map_transport_error(ureq::Error::StatusCode(401)),
            ProviderError::AuthRequired(_)
        ));
        assert!(matches!(
            map_transport_error(ureq::Error::StatusCode(429)),
            ProviderError::RateLimited { .. }
        ));
        assert!(matches!(
            map_transport_error(ureq::Error::StatusCode(404)),
            ProviderError::NotFound(_)
        ));
        assert!(matches!(
            map_transport_error(ureq::Error::StatusCode(418)),
            ProviderError::Permanent(_)
        ));
        assert!(matches!(
            map_transport_error(ureq::Error::StatusCode(503)),
            ProviderError::Transient(_)
        ));
    }
}
