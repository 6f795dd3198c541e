//! IMAP provider
//!
//! Tags map to keyword flags (`$work`); servers whose PERMANENTFLAGS do
//! not advertise `\*` degrade to read-only label sync. Trash is
//! COPY + `\Deleted` + EXPUNGE; permanent delete skips the copy. Outgoing
//! mail goes through the account's SMTP relay and is appended to Sent.
//!
//! Messages are keyed by their Message-ID header so identity survives
//! the UID churn a COPY/EXPUNGE move causes; UID-less messages fall back
//! to a `folder:uid` key.

use std::collections::HashMap;
use std::net::TcpStream;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use imap::Session;
use imap::types::Flag;
use lettre::Transport;
use lettre::transport::smtp::authentication::Credentials as SmtpCredentials;
use log::{debug, info, warn};
use native_tls::TlsStream;

use config::{ImapConfig, SmtpConfig};

use crate::models::{Account, EmailAddress, Folder, MessageBody, SyncCursor, snippet_of};

use super::credentials::{Credentials, read_credentials};
use super::{FetchDelta, MailFlag, OutgoingMessage, Provider, ProviderError, RemoteMessage};

type ImapSession = Session<TlsStream<TcpStream>>;

pub struct ImapProvider {
    email: String,
    credential_file: PathBuf,
    server: ImapConfig,
    smtp: Option<SmtpConfig>,
    label_prefix: String,
    session: Option<ImapSession>,
    password: Option<String>,
    selected: Option<String>,
    keywords_supported: bool,
    /// provider_id -> (mailbox, uid) as last observed
    uid_map: HashMap<String, (String, u32)>,
}

impl ImapProvider {
    pub fn new(account: &Account) -> Result<Self, ProviderError> {
        let server = account.imap.clone().ok_or_else(|| {
            ProviderError::Permanent(format!("account {} has no imap settings", account.id))
        })?;
        if !server.tls {
            return Err(ProviderError::Unsupported(
                "plaintext imap connections are not supported".to_string(),
            ));
        }
        Ok(Self {
            email: account.email.clone(),
            credential_file: account.credential_file.clone(),
            server,
            smtp: account.smtp.clone(),
            label_prefix: account.label_prefix.clone(),
            session: None,
            password: None,
            selected: None,
            keywords_supported: true,
            uid_map: HashMap::new(),
        })
    }

    fn session(&mut self) -> Result<&mut ImapSession, ProviderError> {
        self.session
            .as_mut()
            .ok_or_else(|| ProviderError::AuthRequired("not authenticated".to_string()))
    }

    /// Select a mailbox, tracking keyword capability from PERMANENTFLAGS
    fn select(&mut self, mailbox: &str) -> Result<(), ProviderError> {
        if self.selected.as_deref() == Some(mailbox) {
            return Ok(());
        }
        let session = self.session()?;
        let status = session.select(mailbox).map_err(map_imap_error)?;
        self.keywords_supported = status
            .permanent_flags
            .iter()
            .any(|f| matches!(f, Flag::MayCreate));
        self.selected = Some(mailbox.to_string());
        Ok(())
    }

    /// Find the (mailbox, uid) behind a provider id, searching by
    /// Message-ID when the in-memory map has gone stale
    fn locate(&mut self, provider_id: &str) -> Result<(String, u32), ProviderError> {
        if let Some(found) = self.uid_map.get(provider_id) {
            return Ok(found.clone());
        }
        if let Some((mailbox, uid)) = parse_uid_key(provider_id) {
            return Ok((mailbox, uid));
        }

        for folder in [Folder::Inbox, Folder::Trash, Folder::Archive, Folder::Sent, Folder::Drafts] {
            let mailbox = mailbox_of(folder).to_string();
            if self.select(&mailbox).is_err() {
                continue;
            }
            let query = format!("HEADER Message-ID \"{provider_id}\"");
            let uids = self.session()?.uid_search(&query).map_err(map_imap_error)?;
            if let Some(uid) = uids.into_iter().max() {
                self.uid_map
                    .insert(provider_id.to_string(), (mailbox.clone(), uid));
                return Ok((mailbox, uid));
            }
        }
        Err(ProviderError::NotFound(format!(
            "no message with id {provider_id}"
        )))
    }

    /// Fetch and normalize one batch of UIDs from the selected mailbox
    fn fetch_uids(&mut self, folder: Folder, uids: &[u32]) -> Result<Vec<RemoteMessage>, ProviderError> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let set = uids
            .iter()
            .map(|u| u.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let session = self.session()?;
        let fetches = session
            .uid_fetch(&set, "(UID FLAGS INTERNALDATE BODY.PEEK[])")
            .map_err(map_imap_error)?;

        let mailbox = mailbox_of(folder).to_string();
        let mut messages = Vec::new();
        for fetch in fetches.iter() {
            let Some(uid) = fetch.uid else { continue };
            let Some(raw) = fetch.body() else {
                warn!("uid {uid} in {mailbox} returned no body");
                continue;
            };
            let internal_date = fetch.internal_date().map(|d| d.with_timezone(&Utc));
            let flags = fetch.flags();
            match normalize(raw, folder, &mailbox, uid, flags, internal_date, &self.label_prefix) {
                Ok(message) => {
                    self.uid_map
                        .insert(message.provider_id.clone(), (mailbox.clone(), uid));
                    messages.push(message);
                }
                Err(e) => warn!("Skipping unparseable message {mailbox}:{uid}: {e}"),
            }
        }
        Ok(messages)
    }

    fn keyword_for(&self, label: &str) -> String {
        let tag = label.rsplit('/').next().unwrap_or(label);
        format!("${tag}")
    }

    fn store_flags(
        &mut self,
        mailbox: &str,
        uid: u32,
        sign: char,
        flags: &[String],
    ) -> Result<(), ProviderError> {
        if flags.is_empty() {
            return Ok(());
        }
        self.select(mailbox)?;
        let command = format!("{sign}FLAGS ({})", flags.join(" "));
        self.session()?
            .uid_store(uid.to_string(), &command)
            .map_err(map_imap_error)?;
        Ok(())
    }
}

impl Provider for ImapProvider {
    fn authenticate(&mut self) -> Result<(), ProviderError> {
        let credentials = read_credentials(&self.credential_file)?;
        let Credentials::Password(password) = credentials else {
            return Err(ProviderError::AuthRequired(format!(
                "{} does not hold an imap password",
                self.credential_file.display()
            )));
        };

        let tls = native_tls::TlsConnector::builder()
            .build()
            .map_err(|e| ProviderError::Transient(format!("tls setup: {e}")))?;
        let client = imap::connect(
            (self.server.host.as_str(), self.server.port),
            self.server.host.as_str(),
            &tls,
        )
        .map_err(map_imap_error)?;

        let session = client
            .login(&self.email, &password)
            .map_err(|(e, _)| ProviderError::AuthRequired(format!("login rejected: {e}")))?;

        debug!("Authenticated {} against {}", self.email, self.server.host);
        self.session = Some(session);
        self.password = Some(password);
        self.selected = None;
        Ok(())
    }

    fn list_folders(&mut self) -> Result<Vec<Folder>, ProviderError> {
        let session = self.session()?;
        let names = session.list(None, Some("*")).map_err(map_imap_error)?;
        let mut folders = Vec::new();
        for name in names.iter() {
            if let Some(folder) = folder_of_mailbox(name.name()) {
                if !folders.contains(&folder) {
                    folders.push(folder);
                }
            }
        }
        Ok(folders)
    }

    fn fetch_delta(
        &mut self,
        cursor: &SyncCursor,
        folder: Folder,
        max: usize,
    ) -> Result<FetchDelta, ProviderError> {
        let SyncCursor::Imap { last_uids, .. } = cursor else {
            return Err(ProviderError::Permanent(
                "imap provider handed a non-imap cursor".to_string(),
            ));
        };

        let mailbox = mailbox_of(folder).to_string();
        self.select(&mailbox)?;

        let last_uid = last_uids.get(folder.as_str()).copied();
        let query = match last_uid {
            Some(uid) => format!("UID {}:*", uid.saturating_add(1)),
            None => "ALL".to_string(),
        };
        let found = self.session()?.uid_search(&query).map_err(map_imap_error)?;

        // A UID range search echoes the last message back even when
        // nothing is new; keep strictly-newer uids only
        let mut uids: Vec<u32> = found
            .into_iter()
            .filter(|uid| last_uid.is_none_or(|last| *uid > last))
            .collect();
        uids.sort_unstable();

        let complete = uids.len() <= max;
        if !complete {
            // Oldest first so the cursor can advance monotonically
            uids.truncate(max);
        }

        let messages = self.fetch_uids(folder, &uids)?;
        let highest = uids.last().copied().or(last_uid);

        let mut new_uids = last_uids.clone();
        if let Some(uid) = highest {
            new_uids.insert(folder.as_str().to_string(), uid);
        }
        Ok(FetchDelta {
            messages,
            cursor: SyncCursor::Imap {
                last_uids: new_uids,
                last_sync: Some(Utc::now()),
            },
            complete,
        })
    }

    fn fetch_body(&mut self, provider_id: &str) -> Result<MessageBody, ProviderError> {
        let (mailbox, uid) = self.locate(provider_id)?;
        self.select(&mailbox)?;
        let session = self.session()?;
        let fetches = session
            .uid_fetch(uid.to_string(), "(BODY.PEEK[])")
            .map_err(map_imap_error)?;

        let fetch = fetches
            .iter()
            .next()
            .ok_or_else(|| ProviderError::NotFound(format!("{provider_id} vanished")))?;
        let raw = fetch
            .body()
            .ok_or_else(|| ProviderError::NotFound(format!("{provider_id} has no body")))?;

        let parsed = mailparse::parse_mail(raw)
            .map_err(|e| ProviderError::Permanent(format!("unparseable message: {e}")))?;
        let mut body = MessageBody::default();
        extract_bodies(&parsed, &mut body);
        Ok(body)
    }

    fn set_flags(
        &mut self,
        provider_id: &str,
        add: &[MailFlag],
        remove: &[MailFlag],
    ) -> Result<(), ProviderError> {
        let (mailbox, uid) = self.locate(provider_id)?;

        let mut plus: Vec<String> = Vec::new();
        let mut minus: Vec<String> = Vec::new();
        for flag in add {
            match flag {
                MailFlag::Seen => plus.push("\\Seen".to_string()),
                MailFlag::Unread => minus.push("\\Seen".to_string()),
                MailFlag::Label(label) => {
                    if !self.supports_keywords() {
                        return Err(ProviderError::Unsupported(
                            "server rejects custom keywords".to_string(),
                        ));
                    }
                    plus.push(self.keyword_for(label));
                }
            }
        }
        for flag in remove {
            match flag {
                MailFlag::Seen => minus.push("\\Seen".to_string()),
                MailFlag::Unread => plus.push("\\Seen".to_string()),
                MailFlag::Label(label) => {
                    if !self.supports_keywords() {
                        return Err(ProviderError::Unsupported(
                            "server rejects custom keywords".to_string(),
                        ));
                    }
                    minus.push(self.keyword_for(label));
                }
            }
        }
        plus.sort();
        plus.dedup();
        minus.sort();
        minus.dedup();
        minus.retain(|f| !plus.contains(f));

        self.store_flags(&mailbox, uid, '+', &plus)?;
        self.store_flags(&mailbox, uid, '-', &minus)?;
        Ok(())
    }

    fn move_message(
        &mut self,
        provider_id: &str,
        _from: Folder,
        to: Folder,
    ) -> Result<(), ProviderError> {
        let (mailbox, uid) = self.locate(provider_id)?;
        let destination = mailbox_of(to);

        self.select(&mailbox)?;
        let session = self.session()?;
        session
            .uid_copy(uid.to_string(), destination)
            .map_err(map_imap_error)?;
        session
            .uid_store(uid.to_string(), "+FLAGS (\\Deleted)")
            .map_err(map_imap_error)?;
        session.expunge().map_err(map_imap_error)?;

        // The copy got a fresh UID; the next locate will search it out
        self.uid_map.remove(provider_id);
        info!("Moved {provider_id} from {mailbox} to {destination}");
        Ok(())
    }

    fn permanent_delete(&mut self, provider_id: &str) -> Result<(), ProviderError> {
        let (mailbox, uid) = self.locate(provider_id)?;
        self.select(&mailbox)?;
        let session = self.session()?;
        session
            .uid_store(uid.to_string(), "+FLAGS (\\Deleted)")
            .map_err(map_imap_error)?;
        session.expunge().map_err(map_imap_error)?;
        self.uid_map.remove(provider_id);
        info!("Permanently deleted {provider_id} from {mailbox}");
        Ok(())
    }

    fn send(&mut self, outgoing: &OutgoingMessage) -> Result<String, ProviderError> {
        let smtp = self.smtp.clone().ok_or_else(|| {
            ProviderError::Unsupported(format!("account {} has no smtp relay", self.email))
        })?;
        let password = self
            .password
            .clone()
            .ok_or_else(|| ProviderError::AuthRequired("not authenticated".to_string()))?;

        let message = super::build_lettre_message(outgoing)?;
        let username = smtp.username.clone().unwrap_or_else(|| self.email.clone());

        let mailer = lettre::SmtpTransport::starttls_relay(&smtp.host)
            .map_err(|e| ProviderError::Transient(format!("smtp relay: {e}")))?
            .port(smtp.port)
            .credentials(SmtpCredentials::new(username, password))
            .build();
        mailer.send(&message).map_err(|e| {
            if e.is_permanent() {
                ProviderError::Permanent(format!("smtp rejected message: {e}"))
            } else {
                ProviderError::Transient(format!("smtp delivery failed: {e}"))
            }
        })?;

        let message_id = message
            .headers()
            .get_raw("Message-ID")
            .map(|v| v.trim().to_string())
            .unwrap_or_default();

        // Most IMAP servers do not save outgoing mail themselves
        if let Err(e) = self
            .session()
            .and_then(|s| s.append("Sent", message.formatted()).map_err(map_imap_error))
        {
            warn!("Could not append sent message to Sent: {e}");
        }

        info!("Sent message {message_id} via {}", smtp.host);
        Ok(message_id)
    }

    fn supports_keywords(&self) -> bool {
        self.keywords_supported
    }

    fn supports_idle(&self) -> bool {
        true
    }
}

/// Logical folder -> conventional mailbox name
fn mailbox_of(folder: Folder) -> &'static str {
    match folder {
        Folder::Inbox => "INBOX",
        Folder::Sent => "Sent",
        Folder::Drafts => "Drafts",
        Folder::Trash => "Trash",
        Folder::Archive => "Archive",
    }
}

fn folder_of_mailbox(name: &str) -> Option<Folder> {
    match name.to_ascii_lowercase().as_str() {
        "inbox" => Some(Folder::Inbox),
        "sent" | "sent messages" | "sent items" => Some(Folder::Sent),
        "drafts" => Some(Folder::Drafts),
        "trash" | "deleted messages" | "deleted items" => Some(Folder::Trash),
        "archive" => Some(Folder::Archive),
        _ => None,
    }
}

/// Split a `mailbox:uid` fallback key
fn parse_uid_key(provider_id: &str) -> Option<(String, u32)> {
    let (mailbox, uid) = provider_id.rsplit_once(':')?;
    if mailbox.is_empty() || provider_id.starts_with('<') {
        return None;
    }
    Some((mailbox.to_string(), uid.parse().ok()?))
}

/// Parse a raw RFC 5322 message into the provider-neutral shape
fn normalize(
    raw: &[u8],
    folder: Folder,
    mailbox: &str,
    uid: u32,
    flags: &[Flag],
    internal_date: Option<DateTime<Utc>>,
    label_prefix: &str,
) -> anyhow::Result<RemoteMessage> {
    let parsed = mailparse::parse_mail(raw)?;
    let headers = &parsed.headers;

    let first = |name: &str| -> Option<String> {
        use mailparse::MailHeaderMap;
        headers.get_first_value(name)
    };

    let provider_id = first("Message-ID")
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| format!("{mailbox}:{uid}"));

    // Thread on the conversation root: first reference, else self
    let thread_id = first("References")
        .and_then(|refs| refs.split_whitespace().next().map(|s| s.to_string()))
        .or_else(|| first("In-Reply-To").map(|v| v.trim().to_string()))
        .unwrap_or_else(|| provider_id.clone());

    let sender = first("From")
        .map(|v| EmailAddress::parse(&v))
        .unwrap_or_else(|| EmailAddress::new("unknown@unknown.invalid"));
    let mut recipients = Vec::new();
    for name in ["To", "Cc"] {
        if let Some(value) = first(name) {
            recipients.extend(value.split(',').map(|a| EmailAddress::parse(a.trim())));
        }
    }

    let received_at = internal_date
        .or_else(|| {
            first("Date")
                .and_then(|d| mailparse::dateparse(&d).ok())
                .and_then(|ts| DateTime::from_timestamp(ts, 0))
        })
        .unwrap_or_else(Utc::now);

    let mut body = MessageBody::default();
    extract_bodies(&parsed, &mut body);
    let snippet = body
        .text
        .as_deref()
        .map(|t| snippet_of(t, 200))
        .unwrap_or_default();

    let is_unread = !flags.iter().any(|f| matches!(f, Flag::Seen));
    let labels: Vec<String> = flags
        .iter()
        .filter_map(|f| match f {
            Flag::Custom(keyword) => Some(label_of_keyword(keyword, label_prefix)),
            _ => None,
        })
        .collect();

    Ok(RemoteMessage {
        provider_id,
        thread_id,
        subject: first("Subject").unwrap_or_default(),
        sender,
        recipients,
        received_at,
        snippet,
        folder,
        is_unread,
        has_attachments: has_attachments(&parsed),
        labels,
    })
}

/// `$work` -> `AI/work` under the configured prefix
fn label_of_keyword(keyword: &str, prefix: &str) -> String {
    let tag = keyword.strip_prefix('$').unwrap_or(keyword);
    if prefix.is_empty() {
        tag.to_string()
    } else {
        format!("{prefix}/{tag}")
    }
}

/// Walk MIME parts collecting text/plain and text/html, preferring the
/// plain part and skipping attachments
fn extract_bodies(parsed: &mailparse::ParsedMail, body: &mut MessageBody) {
    let ctype = parsed.ctype.mimetype.as_str();
    if parsed.subparts.is_empty() {
        let is_attachment = parsed
            .get_content_disposition()
            .disposition
            == mailparse::DispositionType::Attachment;
        if !is_attachment && let Ok(content) = parsed.get_body() {
            if ctype == "text/plain" && body.text.is_none() {
                body.text = Some(content);
            } else if ctype == "text/html" && body.html.is_none() {
                body.html = Some(content);
            }
        }
        return;
    }
    for part in &parsed.subparts {
        extract_bodies(part, body);
    }
}

fn has_attachments(parsed: &mailparse::ParsedMail) -> bool {
    let disposition = parsed.get_content_disposition();
    if disposition.disposition == mailparse::DispositionType::Attachment {
        return true;
    }
    parsed.subparts.iter().any(has_attachments)
}

/// Map imap crate failures onto the provider error taxonomy
fn map_imap_error(e: imap::Error) -> ProviderError {
    match e {
        imap::Error::Io(e) => ProviderError::Transient(format!("imap io: {e}")),
        imap::Error::ConnectionLost => ProviderError::Transient("imap connection lost".to_string()),
        imap::Error::No(msg) => ProviderError::Permanent(format!("imap NO: {msg}")),
        imap::Error::Bad(msg) => ProviderError::Permanent(format!("imap BAD: {msg}")),
        other => ProviderError::Transient(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = b"Message-ID: <abc@example.com>\r\n\
        From: Ada <ada@example.com>\r\n\
        To: me@example.com\r\n\
        Subject: =?utf-8?q?caf=C3=A9_plans?=\r\n\
        Date: Mon, 13 Jul 2026 10:00:00 +0000\r\n\
        Content-Type: text/plain; charset=utf-8\r\n\
        \r\n\
        Meet at nine.\r\n";

    #[test]
    fn test_normalize_decodes_headers() {
        let msg = normalize(SAMPLE, Folder::Inbox, "INBOX", 7, &[], None, "AI").unwrap();
        assert_eq!(msg.provider_id, "<abc@example.com>");
        assert_eq!(msg.subject, "café plans");
        assert_eq!(msg.sender.email, "ada@example.com");
        assert_eq!(msg.snippet, "Meet at nine.");
        assert!(msg.is_unread);
    }

    #[test]
    fn test_normalize_seen_flag_and_keywords() {
        let flags = vec![Flag::Seen, Flag::Custom("$work".into())];
        let msg = normalize(SAMPLE, Folder::Inbox, "INBOX", 7, &flags, None, "AI").unwrap();
        assert!(!msg.is_unread);
        assert_eq!(msg.labels, vec!["AI/work"]);
    }

    #[test]
    fn test_normalize_without_message_id_uses_uid_key() {
        let raw = b"From: x@y.z\r\nSubject: hi\r\n\r\nbody\r\n";
        let msg = normalize(raw, Folder::Trash, "Trash", 42, &[], None, "AI").unwrap();
        assert_eq!(msg.provider_id, "Trash:42");
        assert_eq!(parse_uid_key(&msg.provider_id), Some(("Trash".to_string(), 42)));
    }

    #[test]
    fn test_parse_uid_key_rejects_message_ids() {
        assert_eq!(parse_uid_key("<abc:7@example.com>"), None);
    }

    #[test]
    fn test_multipart_body_extraction() {
        let raw = b"Message-ID: <m@x>\r\n\
            Content-Type: multipart/alternative; boundary=b\r\n\
            \r\n\
            --b\r\n\
            Content-Type: text/plain\r\n\
            \r\n\
            plain body\r\n\
            --b\r\n\
            Content-Type: text/html\r\n\
            \r\n\
            <p>html body</p>\r\n\
            --b--\r\n";
        let parsed = mailparse::parse_mail(raw).unwrap();
        let mut body = MessageBody::default();
        extract_bodies(&parsed, &mut body);
        assert_eq!(body.text.as_deref().map(str::trim), Some("plain body"));
        assert_eq!(body.html.as_deref().map(str::trim), Some("<p>html body</p>"));
    }

    #[test]
    fn test_label_keyword_round_trip() {
        assert_eq!(label_of_keyword("$work", "AI"), "AI/work");
        assert_eq!(label_of_keyword("$work", ""), "work");
    }
}
