//! Sync engine
//!
//! Per-account orchestration of one trigger: drain the pending-ops queue,
//! fetch the provider delta, mirror it into the store, classify whatever
//! is still unclassified, push AI labels upstream, advance the cursor,
//! and announce the outcome. Accounts are independent; one account's
//! failure never touches another.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use log::{debug, info, warn};

use config::Config;

use crate::classify::{Classify, ClassifyInput};
use crate::events::{Event, EventBus};
use crate::models::{Account, Folder, PendingOp};
use crate::provider::{MailFlag, Provider, ProviderError, RetryPolicy};
use crate::queue;
use crate::store::MessageStore;

/// Wall-clock budget for one account cycle; overrun aborts the cycle
/// without advancing the cursor
const CYCLE_TIMEOUT: Duration = Duration::from_secs(600);
/// Classification pauses for the rest of the cycle after this many
/// consecutive failures
const MAX_CLASSIFY_FAILURES: usize = 3;

/// Counts published with `sync_completed`
#[derive(Debug, Default, Clone)]
pub struct SyncStats {
    pub fetched: usize,
    pub classified: usize,
    pub actions_processed: usize,
    pub errors: usize,
    pub duration_ms: u64,
}

/// Shared handles a cycle runs against
pub struct SyncContext<'a> {
    pub store: &'a MessageStore,
    pub bus: &'a EventBus,
    pub config: &'a Config,
    pub cancel: &'a AtomicBool,
}

impl SyncContext<'_> {
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

/// Run one sync cycle for one account
pub fn sync_account(
    ctx: &SyncContext,
    account: &mut Account,
    provider: &mut dyn Provider,
    classifier: Option<&dyn Classify>,
) -> Result<SyncStats> {
    let started = Instant::now();
    let deadline = started + CYCLE_TIMEOUT;
    let retry = RetryPolicy::default();
    let mut stats = SyncStats::default();

    ctx.bus.publish(Event::SyncStarted {
        account_id: account.id.clone(),
    });

    // Authentication failure parks the account for the cycle
    if let Err(e) = retry.run("authenticate", || provider.authenticate()) {
        warn!("Account {} failed to authenticate: {e}", account.id);
        ctx.store
            .set_account_health(&account.id, false, Some(&e.to_string()))?;
        ctx.bus.publish(Event::AccountError {
            account_id: account.id.clone(),
            error: e.to_string(),
        });
        bail!("authentication failed for {}: {e}", account.id);
    }

    // Push user intent before fetching so the remote observation below
    // already reflects it
    let completed_ops = queue::drain(ctx.store, ctx.bus, provider, &retry, &account.id)
        .context("pending-ops drain failed")?;
    stats.actions_processed = completed_ops.len();

    // Fields touched by an op completed this cycle stay local-authoritative
    // for this fetch; the provider snapshot may predate our own write
    let mut cycle_ops: HashMap<&str, Vec<PendingOp>> = HashMap::new();
    for op in &completed_ops {
        cycle_ops.entry(op.provider_id.as_str()).or_default().push(op.op);
    }

    let mut aborted = false;

    // Fetch each folder's delta against the cycle-start cursor, folding
    // the advanced positions together
    let mut merged_cursor = account.cursor.clone();
    let budget = ctx.config.sync.max_messages_per_sync;
    let mut remaining = budget;

    'folders: for folder in Folder::SYNCED {
        if remaining == 0 {
            break;
        }
        if ctx.cancelled() {
            bail!("sync cancelled");
        }
        if Instant::now() >= deadline {
            warn!("Account {} hit the cycle deadline during fetch", account.id);
            stats.errors += 1;
            aborted = true;
            break;
        }

        let delta = match retry.run("fetch_delta", || {
            provider.fetch_delta(&account.cursor, folder, remaining)
        }) {
            Ok(delta) => delta,
            Err(ProviderError::Unsupported(msg)) => {
                debug!("Account {} skips {folder}: {msg}", account.id);
                continue;
            }
            Err(e) => {
                warn!("Account {} fetch of {folder} failed: {e}", account.id);
                stats.errors += 1;
                continue;
            }
        };

        for remote in &delta.messages {
            if ctx.cancelled() {
                bail!("sync cancelled");
            }
            if Instant::now() >= deadline {
                stats.errors += 1;
                aborted = true;
                break 'folders;
            }

            // Provider wins for observed metadata unless the same field
            // has a local change still waiting in the queue, or one this
            // cycle's drain just pushed
            let mut local_ops = ctx
                .store
                .pending_ops_for_provider_id(&account.id, &remote.provider_id)?;
            if let Some(completed) = cycle_ops.get(remote.provider_id.as_str()) {
                local_ops.extend_from_slice(completed);
            }
            let preserve_unread = local_ops
                .iter()
                .any(|op| matches!(op, PendingOp::MarkRead | PendingOp::MarkUnread));
            let preserve_folder = local_ops
                .iter()
                .any(|op| matches!(op, PendingOp::Trash | PendingOp::Restore));

            // A store write failure aborts the whole cycle; the cursor
            // stays put and the delta is refetched next time
            ctx.store
                .upsert_remote(&account.id, remote, preserve_unread, preserve_folder)
                .with_context(|| {
                    format!("storing message {} for {}", remote.provider_id, account.id)
                })?;
            stats.fetched += 1;
            remaining = remaining.saturating_sub(1);
        }

        merged_cursor.merge(delta.cursor);
    }

    // Classify the backlog, then mirror fresh tag sets as provider labels
    if !aborted {
        if let Some(classifier) = classifier {
            match classify_backlog(ctx, account, classifier, budget, deadline) {
                Ok(classified) => stats.classified = classified,
                Err(e) => {
                    warn!("Account {} classification pass failed: {e}", account.id);
                    stats.errors += 1;
                }
            }
        }

        match push_labels(ctx, account, provider, &retry, deadline) {
            Ok(()) => {}
            Err(e) => {
                warn!("Account {} label reconciliation failed: {e}", account.id);
                stats.errors += 1;
            }
        }
    }

    // Advancing the cursor is the cycle's commit point; an aborted cycle
    // refetches instead (upserts are idempotent)
    if !aborted {
        ctx.store.save_cursor(&account.id, &merged_cursor)?;
        account.cursor = merged_cursor;
        account.healthy = true;
    }

    stats.duration_ms = started.elapsed().as_millis() as u64;
    info!(
        "Account {} synced: {} fetched, {} classified, {} actions, {} errors in {}ms",
        account.id,
        stats.fetched,
        stats.classified,
        stats.actions_processed,
        stats.errors,
        stats.duration_ms
    );
    ctx.bus.publish(Event::SyncCompleted {
        account_id: account.id.clone(),
        stats: stats.clone(),
    });
    Ok(stats)
}

/// Classify unclassified messages, pausing for the cycle after three
/// consecutive failures so a dead model endpoint cannot stall fetch
fn classify_backlog(
    ctx: &SyncContext,
    account: &Account,
    classifier: &dyn Classify,
    budget: usize,
    deadline: Instant,
) -> Result<usize> {
    let ids = ctx.store.unclassified_message_ids(&account.id, budget)?;
    if ids.is_empty() {
        return Ok(0);
    }
    debug!("Account {} classifying {} messages", account.id, ids.len());

    let mut classified = 0;
    let mut consecutive_failures = 0;

    for id in ids {
        if ctx.cancelled() || Instant::now() >= deadline {
            break;
        }
        let Some(message) = ctx.store.get_message(id)? else {
            continue;
        };

        let examples =
            ctx.store
                .select_examples(&account.id, &message.sender.domain(), 5)?;
        let body = ctx
            .store
            .get_body(id)?
            .and_then(|b| b.text)
            .map(|t| t.chars().take(3000).collect());

        let input = ClassifyInput {
            message_id: id,
            subject: message.subject.clone(),
            sender: message.sender.clone(),
            recipients: message.recipients.clone(),
            received_at: message.received_at,
            snippet: message.snippet.clone(),
            body,
            examples,
        };

        match classifier.classify(&input) {
            Ok(classification) => {
                consecutive_failures = 0;
                ctx.store.upsert_classification(&classification)?;
                ctx.bus.publish(Event::MessageClassified { message_id: id });
                classified += 1;
            }
            Err(e) => {
                consecutive_failures += 1;
                warn!(
                    "Classification of message {id} failed ({consecutive_failures} in a row): {e}"
                );
                if consecutive_failures >= MAX_CLASSIFY_FAILURES {
                    warn!(
                        "Account {} pausing classification for this cycle",
                        account.id
                    );
                    break;
                }
            }
        }
    }
    Ok(classified)
}

/// Mirror AI tags as provider labels: add what is missing, never remove
/// anything that was not ours to begin with
fn push_labels(
    ctx: &SyncContext,
    account: &Account,
    provider: &mut dyn Provider,
    retry: &RetryPolicy,
    deadline: Instant,
) -> Result<()> {
    let ids = ctx.store.label_sync_pending(&account.id)?;
    if ids.is_empty() {
        return Ok(());
    }
    if !provider.supports_keywords() {
        debug!(
            "Account {} provider is label read-only; skipping label push",
            account.id
        );
        return Ok(());
    }

    for id in ids {
        if ctx.cancelled() || Instant::now() >= deadline {
            break;
        }
        let Some(message) = ctx.store.get_message(id)? else {
            continue;
        };
        let Some(classification) = ctx.store.get_classification(id)? else {
            continue;
        };

        let desired: Vec<String> = classification
            .tags
            .iter()
            .map(|tag| account.label_for_tag(tag))
            .collect();
        let missing: Vec<MailFlag> = desired
            .iter()
            .filter(|label| !message.provider_labels.contains(label))
            .map(|label| MailFlag::Label(label.clone()))
            .collect();

        if !missing.is_empty() {
            match retry.run("push_labels", || {
                provider.set_flags(&message.provider_id, &missing, &[])
            }) {
                Ok(()) => {}
                Err(ProviderError::NotFound(_)) => {
                    debug!("Message {id} gone remotely; skipping label push");
                }
                Err(ProviderError::Unsupported(msg)) => {
                    debug!("Label push unsupported for {}: {msg}", account.id);
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }

        let mut labels = message.provider_labels.clone();
        for label in desired {
            if !labels.contains(&label) {
                labels.push(label);
            }
        }
        ctx.store.mark_labels_pushed(id, &labels)?;
    }
    Ok(())
}

/// Re-queue every message in an account for classification; existing
/// classifications are replaced in place as the passes run
pub fn reclassify_account(
    ctx: &SyncContext,
    account: &Account,
    classifier: &dyn Classify,
) -> Result<usize> {
    let ids = ctx.store.message_ids(&account.id)?;
    info!(
        "Account {} reclassifying {} messages",
        account.id,
        ids.len()
    );

    let mut classified = 0;
    let mut consecutive_failures = 0;
    for id in ids {
        if ctx.cancelled() {
            break;
        }
        let Some(message) = ctx.store.get_message(id)? else {
            continue;
        };
        let examples =
            ctx.store
                .select_examples(&account.id, &message.sender.domain(), 5)?;
        let input = ClassifyInput {
            message_id: id,
            subject: message.subject.clone(),
            sender: message.sender.clone(),
            recipients: message.recipients.clone(),
            received_at: message.received_at,
            snippet: message.snippet.clone(),
            body: None,
            examples,
        };
        match classifier.classify(&input) {
            Ok(classification) => {
                consecutive_failures = 0;
                ctx.store.upsert_classification(&classification)?;
                ctx.bus.publish(Event::MessageClassified { message_id: id });
                classified += 1;
            }
            Err(e) => {
                consecutive_failures += 1;
                warn!("Reclassification of message {id} failed: {e}");
                if consecutive_failures >= MAX_CLASSIFY_FAILURES {
                    break;
                }
            }
        }
    }
    Ok(classified)
}
