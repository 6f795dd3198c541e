//! Integration tests for the mail crate
//!
//! These run the full drain -> fetch -> classify -> label pipeline
//! against a scripted provider and classifier, verifying the end-to-end
//! behaviors the service promises the façade.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use config::Config;
use mail::{
    Account, ActionHandler, Classification, Classify, ClassifyInput, EmailAddress, Event,
    EventBus, FetchDelta, Folder, MailFlag, MessageBody, MessageFilter, MessageStore,
    OutgoingMessage, PendingOp, Priority, Provider, ProviderError, RemoteMessage, RetryPolicy,
    SyncContext, SyncCursor, sync_account,
};

// ===========================================================================
// Scripted collaborators
// ===========================================================================

#[derive(Default, Clone)]
struct ProviderCalls {
    set_flags: Arc<Mutex<Vec<(String, Vec<MailFlag>, Vec<MailFlag>)>>>,
    moves: Arc<Mutex<Vec<(String, Folder, Folder)>>>,
    deletes: Arc<Mutex<Vec<String>>>,
}

/// Provider stub: serves one scripted inbox delta, records mutations
struct MockProvider {
    inbox: Vec<RemoteMessage>,
    served: bool,
    calls: ProviderCalls,
    /// Remaining move_message calls that fail with a transient error
    failing_moves: usize,
}

impl MockProvider {
    fn new(inbox: Vec<RemoteMessage>) -> Self {
        Self {
            inbox,
            served: false,
            calls: ProviderCalls::default(),
            failing_moves: 0,
        }
    }

    fn calls(&self) -> ProviderCalls {
        self.calls.clone()
    }
}

impl Provider for MockProvider {
    fn authenticate(&mut self) -> Result<(), ProviderError> {
        Ok(())
    }

    fn list_folders(&mut self) -> Result<Vec<Folder>, ProviderError> {
        Ok(vec![Folder::Inbox, Folder::Sent, Folder::Trash])
    }

    fn fetch_delta(
        &mut self,
        _cursor: &SyncCursor,
        folder: Folder,
        max: usize,
    ) -> Result<FetchDelta, ProviderError> {
        let messages = if folder == Folder::Inbox && !self.served {
            self.served = true;
            self.inbox.iter().take(max).cloned().collect()
        } else {
            Vec::new()
        };
        Ok(FetchDelta {
            messages,
            cursor: SyncCursor::Gmail {
                history_id: Some("h-next".to_string()),
                last_sync: Some(Utc::now()),
            },
            complete: true,
        })
    }

    fn fetch_body(&mut self, _provider_id: &str) -> Result<MessageBody, ProviderError> {
        Ok(MessageBody::default())
    }

    fn set_flags(
        &mut self,
        provider_id: &str,
        add: &[MailFlag],
        remove: &[MailFlag],
    ) -> Result<(), ProviderError> {
        self.calls.set_flags.lock().unwrap().push((
            provider_id.to_string(),
            add.to_vec(),
            remove.to_vec(),
        ));
        Ok(())
    }

    fn move_message(
        &mut self,
        provider_id: &str,
        from: Folder,
        to: Folder,
    ) -> Result<(), ProviderError> {
        if self.failing_moves > 0 {
            self.failing_moves -= 1;
            return Err(ProviderError::Transient("scripted failure".to_string()));
        }
        self.calls
            .moves
            .lock()
            .unwrap()
            .push((provider_id.to_string(), from, to));
        Ok(())
    }

    fn permanent_delete(&mut self, provider_id: &str) -> Result<(), ProviderError> {
        self.calls.deletes.lock().unwrap().push(provider_id.to_string());
        Ok(())
    }

    fn send(&mut self, _outgoing: &OutgoingMessage) -> Result<String, ProviderError> {
        Ok("sent-1".to_string())
    }

    fn supports_keywords(&self) -> bool {
        true
    }

    fn supports_idle(&self) -> bool {
        false
    }
}

/// Classifier stub: fixed tag verdict, captures every input it sees
struct ScriptedClassifier {
    tags: Vec<String>,
    inputs: Arc<Mutex<Vec<ClassifyInput>>>,
}

impl ScriptedClassifier {
    fn new(tags: &[&str]) -> Self {
        Self {
            tags: tags.iter().map(|s| s.to_string()).collect(),
            inputs: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Classify for ScriptedClassifier {
    fn classify(&self, input: &ClassifyInput) -> anyhow::Result<Classification> {
        self.inputs.lock().unwrap().push(input.clone());
        Ok(Classification {
            message_id: input.message_id,
            tags: self.tags.clone(),
            priority: Priority::Normal,
            action_required: true,
            can_archive: false,
            confidence: 0.92,
            model: "scripted".to_string(),
            classified_at: Utc::now(),
        })
    }
}

// ===========================================================================
// Fixtures
// ===========================================================================

fn test_config() -> Config {
    Config::from_json(
        r#"{
            "accounts": {
                "acct": {
                    "provider": "gmail",
                    "email": "me@example.com",
                    "credentialFile": "/tmp/acct.token"
                }
            }
        }"#,
    )
    .unwrap()
}

fn test_account(config: &Config) -> Account {
    Account::from_config("acct", config, &config.accounts["acct"])
}

fn setup() -> (Arc<MessageStore>, Arc<EventBus>, Config, Account) {
    let config = test_config();
    let account = test_account(&config);
    let store = Arc::new(MessageStore::open_in_memory().unwrap());
    store.register_account(&account).unwrap();
    (store, Arc::new(EventBus::new()), config, account)
}

fn remote(provider_id: &str, subject: &str, sender: &str) -> RemoteMessage {
    RemoteMessage {
        provider_id: provider_id.to_string(),
        thread_id: format!("t-{provider_id}"),
        subject: subject.to_string(),
        sender: EmailAddress::parse(sender),
        recipients: vec![EmailAddress::new("me@example.com")],
        received_at: Utc::now(),
        snippet: format!("{subject} snippet"),
        folder: Folder::Inbox,
        is_unread: true,
        has_attachments: false,
        labels: vec!["INBOX".to_string()],
    }
}

fn run_sync(
    store: &MessageStore,
    bus: &EventBus,
    config: &Config,
    account: &mut Account,
    provider: &mut dyn Provider,
    classifier: Option<&dyn Classify>,
) -> mail::SyncStats {
    let cancel = AtomicBool::new(false);
    let ctx = SyncContext {
        store,
        bus,
        config,
        cancel: &cancel,
    };
    sync_account(&ctx, account, provider, classifier).unwrap()
}

// ===========================================================================
// End-to-end scenarios
// ===========================================================================

#[test]
fn test_fresh_message_is_classified_and_labeled() {
    let (store, bus, config, mut account) = setup();
    let mut provider = MockProvider::new(vec![remote(
        "m-invoice",
        "Invoice #1047 due",
        "billing@acme.com",
    )]);
    let calls = provider.calls();
    let classifier = ScriptedClassifier::new(&["finance", "invoice"]);

    let stats = run_sync(&store, &bus, &config, &mut account, &mut provider, Some(&classifier));

    assert_eq!(stats.fetched, 1);
    assert_eq!(stats.classified, 1);
    assert_eq!(stats.errors, 0);

    let message = store
        .get_message_by_provider_id("acct", "m-invoice")
        .unwrap()
        .unwrap();
    assert!(message.is_unread);
    let classification = store.get_classification(message.id).unwrap().unwrap();
    assert_eq!(classification.tags, vec!["finance", "invoice"]);

    // Both AI labels pushed under the account prefix, nothing removed
    let flag_calls = calls.set_flags.lock().unwrap();
    assert_eq!(flag_calls.len(), 1);
    let (id, add, remove) = &flag_calls[0];
    assert_eq!(id, "m-invoice");
    assert!(add.contains(&MailFlag::Label("AI/finance".to_string())));
    assert!(add.contains(&MailFlag::Label("AI/invoice".to_string())));
    assert!(remove.is_empty());

    // The local mirror reflects the pushed labels
    let message = store.get_message(message.id).unwrap().unwrap();
    assert!(message.provider_labels.contains(&"AI/finance".to_string()));
    assert!(!account.cursor.is_initial());
}

#[test]
fn test_mark_read_then_unread_annihilates_in_queue() {
    let (store, bus, _config, _account) = setup();
    let (id, _) = store
        .upsert_remote("acct", &remote("m1", "Hello", "a@b.c"), false, false)
        .unwrap();
    let handler = ActionHandler::new(store.clone(), bus.clone());

    handler.mark_read(id, false).unwrap();
    let ops = store.pending_operations("acct", 50).unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].op, PendingOp::MarkRead);

    handler.mark_read(id, true).unwrap();
    assert_eq!(store.count_pending("acct").unwrap(), 0);
    assert!(store.get_message(id).unwrap().unwrap().is_unread);
}

#[test]
fn test_trash_restore_before_sync_moves_nothing() {
    let (store, bus, config, mut account) = setup();
    let (id, _) = store
        .upsert_remote("acct", &remote("m1", "Hello", "a@b.c"), false, false)
        .unwrap();
    let handler = ActionHandler::new(store.clone(), bus.clone());

    handler.trash(id).unwrap();
    handler.restore(id).unwrap();

    let message = store.get_message(id).unwrap().unwrap();
    assert_eq!(message.folder, Folder::Inbox);
    assert_eq!(message.original_folder, None);
    assert_eq!(store.count_pending("acct").unwrap(), 0);

    let mut provider = MockProvider::new(vec![]);
    let calls = provider.calls();
    let stats = run_sync(&store, &bus, &config, &mut account, &mut provider, None);

    assert_eq!(stats.actions_processed, 0);
    assert!(calls.moves.lock().unwrap().is_empty());
}

#[test]
fn test_feedback_history_reaches_classifier_and_counts_usage() {
    let (store, bus, config, mut account) = setup();

    // Two prior corrections from the github.com domain
    let (first_id, _) = store
        .upsert_remote(
            "acct",
            &remote("m-prior", "Build failed for run 4711", "ci@github.com"),
            false,
            false,
        )
        .unwrap();
    let prior = store.get_message(first_id).unwrap().unwrap();
    let fb1 = store
        .record_correction("acct", &prior, &["dev".to_string()], &["dev".to_string(), "work".to_string()])
        .unwrap()
        .unwrap();
    let fb2 = store
        .record_correction("acct", &prior, &["dev".to_string()], &["dev".to_string(), "work".to_string()])
        .unwrap()
        .unwrap();
    // The prior message itself is already classified
    store
        .upsert_classification(&Classification {
            message_id: first_id,
            tags: vec!["dev".to_string(), "work".to_string()],
            priority: Priority::Normal,
            action_required: false,
            can_archive: false,
            confidence: 1.0,
            model: "user".to_string(),
            classified_at: Utc::now(),
        })
        .unwrap();
    store.mark_labels_pushed(first_id, &[]).unwrap();

    let mut provider = MockProvider::new(vec![remote(
        "m-new",
        "Deploy finished",
        "alerts@github.com",
    )]);
    let classifier = ScriptedClassifier::new(&["dev", "work"]);
    run_sync(&store, &bus, &config, &mut account, &mut provider, Some(&classifier));

    // The classifier saw both corrections as few-shot examples
    let inputs = classifier.inputs.lock().unwrap();
    assert_eq!(inputs.len(), 1);
    assert_eq!(inputs[0].examples.len(), 2);
    assert!(inputs[0]
        .examples
        .iter()
        .all(|e| e.sender_domain == "github.com"));

    let new_message = store
        .get_message_by_provider_id("acct", "m-new")
        .unwrap()
        .unwrap();
    let classification = store.get_classification(new_message.id).unwrap().unwrap();
    assert!(classification.tags.contains(&"work".to_string()));

    // Each example's used_count ticked up
    assert_eq!(store.get_feedback(fb1).unwrap().unwrap().used_count, 1);
    assert_eq!(store.get_feedback(fb2).unwrap().unwrap().used_count, 1);
}

#[test]
fn test_pending_op_gives_up_after_three_drains() {
    let (store, bus, _config, _account) = setup();
    let (id, _) = store
        .upsert_remote("acct", &remote("m1", "Hello", "a@b.c"), false, false)
        .unwrap();
    let handler = ActionHandler::new(store.clone(), bus.clone());
    handler.trash(id).unwrap();

    let mut provider = MockProvider::new(vec![]);
    provider.failing_moves = usize::MAX;
    let calls = provider.calls();
    let retry = RetryPolicy::immediate(1);
    let events = bus.subscribe();

    for expected_attempts in 1..=3u32 {
        let completed =
            mail::queue::drain(&store, &bus, &mut provider, &retry, "acct").unwrap();
        assert!(completed.is_empty());
        if expected_attempts < 3 {
            let ops = store.pending_operations("acct", 50).unwrap();
            assert_eq!(ops.len(), 1);
            assert_eq!(ops[0].attempts, expected_attempts);
        }
    }

    // Marked failed, no longer drained, failure announced
    assert!(store.pending_operations("acct", 50).unwrap().is_empty());
    let completed = mail::queue::drain(&store, &bus, &mut provider, &retry, "acct").unwrap();
    assert!(completed.is_empty());
    assert!(calls.moves.lock().unwrap().is_empty());

    let mut saw_failure = false;
    while let Some(event) = events.try_recv() {
        if matches!(event, Event::PendingFailed { .. }) {
            saw_failure = true;
        }
    }
    assert!(saw_failure);
}

#[test]
fn test_tag_edit_records_feedback_with_sender_domain() {
    let (store, bus, _config, _account) = setup();
    let (id, _) = store
        .upsert_remote("acct", &remote("m1", "Standup notes", "team@corp.example"), false, false)
        .unwrap();
    store
        .upsert_classification(&Classification {
            message_id: id,
            tags: vec!["dev".to_string()],
            priority: Priority::Normal,
            action_required: false,
            can_archive: false,
            confidence: 0.8,
            model: "m".to_string(),
            classified_at: Utc::now(),
        })
        .unwrap();

    let handler = ActionHandler::new(store.clone(), bus.clone());
    handler
        .update_tags(id, vec!["dev".to_string(), "work".to_string()])
        .unwrap();

    assert_eq!(store.count_feedback("acct").unwrap(), 1);
    let examples = store.select_examples("acct", "corp.example", 5).unwrap();
    assert_eq!(examples.len(), 1);
    assert_eq!(examples[0].sender_domain, "corp.example");
    assert_eq!(examples[0].original_tags, vec!["dev"]);
    assert_eq!(examples[0].corrected_tags, vec!["dev", "work"]);

    // Submitting the identical set again records nothing
    handler
        .update_tags(id, vec!["work".to_string(), "dev".to_string()])
        .unwrap();
    assert_eq!(store.count_feedback("acct").unwrap(), 1);
}

// ===========================================================================
// Cross-cutting invariants
// ===========================================================================

#[test]
fn test_empty_fetch_advances_cursor_without_touching_store() {
    let (store, bus, config, mut account) = setup();
    let mut provider = MockProvider::new(vec![]);
    let stats = run_sync(&store, &bus, &config, &mut account, &mut provider, None);

    assert_eq!(stats.fetched, 0);
    assert!(store.list_messages(&MessageFilter::default()).unwrap().is_empty());
    let SyncCursor::Gmail { history_id, .. } = &account.cursor else {
        panic!("cursor kind changed");
    };
    assert_eq!(history_id.as_deref(), Some("h-next"));
}

#[test]
fn test_completed_cycle_op_beats_stale_provider_observation() {
    let (store, bus, config, mut account) = setup();
    let (id, _) = store
        .upsert_remote("acct", &remote("m1", "Hello", "a@b.c"), false, false)
        .unwrap();
    let handler = ActionHandler::new(store.clone(), bus.clone());
    handler.mark_read(id, false).unwrap();

    // The provider snapshot still claims unread; the drain this cycle
    // pushed mark_read, so the local value must survive the fetch
    let mut provider = MockProvider::new(vec![remote("m1", "Hello", "a@b.c")]);
    let stats = run_sync(&store, &bus, &config, &mut account, &mut provider, None);

    assert_eq!(stats.actions_processed, 1);
    assert!(!store.get_message(id).unwrap().unwrap().is_unread);
}

#[test]
fn test_provider_observation_wins_when_nothing_is_pending() {
    let (store, bus, config, mut account) = setup();
    let (id, _) = store
        .upsert_remote("acct", &remote("m1", "Hello", "a@b.c"), false, false)
        .unwrap();
    store
        .update_message(
            id,
            &mail::MessageUpdate {
                is_unread: Some(false),
                ..Default::default()
            },
        )
        .unwrap();

    // No pending op: the remote truth (unread) is adopted
    let mut provider = MockProvider::new(vec![remote("m1", "Hello", "a@b.c")]);
    run_sync(&store, &bus, &config, &mut account, &mut provider, None);
    assert!(store.get_message(id).unwrap().unwrap().is_unread);
}

#[test]
fn test_provider_id_uniqueness_across_repeated_syncs() {
    let (store, bus, config, mut account) = setup();
    let inbox = vec![remote("m1", "Hello", "a@b.c")];

    let mut provider = MockProvider::new(inbox.clone());
    run_sync(&store, &bus, &config, &mut account, &mut provider, None);
    let mut provider = MockProvider::new(inbox);
    run_sync(&store, &bus, &config, &mut account, &mut provider, None);

    assert_eq!(store.list_messages(&MessageFilter::default()).unwrap().len(), 1);
}

#[test]
fn test_sync_events_are_published_in_order() {
    let (store, bus, config, mut account) = setup();
    let events = bus.subscribe();
    let mut provider = MockProvider::new(vec![remote("m1", "Hello", "a@b.c")]);
    let classifier = ScriptedClassifier::new(&["work"]);
    run_sync(&store, &bus, &config, &mut account, &mut provider, Some(&classifier));

    assert!(matches!(events.try_recv(), Some(Event::SyncStarted { .. })));
    assert!(matches!(events.try_recv(), Some(Event::MessageClassified { .. })));
    match events.try_recv() {
        Some(Event::SyncCompleted { account_id, stats }) => {
            assert_eq!(account_id, "acct");
            assert_eq!(stats.fetched, 1);
            assert_eq!(stats.classified, 1);
        }
        other => panic!("expected SyncCompleted, got {other:?}"),
    }
}

#[test]
fn test_classifier_disabled_leaves_messages_unclassified() {
    let (store, bus, config, mut account) = setup();
    let mut provider = MockProvider::new(vec![remote("m1", "Hello", "a@b.c")]);
    let stats = run_sync(&store, &bus, &config, &mut account, &mut provider, None);

    assert_eq!(stats.fetched, 1);
    assert_eq!(stats.classified, 0);
    let message = store.get_message_by_provider_id("acct", "m1").unwrap().unwrap();
    assert!(store.get_classification(message.id).unwrap().is_none());
}

#[test]
fn test_failing_classifier_pauses_after_three_but_sync_survives() {
    struct FailingClassifier;
    impl Classify for FailingClassifier {
        fn classify(&self, _input: &ClassifyInput) -> anyhow::Result<Classification> {
            anyhow::bail!("endpoint down")
        }
    }

    let (store, bus, config, mut account) = setup();
    let inbox: Vec<RemoteMessage> = (0..5)
        .map(|i| remote(&format!("m{i}"), &format!("Subject {i}"), "a@b.c"))
        .collect();
    let mut provider = MockProvider::new(inbox);
    let stats = run_sync(
        &store,
        &bus,
        &config,
        &mut account,
        &mut provider,
        Some(&FailingClassifier),
    );

    // Fetch kept going, nothing was classified, everything remains
    // eligible for the next cycle
    assert_eq!(stats.fetched, 5);
    assert_eq!(stats.classified, 0);
    assert_eq!(store.unclassified_message_ids("acct", 100).unwrap().len(), 5);
    assert!(!account.cursor.is_initial());
}

#[test]
fn test_reclassification_replaces_in_place() {
    let (store, bus, config, mut account) = setup();
    let mut provider = MockProvider::new(vec![remote("m1", "Hello", "a@b.c")]);
    let first = ScriptedClassifier::new(&["dev"]);
    run_sync(&store, &bus, &config, &mut account, &mut provider, Some(&first));

    let message = store.get_message_by_provider_id("acct", "m1").unwrap().unwrap();
    assert_eq!(
        store.get_classification(message.id).unwrap().unwrap().tags,
        vec!["dev"]
    );

    let cancel = AtomicBool::new(false);
    let ctx = SyncContext {
        store: &store,
        bus: &bus,
        config: &config,
        cancel: &cancel,
    };
    let second = ScriptedClassifier::new(&["work"]);
    let count = mail::reclassify_account(&ctx, &account, &second).unwrap();

    assert_eq!(count, 1);
    assert_eq!(
        store.get_classification(message.id).unwrap().unwrap().tags,
        vec!["work"]
    );
}

#[test]
fn test_tag_sidebar_counts_follow_filters() {
    let (store, bus, config, mut account) = setup();
    let mut provider = MockProvider::new(vec![
        remote("m1", "Invoice", "billing@acme.com"),
        remote("m2", "Standup", "team@corp.example"),
    ]);
    let classifier = ScriptedClassifier::new(&["work"]);
    run_sync(&store, &bus, &config, &mut account, &mut provider, Some(&classifier));

    let counts: BTreeMap<String, i64> =
        mail::query::tag_counts(&store, &MessageFilter::default()).unwrap();
    assert_eq!(counts["work"], 2);
    assert_eq!(counts["acct"], 2);

    let filtered = mail::query::list_messages(
        &store,
        &MessageFilter {
            tags: vec!["work".to_string()],
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(filtered.len(), 2);
    assert!(filtered.iter().all(|v| v.classification.is_some()));
}
