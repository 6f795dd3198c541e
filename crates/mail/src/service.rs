//! Long-running service shell
//!
//! One worker thread per account, each owning a trigger channel. A new
//! trigger during a running cycle stays queued and is coalesced into a
//! single follow-up cycle. Shutdown raises the cancellation flag and
//! closes the channels; in-flight pending operations are either retired
//! or retried on next start.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex, mpsc};
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use log::{debug, info, warn};

use config::Config;

use crate::actions::ActionHandler;
use crate::classify::{Classify, LlmClassifier};
use crate::events::{EventBus, EventReceiver};
use crate::models::Account;
use crate::provider::provider_for;
use crate::store::MessageStore;
use crate::sync::{SyncContext, sync_account};

struct ServiceInner {
    config: Config,
    store: Arc<MessageStore>,
    bus: Arc<EventBus>,
    cancel: Arc<AtomicBool>,
}

/// The assembled service: store, bus, and per-account sync workers
pub struct MailService {
    inner: Arc<ServiceInner>,
    workers: Mutex<HashMap<String, Sender<()>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl MailService {
    /// Open the store, register configured accounts, and spawn a worker
    /// per account. Accounts with broken configuration are skipped;
    /// the rest run.
    pub fn start(config: Config) -> Result<Self> {
        let db_path = config.database_file()?;
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let store = Arc::new(MessageStore::open(&db_path)?);
        let bus = Arc::new(EventBus::new());
        let cancel = Arc::new(AtomicBool::new(false));

        let inner = Arc::new(ServiceInner {
            config,
            store,
            bus,
            cancel,
        });

        let service = Self {
            inner: inner.clone(),
            workers: Mutex::new(HashMap::new()),
            handles: Mutex::new(Vec::new()),
        };

        for (id, account_config) in &inner.config.accounts {
            let account = Account::from_config(id, &inner.config, account_config);
            if let Err(e) = inner.store.register_account(&account) {
                warn!("Skipping account {id}: {e}");
                continue;
            }

            let (tx, rx) = mpsc::channel();
            let worker_inner = inner.clone();
            let account_id = id.clone();
            let handle = std::thread::Builder::new()
                .name(format!("sync-{id}"))
                .spawn(move || account_worker(worker_inner, account_id, rx))
                .context("spawning sync worker")?;

            service.workers.lock().unwrap().insert(id.clone(), tx);
            service.handles.lock().unwrap().push(handle);
        }

        info!(
            "Service started with {} account worker(s)",
            service.workers.lock().unwrap().len()
        );
        Ok(service)
    }

    /// Queue a sync trigger for one account, or for all of them
    pub fn trigger_sync(&self, account_id: Option<&str>) {
        let workers = self.workers.lock().unwrap();
        match account_id {
            Some(id) => {
                if let Some(tx) = workers.get(id) {
                    let _ = tx.send(());
                } else {
                    warn!("Trigger for unknown account {id}");
                }
            }
            None => {
                for tx in workers.values() {
                    let _ = tx.send(());
                }
            }
        }
    }

    /// Register an event subscriber
    pub fn subscribe(&self) -> EventReceiver {
        self.inner.bus.subscribe()
    }

    pub fn store(&self) -> Arc<MessageStore> {
        self.inner.store.clone()
    }

    /// Mutation interface bound to this service's store and bus
    pub fn actions(&self) -> ActionHandler {
        ActionHandler::new(self.inner.store.clone(), self.inner.bus.clone())
    }

    /// Feedback aging and failed-op garbage collection
    pub fn run_maintenance(&self) -> Result<()> {
        let purged = self.inner.store.purge_feedback()?;
        let dropped = self.inner.store.purge_failed_pending(30)?;
        if purged + dropped > 0 {
            info!("Maintenance purged {purged} feedback rows, {dropped} failed ops");
        }
        Ok(())
    }

    /// Raise the cancellation flag, close trigger channels, and wait for
    /// the workers to wind down
    pub fn shutdown(&self) {
        self.inner.cancel.store(true, Ordering::Relaxed);
        self.workers.lock().unwrap().clear();
        for handle in self.handles.lock().unwrap().drain(..) {
            if let Err(e) = handle.join() {
                warn!("Sync worker panicked during shutdown: {e:?}");
            }
        }
        info!("Service stopped");
    }
}

/// Per-account worker loop: block on the trigger channel, coalesce
/// bursts, run one cycle per wake-up
fn account_worker(inner: Arc<ServiceInner>, account_id: String, rx: Receiver<()>) {
    debug!("Worker for {account_id} up");
    while rx.recv().is_ok() {
        if inner.cancel.load(Ordering::Relaxed) {
            break;
        }
        // Triggers that piled up collapse into this one cycle; anything
        // arriving mid-cycle stays queued and earns exactly one more
        loop {
            match rx.try_recv() {
                Ok(()) => continue,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return,
            }
        }

        if let Err(e) = run_cycle(&inner, &account_id) {
            warn!("Sync cycle for {account_id} failed: {e:#}");
        }
    }
    debug!("Worker for {account_id} down");
}

fn run_cycle(inner: &ServiceInner, account_id: &str) -> Result<()> {
    let account_config = inner
        .config
        .accounts
        .get(account_id)
        .with_context(|| format!("account {account_id} missing from config"))?;

    // Settings come fresh from config every trigger; runtime state
    // (cursor, health) comes from the store
    let mut account = Account::from_config(account_id, &inner.config, account_config);
    inner.store.hydrate_account(&mut account)?;

    let mut provider = provider_for(&account)?;
    let classifier = inner
        .config
        .ai
        .enabled
        .then(|| LlmClassifier::new(&inner.config.ai));

    let ctx = SyncContext {
        store: &inner.store,
        bus: &inner.bus,
        config: &inner.config,
        cancel: &inner.cancel,
    };
    sync_account(
        &ctx,
        &mut account,
        provider.as_mut(),
        classifier.as_ref().map(|c| c as &dyn Classify),
    )?;
    Ok(())
}
