//! siftd - the sift mail service daemon
//!
//! Loads the configuration, starts the mail service, and drives it:
//! a periodic sync trigger per account, hourly maintenance, and a clean
//! shutdown on Ctrl-C. The HTTP/WebSocket façade embeds the same
//! service type; this binary is the headless shell.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{error, info};

use config::Config;
use mail::{Event, MailService};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let config_path = parse_args()?;
    let config = Config::load(config_path.as_deref()).context("loading configuration")?;
    let interval = Duration::from_secs(config.sync.interval_secs);
    info!(
        "Loaded {} account(s), sync interval {}s",
        config.accounts.len(),
        interval.as_secs()
    );

    let service = Arc::new(MailService::start(config)?);

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            info!("Shutdown requested");
            running.store(false, Ordering::SeqCst);
        })
        .context("installing signal handler")?;
    }

    // Surface sync outcomes in the log the way a façade would over
    // its event channel
    let events = service.subscribe();
    let event_logger = {
        let running = running.clone();
        std::thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                match events.recv_timeout(Duration::from_millis(500)) {
                    Some(Event::SyncCompleted { account_id, stats }) => info!(
                        "{account_id}: {} fetched, {} classified, {} actions, {} errors",
                        stats.fetched, stats.classified, stats.actions_processed, stats.errors
                    ),
                    Some(Event::PendingFailed { operation_id, error }) => {
                        error!("Pending operation {operation_id} gave up: {error}")
                    }
                    Some(Event::AccountError { account_id, error }) => {
                        error!("{account_id}: {error}")
                    }
                    _ => {}
                }
            }
        })
    };

    // First cycle immediately, then on the configured cadence
    service.trigger_sync(None);
    let mut next_sync = Instant::now() + interval;
    let mut next_maintenance = Instant::now() + Duration::from_secs(3600);

    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= next_sync {
            service.trigger_sync(None);
            next_sync = now + interval;
        }
        if now >= next_maintenance {
            if let Err(e) = service.run_maintenance() {
                error!("Maintenance failed: {e:#}");
            }
            next_maintenance = now + Duration::from_secs(3600);
        }
        std::thread::sleep(Duration::from_millis(250));
    }

    service.shutdown();
    let _ = event_logger.join();
    Ok(())
}

/// `siftd [--config <path>]`
fn parse_args() -> Result<Option<PathBuf>> {
    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        None => Ok(None),
        Some("--config") => {
            let path = args.next().context("--config requires a path")?;
            Ok(Some(PathBuf::from(path)))
        }
        Some(other) => anyhow::bail!("unknown argument: {other} (usage: siftd [--config <path>])"),
    }
}
