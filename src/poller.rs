use anyhow::Result;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::db::{PENDING_KEY, PENDING_THREADS_KEY};
use crate::models::{JobMatchPayload, StagedThreadMessage};
use crate::store::Store;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollStats {
    pub jobs_applied: usize,
    pub messages_applied: usize,
    pub errors: usize,
}

impl PollStats {
    pub fn is_empty(&self) -> bool {
        self.jobs_applied == 0 && self.messages_applied == 0 && self.errors == 0
    }
}

/// Applies everything waiting in the staging area, in the order it was
/// staged. Staged data that cannot be parsed stays where it is.
pub fn poll_once(store: &mut Store) -> PollStats {
    let mut stats = PollStats::default();

    match store.db().take_staged::<Vec<JobMatchPayload>>(PENDING_KEY) {
        Ok(Some(payloads)) => {
            for payload in payloads {
                store.upsert_job_match(payload);
                stats.jobs_applied += 1;
            }
        }
        Ok(None) => {}
        Err(e) => {
            stats.errors += 1;
            warn!(error = %format!("{:#}", e), "Failed to process pending jobs");
        }
    }

    match store.db().take_staged::<Vec<StagedThreadMessage>>(PENDING_THREADS_KEY) {
        Ok(Some(updates)) => {
            for update in updates {
                if store.append_thread_message(&update.job_id, update.message) {
                    stats.messages_applied += 1;
                }
            }
        }
        Ok(None) => {}
        Err(e) => {
            stats.errors += 1;
            warn!(error = %format!("{:#}", e), "Failed to process pending thread updates");
        }
    }

    stats
}

/// Polls the staging area every `every` until Ctrl-C.
pub async fn watch(store: &mut Store, every: Duration) -> Result<()> {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval_ms = every.as_millis() as u64, "Watching staging area");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stats = poll_once(store);
                if !stats.is_empty() {
                    info!(
                        jobs = stats.jobs_applied,
                        messages = stats.messages_applied,
                        errors = stats.errors,
                        "Applied staged payloads"
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Stopping watcher");
                return Ok(());
            }
        }
    }
}
