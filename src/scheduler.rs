//! Per-source polling loops.
//!
//! Every [`SourceClient`] gets its own task with its own interval. A loop owns
//! at most one in-flight fetch: a tick (or refresh request) that arrives while
//! the previous fetch is still running is skipped, not queued. Each completed
//! fetch is sent to the controller as a [`SourceReport`] tagged with a
//! per-source sequence number taken when the fetch started.
//!
//! Failures are values, never panics or early exits: a failed fetch is
//! reported and the loop waits for its next tick.
//!
//! ```text
//!  ┌──────────── loop ────────────┐
//!  │ cancelled        -> exit      │
//!  │ pending finished -> report    │
//!  │ tick | refresh   -> fetch     │
//!  │   (skipped if one is pending) │
//!  └───────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::{FetchError, Result};
use crate::models::SourceTag;
use crate::sources::{RawBatch, SourceClient};

/// Outcome of one fetch, as handed to the controller.
#[derive(Debug)]
pub struct SourceReport {
    pub tag: SourceTag,
    /// Monotonic per source, assigned when the fetch started.
    pub seq: u64,
    pub completed_at: DateTime<Utc>,
    pub outcome: Result<RawBatch>,
}

/// In-tick retry for transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 1,
            delay: Duration::from_secs(1),
        }
    }
}

type PendingFetch<'a> = Pin<Box<dyn Future<Output = Result<RawBatch>> + Send + 'a>>;

pub struct Scheduler {
    cancel: CancellationToken,
    tasks: Vec<(SourceTag, JoinHandle<()>)>,
    refresh: HashMap<SourceTag, Arc<Notify>>,
}

impl Scheduler {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            tasks: Vec::new(),
            refresh: HashMap::new(),
        }
    }

    /// Start polling `client` every `interval`. The first fetch is immediate.
    pub fn spawn<C>(&mut self, client: Arc<C>, interval: Duration, retry: RetryPolicy, reports: mpsc::Sender<SourceReport>)
    where
        C: SourceClient + 'static,
    {
        let tag = client.tag();
        let refresh = Arc::new(Notify::new());
        let cancel = self.cancel.child_token();

        tracing::info!(source = %tag, interval_secs = interval.as_secs(), "Starting source poller");

        let handle = tokio::spawn(run_source(client, interval, retry, refresh.clone(), reports, cancel));
        self.refresh.insert(tag, refresh);
        self.tasks.push((tag, handle));
    }

    pub fn sources(&self) -> Vec<SourceTag> {
        self.tasks.iter().map(|(tag, _)| *tag).collect()
    }

    /// Ask a source to poll now. Subject to the same overlap guard as ticks.
    pub fn refresh(&self, tag: SourceTag) -> bool {
        match self.refresh.get(&tag) {
            Some(notify) => {
                notify.notify_one();
                true
            }
            None => false,
        }
    }

    pub fn refresh_all(&self) {
        for notify in self.refresh.values() {
            notify.notify_one();
        }
    }

    /// Cancel every loop and wait for them to exit. In-flight fetches are dropped.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for (tag, handle) in self.tasks {
            if let Err(e) = handle.await {
                tracing::warn!(source = %tag, error = %e, "Source poller ended abnormally");
            }
        }
        tracing::info!("Schedulers stopped");
    }
}

async fn run_source<C: SourceClient>(
    client: Arc<C>,
    interval: Duration,
    retry: RetryPolicy,
    refresh: Arc<Notify>,
    reports: mpsc::Sender<SourceReport>,
    cancel: CancellationToken,
) {
    let tag = client.tag();
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut seq: u64 = 0;
    let mut pending: Option<(u64, PendingFetch<'_>)> = None;

    loop {
        let trigger = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            (finished_seq, outcome) = wait_pending(&mut pending) => {
                pending = None;
                log_outcome(tag, finished_seq, &outcome);
                let report = SourceReport {
                    tag,
                    seq: finished_seq,
                    completed_at: Utc::now(),
                    outcome,
                };
                if reports.send(report).await.is_err() {
                    tracing::debug!(source = %tag, "Report receiver closed, stopping poller");
                    break;
                }
                continue;
            }
            _ = ticker.tick() => "tick",
            _ = refresh.notified() => "refresh",
        };

        if let Some((running, _)) = &pending {
            tracing::debug!(source = %tag, seq = *running, trigger, "Previous fetch still pending, skipping");
            continue;
        }

        seq += 1;
        tracing::trace!(source = %tag, seq, trigger, "Starting fetch");
        pending = Some((seq, Box::pin(fetch_with_retry(client.as_ref(), retry))));
    }

    tracing::debug!(source = %tag, "Source poller stopped");
}

async fn wait_pending(pending: &mut Option<(u64, PendingFetch<'_>)>) -> (u64, Result<RawBatch>) {
    match pending.as_mut() {
        Some((seq, fetch)) => (*seq, fetch.await),
        None => std::future::pending().await,
    }
}

async fn fetch_with_retry<C: SourceClient>(client: &C, retry: RetryPolicy) -> Result<RawBatch> {
    let mut attempt = 0;
    loop {
        match client.fetch().await {
            Err(e) if e.is_retryable() && attempt < retry.retries => {
                attempt += 1;
                tracing::debug!(source = %client.tag(), attempt, error = %e, "Retrying fetch");
                tokio::time::sleep(retry.delay).await;
            }
            outcome => return outcome,
        }
    }
}

fn log_outcome(tag: SourceTag, seq: u64, outcome: &Result<RawBatch>) {
    match outcome {
        Ok(batch) => match batch.partial_failure() {
            Some(FetchError::PartialSourceFailure { failed, total }) => {
                tracing::warn!(source = %tag, seq, failed, total, "Partial source failure")
            }
            _ => tracing::debug!(source = %tag, seq, count = batch.len(), "Fetch complete"),
        },
        Err(e) => tracing::warn!(source = %tag, seq, error = %e, "Fetch failed"),
    }
}
