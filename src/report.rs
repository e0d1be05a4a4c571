//! Per-image outcomes and what happens to them.
//!
//! Every outcome is logged and counted. When reporting is enabled outcomes
//! also travel over a bounded channel to a single consumer task that keeps
//! the entries selected by the report level, optionally pushes them to a url
//! in batches, and hands back a [`SyncReport`] when the run is finished.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ReportConfig;
use crate::image::Image;
use crate::retry::{RetryError, RetryPolicy, retry};

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::AsRefStr,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SyncStatus {
    SkippedUnchanged,
    Synced,
    FailedFetch,
    FailedCopy,
    /// Copied, but the fingerprint could not be saved.
    FailedPersist,
}

impl SyncStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::FailedFetch | Self::FailedCopy)
    }

    /// The image reached the destination during this run.
    pub fn is_transferred(&self) -> bool {
        matches!(self, Self::Synced | Self::FailedPersist)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub image: Image,
    pub status: SyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncOutcome {
    pub fn new(image: Image, status: SyncStatus) -> Self {
        Self {
            image,
            status,
            error: None,
        }
    }

    pub fn with_error(image: Image, status: SyncStatus, error: impl std::fmt::Display) -> Self {
        Self {
            image,
            status,
            error: Some(error.to_string()),
        }
    }
}

/// Which outcomes end up as entries in the report. Counts always cover all.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ReportLevel {
    #[default]
    Failures,
    Changes,
    All,
}

impl ReportLevel {
    pub fn includes(&self, status: SyncStatus) -> bool {
        match self {
            Self::Failures => status.is_failure() || status == SyncStatus::FailedPersist,
            Self::Changes => status != SyncStatus::SkippedUnchanged,
            Self::All => true,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportTotals {
    pub skipped_unchanged: u64,
    pub synced: u64,
    pub failed_fetch: u64,
    pub failed_copy: u64,
    pub failed_persist: u64,
}

impl ReportTotals {
    pub fn get(&self, status: SyncStatus) -> u64 {
        match status {
            SyncStatus::SkippedUnchanged => self.skipped_unchanged,
            SyncStatus::Synced => self.synced,
            SyncStatus::FailedFetch => self.failed_fetch,
            SyncStatus::FailedCopy => self.failed_copy,
            SyncStatus::FailedPersist => self.failed_persist,
        }
    }

    pub fn total(&self) -> u64 {
        self.skipped_unchanged
            + self.synced
            + self.failed_fetch
            + self.failed_copy
            + self.failed_persist
    }

    pub fn transferred(&self) -> u64 {
        self.synced + self.failed_persist
    }

    pub fn failed(&self) -> u64 {
        self.failed_fetch + self.failed_copy
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub totals: ReportTotals,
    pub outcomes: Vec<SyncOutcome>,
}

impl SyncReport {
    pub async fn write(&self, path: &Path) -> std::io::Result<()> {
        let body = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(path, body).await
    }
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct OutcomeLabels {
    status: String,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct PushLabels {
    status: String,
}

/// Cheap to clone; one per worker task.
#[derive(Clone)]
pub struct ReportHandle {
    tx: Option<mpsc::Sender<SyncOutcome>>,
    outcomes: Family<OutcomeLabels, Counter>,
}

impl ReportHandle {
    pub async fn send(&self, outcome: SyncOutcome) {
        let image = &outcome.image;
        let cause = outcome.error.as_deref().unwrap_or_default();

        match outcome.status {
            SyncStatus::SkippedUnchanged => debug!("Report: {image} unchanged, skipped"),
            SyncStatus::Synced => info!("Report: {image} synced"),
            SyncStatus::FailedFetch => error!("Report: {image} manifest fetch failed: {cause}"),
            SyncStatus::FailedCopy => error!("Report: {image} copy failed: {cause}"),
            SyncStatus::FailedPersist => {
                warn!("Report: {image} synced but fingerprint not saved: {cause}")
            }
        }

        self.outcomes
            .get_or_create(&OutcomeLabels {
                status: outcome.status.to_string(),
            })
            .inc();

        if let Some(tx) = &self.tx {
            if let Err(err) = tx.send(outcome).await {
                warn!("Report: consumer has gone away, dropping {}", err.0.image);
            }
        }
    }

    pub fn count(&self, status: SyncStatus) -> u64 {
        self.outcomes
            .get_or_create(&OutcomeLabels {
                status: status.to_string(),
            })
            .get()
    }

    fn totals(&self) -> ReportTotals {
        ReportTotals {
            skipped_unchanged: self.count(SyncStatus::SkippedUnchanged),
            synced: self.count(SyncStatus::Synced),
            failed_fetch: self.count(SyncStatus::FailedFetch),
            failed_copy: self.count(SyncStatus::FailedCopy),
            failed_persist: self.count(SyncStatus::FailedPersist),
        }
    }
}

pub struct Reporter {
    handle: ReportHandle,
    file: Option<PathBuf>,
    started_at: DateTime<Utc>,
    done: CancellationToken,
    consumer: Option<JoinHandle<Vec<SyncOutcome>>>,
}

impl Reporter {
    /// `capacity` bounds the channel between workers and the consumer; use
    /// the worker concurrency limit.
    pub fn start(
        config: &ReportConfig,
        capacity: usize,
        retry_policy: RetryPolicy,
        registry: &mut Registry,
    ) -> Self {
        let outcomes = Family::<OutcomeLabels, Counter>::default();
        registry.register("images", "Images processed by status", outcomes.clone());

        let done = CancellationToken::new();

        if !config.enabled {
            return Self {
                handle: ReportHandle { tx: None, outcomes },
                file: None,
                started_at: Utc::now(),
                done,
                consumer: None,
            };
        }

        let pushes = Family::<PushLabels, Counter>::default();
        registry.register(
            "report_push",
            "Outcome batches pushed to the report url",
            pushes.clone(),
        );

        let (tx, rx) = mpsc::channel(capacity.max(1));
        let consumer = tokio::spawn(consume(
            rx,
            config.clone(),
            retry_policy,
            pushes,
            done.clone(),
        ));

        Self {
            handle: ReportHandle {
                tx: Some(tx),
                outcomes,
            },
            file: config.file.clone(),
            started_at: Utc::now(),
            done,
            consumer: Some(consumer),
        }
    }

    pub fn handle(&self) -> ReportHandle {
        self.handle.clone()
    }

    /// Drains whatever is still queued and builds the final report.
    pub async fn finish(self) -> SyncReport {
        self.done.cancel();

        let outcomes = match self.consumer {
            Some(consumer) => consumer.await.unwrap_or_else(|err| {
                error!("Report: consumer task failed: {err}");
                vec![]
            }),
            None => vec![],
        };

        let report = SyncReport {
            started_at: self.started_at,
            finished_at: Utc::now(),
            totals: self.handle.totals(),
            outcomes,
        };

        if let Some(path) = &self.file {
            match report.write(path).await {
                Ok(()) => info!("Report: written to {}", path.display()),
                Err(err) => error!("Report: failed to write {}: {err}", path.display()),
            }
        }

        report
    }
}

async fn consume(
    mut rx: mpsc::Receiver<SyncOutcome>,
    config: ReportConfig,
    retry_policy: RetryPolicy,
    pushes: Family<PushLabels, Counter>,
    done: CancellationToken,
) -> Vec<SyncOutcome> {
    let client = reqwest::Client::new();
    let batch_size = config.batch_size.max(1);
    let mut kept = Vec::new();
    let mut buffer = Vec::new();
    let mut deadline = Instant::now() + config.flush_interval;

    loop {
        tokio::select! {
            maybe_outcome = rx.recv() => {
                let Some(outcome) = maybe_outcome else {
                    break;
                };

                if !config.level.includes(outcome.status) {
                    continue;
                }

                if config.url.is_some() {
                    buffer.push(outcome.clone());
                }
                kept.push(outcome);

                if let Some(url) = &config.url {
                    if buffer.len() >= batch_size {
                        push_batch(&client, &buffer, url, &pushes, retry_policy).await;
                        buffer.clear();
                        deadline = Instant::now() + config.flush_interval;
                    }
                }
            }
            _ = sleep_until(deadline), if config.url.is_some() => {
                if let Some(url) = &config.url {
                    if !buffer.is_empty() {
                        push_batch(&client, &buffer, url, &pushes, retry_policy).await;
                        buffer.clear();
                    }
                }
                deadline = Instant::now() + config.flush_interval;
            }
            _ = done.cancelled() => {
                rx.close();
                while let Some(outcome) = rx.recv().await {
                    if config.level.includes(outcome.status) {
                        if config.url.is_some() {
                            buffer.push(outcome.clone());
                        }
                        kept.push(outcome);
                    }
                }
                break;
            }
        }
    }

    if let Some(url) = &config.url {
        for batch in buffer.chunks(batch_size) {
            push_batch(&client, batch, url, &pushes, retry_policy).await;
        }
    }

    kept
}

async fn push_batch(
    client: &reqwest::Client,
    batch: &[SyncOutcome],
    url: &str,
    pushes: &Family<PushLabels, Counter>,
    retry_policy: RetryPolicy,
) {
    let payload = &json!({ "outcomes": batch });

    let result = retry(retry_policy, &CancellationToken::new(), move || async move {
        let resp = client.post(url).json(&payload).send().await;

        let status = match &resp {
            Ok(r) => r.status().as_u16().to_string(),
            Err(_) => "000".to_string(),
        };
        pushes.get_or_create(&PushLabels { status }).inc();

        match resp {
            Ok(r) if r.status().is_success() => Ok(()),
            Ok(r) => Err(format!("{url} returned {}", r.status())),
            Err(err) => Err(format!("{url}: {err}")),
        }
    })
    .await;

    match result {
        Ok(()) => debug!("Report: pushed {} outcomes to {url}", batch.len()),
        Err(RetryError::Exhausted(err)) => {
            error!("Report: dropping {} outcomes: {err}", batch.len())
        }
        Err(RetryError::Cancelled(_)) => {}
    }
}
