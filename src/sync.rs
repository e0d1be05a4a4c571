//! Drives a mirroring run: discover, pick the batch, then push every image
//! through the worker pool.
//!
//! Each image goes fetch fingerprint -> compare -> copy -> record -> report.
//! Per-image failures end up in the report and never stop the run.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::partition;
use crate::cache::FingerprintCache;
use crate::catalog::Catalog;
use crate::config::{DEFAULT_LIMIT, RetryConfig};
use crate::copier::{Copier, Credentials};
use crate::error::{CopyError, FetchError, PoolError, SyncError};
use crate::image::{Image, dispatch_order};
use crate::manifest::ManifestFingerprint;
use crate::pool::{PoolStats, WorkerPool};
use crate::registry::ManifestFetcher;
use crate::report::{ReportHandle, SyncOutcome, SyncStatus};
use crate::retry::{RetryError, RetryPolicy, retry};

#[derive(Clone, Debug)]
pub struct SyncOptions {
    pub credentials: Credentials,
    /// Destination registry host.
    pub registry: String,
    /// Limit for each copy attempt.
    pub timeout: Duration,
    /// Images not started by then are abandoned.
    pub deadline: Option<Duration>,
    pub limit: usize,
    pub batch_size: usize,
    pub batch_number: usize,
    pub manifests_only: bool,
    pub kubeadm: bool,
    pub fetch_retry: RetryPolicy,
    pub copy_retry: RetryPolicy,
}

impl Default for SyncOptions {
    fn default() -> Self {
        let retry = RetryConfig::default();

        Self {
            credentials: Credentials::default(),
            registry: "docker.io".to_string(),
            timeout: Duration::from_secs(10 * 60),
            deadline: None,
            limit: DEFAULT_LIMIT,
            batch_size: 0,
            batch_number: 0,
            manifests_only: false,
            kubeadm: false,
            fetch_retry: retry.fetch,
            copy_retry: retry.copy,
        }
    }
}

/// Where images come from: a catalog to list them and a way to read their
/// manifests.
#[derive(Clone)]
pub struct Source {
    pub namespace: String,
    pub catalog: Arc<dyn Catalog>,
    pub manifests: Arc<dyn ManifestFetcher>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunStats {
    /// Images found before batching.
    pub discovered: usize,
    /// Images in the selected batch.
    pub selected: usize,
    /// Images never handed to the pool because the run was cancelled.
    pub not_started: usize,
    pub pool: PoolStats,
}

pub struct Synchronizer {
    options: Arc<SyncOptions>,
    source: Source,
    copier: Arc<dyn Copier>,
    cache: Arc<FingerprintCache>,
    cancel: CancellationToken,
}

impl Synchronizer {
    pub fn new(
        options: SyncOptions,
        source: Source,
        copier: Arc<dyn Copier>,
        cache: Arc<FingerprintCache>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            options: Arc::new(options),
            source,
            copier,
            cache,
            cancel,
        }
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    pub fn cache(&self) -> &Arc<FingerprintCache> {
        &self.cache
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Lists every name in the source namespace and every tag of each name.
    ///
    /// A name whose tags cannot be listed is dropped. The run fails only when
    /// the names cannot be listed, or when there were names but none of them
    /// could be expanded into images.
    pub async fn discover(&self) -> Result<Vec<Image>, SyncError> {
        let catalog = &self.source.catalog;
        let namespace = &self.source.namespace;

        let names = catalog
            .list_names(namespace)
            .await
            .map_err(SyncError::Discovery)?;

        info!(
            "Sync: Found {} names in {}/{namespace}",
            names.len(),
            catalog.repo()
        );

        let mut listings = JoinSet::new();
        for name in names.iter().cloned() {
            if self.cancel.is_cancelled() {
                break;
            }

            let catalog = catalog.clone();
            let namespace = namespace.clone();
            let cancel = self.cancel.clone();
            listings.spawn(async move {
                let tags = tokio::select! {
                    _ = cancel.cancelled() => Err(FetchError::Cancelled),
                    tags = catalog.list_tags(&namespace, &name) => tags,
                };
                (name, tags)
            });
        }

        let mut images = vec![];
        let mut listed = 0;

        while let Some(result) = listings.join_next().await {
            match result {
                Ok((name, Ok(tags))) => {
                    debug!("Sync: {name} has {} tags", tags.len());
                    listed += 1;
                    images.extend(
                        tags.iter()
                            .map(|tag| Image::new(catalog.repo(), namespace, &name, tag)),
                    );
                }
                Ok((name, Err(FetchError::Cancelled))) => {
                    debug!("Sync: Tag listing of {namespace}/{name} cancelled");
                }
                Ok((name, Err(err))) => {
                    error!("Sync: Unable to list tags of {namespace}/{name}: {err}");
                }
                Err(err) => {
                    error!("Sync: Tag listing task failed: {err}");
                }
            }
        }

        if self.cancel.is_cancelled() {
            warn!(
                "Sync: Discovery cancelled after listing {listed} of {} names",
                names.len()
            );
        } else if !names.is_empty() && listed == 0 {
            return Err(SyncError::NoImages {
                namespace: namespace.clone(),
            });
        }

        let images = dispatch_order(images);
        info!("Sync: Discovered {} images", images.len());

        Ok(images)
    }

    /// Syncs the configured batch of `images` and waits for it to finish.
    pub async fn sync(
        &self,
        images: Vec<Image>,
        report: &ReportHandle,
    ) -> Result<RunStats, SyncError> {
        let images = dispatch_order(images);
        let selected = partition(
            &images,
            self.options.batch_size,
            self.options.batch_number,
        );

        let mut stats = RunStats {
            discovered: images.len(),
            selected: selected.len(),
            ..RunStats::default()
        };

        if selected.len() < images.len() {
            info!(
                "Sync: Batch {} of size {} holds {} of {} images",
                self.options.batch_number,
                self.options.batch_size,
                selected.len(),
                images.len()
            );
        }

        let run = self.cancel.child_token();
        let deadline = self.options.deadline.map(|deadline| {
            let run = run.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                warn!("Sync: Deadline of {deadline:?} reached, abandoning remaining images");
                run.cancel();
            })
        });

        let limit = match self.options.limit {
            0 => DEFAULT_LIMIT,
            limit => limit,
        };
        let mut pool = WorkerPool::new(limit, run.clone())?;

        for (index, image) in selected.iter().enumerate() {
            let job = ImageJob {
                image: image.clone(),
                options: self.options.clone(),
                manifests: self.source.manifests.clone(),
                copier: self.copier.clone(),
                cache: self.cache.clone(),
                report: report.clone(),
                cancel: run.clone(),
            };

            match pool.submit(job.run()).await {
                Ok(()) => {}
                Err(PoolError::Cancelled) => {
                    stats.not_started = selected.len() - index;
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }

        stats.pool = pool.close().await;

        if let Some(deadline) = deadline {
            deadline.abort();
        }

        info!(
            "Sync: {} images done, {} abandoned, {} panicked, {} not started",
            stats.pool.completed, stats.pool.abandoned, stats.pool.panicked, stats.not_started
        );

        Ok(stats)
    }

    pub async fn run(&self, report: &ReportHandle) -> Result<RunStats, SyncError> {
        let images = self.discover().await?;
        self.sync(images, report).await
    }
}

/// Everything one worker needs to sync one image.
struct ImageJob {
    image: Image,
    options: Arc<SyncOptions>,
    manifests: Arc<dyn ManifestFetcher>,
    copier: Arc<dyn Copier>,
    cache: Arc<FingerprintCache>,
    report: ReportHandle,
    cancel: CancellationToken,
}

impl ImageJob {
    async fn run(self) {
        if let Some(outcome) = self.sync_image().await {
            self.report.send(outcome).await;
        }
    }

    /// `None` when cancellation was seen before the first external call of a
    /// step. Once an attempt has failed, the failure is always reported.
    async fn sync_image(&self) -> Option<SyncOutcome> {
        let image = &self.image;
        let manifests = &self.manifests;

        let fresh = match retry(self.options.fetch_retry, &self.cancel, move || {
            manifests.fetch(image)
        })
        .await
        {
            Ok(fresh) => fresh,
            Err(RetryError::Cancelled(None)) => {
                debug!("Sync: {image} abandoned before manifest fetch");
                return None;
            }
            Err(RetryError::Cancelled(Some(err)) | RetryError::Exhausted(err)) => {
                return Some(SyncOutcome::with_error(
                    image.clone(),
                    SyncStatus::FailedFetch,
                    err,
                ));
            }
        };

        if !self.cache.should_sync(image, &fresh).await {
            return Some(SyncOutcome::new(image.clone(), SyncStatus::SkippedUnchanged));
        }

        if !self.options.manifests_only {
            if let Err(outcome) = self.copy(&fresh).await? {
                return Some(outcome);
            }
        }

        match self.cache.record(image, fresh).await {
            Ok(()) => Some(SyncOutcome::new(image.clone(), SyncStatus::Synced)),
            Err(err) => Some(SyncOutcome::with_error(
                image.clone(),
                SyncStatus::FailedPersist,
                err,
            )),
        }
    }

    /// `None` when cancelled, `Some(Err(outcome))` when the copy failed.
    async fn copy(&self, fresh: &ManifestFingerprint) -> Option<Result<(), SyncOutcome>> {
        let image = &self.image;
        let options = &self.options;
        let copier = &self.copier;
        let credentials = &options.credentials;
        let destination = &image.destination(&options.registry, &credentials.user, options.kubeadm);
        let timeout = options.timeout;

        if fresh.is_list() {
            debug!(
                "Sync: {image} changed, copying [{}] to {destination}",
                fresh.platforms().join(", ")
            );
        } else {
            debug!("Sync: {image} changed, copying to {destination}");
        }

        let copied = retry(options.copy_retry, &self.cancel, move || async move {
            let attempt = copier.copy(image, destination, credentials);
            match tokio::time::timeout(timeout, attempt).await {
                Ok(result) => result,
                Err(_) => Err(CopyError::Timeout(timeout)),
            }
        })
        .await;

        let err = match copied {
            Ok(()) => return Some(Ok(())),
            Err(RetryError::Cancelled(None)) => {
                debug!("Sync: {image} abandoned before copy");
                return None;
            }
            Err(RetryError::Cancelled(Some(err)) | RetryError::Exhausted(err)) => err,
        };

        Some(Err(SyncOutcome::with_error(
            image.clone(),
            SyncStatus::FailedCopy,
            err,
        )))
    }
}
