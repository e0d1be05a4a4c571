use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use imgsync::cache::FingerprintCache;
use imgsync::config::Configuration;
use imgsync::copier::SkopeoCopier;
use imgsync::fetcher::RateLimitedFetcher;
use imgsync::report::{ReportLevel, Reporter};
use imgsync::store::FileManifestStore;
use imgsync::sync::Synchronizer;
use imgsync::synchronizers::Synchronizers;
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Opt {
    /// YAML config files, merged in order.
    #[clap(short, long, value_parser)]
    pub config: Vec<PathBuf>,
    #[clap(long)]
    pub synchronizer: Option<String>,
    #[clap(long)]
    pub namespace: Option<String>,
    #[clap(short, long)]
    pub user: Option<String>,
    #[clap(short, long)]
    pub password: Option<String>,
    /// Per-image copy timeout, e.g. `10m`.
    #[clap(long)]
    pub timeout: Option<String>,
    /// Run deadline, e.g. `1h`.
    #[clap(long)]
    pub deadline: Option<String>,
    #[clap(long)]
    pub limit: Option<usize>,
    #[clap(long)]
    pub query_limit: Option<usize>,
    #[clap(long)]
    pub batch_size: Option<usize>,
    #[clap(long)]
    pub batch_number: Option<usize>,
    #[clap(long)]
    pub manifests_only: bool,
    #[clap(long)]
    pub kubeadm: bool,
    #[clap(long)]
    pub report: bool,
    #[clap(long, value_enum)]
    pub report_level: Option<ReportLevel>,
    #[clap(long)]
    pub manifest_dir: Option<PathBuf>,
}

impl Opt {
    /// Flags given on the command line win over every other source.
    fn merge(self, fig: Figment) -> Figment {
        let mut fig = fig;

        macro_rules! merge {
            ($key:literal, $value:expr) => {
                if let Some(value) = $value {
                    fig = fig.merge(($key, value));
                }
            };
        }

        merge!("synchronizer", self.synchronizer);
        merge!("namespace", self.namespace);
        merge!("user", self.user);
        merge!("password", self.password);
        merge!("timeout", self.timeout);
        merge!("deadline", self.deadline);
        merge!("limit", self.limit);
        merge!("query_limit", self.query_limit);
        merge!("batch_size", self.batch_size);
        merge!("batch_number", self.batch_number);
        merge!("manifests_only", self.manifests_only.then_some(true));
        merge!("kubeadm", self.kubeadm.then_some(true));
        merge!("report.enabled", self.report.then_some(true));
        merge!("report.level", self.report_level);
        merge!("manifest_dir", self.manifest_dir);

        fig
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .with_ansi(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut options = Opt::parse();
    let configs = std::mem::take(&mut options.config);
    let config = Configuration::config(options.merge(Configuration::figment(configs)))
        .context("Failed to load configuration")?;

    let client = reqwest::Client::builder()
        .user_agent(concat!("imgsync/", env!("CARGO_PKG_VERSION")))
        .timeout(config.http_timeout)
        .build()
        .context("Failed to build HTTP client")?;

    let cancel = CancellationToken::new();
    let fetcher = Arc::new(
        RateLimitedFetcher::new(client, config.query_limit, config.retry.request)
            .with_cancel(cancel.clone()),
    );

    let source = Synchronizers::with_defaults()
        .build(&config.synchronizer, &config, fetcher.clone())
        .context("Failed to select synchronizer")?;

    let cache = Arc::new(FingerprintCache::new(Arc::new(FileManifestStore::new(
        &config.manifest_dir,
    ))));

    let synchronizer = Synchronizer::new(
        config.sync_options(),
        source,
        Arc::new(SkopeoCopier::new(&config.copier)),
        cache,
        cancel.clone(),
    );

    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                warn!("Received Ctrl+C, abandoning images not yet started");
                cancel.cancel();
            }
            Err(err) => warn!("Unable to listen for shutdown signal: {err}"),
        }
    });

    let mut registry = Registry::with_prefix("imgsync");
    let reporter = Reporter::start(
        &config.report,
        config.limit,
        config.retry.request,
        &mut registry,
    );

    let result = synchronizer.run(&reporter.handle()).await;
    let report = reporter.finish().await;
    fetcher.close();

    info!(
        "Run finished: {} synced, {} unchanged, {} failed fetch, {} failed copy, {} not persisted",
        report.totals.synced,
        report.totals.skipped_unchanged,
        report.totals.failed_fetch,
        report.totals.failed_copy,
        report.totals.failed_persist
    );

    if let Some(path) = &config.metrics.textfile {
        let mut buffer = String::new();
        encode(&mut buffer, &registry).context("Failed to encode metrics")?;
        tokio::fs::write(path, buffer)
            .await
            .with_context(|| format!("Failed to write metrics to {}", path.display()))?;
    }

    let stats = result.context("Sync run failed")?;
    info!(
        "Processed {} of {} discovered images",
        stats.selected - stats.not_started,
        stats.discovered
    );

    Ok(())
}
