use std::{path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use platform_dirs::AppDirs;
use serde::{Deserialize, Serialize};

use crate::config::files::RecursiveFileProvider;
use crate::copier::Credentials;
use crate::error::ConfigError;
use crate::report::ReportLevel;
use crate::retry::RetryPolicy;
use crate::sync::SyncOptions;

pub(crate) mod duration;
pub(crate) mod files;

/// Used when `limit` or `query_limit` is unset or zero.
pub const DEFAULT_LIMIT: usize = 20;

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct SourceConfig {
    /// Overrides the synchronizer's registry base url.
    pub url: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DestinationConfig {
    pub registry: String,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            registry: "docker.io".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct RetryConfig {
    /// Low level registry calls: catalog and tag listings.
    pub request: RetryPolicy,
    /// Per-image manifest fetch.
    pub fetch: RetryPolicy,
    /// Per-image copy.
    pub copy: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            request: RetryPolicy::new(3, Duration::from_secs(1)),
            fetch: RetryPolicy::new(5, Duration::from_secs(3)),
            copy: RetryPolicy::new(8, Duration::from_secs(10)),
        }
    }
}

const fn default_report_batch_size() -> usize {
    10
}

const fn default_flush_interval() -> Duration {
    Duration::from_secs(5)
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReportConfig {
    pub enabled: bool,
    pub level: ReportLevel,
    /// Outcomes are POSTed here in batches.
    pub url: Option<String>,
    /// The final report is written here as JSON.
    pub file: Option<PathBuf>,
    pub batch_size: usize,
    #[serde(with = "crate::config::duration")]
    pub flush_interval: Duration,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            level: ReportLevel::default(),
            url: None,
            file: None,
            batch_size: default_report_batch_size(),
            flush_interval: default_flush_interval(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Prometheus text exposition written at the end of a run.
    pub textfile: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Configuration {
    pub synchronizer: String,
    /// Source namespace; each synchronizer has its own default.
    pub namespace: Option<String>,
    /// Image names to mirror for synchronizers without a catalog.
    pub images: Vec<String>,
    pub user: String,
    pub password: String,
    pub source: SourceConfig,
    pub destination: DestinationConfig,
    /// Limit for each copy attempt.
    #[serde(with = "crate::config::duration")]
    pub timeout: Duration,
    /// Run level budget. Zero disables it.
    #[serde(with = "crate::config::duration")]
    pub deadline: Duration,
    #[serde(with = "crate::config::duration")]
    pub http_timeout: Duration,
    /// Per-image tasks running at once.
    pub limit: usize,
    /// Registry calls in flight at once.
    pub query_limit: usize,
    pub batch_size: usize,
    pub batch_number: usize,
    pub manifests_only: bool,
    pub kubeadm: bool,
    pub manifest_dir: PathBuf,
    /// Path to the skopeo binary.
    pub copier: String,
    pub retry: RetryConfig,
    pub report: ReportConfig,
    pub metrics: MetricsConfig,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            synchronizer: "gcr".to_string(),
            namespace: None,
            images: vec![],
            user: String::new(),
            password: String::new(),
            source: SourceConfig::default(),
            destination: DestinationConfig::default(),
            timeout: Duration::from_secs(10 * 60),
            deadline: Duration::from_secs(60 * 60),
            http_timeout: Duration::from_secs(5),
            limit: DEFAULT_LIMIT,
            query_limit: DEFAULT_LIMIT,
            batch_size: 0,
            batch_number: 0,
            manifests_only: false,
            kubeadm: false,
            manifest_dir: PathBuf::from("manifests"),
            copier: "skopeo".to_string(),
            retry: RetryConfig::default(),
            report: ReportConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Configuration {
    pub fn figment(configs: Vec<PathBuf>) -> Figment {
        let fig = Figment::from(Serialized::defaults(Configuration::default()));

        let fig = match AppDirs::new(Some("imgsync"), true)
            .map(|dirs| dirs.config_dir.join("config.yaml"))
        {
            Some(path) if path.exists() => {
                fig.admerge(RecursiveFileProvider::new(Yaml::file(path)))
            }
            _ => fig,
        };

        let fig = configs.into_iter().fold(fig, |fig, config_path| {
            fig.admerge(RecursiveFileProvider::new(Yaml::file(config_path)))
        });

        fig.admerge(RecursiveFileProvider::new(
            Env::prefixed("IMGSYNC_").split("__"),
        ))
    }

    pub fn config(figment: Figment) -> Result<Configuration, ConfigError> {
        let mut config: Configuration = figment.extract().map_err(Box::new)?;

        if config.limit == 0 {
            config.limit = DEFAULT_LIMIT;
        }

        if config.query_limit == 0 {
            config.query_limit = DEFAULT_LIMIT;
        }

        if !config.manifests_only && !config.credentials().is_complete() {
            return Err(ConfigError::MissingCredentials);
        }

        for (name, policy) in [
            ("request", &config.retry.request),
            ("fetch", &config.retry.fetch),
            ("copy", &config.retry.copy),
        ] {
            if policy.attempts == 0 {
                return Err(ConfigError::NoAttempts(name));
            }
        }

        Ok(config)
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            user: self.user.clone(),
            password: self.password.clone(),
        }
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            credentials: self.credentials(),
            registry: self.destination.registry.clone(),
            timeout: self.timeout,
            deadline: (!self.deadline.is_zero()).then_some(self.deadline),
            limit: self.limit,
            batch_size: self.batch_size,
            batch_number: self.batch_number,
            manifests_only: self.manifests_only,
            kubeadm: self.kubeadm,
            fetch_retry: self.retry.fetch,
            copy_retry: self.retry.copy,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn isolated(jail: &mut figment::Jail) {
        let dir = jail.directory().to_path_buf();
        jail.set_env("XDG_CONFIG_HOME", dir.display());
    }

    #[test]
    fn defaults() {
        let defaults = Configuration::default();
        assert_eq!(defaults.synchronizer, "gcr");
        assert_eq!(defaults.limit, DEFAULT_LIMIT);
        assert_eq!(defaults.destination.registry, "docker.io");
        assert_eq!(defaults.retry.fetch.attempts, 5);
        assert!(defaults.retry.copy.attempts > defaults.retry.fetch.attempts);
        assert!(!defaults.report.enabled);
    }

    #[test]
    fn credentials_are_required() {
        figment::Jail::expect_with(|jail| {
            isolated(jail);

            let result = Configuration::config(Configuration::figment(vec![]));
            assert!(matches!(result, Err(ConfigError::MissingCredentials)));

            let config = Configuration::config(
                Configuration::figment(vec![]).merge(("manifests_only", true)),
            )
            .expect("manifests only runs need no credentials");
            assert!(config.manifests_only);

            Ok(())
        });
    }

    #[test]
    fn zero_limits_fall_back_to_default() {
        figment::Jail::expect_with(|jail| {
            isolated(jail);
            jail.set_env("IMGSYNC_USER", "mirror");
            jail.set_env("IMGSYNC_PASSWORD", "secret");
            jail.set_env("IMGSYNC_LIMIT", "0");
            jail.set_env("IMGSYNC_QUERY_LIMIT", "0");

            let config = Configuration::config(Configuration::figment(vec![]))
                .expect("Configuration should be valid");
            assert_eq!(config.limit, DEFAULT_LIMIT);
            assert_eq!(config.query_limit, DEFAULT_LIMIT);

            Ok(())
        });
    }

    #[test]
    fn zero_attempts_are_rejected() {
        figment::Jail::expect_with(|jail| {
            isolated(jail);
            jail.create_file(
                "config.yaml",
                r#"
                manifests_only: true
                retry:
                  copy:
                    attempts: 0
                    delay: 1s
                "#,
            )?;

            let path = jail.directory().join("config.yaml");
            let result = Configuration::config(Configuration::figment(vec![path]));
            assert!(matches!(result, Err(ConfigError::NoAttempts("copy"))));

            Ok(())
        });
    }

    /// Later files win, the environment beats files, and `_file` keys are read.
    #[test]
    fn stacking() {
        figment::Jail::expect_with(|jail| {
            isolated(jail);
            jail.create_dir("imgsync")?;
            jail.create_file(
                "imgsync/config.yaml",
                r#"
                synchronizer: flannel
                limit: 4
                "#,
            )?;
            jail.create_file("password.txt", "from-file\n")?;
            jail.create_file(
                "base.yaml",
                r#"
                user: mirror
                password_file: password.txt
                limit: 8
                timeout: 2m
                report:
                  enabled: true
                  level: changes
                "#,
            )?;
            jail.create_file(
                "override.yaml",
                r#"
                limit: 16
                destination:
                  registry: registry.example.com
                "#,
            )?;
            jail.set_env("IMGSYNC_REPORT__BATCH_SIZE", "3");
            jail.set_env("IMGSYNC_KUBEADM", "true");

            let config = Configuration::config(Configuration::figment(vec![
                jail.directory().join("base.yaml"),
                jail.directory().join("override.yaml"),
            ]))
            .expect("Configuration should be valid");

            assert_eq!(config.synchronizer, "flannel");
            assert_eq!(config.user, "mirror");
            assert_eq!(config.password, "from-file");
            assert_eq!(config.limit, 16);
            assert_eq!(config.timeout, Duration::from_secs(120));
            assert_eq!(config.destination.registry, "registry.example.com");
            assert!(config.report.enabled);
            assert_eq!(config.report.level, ReportLevel::Changes);
            assert_eq!(config.report.batch_size, 3);
            assert!(config.kubeadm);

            Ok(())
        });
    }

    #[test]
    fn sync_options() {
        let config = Configuration {
            user: "mirror".into(),
            password: "secret".into(),
            deadline: Duration::ZERO,
            batch_size: 50,
            batch_number: 2,
            ..Configuration::default()
        };

        let options = config.sync_options();
        assert_eq!(options.credentials.user, "mirror");
        assert_eq!(options.registry, "docker.io");
        assert_eq!(options.deadline, None);
        assert_eq!(options.batch_size, 50);
        assert_eq!(options.batch_number, 2);
        assert_eq!(options.fetch_retry, config.retry.fetch);
    }

    #[test]
    fn report_config() {
        let data = r#"
        {
            "enabled": true,
            "url": "http://localhost:1234/outcomes",
            "flush_interval": "250ms"
        }"#;

        let report: ReportConfig = serde_json::from_str(data).unwrap();

        assert_eq!(report.url.as_deref(), Some("http://localhost:1234/outcomes"));
        assert_eq!(report.level, ReportLevel::Failures);
        assert_eq!(report.batch_size, 10);
        assert_eq!(report.flush_interval, Duration::from_millis(250));
    }
}
