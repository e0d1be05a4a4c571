use std::time::Duration;

use thiserror::Error;

/// Failures talking to a source registry (catalog listing, tag listing,
/// manifest retrieval).
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("failed to decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("response from {url} is missing field `{field}`")]
    MissingField { url: String, field: &'static str },

    #[error("unable to obtain token from {realm}: {reason}")]
    Token { realm: String, reason: String },

    #[error("request slots have been closed")]
    SlotsClosed,

    #[error("request cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

#[derive(Error, Debug)]
pub enum CopyError {
    #[error("failed to start copier: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("copier exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("copy did not finish within {0:?}")]
    Timeout(Duration),

    #[error("failed to write registry auth file: {0}")]
    AuthFile(#[source] std::io::Error),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid manifest key: {0}")]
    InvalidKey(String),

    #[error("manifest store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("manifest store encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("destination user or password is empty")]
    MissingCredentials,

    #[error("retry policy `{0}` must allow at least one attempt")]
    NoAttempts(&'static str),

    #[error("unknown synchronizer `{name}` (known: {known})")]
    UnknownSynchronizer { name: String, known: String },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool size must be at least 1")]
    InvalidSize,

    #[error("worker pool has been cancelled")]
    Cancelled,
}

/// Errors that abort a whole run. Per-image failures never surface here.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("image discovery failed: {0}")]
    Discovery(#[source] FetchError),

    #[error("tag discovery failed for every image name in {namespace}")]
    NoImages { namespace: String },

    #[error("failed to create worker pool: {0}")]
    Pool(#[from] PoolError),
}
