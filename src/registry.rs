//! Client side of the registry v2 API: listing calls and manifest retrieval.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::FetchError;
use crate::fetcher::RateLimitedFetcher;
use crate::image::Image;
use crate::manifest::{ACCEPTED_MEDIA_TYPES, ManifestFingerprint};
use crate::mint::{Mint, parse_challenge};

/// Source of the current upstream manifest for an image.
#[async_trait]
pub trait ManifestFetcher: Send + Sync {
    /// One attempt at retrieving the manifest; callers own the retry policy.
    async fn fetch(&self, image: &Image) -> Result<ManifestFingerprint, FetchError>;
}

pub struct RegistryClient {
    base_url: String,
    fetcher: Arc<RateLimitedFetcher>,
    mint: Mint,
}

impl RegistryClient {
    pub fn new(base_url: impl Into<String>, fetcher: Arc<RateLimitedFetcher>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            fetcher,
            mint: Mint::default(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Sends one GET, answering a bearer challenge once if the registry asks
    /// for a token. `repository` keys the token cache.
    async fn send(
        &self,
        repository: &str,
        path: &str,
        accept: &[&str],
    ) -> Result<reqwest::Response, FetchError> {
        let url = format!("{}{}", self.base_url, path);
        let client = self.fetcher.client();

        let request = |token: Option<String>| {
            let mut builder = client.get(&url);
            if !accept.is_empty() {
                builder = builder.header(ACCEPT, accept.join(", "));
            }
            if let Some(token) = token {
                builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
            }
            builder
        };

        let http = |source: reqwest::Error| FetchError::Http {
            url: url.clone(),
            source,
        };

        let response = request(self.mint.token(repository).await)
            .send()
            .await
            .map_err(http)?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_challenge);

        let Some(challenge) = challenge else {
            return Ok(response);
        };

        debug!("Registry: {url} requires a token from {}", challenge.realm);
        self.mint.forget(repository).await;
        let token = self.mint.mint(client, repository, &challenge).await?;

        request(Some(token)).send().await.map_err(http)
    }

    /// GETs a JSON document below the base url, holding a request slot and
    /// retrying with the low-level request policy.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        repository: &str,
        path: &str,
    ) -> Result<T, FetchError> {
        let url = &format!("{}{}", self.base_url, path);

        self.fetcher
            .with_retry(move || async move {
                let response = self.send(repository, path, &[]).await?;

                let status = response.status();
                if !status.is_success() {
                    return Err(FetchError::Status {
                        url: url.clone(),
                        status,
                    });
                }

                let body = response.bytes().await.map_err(|source| FetchError::Http {
                    url: url.clone(),
                    source,
                })?;

                serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
                    url: url.clone(),
                    source,
                })
            })
            .await
    }
}

#[async_trait]
impl ManifestFetcher for RegistryClient {
    async fn fetch(&self, image: &Image) -> Result<ManifestFingerprint, FetchError> {
        let repository = image.path();
        let path = format!("/v2/{repository}/manifests/{}", image.tag);
        let url = format!("{}{}", self.base_url, path);

        self.fetcher
            .limited(async {
                let response = self
                    .send(&repository, &path, &ACCEPTED_MEDIA_TYPES)
                    .await?;

                let status = response.status();
                if !status.is_success() {
                    return Err(FetchError::Status {
                        url: url.clone(),
                        status,
                    });
                }

                let content_type = response
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string);

                let body = response.bytes().await.map_err(|source| FetchError::Http {
                    url: url.clone(),
                    source,
                })?;

                ManifestFingerprint::parse(content_type.as_deref(), &body).map_err(|source| {
                    FetchError::Decode {
                        url: url.clone(),
                        source,
                    }
                })
            })
            .await
    }
}
