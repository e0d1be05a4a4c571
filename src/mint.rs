//! Anonymous pull tokens for registries that answer with a bearer challenge.

use std::collections::HashMap;

use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::FetchError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

/// Parses `Bearer realm="https://auth",service="registry",scope="repository:x:pull"`.
pub fn parse_challenge(header: &str) -> Option<Challenge> {
    let (scheme, params) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let mut realm = None;
    let mut service = None;
    let mut scope = None;

    let mut rest = params.trim();
    while !rest.is_empty() {
        let (key, after) = rest.split_once('=')?;
        let key = key.trim().trim_start_matches(',').trim();

        let (value, after) = match after.strip_prefix('"') {
            Some(quoted) => {
                let end = quoted.find('"')?;
                (&quoted[..end], &quoted[end + 1..])
            }
            None => match after.find(',') {
                Some(end) => (&after[..end], &after[end..]),
                None => (after, ""),
            },
        };

        match key {
            "realm" => realm = Some(value.to_string()),
            "service" => service = Some(value.to_string()),
            "scope" => scope = Some(value.to_string()),
            _ => {}
        }

        rest = after.trim_start_matches(',').trim();
    }

    Some(Challenge {
        realm: realm?,
        service,
        scope,
    })
}

#[derive(Deserialize)]
struct MintResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Mints and remembers tokens per repository.
#[derive(Default)]
pub struct Mint {
    tokens: RwLock<HashMap<String, String>>,
}

impl Mint {
    pub async fn token(&self, repository: &str) -> Option<String> {
        self.tokens.read().await.get(repository).cloned()
    }

    pub async fn forget(&self, repository: &str) {
        self.tokens.write().await.remove(repository);
    }

    pub async fn mint(
        &self,
        client: &reqwest::Client,
        repository: &str,
        challenge: &Challenge,
    ) -> Result<String, FetchError> {
        let mut query = vec![];
        if let Some(service) = &challenge.service {
            query.push(("service", service.clone()));
        }
        if let Some(scope) = &challenge.scope {
            query.push(("scope", scope.clone()));
        }

        let failed = |reason: String| {
            warn!("Mint: Failed to mint pull token for {repository}: {reason}");
            FetchError::Token {
                realm: challenge.realm.clone(),
                reason,
            }
        };

        let response = client
            .get(&challenge.realm)
            .query(&query)
            .send()
            .await
            .map_err(|err| failed(err.to_string()))?;

        if !response.status().is_success() {
            return Err(failed(format!("status code {}", response.status())));
        }

        let payload: MintResponse = response
            .json()
            .await
            .map_err(|err| failed(err.to_string()))?;

        let token = payload
            .token
            .or(payload.access_token)
            .ok_or_else(|| failed("no token in response".to_string()))?;

        debug!("Mint: Minted pull token for {repository}");
        self.tokens
            .write()
            .await
            .insert(repository.to_string(), token.clone());

        Ok(token)
    }
}
