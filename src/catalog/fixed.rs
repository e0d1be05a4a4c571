use std::sync::Arc;

use async_trait::async_trait;

use super::{Catalog, list_v2_tags};
use crate::error::FetchError;
use crate::registry::RegistryClient;

/// A registry without a usable catalog endpoint: the image names are
/// configured up front and only their tags are discovered.
pub struct FixedCatalog {
    repo: String,
    names: Vec<String>,
    client: Arc<RegistryClient>,
}

impl FixedCatalog {
    pub fn new(repo: &str, names: Vec<String>, client: Arc<RegistryClient>) -> Self {
        Self {
            repo: repo.to_string(),
            names,
            client,
        }
    }
}

#[async_trait]
impl Catalog for FixedCatalog {
    fn repo(&self) -> &str {
        &self.repo
    }

    async fn list_names(&self, _namespace: &str) -> Result<Vec<String>, FetchError> {
        Ok(self.names.clone())
    }

    async fn list_tags(&self, namespace: &str, name: &str) -> Result<Vec<String>, FetchError> {
        list_v2_tags(&self.client, namespace, name).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use test_log::test;
    use wiremock::matchers::*;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::fetcher::RateLimitedFetcher;
    use crate::retry::RetryPolicy;

    #[test(tokio::test)]
    async fn names_are_fixed_and_tags_listed() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v2/coreos/flannel/tags/list"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "coreos/flannel",
                "tags": ["v0.12.0", "v0.13.0"]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = Arc::new(RateLimitedFetcher::new(
            reqwest::Client::new(),
            2,
            RetryPolicy::new(1, Duration::ZERO),
        ));
        let catalog = FixedCatalog::new(
            "quay.io",
            vec!["flannel".into()],
            Arc::new(RegistryClient::new(server.uri(), fetcher)),
        );

        assert_eq!(catalog.repo(), "quay.io");
        assert_eq!(catalog.list_names("coreos").await.unwrap(), vec!["flannel"]);
        assert_eq!(
            catalog.list_tags("coreos", "flannel").await.unwrap(),
            vec!["v0.12.0", "v0.13.0"]
        );
    }
}
