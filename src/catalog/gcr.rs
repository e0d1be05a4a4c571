use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use super::{Catalog, list_v2_tags};
use crate::error::FetchError;
use crate::registry::RegistryClient;

pub const GCR_REPO: &str = "gcr.io";
pub const GCR_URL: &str = "https://gcr.io";
pub const GCR_NAMESPACE: &str = "google-containers";

#[derive(Debug, Deserialize)]
struct Listing {
    #[serde(default)]
    child: Option<Vec<String>>,
}

/// Google Container Registry. Its tag listing for a namespace also carries
/// the image names below it in a `child` field.
pub struct GcrCatalog {
    client: Arc<RegistryClient>,
}

impl GcrCatalog {
    pub fn new(client: Arc<RegistryClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Catalog for GcrCatalog {
    fn repo(&self) -> &str {
        GCR_REPO
    }

    async fn list_names(&self, namespace: &str) -> Result<Vec<String>, FetchError> {
        info!("Catalog: Listing gcr images in {namespace}");

        let path = format!("/v2/{namespace}/tags/list");
        let listing: Listing = self.client.get_json(namespace, &path).await?;

        listing.child.ok_or_else(|| FetchError::MissingField {
            url: format!("{}{}", self.client.base_url(), path),
            field: "child",
        })
    }

    async fn list_tags(&self, namespace: &str, name: &str) -> Result<Vec<String>, FetchError> {
        list_v2_tags(&self.client, namespace, name).await
    }
}
