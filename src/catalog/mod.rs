//! Discovery of the image names and tags to mirror.

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::FetchError;
use crate::registry::RegistryClient;

mod fixed;
mod gcr;

pub use fixed::FixedCatalog;
pub use gcr::{GCR_NAMESPACE, GCR_REPO, GCR_URL, GcrCatalog};

/// Lists what a source registry has under a namespace.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Registry host the listed images live in, e.g. `gcr.io`.
    fn repo(&self) -> &str;

    async fn list_names(&self, namespace: &str) -> Result<Vec<String>, FetchError>;

    async fn list_tags(&self, namespace: &str, name: &str) -> Result<Vec<String>, FetchError>;
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

/// Standard `/v2/<namespace>/<name>/tags/list` call. A repository without
/// tags may answer `"tags": null`, which is an empty list.
pub(crate) async fn list_v2_tags(
    client: &RegistryClient,
    namespace: &str,
    name: &str,
) -> Result<Vec<String>, FetchError> {
    let repository = if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}/{name}")
    };

    let list: TagList = client
        .get_json(&repository, &format!("/v2/{repository}/tags/list"))
        .await?;

    Ok(list.tags.unwrap_or_default())
}
