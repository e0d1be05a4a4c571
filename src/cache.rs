//! Change detection for upstream manifests.
//!
//! The cache remembers the last manifest that was successfully mirrored for
//! every image and answers whether a freshly fetched manifest differs from it.
//! It is an in-memory layer over a [`ManifestStore`], which carries the
//! fingerprints from one run to the next.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::image::Image;
use crate::manifest::ManifestFingerprint;

/// Persistence for fingerprints, keyed by the image string form.
#[async_trait]
pub trait ManifestStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<ManifestFingerprint>, StoreError>;

    async fn save(&self, key: &str, fingerprint: &ManifestFingerprint) -> Result<(), StoreError>;
}

pub struct FingerprintCache {
    entries: RwLock<HashMap<String, ManifestFingerprint>>,
    store: Arc<dyn ManifestStore>,
}

impl FingerprintCache {
    pub fn new(store: Arc<dyn ManifestStore>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Last recorded fingerprint for `image`, consulting the store on a miss.
    ///
    /// A store that cannot be read is treated as having no entry, which only
    /// ever causes an extra sync.
    pub async fn previous(&self, image: &Image) -> Option<ManifestFingerprint> {
        let key = image.to_string();

        if let Some(fingerprint) = self.entries.read().await.get(&key) {
            return Some(fingerprint.clone());
        }

        let loaded = match self.store.load(&key).await {
            Ok(loaded) => loaded?,
            Err(err) => {
                warn!("Cache: Unable to load stored manifest for {key}: {err}");
                return None;
            }
        };

        let mut entries = self.entries.write().await;
        Some(entries.entry(key).or_insert(loaded).clone())
    }

    /// `false` only when a previous fingerprint exists and equals `fresh`.
    pub async fn should_sync(&self, image: &Image, fresh: &ManifestFingerprint) -> bool {
        match self.previous(image).await {
            Some(previous) if previous == *fresh => {
                debug!("Cache: {image} not changed");
                false
            }
            Some(_) => {
                debug!("Cache: {image} changed upstream");
                true
            }
            None => {
                debug!("Cache: {image} not seen before");
                true
            }
        }
    }

    /// Replaces the entry for `image` and persists it.
    ///
    /// The in-memory entry is replaced even when persisting fails, so the
    /// rest of this run sees the mirrored state.
    pub async fn record(
        &self,
        image: &Image,
        fingerprint: ManifestFingerprint,
    ) -> Result<(), StoreError> {
        let key = image.to_string();
        let result = self.store.save(&key, &fingerprint).await;
        self.entries.write().await.insert(key, fingerprint);
        result
    }

    /// Number of fingerprints currently held in memory.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::store::MemoryManifestStore;
    use crate::tests::fingerprint;

    fn image() -> Image {
        Image::new("gcr.io", "ns", "pause", "3.2")
    }

    #[test(tokio::test)]
    async fn unseen_image_should_sync() {
        let cache = FingerprintCache::new(Arc::new(MemoryManifestStore::default()));
        assert!(cache.should_sync(&image(), &fingerprint("sha256:aaaa")).await);
        assert!(cache.is_empty().await);
    }

    #[test(tokio::test)]
    async fn unchanged_image_is_skipped() {
        let cache = FingerprintCache::new(Arc::new(MemoryManifestStore::default()));
        cache.record(&image(), fingerprint("sha256:aaaa")).await.unwrap();

        assert!(!cache.should_sync(&image(), &fingerprint("sha256:aaaa")).await);
        assert!(cache.should_sync(&image(), &fingerprint("sha256:bbbb")).await);
    }

    #[test(tokio::test)]
    async fn previous_run_is_loaded_from_store() {
        let store = Arc::new(MemoryManifestStore::default());
        store
            .save(&image().to_string(), &fingerprint("sha256:aaaa"))
            .await
            .unwrap();

        let cache = FingerprintCache::new(store);
        assert!(!cache.should_sync(&image(), &fingerprint("sha256:aaaa")).await);
        assert_eq!(cache.len().await, 1);
    }

    #[test(tokio::test)]
    async fn record_replaces_entry() {
        let store = Arc::new(MemoryManifestStore::default());
        let cache = FingerprintCache::new(store.clone());

        cache.record(&image(), fingerprint("sha256:aaaa")).await.unwrap();
        cache.record(&image(), fingerprint("sha256:bbbb")).await.unwrap();

        assert_eq!(cache.len().await, 1);
        assert_eq!(
            cache.previous(&image()).await,
            Some(fingerprint("sha256:bbbb"))
        );
        assert_eq!(
            store.load(&image().to_string()).await.unwrap(),
            Some(fingerprint("sha256:bbbb"))
        );
    }
}
