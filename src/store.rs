use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::cache::ManifestStore;
use crate::error::StoreError;
use crate::manifest::ManifestFingerprint;

/// Keeps one json document per image tag below a directory:
/// `<root>/<repo>/<namespace>/<name>/<tag>.json`.
pub struct FileManifestStore {
    root: PathBuf,
}

impl FileManifestStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn key_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        let (location, tag) = key
            .rsplit_once(':')
            .ok_or_else(|| StoreError::InvalidKey(key.to_string()))?;

        let mut path = self.root.clone();
        for segment in location.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(StoreError::InvalidKey(key.to_string()));
            }
            path.push(segment);
        }

        if tag.is_empty() || tag.contains('/') || tag == "." || tag == ".." {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        path.push(format!("{tag}.json"));

        Ok(path)
    }
}

#[async_trait]
impl ManifestStore for FileManifestStore {
    async fn load(&self, key: &str) -> Result<Option<ManifestFingerprint>, StoreError> {
        let path = self.key_path(key)?;

        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        Ok(Some(serde_json::from_slice(&data)?))
    }

    async fn save(&self, key: &str, fingerprint: &ManifestFingerprint) -> Result<(), StoreError> {
        let path = self.key_path(key)?;
        let data = serde_json::to_vec_pretty(fingerprint)?;

        let parent = path
            .parent()
            .ok_or_else(|| StoreError::InvalidKey(key.to_string()))?;
        tokio::fs::create_dir_all(parent).await?;

        let temp = parent.join(format!(".{}.tmp", Uuid::new_v4().as_hyphenated()));
        tokio::fs::write(&temp, &data).await?;
        if let Err(err) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(err.into());
        }

        debug!("Store: Saved manifest for {key} to {path:?}");

        Ok(())
    }
}

/// Fingerprints that only live as long as the process.
#[derive(Default)]
pub struct MemoryManifestStore {
    entries: RwLock<HashMap<String, ManifestFingerprint>>,
}

#[async_trait]
impl ManifestStore for MemoryManifestStore {
    async fn load(&self, key: &str) -> Result<Option<ManifestFingerprint>, StoreError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn save(&self, key: &str, fingerprint: &ManifestFingerprint) -> Result<(), StoreError> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), fingerprint.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;
    use test_log::test;

    use super::*;
    use crate::tests::fingerprint;

    #[test]
    fn key_layout() {
        let store = FileManifestStore::new("/var/lib/imgsync");
        assert_eq!(
            store.key_path("gcr.io/google-containers/pause:3.2").unwrap(),
            PathBuf::from("/var/lib/imgsync/gcr.io/google-containers/pause/3.2.json")
        );
    }

    #[test]
    fn key_traversal_is_rejected() {
        let store = FileManifestStore::new("/var/lib/imgsync");
        assert!(store.key_path("gcr.io/../etc/passwd:1").is_err());
        assert!(store.key_path("gcr.io//pause:1").is_err());
        assert!(store.key_path("gcr.io/ns/pause").is_err());
        assert!(store.key_path("gcr.io/ns/pause:..").is_err());
    }

    #[test(tokio::test)]
    async fn missing_entry_loads_as_none() {
        let dir = tempdir().unwrap();
        let store = FileManifestStore::new(dir.path());
        assert_eq!(store.load("gcr.io/ns/pause:3.2").await.unwrap(), None);
    }

    #[test(tokio::test)]
    async fn save_then_load() {
        let dir = tempdir().unwrap();
        let store = FileManifestStore::new(dir.path());

        store
            .save("gcr.io/ns/pause:3.2", &fingerprint("sha256:aaaa"))
            .await
            .unwrap();
        store
            .save("gcr.io/ns/pause:3.2", &fingerprint("sha256:bbbb"))
            .await
            .unwrap();

        assert_eq!(
            store.load("gcr.io/ns/pause:3.2").await.unwrap(),
            Some(fingerprint("sha256:bbbb"))
        );

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("gcr.io/ns/pause"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("3.2.json")]);
    }

    #[test(tokio::test)]
    async fn corrupt_entry_is_an_error() {
        let dir = tempdir().unwrap();
        let store = FileManifestStore::new(dir.path());
        let path = store.key_path("gcr.io/ns/pause:3.2").unwrap();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{not json").unwrap();

        assert!(matches!(
            store.load("gcr.io/ns/pause:3.2").await,
            Err(StoreError::Encoding(_))
        ));
    }
}
