use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::fs;
use uuid::Uuid;

use crate::domain::{
    entity::Namespace, error::StorageError, repository::ArtifactStore, validate::is_safe_key,
};

/// Artifact store over a local (or mounted) directory. Each namespace maps
/// to a bucket directory under `root`.
#[derive(Clone, Debug)]
pub struct FsArtifactStore {
    root: PathBuf,
    templates_bucket: String,
    results_bucket: String,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>, templates_bucket: String, results_bucket: String) -> Self {
        Self {
            root: root.into(),
            templates_bucket,
            results_bucket,
        }
    }

    fn bucket(&self, namespace: Namespace) -> &str {
        match namespace {
            Namespace::Templates => &self.templates_bucket,
            Namespace::Results => &self.results_bucket,
        }
    }

    fn path(&self, namespace: Namespace, key: &str) -> Result<PathBuf, StorageError> {
        if !is_safe_key(key) {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(self.bucket(namespace)).join(key))
    }

    pub async fn put_template(&self, key: &str, source: impl Into<Bytes>) -> Result<(), StorageError> {
        self.put(Namespace::Templates, key, source.into()).await
    }

    async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(format!(".tmp-{}", Uuid::new_v4()));
        let tmp = PathBuf::from(tmp);

        let written = match fs::write(&tmp, bytes).await {
            Ok(()) => fs::rename(&tmp, path).await,
            Err(e) => Err(e),
        };
        if written.is_err() {
            let _ = fs::remove_file(&tmp).await;
        }
        written
    }
}

#[async_trait::async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn get(&self, namespace: Namespace, key: &str) -> Result<Bytes, StorageError> {
        let path = self.path(namespace, key)?;

        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound {
                namespace,
                key: key.to_string(),
            }),
            Err(e) => Err(StorageError::Read {
                namespace,
                key: key.to_string(),
                message: e.to_string(),
            }),
        }
    }

    async fn put(&self, namespace: Namespace, key: &str, bytes: Bytes) -> Result<(), StorageError> {
        let path = self.path(namespace, key)?;

        Self::write_atomic(&path, &bytes)
            .await
            .map_err(|e| StorageError::Write {
                namespace,
                key: key.to_string(),
                message: e.to_string(),
            })
    }
}
