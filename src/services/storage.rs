use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::{Bucket, Region};

use crate::config::AppConfig;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Distinct, non-wrapped condition so callers can branch on it without
    /// inspecting backend internals.
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("invalid storage key: {0}")]
    InvalidKey(String),

    #[error("filesystem operation failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("object store operation failed: {0}")]
    S3(#[from] S3Error),

    #[error("storage configuration error: {0}")]
    Config(String),
}

/// Normalize a storage key to canonical forward-slash form.
///
/// Backslashes become slashes, empty segments collapse, and `.`/`..`
/// segments are rejected so local keys can never escape the root.
pub fn normalize_key(key: &str) -> Result<String, StorageError> {
    let mut segments = Vec::new();
    let normalized = key.replace('\\', "/");
    for segment in normalized.split('/') {
        match segment {
            "" => continue,
            "." | ".." => return Err(StorageError::InvalidKey(key.to_string())),
            s => segments.push(s),
        }
    }
    Ok(segments.join("/"))
}

fn require_key(key: &str) -> Result<String, StorageError> {
    let normalized = normalize_key(key)?;
    if normalized.is_empty() {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(normalized)
}

/// Whether a key falls under a normalized prefix on a segment boundary:
/// `projects/p1` covers `projects/p1` and `projects/p1/...`, never
/// `projects/p10/...`.
fn in_scope(key: &str, prefix: &str) -> bool {
    prefix.is_empty()
        || key == prefix
        || key
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Artifact persistence contract. The rest of the system never knows which
/// variant is active; all keys are canonical forward-slash paths.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Store bytes under a key, overwriting any existing value.
    async fn save(&self, key: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Fetch the bytes stored under a key.
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// All keys under a prefix, in variant-native order. The prefix matches
    /// whole path segments: `a/b` covers `a/b` and `a/b/...`, not `a/bc`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Remove a key. Returns false (not an error) if the key was absent.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Aggregate size in bytes of everything under a prefix, used for
    /// archival eligibility.
    async fn size_of(&self, prefix: &str) -> Result<u64, StorageError>;
}

/// Filesystem-rooted backend; keys map to relative paths under the root.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        let normalized = require_key(key)?;
        Ok(self.root.join(&normalized))
    }

    /// Collect every file under `dir`, returning keys relative to the root.
    async fn walk(&self, dir: &Path, out: &mut Vec<String>) -> Result<(), StorageError> {
        let mut pending = vec![dir.to_path_buf()];
        while let Some(current) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&current).await {
                Ok(e) => e,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Ok(rel) = path.strip_prefix(&self.root) {
                    out.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    async fn save(&self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let normalized = normalize_key(prefix)?;
        let mut keys = Vec::new();
        let root = self.root.clone();
        self.walk(&root, &mut keys).await?;
        keys.retain(|k| in_scope(k, &normalized));
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.resolve(key)?;
        Ok(tokio::fs::metadata(&path).await.is_ok())
    }

    async fn size_of(&self, prefix: &str) -> Result<u64, StorageError> {
        let mut total = 0u64;
        for key in self.list(prefix).await? {
            let path = self.root.join(&key);
            match tokio::fs::metadata(&path).await {
                Ok(meta) => total += meta.len(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }
}

fn is_not_found(err: &S3Error) -> bool {
    matches!(err, S3Error::HttpFailWithBody(404, _))
}

/// S3-compatible object store backend (R2 or any custom endpoint).
pub struct ObjectStoreBackend {
    bucket: Box<Bucket>,
}

impl ObjectStoreBackend {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials = Credentials::new(Some(access_key), Some(secret_key), None, None, None)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self { bucket })
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    async fn save(&self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        let key = require_key(key)?;
        self.bucket
            .put_object_with_content_type(&key, data, "application/octet-stream")
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let normalized = require_key(key)?;
        match self.bucket.get_object(&normalized).await {
            Ok(response) if response.status_code() == 404 => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Ok(response) => Ok(response.to_vec()),
            Err(e) if is_not_found(&e) => Err(StorageError::NotFound(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let normalized = normalize_key(prefix)?;
        let pages = self.bucket.list(normalized.clone(), None).await?;
        Ok(pages
            .into_iter()
            .flat_map(|page| page.contents)
            .map(|object| object.key)
            .filter(|key| in_scope(key, &normalized))
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let normalized = require_key(key)?;
        if !self.exists(&normalized).await? {
            return Ok(false);
        }
        self.bucket.delete_object(&normalized).await?;
        Ok(true)
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let normalized = require_key(key)?;
        match self.bucket.head_object(&normalized).await {
            Ok((_, code)) => Ok(code == 200),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn size_of(&self, prefix: &str) -> Result<u64, StorageError> {
        let normalized = normalize_key(prefix)?;
        let pages = self.bucket.list(normalized.clone(), None).await?;
        Ok(pages
            .into_iter()
            .flat_map(|page| page.contents)
            .filter(|object| in_scope(&object.key, &normalized))
            .map(|object| object.size)
            .sum())
    }
}

/// Select the active backend from configuration at process start.
pub fn from_config(config: &AppConfig) -> Result<Arc<dyn StorageBackend>, StorageError> {
    match config.storage_backend.as_str() {
        "local" => Ok(Arc::new(LocalBackend::new(&config.storage_root))),
        "s3" => Ok(Arc::new(object_store_from_config(config)?)),
        other => Err(StorageError::Config(format!(
            "unknown storage backend: {other}"
        ))),
    }
}

/// Build the object-store backend from config regardless of which variant is
/// active; the migration tool needs both sides at once.
pub fn object_store_from_config(config: &AppConfig) -> Result<ObjectStoreBackend, StorageError> {
    let missing =
        |field: &str| StorageError::Config(format!("{field} is required for s3 storage"));
    ObjectStoreBackend::new(
        config
            .s3_bucket
            .as_deref()
            .ok_or_else(|| missing("s3_bucket"))?,
        config
            .s3_endpoint
            .as_deref()
            .ok_or_else(|| missing("s3_endpoint"))?,
        config
            .s3_access_key
            .as_deref()
            .ok_or_else(|| missing("s3_access_key"))?,
        config
            .s3_secret_key
            .as_deref()
            .ok_or_else(|| missing("s3_secret_key"))?,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn local() -> (TempDir, LocalBackend) {
        let tmp = TempDir::new().unwrap();
        let backend = LocalBackend::new(tmp.path());
        (tmp, backend)
    }

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key("a/b/c").unwrap(), "a/b/c");
        assert_eq!(normalize_key("a\\b\\c").unwrap(), "a/b/c");
        assert_eq!(normalize_key("/a//b/").unwrap(), "a/b");
        assert_eq!(normalize_key("").unwrap(), "");
        assert!(normalize_key("a/../b").is_err());
        assert!(normalize_key("./a").is_err());
    }

    #[tokio::test]
    async fn test_round_trip_binary() {
        let (_tmp, backend) = local();
        let data: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        backend
            .save("projects/p1/input/archive.bin", &data)
            .await
            .unwrap();
        let back = backend.get("projects/p1/input/archive.bin").await.unwrap();
        assert_eq!(back, data);
    }

    #[tokio::test]
    async fn test_round_trip_empty_file() {
        let (_tmp, backend) = local();
        backend.save("projects/p1/input/empty", b"").await.unwrap();
        assert_eq!(backend.get("projects/p1/input/empty").await.unwrap(), b"");
    }

    #[tokio::test]
    async fn test_round_trip_unicode_key() {
        let (_tmp, backend) = local();
        let key = "projects/p1/input/отчёт-δοκιμή-報告.zip";
        backend.save(key, b"payload").await.unwrap();
        assert!(backend.exists(key).await.unwrap());
        assert_eq!(backend.get(key).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_deeply_nested_key() {
        let (_tmp, backend) = local();
        let key = "a/b/c/d/e/f/g/h/i/j/k/file.txt";
        backend.save(key, b"deep").await.unwrap();
        assert_eq!(backend.get(key).await.unwrap(), b"deep");
    }

    #[tokio::test]
    async fn test_save_overwrites() {
        let (_tmp, backend) = local();
        backend.save("k", b"one").await.unwrap();
        backend.save("k", b"two").await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let (_tmp, backend) = local();
        match backend.get("nope").await {
            Err(StorageError::NotFound(key)) => assert_eq!(key, "nope"),
            other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (_tmp, backend) = local();
        backend.save("k", b"x").await.unwrap();
        assert!(backend.delete("k").await.unwrap());
        assert!(!backend.delete("k").await.unwrap());
        assert!(!backend.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_scopes_by_prefix() {
        let (_tmp, backend) = local();
        backend.save("projects/p1/input/a", b"1").await.unwrap();
        backend.save("projects/p1/output/b", b"2").await.unwrap();
        backend.save("archive/p2/input/c", b"3").await.unwrap();

        let mut keys = backend.list("projects/p1").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["projects/p1/input/a", "projects/p1/output/b"]);

        let all = backend.list("").await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_list_prefix_stops_at_segment_boundary() {
        let (_tmp, backend) = local();
        backend.save("projects/p1/input/a", b"1").await.unwrap();
        backend.save("projects/p10/input/b", b"22").await.unwrap();

        let keys = backend.list("projects/p1").await.unwrap();
        assert_eq!(keys, vec!["projects/p1/input/a"]);
        assert_eq!(backend.size_of("projects/p1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_size_of_sums_scope() {
        let (_tmp, backend) = local();
        backend.save("projects/p1/input/a", b"12345").await.unwrap();
        backend.save("projects/p1/output/b", b"123").await.unwrap();
        backend.save("projects/p2/input/c", b"1234567").await.unwrap();
        assert_eq!(backend.size_of("projects/p1").await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_backslash_keys_normalize() {
        let (_tmp, backend) = local();
        backend
            .save("projects\\p1\\input\\a.txt", b"x")
            .await
            .unwrap();
        assert_eq!(backend.get("projects/p1/input/a.txt").await.unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_factory_rejects_unknown_backend() {
        let mut config = crate::config::AppConfig::from_env().unwrap();
        config.storage_backend = "tape".to_string();
        assert!(matches!(
            from_config(&config),
            Err(StorageError::Config(_))
        ));
    }
}
