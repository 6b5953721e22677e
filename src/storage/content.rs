use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, Context};
use async_trait::async_trait;
use tracing::debug;

use crate::cli::config::StorageSettings;
use crate::crawler::task::ContentRecord;

/// Durable key -> record blob storage for crawled content.
///
/// Records are written under their deterministic content key, so writing the
/// same URL twice overwrites rather than duplicates. `exists` doubles as the
/// crawl-time duplicate check and, together with `list_keys`, as the
/// seen-set reconstruction path after a coordinator restart.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Persist a record under its content key, returning the key
    async fn put(&self, record: &ContentRecord) -> Result<String>;

    /// Fetch a record by key
    async fn get(&self, key: &str) -> Result<Option<ContentRecord>>;

    /// Whether a record exists for this key
    async fn exists(&self, key: &str) -> Result<bool>;

    /// All stored content keys
    async fn list_keys(&self) -> Result<Vec<String>>;

    /// Plain-text rendering of a record, used by the file-scan search fallback
    async fn read_text(&self, key: &str) -> Result<Option<String>>;
}

/// Factory for creating a ContentStore implementation
pub struct ContentStoreFactory;

impl ContentStoreFactory {
    /// Create a new ContentStore instance based on the settings
    pub async fn create(settings: &StorageSettings) -> Result<Arc<dyn ContentStore>> {
        match settings.storage_type.as_str() {
            "filesystem" => {
                let store = FsContentStore::new(settings.root_dir.clone()).await?;
                Ok(Arc::new(store))
            }
            _ => {
                anyhow::bail!("Unsupported content storage type: {}", settings.storage_type);
            }
        }
    }
}

/// Filesystem implementation of ContentStore. Each record is stored as
/// `<key>.json` with a `<key>.txt` plain-text sidecar for inspection.
pub struct FsContentStore {
    /// Directory holding all content files
    root: PathBuf,
}

impl FsContentStore {
    /// Create the store, ensuring the root directory exists
    pub async fn new(root: PathBuf) -> Result<Self> {
        tokio::fs::create_dir_all(&root)
            .await
            .context(format!("Failed to create content directory: {}", root.display()))?;

        Ok(Self { root })
    }

    fn json_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", key))
    }

    fn text_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.txt", key))
    }
}

#[async_trait]
impl ContentStore for FsContentStore {
    async fn put(&self, record: &ContentRecord) -> Result<String> {
        let key = record.content_key.clone();

        let json = serde_json::to_vec_pretty(record)
            .context("Failed to serialize content record")?;
        tokio::fs::write(self.json_path(&key), json)
            .await
            .context(format!("Failed to write content record {}", key))?;

        // Sidecar failure is not fatal: the JSON record is the source of truth
        if let Err(e) = tokio::fs::write(self.text_path(&key), record.to_plain_text()).await {
            debug!("Failed to write text sidecar for {}: {}", key, e);
        }

        debug!("Stored content for {} under {}", record.url, key);

        Ok(key)
    }

    async fn get(&self, key: &str) -> Result<Option<ContentRecord>> {
        match tokio::fs::read(self.json_path(key)).await {
            Ok(bytes) => {
                let record = serde_json::from_slice(&bytes)
                    .context(format!("Failed to parse content record {}", key))?;
                Ok(Some(record))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context(format!("Failed to read content record {}", key)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.json_path(key))
            .await
            .context(format!("Failed to check content record {}", key))?)
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .context(format!("Failed to list content directory: {}", self.root.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(false, |ext| ext == "json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    keys.push(stem.to_string());
                }
            }
        }

        Ok(keys)
    }

    async fn read_text(&self, key: &str) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.text_path(key)).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context(format!("Failed to read text sidecar {}", key)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::task::content_key;

    fn sample_record(url: &str) -> ContentRecord {
        ContentRecord {
            url: url.to_string(),
            title: "Title".to_string(),
            description: "Desc".to_string(),
            text_content: "some page text".to_string(),
            html: Some("<html></html>".to_string()),
            crawl_timestamp: 1_700_000_000,
            depth: 1,
            content_key: content_key(url),
        }
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsContentStore::new(dir.path().to_path_buf()).await.unwrap();

        let record = sample_record("https://a.test/page");
        let key = store.put(&record).await.unwrap();

        let loaded = store.get(&key).await.unwrap().unwrap();
        assert_eq!(loaded.url, "https://a.test/page");
        assert_eq!(loaded.text_content, "some page text");
        assert_eq!(loaded.content_key, key);
    }

    #[tokio::test]
    async fn exists_reflects_stored_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsContentStore::new(dir.path().to_path_buf()).await.unwrap();

        let record = sample_record("https://a.test/page");
        assert!(!store.exists(&record.content_key).await.unwrap());

        store.put(&record).await.unwrap();
        assert!(store.exists(&record.content_key).await.unwrap());
    }

    #[tokio::test]
    async fn overwrite_keeps_a_single_record_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsContentStore::new(dir.path().to_path_buf()).await.unwrap();

        let mut record = sample_record("https://a.test/page");
        store.put(&record).await.unwrap();

        record.title = "Updated".to_string();
        store.put(&record).await.unwrap();

        let keys = store.list_keys().await.unwrap();
        assert_eq!(keys.len(), 1);
        let loaded = store.get(&keys[0]).await.unwrap().unwrap();
        assert_eq!(loaded.title, "Updated");
    }

    #[tokio::test]
    async fn list_keys_ignores_text_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsContentStore::new(dir.path().to_path_buf()).await.unwrap();

        store.put(&sample_record("https://a.test/1")).await.unwrap();
        store.put(&sample_record("https://a.test/2")).await.unwrap();

        let keys = store.list_keys().await.unwrap();
        assert_eq!(keys.len(), 2);
    }

    #[tokio::test]
    async fn text_sidecar_contains_header_and_body() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsContentStore::new(dir.path().to_path_buf()).await.unwrap();

        let record = sample_record("https://a.test/page");
        let key = store.put(&record).await.unwrap();

        let text = store.read_text(&key).await.unwrap().unwrap();
        assert!(text.starts_with("URL: https://a.test/page\n"));
        assert!(text.contains("some page text"));
    }

    #[tokio::test]
    async fn get_missing_key_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsContentStore::new(dir.path().to_path_buf()).await.unwrap();

        assert!(store.get("deadbeef").await.unwrap().is_none());
        assert!(store.read_text("deadbeef").await.unwrap().is_none());
    }
}
