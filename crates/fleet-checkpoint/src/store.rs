use async_trait::async_trait;
use fleet_core::FleetResult;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Key-addressed binary storage for checkpoint blobs.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `key`, replacing any previous blob.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> FleetResult<()>;
    /// The blob under `key`, if any.
    async fn get(&self, key: &str) -> FleetResult<Option<Vec<u8>>>;
    /// Returns `true` if something was removed.
    async fn delete(&self, key: &str) -> FleetResult<bool>;
    /// Every stored key.
    async fn list(&self) -> FleetResult<Vec<String>>;
}

/// Storage for the single metadata index document, read and written whole.
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// The whole document, or `None` before the first save.
    async fn load(&self) -> FleetResult<Option<Vec<u8>>>;
    /// Replace the whole document.
    async fn save(&self, bytes: Vec<u8>) -> FleetResult<()>;
}

/// Blobs stored as `{key}.ckpt` files in one directory.
pub struct FileBlobStore {
    dir: PathBuf,
}

const BLOB_SUFFIX: &str = ".ckpt";

impl FileBlobStore {
    /// Open `dir`, creating it if needed.
    pub async fn new(dir: impl Into<PathBuf>) -> FleetResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    /// Directory holding the blobs.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}{BLOB_SUFFIX}"))
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> FleetResult<()> {
        let path = self.blob_path(key);
        write_replace(&path, &bytes).await
    }

    async fn get(&self, key: &str) -> FleetResult<Option<Vec<u8>>> {
        match tokio::fs::read(self.blob_path(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> FleetResult<bool> {
        match tokio::fs::remove_file(self.blob_path(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> FleetResult<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(stem) = name.strip_suffix(BLOB_SUFFIX) {
                    keys.push(stem.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Index document kept as one JSON file.
pub struct FileIndexStore {
    path: PathBuf,
}

impl FileIndexStore {
    /// Index at `path`; parent directories are created on save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl IndexStore for FileIndexStore {
    async fn load(&self) -> FleetResult<Option<Vec<u8>>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, bytes: Vec<u8>) -> FleetResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        write_replace(&self.path, &bytes).await
    }
}

// Readers see either the old or the new file, never a torn write.
async fn write_replace(path: &Path, bytes: &[u8]) -> FleetResult<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// In-memory blob store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> FleetResult<()> {
        self.blobs.write().await.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> FleetResult<Option<Vec<u8>>> {
        Ok(self.blobs.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> FleetResult<bool> {
        Ok(self.blobs.write().await.remove(key).is_some())
    }

    async fn list(&self) -> FleetResult<Vec<String>> {
        let mut keys: Vec<String> = self.blobs.read().await.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

/// In-memory index document.
#[derive(Default)]
pub struct MemoryIndexStore {
    doc: RwLock<Option<Vec<u8>>>,
}

impl MemoryIndexStore {
    /// An empty store with no document yet.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IndexStore for MemoryIndexStore {
    async fn load(&self) -> FleetResult<Option<Vec<u8>>> {
        Ok(self.doc.read().await.clone())
    }

    async fn save(&self, bytes: Vec<u8>) -> FleetResult<()> {
        *self.doc.write().await = Some(bytes);
        Ok(())
    }
}
