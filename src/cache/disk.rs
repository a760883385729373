//! One-file-per-key durable store in the user's cache directory.
//!
//! Layout: `<cache_dir>/raw-thumbnailer/<tier>/<hash of key>.rtd`
//! (`~/.cache/raw-thumbnailer/thumb/...` on Linux).

use super::durable::DurableStore;
use crate::error::StorageError;
use crate::state::DerivativeKind;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

const FILE_EXTENSION: &str = "rtd";

/// Default directory for a derivative tier, if the platform has a cache dir.
pub fn default_cache_dir(kind: DerivativeKind) -> Option<PathBuf> {
    let mut path = dirs_next::cache_dir().or_else(dirs_next::home_dir)?;
    path.push("raw-thumbnailer");
    path.push(kind.tier_name());
    Some(path)
}

#[derive(Debug, Clone)]
pub struct DiskStore {
    dir: PathBuf,
}

impl DiskStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Keys are asset ids, which may be paths; hash them into flat file names.
    fn path_for(&self, key: &str) -> PathBuf {
        let hash = blake3::hash(key.as_bytes()).to_hex();
        self.dir.join(format!("{}.{FILE_EXTENSION}", &hash.as_str()[..32]))
    }
}

#[async_trait]
impl DurableStore for DiskStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(key);
        // Write then rename so a crash never leaves a half-written record
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let ours = path
                .extension()
                .is_some_and(|ext| ext == FILE_EXTENSION || ext == "tmp");
            if ours {
                fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "disk"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disk_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path().join("thumb")).await.unwrap();

        assert_eq!(store.get("/photos/DSC_0001.NEF").await.unwrap(), None);

        store.set("/photos/DSC_0001.NEF", b"derivative").await.unwrap();
        assert_eq!(
            store.get("/photos/DSC_0001.NEF").await.unwrap().as_deref(),
            Some(&b"derivative"[..])
        );

        store.delete("/photos/DSC_0001.NEF").await.unwrap();
        assert_eq!(store.get("/photos/DSC_0001.NEF").await.unwrap(), None);

        // Deleting a missing key is not an error
        store.delete("/photos/DSC_0001.NEF").await.unwrap();
    }

    #[tokio::test]
    async fn test_disk_store_clear_keeps_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).await.unwrap();
        store.set("a", b"1").await.unwrap();
        store.set("b", b"2").await.unwrap();
        std::fs::write(dir.path().join("notes.txt"), "keep me").unwrap();

        store.clear().await.unwrap();

        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.get("b").await.unwrap(), None);
        assert!(dir.path().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_disk_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = DiskStore::open(dir.path()).await.unwrap();
            store.set("42", b"persisted").await.unwrap();
        }
        let reopened = DiskStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.get("42").await.unwrap().as_deref(), Some(&b"persisted"[..]));
    }
}
