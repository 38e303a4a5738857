//! # Filesystem Adapter
//!
//! One `<key>.cache` file per key holding the `{v, e, ct}` record envelope;
//! collections are subdirectories.
//!
//! Filesystems give us no compare-and-swap, and file locks aren't reliable
//! everywhere, so every mutation is serialized behind an advisory
//! `<key>.lock` marker file: bounded retries with a short sleep, and the
//! whole operation reports `Ok(false)` if the lock can't be had. That turns
//! a would-be race into a per-key serialization point for cooperating
//! clients.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::config::{DEFAULT_LOCK_ATTEMPTS, DEFAULT_LOCK_BACKOFF_MICROS};
use crate::error::{CacheError, Result};
use crate::expiry::{is_past, EarlyExpiration, Expiry};
use crate::store::{validate_collection_name, validate_key, Lookup, Store};
use crate::value::{token_for, Record, StorageValue};

/// File-per-key store rooted at a directory.
#[derive(Debug, Clone)]
pub struct FilesystemStore {
    directory: PathBuf,
    is_collection: bool,
    lock_attempts: u32,
    lock_backoff: Duration,
    check: EarlyExpiration,
}

impl FilesystemStore {
    /// Open (creating if needed) a store rooted at `directory`.
    pub async fn new(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory).await?;
        Ok(Self {
            directory,
            is_collection: false,
            lock_attempts: DEFAULT_LOCK_ATTEMPTS,
            lock_backoff: Duration::from_micros(DEFAULT_LOCK_BACKOFF_MICROS),
            check: EarlyExpiration::default(),
        })
    }

    /// Override the early-expiration sampler (deterministic in tests).
    pub fn with_early_expiration(mut self, check: EarlyExpiration) -> Self {
        self.check = check;
        self
    }

    fn checked_key(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        if key.contains(['/', '\\']) || key == "." || key == ".." {
            return Err(CacheError::invalid_key(key, "not filesystem-safe"));
        }
        Ok(())
    }

    fn cache_path(&self, key: &str) -> PathBuf {
        self.directory.join(format!("{key}.cache"))
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.directory.join(format!("{key}.lock"))
    }

    /// Acquire the advisory lock for a key: bounded attempts, short sleeps.
    async fn lock(&self, key: &str) -> Result<bool> {
        fs::create_dir_all(&self.directory).await?;
        let path = self.lock_path(key);
        for _ in 0..self.lock_attempts {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(true),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    tokio::time::sleep(self.lock_backoff).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        warn!(key = %key, "gave up acquiring advisory lock");
        Ok(false)
    }

    async fn unlock(&self, key: &str) {
        let _ = fs::remove_file(self.lock_path(key)).await;
    }

    async fn read_record(&self, key: &str) -> Result<Option<Record>> {
        match fs::read_to_string(self.cache_path(key)).await {
            Ok(raw) => Ok(Some(Record::decode(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_record(&self, key: &str, record: &Record) -> Result<()> {
        fs::create_dir_all(&self.directory).await?;
        let mut file = fs::File::create(self.cache_path(key)).await?;
        file.write_all(record.encode()?.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Live check with eager purge of expired files.
    async fn exists(&self, key: &str) -> Result<bool> {
        let record = match self.read_record(key).await? {
            Some(record) => record,
            None => return Ok(false),
        };
        if is_past(record.e) {
            let _ = fs::remove_file(self.cache_path(key)).await;
            return Ok(false);
        }
        Ok(true)
    }

    async fn delete_if_live(&self, key: &str) -> Result<bool> {
        let existed = self.exists(key).await?;
        if existed {
            fs::remove_file(self.cache_path(key)).await?;
        }
        Ok(existed)
    }

    async fn set_locked(
        &self,
        key: &str,
        value: StorageValue,
        expire: Expiry,
        compute_micros: Option<u64>,
    ) -> Result<bool> {
        let expiry = expire.normalize();
        if is_past(expiry) {
            // writing an already-expired value: just make sure it's gone
            self.delete_if_live(key).await?;
            return Ok(true);
        }
        self.write_record(
            key,
            &Record {
                v: value,
                e: expiry,
                ct: compute_micros,
            },
        )
        .await?;
        Ok(true)
    }
}

#[async_trait]
impl Store for FilesystemStore {
    async fn get(&self, key: &str) -> Result<Lookup> {
        self.checked_key(key)?;
        let record = match self.read_record(key).await? {
            Some(record) => record,
            None => return Ok(Lookup::miss(key)),
        };
        let token = token_for(&record.v)?;
        if self.check.is_expired(record.e, record.ct) {
            return Ok(Lookup::expired(key, record.v, token, record.e, record.ct));
        }
        Ok(Lookup::hit(key, record.v, token, record.e, record.ct))
    }

    async fn set_entry(
        &self,
        key: &str,
        value: StorageValue,
        expire: Expiry,
        compute_micros: Option<u64>,
    ) -> Result<bool> {
        self.checked_key(key)?;
        // the write itself doesn't need the lock, but we must not overwrite
        // a key another operation currently holds
        if !self.lock(key).await? {
            return Ok(false);
        }
        let result = self.set_locked(key, value, expire, compute_micros).await;
        self.unlock(key).await;
        result
    }

    async fn cas_entry(
        &self,
        token: &str,
        key: &str,
        value: StorageValue,
        expire: Expiry,
        compute_micros: Option<u64>,
    ) -> Result<bool> {
        self.checked_key(key)?;
        if !self.lock(key).await? {
            return Ok(false);
        }
        let result = async {
            let current = self.get(key).await?;
            if current.is_hit() && current.token.as_deref() != Some(token) {
                return Ok(false);
            }
            self.set_locked(key, value, expire, compute_micros).await
        }
        .await;
        self.unlock(key).await;
        result
    }

    async fn add(&self, key: &str, value: StorageValue, expire: Expiry) -> Result<bool> {
        self.checked_key(key)?;
        if !self.lock(key).await? {
            return Ok(false);
        }
        let result = async {
            if self.exists(key).await? {
                return Ok(false);
            }
            self.set_locked(key, value, expire, None).await
        }
        .await;
        self.unlock(key).await;
        result
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.checked_key(key)?;
        if !self.lock(key).await? {
            return Ok(false);
        }
        let result = self.delete_if_live(key).await;
        self.unlock(key).await;
        result
    }

    async fn clear(&self) -> Result<bool> {
        if self.is_collection {
            match fs::remove_dir_all(&self.directory).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            return Ok(true);
        }
        // root store keeps its directory, drops everything inside
        let mut entries = match fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                fs::remove_dir_all(&path).await?;
            } else {
                fs::remove_file(&path).await?;
            }
        }
        Ok(true)
    }

    fn collection(&self, name: &str) -> Result<Arc<dyn Store>> {
        validate_collection_name(name)?;
        Ok(Arc::new(FilesystemStore {
            directory: self.directory.join(name),
            is_collection: true,
            lock_attempts: self.lock_attempts,
            lock_backoff: self.lock_backoff,
            check: self.check.clone(),
        }))
    }

    async fn touch(&self, key: &str, expire: Expiry) -> Result<bool> {
        self.checked_key(key)?;
        if !self.lock(key).await? {
            return Ok(false);
        }
        let result = async {
            let current = self.get(key).await?;
            match current.value {
                Some(value) => {
                    self.set_locked(key, value, expire, current.compute_micros)
                        .await
                }
                None => Ok(false),
            }
        }
        .await;
        self.unlock(key).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreExt;
    use tempfile::TempDir;

    async fn store(dir: &TempDir) -> FilesystemStore {
        FilesystemStore::new(dir.path().join("cache"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_round_trip_and_delete() {
        let dir = TempDir::new().unwrap();
        let fs_store = store(&dir).await;

        assert!(fs_store
            .set("x", StorageValue::from("hello"), Expiry::Never)
            .await
            .unwrap());
        assert_eq!(
            fs_store.get_value("x").await.unwrap(),
            Some(StorageValue::from("hello"))
        );
        assert!(fs_store.delete("x").await.unwrap());
        assert!(fs_store.get("x").await.unwrap().value.is_none());
        assert!(!fs_store.delete("x").await.unwrap());
        assert!(fs_store
            .add("x", StorageValue::from("world"), Expiry::Never)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_cas_conflict() {
        let dir = TempDir::new().unwrap();
        let fs_store = store(&dir).await;

        fs_store
            .set("k", StorageValue::from("v1"), Expiry::Never)
            .await
            .unwrap();
        let token = fs_store.get("k").await.unwrap().token.unwrap();
        fs_store
            .set("k", StorageValue::from("v2"), Expiry::Never)
            .await
            .unwrap();
        assert!(!fs_store
            .cas(&token, "k", StorageValue::from("v3"), Expiry::Never)
            .await
            .unwrap());
        assert_eq!(
            fs_store.get_value("k").await.unwrap(),
            Some(StorageValue::from("v2"))
        );
    }

    #[tokio::test]
    async fn test_lock_contention_times_out_and_releases() {
        let dir = TempDir::new().unwrap();
        let fs_store = store(&dir).await;

        // simulate a foreign holder by planting the lock file
        let lock = fs_store.lock_path("busy");
        fs::create_dir_all(lock.parent().unwrap()).await.unwrap();
        fs::write(&lock, b"").await.unwrap();

        assert!(!fs_store
            .set("busy", StorageValue::from("v"), Expiry::Never)
            .await
            .unwrap());

        // holder releases; everything works again
        fs::remove_file(&lock).await.unwrap();
        assert!(fs_store
            .set("busy", StorageValue::from("v"), Expiry::Never)
            .await
            .unwrap());
        // and our own operations never leave a lock behind
        assert!(!fs::try_exists(fs_store.lock_path("busy")).await.unwrap());
    }

    #[tokio::test]
    async fn test_collection_subdirectory() {
        let dir = TempDir::new().unwrap();
        let fs_store = store(&dir).await;
        let scoped = fs_store.collection("shard-1").unwrap();

        scoped
            .set("k", StorageValue::from("inner"), Expiry::Never)
            .await
            .unwrap();
        fs_store
            .set("k", StorageValue::from("outer"), Expiry::Never)
            .await
            .unwrap();

        assert_eq!(
            scoped.get_value("k").await.unwrap(),
            Some(StorageValue::from("inner"))
        );
        scoped.clear().await.unwrap();
        assert!(scoped.get("k").await.unwrap().value.is_none());
        assert!(fs_store.get("k").await.unwrap().is_hit());
    }

    #[tokio::test]
    async fn test_filesystem_unsafe_keys_rejected() {
        let dir = TempDir::new().unwrap();
        let fs_store = store(&dir).await;
        assert!(fs_store.get("a/b").await.is_err());
        assert!(fs_store.get("..").await.is_err());
    }
}
