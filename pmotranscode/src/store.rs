//! On-disk store of completed transcodes.
//!
//! One file per [`CacheKey`], named by the key, directly inside the cache
//! directory. There is no index: a file carrying the bare key name with a
//! non-zero size is a complete entry.
//!
//! Encodes never write to that name. Each fill writes its own staging file,
//! `<key>.<pid>-<seq>.part`, and renames it over the key once the encoder
//! finished cleanly. A process that dies mid-encode therefore leaves at most
//! a staging file behind, which lookups ignore and eviction sweeps.

use std::{
    io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    time::SystemTime,
};

use tokio::fs::{File, OpenOptions};

use crate::{command::CacheKey, error::TranscodeError};

const BYTES_PER_MB: u64 = 1024 * 1024;
const STAGING_SUFFIX: &str = ".part";

static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
    limit_bytes: u64,
}

/// A complete cache entry opened for reading.
#[derive(Debug)]
pub struct CacheEntry {
    file: File,
    path: PathBuf,
    len: u64,
}

impl CacheEntry {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.len
    }

    pub fn into_parts(self) -> (File, PathBuf) {
        (self.file, self.path)
    }
}

/// A file found while scanning the cache directory.
#[derive(Debug, Clone)]
pub(crate) struct StoredEntry {
    pub key: Option<CacheKey>,
    /// Unpublished output of a fill, live or left over by a crash.
    pub staging: bool,
    pub path: PathBuf,
    pub len: u64,
    pub modified: SystemTime,
}

impl CacheStore {
    /// `limit_mb` bounds the total size kept by eviction; 0 disables it.
    pub fn new(dir: impl Into<PathBuf>, limit_mb: u64) -> Self {
        Self {
            dir: dir.into(),
            limit_bytes: limit_mb.saturating_mul(BYTES_PER_MB),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn limit_bytes(&self) -> u64 {
        self.limit_bytes
    }

    /// Creates the cache directory (owner writable, world readable) if needed.
    pub async fn ensure_dir(&self) -> Result<(), TranscodeError> {
        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o755);
        builder
            .create(&self.dir)
            .await
            .map_err(|err| TranscodeError::cache(&self.dir, err))
    }

    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key.as_str())
    }

    /// Opens the complete entry for `key`, if there is one.
    ///
    /// A missing or empty file is a miss.
    pub async fn open_entry(&self, key: &CacheKey) -> Result<Option<CacheEntry>, TranscodeError> {
        let path = self.entry_path(key);
        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(TranscodeError::cache(&path, err)),
        };
        let len = file
            .metadata()
            .await
            .map_err(|err| TranscodeError::cache(&path, err))?
            .len();
        Ok((len > 0).then_some(CacheEntry { file, path, len }))
    }

    /// Creates a fresh staging file for one fill of `key`.
    ///
    /// Names are unique per process and per call, so concurrent or abandoned
    /// fills never share a file.
    pub async fn create_staging(&self, key: &CacheKey) -> Result<(File, PathBuf), TranscodeError> {
        let seq = STAGING_SEQ.fetch_add(1, Ordering::Relaxed);
        let path = self
            .dir
            .join(format!("{key}.{}-{seq}{STAGING_SUFFIX}", std::process::id()));
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o644);
        let file = options
            .open(&path)
            .await
            .map_err(|err| TranscodeError::cache(&path, err))?;
        Ok((file, path))
    }

    /// Deletes an entry. A missing entry is not an error.
    pub async fn remove_entry(&self, key: &CacheKey) -> Result<(), TranscodeError> {
        let path = self.entry_path(key);
        remove_file(&path).await
    }

    /// Marks an entry as recently used for eviction purposes.
    pub async fn touch(&self, path: &Path) -> Result<(), TranscodeError> {
        let owned = path.to_path_buf();
        let result = tokio::task::spawn_blocking(move || {
            std::fs::File::options()
                .write(true)
                .open(&owned)?
                .set_modified(SystemTime::now())
        })
        .await
        .map_err(io::Error::other)
        .and_then(|res| res);
        result.map_err(|err| TranscodeError::cache(path, err))
    }

    /// Total size in bytes of the files in the cache directory, staging
    /// files included.
    pub async fn usage(&self) -> Result<u64, TranscodeError> {
        Ok(self.entries().await?.iter().map(|entry| entry.len).sum())
    }

    pub(crate) async fn entries(&self) -> Result<Vec<StoredEntry>, TranscodeError> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(TranscodeError::cache(&self.dir, err)),
        };

        let mut entries = Vec::new();
        while let Some(item) = dir
            .next_entry()
            .await
            .map_err(|err| TranscodeError::cache(&self.dir, err))?
        {
            let metadata = match item.metadata().await {
                Ok(metadata) if metadata.is_file() => metadata,
                Ok(_) => continue,
                // removed while scanning
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(TranscodeError::cache(item.path(), err)),
            };
            let name = item.file_name();
            let (key, staging) = parse_file_name(name.to_str());
            entries.push(StoredEntry {
                key,
                staging,
                path: item.path(),
                len: metadata.len(),
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
        Ok(entries)
    }
}

/// Splits a directory entry name into its key and whether it is staging.
fn parse_file_name(name: Option<&str>) -> (Option<CacheKey>, bool) {
    let Some(name) = name else {
        return (None, false);
    };
    match name.strip_suffix(STAGING_SUFFIX) {
        Some(stem) => {
            let key = stem.split_once('.').map(|(key, _)| key);
            (key.and_then(CacheKey::from_file_name), true)
        }
        None => (CacheKey::from_file_name(name), false),
    }
}

pub(crate) async fn remove_file(path: &Path) -> Result<(), TranscodeError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(TranscodeError::cache(path, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{command::resolve, profile::Profile};

    fn key_for(input: &str) -> CacheKey {
        let profile = Profile::new("audio/test", "test", 0, "sh <file>");
        resolve(&profile, Path::new(input)).unwrap().cache_key()
    }

    #[tokio::test]
    async fn ensure_dir_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let store = CacheStore::new(root.path().join("a/b/transcode"), 10);
        store.ensure_dir().await.unwrap();
        store.ensure_dir().await.unwrap();
        assert!(store.dir().is_dir());
        assert_eq!(store.limit_bytes(), 10 * 1024 * 1024);
    }

    #[tokio::test]
    async fn only_published_entries_are_found() {
        let root = tempfile::tempdir().unwrap();
        let store = CacheStore::new(root.path(), 0);
        let key = key_for("/music/a.flac");

        assert!(store.open_entry(&key).await.unwrap().is_none());
        assert!(!store.entry_path(&key).exists());

        std::fs::write(store.entry_path(&key), b"").unwrap();
        assert!(store.open_entry(&key).await.unwrap().is_none());

        std::fs::write(store.entry_path(&key), b"encoded").unwrap();
        let existing = store.open_entry(&key).await.unwrap().unwrap();
        assert_eq!(existing.size(), 7);
        assert_eq!(std::fs::read(existing.path()).unwrap(), b"encoded");
    }

    #[tokio::test]
    async fn staging_files_are_distinct_and_never_hits() {
        let root = tempfile::tempdir().unwrap();
        let store = CacheStore::new(root.path(), 0);
        let key = key_for("/music/c.flac");

        let (_, first) = store.create_staging(&key).await.unwrap();
        let (_, second) = store.create_staging(&key).await.unwrap();
        assert_ne!(first, second);
        std::fs::write(&first, b"half an encode").unwrap();
        assert!(store.open_entry(&key).await.unwrap().is_none());

        let entries = store.entries().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|entry| entry.staging && entry.key.as_ref() == Some(&key)));
    }

    #[tokio::test]
    async fn remove_entry_tolerates_missing_files() {
        let root = tempfile::tempdir().unwrap();
        let store = CacheStore::new(root.path(), 0);
        let key = key_for("/music/b.flac");

        store.remove_entry(&key).await.unwrap();
        std::fs::write(store.entry_path(&key), b"x").unwrap();
        store.remove_entry(&key).await.unwrap();
        assert!(!store.entry_path(&key).exists());
    }

    #[tokio::test]
    async fn usage_sums_entry_sizes() {
        let root = tempfile::tempdir().unwrap();
        let store = CacheStore::new(root.path().join("missing"), 0);
        assert_eq!(store.usage().await.unwrap(), 0);

        store.ensure_dir().await.unwrap();
        std::fs::write(store.entry_path(&key_for("/1")), vec![0u8; 100]).unwrap();
        std::fs::write(store.entry_path(&key_for("/2")), vec![0u8; 23]).unwrap();
        assert_eq!(store.usage().await.unwrap(), 123);
    }
}
