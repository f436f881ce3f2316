//! Download cache shared by concurrent builds.
//!
//! Entries are keyed by (URL, checksum algorithm, checksum). A key is owned
//! by at most one build at a time through an exclusive file lock, so a second
//! build asking for the same key waits and then reuses the first build's
//! download instead of fetching it again.
//!
//! Layout under the cache root:
//!
//! ```text
//! blobs/<key>.iso       completed media
//! partial/<key>.part    in-flight download, never reused
//! index/<key>.json      written last; its presence marks the key complete
//! locks/<key>.lock      fs2 exclusive lock
//! tmp/                  staging for index writes
//! ```

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::env;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use time::OffsetDateTime;

use crate::cancel::CancelToken;
use crate::checksum::ChecksumType;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Cache key for a piece of installation media.
///
/// Changing the checksum changes the key, so an entry fetched for an old
/// checksum is never picked up again.
pub fn cache_key(url: &str, kind: ChecksumType, checksum: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update(b"\n");
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(checksum.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Metadata recorded when an entry is committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub url: String,
    pub checksum_type: String,
    pub checksum: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    key: String,
    stored_at_utc: String,
    #[serde(flatten)]
    meta: EntryMeta,
}

/// Exclusive hold on one cache key.
///
/// Dropping an entry without committing discards its partial download and
/// releases the lock.
pub trait CacheEntry: Send {
    fn key(&self) -> &str;

    /// Path of the completed file, if this key was committed earlier.
    fn completed_path(&self) -> Option<PathBuf>;

    /// Where a new download for this key should be written.
    fn partial_path(&self) -> PathBuf;

    /// Promote the partial download and mark the key complete.
    fn commit(self: Box<Self>, meta: EntryMeta) -> Result<PathBuf>;

    /// Forget a completed entry whose contents turned out to be bad.
    fn invalidate(&mut self) -> Result<()>;
}

/// A cache mapping keys to locally resident files.
pub trait Cache: Send + Sync {
    /// Block until `key` is exclusively held.
    ///
    /// Returns `Ok(None)` if `cancel` fires while waiting.
    fn lock(&self, key: &str, cancel: &CancelToken) -> Result<Option<Box<dyn CacheEntry>>>;
}

/// Filesystem cache rooted at a directory.
#[derive(Debug, Clone)]
pub struct FileCache {
    root: PathBuf,
}

impl FileCache {
    /// Open (and create if needed) the cache at `root`.
    pub fn open(root: &Path) -> Result<Self> {
        let cache = Self {
            root: root.to_path_buf(),
        };
        cache.ensure_layout()?;
        Ok(cache)
    }

    /// `VBOX_BUILDER_CACHE`, else `<user cache dir>/vbox-builder`.
    pub fn default_root() -> PathBuf {
        if let Ok(dir) = env::var("VBOX_BUILDER_CACHE") {
            if !dir.trim().is_empty() {
                return PathBuf::from(dir);
            }
        }
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("vbox-builder")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.blobs_dir(),
            self.partial_dir(),
            self.index_dir(),
            self.locks_dir(),
            self.tmp_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create cache dir {}", dir.display()))?;
        }
        Ok(())
    }

    fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs")
    }

    fn partial_dir(&self) -> PathBuf {
        self.root.join("partial")
    }

    fn index_dir(&self) -> PathBuf {
        self.root.join("index")
    }

    fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Completed file for `key`, looked up without taking the lock.
    pub fn get(&self, key: &str) -> Result<Option<PathBuf>> {
        validate_key(key)?;
        let paths = self.paths(key);
        Ok(paths.completed())
    }

    fn paths(&self, key: &str) -> EntryPaths {
        EntryPaths {
            blob: self.blobs_dir().join(format!("{key}.iso")),
            partial: self.partial_dir().join(format!("{key}.part")),
            index: self.index_dir().join(format!("{key}.json")),
            tmp_dir: self.tmp_dir(),
        }
    }
}

impl Cache for FileCache {
    fn lock(&self, key: &str, cancel: &CancelToken) -> Result<Option<Box<dyn CacheEntry>>> {
        validate_key(key)?;
        let lock_path = self.locks_dir().join(format!("{key}.lock"));

        // Lock files are never unlinked: removing a file another build is
        // waiting on would let a third build lock a fresh inode alongside it.
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("Failed to create lock file: {}", lock_path.display()))?;

        let mut announced = false;
        while lock_file.try_lock_exclusive().is_err() {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            if !announced {
                log::info!("Cache key {} is held by another build, waiting", key);
                announced = true;
            }
            thread::sleep(LOCK_POLL_INTERVAL);
        }

        Ok(Some(Box::new(FileCacheEntry {
            key: key.to_string(),
            paths: self.paths(key),
            _lock: lock_file,
        })))
    }
}

#[derive(Debug)]
struct EntryPaths {
    blob: PathBuf,
    partial: PathBuf,
    index: PathBuf,
    tmp_dir: PathBuf,
}

impl EntryPaths {
    fn completed(&self) -> Option<PathBuf> {
        if self.index.is_file() && self.blob.is_file() {
            Some(self.blob.clone())
        } else {
            None
        }
    }
}

/// Holds the key lock for as long as it lives.
#[derive(Debug)]
struct FileCacheEntry {
    key: String,
    paths: EntryPaths,
    _lock: File,
}

impl CacheEntry for FileCacheEntry {
    fn key(&self) -> &str {
        &self.key
    }

    fn completed_path(&self) -> Option<PathBuf> {
        self.paths.completed()
    }

    fn partial_path(&self) -> PathBuf {
        self.paths.partial.clone()
    }

    fn commit(self: Box<Self>, meta: EntryMeta) -> Result<PathBuf> {
        let paths = &self.paths;
        if !paths.partial.is_file() {
            bail!(
                "Nothing to commit for cache key {}: {} is missing",
                self.key,
                paths.partial.display()
            );
        }

        promote(&paths.partial, &paths.blob)?;

        let entry = IndexEntry {
            key: self.key.clone(),
            stored_at_utc: now_utc(),
            meta,
        };
        let bytes = serde_json::to_vec_pretty(&entry)?;
        // The key lock is held, so the staging name cannot collide.
        let tmp = paths.tmp_dir.join(format!("{}.json", self.key));
        fs::write(&tmp, bytes)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        promote(&tmp, &paths.index)?;

        log::info!("Cached {} as {}", entry.meta.url, paths.blob.display());
        Ok(paths.blob.clone())
    }

    fn invalidate(&mut self) -> Result<()> {
        for path in [&self.paths.index, &self.paths.blob] {
            if path.exists() {
                fs::remove_file(path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
            }
        }
        Ok(())
    }
}

impl Drop for FileCacheEntry {
    fn drop(&mut self) {
        if self.paths.partial.exists() {
            let _ = fs::remove_file(&self.paths.partial);
        }
    }
}

fn now_utc() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

/// Move a finished file into place. Every directory lives under the cache
/// root, so this is a same-filesystem rename.
fn promote(src: &Path, dst: &Path) -> Result<()> {
    fs::rename(src, dst)
        .with_context(|| format!("Failed to move {} to {}", src.display(), dst.display()))
}

/// Keys become file names; only `[A-Za-z0-9_-]` is allowed.
fn validate_key(key: &str) -> Result<()> {
    let safe = key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if key.is_empty() || !safe {
        bail!("invalid cache key '{key}'");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use tempfile::TempDir;

    fn meta() -> EntryMeta {
        EntryMeta {
            url: "https://example.com/os.iso".to_string(),
            checksum_type: "md5".to_string(),
            checksum: "5d41402abc4b2a76b9719d911017c592".to_string(),
            size_bytes: 5,
        }
    }

    #[test]
    fn key_changes_with_checksum() {
        let url = "https://example.com/os.iso";
        let a = cache_key(url, ChecksumType::Md5, "aa");
        let b = cache_key(url, ChecksumType::Md5, "bb");
        let c = cache_key(url, ChecksumType::Sha1, "aa");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, cache_key(url, ChecksumType::Md5, "aa"));
        assert!(validate_key(&a).is_ok());
    }

    #[test]
    fn commit_marks_entry_complete() {
        let tmp = TempDir::new().unwrap();
        let cache = FileCache::open(tmp.path()).unwrap();
        let cancel = CancelToken::new();

        let entry = cache.lock("abc", &cancel).unwrap().unwrap();
        assert!(entry.completed_path().is_none());
        fs::write(entry.partial_path(), b"hello").unwrap();
        let path = entry.commit(meta()).unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"hello");
        assert_eq!(cache.get("abc").unwrap(), Some(path.clone()));
        assert_eq!(fs::read_dir(tmp.path().join("tmp")).unwrap().count(), 0);
        assert_eq!(fs::read_dir(tmp.path().join("partial")).unwrap().count(), 0);
        let index = fs::read_to_string(tmp.path().join("index/abc.json")).unwrap();
        assert!(index.contains("\"size_bytes\": 5"), "{index}");

        let again = cache.lock("abc", &cancel).unwrap().unwrap();
        assert_eq!(again.completed_path(), Some(path));
    }

    #[test]
    fn dropped_entry_discards_partial_data() {
        let tmp = TempDir::new().unwrap();
        let cache = FileCache::open(tmp.path()).unwrap();

        let entry = cache.lock("abc", &CancelToken::new()).unwrap().unwrap();
        let partial = entry.partial_path();
        fs::write(&partial, b"half").unwrap();
        drop(entry);

        assert!(!partial.exists());
        assert_eq!(cache.get("abc").unwrap(), None);
    }

    #[test]
    fn invalidate_forgets_completed_entry() {
        let tmp = TempDir::new().unwrap();
        let cache = FileCache::open(tmp.path()).unwrap();
        let cancel = CancelToken::new();

        let entry = cache.lock("abc", &cancel).unwrap().unwrap();
        fs::write(entry.partial_path(), b"hello").unwrap();
        entry.commit(meta()).unwrap();

        let mut entry = cache.lock("abc", &cancel).unwrap().unwrap();
        entry.invalidate().unwrap();
        assert!(entry.completed_path().is_none());
    }

    #[test]
    fn second_holder_waits_for_first() {
        let tmp = TempDir::new().unwrap();
        let cache = FileCache::open(tmp.path()).unwrap();
        let other = FileCache::open(tmp.path()).unwrap();
        let cancel = CancelToken::new();

        let first = cache.lock("abc", &cancel).unwrap().unwrap();
        let (tx, rx) = mpsc::channel();
        let waiter = thread::spawn(move || {
            let entry = other.lock("abc", &CancelToken::new()).unwrap().unwrap();
            tx.send(entry.completed_path()).unwrap();
        });

        assert!(rx.recv_timeout(Duration::from_millis(400)).is_err());
        fs::write(first.partial_path(), b"hello").unwrap();
        let path = first.commit(meta()).unwrap();

        let seen = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        waiter.join().unwrap();
        assert_eq!(seen, Some(path));
    }

    #[test]
    fn waiting_is_cancellable() {
        let tmp = TempDir::new().unwrap();
        let cache = FileCache::open(tmp.path()).unwrap();

        let _held = cache.lock("abc", &CancelToken::new()).unwrap().unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let other = FileCache::open(tmp.path()).unwrap();
        assert!(other.lock("abc", &cancel).unwrap().is_none());
    }

    #[test]
    fn rejects_unsafe_keys() {
        let tmp = TempDir::new().unwrap();
        let cache = FileCache::open(tmp.path()).unwrap();
        assert!(cache.lock("../etc", &CancelToken::new()).is_err());
        assert!(cache.lock("a b", &CancelToken::new()).is_err());
        assert!(cache.get("").is_err());
        assert!(cache.get("0123abcdef").unwrap().is_none());
    }
}
