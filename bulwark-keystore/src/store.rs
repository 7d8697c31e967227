//! Key-store backends: where sealed records durably live.
//!
//! Every backend speaks the same contract over opaque byte values: bounded
//! status probe, create-if-absent, get, idempotent delete, and a single-pass
//! name listing. Name validation is the caller's duty.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::error::StoreError;

/// How long a status probe may take before the backend counts as
/// unreachable.
pub const STATUS_DEADLINE: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreState {
    Available,
    Unreachable,
}

/// Result of a status probe.
#[derive(Clone, Copy, Debug)]
pub struct StoreStatus {
    pub state: StoreState,
    pub latency: Duration,
}

impl StoreStatus {
    pub fn is_reachable(&self) -> bool {
        self.state == StoreState::Available
    }
}

/// Uniform CRUD+list contract over an external key store.
///
/// All methods are safe under concurrent invocation; `create` is atomic
/// with respect to `get` and `delete` on the same name.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Probe reachability. Must complete within [`STATUS_DEADLINE`].
    async fn status(&self) -> StoreStatus;

    /// Store `value` under `name`, failing with [`StoreError::Exists`] if
    /// the name is taken.
    async fn create(&self, name: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Fetch the value stored under `name`.
    async fn get(&self, name: &str) -> Result<Vec<u8>, StoreError>;

    /// Remove `name`. Absence is not an error.
    async fn delete(&self, name: &str) -> Result<(), StoreError>;

    /// Single-pass iterator over all names. Order is unspecified but stable
    /// within one iteration.
    async fn list(&self) -> Result<NameIter, StoreError>;
}

// ---------------------------------------------------------------------------
// Name iterator
// ---------------------------------------------------------------------------

/// A one-shot cursor over stored names with a deferred error slot.
pub struct NameIter {
    names: std::vec::IntoIter<String>,
    err: Option<StoreError>,
}

impl NameIter {
    pub fn new(names: Vec<String>) -> Self {
        Self {
            names: names.into_iter(),
            err: None,
        }
    }

    /// A listing that was cut short: everything read so far plus the error
    /// that stopped it.
    pub fn with_err(names: Vec<String>, err: StoreError) -> Self {
        Self {
            names: names.into_iter(),
            err: Some(err),
        }
    }

    /// The error that terminated iteration early, if any. Inspect after
    /// draining the iterator.
    pub fn err(&self) -> Option<&StoreError> {
        self.err.as_ref()
    }
}

impl Iterator for NameIter {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.names.next()
    }
}

// ---------------------------------------------------------------------------
// Name validation
// ---------------------------------------------------------------------------

/// Maximum length of a key or policy name.
pub const MAX_NAME_LEN: usize = 80;

/// Whether `name` is a legal key/policy name: `[0-9A-Za-z_.\-]{1,80}`.
/// Enforced at every boundary; backends assume it already holds.
pub fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || b == b'-')
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// Volatile in-process store, for tests and `--dev` mode.
#[derive(Default)]
pub struct MemStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyStore for MemStore {
    async fn status(&self) -> StoreStatus {
        StoreStatus {
            state: StoreState::Available,
            latency: Duration::ZERO,
        }
    }

    async fn create(&self, name: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let mut entries = self.entries.write();
        if entries.contains_key(name) {
            return Err(StoreError::Exists(name.into()));
        }
        entries.insert(name.into(), value);
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        self.entries
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.into()))
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.entries.write().remove(name);
        Ok(())
    }

    async fn list(&self) -> Result<NameIter, StoreError> {
        Ok(NameIter::new(self.entries.read().keys().cloned().collect()))
    }
}

// ---------------------------------------------------------------------------
// Filesystem backend
// ---------------------------------------------------------------------------

/// One file per entry under a flat directory.
///
/// `create` gains its atomicity from writing a unique temp file and
/// hard-linking it into place: the link either installs the complete value
/// or fails because the name is taken. Readers never observe a partial
/// write.
pub struct FsStore {
    dir: PathBuf,
}

const TMP_PREFIX: &str = ".tmp-";

impl FsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| StoreError::Backend(format!("create dir: {}", e)))?;
        Ok(Self { dir })
    }

    fn entry_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn tmp_path(&self) -> Result<PathBuf, StoreError> {
        let mut rnd = [0u8; 8];
        getrandom::getrandom(&mut rnd)
            .map_err(|e| StoreError::Backend(format!("random: {}", e)))?;
        Ok(self.dir.join(format!("{}{}", TMP_PREFIX, hex::encode(rnd))))
    }
}

#[async_trait]
impl KeyStore for FsStore {
    async fn status(&self) -> StoreStatus {
        let start = Instant::now();
        let probe = tokio::time::timeout(STATUS_DEADLINE, tokio::fs::metadata(&self.dir)).await;
        let latency = start.elapsed();
        let state = match probe {
            Ok(Ok(meta)) if meta.is_dir() => StoreState::Available,
            _ => StoreState::Unreachable,
        };
        StoreStatus { state, latency }
    }

    async fn create(&self, name: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let tmp = self.tmp_path()?;
        tokio::fs::write(&tmp, &value)
            .await
            .map_err(|e| StoreError::Backend(format!("write: {}", e)))?;
        let linked = tokio::fs::hard_link(&tmp, self.entry_path(name)).await;
        let _ = tokio::fs::remove_file(&tmp).await;
        match linked {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(StoreError::Exists(name.into()))
            }
            Err(e) => Err(StoreError::Backend(format!("link: {}", e))),
        }
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        match tokio::fs::read(self.entry_path(name)).await {
            Ok(value) => Ok(value),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(name.into()))
            }
            Err(e) => Err(StoreError::Backend(format!("read: {}", e))),
        }
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.entry_path(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Backend(format!("delete: {}", e))),
        }
    }

    async fn list(&self) -> Result<NameIter, StoreError> {
        let mut dir = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| StoreError::Backend(format!("readdir: {}", e)))?;
        let mut names = Vec::new();
        loop {
            match dir.next_entry().await {
                Ok(Some(entry)) => {
                    if let Some(name) = entry.file_name().to_str() {
                        if !name.starts_with(TMP_PREFIX) {
                            names.push(name.to_string());
                        }
                    }
                }
                Ok(None) => return Ok(NameIter::new(names)),
                Err(e) => {
                    return Ok(NameIter::with_err(
                        names,
                        StoreError::Backend(format!("readdir: {}", e)),
                    ))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation() {
        assert!(valid_name("my-key"));
        assert!(valid_name("a.b_c-1"));
        assert!(valid_name(&"x".repeat(80)));
        assert!(!valid_name(""));
        assert!(!valid_name(&"x".repeat(81)));
        assert!(!valid_name("a/b"));
        assert!(!valid_name("a b"));
        assert!(!valid_name("käse"));
        assert!(!valid_name("#policy#x"));
    }

    #[tokio::test]
    async fn mem_create_is_exclusive() {
        let store = MemStore::new();
        store.create("k", vec![1]).await.unwrap();
        assert_eq!(
            store.create("k", vec![2]).await,
            Err(StoreError::Exists("k".into()))
        );
        assert_eq!(store.get("k").await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn mem_delete_is_idempotent() {
        let store = MemStore::new();
        store.create("k", vec![1]).await.unwrap();
        store.delete("k").await.unwrap();
        store.delete("k").await.unwrap();
        assert!(matches!(store.get("k").await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn fs_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path()).unwrap();

        store.create("alpha", b"one".to_vec()).await.unwrap();
        store.create("beta", b"two".to_vec()).await.unwrap();
        assert_eq!(
            store.create("alpha", b"three".to_vec()).await,
            Err(StoreError::Exists("alpha".into()))
        );
        assert_eq!(store.get("alpha").await.unwrap(), b"one");

        let mut names: Vec<_> = store.list().await.unwrap().collect();
        names.sort();
        assert_eq!(names, vec!["alpha", "beta"]);

        store.delete("alpha").await.unwrap();
        store.delete("alpha").await.unwrap();
        assert!(matches!(
            store.get("alpha").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn fs_list_skips_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path()).unwrap();
        store.create("real", b"v".to_vec()).await.unwrap();
        std::fs::write(dir.path().join(".tmp-deadbeef"), b"junk").unwrap();
        let names: Vec<_> = store.list().await.unwrap().collect();
        assert_eq!(names, vec!["real"]);
    }

    #[tokio::test]
    async fn fs_status_reports_latency() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path()).unwrap();
        let status = store.status().await;
        assert!(status.is_reachable());
        assert!(status.latency < STATUS_DEADLINE);
    }
}
