//! [`FileKeyStore`]: one JSON document per record in a directory.
//!
//! Layout: `<dir>/<id>.json`. Each write goes to `<id>.json.tmp` first and is
//! renamed into place, so a reader never sees a half-written record.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{KeyState, KeyType};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{
    is_expired, sort_newest_first, KeyRecord, KeyStore, RotateOutcome, StateChange, StoreError,
};

const RECORD_EXTENSION: &str = "json";

/// Directory-backed key store.
///
/// Writers are serialised through an in-process mutex. [`KeyStore::rotate`]
/// writes the successor before demoting the old record, so an interrupted
/// rotation leaves two Active records (resolved by newest-wins selection)
/// rather than none.
#[derive(Clone, Debug)]
pub struct FileKeyStore {
    dir: Arc<PathBuf>,
    write_lock: Arc<Mutex<()>>,
}

impl FileKeyStore {
    /// Open (creating if needed) a store rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directory cannot be created.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir: Arc::new(dir),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the record file for `id`, or `None` if `id` could escape the
    /// store directory.
    fn record_path(&self, id: &str) -> Option<PathBuf> {
        let safe = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        safe.then(|| self.dir.join(format!("{id}.{RECORD_EXTENSION}")))
    }

    async fn read_record(&self, id: &str) -> Result<Option<KeyRecord>, StoreError> {
        let Some(path) = self.record_path(id) else {
            return Ok(None);
        };
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_record(&self, record: &KeyRecord) -> Result<(), StoreError> {
        let path = self
            .record_path(record.id())
            .ok_or_else(|| StoreError::Unavailable(format!("unsafe key id: {}", record.id())))?;
        let tmp = path.with_extension(format!("{RECORD_EXTENSION}.tmp"));
        let bytes = serde_json::to_vec_pretty(record)?;
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &path).await?;
        debug!(key_id = %record.id(), "record written");
        Ok(())
    }

    async fn exists(&self, id: &str) -> Result<bool, StoreError> {
        match self.record_path(id) {
            Some(path) => Ok(fs::try_exists(path).await?),
            None => Ok(false),
        }
    }

    /// Every decodable record. Files that cannot be read or parsed are
    /// logged and skipped so one bad record does not hide the others.
    async fn read_all(&self) -> Result<Vec<KeyRecord>, StoreError> {
        let mut entries = fs::read_dir(self.dir.as_path()).await?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let bytes = match fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable key record");
                    continue;
                }
            };
            match serde_json::from_slice(&bytes) {
                Ok(record) => out.push(record),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping undecodable key record");
                }
            }
        }
        sort_newest_first(&mut out);
        Ok(out)
    }
}

#[async_trait]
impl KeyStore for FileKeyStore {
    async fn insert(&self, record: &KeyRecord) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        if self.exists(record.id()).await? {
            return Err(StoreError::Duplicate(record.id().to_owned()));
        }
        self.write_record(record).await
    }

    async fn get(&self, id: &str) -> Result<Option<KeyRecord>, StoreError> {
        self.read_record(id).await
    }

    async fn find_active(&self, key_type: KeyType) -> Result<Vec<KeyRecord>, StoreError> {
        let mut all = self.read_all().await?;
        all.retain(|r| r.metadata.key_type == key_type && r.metadata.state == KeyState::Active);
        Ok(all)
    }

    async fn update_state(&self, id: &str, state: KeyState) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let Some(mut record) = self.read_record(id).await? else {
            return Ok(false);
        };
        if record.metadata.state != state {
            record.metadata.state = state;
            self.write_record(&record).await?;
        }
        Ok(true)
    }

    async fn transition(
        &self,
        id: &str,
        from: KeyState,
        to: KeyState,
    ) -> Result<StateChange, StoreError> {
        let _guard = self.write_lock.lock().await;
        let Some(mut record) = self.read_record(id).await? else {
            return Ok(StateChange::NotFound);
        };
        if record.metadata.state != from {
            return Ok(StateChange::Mismatch(record.metadata.state));
        }
        record.metadata.state = to;
        self.write_record(&record).await?;
        Ok(StateChange::Applied)
    }

    async fn rotate(
        &self,
        old_id: &str,
        successor: &KeyRecord,
    ) -> Result<RotateOutcome, StoreError> {
        let _guard = self.write_lock.lock().await;
        let Some(mut old) = self.read_record(old_id).await? else {
            return Ok(RotateOutcome::NotFound);
        };
        if old.metadata.state != KeyState::Active {
            return Ok(RotateOutcome::NotActive(old.metadata.state));
        }
        if self.exists(successor.id()).await? {
            return Err(StoreError::Duplicate(successor.id().to_owned()));
        }

        self.write_record(successor).await?;
        old.metadata.state = KeyState::Retiring;
        self.write_record(&old).await?;
        Ok(RotateOutcome::Rotated)
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<KeyRecord>, StoreError> {
        let mut all = self.read_all().await?;
        all.retain(|r| is_expired(r, now));
        Ok(all)
    }

    async fn find_by_fingerprint(&self, fingerprint: &str) -> Result<Vec<KeyRecord>, StoreError> {
        let mut all = self.read_all().await?;
        all.retain(|r| r.metadata.fingerprint == fingerprint);
        Ok(all)
    }

    async fn list(&self) -> Result<Vec<KeyRecord>, StoreError> {
        self.read_all().await
    }
}
