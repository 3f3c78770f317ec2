//! The status digest: four aggregate counters summarizing every plan,
//! persisted as a small JSON document on the status store.

use serde_derive::{Deserialize, Serialize};
use std::sync::Mutex;

use crate::error::{MigError, MigResult};
use crate::store::StoreClient;

/// filename of the digest document inside the status store
pub const DIGEST_FILENAME: &str = ".cloudmig";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestField {
    Objects,
    DoneObjects,
    Bytes,
    DoneBytes,
}

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
struct Counters {
    bytes: u64,
    done_bytes: u64,
    objects: u64,
    done_objects: u64,
}

#[derive(Debug, Default)]
struct DigestInner {
    counters: Counters,
    refresh_count: u64,
}

pub struct StatusDigest {
    path: String,
    refresh_frequency: u64,
    inner: Mutex<DigestInner>,
}

impl StatusDigest {
    pub fn new(path: String, refresh_frequency: u64) -> StatusDigest {
        StatusDigest {
            path,
            refresh_frequency,
            inner: Mutex::new(DigestInner::default()),
        }
    }

    fn lock(&self) -> MigResult<std::sync::MutexGuard<'_, DigestInner>> {
        self.inner
            .lock()
            .map_err(|_| MigError::LockError("status digest lock poisoned".to_string()))
    }

    /// Fetch the digest from the status store.  A missing document is not
    /// an error: the caller is told to regenerate the counters by
    /// re-summing the loaded bucket plans.
    pub fn download(&self, client: &dyn StoreClient) -> MigResult<bool> {
        let (data, _) = match client.fget(&self.path) {
            Ok(found) => found,
            Err(ref e) if e.kind() == crate::store::StoreErrorKind::NotFound => {
                debug!("[Loading Status Digest] no digest at {}, regenerating", self.path);
                return Ok(true);
            }
            Err(e) => {
                error!("[Loading Status Digest] could not read {}: {}", self.path, e);
                return Err(MigError::StoreError(e));
            }
        };
        let counters: Counters = serde_json::from_slice(&data)?;
        let mut inner = self.lock()?;
        inner.counters = counters;
        Ok(false)
    }

    /// Serialize a snapshot and upload it.  The snapshot is taken under the
    /// digest lock; the upload happens with the lock released.
    pub fn upload(&self, client: &dyn StoreClient) -> MigResult<()> {
        let snapshot = {
            let inner = self.lock()?;
            inner.counters
        };
        info!(
            "Uploading digest: {}/{} objs, {}/{} bytes",
            snapshot.done_objects, snapshot.objects, snapshot.done_bytes, snapshot.bytes
        );
        let body = serde_json::to_vec(&snapshot)?;
        client
            .fput(&self.path, &body, &crate::store::Attrs::new())
            .map_err(MigError::StoreError)
    }

    pub fn get(&self, field: DigestField) -> MigResult<u64> {
        let inner = self.lock()?;
        Ok(match field {
            DigestField::Objects => inner.counters.objects,
            DigestField::DoneObjects => inner.counters.done_objects,
            DigestField::Bytes => inner.counters.bytes,
            DigestField::DoneBytes => inner.counters.done_bytes,
        })
    }

    /// consistent (bytes, done_bytes, objects, done_objects) tuple
    pub fn snapshot(&self) -> MigResult<(u64, u64, u64, u64)> {
        let inner = self.lock()?;
        let c = inner.counters;
        Ok((c.bytes, c.done_bytes, c.objects, c.done_objects))
    }

    /// Add to a counter.  Crossing a multiple of the refresh frequency on
    /// the done-objects counter re-uploads the digest, after the lock is
    /// released.
    pub fn add(&self, client: &dyn StoreClient, field: DigestField, value: u64) -> MigResult<()> {
        let do_upload = {
            let mut inner = self.lock()?;
            match field {
                DigestField::Objects => {
                    inner.counters.objects += value;
                    false
                }
                DigestField::Bytes => {
                    inner.counters.bytes += value;
                    false
                }
                DigestField::DoneBytes => {
                    inner.counters.done_bytes += value;
                    false
                }
                DigestField::DoneObjects => {
                    inner.counters.done_objects += value;
                    inner.refresh_count += value;
                    if inner.refresh_count >= self.refresh_frequency {
                        inner.refresh_count = 0;
                        true
                    } else {
                        false
                    }
                }
            }
        };
        if do_upload {
            self.upload(client)?;
        }
        Ok(())
    }

    /// best-effort removal of the digest document
    pub fn delete(&self, client: &dyn StoreClient) {
        if let Err(e) = client.unlink(&self.path) {
            warn!("[Deleting Status Digest] could not delete {}: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::posix_store::PosixStore;
    use tempfile::tempdir;

    #[test]
    fn missing_digest_asks_for_regeneration() {
        let dir = tempdir().expect("tempdir");
        let store = PosixStore::new(dir.path());
        let digest = StatusDigest::new(DIGEST_FILENAME.to_string(), 50);
        assert!(digest.download(&store).expect("download"));
    }

    #[test]
    fn upload_then_download_round_trips() {
        let dir = tempdir().expect("tempdir");
        let store = PosixStore::new(dir.path());
        let digest = StatusDigest::new(DIGEST_FILENAME.to_string(), 50);
        digest.add(&store, DigestField::Objects, 3).expect("add");
        digest.add(&store, DigestField::Bytes, 4096).expect("add");
        digest.add(&store, DigestField::DoneBytes, 1024).expect("add");
        digest.upload(&store).expect("upload");

        let fresh = StatusDigest::new(DIGEST_FILENAME.to_string(), 50);
        assert!(!fresh.download(&store).expect("download"));
        assert_eq!(fresh.snapshot().expect("snapshot"), (4096, 1024, 3, 0));
    }

    #[test]
    fn done_objects_crossing_frequency_uploads() {
        let dir = tempdir().expect("tempdir");
        let store = PosixStore::new(dir.path());
        let digest = StatusDigest::new(DIGEST_FILENAME.to_string(), 2);
        digest.add(&store, DigestField::DoneObjects, 1).expect("add");
        // one completion, below the frequency: nothing uploaded yet
        assert!(store.fget(DIGEST_FILENAME).is_err());
        digest.add(&store, DigestField::DoneObjects, 1).expect("add");
        let (data, _) = store.fget(DIGEST_FILENAME).expect("digest uploaded");
        let parsed: serde_json::Value = serde_json::from_slice(&data).expect("json");
        assert_eq!(parsed["done_objects"], 2);
    }

    #[test]
    fn done_counters_never_exceed_totals_in_normal_flow() {
        let dir = tempdir().expect("tempdir");
        let store = PosixStore::new(dir.path());
        let digest = StatusDigest::new(DIGEST_FILENAME.to_string(), 50);
        digest.add(&store, DigestField::Objects, 10).expect("add");
        digest.add(&store, DigestField::Bytes, 100).expect("add");
        for _ in 0..10 {
            digest.add(&store, DigestField::DoneObjects, 1).expect("add");
            digest.add(&store, DigestField::DoneBytes, 10).expect("add");
            let (bytes, done_bytes, objects, done_objects) = digest.snapshot().expect("snapshot");
            assert!(done_bytes <= bytes);
            assert!(done_objects <= objects);
        }
    }
}
