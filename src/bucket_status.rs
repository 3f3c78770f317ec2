//! Bucket status records.
//!
//! One JSON plan document per source bucket lives on the status store.  It
//! enumerates every object with its size, type and completion flag, and is
//! the single authority for what remains to be migrated.  Next to the plan
//! file sits a directory of per-entry checkpoint blobs used to resume
//! half-transferred objects.

use serde_derive::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{MigError, MigResult};
use crate::store;
use crate::store::{Attrs, EntryType, StoreClient, StoreErrorKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanEntry {
    pub path: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub entry_type: i64,
    pub done: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The serialized plan document.  Unknown fields survive a load/store
/// cycle so newer writers can extend the format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanDoc {
    pub srcpath: String,
    pub dstpath: String,
    pub objects_total: u64,
    pub bytes_total: u64,
    pub objects_done: u64,
    pub bytes_done: u64,
    pub objects: Vec<PlanEntry>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PlanDoc {
    /// Structural validation run after every load: entry count and
    /// aggregate size must match the totals.
    pub fn validate(&self) -> MigResult<(u64, u64)> {
        if self.srcpath.is_empty() || self.dstpath.is_empty() {
            return Err(MigError::PlanError(
                "plan document has an empty srcpath or dstpath".to_string(),
            ));
        }
        if self.objects.len() as u64 != self.objects_total {
            return Err(MigError::PlanError(format!(
                "plan array holds {} entries for an 'objects_total' of {}",
                self.objects.len(),
                self.objects_total
            )));
        }
        let aggregated: u64 = self.objects.iter().map(|o| o.size).sum();
        if aggregated != self.bytes_total {
            return Err(MigError::PlanError(format!(
                "aggregate entry size {} does not match 'bytes_total' {}",
                aggregated, self.bytes_total
            )));
        }
        Ok((self.objects_total, self.bytes_total))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryCheckpoint {
    offset: u64,
    rstatus: Value,
    wstatus: Value,
}

/// Everything a worker needs to act on one selected plan entry.
pub struct FileTransferState {
    /// object key relative to the source bucket
    pub obj_path: String,
    /// fully qualified locators computed from the plan paths
    pub src_path: String,
    pub dst_path: String,
    /// locator of the per-entry checkpoint blob
    pub status_path: String,
    pub entry_type: EntryType,
    pub size: u64,
    /// bytes transferred so far, never exceeds size
    pub offset: u64,
    /// opaque stream status documents carried verbatim for the client
    pub rstatus: Option<Value>,
    pub wstatus: Option<Value>,
    /// index of the entry in the owning plan's object array
    pub state_idx: usize,
    pub bucket: Arc<BucketStatus>,
}

impl FileTransferState {
    /// Persist the mid-object resume record for this entry.
    pub fn write_checkpoint(&self, client: &dyn StoreClient) -> MigResult<()> {
        let checkpoint = EntryCheckpoint {
            offset: self.offset,
            rstatus: self.rstatus.clone().unwrap_or(Value::Null),
            wstatus: self.wstatus.clone().unwrap_or(Value::Null),
        };
        let body = serde_json::to_vec(&checkpoint)?;
        client
            .fput(&self.status_path, &body, &Attrs::new())
            .map_err(MigError::StoreError)
    }

    /// drop the carried client state once the entry is handed back
    pub fn release(mut self) {
        self.rstatus = None;
        self.wstatus = None;
    }
}

struct BucketInner {
    plan: PlanDoc,
    next_entry: usize,
}

pub struct BucketStatus {
    /// locator of the plan document on the status store
    path: String,
    /// same locator without the ".json" suffix, holds the checkpoints
    bucket_dir: String,
    inner: Mutex<BucketInner>,
}

fn walk_source(
    src_client: &dyn StoreClient,
    srcname: &str,
    rel_dir: &str,
    entries: &mut Vec<PlanEntry>,
    count: &mut u64,
    bytes: &mut u64,
) -> MigResult<()> {
    let dirpath = store::locator_join(srcname, rel_dir);
    let dir = src_client.opendir(&dirpath).map_err(|e| {
        error!("[Creating Bucket Status] could not open directory {}: {}", dirpath, e);
        MigError::StoreError(e)
    })?;
    for item in dir {
        let item = item.map_err(MigError::StoreError)?;
        if item.name == "." || item.name == ".." {
            continue;
        }
        let rel = if rel_dir.is_empty() {
            item.name.clone()
        } else {
            format!("{}/{}", rel_dir, item.name)
        };
        debug!(
            "[Creating Bucket Status] adding entry path={} size={} type={:?}",
            rel, item.size, item.entry_type
        );
        entries.push(PlanEntry {
            path: rel.clone(),
            size: item.size,
            entry_type: item.entry_type.code(),
            done: false,
            extra: Map::new(),
        });
        *count += 1;
        *bytes += item.size;
        if item.entry_type == EntryType::Directory {
            walk_source(src_client, srcname, &rel, entries, count, bytes)?;
        }
    }
    Ok(())
}

impl BucketStatus {
    fn with_plan(path: String, plan: PlanDoc) -> BucketStatus {
        let bucket_dir = if path.ends_with(".json") {
            path[..path.len() - 5].to_string()
        } else {
            path.clone()
        };
        BucketStatus {
            path,
            bucket_dir,
            inner: Mutex::new(BucketInner { plan, next_entry: 0 }),
        }
    }

    fn lock(&self) -> MigResult<MutexGuard<'_, BucketInner>> {
        self.inner
            .lock()
            .map_err(|_| MigError::LockError("bucket status lock poisoned".to_string()))
    }

    /// Walk the source bucket and build a fresh plan, upload it, and make
    /// the sibling checkpoint directory.  Returns the record plus the added
    /// object count and byte total for the digest.
    pub fn create(
        status_client: &dyn StoreClient,
        src_client: &dyn StoreClient,
        plan_path: String,
        srcname: &str,
        dstname: &str,
    ) -> MigResult<(Arc<BucketStatus>, u64, u64)> {
        debug!("[Creating Bucket Status] creating status for bucket '{}'...", srcname);

        let mut entries = Vec::new();
        let mut count = 0;
        let mut bytes = 0;
        walk_source(src_client, srcname, "", &mut entries, &mut count, &mut bytes)?;

        let plan = PlanDoc {
            srcpath: srcname.to_string(),
            dstpath: dstname.to_string(),
            objects_total: count,
            bytes_total: bytes,
            objects_done: 0,
            bytes_done: 0,
            objects: entries,
            extra: Map::new(),
        };

        let body = serde_json::to_vec(&plan)?;
        let bucket = BucketStatus::with_plan(plan_path, plan);
        status_client
            .fput(&bucket.path, &body, &Attrs::new())
            .map_err(|e| {
                error!(
                    "[Creating Bucket Status] could not upload plan for {} at {}: {}",
                    srcname, bucket.path, e
                );
                MigError::StoreError(e)
            })?;
        if let Err(e) = status_client.mkdir(&bucket.bucket_dir, &Attrs::new()) {
            // a leftover directory from an aborted run is usable as-is
            if e.kind() != StoreErrorKind::AlreadyExists {
                error!("[Creating Bucket Status] could not mkdir '{}': {}", bucket.bucket_dir, e);
                return Err(MigError::StoreError(e));
            }
        }

        debug!("[Creating Bucket Status] bucket {}: SUCCESS", srcname);
        Ok((Arc::new(bucket), count, bytes))
    }

    /// Fetch and validate an existing plan document.
    pub fn load(
        status_client: &dyn StoreClient,
        plan_path: String,
    ) -> MigResult<(Arc<BucketStatus>, u64, u64)> {
        debug!("[Loading Bucket Status] loading status from {}...", plan_path);
        let (data, _) = status_client.fget(&plan_path).map_err(|e| {
            error!("[Loading Bucket Status] could not get file {}: {}", plan_path, e);
            MigError::StoreError(e)
        })?;
        let plan: PlanDoc = serde_json::from_slice(&data)?;
        let (count, bytes) = plan.validate()?;
        debug!("[Loading Bucket Status] loaded bucket status");
        Ok((Arc::new(BucketStatus::with_plan(plan_path, plan)), count, bytes))
    }

    pub fn reset_iteration(&self) -> MigResult<()> {
        let mut inner = self.lock()?;
        inner.next_entry = 0;
        Ok(())
    }

    /// next entry with `done == false`; loads any saved checkpoint
    pub fn next_incomplete_entry(
        self: &Arc<Self>,
        status_client: &dyn StoreClient,
    ) -> MigResult<Option<FileTransferState>> {
        self.next_entry_ex(status_client, |entry| !entry.done, true)
    }

    /// every entry in plan order, used by source deletion
    pub fn next_any_entry(
        self: &Arc<Self>,
        status_client: &dyn StoreClient,
    ) -> MigResult<Option<FileTransferState>> {
        self.next_entry_ex(status_client, |_| true, false)
    }

    fn next_entry_ex<F>(
        self: &Arc<Self>,
        status_client: &dyn StoreClient,
        select: F,
        do_load: bool,
    ) -> MigResult<Option<FileTransferState>>
    where
        F: Fn(&PlanEntry) -> bool,
    {
        let picked = {
            let mut inner = self.lock()?;
            let mut found = None;
            while inner.next_entry < inner.plan.objects.len() {
                let idx = inner.next_entry;
                inner.next_entry += 1;
                let entry = &inner.plan.objects[idx];
                if select(entry) {
                    found = Some((
                        idx,
                        entry.path.clone(),
                        entry.size,
                        EntryType::from_code(entry.entry_type),
                        store::locator_join(&inner.plan.srcpath, &entry.path),
                        store::locator_join(&inner.plan.dstpath, &entry.path),
                    ));
                    break;
                }
            }
            found
        };

        let (state_idx, obj_path, size, entry_type, src_path, dst_path) = match picked {
            Some(p) => p,
            None => return Ok(None),
        };

        let mut state = FileTransferState {
            obj_path,
            src_path,
            dst_path,
            status_path: format!("{}/{}.json", self.bucket_dir, state_idx),
            entry_type,
            size,
            offset: 0,
            rstatus: None,
            wstatus: None,
            state_idx,
            bucket: self.clone(),
        };

        // the checkpoint fetch happens with the bucket lock released
        if do_load {
            self.load_entry_checkpoint(status_client, &mut state)?;
        }

        debug!("[Bucket Status Next Entry] next file: {}...", state.obj_path);
        Ok(Some(state))
    }

    fn load_entry_checkpoint(
        &self,
        status_client: &dyn StoreClient,
        state: &mut FileTransferState,
    ) -> MigResult<()> {
        let (data, _) = match status_client.fget(&state.status_path) {
            Ok(found) => found,
            // no intermediary state, not an error
            Err(ref e) if e.kind() == StoreErrorKind::NotFound => return Ok(()),
            Err(e) => {
                error!("[Bucket Status Loading Object] could not get state file: {}", e);
                return Err(MigError::StoreError(e));
            }
        };
        let checkpoint: EntryCheckpoint = serde_json::from_slice(&data)?;
        state.offset = checkpoint.offset;
        state.rstatus = Some(checkpoint.rstatus);
        state.wstatus = Some(checkpoint.wstatus);
        Ok(())
    }

    /// Mark the entry done and upload the refreshed plan, both under the
    /// bucket lock, then drop the now-stale checkpoint blob.
    pub fn entry_complete(
        &self,
        status_client: &dyn StoreClient,
        state: &FileTransferState,
    ) -> MigResult<()> {
        debug!(
            "[Bucket Status Entry Complete] saving completion of object '{}'...",
            state.obj_path
        );
        {
            let mut inner = self.lock()?;
            match inner.plan.objects.get_mut(state.state_idx) {
                Some(entry) => entry.done = true,
                None => {
                    return Err(MigError::PlanError(format!(
                        "no plan entry at index {} for {}",
                        state.state_idx, state.obj_path
                    )));
                }
            }
            let body = serde_json::to_vec(&inner.plan)?;
            status_client
                .fput(&self.path, &body, &Attrs::new())
                .map_err(|e| {
                    error!(
                        "[Bucket Status Entry Complete] could not upload plan {}: {}",
                        self.path, e
                    );
                    MigError::StoreError(e)
                })?;
        }

        // a stale checkpoint is not fatal, the done flag is the authority
        if let Err(e) = status_client.unlink(&state.status_path) {
            if e.kind() != StoreErrorKind::NotFound {
                warn!(
                    "[Bucket Status Entry Complete] could not delete checkpoint {}: {}",
                    state.status_path, e
                );
            }
        }
        Ok(())
    }

    /// Remove the checkpoint directory and the plan document.
    pub fn delete(&self, status_client: &dyn StoreClient) {
        match status_client.opendir(&self.bucket_dir) {
            Ok(dir) => {
                for item in dir {
                    let item = match item {
                        Ok(item) => item,
                        Err(e) => {
                            warn!("[Deleting Bucket Status] readdir failed: {}", e);
                            break;
                        }
                    };
                    if item.name == "." || item.name == ".." {
                        continue;
                    }
                    let path = format!("{}/{}", self.bucket_dir, item.name);
                    if let Err(e) = status_client.unlink(&path) {
                        warn!("[Deleting Bucket Status] could not delete {}: {}", path, e);
                    }
                }
            }
            Err(e) => warn!(
                "[Deleting Bucket Status] could not open {}: {}",
                self.bucket_dir, e
            ),
        }
        if let Err(e) = status_client.rmdir(&self.bucket_dir) {
            warn!("[Deleting Bucket Status] could not rmdir {}: {}", self.bucket_dir, e);
        }
        if let Err(e) = status_client.unlink(&self.path) {
            warn!("[Deleting Bucket Status] could not delete {}: {}", self.path, e);
        }
    }
}
