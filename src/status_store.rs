//! The status store: the collection of bucket plans plus the digest, kept
//! under a derived name on the status endpoint, and the single iteration
//! surface handed to the workers.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::bucket_status::{BucketStatus, FileTransferState};
use crate::digest::{DigestField, StatusDigest, DIGEST_FILENAME};
use crate::error::{MigError, MigResult};
use crate::input::Input;
use crate::store;
use crate::store::{Attrs, EntryType, StoreClient, StoreErrorKind};

/// `cloudmig.<srchost>.to.<dsthost>`, falling back to a fixed name when the
/// hosts push it past the 255 byte bucket-name ceiling.
pub fn store_name(src_host: &str, dst_host: &str) -> String {
    let name = format!("cloudmig.{}.to.{}", src_host, dst_host);
    if name.len() > 255 {
        "cloudmig.status".to_string()
    } else {
        name
    }
}

/// Probe for the store: list the buckets, and when the backend cannot do
/// that, fall back to opening the store path as a directory.
fn store_exists(client: &dyn StoreClient, name: &str) -> MigResult<(bool, bool)> {
    match client.list_all_buckets() {
        Ok(buckets) => {
            let found = buckets.iter().any(|b| b == name);
            if found {
                debug!("[Loading Status/Exists] found status store (bucket={})", name);
            }
            Ok((found, true))
        }
        Err(ref e) if e.kind() == StoreErrorKind::NotSupported => {
            debug!("[Loading Status/Exists] attempting to find status store within a directory");
            match client.opendir(name) {
                Ok(_) => Ok((true, false)),
                Err(ref e) if e.kind() == StoreErrorKind::NotFound => Ok((false, false)),
                Err(e) => {
                    error!("[Loading Status/Exists] could not open status store path: {}", e);
                    Err(MigError::StoreError(e))
                }
            }
        }
        Err(e) => {
            error!("[Loading Status/Exists] could not list status stores: {}", e);
            Err(MigError::StoreError(e))
        }
    }
}

/// Create the store, bucket first, directory when buckets are unsupported.
/// Returns whether the store is bucket-addressed.
fn store_create(client: &dyn StoreClient, name: &str) -> MigResult<bool> {
    info!("[Creating Status Store] status store not found, creating...");
    match client.make_bucket(name) {
        Ok(()) => {
            info!("[Creating Status Store] created successfully!");
            Ok(true)
        }
        Err(ref e) if e.kind() == StoreErrorKind::NotSupported => {
            client.mkdir(name, &Attrs::new()).map_err(|e| {
                error!("[Creating Status Store] could not create store(directory): {}", e);
                MigError::StoreError(e)
            })?;
            info!("[Creating Status Store] created successfully!");
            Ok(false)
        }
        Err(e) => {
            error!("[Creating Status Store] could not create store(bucket): {}", e);
            Err(MigError::StoreError(e))
        }
    }
}

fn mkdir_existing_ok(client: &dyn StoreClient, path: &str) -> MigResult<()> {
    match client.mkdir(path, &Attrs::new()) {
        Ok(()) => Ok(()),
        Err(ref e) if e.kind() == StoreErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(MigError::StoreError(e)),
    }
}

/// Make sure the destination container of a new plan exists.  A bucket
/// name owned by another tenant gets one retry under a timestamped name;
/// the returned locator is the one the plan must record.
pub fn ensure_destination(dst_client: &dyn StoreClient, locator: &str) -> MigResult<String> {
    match locator.find(':') {
        Some(colon) => {
            let (name, rest) = (&locator[..colon], &locator[colon..]);
            match dst_client.make_bucket(name) {
                Ok(()) => Ok(locator.to_string()),
                Err(ref e) if e.kind() == StoreErrorKind::NotSupported => {
                    mkdir_existing_ok(dst_client, name)?;
                    Ok(locator.to_string())
                }
                Err(ref e) if e.kind() == StoreErrorKind::AlreadyExists => {
                    let epoch = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
                    let renamed = format!("cloudmig-{}-{}", epoch, name);
                    info!(
                        "could not create the destination bucket {}, retrying as {}",
                        name, renamed
                    );
                    dst_client.make_bucket(&renamed).map_err(|e| {
                        error!("could not create destination bucket {}: {}", renamed, e);
                        MigError::StoreError(e)
                    })?;
                    Ok(format!("{}{}", renamed, rest))
                }
                Err(e) => {
                    error!("could not create destination bucket {}: {}", name, e);
                    Err(MigError::StoreError(e))
                }
            }
        }
        None => {
            mkdir_existing_ok(dst_client, locator)?;
            Ok(locator.to_string())
        }
    }
}

struct StoreInner {
    buckets: Vec<Arc<BucketStatus>>,
    cur_bucket: usize,
}

pub struct StatusStore {
    client: Arc<dyn StoreClient>,
    store_name: String,
    store_path: String,
    path_is_bucket: bool,
    digest: StatusDigest,
    inner: Mutex<StoreInner>,
}

impl StatusStore {
    /// Run on every invocation: find or create the store, download the
    /// digest, reconcile the plans on storage with the configured bucket
    /// mappings, and force-upload a consistent digest snapshot.
    pub fn load(
        status_client: Arc<dyn StoreClient>,
        src_client: &dyn StoreClient,
        dst_client: &dyn StoreClient,
        opts: &Input,
    ) -> MigResult<StatusStore> {
        info!("[Loading Status] starting status loading...");

        let name = store_name(&opts.source.host_label(), &opts.destination.host_label());
        let (found, mut path_is_bucket) = store_exists(&*status_client, &name)?;
        if !found {
            path_is_bucket = store_create(&*status_client, &name)?;
        }
        let store_path = if path_is_bucket { format!("{}:", name) } else { name.clone() };

        let digest = StatusDigest::new(
            store::locator_join(&store_path, DIGEST_FILENAME),
            opts.digest_refresh,
        );
        let regen_digest = digest.download(&*status_client)?;

        let status = StatusStore {
            client: status_client,
            store_name: name,
            store_path,
            path_is_bucket,
            digest,
            inner: Mutex::new(StoreInner { buckets: Vec::new(), cur_bucket: 0 }),
        };

        status.do_load_update(src_client, dst_client, opts, regen_digest)?;

        // force an upload so the store reflects a consistent snapshot
        status.digest.upload(&*status.client)?;

        info!("[Loading Status] status loading done with success");
        Ok(status)
    }

    fn lock_inner(&self) -> MigResult<MutexGuard<'_, StoreInner>> {
        self.inner
            .lock()
            .map_err(|_| MigError::LockError("status store lock poisoned".to_string()))
    }

    pub fn digest(&self) -> &StatusDigest {
        &self.digest
    }

    pub fn client(&self) -> &dyn StoreClient {
        &*self.client
    }

    fn do_load_update(
        &self,
        src_client: &dyn StoreClient,
        dst_client: &dyn StoreClient,
        opts: &Input,
        regen_digest: bool,
    ) -> MigResult<()> {
        info!("[Loading Status Store] loading and updating store...");

        let mut config_found = vec![false; opts.buckets.len()];

        let dir = self.client.opendir(&self.store_path).map_err(|e| {
            error!("[Loading Status Store] could not list status store: {}", e);
            MigError::StoreError(e)
        })?;
        for item in dir {
            let item = item.map_err(MigError::StoreError)?;
            if item.entry_type != EntryType::Regular
                || item.name == DIGEST_FILENAME
                || !item.name.ends_with(".json")
            {
                continue;
            }
            debug!("[Loading Status Store] browsing repo: entry={}", item.name);

            let matched = opts
                .buckets
                .iter()
                .position(|mapping| store::plan_filename(&mapping.src) == item.name);
            if let Some(idx) = matched {
                config_found[idx] = true;
            }

            // Found or not in the configuration, an existing plan resumes.
            let plan_path = store::locator_join(&self.store_path, &item.name);
            match BucketStatus::load(&*self.client, plan_path) {
                Ok((bucket, count, bytes)) => {
                    if regen_digest {
                        self.digest.add(&*self.client, DigestField::Objects, count)?;
                        self.digest.add(&*self.client, DigestField::Bytes, bytes)?;
                    }
                    self.lock_inner()?.buckets.push(bucket);
                }
                Err(e) => {
                    if !opts.force_resume {
                        error!("[Loading Status Store] could not load status file {}.", item.name);
                        return Err(e);
                    }
                    warn!(
                        "[Loading Status Store] discarding unusable plan {} ({}); --force-resume is set",
                        item.name, e
                    );
                    if let Some(idx) = matched {
                        // rebuilt from scratch by the creation pass below
                        config_found[idx] = false;
                    }
                }
            }
        }

        // Generate a plan for every configured mapping without one on the
        // store.
        for (idx, mapping) in opts.buckets.iter().enumerate() {
            debug!(
                "[Loading Status Store] attempting to create one bucket status: {} -> loaded={}",
                mapping.src, config_found[idx]
            );
            if config_found[idx] {
                continue;
            }
            let dstname = ensure_destination(dst_client, &mapping.dst)?;
            let plan_path =
                store::locator_join(&self.store_path, &store::plan_filename(&mapping.src));
            let (bucket, count, bytes) = BucketStatus::create(
                &*self.client,
                src_client,
                plan_path,
                &mapping.src,
                &dstname,
            )?;
            self.lock_inner()?.buckets.push(bucket);
            self.digest.add(&*self.client, DigestField::Objects, count)?;
            self.digest.add(&*self.client, DigestField::Bytes, bytes)?;
        }

        info!("[Loading Status Store] status store successfully loaded!");
        Ok(())
    }

    /// Next entry with `done == false` across all plans; buckets advance in
    /// load order, entries in plan order.
    pub fn next_incomplete_entry(&self) -> MigResult<Option<FileTransferState>> {
        let mut inner = self.lock_inner()?;
        while inner.cur_bucket < inner.buckets.len() {
            let bucket = inner.buckets[inner.cur_bucket].clone();
            if let Some(state) = bucket.next_incomplete_entry(&*self.client)? {
                return Ok(Some(state));
            }
            inner.cur_bucket += 1;
        }
        Ok(None)
    }

    /// Every entry regardless of completion, used by source deletion.
    pub fn next_entry(&self) -> MigResult<Option<FileTransferState>> {
        let mut inner = self.lock_inner()?;
        while inner.cur_bucket < inner.buckets.len() {
            let bucket = inner.buckets[inner.cur_bucket].clone();
            if let Some(state) = bucket.next_any_entry(&*self.client)? {
                return Ok(Some(state));
            }
            inner.cur_bucket += 1;
        }
        Ok(None)
    }

    pub fn reset_iteration(&self) -> MigResult<()> {
        let mut inner = self.lock_inner()?;
        inner.cur_bucket = 0;
        for bucket in &inner.buckets {
            bucket.reset_iteration()?;
        }
        Ok(())
    }

    /// Persist the mid-object checkpoint and account the chunk.
    pub fn entry_update(&self, state: &FileTransferState, chunk_bytes: u64) -> MigResult<()> {
        if let Err(e) = state.write_checkpoint(&*self.client) {
            warn!(
                "[Migrating] could not update state of migration for object {}",
                state.obj_path
            );
            return Err(e);
        }
        self.digest.add(&*self.client, DigestField::DoneBytes, chunk_bytes)
    }

    /// Finalize the entry in its plan and account the completed object.
    pub fn entry_complete(&self, state: &FileTransferState) -> MigResult<()> {
        if let Err(e) = state.bucket.entry_complete(&*self.client, state) {
            warn!(
                "[Migrating] could not register end of migration for object {}",
                state.obj_path
            );
            return Err(e);
        }
        self.digest.add(&*self.client, DigestField::DoneObjects, 1)
    }

    /// Delete every plan, the digest, and the store itself.
    pub fn delete(&self) -> MigResult<()> {
        let inner = self.lock_inner()?;
        for bucket in &inner.buckets {
            bucket.delete(&*self.client);
        }
        self.digest.delete(&*self.client);
        if self.path_is_bucket {
            if let Err(e) = self.client.delete_bucket(&self.store_name) {
                warn!("[Deleting Status Store] could not delete bucket {}: {}", self.store_name, e);
            }
        } else if let Err(e) = self.client.rmdir(&self.store_path) {
            warn!("[Deleting Status Store] could not delete directory {}: {}", self.store_path, e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DirEntry, FileStream, StoreError};
    use nix::fcntl::OFlag;
    use serde_json::Value;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn store_name_derivation_and_fallback() {
        assert_eq!(store_name("a.example", "b.example"), "cloudmig.a.example.to.b.example");
        let long = "h".repeat(300);
        assert_eq!(store_name(&long, "x"), "cloudmig.status");
    }

    /// client stub whose make_bucket reports EEXIST for the original name
    struct CollidingClient {
        attempts: AtomicU32,
    }

    impl crate::store::StoreClient for CollidingClient {
        fn make_bucket(&self, name: &str) -> Result<(), StoreError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if name.starts_with("cloudmig-") {
                Ok(())
            } else {
                Err(StoreError::already_exists(name))
            }
        }
        fn delete_bucket(&self, _: &str) -> Result<(), StoreError> {
            unimplemented!()
        }
        fn list_all_buckets(&self) -> Result<Vec<String>, StoreError> {
            unimplemented!()
        }
        fn mkdir(&self, _: &str, _: &Attrs) -> Result<(), StoreError> {
            unimplemented!()
        }
        fn rmdir(&self, _: &str) -> Result<(), StoreError> {
            unimplemented!()
        }
        fn opendir(
            &self,
            _: &str,
        ) -> Result<Box<dyn Iterator<Item = Result<DirEntry, StoreError>> + Send>, StoreError>
        {
            unimplemented!()
        }
        fn getattr(&self, _: &str) -> Result<Attrs, StoreError> {
            unimplemented!()
        }
        fn readlink(&self, _: &str) -> Result<String, StoreError> {
            unimplemented!()
        }
        fn symlink(&self, _: &str, _: &str) -> Result<(), StoreError> {
            unimplemented!()
        }
        fn fget(&self, _: &str) -> Result<(Vec<u8>, Attrs), StoreError> {
            unimplemented!()
        }
        fn fput(&self, _: &str, _: &[u8], _: &Attrs) -> Result<(), StoreError> {
            unimplemented!()
        }
        fn unlink(&self, _: &str) -> Result<(), StoreError> {
            unimplemented!()
        }
        fn open(
            &self,
            _: &str,
            _: OFlag,
            _: Option<&Value>,
        ) -> Result<Box<dyn FileStream>, StoreError> {
            unimplemented!()
        }
    }

    #[test]
    fn destination_collision_renames_once() {
        let client = CollidingClient { attempts: AtomicU32::new(0) };
        let renamed = ensure_destination(&client, "dst:prefix").expect("ensure");
        assert!(renamed.starts_with("cloudmig-"));
        assert!(renamed.ends_with("-dst:prefix"));
        assert_eq!(client.attempts.load(Ordering::SeqCst), 2);
    }
}
