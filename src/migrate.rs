//! Worker pool and migration driver.
//!
//! Loads the status store, spawns the workers, hands every incomplete plan
//! entry through the transfer engine with a bounded retry budget, and on a
//! clean run optionally deletes the source data and the status store.

use crossbeam::channel;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use crate::bucket_status::FileTransferState;
use crate::console_output::{MigStats, ProgressInfo};
use crate::error::{MigError, MigResult};
use crate::input::{EndpointConfig, Input, StoreKind};
use crate::posix_store::PosixStore;
use crate::status_store::StatusStore;
use crate::store::{EntryType, StoreClient};
use crate::synced_dir::SyncedDirContext;
use crate::transfer::{transfer_object, TransferCtx};
use crate::transfer_info::TransferInfo;
use crate::viewer;
use crate::viewer::Viewer;

fn create_client(endpoint: &EndpointConfig) -> Box<dyn StoreClient> {
    match endpoint.kind {
        StoreKind::Posix => Box::new(PosixStore::new(Path::new(&endpoint.root))),
    }
}

fn create_shared_client(endpoint: &EndpointConfig) -> Arc<dyn StoreClient> {
    match endpoint.kind {
        StoreKind::Posix => Arc::new(PosixStore::new(Path::new(&endpoint.root))),
    }
}

/// Pull incomplete entries from the status store until it reports
/// exhaustion; returns the number of permanent failures.
fn worker_loop(ctx: &TransferCtx<'_>, max_retries: u32) -> MigResult<u64> {
    let mut failures = 0;
    loop {
        let mut state = match ctx.status.next_incomplete_entry()? {
            Some(state) => state,
            None => break,
        };
        ctx.tinfo.begin(&state.obj_path, state.size, state.offset)?;
        if !migrate_object(ctx, &mut state, max_retries) {
            failures += 1;
        }
        ctx.tinfo.clear()?;
        state.release();
    }
    debug!("worker done, {} permanent failure(s)", failures);
    Ok(failures)
}

/// One object with its retry budget.  Returns false once the budget is
/// exhausted; a permanent failure never aborts the sibling workers.
fn migrate_object(ctx: &TransferCtx<'_>, state: &mut FileTransferState, max_retries: u32) -> bool {
    debug!(
        "[Migrating] starting migration of file {} ({} -> {})",
        state.obj_path, state.src_path, state.dst_path
    );
    let mut attempts = 0;
    loop {
        match transfer_object(ctx, state) {
            Ok(()) => match ctx.status.entry_complete(state) {
                Ok(()) => {
                    info!("[Migrating] file {} migrated.", state.obj_path);
                    return true;
                }
                Err(e) => {
                    // not marked done; the next run resumes this entry
                    error!(
                        "[Migrating] could not finalize entry {}: {}",
                        state.obj_path, e
                    );
                    return false;
                }
            },
            Err(e) => {
                attempts += 1;
                if attempts < max_retries {
                    error!(
                        "[Migrating] error ({}), retrying migration of file {}.",
                        e, state.obj_path
                    );
                } else {
                    error!("[Migrating] could not migrate file {}: {}", state.obj_path, e);
                    return false;
                }
            }
        }
    }
}

pub struct Migrator {
    input: Input,
    progress_info: Box<dyn ProgressInfo + Send + Sync>,
    serve_viewer: bool,
}

impl Migrator {
    pub fn new(input: Input, progress_info: Box<dyn ProgressInfo + Send + Sync>) -> Migrator {
        Migrator { input, progress_info, serve_viewer: true }
    }

    /// skip the publication socket entirely
    pub fn without_viewer(mut self) -> Migrator {
        self.serve_viewer = false;
        self
    }

    /// One client pair per worker so the underlying connection pools never
    /// interfere with each other.
    fn create_contexts(&self) -> Vec<(Box<dyn StoreClient>, Box<dyn StoreClient>)> {
        (0..self.input.num_threads)
            .map(|_| (create_client(&self.input.source), create_client(&self.input.destination)))
            .collect()
    }

    /// Run the migration; returns the number of permanently failed objects.
    pub fn run(&self) -> MigResult<u64> {
        let session_start = Instant::now();
        info!(
            "[Migrating] session started at {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        );

        // the publication socket comes up before anything network-heavy so
        // a viewer can attach while the plans are still being built
        let viewer_socket = if self.serve_viewer {
            match viewer::setup_publication_socket(env!("CARGO_PKG_NAME")) {
                Ok(socket) => Some(socket),
                Err(e) => {
                    warn!("could not set up the viewer socket: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let status_client = create_shared_client(&self.input.status);
        let src_client = create_client(&self.input.source);
        let dst_client = create_client(&self.input.destination);

        let status = match StatusStore::load(status_client, &*src_client, &*dst_client, &self.input)
        {
            Ok(status) => Arc::new(status),
            Err(e) => {
                if let Some(socket) = &viewer_socket {
                    viewer::teardown_publication_socket(socket);
                }
                return Err(e);
            }
        };

        let (_, done_bytes_before, _, done_objects_before) = status.digest().snapshot()?;

        self.progress_info.start(&self.input.source.root, &self.input.destination.root);

        let tinfos: Vec<Arc<TransferInfo>> = (0..self.input.num_threads)
            .map(|_| Arc::new(TransferInfo::new()))
            .collect();
        let synced_dirs = Arc::new(SyncedDirContext::new());

        let viewer = Arc::new(Viewer::new());
        let viewer_thread = viewer_socket.map(|socket| {
            let viewer = viewer.clone();
            let status = status.clone();
            let tinfos = tinfos.clone();
            std::thread::spawn(move || {
                if let Err(e) = viewer.run(&socket.listener, &status, &tinfos) {
                    warn!("viewer thread stopped: {}", e);
                }
                socket
            })
        });

        let contexts = self.create_contexts();
        let (send_result, recv_result) = channel::unbounded::<MigResult<u64>>();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.input.num_threads as usize)
            .build()
            .map_err(|e| {
                MigError::CrossbeamChannelError(format!("could not build worker pool: {}", e))
            })?;

        let block_size = self.input.block_size;
        let create_dirs = self.input.create_directories;
        let max_retries = self.input.max_retries;

        pool.install(|| {
            rayon::scope(|spawner| {
                for (tinfo, (src, dst)) in tinfos.iter().zip(contexts.into_iter()) {
                    let sender = send_result.clone();
                    let status = status.clone();
                    let synced_dirs = synced_dirs.clone();
                    let tinfo = tinfo.clone();
                    spawner.spawn(move |_| {
                        let ctx = TransferCtx {
                            src: &*src,
                            dst: &*dst,
                            status: &status,
                            synced_dirs: &synced_dirs,
                            tinfo: &tinfo,
                            block_size,
                            create_dirs,
                        };
                        let result = worker_loop(&ctx, max_retries);
                        if sender.send(result).is_err() {
                            error!("unable to report worker result");
                        }
                    });
                }
            });
        });
        drop(send_result);

        let mut failures = 0;
        let mut fatal = None;
        for result in recv_result.iter() {
            match result {
                Ok(count) => failures += count,
                Err(e) => {
                    error!("[Migrating] worker aborted: {}", e);
                    fatal = Some(e);
                }
            }
        }

        viewer.stop();
        if let Some(handle) = viewer_thread {
            match handle.join() {
                Ok(socket) => viewer::teardown_publication_socket(&socket),
                Err(_) => warn!("viewer thread panicked"),
            }
        }

        if let Some(e) = fatal {
            return Err(e);
        }

        // leave the stored digest in sync with the final counters
        status.digest().upload(status.client())?;

        if failures == 0 && self.input.delete_source {
            self.delete_source(&status, &*src_client)?;
        }

        let (bytes, done_bytes, objects, done_objects) = status.digest().snapshot()?;
        let seconds = session_start.elapsed().as_secs();
        let stats = MigStats {
            objects,
            done_objects,
            bytes,
            done_bytes,
            session_objects: done_objects - done_objects_before,
            session_bytes: done_bytes - done_bytes_before,
            failures,
            seconds,
        };
        info!(
            "End of data migration. During this session: \
             transferred {}/{} objects, {}/{} bytes, in {}s",
            stats.session_objects, objects, stats.session_bytes, bytes, seconds
        );
        self.progress_info.end(&stats);

        Ok(failures)
    }

    /// After a clean migration, unlink every source object and drop the
    /// status store.  Directories go last, deepest first.
    fn delete_source(&self, status: &StatusStore, src_client: &dyn StoreClient) -> MigResult<()> {
        info!("[Deleting Source] starting deletion of the migration's source...");

        status.reset_iteration()?;
        let mut files = Vec::new();
        let mut dirs = Vec::new();
        while let Some(state) = status.next_entry()? {
            match state.entry_type {
                EntryType::Directory => dirs.push(state.src_path.clone()),
                _ => files.push(state.src_path.clone()),
            }
            state.release();
        }

        for path in &files {
            if let Err(e) = src_client.unlink(path) {
                warn!("[Deleting Source] could not delete the file {}: {}", path, e);
            }
        }
        dirs.sort_by(|a, b| {
            let depth_a = a.matches('/').count();
            let depth_b = b.matches('/').count();
            depth_b.cmp(&depth_a)
        });
        for path in &dirs {
            if let Err(e) = src_client.rmdir(path) {
                warn!("[Deleting Source] could not delete the directory {}: {}", path, e);
            }
        }

        status.delete()?;
        info!("[Deleting Source] deletion of the migration's source done.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::BucketMapping;
    use crate::store::{Attrs, DirEntry, FileStream, StoreError};
    use nix::fcntl::OFlag;
    use serde_json::Value;
    use std::fs;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::{tempdir, TempDir};

    struct SilentProgress;
    impl ProgressInfo for SilentProgress {}

    const CHUNK: u64 = 65536;
    const BIG: usize = 1_048_576;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    struct Roots {
        _src: TempDir,
        _dst: TempDir,
        _status: TempDir,
        src: std::path::PathBuf,
        dst: std::path::PathBuf,
        status: std::path::PathBuf,
    }

    fn roots() -> Roots {
        let src = tempdir().expect("src tempdir");
        let dst = tempdir().expect("dst tempdir");
        let status = tempdir().expect("status tempdir");
        Roots {
            src: src.path().to_path_buf(),
            dst: dst.path().to_path_buf(),
            status: status.path().to_path_buf(),
            _src: src,
            _dst: dst,
            _status: status,
        }
    }

    fn endpoint(root: &Path, host: Option<&str>) -> EndpointConfig {
        EndpointConfig {
            kind: StoreKind::Posix,
            root: root.to_string_lossy().into_owned(),
            host: host.map(|h| h.to_string()),
        }
    }

    fn make_input(roots: &Roots, buckets: Vec<BucketMapping>) -> Input {
        Input {
            source: endpoint(&roots.src, Some("src.test")),
            destination: endpoint(&roots.dst, Some("dst.test")),
            status: endpoint(&roots.status, None),
            buckets,
            num_threads: 2,
            block_size: CHUNK,
            max_retries: 3,
            digest_refresh: 50,
            delete_source: false,
            create_directories: true,
            force_resume: false,
        }
    }

    fn mapping(src: &str, dst: &str) -> BucketMapping {
        BucketMapping { src: src.to_string(), dst: dst.to_string() }
    }

    fn write_source_tree(src_root: &Path, bucket: &str) {
        let bkt = src_root.join(bucket);
        fs::create_dir(&bkt).expect("mkdir bucket");
        fs::write(bkt.join("a.txt"), b"0123456789").expect("write a.txt");
        fs::create_dir(bkt.join("b")).expect("mkdir b");
        fs::write(bkt.join("b/c.txt"), pattern(BIG)).expect("write c.txt");
    }

    fn read_digest(status_root: &Path) -> Value {
        let path = status_root.join("cloudmig.src.test.to.dst.test/.cloudmig");
        serde_json::from_slice(&fs::read(path).expect("read digest")).expect("parse digest")
    }

    #[test]
    fn fresh_migration_three_files() {
        let roots = roots();
        write_source_tree(&roots.src, "srcbkt");
        let input = make_input(&roots, vec![mapping("srcbkt", "dstbkt")]);

        let failures = Migrator::new(input, Box::new(SilentProgress))
            .without_viewer()
            .run()
            .expect("run");
        assert_eq!(failures, 0);

        assert_eq!(fs::read(roots.dst.join("dstbkt/a.txt")).expect("a.txt"), b"0123456789");
        assert!(roots.dst.join("dstbkt/b").is_dir());
        assert_eq!(fs::read(roots.dst.join("dstbkt/b/c.txt")).expect("c.txt"), pattern(BIG));

        let digest = read_digest(&roots.status);
        assert_eq!(digest["bytes"], 1_048_586);
        assert_eq!(digest["done_bytes"], 1_048_586);
        assert_eq!(digest["objects"], 3);
        assert_eq!(digest["done_objects"], 3);
    }

    #[test]
    fn resume_after_crash_retransmits_nothing() {
        let roots = roots();
        write_source_tree(&roots.src, "srcbkt");
        let input = make_input(&roots, vec![mapping("srcbkt", "dstbkt")]);

        // First phase: build the store, then transfer seven chunks of the
        // big file by hand and stop, as a crashed worker would.
        {
            let status_client: Arc<dyn StoreClient> = Arc::new(PosixStore::new(&roots.status));
            let src_client = PosixStore::new(&roots.src);
            let dst_client = PosixStore::new(&roots.dst);
            let status = StatusStore::load(status_client, &src_client, &dst_client, &input)
                .expect("load");

            let mut state = loop {
                let state = status
                    .next_incomplete_entry()
                    .expect("next")
                    .expect("entry");
                if state.obj_path.ends_with("c.txt") {
                    break state;
                }
                state.release();
            };

            fs::create_dir_all(roots.dst.join("dstbkt/b")).expect("mkdir dst dirs");
            let mut src_stream = src_client
                .open(&state.src_path, OFlag::O_RDONLY, None)
                .expect("open src");
            let mut dst_stream = dst_client
                .open(&state.dst_path, OFlag::O_WRONLY | OFlag::O_CREAT, None)
                .expect("open dst");
            for _ in 0..7 {
                let (chunk, rstatus) = src_stream.stream_get(CHUNK).expect("get");
                let wstatus = dst_stream.stream_put(&chunk).expect("put");
                state.rstatus = Some(rstatus);
                state.wstatus = Some(wstatus);
                state.offset += chunk.len() as u64;
                status.entry_update(&state, chunk.len() as u64).expect("update");
            }
            assert_eq!(state.offset, 7 * CHUNK);
            // the periodic refresh fired before the crash
            status.digest().upload(status.client()).expect("digest refresh");
            // no entry_complete, no release: this is the crash
        }

        // Poison the already-transferred region; a resumed run must never
        // touch it again.
        let dst_file = roots.dst.join("dstbkt/b/c.txt");
        {
            use std::io::{Seek, SeekFrom, Write};
            let mut file = fs::OpenOptions::new().write(true).open(&dst_file).expect("open");
            file.seek(SeekFrom::Start(0)).expect("seek");
            file.write_all(&vec![0xAA; (7 * CHUNK) as usize]).expect("poison");
        }

        // Second phase: a normal run picks up the checkpoint.
        let failures = Migrator::new(input, Box::new(SilentProgress))
            .without_viewer()
            .run()
            .expect("rerun");
        assert_eq!(failures, 0);

        let data = fs::read(&dst_file).expect("read c.txt");
        assert_eq!(data.len(), BIG);
        let boundary = (7 * CHUNK) as usize;
        assert!(data[..boundary].iter().all(|&b| b == 0xAA), "head was rewritten");
        assert_eq!(&data[boundary..], &pattern(BIG)[boundary..], "tail mismatch");

        let digest = read_digest(&roots.status);
        assert_eq!(digest["done_bytes"], 1_048_586);
        assert_eq!(digest["done_objects"], 3);

        // the per-entry checkpoint is gone once the entry completed
        let plan_dir = roots
            .status
            .join("cloudmig.src.test.to.dst.test")
            .join(crate::store::plan_filename("srcbkt").trim_end_matches(".json"));
        assert_eq!(fs::read_dir(plan_dir).expect("plan dir").count(), 0);
    }

    #[test]
    fn rerun_is_idempotent() {
        let roots = roots();
        write_source_tree(&roots.src, "srcbkt");
        let input = make_input(&roots, vec![mapping("srcbkt", "dstbkt")]);

        let first = Migrator::new(input.clone(), Box::new(SilentProgress))
            .without_viewer()
            .run()
            .expect("first run");
        assert_eq!(first, 0);
        let digest_after_first = read_digest(&roots.status);

        let second = Migrator::new(input, Box::new(SilentProgress))
            .without_viewer()
            .run()
            .expect("second run");
        assert_eq!(second, 0);

        // zero payload moved: every digest counter is unchanged
        assert_eq!(read_digest(&roots.status), digest_after_first);
        assert_eq!(fs::read(roots.dst.join("dstbkt/b/c.txt")).expect("c.txt"), pattern(BIG));
    }

    #[test]
    fn plan_drift_resumes_old_and_creates_new() {
        let roots = roots();
        write_source_tree(&roots.src, "old-src");

        // A previous invocation planned old-src but never migrated it.
        {
            let old_input = make_input(&roots, vec![mapping("old-src", "old-dst")]);
            let status_client: Arc<dyn StoreClient> = Arc::new(PosixStore::new(&roots.status));
            let src_client = PosixStore::new(&roots.src);
            let dst_client = PosixStore::new(&roots.dst);
            StatusStore::load(status_client, &src_client, &dst_client, &old_input).expect("plan");
        }

        // The current configuration only names new-src.
        fs::create_dir(roots.src.join("new-src")).expect("mkdir");
        fs::write(roots.src.join("new-src/n.txt"), b"new data").expect("write");
        let input = make_input(&roots, vec![mapping("new-src", "new-dst")]);

        let failures = Migrator::new(input, Box::new(SilentProgress))
            .without_viewer()
            .run()
            .expect("run");
        assert_eq!(failures, 0);

        // both the drifted plan and the configured one were migrated
        assert_eq!(fs::read(roots.dst.join("old-dst/a.txt")).expect("old a.txt"), b"0123456789");
        assert_eq!(fs::read(roots.dst.join("old-dst/b/c.txt")).expect("old c.txt"), pattern(BIG));
        assert_eq!(fs::read(roots.dst.join("new-dst/n.txt")).expect("new n.txt"), b"new data");

        let digest = read_digest(&roots.status);
        assert_eq!(digest["objects"], 4);
        assert_eq!(digest["done_objects"], 4);
        assert_eq!(digest["bytes"], 1_048_586 + 8);
    }

    #[test]
    fn delete_source_empties_bucket_and_removes_store() {
        let roots = roots();
        write_source_tree(&roots.src, "srcbkt");
        let mut input = make_input(&roots, vec![mapping("srcbkt", "dstbkt")]);
        input.delete_source = true;

        let failures = Migrator::new(input, Box::new(SilentProgress))
            .without_viewer()
            .run()
            .expect("run");
        assert_eq!(failures, 0);

        let leftover: Vec<_> = fs::read_dir(roots.src.join("srcbkt"))
            .expect("src bucket")
            .collect();
        assert!(leftover.is_empty(), "source bucket not emptied: {:?}", leftover);
        assert!(!roots.status.join("cloudmig.src.test.to.dst.test").exists());
        // the destination is untouched
        assert_eq!(fs::read(roots.dst.join("dstbkt/b/c.txt")).expect("c.txt"), pattern(BIG));
    }

    /// wrapper that fails every fget of a poisoned path, counting attempts
    struct FlakyStore {
        inner: PosixStore,
        fget_attempts: AtomicU32,
    }

    impl StoreClient for FlakyStore {
        fn make_bucket(&self, name: &str) -> Result<(), StoreError> {
            self.inner.make_bucket(name)
        }
        fn delete_bucket(&self, name: &str) -> Result<(), StoreError> {
            self.inner.delete_bucket(name)
        }
        fn list_all_buckets(&self) -> Result<Vec<String>, StoreError> {
            self.inner.list_all_buckets()
        }
        fn mkdir(&self, path: &str, attrs: &Attrs) -> Result<(), StoreError> {
            self.inner.mkdir(path, attrs)
        }
        fn rmdir(&self, path: &str) -> Result<(), StoreError> {
            self.inner.rmdir(path)
        }
        fn opendir(
            &self,
            path: &str,
        ) -> Result<Box<dyn Iterator<Item = Result<DirEntry, StoreError>> + Send>, StoreError>
        {
            self.inner.opendir(path)
        }
        fn getattr(&self, path: &str) -> Result<Attrs, StoreError> {
            self.inner.getattr(path)
        }
        fn readlink(&self, path: &str) -> Result<String, StoreError> {
            self.inner.readlink(path)
        }
        fn symlink(&self, target: &str, path: &str) -> Result<(), StoreError> {
            self.inner.symlink(target, path)
        }
        fn fget(&self, path: &str) -> Result<(Vec<u8>, Attrs), StoreError> {
            if path.contains("poison") {
                self.fget_attempts.fetch_add(1, Ordering::SeqCst);
                return Err(StoreError::other("injected backend failure"));
            }
            self.inner.fget(path)
        }
        fn fput(&self, path: &str, data: &[u8], attrs: &Attrs) -> Result<(), StoreError> {
            self.inner.fput(path, data, attrs)
        }
        fn unlink(&self, path: &str) -> Result<(), StoreError> {
            self.inner.unlink(path)
        }
        fn open(
            &self,
            path: &str,
            flags: OFlag,
            resume: Option<&Value>,
        ) -> Result<Box<dyn FileStream>, StoreError> {
            self.inner.open(path, flags, resume)
        }
    }

    #[test]
    fn failing_object_gets_three_attempts_and_siblings_survive() {
        let roots = roots();
        let bkt = roots.src.join("srcbkt");
        fs::create_dir(&bkt).expect("mkdir");
        fs::write(bkt.join("ok.txt"), b"fine").expect("write");
        fs::write(bkt.join("poison.txt"), b"doomed").expect("write");
        let input = make_input(&roots, vec![mapping("srcbkt", "dstbkt")]);

        let status_client: Arc<dyn StoreClient> = Arc::new(PosixStore::new(&roots.status));
        let src_client = PosixStore::new(&roots.src);
        let dst_client = PosixStore::new(&roots.dst);
        let status = Arc::new(
            StatusStore::load(status_client, &src_client, &dst_client, &input).expect("load"),
        );

        let flaky = FlakyStore {
            inner: PosixStore::new(&roots.src),
            fget_attempts: AtomicU32::new(0),
        };
        let dst = PosixStore::new(&roots.dst);
        let tinfo = TransferInfo::new();
        let synced_dirs = SyncedDirContext::new();
        let ctx = TransferCtx {
            src: &flaky,
            dst: &dst,
            status: &status,
            synced_dirs: &synced_dirs,
            tinfo: &tinfo,
            block_size: CHUNK,
            create_dirs: true,
        };

        let failures = worker_loop(&ctx, 3).expect("worker loop");
        assert_eq!(failures, 1);
        assert_eq!(flaky.fget_attempts.load(Ordering::SeqCst), 3);

        // the healthy sibling still went through
        assert_eq!(fs::read(roots.dst.join("dstbkt/ok.txt")).expect("ok.txt"), b"fine");
        let (_, _, _, done_objects) = status.digest().snapshot().expect("snapshot");
        assert_eq!(done_objects, 1);
    }

    #[test]
    fn symlinks_are_replicated() {
        let roots = roots();
        let bkt = roots.src.join("srcbkt");
        fs::create_dir(&bkt).expect("mkdir");
        fs::write(bkt.join("target.txt"), b"pointed at").expect("write");
        std::os::unix::fs::symlink("target.txt", bkt.join("link")).expect("symlink");
        let input = make_input(&roots, vec![mapping("srcbkt", "dstbkt")]);

        let failures = Migrator::new(input, Box::new(SilentProgress))
            .without_viewer()
            .run()
            .expect("run");
        assert_eq!(failures, 0);

        let link = roots.dst.join("dstbkt/link");
        assert_eq!(
            fs::read_link(&link).expect("read_link").to_string_lossy(),
            "target.txt"
        );
        assert_eq!(fs::read(&link).expect("follow link"), b"pointed at");
    }
}
