//! Per-worker progress record, read by the viewer thread.

use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use crate::error::{MigError, MigResult};
use crate::rate::RateLedger;

#[derive(Default)]
struct TransferProgress {
    fpath: Option<String>,
    fsize: u64,
    fdone: u64,
    ledger: RateLedger,
}

/// Snapshot handed to the viewer, ledger already trimmed to the ETA window.
pub struct ProgressSnapshot {
    pub fpath: Option<String>,
    pub fsize: u64,
    pub fdone: u64,
    pub byterate: u64,
}

#[derive(Default)]
pub struct TransferInfo {
    inner: Mutex<TransferProgress>,
}

impl TransferInfo {
    pub fn new() -> TransferInfo {
        TransferInfo::default()
    }

    fn lock(&self) -> MigResult<MutexGuard<'_, TransferProgress>> {
        self.inner
            .lock()
            .map_err(|_| MigError::LockError("transfer info lock poisoned".to_string()))
    }

    /// a worker selected a new object
    pub fn begin(&self, path: &str, size: u64, done: u64) -> MigResult<()> {
        let mut progress = self.lock()?;
        progress.fpath = Some(path.to_string());
        progress.fsize = size;
        progress.fdone = done;
        Ok(())
    }

    /// account transferred bytes and feed the rate ledger
    pub fn add_bytes(&self, len: u64) -> MigResult<()> {
        let mut progress = self.lock()?;
        progress.fdone += len;
        progress.ledger.record(SystemTime::now(), len);
        Ok(())
    }

    /// the worker is done with its current object
    pub fn clear(&self) -> MigResult<()> {
        let mut progress = self.lock()?;
        progress.fpath = None;
        progress.fsize = 0;
        progress.fdone = 0;
        progress.ledger.clear();
        Ok(())
    }

    pub fn snapshot_trimmed(&self, limit: SystemTime) -> MigResult<ProgressSnapshot> {
        let mut progress = self.lock()?;
        progress.ledger.trim(limit);
        Ok(ProgressSnapshot {
            fpath: progress.fpath.clone(),
            fsize: progress.fsize,
            fdone: progress.fdone,
            byterate: progress.ledger.rate(),
        })
    }
}

#[test]
fn test_progress_accounting() {
    let info = TransferInfo::new();
    info.begin("a/b", 100, 25).expect("begin");
    info.add_bytes(25).expect("add");
    let snapshot = info.snapshot_trimmed(SystemTime::UNIX_EPOCH).expect("snapshot");
    assert_eq!(snapshot.fpath.as_ref().map(String::as_str), Some("a/b"));
    assert_eq!(snapshot.fdone, 50);
    info.clear().expect("clear");
    let snapshot = info.snapshot_trimmed(SystemTime::UNIX_EPOCH).expect("snapshot");
    assert_eq!(snapshot.fpath, None);
    assert_eq!(snapshot.fdone, 0);
}
