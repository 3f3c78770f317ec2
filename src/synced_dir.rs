//! Synchronized directory creation.
//!
//! Some backends return transient server errors when two workers issue a
//! create-directory call for the same path at the same time.  This module
//! serializes those calls: for any destination path, exactly one registered
//! worker is responsible for the mkdir, and every other worker waits for the
//! outcome it reports.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use crate::error::{MigError, MigResult};

struct SyncState {
    refs: u32,
    done: bool,
    exists: bool,
}

pub struct SyncedDir {
    path: String,
    state: Mutex<SyncState>,
    done_cond: Condvar,
}

impl SyncedDir {
    fn new(path: &str) -> SyncedDir {
        SyncedDir {
            path: path.to_string(),
            state: Mutex::new(SyncState { refs: 0, done: false, exists: false }),
            done_cond: Condvar::new(),
        }
    }

    /// block until the responsible worker reports, then return its outcome
    pub fn wait(&self) -> MigResult<bool> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| MigError::LockError("synced dir state lock poisoned".to_string()))?;
        while !state.done {
            state = self
                .done_cond
                .wait(state)
                .map_err(|_| MigError::LockError("synced dir state lock poisoned".to_string()))?;
        }
        Ok(state.exists)
    }
}

#[derive(Default)]
pub struct SyncedDirContext {
    dirs: Mutex<HashMap<String, Arc<SyncedDir>>>,
}

impl SyncedDirContext {
    pub fn new() -> SyncedDirContext {
        SyncedDirContext { dirs: Mutex::new(HashMap::new()) }
    }

    /// Register interest in a path.  The returned flag is true iff the
    /// caller created the node and is therefore responsible for performing
    /// the actual mkdir and reporting its outcome.
    pub fn register(&self, path: &str) -> MigResult<(Arc<SyncedDir>, bool)> {
        let mut dirs = self
            .dirs
            .lock()
            .map_err(|_| MigError::LockError("synced dir list lock poisoned".to_string()))?;
        if let Some(dir) = dirs.get(path) {
            let mut state = dir
                .state
                .lock()
                .map_err(|_| MigError::LockError("synced dir state lock poisoned".to_string()))?;
            state.refs += 1;
            return Ok((dir.clone(), false));
        }
        let dir = Arc::new(SyncedDir::new(path));
        {
            let mut state = dir
                .state
                .lock()
                .map_err(|_| MigError::LockError("synced dir state lock poisoned".to_string()))?;
            state.refs = 1;
        }
        dirs.insert(path.to_string(), dir.clone());
        Ok((dir, true))
    }

    /// Drop a registration.  The responsible caller also publishes whether
    /// the directory now exists; the node is unlinked once the last
    /// registration is gone so a later attempt starts fresh.
    pub fn unregister(&self, dir: &Arc<SyncedDir>, is_responsible: bool, exists: bool) -> MigResult<()> {
        let mut dirs = self
            .dirs
            .lock()
            .map_err(|_| MigError::LockError("synced dir list lock poisoned".to_string()))?;
        let remove = {
            let mut state = dir
                .state
                .lock()
                .map_err(|_| MigError::LockError("synced dir state lock poisoned".to_string()))?;
            if is_responsible {
                state.done = true;
                state.exists = exists;
                notify_waiters(dir, &state);
            }
            state.refs -= 1;
            state.refs == 0
        };
        if remove {
            dirs.remove(&dir.path);
        }
        Ok(())
    }
}

fn notify_waiters(dir: &SyncedDir, state: &SyncState) {
    if state.refs > 1 {
        dir.done_cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn single_registrant_is_responsible() {
        let ctx = SyncedDirContext::new();
        let (dir, responsible) = ctx.register("x/y").expect("register");
        assert!(responsible);
        ctx.unregister(&dir, true, true).expect("unregister");
        // the node was freed, a fresh register is responsible again
        let (dir2, responsible2) = ctx.register("x/y").expect("register again");
        assert!(responsible2);
        ctx.unregister(&dir2, true, false).expect("unregister");
    }

    #[test]
    fn second_registrant_waits_for_outcome() {
        let ctx = Arc::new(SyncedDirContext::new());
        let (dir, responsible) = ctx.register("a/b").expect("register");
        assert!(responsible);

        let (registered_tx, registered_rx) = std::sync::mpsc::channel();
        let waiter_ctx = ctx.clone();
        let waiter = thread::spawn(move || {
            let (dir, responsible) = waiter_ctx.register("a/b").expect("register");
            assert!(!responsible);
            registered_tx.send(()).expect("send");
            let exists = dir.wait().expect("wait");
            waiter_ctx.unregister(&dir, false, exists).expect("unregister");
            exists
        });

        // only report the outcome once the waiter is registered
        registered_rx.recv().expect("recv");
        ctx.unregister(&dir, true, true).expect("unregister");
        assert!(waiter.join().expect("join"));
    }

    #[test]
    fn at_most_one_responsible_under_contention() {
        let ctx = Arc::new(SyncedDirContext::new());
        let responsible_count = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let mut handles = vec![];
        for _ in 0..8 {
            let ctx = ctx.clone();
            let count = responsible_count.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                let (dir, responsible) = ctx.register("contended").expect("register");
                // everyone registers before anyone reports, so one node
                // serves all eight registrations
                barrier.wait();
                if responsible {
                    count.fetch_add(1, Ordering::SeqCst);
                    ctx.unregister(&dir, true, true).expect("unregister");
                } else {
                    let exists = dir.wait().expect("wait");
                    assert!(exists);
                    ctx.unregister(&dir, false, exists).expect("unregister");
                }
            }));
        }
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(responsible_count.load(Ordering::SeqCst), 1);
    }
}
