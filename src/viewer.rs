//! Viewer protocol server.
//!
//! A Unix-domain stream socket under `/tmp/<progname>/<pid>/` accepts at
//! most one attached viewer.  A dedicated thread wakes at most four times a
//! second (or on explicit notify), snapshots the digest and every worker's
//! progress record, and emits one GLOBAL frame followed by one THREAD frame
//! per worker.  Integers go out in host byte order; this is a local socket.

use lazy_static::lazy_static;
use std::fs;
use std::io;
use std::io::Write;
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, SystemTime};

use crate::error::{MigError, MigResult};
use crate::rate::ETA_TIMEFRAME;
use crate::status_store::StatusStore;
use crate::transfer_info::TransferInfo;

pub const FRAME_GLOBAL: u8 = 0;
pub const FRAME_THREAD: u8 = 1;

pub struct ViewerSocket {
    pub listener: UnixListener,
    pub sockfile: PathBuf,
    pub piddir: PathBuf,
    pub basedir: PathBuf,
}

lazy_static! {
    // paths the SIGINT handler must remove before exiting
    static ref REGISTERED_PATHS: Mutex<Option<(PathBuf, PathBuf, PathBuf)>> = Mutex::new(None);
}

/// Remove whatever socket paths are currently registered.  Called from the
/// signal handler, so it must not block.
pub fn cleanup_registered() {
    if let Ok(mut registered) = REGISTERED_PATHS.try_lock() {
        if let Some((sockfile, piddir, basedir)) = registered.take() {
            cleanup_socket_paths(&sockfile, &piddir, &basedir);
        }
    }
}

/// Create `/tmp/<progname>/<pid>/display.sock` and listen on it.
pub fn setup_publication_socket(progname: &str) -> MigResult<ViewerSocket> {
    let basedir = PathBuf::from("/tmp").join(progname);
    if let Err(e) = fs::create_dir(&basedir) {
        if e.kind() != io::ErrorKind::AlreadyExists {
            error!("could not create {:?} directory: {}", basedir, e);
            return Err(MigError::IoError(e));
        }
    }
    let piddir = basedir.join(std::process::id().to_string());
    fs::create_dir(&piddir)?;
    let sockfile = piddir.join("display.sock");
    let listener = UnixListener::bind(&sockfile)?;
    listener.set_nonblocking(true)?;
    debug!("publication socket bound at {:?}", sockfile);
    if let Ok(mut registered) = REGISTERED_PATHS.lock() {
        *registered = Some((sockfile.clone(), piddir.clone(), basedir.clone()));
    }
    Ok(ViewerSocket { listener, sockfile, piddir, basedir })
}

/// Best-effort removal of the socket and its directories.  The base
/// directory is shared between instances, so a failure there is expected.
pub fn teardown_publication_socket(socket: &ViewerSocket) {
    if let Ok(mut registered) = REGISTERED_PATHS.lock() {
        *registered = None;
    }
    cleanup_socket_paths(&socket.sockfile, &socket.piddir, &socket.basedir);
}

pub fn cleanup_socket_paths(sockfile: &PathBuf, piddir: &PathBuf, basedir: &PathBuf) {
    let _ = fs::remove_file(sockfile);
    let _ = fs::remove_dir(piddir);
    let _ = fs::remove_dir(basedir);
}

fn saturate(value: u64) -> u32 {
    if value > u64::from(u32::max_value()) {
        u32::max_value()
    } else {
        value as u32
    }
}

fn encode_global_frame(total_sz: u64, done_sz: u64, nb_objects: u64, done_objects: u64) -> Vec<u8> {
    let mut frame = Vec::with_capacity(33);
    frame.push(FRAME_GLOBAL);
    frame.extend_from_slice(&total_sz.to_ne_bytes());
    frame.extend_from_slice(&done_sz.to_ne_bytes());
    frame.extend_from_slice(&nb_objects.to_ne_bytes());
    frame.extend_from_slice(&done_objects.to_ne_bytes());
    frame
}

fn encode_thread_frame(id: u32, fsize: u64, fdone: u64, byterate: u64, name: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(21 + name.len());
    frame.push(FRAME_THREAD);
    frame.extend_from_slice(&id.to_ne_bytes());
    frame.extend_from_slice(&saturate(fsize).to_ne_bytes());
    frame.extend_from_slice(&saturate(fdone).to_ne_bytes());
    frame.extend_from_slice(&saturate(byterate).to_ne_bytes());
    frame.extend_from_slice(&(name.len() as u32).to_ne_bytes());
    frame.extend_from_slice(name.as_bytes());
    frame
}

pub struct Viewer {
    stop: Mutex<bool>,
    cond: Condvar,
}

impl Default for Viewer {
    fn default() -> Viewer {
        Viewer::new()
    }
}

impl Viewer {
    pub fn new() -> Viewer {
        Viewer { stop: Mutex::new(false), cond: Condvar::new() }
    }

    pub fn stop(&self) {
        if let Ok(mut stop) = self.stop.lock() {
            *stop = true;
            self.cond.notify_all();
        }
    }

    /// wake the update loop before its next tick
    pub fn notify(&self) {
        self.cond.notify_all();
    }

    /// Update loop; returns when `stop` is called.  A send failure only
    /// detaches the viewer, the migration is not affected.
    pub fn run(
        &self,
        listener: &UnixListener,
        status: &StatusStore,
        tinfos: &[Arc<TransferInfo>],
    ) -> MigResult<()> {
        let mut client: Option<UnixStream> = None;
        loop {
            {
                let stop = self
                    .stop
                    .lock()
                    .map_err(|_| MigError::LockError("viewer lock poisoned".to_string()))?;
                if *stop {
                    break;
                }
                let (stop, _) = self
                    .cond
                    .wait_timeout(stop, Duration::from_millis(250))
                    .map_err(|_| MigError::LockError("viewer lock poisoned".to_string()))?;
                if *stop {
                    break;
                }
            }

            self.accept_clients(listener, &mut client);

            if client.is_some() {
                let limit = SystemTime::now() - ETA_TIMEFRAME;
                let sent = match client.as_mut() {
                    Some(stream) => self.send_update(stream, status, tinfos, limit),
                    None => Ok(()),
                };
                if sent.is_err() {
                    debug!("viewer detached");
                    client = None;
                }
            }
        }
        Ok(())
    }

    fn accept_clients(&self, listener: &UnixListener, client: &mut Option<UnixStream>) {
        loop {
            match listener.accept() {
                Ok((stream, _)) => {
                    // one attached viewer only
                    if client.is_some() {
                        let _ = stream.shutdown(Shutdown::Both);
                    } else {
                        debug!("viewer attached");
                        *client = Some(stream);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("could not accept viewer connection: {}", e);
                    break;
                }
            }
        }
    }

    fn send_update(
        &self,
        stream: &mut UnixStream,
        status: &StatusStore,
        tinfos: &[Arc<TransferInfo>],
        limit: SystemTime,
    ) -> MigResult<()> {
        let (bytes, done_bytes, objects, done_objects) = status.digest().snapshot()?;
        stream.write_all(&encode_global_frame(bytes, done_bytes, objects, done_objects))?;

        for (id, tinfo) in tinfos.iter().enumerate() {
            let snapshot = tinfo.snapshot_trimmed(limit)?;
            let name = snapshot.fpath.unwrap_or_default();
            stream.write_all(&encode_thread_frame(
                id as u32,
                snapshot.fsize,
                snapshot.fdone,
                snapshot.byterate,
                &name,
            ))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_frame_layout() {
        let frame = encode_global_frame(1, 2, 3, 4);
        assert_eq!(frame.len(), 33);
        assert_eq!(frame[0], FRAME_GLOBAL);
        let mut total = [0u8; 8];
        total.copy_from_slice(&frame[1..9]);
        assert_eq!(u64::from_ne_bytes(total), 1);
        let mut done_objects = [0u8; 8];
        done_objects.copy_from_slice(&frame[25..33]);
        assert_eq!(u64::from_ne_bytes(done_objects), 4);
    }

    #[test]
    fn thread_frame_carries_path_and_saturates() {
        let frame = encode_thread_frame(7, u64::max_value(), 42, 9000, "x/y.bin");
        assert_eq!(frame[0], FRAME_THREAD);
        let mut id = [0u8; 4];
        id.copy_from_slice(&frame[1..5]);
        assert_eq!(u32::from_ne_bytes(id), 7);
        let mut fsize = [0u8; 4];
        fsize.copy_from_slice(&frame[5..9]);
        assert_eq!(u32::from_ne_bytes(fsize), u32::max_value());
        let mut namlen = [0u8; 4];
        namlen.copy_from_slice(&frame[17..21]);
        assert_eq!(u32::from_ne_bytes(namlen) as usize, "x/y.bin".len());
        assert_eq!(&frame[21..], b"x/y.bin");
    }
}
