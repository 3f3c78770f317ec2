//! Local-filesystem store client.
//!
//! This backend maps locators onto paths below a root directory.  It has no
//! notion of buckets, so the bucket operations report ENOTSUPP and callers
//! fall back to the directory forms.  Stream status documents carry the file
//! offset, which is all that is needed to resume a positional read or write.

use nix::fcntl::OFlag;
use serde_json::{json, Value};
use std::fs;
use std::fs::{File, OpenOptions};
use std::io;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::store::{Attrs, DirEntry, EntryType, FileStream, StoreClient, StoreError};

pub struct PosixStore {
    root: PathBuf,
}

impl PosixStore {
    pub fn new(root: &Path) -> PosixStore {
        PosixStore { root: root.to_path_buf() }
    }

    fn full(&self, locator: &str) -> PathBuf {
        self.root.join(locator.trim_start_matches('/'))
    }
}

fn map_io_err(err: &io::Error, doing: &str, path: &Path) -> StoreError {
    let message = format!("{} {:?}: {}", doing, path, err);
    match err.kind() {
        io::ErrorKind::NotFound => StoreError::not_found(&message),
        io::ErrorKind::AlreadyExists => StoreError::already_exists(&message),
        _ => StoreError::other(&message),
    }
}

fn attrs_from_metadata(meta: &fs::Metadata) -> Attrs {
    let mut attrs = Attrs::new();
    attrs.insert("mode".to_string(), format!("{:o}", meta.permissions().mode() & 0o7777));
    attrs.insert("size".to_string(), meta.len().to_string());
    attrs
}

fn apply_mode(path: &Path, attrs: &Attrs) {
    if let Some(mode) = attrs.get("mode") {
        if let Ok(bits) = u32::from_str_radix(mode, 8) {
            // attribute application stays best effort
            let _ = fs::set_permissions(path, fs::Permissions::from_mode(bits));
        }
    }
}

fn entry_type_of(ftype: &fs::FileType) -> EntryType {
    if ftype.is_symlink() {
        EntryType::Symlink
    } else if ftype.is_dir() {
        EntryType::Directory
    } else if ftype.is_file() {
        EntryType::Regular
    } else {
        EntryType::Undefined
    }
}

struct PosixFileStream {
    file: File,
    path: PathBuf,
    offset: u64,
}

impl FileStream for PosixFileStream {
    fn stream_get(&mut self, max_len: u64) -> Result<(Vec<u8>, Value), StoreError> {
        self.file
            .seek(SeekFrom::Start(self.offset))
            .map_err(|e| map_io_err(&e, "seek in", &self.path))?;
        let mut buffer = vec![0u8; max_len as usize];
        let mut filled = 0;
        while filled < buffer.len() {
            match self.file.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(map_io_err(&e, "read from", &self.path)),
            }
        }
        buffer.truncate(filled);
        self.offset += filled as u64;
        Ok((buffer, json!({ "offset": self.offset })))
    }

    fn stream_put(&mut self, data: &[u8]) -> Result<Value, StoreError> {
        self.file
            .seek(SeekFrom::Start(self.offset))
            .map_err(|e| map_io_err(&e, "seek in", &self.path))?;
        self.file
            .write_all(data)
            .map_err(|e| map_io_err(&e, "write to", &self.path))?;
        self.offset += data.len() as u64;
        Ok(json!({ "offset": self.offset }))
    }

    fn stream_flush(&mut self) -> Result<(), StoreError> {
        self.file
            .flush()
            .and_then(|_| self.file.sync_all())
            .map_err(|e| map_io_err(&e, "flush", &self.path))
    }
}

fn resume_offset(resume: Option<&Value>) -> u64 {
    resume
        .and_then(|status| status.get("offset"))
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

impl StoreClient for PosixStore {
    fn make_bucket(&self, name: &str) -> Result<(), StoreError> {
        Err(StoreError::not_supported(&format!(
            "posix store cannot create bucket {}",
            name
        )))
    }

    fn delete_bucket(&self, name: &str) -> Result<(), StoreError> {
        Err(StoreError::not_supported(&format!(
            "posix store cannot delete bucket {}",
            name
        )))
    }

    fn list_all_buckets(&self) -> Result<Vec<String>, StoreError> {
        Err(StoreError::not_supported("posix store has no buckets"))
    }

    fn mkdir(&self, path: &str, attrs: &Attrs) -> Result<(), StoreError> {
        let full = self.full(path);
        fs::create_dir(&full).map_err(|e| map_io_err(&e, "mkdir", &full))?;
        apply_mode(&full, attrs);
        Ok(())
    }

    fn rmdir(&self, path: &str) -> Result<(), StoreError> {
        let full = self.full(path);
        fs::remove_dir(&full).map_err(|e| map_io_err(&e, "rmdir", &full))
    }

    fn opendir(
        &self,
        path: &str,
    ) -> Result<Box<dyn Iterator<Item = Result<DirEntry, StoreError>> + Send>, StoreError> {
        let full = self.full(path);
        let read_dir = fs::read_dir(&full).map_err(|e| map_io_err(&e, "opendir", &full))?;
        let dirpath = full.clone();
        let entries = read_dir.map(move |result| {
            let entry = result.map_err(|e| map_io_err(&e, "readdir", &dirpath))?;
            let ftype = entry
                .file_type()
                .map_err(|e| map_io_err(&e, "readdir type of", &entry.path()))?;
            let meta = entry
                .metadata()
                .map_err(|e| map_io_err(&e, "readdir stat of", &entry.path()))?;
            Ok(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: if ftype.is_dir() { 0 } else { meta.len() },
                entry_type: entry_type_of(&ftype),
            })
        });
        Ok(Box::new(entries))
    }

    fn getattr(&self, path: &str) -> Result<Attrs, StoreError> {
        let full = self.full(path);
        let meta = fs::symlink_metadata(&full).map_err(|e| map_io_err(&e, "getattr", &full))?;
        Ok(attrs_from_metadata(&meta))
    }

    fn readlink(&self, path: &str) -> Result<String, StoreError> {
        let full = self.full(path);
        let target = fs::read_link(&full).map_err(|e| map_io_err(&e, "readlink", &full))?;
        Ok(target.to_string_lossy().into_owned())
    }

    fn symlink(&self, target: &str, path: &str) -> Result<(), StoreError> {
        let full = self.full(path);
        std::os::unix::fs::symlink(target, &full).map_err(|e| map_io_err(&e, "symlink", &full))
    }

    fn fget(&self, path: &str) -> Result<(Vec<u8>, Attrs), StoreError> {
        let full = self.full(path);
        let data = fs::read(&full).map_err(|e| map_io_err(&e, "fget", &full))?;
        let meta = fs::symlink_metadata(&full).map_err(|e| map_io_err(&e, "fget stat", &full))?;
        Ok((data, attrs_from_metadata(&meta)))
    }

    fn fput(&self, path: &str, data: &[u8], attrs: &Attrs) -> Result<(), StoreError> {
        let full = self.full(path);
        fs::write(&full, data).map_err(|e| map_io_err(&e, "fput", &full))?;
        apply_mode(&full, attrs);
        Ok(())
    }

    fn unlink(&self, path: &str) -> Result<(), StoreError> {
        let full = self.full(path);
        fs::remove_file(&full).map_err(|e| map_io_err(&e, "unlink", &full))
    }

    fn open(
        &self,
        path: &str,
        flags: OFlag,
        resume: Option<&Value>,
    ) -> Result<Box<dyn FileStream>, StoreError> {
        let full = self.full(path);
        let file = if flags.intersects(OFlag::O_WRONLY | OFlag::O_RDWR) {
            OpenOptions::new()
                .write(true)
                .create(flags.contains(OFlag::O_CREAT))
                .open(&full)
        } else {
            OpenOptions::new().read(true).open(&full)
        };
        let file = file.map_err(|e| map_io_err(&e, "open", &full))?;
        Ok(Box::new(PosixFileStream {
            file,
            path: full,
            offset: resume_offset(resume),
        }))
    }
}
