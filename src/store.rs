//! The store client abstraction.
//!
//! Every endpoint (source, destination, status) is reached through the
//! `StoreClient` trait.  Objects are addressed by locators: either
//! `bucket:path` for a hosted object store, or a filesystem-style path.
//! The migration core only ever compares locators by raw string equality
//! after URL-encoding.

use nix::fcntl::OFlag;
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;

use crate::error::{MigError, MigResult};

/// attribute map carried from getattr into mkdir/fput
pub type Attrs = HashMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// the object does not exist (ENOENT)
    NotFound,
    /// the object already exists (EEXIST)
    AlreadyExists,
    /// the backend does not support the operation (ENOTSUPP)
    NotSupported,
    /// any other backend failure, carried as a message
    Other,
}

/// Error returned by every store client operation.  The core only reacts
/// to the kind; the message is for the logs.
#[derive(Debug)]
pub struct StoreError {
    kind: StoreErrorKind,
    message: String,
}

impl StoreError {
    pub fn new(kind: StoreErrorKind, message: &str) -> StoreError {
        StoreError { kind, message: message.to_string() }
    }

    pub fn not_found(message: &str) -> StoreError {
        StoreError::new(StoreErrorKind::NotFound, message)
    }

    pub fn already_exists(message: &str) -> StoreError {
        StoreError::new(StoreErrorKind::AlreadyExists, message)
    }

    pub fn not_supported(message: &str) -> StoreError {
        StoreError::new(StoreErrorKind::NotSupported, message)
    }

    pub fn other(message: &str) -> StoreError {
        StoreError::new(StoreErrorKind::Other, message)
    }

    pub fn kind(&self) -> StoreErrorKind {
        self.kind
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            StoreErrorKind::NotFound => write!(f, "not found: {}", self.message),
            StoreErrorKind::AlreadyExists => write!(f, "already exists: {}", self.message),
            StoreErrorKind::NotSupported => write!(f, "not supported: {}", self.message),
            StoreErrorKind::Other => write!(f, "{}", self.message),
        }
    }
}

impl Error for StoreError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Undefined,
    Regular,
    Directory,
    Symlink,
}

impl EntryType {
    /// integer representation used in the plan documents
    pub fn code(self) -> i64 {
        match self {
            EntryType::Undefined => 0,
            EntryType::Regular => 1,
            EntryType::Directory => 2,
            EntryType::Symlink => 3,
        }
    }

    pub fn from_code(code: i64) -> EntryType {
        match code {
            1 => EntryType::Regular,
            2 => EntryType::Directory,
            3 => EntryType::Symlink,
            _ => EntryType::Undefined,
        }
    }
}

/// one readdir result
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub size: u64,
    pub entry_type: EntryType,
}

/// A streaming file handle.  Each get/put returns an opaque status
/// document which, fed back into `StoreClient::open` as the resume
/// argument, lets the stream continue where it stopped, across process
/// restarts included.  Closing is dropping.
pub trait FileStream {
    fn stream_get(&mut self, max_len: u64) -> Result<(Vec<u8>, Value), StoreError>;
    fn stream_put(&mut self, data: &[u8]) -> Result<Value, StoreError>;
    fn stream_flush(&mut self) -> Result<(), StoreError>;
}

/// Capabilities the migration core needs from an endpoint.
pub trait StoreClient: Send + Sync {
    fn make_bucket(&self, name: &str) -> Result<(), StoreError>;
    fn delete_bucket(&self, name: &str) -> Result<(), StoreError>;
    fn list_all_buckets(&self) -> Result<Vec<String>, StoreError>;

    fn mkdir(&self, path: &str, attrs: &Attrs) -> Result<(), StoreError>;
    fn rmdir(&self, path: &str) -> Result<(), StoreError>;
    fn opendir(
        &self,
        path: &str,
    ) -> Result<Box<dyn Iterator<Item = Result<DirEntry, StoreError>> + Send>, StoreError>;

    fn getattr(&self, path: &str) -> Result<Attrs, StoreError>;
    fn readlink(&self, path: &str) -> Result<String, StoreError>;
    fn symlink(&self, target: &str, path: &str) -> Result<(), StoreError>;

    fn fget(&self, path: &str) -> Result<(Vec<u8>, Attrs), StoreError>;
    fn fput(&self, path: &str, data: &[u8], attrs: &Attrs) -> Result<(), StoreError>;
    fn unlink(&self, path: &str) -> Result<(), StoreError>;

    fn open(
        &self,
        path: &str,
        flags: OFlag,
        resume: Option<&Value>,
    ) -> Result<Box<dyn FileStream>, StoreError>;
}

/// join a bucket or directory locator with a relative object path
pub fn locator_join(base: &str, rel: &str) -> String {
    if base.ends_with(':') || base.ends_with('/') || rel.is_empty() {
        format!("{}{}", base, rel)
    } else {
        format!("{}/{}", base, rel)
    }
}

/// locator of the parent container, or None for a root-level locator
pub fn locator_parent(locator: &str) -> Option<&str> {
    let trimmed = locator.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => None,
        Some(idx) => Some(&trimmed[..idx]),
    }
}

const URLENC_HEX: &[u8] = b"0123456789abcdef";

/// Percent-encoding used for the plan filenames on the status store.
/// The unreserved set passes through, space becomes '+', everything else
/// becomes lowercase %hh.  Works on raw bytes so a leading NUL survives.
pub fn urlencode(raw: &[u8]) -> String {
    let mut encoded = String::with_capacity(raw.len() * 3);
    for &byte in raw {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char);
            }
            b' ' => encoded.push('+'),
            _ => {
                encoded.push('%');
                encoded.push(URLENC_HEX[(byte >> 4) as usize] as char);
                encoded.push(URLENC_HEX[(byte & 15) as usize] as char);
            }
        }
    }
    encoded
}

fn from_hex(c: u8) -> MigResult<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(MigError::PlanError(format!("invalid hex digit '{}'", c as char))),
    }
}

pub fn urldecode(encoded: &str) -> MigResult<Vec<u8>> {
    let bytes = encoded.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                decoded.push(b' ');
                i += 1;
            }
            b'%' => {
                if i + 2 >= bytes.len() {
                    return Err(MigError::PlanError(format!(
                        "truncated percent escape in '{}'",
                        encoded
                    )));
                }
                decoded.push(from_hex(bytes[i + 1])? << 4 | from_hex(bytes[i + 2])?);
                i += 3;
            }
            b => {
                decoded.push(b);
                i += 1;
            }
        }
    }
    Ok(decoded)
}

/// Status filename for a source locator: urlencoded locator plus ".json".
/// A locator starting with ':' gets a NUL byte prepended first so that the
/// encoded name still round-trips to the raw locator.
pub fn plan_filename(locator: &str) -> String {
    let mut raw: Vec<u8> = Vec::with_capacity(locator.len() + 1);
    if locator.starts_with(':') {
        raw.push(0);
    }
    raw.extend_from_slice(locator.as_bytes());
    let mut name = urlencode(&raw);
    name.push_str(".json");
    name
}

/// Recover the raw source locator from a plan filename.
pub fn plan_locator(filename: &str) -> MigResult<String> {
    let stem = if filename.ends_with(".json") {
        &filename[..filename.len() - 5]
    } else {
        filename
    };
    let mut raw = urldecode(stem)?;
    if raw.first() == Some(&0) {
        raw.remove(0);
    }
    String::from_utf8(raw)
        .map_err(|e| MigError::PlanError(format!("plan name is not valid utf-8: {}", e)))
}

#[test]
fn test_urlencode_unreserved_passthrough() {
    assert_eq!(urlencode(b"Az09-_.~"), "Az09-_.~");
    assert_eq!(urlencode(b"a b"), "a+b");
    assert_eq!(urlencode(b"bucket:path/file"), "bucket%3apath%2ffile");
    assert_eq!(urlencode(&[0u8]), "%00");
}

#[test]
fn test_urlencode_roundtrip() {
    let locators = [
        "bucket:some/path",
        ":leading/colon",
        "plain-file_name.ext~",
        "spaces in name",
        "perc%ent+plus",
    ];
    for locator in locators.iter() {
        let encoded = urlencode(locator.as_bytes());
        let decoded = urldecode(&encoded).expect("decode failed");
        assert_eq!(&decoded, locator.as_bytes(), "round trip of {}", locator);
    }
}

#[test]
fn test_plan_filename_roundtrip() {
    for locator in [":bucketless/path", "bucket:dir", "plain"].iter() {
        let name = plan_filename(locator);
        assert!(name.ends_with(".json"));
        assert_eq!(&plan_locator(&name).expect("decode"), locator);
    }
}

#[test]
fn test_locator_join_and_parent() {
    assert_eq!(locator_join("bucket:", "a/b"), "bucket:a/b");
    assert_eq!(locator_join("dir", "a/b"), "dir/a/b");
    assert_eq!(locator_join("dir/", "a"), "dir/a");
    assert_eq!(locator_parent("dir/a/b"), Some("dir/a"));
    assert_eq!(locator_parent("dir"), None);
    assert_eq!(locator_parent("/dir"), None);
}
