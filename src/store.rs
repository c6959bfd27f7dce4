//! The cache store (§3, §4.4): two sharded content-addressed namespaces
//! (`deps/`, `results/`) plus a content-addressed blob area (`blob/`).

use std::path::{Path, PathBuf};

use color_eyre::Result;
use color_eyre::eyre::Context;
use serde::{Deserialize, Serialize};
use tracing::{instrument, trace};
use uuid::Uuid;

use crate::hash::Digest;
use crate::value::Value;

const DEPS_DIR: &str = "deps";
const RESULTS_DIR: &str = "results";
const BLOB_DIR: &str = "blob";

/// Current on-disk entry format version (§3 "Serialization format").
const FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    v: u32,
    value: T,
}

/// The on-disk store rooted at a directory (default `.mem/`, see
/// [`crate::engine::Engine`]).
#[derive(Clone, Debug)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Open (creating if necessary) a store rooted at `root`.
    #[instrument(name = "Store::open")]
    pub fn open(root: impl Into<PathBuf> + std::fmt::Debug) -> Result<Self> {
        let root = root.into();
        for dir in [DEPS_DIR, RESULTS_DIR, BLOB_DIR] {
            std::fs::create_dir_all(root.join(dir))
                .with_context(|| format!("create store subdirectory {dir}"))?;
        }
        trace!(?root, "opened store");
        Ok(Self { root })
    }

    fn sharded_path(&self, namespace: &str, key: &Digest) -> PathBuf {
        let (prefix, rest) = key.shard();
        self.root.join(namespace).join(prefix).join(rest)
    }

    /// Write `deps` at the entry keyed by `tchash` (§4.4 `put_deps`).
    #[instrument(name = "Store::put_deps", skip(deps))]
    pub fn put_deps(&self, tchash: &Digest, deps: &[Value]) -> Result<()> {
        let path = self.sharded_path(DEPS_DIR, tchash);
        write_atomic(&path, &Envelope { v: FORMAT_VERSION, value: deps })
    }

    /// Read the deps set recorded for `tchash`, or `None` on a miss (§4.4
    /// `get_deps`).
    #[instrument(name = "Store::get_deps")]
    pub fn get_deps(&self, tchash: &Digest) -> Result<Option<Vec<Value>>> {
        let path = self.sharded_path(DEPS_DIR, tchash);
        read_envelope(&path)
    }

    /// Write `result` at the entry keyed by `rhash` (§4.4 `put_result`).
    #[instrument(name = "Store::put_result", skip(result))]
    pub fn put_result(&self, rhash: &Digest, result: &Value) -> Result<()> {
        let path = self.sharded_path(RESULTS_DIR, rhash);
        write_atomic(&path, &Envelope { v: FORMAT_VERSION, value: result })
    }

    /// Read the result recorded for `rhash`, or `None` on a miss (§4.4
    /// `get_result`).
    #[instrument(name = "Store::get_result")]
    pub fn get_result(&self, rhash: &Digest) -> Result<Option<Value>> {
        let path = self.sharded_path(RESULTS_DIR, rhash);
        read_envelope(&path)
    }

    /// Write raw bytes into the blob area keyed by `hash`, used by
    /// [`crate::node::FileNode::store`]. Idempotent.
    #[instrument(name = "Store::put_blob", skip(content))]
    pub fn put_blob(&self, hash: &Digest, content: &[u8]) -> Result<()> {
        let path = self.sharded_path(BLOB_DIR, hash);
        if path.exists() {
            return Ok(());
        }
        write_atomic_bytes(&path, content)
    }

    /// Read raw bytes out of the blob area, used by
    /// [`crate::node::FileNode::restore`].
    #[instrument(name = "Store::get_blob")]
    pub fn get_blob(&self, hash: &Digest) -> Result<Option<Vec<u8>>> {
        let path = self.sharded_path(BLOB_DIR, hash);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("read blob {path:?}")),
        }
    }
}

/// Write `value` as JSON to `path`, via a temp file in the same directory
/// renamed into place (§4.4 atomicity).
fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value).context("serialize cache entry")?;
    write_atomic_bytes(path, &bytes)
}

fn write_atomic_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create shard directory {parent:?}"))?;
    }

    let temp = temp_path(path);
    std::fs::write(&temp, bytes).with_context(|| format!("write temp file {temp:?}"))?;
    match std::fs::rename(&temp, path) {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = std::fs::remove_file(&temp);
            Err(err).with_context(|| format!("rename {temp:?} to {path:?}"))
        }
    }
}

fn read_envelope<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read cache entry {path:?}")),
    };

    let envelope: Envelope<T> =
        serde_json::from_slice(&bytes).with_context(|| format!("parse cache entry {path:?}"))?;
    Ok(Some(envelope.value))
}

/// Generate a temp path alongside `target`, suffixed with a UUID so
/// concurrent writers of different keys never collide (§4.4).
fn temp_path(target: &Path) -> PathBuf {
    let mut temp = target.as_os_str().to_owned();
    temp.push(".tmp.");
    temp.push(Uuid::new_v4().to_string());
    PathBuf::from(temp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    fn digest(s: &str) -> Digest {
        Digest::from_buffer(s.as_bytes())
    }

    #[test]
    fn deps_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let key = digest("task-call");
        pretty_assert_eq!(store.get_deps(&key).unwrap(), None);

        let deps = vec![Value::Int(1), Value::from("x")];
        store.put_deps(&key, &deps).unwrap();

        let read = store.get_deps(&key).unwrap().unwrap();
        pretty_assert_eq!(read.len(), 2);
    }

    #[test]
    fn results_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let key = digest("result-key");
        let result = Value::Int(6);
        store.put_result(&key, &result).unwrap();

        match store.get_result(&key).unwrap().unwrap() {
            Value::Int(n) => pretty_assert_eq!(n, 6),
            other => panic!("unexpected value: {other:?}"),
        }
    }

    #[test]
    fn blob_write_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let key = digest("blob content");
        store.put_blob(&key, b"blob content").unwrap();
        store.put_blob(&key, b"blob content").unwrap();

        pretty_assert_eq!(store.get_blob(&key).unwrap().unwrap(), b"blob content");
    }

    #[test]
    fn missing_entries_are_miss_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let key = digest("never written");
        pretty_assert_eq!(store.get_deps(&key).unwrap(), None);
        pretty_assert_eq!(store.get_result(&key).unwrap(), None);
        pretty_assert_eq!(store.get_blob(&key).unwrap(), None);
    }
}
