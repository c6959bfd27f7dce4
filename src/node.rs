//! Node model (§3, §4.1): handles for build artifacts.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use color_eyre::Result;
use color_eyre::eyre::Context;
use filetime::FileTime;
use serde::{Deserialize, Serialize};
use tracing::{instrument, trace, warn};

use crate::hash::Digest;
use crate::store::Store;

/// A handle to a build artifact.
///
/// The only variant today is [`Node::File`], matching §3 ("The only
/// required variant is FileNode"): other artifact kinds (in-memory blobs,
/// remote objects) are left for task libraries to model as plain [`Value`]
/// scalars, which is out of this engine's scope (§1).
///
/// [`Value`]: crate::value::Value
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Node {
    File(FileNode),
}

/// A filesystem path plus a cached content fingerprint (§3).
///
/// The fingerprint is cached at construction time (`fingerprint_at_path`
/// hashes the file once) rather than recomputed on every
/// [`Node::fingerprint`] call, matching the spec's framing of `fingerprint`
/// as "stable hash of the node's observable content" for a given point in
/// time — recomputation against *current* disk content only happens when
/// the memoizer explicitly re-derives `rhash` (§4.5 step 2).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileNode {
    pub path: PathBuf,
    cached_fingerprint: Option<Digest>,
    /// The file's mtime at construction time, reapplied on restore so a
    /// cache hit doesn't make the file look newer than it actually is to
    /// downstream tools that key off mtime (e.g. `make`, `rustc`).
    cached_mtime: Option<SystemTime>,
}

impl FileNode {
    /// Construct a node for the file at `path`, hashing it immediately if
    /// it exists (§4.1: a missing file has an undefined fingerprint, never
    /// a constructor error).
    #[instrument(name = "FileNode::new")]
    pub fn new(path: impl Into<PathBuf> + std::fmt::Debug) -> Self {
        let path = path.into();
        let cached_fingerprint = Digest::from_file(&path).ok();
        let cached_mtime = std::fs::metadata(&path).ok().and_then(|m| m.modified().ok());
        Self {
            path,
            cached_fingerprint,
            cached_mtime,
        }
    }

    /// Re-hash the file against its *current* disk content, independent of
    /// whatever was cached at construction time. This is what the
    /// memoizer calls while recomputing `rhash` from a stored deps set
    /// (§4.5 step 2) to detect input mutation.
    #[instrument(name = "FileNode::current_fingerprint")]
    pub fn current_fingerprint(&self) -> Option<Digest> {
        Digest::from_file(&self.path).ok()
    }

    /// Copy this node's file into the blob area, keyed by its current
    /// content hash (§4.1 `store`). Idempotent: if the blob already
    /// exists, this is a no-op.
    #[instrument(name = "FileNode::store")]
    pub fn store(&self, store: &Store) -> Result<()> {
        let Some(hash) = self.current_fingerprint() else {
            trace!(path = ?self.path, "skip store: file missing");
            return Ok(());
        };

        let content =
            std::fs::read(&self.path).with_context(|| format!("read {:?} for store", self.path))?;
        store.put_blob(&hash, &content)?;
        trace!(path = ?self.path, ?hash, "stored node");
        Ok(())
    }

    /// Copy the blob for this node's recorded content hash back onto disk
    /// at `self.path` (§4.1 `restore`). Fatal (cache corruption, §7) if
    /// the blob is absent: by the time restore runs, `store` must already
    /// have written it for some prior execution of the same task.
    #[instrument(name = "FileNode::restore")]
    pub fn restore(&self, store: &Store) -> Result<()> {
        let hash = self
            .cached_fingerprint
            .as_ref()
            .ok_or_else(|| color_eyre::eyre::eyre!("node has no recorded fingerprint to restore"))?;

        let Some(content) = store.get_blob(hash)? else {
            return Err(color_eyre::eyre::eyre!(
                "cache corruption: blob {hash} referenced by restored node {:?} is missing",
                self.path
            ));
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create parent dir for {:?}", self.path))?;
        }
        std::fs::write(&self.path, &content)
            .with_context(|| format!("write restored content to {:?}", self.path))?;

        // If we can't recover the original mtime, default to leaving the
        // freshly-written file's own mtime alone rather than erroring: the
        // content is correct either way, and a missing mtime just means a
        // downstream mtime-based tool may see this as newer than it is.
        if let Some(mtime) = self.cached_mtime {
            let mtime = FileTime::from_system_time(mtime);
            filetime::set_file_mtime(&self.path, mtime)
                .with_context(|| format!("set mtime on restored {:?}", self.path))?;
        }

        trace!(path = ?self.path, ?hash, "restored node");
        Ok(())
    }
}

impl Node {
    /// Construct a [`Node::File`] for the given path (§6 `node_from_path`).
    pub fn from_path(path: impl Into<PathBuf> + std::fmt::Debug) -> Self {
        Node::File(FileNode::new(path))
    }

    /// Delegate to the underlying node kind's fingerprint (§4.2 "Node").
    pub fn fingerprint(&self) -> Option<Digest> {
        match self {
            Node::File(f) => f.current_fingerprint(),
        }
    }

    pub fn store(&self, store: &Store) -> Result<()> {
        match self {
            Node::File(f) => f.store(store),
        }
    }

    pub fn restore(&self, store: &Store) -> Result<()> {
        match self {
            Node::File(f) => {
                if let Err(err) = f.restore(store) {
                    warn!(?err, "node restore failed");
                    return Err(err);
                }
                Ok(())
            }
        }
    }

    /// The filesystem path this node refers to, if any.
    pub fn path(&self) -> &Path {
        match self {
            Node::File(f) => &f.path,
        }
    }
}
