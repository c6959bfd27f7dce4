//! The build-description loader (§4.7): a registry of named entry points,
//! plus the `subdir` mechanism for composing nested build descriptions.
//!
//! Python's source loads a `Memfile` by path and calls
//! `__dict__[name](*args, **kwargs)` on whatever it finds; Rust has no
//! runtime module loading, so a [`BuildFile`] is instead an explicit
//! registry the build description builds up itself (§9 "higher-order
//! registration"), keyed by entry-point name.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use color_eyre::Result;
use color_eyre::eyre::Context;
use tracing::instrument;

use crate::engine::Engine;
use crate::error::BuildError;

type EntryPoint = Box<dyn Fn(&Engine, &[String]) -> Result<()> + Send + Sync>;

/// A build description: the source path it was "loaded" from (which
/// participates in fingerprinting for any task that doesn't supply its own
/// module path) plus a registry of named entry points.
pub struct BuildFile {
    path: PathBuf,
    entry_points: BTreeMap<String, EntryPoint>,
}

impl BuildFile {
    /// Register a build description rooted at `path` (conventionally the
    /// build description's own source file).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entry_points: BTreeMap::new(),
        }
    }

    /// Register an entry point under `name`.
    pub fn entry_point(
        mut self,
        name: impl Into<String>,
        f: impl Fn(&Engine, &[String]) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.entry_points.insert(name.into(), Box::new(f));
        self
    }

    /// The source path this build description was registered from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Dispatch to the named entry point (§6 CLI surface, §4.7).
    ///
    /// Fails with [`BuildError::BuildDescription`] if `name` isn't
    /// registered (§7.4).
    #[instrument(name = "BuildFile::dispatch", skip(self, engine), fields(entry_point = name))]
    pub fn dispatch(&self, engine: &Engine, name: &str, args: &[String]) -> Result<()> {
        let entry = self.entry_points.get(name).ok_or_else(|| {
            BuildError::BuildDescription(format!(
                "requested method '{name}()' doesn't exist in {:?}",
                self.path
            ))
        })?;
        entry(engine, args).with_context(|| format!("run entry point {name:?}"))
    }
}
