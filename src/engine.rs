//! The engine facade (§4.8 in spirit, "Engine" in the glossary): bundles
//! the store, the executor, and the logical working directory behind one
//! handle a build description is invoked against.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use bon::Builder;
use color_eyre::Result;
use color_eyre::eyre::Context;
use tracing::{instrument, trace};

use crate::error::BuildError;
use crate::executor::{Executor, Permit};
use crate::loader::BuildFile;
use crate::memoize::{self, CallOutcome, TaskDescriptor};
use crate::node::Node;
use crate::store::Store;
use crate::value::Value;

/// Default store directory name under the build root (§6).
const DEFAULT_STORE_DIR: &str = ".mem";

/// Environment variable overriding the store root (§6).
const STORE_ENV: &str = "TASKCACHE_STORE";

/// Environment variable overriding the default concurrency (§4.6, §6).
const CONCURRENCY_ENV: &str = "TASKCACHE_CONCURRENCY";

/// Construction-time options for an [`Engine`], matching the teacher's
/// `CacheRecord`/`CacheRecordArtifact` builder pattern (§"AMBIENT STACK").
#[derive(Builder)]
pub struct EngineOptions {
    /// Overrides the default `<root>/.mem` store directory.
    pub store_root: Option<PathBuf>,
    /// Overrides the default `2 × num_cpus` concurrency bound.
    pub concurrency: Option<usize>,
}

impl EngineOptions {
    /// Read overrides from `TASKCACHE_STORE`/`TASKCACHE_CONCURRENCY`, the
    /// way the teacher's `default_cache_dir` reads `HURRY_CACHE_DIR`.
    pub fn from_env() -> Self {
        let store_root = std::env::var_os(STORE_ENV).map(PathBuf::from);
        let concurrency = std::env::var(CONCURRENCY_ENV)
            .ok()
            .and_then(|v| v.parse().ok());
        Self {
            store_root,
            concurrency,
        }
    }
}

/// A callback run once, just before [`Engine::fail`] exits the process.
///
/// `std::process::exit` skips `Drop`, so anything a driver needs flushed
/// on the way out (§4.6: "terminate the process promptly ... after
/// flushing logs") — e.g. a `tracing-flame` guard — has to be flushed
/// explicitly from here rather than relying on scope exit.
static SHUTDOWN_HOOK: OnceLock<Box<dyn Fn() + Send + Sync>> = OnceLock::new();

/// Register the process's shutdown hook (§4.6). Only the first
/// registration takes effect; later callers are ignored.
pub fn set_shutdown_hook(hook: impl Fn() + Send + Sync + 'static) {
    let _ = SHUTDOWN_HOOK.set(Box::new(hook));
}

/// The single handle a build description is invoked against (§2 item 8).
pub struct Engine {
    root: PathBuf,
    store: Store,
    executor: Executor,
    cwd: Mutex<PathBuf>,
}

impl Engine {
    /// Open an engine rooted at `root`, using `<root>/.mem` as the store
    /// directory and the default concurrency.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_options(root, EngineOptions::from_env())
    }

    /// Open an engine rooted at `root` with explicit options (§6).
    #[instrument(name = "Engine::open_with_options", skip_all)]
    pub fn open_with_options(root: impl Into<PathBuf>, options: EngineOptions) -> Result<Self> {
        let root = root.into();
        let store_root = options
            .store_root
            .unwrap_or_else(|| root.join(DEFAULT_STORE_DIR));
        let concurrency = options
            .concurrency
            .unwrap_or_else(Executor::default_concurrency);

        let store = Store::open(&store_root).context("open cache store")?;
        trace!(?root, ?store_root, concurrency, "opened engine");

        Ok(Self {
            cwd: Mutex::new(root.clone()),
            root,
            store,
            executor: Executor::new(concurrency),
        })
    }

    /// The build root this engine was opened at.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The engine's current logical working directory (§5 "Working-
    /// directory discipline"), possibly switched by an in-flight
    /// [`Engine::subdir`] call.
    pub fn cwd(&self) -> PathBuf {
        self.cwd.lock().expect("cwd mutex poisoned").clone()
    }

    /// Construct a [`Node::File`] for the given path (§6 `node_from_path`).
    pub fn node_from_path(&self, path: impl Into<PathBuf> + std::fmt::Debug) -> Node {
        Node::from_path(path)
    }

    /// Declare a single input dependency from within a task body (§6
    /// `add_dep`).
    pub fn add_dep(&self, value: Value) {
        crate::deps::add_dep(value);
    }

    /// Declare several input dependencies from within a task body (§6
    /// `add_deps`).
    pub fn add_deps(&self, values: impl IntoIterator<Item = Value>) {
        crate::deps::add_deps(values);
    }

    /// Fill in any default from `defaults` the caller didn't already
    /// supply in `kwargs`, composed with [`Engine::memoize`] so the merged
    /// kwargs are what gets fingerprinted (§6 `with_env`).
    pub fn with_env(&self, kwargs: Value, defaults: &[(&str, Value)]) -> Value {
        memoize::with_env(kwargs, defaults)
    }

    /// Abort the build (§6 `fail`, §4.6, §7.2).
    ///
    /// Trips the failure latch, releasing any threads blocked on an
    /// [`Executor`] permit, then terminates the process with exit code 1
    /// (§6 "CLI surface": "exit code ... 1 on any `fail()`").
    pub fn fail(&self, msg: Option<&str>) -> ! {
        self.executor.fail();
        match msg {
            Some(msg) => eprintln!("build failed: {msg}"),
            None => eprintln!("build failed."),
        }
        if let Some(hook) = SHUTDOWN_HOOK.get() {
            hook();
        }
        std::process::exit(1);
    }

    /// Acquire an execution permit, bounding in-flight task execution to
    /// the engine's configured concurrency (§4.6). Returns an error if the
    /// build has already failed.
    pub fn acquire(&self) -> Result<Permit<'_>> {
        self.executor
            .acquire()
            .ok_or_else(|| color_eyre::eyre::eyre!(BuildError::TaskFailure("build already failed".into())))
    }

    /// Whether the build's failure latch has already tripped.
    pub fn failed(&self) -> bool {
        self.executor.failed()
    }

    /// Wrap a task function with the memoization protocol (§4.5, §6
    /// `memoize`).
    ///
    /// Acquires an execution permit around the call so the engine's
    /// concurrency bound applies uniformly to hits and misses alike,
    /// matching the source's placement of the semaphore around the whole
    /// memoized call rather than just the execute path.
    #[instrument(name = "Engine::memoize", skip(self, task), fields(task = %descriptor.name))]
    pub fn memoize(
        &self,
        descriptor: &TaskDescriptor,
        args: Value,
        kwargs: Value,
        task: impl FnOnce(&Engine) -> Result<Value>,
    ) -> Result<(Value, CallOutcome)> {
        let _permit = self.acquire()?;
        memoize::invoke(&self.store, descriptor, args, kwargs, || task(self))
    }

    /// Run a nested build description's entry point with the engine's
    /// logical working directory temporarily switched to `path` (§4.7,
    /// §5 "Working-directory discipline").
    ///
    /// The directory is restored on every exit path, including a failing
    /// entry point, via an RAII guard.
    #[instrument(name = "Engine::subdir", skip_all)]
    pub fn subdir(&self, path: impl AsRef<Path>, build_file: &BuildFile, entry_point: &str, args: &[String]) -> Result<()> {
        let path = path.as_ref();
        let target = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.cwd().join(path)
        };

        let _guard = CwdGuard::switch(self, target)?;
        build_file.dispatch(self, entry_point, args)
    }
}

/// RAII guard restoring the engine's logical cwd on drop, guaranteeing the
/// reset happens on every exit path of [`Engine::subdir`] (§4.7).
struct CwdGuard<'a> {
    engine: &'a Engine,
    previous: PathBuf,
}

impl<'a> CwdGuard<'a> {
    fn switch(engine: &'a Engine, target: PathBuf) -> Result<Self> {
        let mut cwd = engine.cwd.lock().expect("cwd mutex poisoned");
        let previous = cwd.clone();
        *cwd = target;
        Ok(Self { engine, previous })
    }
}

impl Drop for CwdGuard<'_> {
    fn drop(&mut self) {
        let mut cwd = self.engine.cwd.lock().expect("cwd mutex poisoned");
        *cwd = std::mem::take(&mut self.previous);
    }
}
