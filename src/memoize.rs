//! The memoizer (§4.5): wraps a task function with the lookup/execute/store
//! protocol. This is the heart of the engine.

use std::path::{Path, PathBuf};

use color_eyre::Result;
use tracing::{instrument, trace};

use crate::deps;
use crate::hash::Digest;
use crate::node::Node;
use crate::store::Store;
use crate::value::{ModuleRef, Value};

/// Identifies a task for fingerprinting purposes (§3 "Task descriptor").
///
/// Rust has no runtime equivalent of Python's `function.__module__`, so the
/// descriptor carries the defining source path explicitly — supplied once,
/// at the task's definition site, the same information the source's
/// `@mem.memoize` decorator pulled out of `sys.modules[f.__module__]`.
#[derive(Clone, Debug)]
pub struct TaskDescriptor {
    pub name: String,
    pub module_path: PathBuf,
}

impl TaskDescriptor {
    pub fn new(name: impl Into<String>, module_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            module_path: module_path.into(),
        }
    }

    fn module_value(&self) -> Value {
        Value::Module(ModuleRef::new(self.module_path.clone()))
    }
}

/// Outcome of a single memoized call, exposed for callers (and tests) that
/// want to observe whether a call hit the cache (§8 "Replay correctness").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CallOutcome {
    Restored,
    Executed,
}

/// Compute the call fingerprint `tchash = fingerprint(name, module_path,
/// args, kwargs)` (§3).
pub fn call_fingerprint(descriptor: &TaskDescriptor, args: &Value, kwargs: &Value) -> Digest {
    let tuple = Value::Seq(vec![
        Value::from(descriptor.name.clone()),
        Value::from(descriptor.module_path.to_string_lossy().into_owned()),
        args.clone(),
        kwargs.clone(),
    ]);
    tuple
        .fingerprint()
        .expect("call fingerprint inputs are plain scalars/sequences, never nodes")
}

/// Recompute the result key `rhash = fingerprint(tchash, deps)` (§3),
/// re-hashing each dependency against its *current* content (§4.5 step 2).
///
/// Returns `None` if any recorded dependency's content is currently
/// unavailable (e.g. an input file was deleted) — that propagates as a
/// cache miss, never a crash (§4.1).
fn result_key(tchash: &Digest, deps: &[Value]) -> Option<Digest> {
    let deps_seq = Value::Seq(deps.to_vec());
    let tuple = Value::Seq(vec![Value::Str(tchash.as_str().to_owned()), deps_seq]);
    tuple.fingerprint()
}

/// Recursively invoke `store`/`restore` on every [`Node`] inside a value
/// tree (§4.5 step d, §9 "recurse through all sequence-shaped containers,
/// including mappings' values").
fn walk_nodes(value: &Value, mut visit: impl FnMut(&Node) -> Result<()>) -> Result<()> {
    fn go(value: &Value, visit: &mut dyn FnMut(&Node) -> Result<()>) -> Result<()> {
        match value {
            Value::Node(n) => visit(n),
            Value::Seq(items) => {
                for item in items {
                    go(item, visit)?;
                }
                Ok(())
            }
            Value::Map(entries) => {
                for (_, v) in entries {
                    go(v, visit)?;
                }
                Ok(())
            }
            Value::Int(_) | Value::Bool(_) | Value::Str(_) | Value::Bytes(_) | Value::Module(_) => {
                Ok(())
            }
        }
    }
    go(value, &mut visit)
}

fn store_result_nodes(store: &Store, result: &Value) -> Result<()> {
    walk_nodes(result, |node| node.store(store))
}

fn restore_result_nodes(store: &Store, result: &Value) -> Result<()> {
    walk_nodes(result, |node| node.restore(store))
}

/// Run the lookup/execute/store protocol for a single call (§4.5).
///
/// `task` is invoked only on a cache miss. Its own recorded dependencies
/// come from whatever it calls into `deps::add_dep`/`add_deps` (directly,
/// or transitively through nested memoized calls) while it runs.
#[instrument(name = "memoize::invoke", skip(store, task), fields(task = %descriptor.name))]
pub fn invoke(
    store: &Store,
    descriptor: &TaskDescriptor,
    args: Value,
    kwargs: Value,
    task: impl FnOnce() -> Result<Value>,
) -> Result<(Value, CallOutcome)> {
    let tchash = call_fingerprint(descriptor, &args, &kwargs);

    if let Some(deps) = store.get_deps(&tchash)? {
        if let Some(rhash) = result_key(&tchash, &deps) {
            if let Some(result) = store.get_result(&rhash)? {
                restore_result_nodes(store, &result)?;
                register_as_dep_of_caller(descriptor);
                trace!(%tchash, %rhash, "cache hit");
                return Ok((result, CallOutcome::Restored));
            }
        }
    }

    let result = execute(store, descriptor, tchash, task)?;
    register_as_dep_of_caller(descriptor);
    Ok((result, CallOutcome::Executed))
}

/// The execute path (§4.5 step 4).
fn execute(
    store: &Store,
    descriptor: &TaskDescriptor,
    tchash: Digest,
    task: impl FnOnce() -> Result<Value>,
) -> Result<Value> {
    deps::call_start(descriptor.module_value());
    let result = task();
    let deps = deps::call_finish();
    let result = result?;

    store_result_nodes(store, &result)?;

    let rhash = result_key(&tchash, &deps).ok_or_else(|| {
        color_eyre::eyre::eyre!(
            "a dependency recorded by {:?} became unavailable mid-execution",
            descriptor.name
        )
    })?;

    // Write order matters (§3 invariant): result before deps, so a reader
    // that finds a deps entry can assume the result exists.
    store.put_result(&rhash, &result)?;
    store.put_deps(&tchash, &deps)?;

    trace!(%tchash, %rhash, "executed and cached");
    Ok(result)
}

/// After a call resolves (hit or miss), register this task's own module as
/// a dependency of whatever frame is above it, if this call is nested
/// inside another memoized call (§4.5 step f, §4.3).
fn register_as_dep_of_caller(descriptor: &TaskDescriptor) {
    if deps::has_active_frame() {
        deps::add_dep(descriptor.module_value());
    }
}

/// Construct a [`TaskDescriptor`] from a source file path and task name —
/// the usual way a build description registers a task (§6 `memoize`).
pub fn descriptor(name: impl Into<String>, module_path: impl AsRef<Path>) -> TaskDescriptor {
    TaskDescriptor::new(name, module_path.as_ref().to_path_buf())
}

/// `with_env` (§4.5, §6): fill in any default declared in `defaults` that
/// the caller didn't already supply in `kwargs`, *before* fingerprinting.
///
/// Both `kwargs` and `defaults` are `Value::Map`s. Because the merged
/// kwargs are what `call_fingerprint` hashes, changing a default
/// invalidates every cache entry for the task — that's the point (§6:
/// "changing a default invalidates caches").
pub fn with_env(kwargs: Value, defaults: &[(&str, Value)]) -> Value {
    let Value::Map(mut entries) = kwargs else {
        panic!("with_env expects kwargs to be a Value::Map");
    };

    for (key, default) in defaults {
        let present = entries.iter().any(|(k, _)| matches!(k, Value::Str(s) if s == key));
        if !present {
            entries.push((Value::from(*key), default.clone()));
        }
    }

    Value::Map(entries)
}
