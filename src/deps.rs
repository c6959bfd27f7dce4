//! The dependency stack (§4.3): a per-thread stack of dependency-collection
//! frames driven by nested task calls.

use std::cell::RefCell;

use tracing::trace;

use crate::value::Value;

thread_local! {
    /// Per-worker stack of in-flight frames (§4.3, §5 "Dependency stack
    /// isolation"). A `thread_local!` stack, rather than a single global
    /// stack behind a lock, is what keeps recursive task calls on
    /// different workers from serializing the build (§9 design notes).
    static FRAMES: RefCell<Vec<Vec<Value>>> = const { RefCell::new(Vec::new()) };
}

/// Push a new frame, seeded with the task's own module as its first
/// dependency (§4.3 `call_start`) — this is what makes a source edit to a
/// memoized task invalidate its cache entries without the task needing to
/// declare itself as a dependency.
pub fn call_start(module: Value) {
    FRAMES.with_borrow_mut(|frames| {
        frames.push(vec![module]);
        trace!(depth = frames.len(), "pushed deps frame");
    });
}

/// Append a single dependency to the top frame (§4.3 `add_dep`).
///
/// Panics if called outside of a task body (no frame is active) — this
/// mirrors the source, where `add_dep` outside of `memoize` is a
/// programmer error rather than a recoverable condition.
pub fn add_dep(value: Value) {
    FRAMES.with_borrow_mut(|frames| {
        let frame = frames
            .last_mut()
            .expect("add_dep called outside of a memoized task");
        frame.push(value);
    });
}

/// Append several dependencies to the top frame (§4.3 `add_deps`).
pub fn add_deps(values: impl IntoIterator<Item = Value>) {
    FRAMES.with_borrow_mut(|frames| {
        let frame = frames
            .last_mut()
            .expect("add_deps called outside of a memoized task");
        frame.extend(values);
    });
}

/// Pop and return the top frame (§4.3 `call_finish`).
///
/// Panics if no frame is active, for the same reason as [`add_dep`].
pub fn call_finish() -> Vec<Value> {
    FRAMES.with_borrow_mut(|frames| {
        let frame = frames.pop().expect("call_finish called with no active frame");
        trace!(depth = frames.len(), len = frame.len(), "popped deps frame");
        frame
    })
}

/// Whether there is a currently active frame on this thread. Used by
/// [`crate::memoize`] to decide whether a memoized call is nested inside
/// another one, or is the outermost call on this worker.
pub fn has_active_frame() -> bool {
    FRAMES.with_borrow(|frames| !frames.is_empty())
}
