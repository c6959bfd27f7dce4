//! Concurrency governor (§4.6): a counting semaphore bounding in-flight
//! tasks, plus a process-wide failure latch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

use tracing::{instrument, warn};

/// A blocking counting semaphore, the way the source's
/// `threading.Semaphore(cpu_count() * 2)` bounds task execution.
///
/// Built on `std::sync::{Mutex, Condvar}` rather than an async primitive:
/// per §5, tasks are blocking and may spawn external processes and wait,
/// so there's no executor loop for an async semaphore to yield control
/// back to.
struct Semaphore {
    state: Mutex<SemaphoreState>,
    condvar: Condvar,
}

struct SemaphoreState {
    available: usize,
    /// Set by [`Executor::fail`] so that a `release()` racing a fresh
    /// `acquire()` can't undo the "everyone proceeds" effect of failing.
    draining: bool,
}

impl Semaphore {
    fn new(permits: usize) -> Self {
        Self {
            state: Mutex::new(SemaphoreState {
                available: permits,
                draining: false,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Block until a permit is available (or the latch is draining), then
    /// take it.
    fn acquire(&self) {
        let mut state = self.state.lock().expect("semaphore mutex poisoned");
        while state.available == 0 && !state.draining {
            state = self.condvar.wait(state).expect("semaphore mutex poisoned");
        }
        if state.available > 0 {
            state.available -= 1;
        }
    }

    fn release(&self) {
        let mut state = self.state.lock().expect("semaphore mutex poisoned");
        state.available += 1;
        self.condvar.notify_one();
    }

    /// Release every outstanding permit and mark the semaphore as
    /// draining, so every blocked `acquire()` wakes up immediately
    /// (§4.6 "`fail` MUST release all outstanding permits").
    fn drain(&self) {
        let mut state = self.state.lock().expect("semaphore mutex poisoned");
        state.draining = true;
        self.condvar.notify_all();
    }
}

/// A held semaphore permit. Releases on drop so a panicking or
/// early-returning task can never leak a permit (§4.6).
pub struct Permit<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

/// Bounds in-flight task execution and hosts the process-wide failure
/// latch (§4.6).
pub struct Executor {
    semaphore: Semaphore,
    failed: AtomicBool,
}

impl Executor {
    /// Default concurrency: `2 × num_cpus` (§4.6), matching the source's
    /// `cpu_count() * 2` and the teacher's `num_cpus` usage.
    pub fn default_concurrency() -> usize {
        2 * num_cpus::get()
    }

    pub fn new(concurrency: usize) -> Self {
        Self {
            semaphore: Semaphore::new(concurrency.max(1)),
            failed: AtomicBool::new(false),
        }
    }

    /// Whether the build has already failed (§4.6, §7 "Task failure").
    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Acquire a permit, blocking until one is free. Returns `None` if the
    /// build has already failed, so callers can bail out instead of
    /// starting work that will just be discarded.
    #[instrument(name = "Executor::acquire", skip(self))]
    pub fn acquire(&self) -> Option<Permit<'_>> {
        if self.failed() {
            return None;
        }
        self.semaphore.acquire();
        if self.failed() {
            // Lost the race with a concurrent `fail()`: release immediately
            // rather than handing back a permit for a dead build.
            self.semaphore.release();
            return None;
        }
        Some(Permit { semaphore: &self.semaphore })
    }

    /// Trip the failure latch and release every outstanding permit so no
    /// worker deadlocks waiting for one (§4.6, §7 "Task failure").
    #[instrument(name = "Executor::fail", skip(self))]
    pub fn fail(&self) {
        if self.failed.swap(true, Ordering::SeqCst) {
            warn!("fail() called after the build had already failed");
        }
        self.semaphore.drain();
    }
}
