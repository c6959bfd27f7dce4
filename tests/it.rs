//! End-to-end scenarios from the spec's §8, exercised against a real
//! [`Engine`] and on-disk store the way the teacher's `tests/it/` suite
//! drives `hurry` end to end.

use std::cell::Cell;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use pretty_assertions::assert_eq as pretty_assert_eq;
use taskcache::memoize::{self, TaskDescriptor};
use taskcache::{CallOutcome, Engine, Node, Value};

fn task(name: &str) -> TaskDescriptor {
    memoize::descriptor(name, PathBuf::from(file!()))
}

/// Scenario 1: `double(x)` is memoized across repeat calls.
#[test_log::test]
fn double_is_memoized_across_calls() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(dir.path()).unwrap();
    let descriptor = task("double");

    let calls = Rc::new(Cell::new(0));
    let double = |x: i64| {
        let calls = calls.clone();
        engine
            .memoize(
                &descriptor,
                Value::Seq(vec![Value::Int(x)]),
                Value::Map(vec![]),
                move |_engine| {
                    calls.set(calls.get() + 1);
                    Ok(Value::Int(x * 2))
                },
            )
            .unwrap()
    };

    let (result, outcome) = double(3);
    pretty_assert_eq!(outcome, CallOutcome::Executed);
    match result {
        Value::Int(n) => pretty_assert_eq!(n, 6),
        other => panic!("unexpected: {other:?}"),
    }

    let (result, outcome) = double(3);
    pretty_assert_eq!(outcome, CallOutcome::Restored);
    match result {
        Value::Int(n) => pretty_assert_eq!(n, 6),
        other => panic!("unexpected: {other:?}"),
    }

    pretty_assert_eq!(calls.get(), 1);
}

/// §8 "Argument sensitivity": a default injected by `Engine::with_env`
/// participates in `tchash` just like an explicit argument, so changing
/// the default re-executes the task even though the caller passed nothing.
#[test_log::test]
fn with_env_default_change_forces_reexecution() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(dir.path()).unwrap();
    let descriptor = task("greet");

    let calls = Arc::new(AtomicUsize::new(0));
    let greet = |level: &str| {
        let calls = calls.clone();
        let kwargs = engine.with_env(Value::Map(vec![]), &[("level", Value::from(level))]);
        engine
            .memoize(&descriptor, Value::Seq(vec![]), kwargs, move |_engine| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Value::from(level))
            })
            .unwrap()
    };

    let (_, outcome) = greet("info");
    pretty_assert_eq!(outcome, CallOutcome::Executed);
    pretty_assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Same declared default, replayed: no re-execution.
    let (_, outcome) = greet("info");
    pretty_assert_eq!(outcome, CallOutcome::Restored);
    pretty_assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Changing the default value forces a miss and re-execution, even
    // though the caller never passed `level` explicitly.
    let (result, outcome) = greet("debug");
    pretty_assert_eq!(outcome, CallOutcome::Executed);
    pretty_assert_eq!(calls.load(Ordering::SeqCst), 2);
    match result {
        Value::Str(s) => pretty_assert_eq!(s, "debug"),
        other => panic!("unexpected: {other:?}"),
    }
}

/// Scenario 2 & 3: a `compile`-shaped task restores its output file from
/// the blob area when the output was deleted, and re-executes when the
/// input source changed.
#[test_log::test]
fn compile_restores_output_and_reruns_on_input_change() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(dir.path()).unwrap();
    let descriptor = task("compile");

    let src_path = dir.path().join("a.c");
    std::fs::write(&src_path, b"int main() {}").unwrap();
    let obj_path = dir.path().join("a.o");

    let compiles = Arc::new(AtomicUsize::new(0));
    let compile = |src: PathBuf, obj: PathBuf| {
        let compiles = compiles.clone();
        engine
            .memoize(
                &descriptor,
                Value::Seq(vec![Value::from(src.to_string_lossy().into_owned())]),
                Value::Map(vec![]),
                move |engine| {
                    compiles.fetch_add(1, Ordering::SeqCst);
                    engine.add_dep(Value::Node(Node::from_path(&src)));
                    let content = std::fs::read(&src).unwrap();
                    std::fs::write(&obj, content).unwrap();
                    Ok(Value::Node(Node::from_path(&obj)))
                },
            )
            .unwrap()
    };

    compile(src_path.clone(), obj_path.clone());
    pretty_assert_eq!(compiles.load(Ordering::SeqCst), 1);
    assert!(obj_path.exists());

    // Scenario 2: delete the output, rerun with unchanged input.
    std::fs::remove_file(&obj_path).unwrap();
    compile(src_path.clone(), obj_path.clone());
    pretty_assert_eq!(compiles.load(Ordering::SeqCst), 1, "should have restored, not recompiled");
    assert!(obj_path.exists(), "restore should have recreated the output file");

    // Scenario 3: edit the input, rerun — must recompile.
    std::fs::write(&src_path, b"int main() { return 1; }").unwrap();
    compile(src_path.clone(), obj_path.clone());
    pretty_assert_eq!(compiles.load(Ordering::SeqCst), 2);
    let new_content = std::fs::read(&obj_path).unwrap();
    pretty_assert_eq!(new_content, b"int main() { return 1; }");
}

/// Scenario 4: an outer task's recorded deps include an inner task's
/// returned node, but not the inner task's own internal dependencies.
#[test_log::test]
fn outer_task_deps_exclude_inner_task_internal_deps() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(dir.path()).unwrap();

    let inner = task("inner");
    let outer = task("outer");

    let extra_path = dir.path().join("x");
    std::fs::write(&extra_path, b"extra").unwrap();
    let inner_secret_path = dir.path().join("inner-secret");
    std::fs::write(&inner_secret_path, b"secret").unwrap();

    let extra_path_for_outer = extra_path.clone();
    let inner_secret_for_inner = inner_secret_path.clone();

    engine
        .memoize(
            &outer,
            Value::Seq(vec![]),
            Value::Map(vec![]),
            move |engine| {
                let (inner_result, _) = engine
                    .memoize(&inner, Value::Seq(vec![]), Value::Map(vec![]), {
                        let inner_secret_for_inner = inner_secret_for_inner.clone();
                        move |engine| {
                            engine.add_dep(Value::Node(Node::from_path(&inner_secret_for_inner)));
                            Ok(Value::Str("inner-result".into()))
                        }
                    })
                    .unwrap();

                engine.add_dep(Value::Node(Node::from_path(&extra_path_for_outer)));
                engine.add_dep(inner_result);
                Ok(Value::Str("outer-result".into()))
            },
        )
        .unwrap();

    let tchash = memoize::call_fingerprint(&outer, &Value::Seq(vec![]), &Value::Map(vec![]));
    let store = tempfile_store_for(&dir);
    let deps = store.get_deps(&tchash).unwrap().unwrap();

    // outer module seed + inner's module (auto-registered on the nested
    // call) + extra-file node + inner's returned string = 4, never the
    // inner task's own "inner-secret" dep.
    pretty_assert_eq!(deps.len(), 4);
}

fn tempfile_store_for(dir: &tempfile::TempDir) -> taskcache::store::Store {
    taskcache::store::Store::open(dir.path().join(".mem")).unwrap()
}

/// Scenario 5: 100 independent tasks under a concurrency bound of 4 never
/// exceed 4 concurrent executions, and a second pass executes nothing.
#[test_log::test]
fn concurrency_is_bounded_and_second_pass_is_free() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(
        Engine::open_with_options(
            dir.path(),
            taskcache::EngineOptions::builder().concurrency(4).build(),
        )
        .unwrap(),
    );

    let concurrent = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let executions = Arc::new(AtomicUsize::new(0));

    let run_all = || {
        let handles: Vec<_> = (0..100)
            .map(|i| {
                let engine = engine.clone();
                let concurrent = concurrent.clone();
                let max_seen = max_seen.clone();
                let executions = executions.clone();
                std::thread::spawn(move || {
                    let descriptor = memoize::descriptor(format!("task-{i}"), PathBuf::from(file!()));
                    engine
                        .memoize(
                            &descriptor,
                            Value::Seq(vec![Value::Int(i)]),
                            Value::Map(vec![]),
                            move |_engine| {
                                executions.fetch_add(1, Ordering::SeqCst);
                                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                                max_seen.fetch_max(now, Ordering::SeqCst);
                                std::thread::sleep(std::time::Duration::from_millis(2));
                                concurrent.fetch_sub(1, Ordering::SeqCst);
                                Ok(Value::Int(i))
                            },
                        )
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    };

    run_all();
    pretty_assert_eq!(executions.load(Ordering::SeqCst), 100);
    assert!(max_seen.load(Ordering::SeqCst) <= 4);

    run_all();
    pretty_assert_eq!(executions.load(Ordering::SeqCst), 100, "second pass should execute zero bodies");
}

/// Scenario 6: `fail()` aborts the process; this is exercised as a
/// subprocess since `fail()` calls `std::process::exit`.
#[test_log::test]
fn fail_releases_waiters_without_exiting_the_test_process() {
    // `Engine::fail` exits the process, which would kill the test runner;
    // exercise the underlying executor directly instead (the same
    // primitive `Engine::fail` drives), matching the property under test:
    // "any concurrently running tasks are unblocked promptly".
    let executor = Arc::new(taskcache::executor::Executor::new(1));
    let _held = executor.acquire().unwrap();

    let waiter_executor = executor.clone();
    let waiter = std::thread::spawn(move || waiter_executor.acquire().is_none());

    std::thread::sleep(std::time::Duration::from_millis(20));
    executor.fail();

    assert!(waiter.join().unwrap());
}
