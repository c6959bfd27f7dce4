//! The binary entrypoint for `taskcache` (§6 "CLI surface").
//!
//! This driver is deliberately thin: it is one of the "external
//! collaborators" the spec fixes only the interface of (§1). Loading a
//! real build description is left to the caller, via [`load_build_file`];
//! this binary demonstrates the fixed surface against a placeholder
//! registry with no entry points, so `taskcache run <name>` fails with the
//! expected descriptive error unless a real build description is wired in.

use std::{
    fs::File,
    io::BufWriter,
    sync::{atomic::Ordering, Arc, Mutex},
    time::{Duration, Instant},
};

use atomic_time::AtomicInstant;
use clap::{Parser, Subcommand};
use color_eyre::{Result, eyre::Context};
use tap::Pipe;
use taskcache::{BuildFile, Engine};
use tracing::{instrument, level_filters::LevelFilter};
use tracing_error::ErrorLayer;
use tracing_flame::{FlameLayer, FlushGuard};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tracing_tree::time::FormatTime;

#[derive(Parser)]
#[command(name = "taskcache", about = "Incremental, content-addressed builds", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Emit flamegraph profiling data.
    #[arg(short, long, hide(true))]
    profile: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Run a named entry point of the build description in the current
    /// directory (§6 "CLI surface").
    Run {
        /// The entry point to invoke.
        entry_point: String,

        /// Positional arguments forwarded to the entry point.
        args: Vec<String>,
    },
}

#[instrument]
fn main() -> Result<()> {
    let cli = Cli::parse();
    color_eyre::install()?;

    let (flame_layer, flame_guard) = if let Some(profile) = cli.profile {
        FlameLayer::with_file(&profile)
            .with_context(|| format!("set up profiling to {profile:?}"))
            .map(|(layer, guard)| (Some(layer), Some(guard)))?
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(ErrorLayer::default())
        .with(
            tracing_tree::HierarchicalLayer::default()
                .with_indent_lines(true)
                .with_indent_amount(2)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_verbose_exit(false)
                .with_verbose_entry(false)
                .with_deferred_spans(true)
                .with_bracketed_fields(true)
                .with_span_retrace(true)
                .with_timer(Uptime::default())
                .with_targets(false),
        )
        .with(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with(flame_layer)
        .init();

    // `Engine::fail` exits the process via `std::process::exit`, which
    // skips `Drop` — so `flame_guard` is shared with the engine's shutdown
    // hook to make sure it still gets flushed on that path, not just the
    // normal return below.
    let flame_guard = Arc::new(Mutex::new(flame_guard));
    taskcache::set_shutdown_hook({
        let flame_guard = flame_guard.clone();
        move || flush_flame_guard(&flame_guard)
    });

    let result = match cli.command {
        Command::Run { entry_point, args } => run(&entry_point, &args),
    };

    flush_flame_guard(&flame_guard);

    result
}

/// Flush and drop the flamegraph guard, if profiling was enabled. Shared
/// between the normal return path and [`Engine::fail`]'s shutdown hook so
/// a build failure doesn't silently drop profiling data.
fn flush_flame_guard(flame_guard: &Mutex<Option<FlushGuard<BufWriter<File>>>>) {
    if let Some(guard) = flame_guard.lock().expect("flame guard mutex poisoned").take() {
        if let Err(err) = guard.flush() {
            eprintln!("failed to flush flame guard: {err}");
        }
    }
}

/// Load the build description in the current directory and dispatch the
/// named entry point (§6).
///
/// Exits with code 1 (via [`Engine::fail`]) on any task failure; returns
/// `Err` for load/dispatch errors the CLI itself should report (§7.4).
fn run(entry_point: &str, args: &[String]) -> Result<()> {
    let root = std::env::current_dir().context("get current directory")?;
    let engine = Engine::open(&root).context("open engine")?;
    let build_file = load_build_file(&root)?;
    build_file.dispatch(&engine, entry_point, args)
}

/// Load a build description from `root`.
///
/// A real CLI would read a manifest naming a build-description source
/// file and its registration function; that loading concern is out of the
/// core's scope (§1), so this placeholder simply returns an empty
/// registry, matching §7.4's "build description cannot be loaded" case
/// for any non-trivial entry point request.
fn load_build_file(root: &std::path::Path) -> Result<BuildFile> {
    Ok(BuildFile::new(root.join("Buildfile.rs")))
}

/// Prints the overall latency and latency between tracing events.
struct Uptime {
    start: Instant,
    prior: AtomicInstant,
}

impl Default for Uptime {
    fn default() -> Self {
        Self {
            start: Instant::now(),
            prior: AtomicInstant::now(),
        }
    }
}

impl Uptime {
    fn elapsed_since_prior(&self) -> Duration {
        const RELAXED: Ordering = Ordering::Relaxed;
        self.prior
            .fetch_update(RELAXED, RELAXED, |_| Some(Instant::now()))
            .unwrap_or_else(|_| Instant::now())
            .pipe(|prior| prior.elapsed())
    }
}

impl FormatTime for Uptime {
    fn format_time(&self, w: &mut impl std::fmt::Write) -> std::fmt::Result {
        let seconds = self.start.elapsed().as_secs_f64();
        write!(w, "{seconds:.03}s")
    }

    fn style_timestamp(
        &self,
        _ansi: bool,
        _elapsed: std::time::Duration,
        w: &mut impl std::fmt::Write,
    ) -> std::fmt::Result {
        let elapsed = self.elapsed_since_prior().as_millis();
        write!(w, "{elapsed: >3}ms")
    }
}
