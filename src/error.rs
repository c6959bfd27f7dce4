//! The fatal error kinds from §7, layered under `color-eyre` so task
//! authors see readable, contextual reports.

/// Programmatic error kinds the engine itself needs to distinguish, as
/// opposed to the free-form context chains `color-eyre` accumulates around
/// them. Wrapped in an [`color_eyre::eyre::Report`] at the point of
/// failure via `.into()`/`?`, the way the rest of the engine propagates
/// errors.
#[derive(Debug, strum::Display)]
pub enum BuildError {
    /// §7.2: a task explicitly invoked `fail(msg)`.
    #[strum(to_string = "build failed: {0}")]
    TaskFailure(String),

    /// §7.3: a deps entry exists but its result entry or a referenced
    /// blob does not.
    #[strum(to_string = "cache corruption: {0}")]
    CacheCorruption(String),

    /// §7.4: the requested entry point doesn't exist, or the build
    /// description couldn't be loaded.
    #[strum(to_string = "build description error: {0}")]
    BuildDescription(String),
}

impl std::error::Error for BuildError {}
