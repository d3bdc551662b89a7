//! Library defaults for runtime configuration

/// Scheduler name used when none is given
pub const NAME: &str = "gvfiber";

/// Whether the constructing thread joins the worker pool
pub const USE_CALLER: bool = false;

/// Worker threads when neither the caller nor `GVF_THREADS` says otherwise
pub fn threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
