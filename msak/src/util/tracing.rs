//! Tracing helpers
// (c) 2025 Ross Younger

use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::{EnvFilter, prelude::*};

static TRACING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Environment variable that controls what gets logged to stderr
const STANDARD_ENV_VAR: &str = "RUST_LOG";

/// Log filter setup:
/// Use `RUST_LOG` if it was present; if it wasn't, log only msak items at the
/// given trace level.
fn filter_for(trace_level: &str) -> anyhow::Result<EnvFilter> {
    EnvFilter::try_from_env(STANDARD_ENV_VAR).or_else(|e| {
        // The env var was unset or invalid. Which is it?
        if std::env::var(STANDARD_ENV_VAR).is_ok() {
            anyhow::bail!("{STANDARD_ENV_VAR} (set in environment) was not understood: {e}");
        }
        // It was unset. Fall back.
        Ok(EnvFilter::try_new(format!("msak={trace_level}"))?)
    })
}

/// Set up rust tracing to stderr.
///
/// By default we log only our events (msak), at a given trace level.
/// This can be overridden by setting `RUST_LOG`.
///
/// **CAUTION:** If this function fails, tracing won't be set up; callers must
/// take extra care to report the error.
///
/// **NOTE:** You can only run this once per process. A global bool prevents
/// re-running.
pub(crate) fn setup(trace_level: &str) -> anyhow::Result<()> {
    if is_initialized() {
        tracing::warn!("tracing::setup called a second time (ignoring)");
        return Ok(());
    }
    let filter = filter_for(trace_level)?;
    TRACING_INITIALIZED.store(true, Ordering::Relaxed);

    let layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_filter(filter);
    tracing_subscriber::registry().with(layer).init();
    Ok(())
}

/// Returns whether tracing has been initialized
pub fn is_initialized() -> bool {
    TRACING_INITIALIZED.load(Ordering::Relaxed)
}
