use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Environment variable holding the log filter directive (e.g. `voxloop=debug`).
pub const LOG_ENV_VAR: &str = "VOXLOOP_LOG";

/// Initialize structured JSON logging at `error` unless `VOXLOOP_LOG` says otherwise.
pub fn init() {
    init_with_default(LevelFilter::ERROR);
}

/// Initialize structured JSON logging with a caller-chosen fallback level.
///
/// Long-running services usually want `info` so session lifecycle lines show up without
/// extra configuration. Only the first call in a process installs a subscriber.
pub fn init_with_default(level: LevelFilter) {
    let filter = EnvFilter::builder()
        .with_env_var(LOG_ENV_VAR)
        .with_default_directive(level.into())
        .from_env_lossy();

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .with_current_span(true)
                .with_span_list(false),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_keeps_first_subscriber() {
        init_with_default(LevelFilter::INFO);
        init();
        tracing::info!(session_id = "s-1", "still routed after a second init");
    }
}
