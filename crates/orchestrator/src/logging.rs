use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "orchestrator=info,execution=info,events=info";

fn filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into())
}

/// Install the global subscriber: a fmt layer filtered by `RUST_LOG`, or by
/// `default_filter` when unset.
///
/// Panics if a global subscriber is already installed; see [`try_init_tracing`].
pub fn init_tracing(default_filter: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter(default_filter))
        .init();
}

/// Like [`init_tracing`], but returns `false` when a subscriber is already set.
pub fn try_init_tracing(default_filter: &str) -> bool {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .with(filter(default_filter))
        .try_init()
        .is_ok()
}
