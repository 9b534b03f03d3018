use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Install a global `tracing` subscriber for demos and manual testing.
///
/// `RUST_LOG` overrides the given default filter.
pub fn init_logging(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .finish();

    // A subscriber may already be set, for example by a test harness
    let _ = tracing::subscriber::set_global_default(subscriber);
}
