use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Logs to stdout for the duration of the test binary, `RUST_LOG` overrides the default of INFO.
/// Safe to call from every test, only the first call installs the subscriber.
pub fn setup_tracing_subscriber_for_test() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()
                .unwrap(),
        )
        .try_init()
        .ok();
}
