use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Variable holding the log filter, e.g. `KILN_LOG=kiln=debug`.
pub const LOG_ENV: &str = "KILN_LOG";

/// Installs a global subscriber printing build output above the progress
/// bars. Does nothing if a subscriber is already set.
pub fn init_logging() {
    let indicatif = IndicatifLayer::new();
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .without_time()
                .with_target(false)
                .with_writer(indicatif.get_stderr_writer()),
        )
        .with(indicatif)
        .try_init();
}
