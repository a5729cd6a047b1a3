use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Install the global subscriber. `RUST_LOG` wins over `default_level`.
pub fn init_logging(default_level: Option<&str>) {
    if let Err(err) = try_init_logging(default_level) {
        eprintln!("logging already initialised: {err}");
    }
}

pub fn try_init_logging(
    default_level: Option<&str>,
) -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
    let filter: EnvFilter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.unwrap_or("info")));

    let formatting_layer = fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_target(true)
        .compact();

    let subscriber = Registry::default().with(filter).with(formatting_layer);

    tracing::subscriber::set_global_default(subscriber)
}
