use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LogFormat, LoggingSection};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level. `verbose` forces `debug` for
/// this crate. Logs go to stderr so `ask` output on stdout stays clean.
/// Calling this twice is harmless; the second install is ignored.
pub fn init(settings: &LoggingSection, verbose: bool) {
    let default_directive = if verbose {
        "assistant_gateway=debug,info".to_string()
    } else {
        settings.level.clone()
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let registry = tracing_subscriber::registry().with(filter);
    let result = match settings.format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
    if let Err(e) = result {
        eprintln!("[logging] subscriber already installed: {}", e);
    }
}
