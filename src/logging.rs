//! Logging setup for the command-line front end.
//!
//! Writes to stderr so stdout stays free for the run summary. The
//! `RUST_LOG` environment variable overrides the verbosity flag.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Default filter for a `-v` count.
pub fn default_filter(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "raw_thumbnailer=info,warn",
        1 => "raw_thumbnailer=debug,info",
        _ => "raw_thumbnailer=trace,debug",
    }
}

/// Install the global subscriber.
///
/// Returns an error if a subscriber is already installed.
pub fn init_logging(verbosity: u8) -> Result<(), tracing_subscriber::util::TryInitError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbosity)));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filters_parse() {
        for verbosity in 0..4 {
            assert!(EnvFilter::try_new(default_filter(verbosity)).is_ok());
        }
    }
}
