// src/infra/logger.rs - Structured logging with tracing

use tracing_subscriber::{fmt, EnvFilter};

/// Initialise the global subscriber. `STUDYTRACK_LOG` wins over `RUST_LOG`;
/// `level` is used when neither is set.
pub fn init_logging(level: &str) {
    let filter = std::env::var("STUDYTRACK_LOG")
        .ok()
        .and_then(|spec| EnvFilter::try_new(spec).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(level));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

/// Map `-v` occurrences to a default filter level.
pub fn level_for_verbosity(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_for_verbosity() {
        assert_eq!(level_for_verbosity(0), "warn");
        assert_eq!(level_for_verbosity(1), "info");
        assert_eq!(level_for_verbosity(5), "debug");
    }
}
