//! Global tracing subscriber for the device plugin process.

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Installs the global subscriber, writing to stderr.
///
/// `RUST_LOG` directives take precedence; targets they leave out log at
/// `default_level`.
pub fn init(default_level: LevelFilter) {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let fmt_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(build_filter(default_level, rust_log.as_deref()));

    registry().with(fmt_layer).init();
}

/// Invalid directives are skipped rather than rejected, so a typo in
/// `RUST_LOG` never keeps the plugin from starting.
fn build_filter(default_level: LevelFilter, directives: Option<&str>) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(default_level.into())
        .parse_lossy(directives.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn default_level_applies_without_directives() {
        let filter = build_filter(LevelFilter::WARN, None);
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::WARN));
    }

    #[test]
    fn directives_override_the_default_level() {
        let filter = build_filter(LevelFilter::INFO, Some("debug"));
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::DEBUG));
    }

    #[test]
    fn invalid_directives_fall_back_to_the_default_level() {
        let filter = build_filter(LevelFilter::ERROR, Some("nitro=verbose"));
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::ERROR));
    }
}
