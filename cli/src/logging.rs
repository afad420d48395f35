//! Tracing / logging initialisation.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use wasmindex_core::config::LogConfig;

/// Initialise tracing with the given log config.
/// Should be called once at application startup.
pub fn init(config: &LogConfig) {
    // Build the directive string: "info,wasmindex_engine=debug" etc.
    let mut directives = config.level.clone();
    for (component, level) in &config.components {
        directives.push_str(&format!(",{}={}", component.replace('-', "_"), level));
    }

    let filter = EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}
