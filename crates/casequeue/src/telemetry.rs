//! Process-wide tracing setup shared by the worker and the CLI.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber. Filtering follows `RUST_LOG` (default
/// `info`); `CASEQUEUE_LOG_JSON=1` switches to one JSON object per line.
///
/// Safe to call more than once; later calls are ignored.
pub fn init(service: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json = std::env::var("CASEQUEUE_LOG_JSON")
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    let res = if json {
        registry
            .with(fmt::layer().json().with_current_span(false).with_target(true))
            .try_init()
    } else {
        registry.with(fmt::layer().with_target(false)).try_init()
    };

    if res.is_ok() {
        tracing::info!(service, json, "tracing initialised");
    }
}
