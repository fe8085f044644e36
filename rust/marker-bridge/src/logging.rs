// marker-bridge: tracing setup
//
// Console logging with a runtime-reloadable level, so SET_LOG_LEVEL can
// take effect without a restart.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

use crate::config::{is_valid_log_level, LoggingSection};
use crate::error::{BridgeError, BridgeResult};

/// Handle for adjusting the log level at runtime.
pub type LevelHandle = reload::Handle<EnvFilter, Registry>;

/// Install the global subscriber. Call once, early in main.
pub fn init(cfg: &LoggingSection) -> LevelHandle {
    let (filter, handle) = reload::Layer::new(filter_for(&cfg.level));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    if cfg.timestamps {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer.without_time())
            .init();
    }
    handle
}

/// Swap the active log level.
pub fn set_level(handle: &LevelHandle, level: &str) -> BridgeResult<()> {
    if !is_valid_log_level(level) {
        return Err(BridgeError::ValueOutOfRange(format!(
            "Invalid level '{level}'"
        )));
    }
    handle
        .reload(filter_for(level))
        .map_err(|e| BridgeError::InternalInvariant(format!("log level reload: {e}")))
}

fn filter_for(level: &str) -> EnvFilter {
    // RUST_LOG, when set, wins over the configured level
    if let Ok(env) = std::env::var(EnvFilter::DEFAULT_ENV) {
        if !env.is_empty() {
            return EnvFilter::new(env);
        }
    }
    EnvFilter::new(level.to_ascii_lowercase())
}
