use fim_kernel::config::RuntimeConfig;
use tracing_subscriber::EnvFilter;

/// Installs the global `fmt` subscriber filtered by `config.log_filter`.
///
/// `RUST_LOG` takes precedence when set. Returns `false` when a subscriber was already
/// installed, which is the normal case when several tests call this.
pub fn init_logging(config: &RuntimeConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
