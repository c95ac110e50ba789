pub mod paths;
pub mod serve;
pub mod tail;

/// Initialise `env_logger` for CLI commands; `RUST_LOG` overrides the default.
pub(crate) fn init_logging() {
  let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
    .format_timestamp_secs()
    .try_init();
}
