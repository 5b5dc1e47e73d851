//! This module provides a built-in logger implementation.
//!
//! The built-in logger implementation uses the `env_logger` crate.  It is
//! enabled by the Cargo feature "builtin_env_logger" which is enabled by
//! default.  When enabled, it is initialized in
//! [`crate::memory_manager::init`] and shows logs of levels INFO or lower
//! (the lower, the more important).
//!
//! Embedders that integrate with an existing logging framework can disable
//! the feature and register their own implementation with the `log` crate.

/// Attempt to init an env_logger.
/// Does nothing if the "builtin_env_logger" feature is disabled.
pub(crate) fn try_init() {
    cfg_if::cfg_if! {
        if #[cfg(feature = "builtin_env_logger")] {
            let result = env_logger::try_init_from_env(
                // By default, show info level logging.
                env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
            );

            match result {
                Ok(()) => {
                    debug!("Initialized the built-in env_logger.");
                }
                Err(e) => {
                    // `log::SetLoggerError` is only raised when a logger has already been installed.
                    debug!("Failed to initialize the built-in env_logger: {e}");
                }
            }
        } else {
            debug!("The built-in env_logger is not compiled in.  The Cargo feature \"builtin_env_logger\" is not enabled.");
        }
    }
}
