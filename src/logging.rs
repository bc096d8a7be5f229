//! Logging setup.
//!
//! Installs a global tracing subscriber writing to stdout. Verbosity is read
//! from `MNIST_CNN_LOG` (an `EnvFilter` directive such as `warn` or
//! `mnist_cnn=debug`) and defaults to `info`.

use std::sync::OnceLock;

use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

const LOG_ENV_VAR: &str = "MNIST_CNN_LOG";
const DEFAULT_DIRECTIVE: &str = "info";

static INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize tracing. Subsequent calls are no-ops.
pub fn init() {
    INITIALIZED.get_or_init(|| {
        let subscriber = Registry::default()
            .with(build_env_filter())
            .with(fmt::layer().with_target(false).with_writer(std::io::stdout));

        if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
            eprintln!("Failed to install tracing subscriber: {err}");
        }
    });
}

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE))
}
