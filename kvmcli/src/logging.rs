// SPDX-License-Identifier: GPL-2.0-only
use tracing_subscriber::{fmt, EnvFilter};

/// Log to stderr so tables and YAML on stdout stay clean. `RUST_LOG` wins
/// over `-v`.
pub fn init(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    fmt()
        .without_time()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}
