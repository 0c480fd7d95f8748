// Copyright 2025 Frameflow Contributors
// SPDX-License-Identifier: Apache-2.0

//! Console logging initialization.
//!
//! One fmt layer filtered through `RUST_LOG` (falling back to the caller's
//! default directive). Calling it more than once is harmless.

use anyhow::Result;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

/// Initializes console logging for the process.
///
/// # Arguments
/// * `default_filter` - Directive used when `RUST_LOG` is unset,
///   e.g. `"info"` or `"frameflow=debug,info"`.
pub fn init_logging(default_filter: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_file(false)
        .with_line_number(false);

    // A second init (tests, embedding applications) keeps the first
    // subscriber; that is not an error worth failing startup over.
    let _ = Registry::default()
        .with(env_filter)
        .with(console_layer)
        .try_init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_init_is_harmless() {
        init_logging("info").unwrap();
        init_logging("debug").unwrap();
    }
}
