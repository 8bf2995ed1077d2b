// SPDX-License-Identifier: GPL-3.0-only

use anyhow::Result;
use tracing::{debug, info, level_filters::LevelFilter};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init_logger() -> Result<()> {
    let level = if cfg!(debug_assertions) {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let fmt_layer = fmt::layer().compact().with_writer(std::io::stderr);
    // not running under systemd is fine
    let journald_layer = tracing_journald::layer().ok();

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(journald_layer)
        .with(filter)
        .try_init()?;
    log_panics::init();

    info!("Version: {}", std::env!("CARGO_PKG_VERSION"));
    if cfg!(debug_assertions) {
        debug!(
            "Debug build ({})",
            std::option_env!("GIT_HASH").unwrap_or("Unknown")
        );
    }

    Ok(())
}
