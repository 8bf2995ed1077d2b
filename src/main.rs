// SPDX-License-Identifier: GPL-3.0-only

use calloop::EventLoop;

use anyhow::{Context, Result};
use state::State;
use std::{path::PathBuf, process};
use tracing::{error, info};

use clap_lex::RawArgs;

pub mod backend;
pub mod config;
mod logger;
pub mod state;
pub mod utils;

#[cfg(feature = "profile-with-tracy")]
#[global_allocator]
static GLOBAL: profiling::tracy_client::ProfiledAllocator<std::alloc::System> =
    profiling::tracy_client::ProfiledAllocator::new(std::alloc::System, 10);

fn main() {
    if let Err(err) = main_inner() {
        error!("Error occured in main(): {:?}", err);
        process::exit(1);
    }
}

fn main_inner() -> Result<()> {
    let raw_args = RawArgs::from_args();
    let mut cursor = raw_args.cursor();
    let git_hash = option_env!("GIT_HASH").unwrap_or("unknown");
    let mut device = None;

    // Parse the arguments
    while let Some(arg) = raw_args.next_os(&mut cursor) {
        match arg.to_str() {
            Some("--help") | Some("-h") => {
                print_help(env!("CARGO_PKG_VERSION"), git_hash);
                return Ok(());
            }
            Some("--version") | Some("-V") => {
                println!(
                    "scanout {} (git commit {})",
                    env!("CARGO_PKG_VERSION"),
                    git_hash
                );
                return Ok(());
            }
            Some("--device") | Some("-d") => {
                let path = raw_args
                    .next_os(&mut cursor)
                    .context("--device needs a path")?;
                device = Some(PathBuf::from(path));
            }
            _ => {}
        }
    }

    // setup logger
    logger::init_logger()?;
    info!("Scanout starting up!");

    profiling::register_thread!("Main Thread");
    #[cfg(feature = "profile-with-tracy")]
    tracy_client::Client::start();

    let config = config::Config::load(device);

    // init event loop
    let mut event_loop = EventLoop::try_new().context("Failed to initialize event loop")?;
    // init backend
    let backend = backend::kms::init_backend(&mut event_loop)?;
    // init state
    let mut state = State::new(
        config,
        backend,
        event_loop.handle(),
        event_loop.get_signal(),
    );
    state.add_present_devices();
    if state.backend.devices.is_empty() {
        info!("No usable gpu yet, waiting for one to show up");
    }

    // run the event loop
    event_loop.run(None, &mut state, |_| {})?;

    // drop eventloop & state before logger
    std::mem::drop(event_loop);
    std::mem::drop(state);

    Ok(())
}

fn print_help(version: &str, git_rev: &str) {
    println!(
        r#"scanout {version} (git commit {git_rev})

Drives the displays of the seat's gpus through atomic mode-setting.

Options:
  -d, --device <path>  Use this card as primary gpu
  -h, --help           Show this message
  -V, --version        Show the version of scanout"#
    );
}
