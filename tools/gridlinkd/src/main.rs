// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gridlink.dev

//! gridlinkd - the peer broker daemon.
//!
//! Usage: `gridlinkd [config-file]`
//!
//! Loads the key=value broker configuration (default `gridlink.cfg`),
//! builds the runtime context and runs the broker loop until SIGINT or
//! SIGTERM. Exit code 0 on clean shutdown, 1 on fatal startup error.

use gridlink::{BrokerConfig, Runtime};

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let config_path = args.get(1).map(String::as_str).unwrap_or("gridlink.cfg");

    let config = match BrokerConfig::from_file(config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("gridlinkd: cannot load {}: {}", config_path, err);
            std::process::exit(1);
        }
    };

    gridlink::logging::init(config.verbosity);
    log::info!(
        "gridlinkd {} starting as {} on {}:{}",
        gridlink::VERSION,
        config.uuid,
        config.listen_address,
        config.listen_port
    );

    let mut runtime = match Runtime::build(config) {
        Ok(runtime) => runtime,
        Err(err) => {
            log::error!("startup failed: {}", err);
            std::process::exit(1);
        }
    };

    gridlink::broker::install_signal_watch();
    let signum = runtime.run();
    log::info!("gridlinkd stopped (signal {})", signum);
}
