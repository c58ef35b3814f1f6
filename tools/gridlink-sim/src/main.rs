// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gridlink.dev

//! gridlink-sim - standalone simulation bridge server.
//!
//! Usage: `gridlink-sim <table-xml> <port>`
//!
//! Serves the RST/GET/SET/QUIT protocol over the state and command tables
//! defined by the XML specification, until SIGINT or SIGTERM.

use std::time::Duration;

use gridlink::bridge::SimulationBridge;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let (xml_path, port) = match (args.get(1), args.get(2).and_then(|p| p.parse::<u16>().ok())) {
        (Some(path), Some(port)) => (path.clone(), port),
        _ => {
            eprintln!("usage: gridlink-sim <table-xml> <port>");
            std::process::exit(1);
        }
    };

    gridlink::logging::init(2);

    let xml = match std::fs::read_to_string(&xml_path) {
        Ok(xml) => xml,
        Err(err) => {
            eprintln!("gridlink-sim: cannot read {}: {}", xml_path, err);
            std::process::exit(1);
        }
    };
    let bridge = match SimulationBridge::from_xml(&xml) {
        Ok(bridge) => bridge,
        Err(err) => {
            eprintln!("gridlink-sim: bad table spec: {}", err);
            std::process::exit(1);
        }
    };

    let addr = match format!("0.0.0.0:{}", port).parse() {
        Ok(addr) => addr,
        Err(err) => {
            eprintln!("gridlink-sim: bad port {}: {}", port, err);
            std::process::exit(1);
        }
    };
    if let Err(err) = bridge.start(addr) {
        log::error!("startup failed: {}", err);
        std::process::exit(1);
    }
    log::info!(
        "gridlink-sim serving {} state / {} command values on port {}",
        bridge.state_table().size(),
        bridge.command_table().size(),
        port
    );

    gridlink::broker::install_signal_watch();
    loop {
        if let Some(signum) = gridlink::broker::take_signal() {
            log::info!("gridlink-sim stopped (signal {})", signum);
            bridge.stop();
            return;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}
