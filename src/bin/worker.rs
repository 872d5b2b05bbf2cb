// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Parser;

use drover_lib::launch::{self, Cli};

/// The drover_worker binary launches workers that join a cluster scheduler,
/// optionally supervised by nanny processes.
fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("DROVER_LOG", "warn"))
        .init();

    let args = Cli::parse();

    if launch::main(args).is_err() {
        std::process::exit(1);
    }
}
