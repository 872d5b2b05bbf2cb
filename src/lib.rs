// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

pub mod config;
pub mod drover_capnp;
pub mod http;
pub mod launch;
pub mod nanny;
pub mod test_env;
pub mod worker;

/// Gets the port the cluster scheduler is expected to listen on, used when
/// the scheduler address given on the command line does not name one.
pub fn default_scheduler_port() -> u16 {
    match std::env::var("DROVER_SCHEDULER_PORT") {
        Ok(port) => port
            .parse::<u16>()
            .expect("DROVER_SCHEDULER_PORT must be a valid port number"),
        Err(_) => 8786,
    }
}

pub fn default_local_directory() -> String {
    match std::env::var("DROVER_DIR") {
        Ok(dir) => dir,
        Err(_) => std::env::temp_dir()
            .join("drover")
            .to_string_lossy()
            .into_owned(),
    }
}

/// Total number of CPU cores visible to this process.
pub fn ncores() -> usize {
    match std::thread::available_parallelism() {
        Ok(n) => n.get(),
        Err(_) => 1,
    }
}
