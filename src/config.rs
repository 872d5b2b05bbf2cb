// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::launch::{handled_error, Cli, Handle, HandledResult};

/// FileConfig is the model for the optional launcher defaults file given
/// with `--config`. Every field is optional; a value from the command line
/// always wins over a value from the file, and built-in defaults apply last.
///
/// The file model is intentionally separate from the validated LaunchConfig
/// used at runtime, so the file format can evolve without touching the
/// launcher logic.
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct FileConfig {
    pub host: Option<String>,
    pub worker_port: Option<u16>,
    pub nanny_port: Option<u16>,
    pub http_port: Option<u16>,
    pub nthreads: Option<usize>,
    pub nprocs: Option<usize>,
    pub memory_limit: Option<String>,
    pub local_directory: Option<String>,
    pub resources: Option<String>,
    pub lifetime: Option<String>,
}

impl FileConfig {
    pub fn load(path: &str) -> HandledResult<Self> {
        let text = std::fs::read_to_string(path).handle_err(|e| {
            eprintln!("Could not open config file \"{path}\": {e}");
        })?;
        toml::from_str(&text).handle_err(|e| {
            eprintln!("Could not parse config file \"{path}\": {e}");
        })
    }
}

/// The validated, immutable set of launch options. Built once before any
/// instance is constructed; a validation failure exits the process instead.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Scheduler address, normalized to "host:port".
    pub scheduler: String,
    /// Host to bind and advertise. When absent, listeners bind the wildcard
    /// address and the advertised host is inferred from the scheduler route.
    pub host: Option<String>,
    pub worker_port: u16,
    pub nanny_port: u16,
    pub http_port: u16,
    /// Threads each worker advertises to the scheduler.
    pub nthreads: usize,
    /// Number of worker (or nanny) instances to launch.
    pub nprocs: usize,
    pub name: String,
    /// Memory limit resolved to bytes.
    pub memory_limit: u64,
    pub reconnect: bool,
    pub nanny: bool,
    pub pid_file: Option<String>,
    pub local_directory: String,
    pub temp_filename: Option<String>,
    pub resources: HashMap<String, f64>,
    /// Seconds until self-retirement, when configured.
    pub lifetime: Option<f64>,
}

impl LaunchConfig {
    pub fn from_cli(cli: &Cli) -> HandledResult<Self> {
        let file = match &cli.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::resolve(cli, file, crate::ncores(), total_memory()?)
    }

    /// Merge command-line options over file-provided defaults, apply the
    /// built-in defaults, and validate the result. The machine facts (core
    /// count, total memory) are passed in so tests can pin them.
    pub fn resolve(
        cli: &Cli,
        file: FileConfig,
        total_cores: usize,
        total_memory: u64,
    ) -> HandledResult<Self> {
        let worker_port = cli.worker_port.or(file.worker_port).unwrap_or(0);
        let nprocs = cli.nprocs.or(file.nprocs).unwrap_or(1);
        let name = cli.name.clone().unwrap_or_default();

        if nprocs == 0 {
            eprintln!("Failed to launch worker. --nprocs must be at least 1.");
            return handled_error();
        }
        if nprocs > 1 && worker_port != 0 {
            eprintln!(
                "Failed to launch worker. You cannot use the --worker-port \
                 argument when nprocs > 1."
            );
            return handled_error();
        }
        if nprocs > 1 && !name.is_empty() {
            eprintln!(
                "Failed to launch worker. You cannot use the --name argument \
                 when nprocs > 1."
            );
            return handled_error();
        }

        let nthreads = match cli.nthreads.or(file.nthreads) {
            Some(n) if n > 0 => n,
            _ => default_nthreads(total_cores, nprocs),
        };

        let resources = match cli.resources.as_ref().or(file.resources.as_ref()) {
            Some(spec) => parse_resources(spec)?,
            None => HashMap::new(),
        };

        let lifetime = match cli.lifetime.as_ref().or(file.lifetime.as_ref()) {
            Some(spec) => Some(parse_lifetime(spec)?),
            None => None,
        };

        let memory_spec = cli
            .memory_limit
            .as_deref()
            .or(file.memory_limit.as_deref())
            .unwrap_or("auto");
        let memory_limit = parse_memory_limit(memory_spec, total_memory)?;

        Ok(LaunchConfig {
            scheduler: normalize_scheduler(&cli.scheduler)?,
            host: cli.host.clone().or(file.host),
            worker_port,
            nanny_port: cli.nanny_port.or(file.nanny_port).unwrap_or(0),
            http_port: cli.http_port.or(file.http_port).unwrap_or(0),
            nthreads,
            nprocs,
            name,
            memory_limit,
            reconnect: !cli.no_reconnect,
            nanny: !cli.no_nanny,
            pid_file: cli.pid_file.clone(),
            local_directory: cli
                .local_directory
                .clone()
                .or(file.local_directory)
                .unwrap_or_else(crate::default_local_directory),
            temp_filename: cli.temp_filename.clone(),
            resources,
            lifetime,
        })
    }

    /// The port each instance binds: nannies listen on the nanny port and
    /// hand the worker port to their child, direct workers bind the worker
    /// port themselves.
    pub fn instance_port(&self) -> u16 {
        if self.nanny {
            self.nanny_port
        } else {
            self.worker_port
        }
    }
}

/// Threads per worker process when --nthreads is not given: the machine's
/// cores divided evenly among the processes. A zero quotient (more processes
/// than cores) is clamped to one thread.
pub fn default_nthreads(total_cores: usize, nprocs: usize) -> usize {
    std::cmp::max(total_cores / nprocs, 1)
}

/// Split a space- or comma-separated "KEY=VALUE KEY=VALUE" list into pairs
/// with float values. Returns None for any malformed token: a missing '=',
/// or a value that does not parse as a float.
fn parse_pairs(spec: &str) -> Option<Vec<(String, f64)>> {
    let mut pairs = Vec::new();
    for token in spec.replace(',', " ").split_whitespace() {
        let (key, value) = token.split_once('=')?;
        let value = value.parse::<f64>().ok()?;
        pairs.push((key.to_string(), value));
    }
    Some(pairs)
}

/// Parse a resource constraint list such as "GPU=2 MEM=10e9" into a map of
/// resource tags to capacities. Malformed tokens are a configuration error,
/// not a warning.
pub fn parse_resources(spec: &str) -> HandledResult<HashMap<String, f64>> {
    match parse_pairs(spec) {
        Some(pairs) => Ok(pairs.into_iter().collect()),
        None => {
            eprintln!(
                "Resource specifier not understood: \"{spec}\", \
                 expected e.g. \"GPU=2 MEM=10e9\"."
            );
            handled_error()
        }
    }
}

/// Seconds per lifetime unit key.
fn unit_seconds(key: &str) -> Option<f64> {
    Some(match key {
        "d" | "days" => 86400.0,
        "h" | "hours" => 3600.0,
        "m" | "mins" | "minutes" => 60.0,
        "s" | "secs" | "seconds" => 1.0,
        _ => return None,
    })
}

/// Parse a lifetime such as "d=2.5 h=12 m=45 s=59" into total seconds. An
/// unrecognized unit key or a malformed pair is a configuration error.
pub fn parse_lifetime(spec: &str) -> HandledResult<f64> {
    let total = parse_pairs(spec).and_then(|pairs| {
        pairs
            .iter()
            .map(|(key, value)| Some(unit_seconds(key)? * value))
            .sum::<Option<f64>>()
    });
    match total {
        Some(seconds) => Ok(seconds),
        None => {
            eprintln!(
                "Lifetime specifier not understood: \"{spec}\", \
                 expected e.g. \"d=2.5 h=12 m=45 s=59\"."
            );
            handled_error()
        }
    }
}

/// Parse a memory limit: an integer byte count, a float in (0, 1] taken as
/// a fraction of total memory, a larger float rounded to bytes, or "auto"
/// for the machine's total memory.
pub fn parse_memory_limit(spec: &str, total_memory: u64) -> HandledResult<u64> {
    if spec == "auto" {
        return Ok(total_memory);
    }
    if let Ok(bytes) = spec.parse::<u64>() {
        return Ok(bytes);
    }
    match spec.parse::<f64>() {
        Ok(fraction) if fraction > 0.0 && fraction <= 1.0 => {
            Ok((total_memory as f64 * fraction) as u64)
        }
        Ok(bytes) if bytes > 0.0 => Ok(bytes as u64),
        _ => {
            eprintln!(
                "Memory limit not understood: \"{spec}\", expected bytes, \
                 a fraction of total memory, or \"auto\"."
            );
            handled_error()
        }
    }
}

/// Normalize a scheduler address that may be of the form "host" or
/// "host:port", filling in the default scheduler port.
pub fn normalize_scheduler(addr: &str) -> HandledResult<String> {
    let mut split = addr.split(':');
    let host = split.next().unwrap_or("");
    if host.is_empty() {
        eprintln!("Scheduler address must not be empty.");
        return handled_error();
    }
    let port = match split.next() {
        Some(port) => port.parse::<u16>().handle_err(|e| {
            eprintln!("Invalid scheduler port in \"{addr}\": {e}");
        })?,
        None => crate::default_scheduler_port(),
    };
    Ok(format!("{host}:{port}"))
}

/// Total system memory in bytes, from /proc/meminfo.
pub fn total_memory() -> HandledResult<u64> {
    let text = std::fs::read_to_string("/proc/meminfo").handle_err(|e| {
        eprintln!("Could not read /proc/meminfo: {e}");
    })?;
    match parse_meminfo(&text) {
        Some(bytes) => Ok(bytes),
        None => {
            eprintln!("Could not find MemTotal in /proc/meminfo");
            handled_error()
        }
    }
}

fn parse_meminfo(text: &str) -> Option<u64> {
    let line = text.lines().find(|line| line.starts_with("MemTotal:"))?;
    let kb = line.split_whitespace().nth(1)?.parse::<u64>().ok()?;
    Some(kb * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launch::Cli;

    fn cli() -> Cli {
        Cli {
            scheduler: "127.0.0.1:8786".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn resources_space_separated() {
        let resources = parse_resources("GPU=2 MEM=10e9").unwrap();
        assert_eq!(resources.len(), 2);
        assert_eq!(resources["GPU"], 2.0);
        assert_eq!(resources["MEM"], 1e10);
    }

    #[test]
    fn resources_comma_separated() {
        assert_eq!(
            parse_resources("GPU=2,MEM=10e9").unwrap(),
            parse_resources("GPU=2 MEM=10e9").unwrap(),
        );
    }

    #[test]
    fn resources_malformed() {
        assert!(parse_resources("GPU").is_err());
        assert!(parse_resources("GPU=two").is_err());
        assert!(parse_resources("GPU=2 MEM").is_err());
    }

    #[test]
    fn lifetime_sums_units() {
        assert_eq!(parse_lifetime("d=1 h=2 m=3 s=4").unwrap(), 93784.0);
        assert_eq!(parse_lifetime("d=1,h=2,m=3,s=4").unwrap(), 93784.0);
        assert_eq!(parse_lifetime("d=2.5").unwrap(), 216000.0);
        assert_eq!(parse_lifetime("days=1 secs=30").unwrap(), 86430.0);
    }

    #[test]
    fn lifetime_rejects_unknown_unit() {
        assert!(parse_lifetime("x=5").is_err());
        assert!(parse_lifetime("h=one").is_err());
        assert!(parse_lifetime("h").is_err());
    }

    #[test]
    fn nthreads_divides_cores() {
        assert_eq!(default_nthreads(8, 2), 4);
        assert_eq!(default_nthreads(8, 3), 2);
        // More processes than cores still yields a usable thread count.
        assert_eq!(default_nthreads(2, 4), 1);
    }

    #[test]
    fn nthreads_default_applied_on_resolve() {
        let mut cli = cli();
        cli.nprocs = Some(2);
        let config = LaunchConfig::resolve(&cli, FileConfig::default(), 8, 1 << 30).unwrap();
        assert_eq!(config.nthreads, 4);
    }

    #[test]
    fn memory_limit_forms() {
        let total = 8 << 30;
        assert_eq!(parse_memory_limit("auto", total).unwrap(), total);
        assert_eq!(
            parse_memory_limit("1000000000", total).unwrap(),
            1_000_000_000
        );
        assert_eq!(parse_memory_limit("0.5", total).unwrap(), total / 2);
        assert_eq!(parse_memory_limit("10e9", total).unwrap(), 10_000_000_000);
        assert!(parse_memory_limit("lots", total).is_err());
        assert!(parse_memory_limit("-1.5", total).is_err());
    }

    #[test]
    fn nprocs_rejects_explicit_port() {
        let mut cli = cli();
        cli.nprocs = Some(2);
        cli.worker_port = Some(8000);
        assert!(LaunchConfig::resolve(&cli, FileConfig::default(), 8, 1 << 30).is_err());
    }

    #[test]
    fn nprocs_rejects_explicit_name() {
        let mut cli = cli();
        cli.nprocs = Some(2);
        cli.name = Some("alias".to_string());
        assert!(LaunchConfig::resolve(&cli, FileConfig::default(), 8, 1 << 30).is_err());
    }

    #[test]
    fn resolve_defaults() {
        let config = LaunchConfig::resolve(&cli(), FileConfig::default(), 4, 1 << 30).unwrap();
        assert_eq!(config.scheduler, "127.0.0.1:8786");
        assert_eq!(config.worker_port, 0);
        assert_eq!(config.nprocs, 1);
        assert_eq!(config.nthreads, 4);
        assert!(config.nanny);
        assert!(config.reconnect);
        assert!(config.resources.is_empty());
        assert!(config.lifetime.is_none());
        assert_eq!(config.memory_limit, 1 << 30);
    }

    #[test]
    fn file_defaults_and_cli_precedence() {
        let file: FileConfig = toml::from_str(
            "worker_port = 9000\nlifetime = \"m=1\"\nresources = \"GPU=1\"",
        )
        .unwrap();
        let config = LaunchConfig::resolve(&cli(), file, 4, 1 << 30).unwrap();
        assert_eq!(config.worker_port, 9000);
        assert_eq!(config.lifetime, Some(60.0));
        assert_eq!(config.resources["GPU"], 1.0);

        let mut cli = cli();
        cli.worker_port = Some(7000);
        let file: FileConfig = toml::from_str("worker_port = 9000").unwrap();
        let config = LaunchConfig::resolve(&cli, file, 4, 1 << 30).unwrap();
        assert_eq!(config.worker_port, 7000);
    }

    #[test]
    fn scheduler_normalization() {
        assert_eq!(normalize_scheduler("10.0.0.1:9000").unwrap(), "10.0.0.1:9000");
        assert_eq!(normalize_scheduler("10.0.0.1").unwrap(), "10.0.0.1:8786");
        assert!(normalize_scheduler("10.0.0.1:eight").is_err());
        assert!(normalize_scheduler("").is_err());
    }

    #[test]
    fn meminfo_total() {
        let text = "MemTotal:       16384000 kB\nMemFree:         1024 kB\n";
        assert_eq!(parse_meminfo(text), Some(16384000 * 1024));
        assert_eq!(parse_meminfo("MemFree: 12 kB\n"), None);
    }

    #[test]
    fn instance_port_follows_mode() {
        let mut cli = cli();
        cli.nanny_port = Some(7001);
        cli.worker_port = Some(7002);
        let config = LaunchConfig::resolve(&cli, FileConfig::default(), 4, 1 << 30).unwrap();
        assert_eq!(config.instance_port(), 7001);

        cli.no_nanny = true;
        let config = LaunchConfig::resolve(&cli, FileConfig::default(), 4, 1 << 30).unwrap();
        assert_eq!(config.instance_port(), 7002);
    }
}
