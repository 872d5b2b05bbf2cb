// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! launch.rs
//!
//! The worker launcher: validates options, starts N worker-or-nanny
//! instances on a single-threaded event loop, waits for an instance to
//! close, a configured lifetime to expire, or a termination signal, and
//! then runs the orderly teardown sequence.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use {
    clap::Parser,
    futures::future,
    log::info,
    serde::{Deserialize, Serialize},
    tokio::signal::unix::{signal, SignalKind},
};

use crate::{
    config::LaunchConfig,
    drover_capnp,
    nanny::Nanny,
    worker::{InstanceStatus, Worker},
};

/// How long the teardown path waits for the scheduler to acknowledge
/// unregistration before giving up and force-terminating children.
const UNREGISTER_TIMEOUT: Duration = Duration::from_secs(2);

/// How long to wait for terminated children to actually exit, so they are
/// not left as zombies, without blocking shutdown indefinitely.
const REAP_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper bound on waiting for the first instance to come up before the
/// readiness file write is abandoned.
const READY_TIMEOUT: Duration = Duration::from_secs(60);

/// A `HandledError` represents an error that has already been handled. When
/// you call a function that returns a `HandledError` or `HandledResult`, you
/// don't need to do anything with that error, other than just be aware that
/// it happened, and return it on to your caller.
///
/// `main()` has a special responsibility: since its "caller" is, in a
/// certain sense, the operating system, `main()` must return a nonzero exit
/// status when it gets a `HandledError`.
///
/// The primary way to construct a `HandledError` is with the `handle_err()`
/// function, which turns a generic error into a `HandledError`, and also
/// runs some caller-provided code to handle the error. That provided code
/// would normally do something like report the error to stderr.
#[derive(Debug, PartialEq)]
pub struct HandledError {}

pub type HandledResult<T> = std::result::Result<T, HandledError>;

pub fn handled_error<T>() -> HandledResult<T> {
    HandledResult::Err(HandledError {})
}

pub trait Handle<T, F> {
    fn handle_err(self, handler: F) -> HandledResult<T>;
}

impl<T, E, F: FnOnce(E)> Handle<T, F> for std::result::Result<T, E> {
    /// Handle an error by running the provided `handler` code, giving it the
    /// error.
    ///
    /// Then, return a `HandledResult`, so that transitive callers of this
    /// function know that they do not need to do anything further to handle
    /// the error.
    fn handle_err(self, handler: F) -> HandledResult<T> {
        self.map_err(|e| {
            handler(e);
            HandledError {}
        })
    }
}

#[derive(Parser, Debug, Default)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Address of the cluster scheduler, as HOST[:PORT].
    pub scheduler: String,

    /// Serving worker port; defaults to a randomly assigned port.
    #[arg(long)]
    pub worker_port: Option<u16>,

    /// Serving HTTP status port; defaults to a randomly assigned port.
    #[arg(long)]
    pub http_port: Option<u16>,

    /// Serving nanny port; defaults to a randomly assigned port.
    #[arg(long)]
    pub nanny_port: Option<u16>,

    /// Serving host. Defaults to an address that should be visible from the
    /// scheduler network.
    #[arg(long)]
    pub host: Option<String>,

    /// Number of threads per process. Defaults to number of cores divided by
    /// the number of processes.
    #[arg(long)]
    pub nthreads: Option<usize>,

    /// Number of worker processes. Defaults to one.
    #[arg(long)]
    pub nprocs: Option<usize>,

    /// Alias. Cannot be used when nprocs > 1.
    #[arg(long)]
    pub name: Option<String>,

    /// Number of bytes before spilling data to disk: an integer (bytes), a
    /// float (fraction of total memory), or "auto".
    #[arg(long)]
    pub memory_limit: Option<String>,

    /// Do not try to reconnect to the scheduler if disconnected.
    #[arg(long)]
    pub no_reconnect: bool,

    /// Start the worker directly instead of under a nanny process.
    #[arg(long)]
    pub no_nanny: bool,

    /// File to write the process PID.
    #[arg(long)]
    pub pid_file: Option<String>,

    /// Directory to place worker files.
    #[arg(long)]
    pub local_directory: Option<String>,

    /// Internal use only: file that receives a readiness record once the
    /// first instance is running.
    #[arg(long, hide = true)]
    pub temp_filename: Option<String>,

    /// Resources for task constraints, like "GPU=2 MEM=10e9".
    #[arg(long)]
    pub resources: Option<String>,

    /// Lifetime of the worker before it should retire itself, specified
    /// e.g. "d=2.5 h=12 m=45 s=59" for days, hours, minutes, and seconds.
    #[arg(long)]
    pub lifetime: Option<String>,

    /// Optional TOML file supplying defaults for the other options.
    #[arg(long)]
    pub config: Option<String>,
}

/// One launched instance: either the calling process is itself the worker,
/// or a nanny supervises the worker in a child process.
#[derive(Debug, Clone)]
pub enum Instance {
    Direct(Arc<Worker>),
    Supervised(Arc<Nanny>),
}

impl Instance {
    pub async fn start(&self, config: &LaunchConfig) -> HandledResult<()> {
        let host = config.host.as_deref();
        let port = config.instance_port();
        match self {
            Instance::Direct(worker) => Worker::start(worker, host, port).await,
            Instance::Supervised(nanny) => Nanny::start(nanny, host, port).await,
        }
    }

    pub fn status(&self) -> InstanceStatus {
        match self {
            Instance::Direct(worker) => worker.status(),
            Instance::Supervised(nanny) => nanny.status(),
        }
    }

    /// The port this instance itself is bound to, once started.
    pub fn port(&self) -> Option<u16> {
        match self {
            Instance::Direct(worker) => worker.port(),
            Instance::Supervised(nanny) => nanny.port(),
        }
    }

    pub fn local_directory(&self) -> String {
        match self {
            Instance::Direct(worker) => worker.local_directory().to_string(),
            Instance::Supervised(nanny) => nanny.worker_dir().display().to_string(),
        }
    }

    /// The address of the worker behind this instance, as advertised to the
    /// scheduler. For a supervised instance this is known only while the
    /// child process is alive and has reported in.
    pub fn worker_address(&self) -> Option<String> {
        match self {
            Instance::Direct(worker) => worker.address(),
            Instance::Supervised(nanny) => nanny.worker_address(),
        }
    }

    pub fn stop(&self) {
        match self {
            Instance::Direct(worker) => worker.stop(),
            Instance::Supervised(nanny) => nanny.stop(),
        }
    }
}

/// The readiness record written to `--temp-filename` once the first
/// instance is running: enough for parent tooling to find the worker.
#[derive(Serialize, Deserialize, Debug)]
pub struct ReadyMsg {
    pub port: u16,
    pub local_directory: String,
}

/// Writes the process PID to a file on creation and removes the file again
/// when dropped, covering every orderly exit path.
struct PidFile {
    path: String,
}

impl PidFile {
    fn create(path: &str) -> HandledResult<Self> {
        std::fs::write(path, std::process::id().to_string()).handle_err(|e| {
            eprintln!("Could not write pid file \"{path}\": {e}");
        })?;
        Ok(PidFile {
            path: path.to_string(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Main entrypoint for the worker launcher.
///
/// Runs the instances on a current-thread runtime until the wait loop exits
/// (instance closure, retirement, or a signal), then performs the teardown
/// sequence: unregister with the scheduler on a fresh runtime, terminate and
/// reap child processes, release local resources.
pub fn main(cli: Cli) -> HandledResult<()> {
    let config = LaunchConfig::from_cli(&cli)?;

    let _pid_file = match &config.pid_file {
        Some(path) => Some(PidFile::create(path)?),
        None => None,
    };

    std::fs::create_dir_all(&config.local_directory).handle_err(|e| {
        eprintln!(
            "Could not create local directory \"{}\": {e}",
            config.local_directory
        );
    })?;

    let instances = build_instances(&config);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .handle_err(|e| eprintln!("Could not launch worker runtime: {e}"))?;

    let outcome = rt.block_on(
        tokio::task::LocalSet::new().run_until(run(&config, &instances)),
    );

    info!("End worker");
    // The primary loop may be in an unusable state after an interrupted run;
    // teardown gets a fresh one.
    drop(rt);

    teardown(&config, &instances);

    outcome
}

fn build_instances(config: &LaunchConfig) -> Vec<Instance> {
    (0..config.nprocs)
        .map(|index| {
            if config.nanny {
                Instance::Supervised(Arc::new(Nanny::new(config, index)))
            } else {
                Instance::Direct(Arc::new(Worker::new(config)))
            }
        })
        .collect()
}

/// Start every instance, arm the optional retirement timer and readiness
/// write, and block until the wait loop exits or a signal arrives.
async fn run(config: &LaunchConfig, instances: &[Instance]) -> HandledResult<()> {
    // Install the signal streams before anything is started, so an early
    // signal still runs the cleanup path.
    let mut sigint = signal(SignalKind::interrupt())
        .handle_err(|e| eprintln!("Could not install SIGINT handler: {e}"))?;
    let mut sigterm = signal(SignalKind::terminate())
        .handle_err(|e| eprintln!("Could not install SIGTERM handler: {e}"))?;

    for instance in instances {
        instance.start(config).await?;
    }

    if let Some(path) = &config.temp_filename {
        tokio::task::spawn_local(write_ready_file(path.clone(), instances[0].clone()));
    }

    let retired = Arc::new(AtomicBool::new(false));
    if let Some(lifetime) = config.lifetime {
        tokio::task::spawn_local(retire_after(
            lifetime,
            config.scheduler.clone(),
            instances.to_vec(),
            Arc::clone(&retired),
        ));
    }

    tokio::select! {
        _ = wait_for_exit(instances, &retired) => {}
        _ = sigint.recv() => signal_cleanup(instances),
        _ = sigterm.recv() => signal_cleanup(instances),
    }

    Ok(())
}

/// Block until any instance reaches Closed or the retirement flag is set.
async fn wait_for_exit(instances: &[Instance], retired: &AtomicBool) {
    while instances
        .iter()
        .all(|instance| instance.status() != InstanceStatus::Closed)
        && !retired.load(Ordering::Relaxed)
    {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

/// Best-effort removal of each supervised instance's working directory on
/// the signal path. Cleanup must never prevent shutdown, so every failure
/// here is swallowed.
fn signal_cleanup(instances: &[Instance]) {
    for instance in instances {
        if let Instance::Supervised(nanny) = instance {
            let _ = std::fs::remove_dir_all(nanny.worker_dir());
        }
    }
}

/// Wait for the first instance to come up, then write the readiness record
/// for parent tooling to discover the bound port. Written exactly once,
/// after confirmed readiness.
async fn write_ready_file(path: String, instance: Instance) {
    let deadline = tokio::time::Instant::now() + READY_TIMEOUT;
    while instance.status() != InstanceStatus::Running {
        if tokio::time::Instant::now() >= deadline {
            log::warn!(
                "first instance not running after {}s, not writing \"{path}\"",
                READY_TIMEOUT.as_secs()
            );
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let msg = ReadyMsg {
        port: instance.port().unwrap_or(0),
        local_directory: instance.local_directory(),
    };
    let text = serde_json::to_string(&msg).expect("readiness record serialization");
    if let Err(e) = std::fs::write(&path, text) {
        eprintln!("Could not write ready file \"{path}\": {e}");
    }
}

/// The self-retirement timer. After `lifetime_secs`, ask the scheduler to
/// retire the live workers without removing them from its bookkeeping, then
/// set the shared flag that breaks the main wait loop.
async fn retire_after(
    lifetime_secs: f64,
    scheduler_addr: String,
    instances: Vec<Instance>,
    retired: Arc<AtomicBool>,
) {
    tokio::time::sleep(Duration::from_secs_f64(lifetime_secs)).await;

    info!("Retiring worker...");
    let workers: Vec<String> = instances
        .iter()
        .filter_map(|instance| instance.worker_address())
        .collect();
    if let Err(e) = drover_capnp::retire_workers(&scheduler_addr, &workers, false).await {
        eprintln!("Could not retire workers with scheduler at {scheduler_addr}: {e:?}");
    }
    retired.store(true, Ordering::Relaxed);
    info!("Worker retired");
}

/// The post-loop shutdown sequence, entered exactly once no matter what
/// broke the wait loop.
fn teardown(config: &LaunchConfig, instances: &[Instance]) {
    if let Ok(rt) = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        rt.block_on(
            tokio::task::LocalSet::new().run_until(unregister_workers(config, instances)),
        );
    }

    if config.nanny {
        for instance in instances {
            if let Instance::Supervised(nanny) = instance {
                if nanny.is_alive() {
                    nanny.terminate();
                }
            }
        }

        let start = std::time::Instant::now();
        while instances
            .iter()
            .any(|instance| matches!(instance, Instance::Supervised(n) if n.is_alive()))
            && start.elapsed() < REAP_TIMEOUT
        {
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    for instance in instances {
        instance.stop();
    }
}

/// Unregister every supervised worker from the scheduler, in parallel over
/// one connection, bounded by a short timeout. A slow or unreachable
/// scheduler must not block shutdown, so both connection failure and the
/// timeout are swallowed.
async fn unregister_workers(config: &LaunchConfig, instances: &[Instance]) {
    if !config.nanny {
        return;
    }

    let Ok(sched) = drover_capnp::connect(&config.scheduler).await else {
        return;
    };

    let requests: Vec<_> = instances
        .iter()
        .filter_map(|instance| instance.worker_address())
        .map(|address| drover_capnp::unregister_given_client(&sched, address, true))
        .collect();

    let _ = tokio::time::timeout(UNREGISTER_TIMEOUT, future::join_all(requests)).await;
}
