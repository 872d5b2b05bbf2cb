// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    process::{Child, Command},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use {
    log::{info, warn},
    nix::{
        sys::signal::{kill, Signal},
        unistd::Pid,
    },
};

use crate::{
    config::LaunchConfig,
    drover_capnp,
    launch::{handled_error, Handle, HandledResult, ReadyMsg},
    worker::InstanceStatus,
};

/// Upper bound on waiting for a spawned worker process to report ready.
const START_TIMEOUT: Duration = Duration::from_secs(60);

/// Name of the readiness file the supervised worker writes into its working
/// directory, which is how the nanny learns the child's bound port.
const READY_FILENAME: &str = "worker.ready";

/// Supervises a worker running in a child process: spawns it, watches for
/// crashes, restarts it, and tears it down on shutdown.
///
/// The worker child is this same launcher binary run with --no-nanny against
/// a private working directory under the configured local directory.
#[derive(Debug)]
pub struct Nanny {
    config: LaunchConfig,
    worker_dir: PathBuf,
    status: Mutex<InstanceStatus>,
    port: Mutex<Option<u16>>,
    child: Mutex<Option<Child>>,
    worker_address: Mutex<Option<String>>,
    stopping: AtomicBool,
}

impl Nanny {
    pub fn new(config: &LaunchConfig, index: usize) -> Self {
        let worker_dir = Path::new(&config.local_directory)
            .join(format!("worker-{}-{index}", std::process::id()));
        Nanny {
            config: config.clone(),
            worker_dir,
            status: Mutex::new(InstanceStatus::NotStarted),
            port: Mutex::new(None),
            child: Mutex::new(None),
            worker_address: Mutex::new(None),
            stopping: AtomicBool::new(false),
        }
    }

    /// Bind the nanny listener on `host`:`port` (port 0 picks a free one),
    /// spawn the supervised worker process, and wait for it to report in.
    /// The nanny is Running once its worker is.
    pub async fn start(nanny: &Arc<Nanny>, host: Option<&str>, port: u16) -> HandledResult<()> {
        let bind_host = host.unwrap_or("0.0.0.0");

        let listener = tokio::net::TcpListener::bind((bind_host, port))
            .await
            .handle_err(|e| {
                eprintln!("Could not bind nanny listener on {bind_host}:{port}: {e}");
            })?;
        let bound = listener
            .local_addr()
            .handle_err(|e| eprintln!("Could not read bound nanny address: {e}"))?;
        *nanny.port.lock().unwrap() = Some(bound.port());

        std::fs::create_dir_all(&nanny.worker_dir).handle_err(|e| {
            eprintln!(
                "Could not create worker directory \"{}\": {e}",
                nanny.worker_dir.display()
            );
        })?;

        let client: drover_capnp::worker::Client =
            capnp_rpc::new_client(drover_capnp::WorkerImpl {});
        tokio::task::spawn_local(drover_capnp::serve(listener, client.clone().client));

        nanny.spawn_worker()?;

        let msg = wait_for_ready(&nanny.ready_path(), START_TIMEOUT).await?;
        nanny.record_worker(&msg);
        nanny.set_status(InstanceStatus::Running);
        info!(
            "nanny on port {} supervising worker at {} in {}",
            bound.port(),
            nanny.worker_address().unwrap_or_default(),
            nanny.worker_dir.display()
        );

        tokio::task::spawn_local(Self::monitor_loop(Arc::clone(nanny)));

        Ok(())
    }

    /// Spawn (or respawn) the supervised worker process. Any previous
    /// readiness file is removed first so a stale one cannot be read as the
    /// new worker's.
    fn spawn_worker(&self) -> HandledResult<()> {
        let exe = std::env::current_exe()
            .handle_err(|e| eprintln!("Could not locate the worker binary: {e}"))?;
        let ready = self.ready_path();
        let _ = std::fs::remove_file(&ready);

        let mut command = Command::new(exe);
        command
            .arg(&self.config.scheduler)
            .arg("--no-nanny")
            .arg("--worker-port")
            .arg(self.config.worker_port.to_string())
            .arg("--http-port")
            .arg(self.config.http_port.to_string())
            .arg("--nthreads")
            .arg(self.config.nthreads.to_string())
            .arg("--memory-limit")
            .arg(self.config.memory_limit.to_string())
            .arg("--local-directory")
            .arg(&self.worker_dir)
            .arg("--temp-filename")
            .arg(&ready);
        if let Some(host) = &self.config.host {
            command.arg("--host").arg(host);
        }
        if !self.config.name.is_empty() {
            command.arg("--name").arg(&self.config.name);
        }
        if !self.config.resources.is_empty() {
            command
                .arg("--resources")
                .arg(resource_spec(&self.config.resources));
        }
        if !self.config.reconnect {
            command.arg("--no-reconnect");
        }

        let child = command
            .spawn()
            .handle_err(|e| eprintln!("Could not spawn worker process: {e}"))?;
        *self.child.lock().unwrap() = Some(child);

        Ok(())
    }

    /// Watch the supervised process and restart it if it dies while the
    /// nanny is not stopping.
    async fn monitor_loop(nanny: Arc<Nanny>) {
        loop {
            tokio::time::sleep(Duration::from_millis(500)).await;
            if nanny.stopping.load(Ordering::Relaxed)
                || nanny.status() == InstanceStatus::Closed
            {
                return;
            }
            if nanny.is_alive() {
                continue;
            }

            warn!("worker process died, restarting");
            *nanny.worker_address.lock().unwrap() = None;
            if nanny.spawn_worker().is_err() {
                eprintln!("Could not restart worker process; closing nanny");
                nanny.set_status(InstanceStatus::Closed);
                return;
            }
            match wait_for_ready(&nanny.ready_path(), START_TIMEOUT).await {
                Ok(msg) => nanny.record_worker(&msg),
                Err(_) => {
                    nanny.set_status(InstanceStatus::Closed);
                    return;
                }
            }
        }
    }

    fn record_worker(&self, msg: &ReadyMsg) {
        let host = match &self.config.host {
            Some(host) => host.clone(),
            None => crate::worker::infer_host(&self.config.scheduler),
        };
        *self.worker_address.lock().unwrap() = Some(format!("{host}:{}", msg.port));
    }

    fn ready_path(&self) -> PathBuf {
        self.worker_dir.join(READY_FILENAME)
    }

    /// Whether the supervised process is currently alive. A process that has
    /// exited but not yet been reaped counts as dead.
    pub fn is_alive(&self) -> bool {
        match self.child.lock().unwrap().as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Ask the supervised process to shut down (SIGTERM). The worker child
    /// runs the same orderly teardown this launcher does.
    pub fn terminate(&self) {
        if let Some(child) = self.child.lock().unwrap().as_ref() {
            let _ = kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM);
        }
    }

    /// Final teardown: kill the child if it is still alive, reap it, and
    /// remove the working directory. Cleanup failures are not fatal.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Relaxed);
        if let Some(mut child) = self.child.lock().unwrap().take() {
            if matches!(child.try_wait(), Ok(None)) {
                let _ = child.kill();
            }
            let _ = child.wait();
        }
        let _ = std::fs::remove_dir_all(&self.worker_dir);
        self.set_status(InstanceStatus::Closed);
    }

    pub fn status(&self) -> InstanceStatus {
        *self.status.lock().unwrap()
    }

    pub fn set_status(&self, status: InstanceStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub fn port(&self) -> Option<u16> {
        *self.port.lock().unwrap()
    }

    pub fn worker_dir(&self) -> &Path {
        &self.worker_dir
    }

    /// The supervised worker's advertised address, when the child process is
    /// alive and has reported in.
    pub fn worker_address(&self) -> Option<String> {
        if !self.is_alive() {
            return None;
        }
        self.worker_address.lock().unwrap().clone()
    }
}

/// Render a resource map back into the "KEY=VALUE KEY=VALUE" command-line
/// form, in a predictable order, for handing down to the worker child.
fn resource_spec(resources: &HashMap<String, f64>) -> String {
    let mut entries: Vec<(&String, &f64)> = resources.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<String>>()
        .join(" ")
}

/// Poll for the worker's readiness file and parse it. The write is not
/// atomic with respect to this poll; an unreadable or partial file just
/// means we look again.
async fn wait_for_ready(path: &Path, timeout: Duration) -> HandledResult<ReadyMsg> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(text) = std::fs::read_to_string(path) {
            if let Ok(msg) = serde_json::from_str::<ReadyMsg>(&text) {
                return Ok(msg);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            eprintln!(
                "Worker process did not report ready within {}s",
                timeout.as_secs()
            );
            return handled_error();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launch::Cli;

    fn test_config() -> LaunchConfig {
        let cli = Cli {
            scheduler: "127.0.0.1:8786".to_string(),
            ..Default::default()
        };
        LaunchConfig::resolve(&cli, Default::default(), 4, 1 << 30).unwrap()
    }

    #[test]
    fn resource_spec_is_sorted() {
        let resources: HashMap<String, f64> =
            [("MEM".to_string(), 1e10), ("GPU".to_string(), 2.0)]
                .into_iter()
                .collect();
        assert_eq!(resource_spec(&resources), "GPU=2 MEM=10000000000");
    }

    #[test]
    fn unstarted_nanny_has_no_worker() {
        let nanny = Nanny::new(&test_config(), 0);
        assert_eq!(nanny.status(), InstanceStatus::NotStarted);
        assert!(!nanny.is_alive());
        assert_eq!(nanny.worker_address(), None);
    }

    #[test]
    fn worker_dirs_are_distinct_per_index() {
        let config = test_config();
        let first = Nanny::new(&config, 0);
        let second = Nanny::new(&config, 1);
        assert_ne!(first.worker_dir(), second.worker_dir());
    }
}
