// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{
    collections::HashMap,
    net::UdpSocket,
    sync::{Arc, Mutex},
    time::Duration,
};

use log::info;

use crate::{
    config::LaunchConfig,
    drover_capnp::{self, WorkerInfo},
    http,
    launch::{handled_error, Handle, HandledResult},
};

/// How often a running worker re-registers with the scheduler as a liveness
/// heartbeat.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Lifecycle status of a worker or nanny instance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InstanceStatus {
    NotStarted,
    Running,
    Closed,
}

/// A worker that joins the cluster directly: the calling process binds the
/// listener and registers itself with the scheduler.
///
/// Task ingestion, execution, and memory spilling belong to the execution
/// engine and are not represented here; this type owns only the cluster
/// membership lifecycle.
#[derive(Debug)]
pub struct Worker {
    scheduler: String,
    name: String,
    nthreads: usize,
    memory_limit: u64,
    resources: HashMap<String, f64>,
    reconnect: bool,
    local_directory: String,
    http_port: u16,
    status: Mutex<InstanceStatus>,
    address: Mutex<Option<String>>,
    port: Mutex<Option<u16>>,
}

impl Worker {
    pub fn new(config: &LaunchConfig) -> Self {
        Worker {
            scheduler: config.scheduler.clone(),
            name: config.name.clone(),
            nthreads: config.nthreads,
            memory_limit: config.memory_limit,
            resources: config.resources.clone(),
            reconnect: config.reconnect,
            local_directory: config.local_directory.clone(),
            http_port: config.http_port,
            status: Mutex::new(InstanceStatus::NotStarted),
            address: Mutex::new(None),
            port: Mutex::new(None),
        }
    }

    /// Bind the worker listener on `host`:`port` (port 0 picks a free one),
    /// expose the RPC and HTTP services, and register with the scheduler.
    ///
    /// The worker is Running once its listener is bound and the scheduler
    /// has acknowledged the registration.
    pub async fn start(
        worker: &Arc<Worker>,
        host: Option<&str>,
        port: u16,
    ) -> HandledResult<()> {
        let bind_host = host.unwrap_or("0.0.0.0");

        let listener = tokio::net::TcpListener::bind((bind_host, port))
            .await
            .handle_err(|e| {
                eprintln!("Could not bind worker listener on {bind_host}:{port}: {e}");
            })?;
        let bound = listener
            .local_addr()
            .handle_err(|e| eprintln!("Could not read bound worker address: {e}"))?;

        let advertised_host = match host {
            Some(host) => host.to_string(),
            None => infer_host(&worker.scheduler),
        };
        let address = format!("{advertised_host}:{}", bound.port());
        *worker.address.lock().unwrap() = Some(address.clone());
        *worker.port.lock().unwrap() = Some(bound.port());

        let client: drover_capnp::worker::Client =
            capnp_rpc::new_client(drover_capnp::WorkerImpl {});
        tokio::task::spawn_local(drover_capnp::serve(listener, client.clone().client));

        let http_listener = tokio::net::TcpListener::bind((bind_host, worker.http_port))
            .await
            .handle_err(|e| {
                eprintln!(
                    "Could not bind HTTP status listener on {bind_host}:{}: {e}",
                    worker.http_port
                );
            })?;
        tokio::task::spawn_local(http::server_main(http_listener, Arc::clone(worker)));

        match drover_capnp::register_worker(&worker.scheduler, &worker.info()).await {
            Ok(true) => {}
            Ok(false) => {
                eprintln!(
                    "Scheduler at {} refused worker registration",
                    worker.scheduler
                );
                return handled_error();
            }
            Err(e) => {
                eprintln!(
                    "Could not register with scheduler at {}: {e:?}",
                    worker.scheduler
                );
                return handled_error();
            }
        }

        info!("worker {address} registered with scheduler {}", worker.scheduler);
        worker.set_status(InstanceStatus::Running);

        tokio::task::spawn_local(Self::heartbeat_loop(Arc::clone(worker)));

        Ok(())
    }

    /// Periodically re-register with the scheduler. On failure the worker
    /// either keeps trying (reconnect) or closes, which in turn ends the
    /// launcher's wait loop.
    async fn heartbeat_loop(worker: Arc<Worker>) {
        loop {
            tokio::time::sleep(HEARTBEAT_INTERVAL).await;
            if worker.status() != InstanceStatus::Running {
                return;
            }
            match drover_capnp::register_worker(&worker.scheduler, &worker.info()).await {
                Ok(_) => {}
                Err(e) => {
                    if worker.reconnect {
                        log::warn!(
                            "lost scheduler at {}: {e:?}; will keep trying",
                            worker.scheduler
                        );
                    } else {
                        eprintln!(
                            "Lost connection to scheduler at {}: {e:?}",
                            worker.scheduler
                        );
                        worker.set_status(InstanceStatus::Closed);
                        return;
                    }
                }
            }
        }
    }

    /// What this worker advertises to the scheduler. Resources are sorted so
    /// that registrations are deterministic.
    fn info(&self) -> WorkerInfo {
        let mut resources: Vec<(String, f64)> = self
            .resources
            .iter()
            .map(|(key, value)| (key.clone(), *value))
            .collect();
        resources.sort_by(|a, b| a.0.cmp(&b.0));

        WorkerInfo {
            address: self.address().unwrap_or_default(),
            ncores: self.nthreads as u32,
            name: self.name.clone(),
            memory_limit: self.memory_limit,
            resources,
        }
    }

    pub fn status(&self) -> InstanceStatus {
        *self.status.lock().unwrap()
    }

    pub fn set_status(&self, status: InstanceStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub fn address(&self) -> Option<String> {
        self.address.lock().unwrap().clone()
    }

    pub fn port(&self) -> Option<u16> {
        *self.port.lock().unwrap()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nthreads(&self) -> usize {
        self.nthreads
    }

    pub fn memory_limit(&self) -> u64 {
        self.memory_limit
    }

    pub fn resources(&self) -> &HashMap<String, f64> {
        &self.resources
    }

    pub fn local_directory(&self) -> &str {
        &self.local_directory
    }

    /// Release local resources. The listener tasks die with the runtime, so
    /// stopping only has to advance the lifecycle.
    pub fn stop(&self) {
        self.set_status(InstanceStatus::Closed);
    }
}

/// Pick the local address to advertise to the scheduler: the source address
/// the OS would route to it from. Falls back to loopback.
pub fn infer_host(scheduler: &str) -> String {
    let inferred = UdpSocket::bind("0.0.0.0:0").and_then(|socket| {
        socket.connect(scheduler)?;
        socket.local_addr()
    });
    match inferred {
        Ok(addr) => addr.ip().to_string(),
        Err(_) => "127.0.0.1".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::LaunchConfig, launch::Cli};

    fn test_config() -> LaunchConfig {
        let cli = Cli {
            scheduler: "127.0.0.1:8786".to_string(),
            ..Default::default()
        };
        LaunchConfig::resolve(&cli, Default::default(), 4, 1 << 30).unwrap()
    }

    #[test]
    fn starts_unstarted() {
        let worker = Worker::new(&test_config());
        assert_eq!(worker.status(), InstanceStatus::NotStarted);
        assert_eq!(worker.address(), None);
        assert_eq!(worker.port(), None);
    }

    #[test]
    fn stop_closes() {
        let worker = Worker::new(&test_config());
        worker.stop();
        assert_eq!(worker.status(), InstanceStatus::Closed);
    }

    #[test]
    fn info_sorts_resources() {
        let mut config = test_config();
        config.resources = [("MEM".to_string(), 1e10), ("GPU".to_string(), 2.0)]
            .into_iter()
            .collect();
        let worker = Worker::new(&config);
        let info = worker.info();
        assert_eq!(
            info.resources,
            vec![("GPU".to_string(), 2.0), ("MEM".to_string(), 1e10)]
        );
    }

    #[test]
    fn infer_host_loopback_route() {
        assert_eq!(infer_host("127.0.0.1:8786"), "127.0.0.1");
    }
}
