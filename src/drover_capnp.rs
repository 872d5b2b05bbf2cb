// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::io;

use futures::AsyncReadExt;

use capnp_rpc::{rpc_twoparty_capnp, twoparty, RpcSystem};

include!(concat!(env!("OUT_DIR"), "/drover_capnp.rs"));

#[derive(Debug)]
pub enum SchedulerError {
    /// An IO error occurred while trying to connect.
    Io(io::Error),

    /// An error occurred in the RPC protocol.
    Rpc(capnp::Error),
}

impl From<io::Error> for SchedulerError {
    fn from(e: io::Error) -> Self {
        SchedulerError::Io(e)
    }
}

impl From<capnp::Error> for SchedulerError {
    fn from(e: capnp::Error) -> Self {
        SchedulerError::Rpc(e)
    }
}

/// Everything a worker advertises to the scheduler when it joins the
/// cluster.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub address: String,
    pub ncores: u32,
    pub name: String,
    pub memory_limit: u64,
    /// Resource tags in a predictable order.
    pub resources: Vec<(String, f64)>,
}

/// Create a capnp RPC client for the scheduler listening at `address`.
///
/// The RpcSystem driving the connection is spawned on the current LocalSet,
/// so this must be called from within one.
pub async fn connect(address: &str) -> io::Result<scheduler::Client> {
    let stream = tokio::net::TcpStream::connect(address).await?;
    stream.set_nodelay(true).expect("setting nodelay failed.");

    let (reader, writer) = tokio_util::compat::TokioAsyncReadCompatExt::compat(stream).split();

    let rpc_network = Box::new(twoparty::VatNetwork::new(
        futures::io::BufReader::new(reader),
        futures::io::BufWriter::new(writer),
        rpc_twoparty_capnp::Side::Client,
        Default::default(),
    ));
    let mut rpc_system = RpcSystem::new(rpc_network, None);
    let client: scheduler::Client = rpc_system.bootstrap(rpc_twoparty_capnp::Side::Server);

    tokio::task::spawn_local(rpc_system);

    Ok(client)
}

/// Register a worker with the scheduler over a fresh connection.
///
/// Registration is idempotent on the scheduler side, so this also serves as
/// the worker's periodic heartbeat.
pub async fn register_worker(
    scheduler_addr: &str,
    info: &WorkerInfo,
) -> Result<bool, SchedulerError> {
    let client = connect(scheduler_addr).await?;
    Ok(register_worker_given_client(&client, info).await?)
}

pub async fn register_worker_given_client(
    client: &scheduler::Client,
    info: &WorkerInfo,
) -> Result<bool, capnp::Error> {
    let mut request = client.register_worker_request();
    {
        let mut params = request.get();
        params.set_address(info.address.as_str());
        params.set_ncores(info.ncores);
        params.set_name(info.name.as_str());
        params.set_memory_limit(info.memory_limit);
        let mut resources = params.init_resources(info.resources.len() as u32);
        for (i, (key, value)) in info.resources.iter().enumerate() {
            let mut entry = resources.reborrow().get(i as u32);
            entry.set_key(key.as_str());
            entry.set_value(*value);
        }
    }

    let reply = request.send().promise.await?;

    Ok(reply.get()?.get_ok())
}

/// Ask the scheduler to retire `workers` from active task assignment. With
/// `remove = false` the workers stay in the scheduler's bookkeeping so
/// in-flight tasks can migrate before the final teardown.
pub async fn retire_workers(
    scheduler_addr: &str,
    workers: &[String],
    remove: bool,
) -> Result<(), SchedulerError> {
    let client = connect(scheduler_addr).await?;
    let mut request = client.retire_workers_request();
    {
        let mut params = request.get();
        params.set_remove(remove);
        let mut list = params.init_workers(workers.len() as u32);
        for (i, worker) in workers.iter().enumerate() {
            list.set(i as u32, worker.as_str().into());
        }
    }

    request.send().promise.await.map_err(SchedulerError::Rpc)?;

    Ok(())
}

/// Unregister one worker, given an already-connected scheduler client. The
/// teardown path issues these in parallel over a single connection.
pub async fn unregister_given_client(
    client: &scheduler::Client,
    address: String,
    close: bool,
) -> Result<(), capnp::Error> {
    let mut request = client.unregister_request();
    request.get().set_address(address.as_str());
    request.get().set_close(close);

    request.send().promise.await?;

    Ok(())
}

/// Serve a bootstrap capability to every connection accepted on `listener`.
/// Each connection gets its own RpcSystem on the current LocalSet.
pub async fn serve(listener: tokio::net::TcpListener, bootstrap: ::capnp::capability::Client) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        stream.set_nodelay(true).expect("setting nodelay failed.");

        let (reader, writer) = tokio_util::compat::TokioAsyncReadCompatExt::compat(stream).split();

        let rpc_network = Box::new(twoparty::VatNetwork::new(
            futures::io::BufReader::new(reader),
            futures::io::BufWriter::new(writer),
            rpc_twoparty_capnp::Side::Server,
            Default::default(),
        ));
        let rpc_system = RpcSystem::new(rpc_network, Some(bootstrap.clone()));

        tokio::task::spawn_local(rpc_system);
    }
}

/// The worker's own RPC surface. Task ingestion and execution belong to the
/// execution engine; this end answers liveness probes only.
pub struct WorkerImpl {}

impl worker::Server for WorkerImpl {
    fn ping(
        &mut self,
        _params: worker::PingParams,
        _results: worker::PingResults,
    ) -> ::capnp::capability::Promise<(), capnp::Error> {
        ::capnp::capability::Promise::ok(())
    }
}

/// Probe a worker's listener with a ping RPC over a fresh connection.
pub async fn ping_worker(address: &str) -> Result<(), SchedulerError> {
    let stream = tokio::net::TcpStream::connect(address).await?;
    stream.set_nodelay(true).expect("setting nodelay failed.");

    let (reader, writer) = tokio_util::compat::TokioAsyncReadCompatExt::compat(stream).split();

    let rpc_network = Box::new(twoparty::VatNetwork::new(
        futures::io::BufReader::new(reader),
        futures::io::BufWriter::new(writer),
        rpc_twoparty_capnp::Side::Client,
        Default::default(),
    ));
    let mut rpc_system = RpcSystem::new(rpc_network, None);
    let client: worker::Client = rpc_system.bootstrap(rpc_twoparty_capnp::Side::Server);

    tokio::task::spawn_local(rpc_system);

    let request = client.ping_request();
    request.send().promise.await.map_err(SchedulerError::Rpc)?;

    Ok(())
}
