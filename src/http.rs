// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{collections::HashMap, sync::Arc};

use {
    axum::{routing::get, Json, Router},
    serde::{Deserialize, Serialize},
};

use crate::worker::{InstanceStatus, Worker};

/// Main entrypoint for the worker status service.
///
/// This exposes the worker's cluster-membership state over HTTP so that
/// operators and parent tooling can inspect a worker without speaking the
/// RPC protocol.
pub async fn server_main(listener: tokio::net::TcpListener, worker: Arc<Worker>) {
    let server = Router::new().route(
        "/status",
        get({
            let worker = Arc::clone(&worker);
            || get_status(worker)
        }),
    );

    axum::serve(listener, server).await.unwrap();
}

#[derive(Serialize, Deserialize, Debug)]
pub struct WorkerJson {
    pub name: String,
    pub address: Option<String>,
    pub status: String,
    pub nthreads: usize,
    pub memory_limit: u64,
    pub resources: HashMap<String, f64>,
}

impl WorkerJson {
    fn build(worker: &Worker) -> Self {
        let status = match worker.status() {
            InstanceStatus::NotStarted => "not-started",
            InstanceStatus::Running => "running",
            InstanceStatus::Closed => "closed",
        }
        .to_string();

        Self {
            name: worker.name().to_string(),
            address: worker.address(),
            status,
            nthreads: worker.nthreads(),
            memory_limit: worker.memory_limit(),
            resources: worker.resources().clone(),
        }
    }
}

async fn get_status(worker: Arc<Worker>) -> Json<WorkerJson> {
    Json(WorkerJson::build(&worker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::LaunchConfig, launch::Cli};

    #[test]
    fn status_record_for_unstarted_worker() {
        let cli = Cli {
            scheduler: "127.0.0.1:8786".to_string(),
            name: Some("w-1".to_string()),
            ..Default::default()
        };
        let config = LaunchConfig::resolve(&cli, Default::default(), 4, 1 << 30).unwrap();
        let worker = Worker::new(&config);

        let json = WorkerJson::build(&worker);
        assert_eq!(json.name, "w-1");
        assert_eq!(json.status, "not-started");
        assert_eq!(json.address, None);
        assert_eq!(json.nthreads, 4);
    }
}
