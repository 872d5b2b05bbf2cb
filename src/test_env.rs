// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Test scaffolding: a private working directory per test, helpers for
//! launching and signalling the worker binary, and a recording scheduler
//! stub that stands in for the out-of-scope cluster scheduler.

use std::{io, sync::mpsc, time::Duration};

use {
    capnp::capability::Promise,
    capnp_rpc::pry,
    nix::{
        sys::signal::{kill, Signal},
        unistd::Pid,
    },
};

use crate::{
    drover_capnp::{self, scheduler},
    launch::ReadyMsg,
};

/// Given a relative `path` in the test directory, prepend the full path to
/// the test directory.
fn test_path(path: &str) -> String {
    std::env::var("CARGO_MANIFEST_DIR").unwrap() + "/tests/" + path
}

/// This struct is used to hold handles to launched worker processes so that
/// they can be shut down when the test ends.
pub struct ChildHandle {
    pub handle: std::process::Child,
}

impl Drop for ChildHandle {
    fn drop(&mut self) {
        let _ = self.handle.kill();
        let _ = self.handle.wait();
    }
}

/// Deliver SIGTERM to a launched worker process, the way a cluster manager
/// or an operator would during decommissioning.
pub fn send_sigterm(child: &ChildHandle) {
    kill(Pid::from_raw(child.handle.id() as i32), Signal::SIGTERM)
        .expect("could not signal worker process");
}

/// A TestEnvironment holds the information needed to access a test's runtime
/// state: a "private" working directory for worker files, readiness files,
/// and pid files, and the path of the launcher binary under test.
///
/// All access to the test's state on the filesystem should be done via
/// methods on TestEnvironment rather than coded in the tests themselves.
pub struct TestEnvironment {
    /// The path to this test's private working directory.
    private_dir_path: String,

    /// The worker binary path has to be passed in as an argument from the
    /// tests because the CARGO_BIN_EXE_* environment variables aren't
    /// defined during non-test compilation.
    worker_binary_path: String,
}

impl TestEnvironment {
    /// Set up an environment for a test named `test_id`.
    ///
    /// Creates a specific unique subdirectory for the test, emptied out
    /// first so that files from a previous run don't impact this one.
    pub fn new(test_id: String, worker_binary_path: &str) -> Self {
        let private_dir_path = test_path(&format!("test_output/{test_id}"));
        match std::fs::remove_dir_all(&private_dir_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => panic!("Could not clean up test directory: {e}"),
        };
        std::fs::create_dir_all(&private_dir_path).expect("could not create test directory");

        Self {
            private_dir_path,
            worker_binary_path: worker_binary_path.to_string(),
        }
    }

    pub fn private_path(&self, name: &str) -> String {
        format!("{}/{name}", self.private_dir_path)
    }

    /// Launch the worker binary with the given arguments. The child is
    /// killed when the returned handle drops, so a failing test does not
    /// leak processes.
    pub fn spawn_worker(&self, args: &[&str]) -> ChildHandle {
        ChildHandle {
            handle: std::process::Command::new(&self.worker_binary_path)
                .args(args)
                .env("DROVER_LOG", "info")
                .spawn()
                .expect("could not launch worker process"),
        }
    }

    /// Poll for the readiness record the launcher writes to
    /// `--temp-filename`.
    pub fn wait_for_ready(&self, path: &str, secs: u64) -> ReadyMsg {
        let deadline = std::time::Instant::now() + Duration::from_secs(secs);
        loop {
            if let Ok(text) = std::fs::read_to_string(path) {
                if let Ok(msg) = serde_json::from_str::<ReadyMsg>(&text) {
                    return msg;
                }
            }
            if std::time::Instant::now() >= deadline {
                panic!("worker did not write readiness record \"{path}\" within {secs}s");
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    /// Wait for a launched worker process to exit, without blocking forever.
    pub fn wait_for_exit(
        &self,
        child: &mut ChildHandle,
        secs: u64,
    ) -> Option<std::process::ExitStatus> {
        let deadline = std::time::Instant::now() + Duration::from_secs(secs);
        loop {
            match child.handle.try_wait() {
                Ok(Some(status)) => return Some(status),
                Ok(None) => {}
                Err(e) => panic!("could not poll worker process: {e}"),
            }
            if std::time::Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

/// Everything the scheduler stub records about the calls it receives.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    Register {
        address: String,
        ncores: u32,
        name: String,
        memory_limit: u64,
        resources: Vec<(String, f64)>,
    },
    Retire {
        workers: Vec<String>,
        remove: bool,
    },
    Unregister {
        address: String,
        close: bool,
    },
}

struct StubImpl {
    events: mpsc::Sender<SchedulerEvent>,
}

impl scheduler::Server for StubImpl {
    fn register_worker(
        &mut self,
        params: scheduler::RegisterWorkerParams,
        mut results: scheduler::RegisterWorkerResults,
    ) -> Promise<(), capnp::Error> {
        let params = pry!(params.get());
        let address = pry!(pry!(params.get_address()).to_str()).to_string();
        let name = pry!(pry!(params.get_name()).to_str()).to_string();
        let resource_list = pry!(params.get_resources());
        let mut resources = Vec::new();
        for entry in resource_list.iter() {
            let key = pry!(pry!(entry.get_key()).to_str()).to_string();
            resources.push((key, entry.get_value()));
        }

        results.get().set_ok(true);

        let _ = self.events.send(SchedulerEvent::Register {
            address,
            ncores: params.get_ncores(),
            name,
            memory_limit: params.get_memory_limit(),
            resources,
        });
        Promise::ok(())
    }

    fn retire_workers(
        &mut self,
        params: scheduler::RetireWorkersParams,
        _results: scheduler::RetireWorkersResults,
    ) -> Promise<(), capnp::Error> {
        let params = pry!(params.get());
        let list = pry!(params.get_workers());
        let mut workers = Vec::new();
        for i in 0..list.len() {
            workers.push(pry!(pry!(list.get(i)).to_str()).to_string());
        }

        let _ = self.events.send(SchedulerEvent::Retire {
            workers,
            remove: params.get_remove(),
        });
        Promise::ok(())
    }

    fn unregister(
        &mut self,
        params: scheduler::UnregisterParams,
        _results: scheduler::UnregisterResults,
    ) -> Promise<(), capnp::Error> {
        let params = pry!(params.get());
        let address = pry!(pry!(params.get_address()).to_str()).to_string();

        let _ = self.events.send(SchedulerEvent::Unregister {
            address,
            close: params.get_close(),
        });
        Promise::ok(())
    }
}

/// A recording scheduler stub listening on an OS-assigned loopback port in a
/// background thread. The stub lives for the rest of the test process.
pub struct SchedulerStub {
    pub address: String,
    events: mpsc::Receiver<SchedulerEvent>,
}

impl SchedulerStub {
    pub fn start() -> Self {
        let (event_tx, event_rx) = mpsc::channel();
        let (addr_tx, addr_rx) = mpsc::channel();

        std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("could not build stub scheduler runtime");
            rt.block_on(tokio::task::LocalSet::new().run_until(async move {
                let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
                    .await
                    .expect("could not bind stub scheduler");
                let address = listener
                    .local_addr()
                    .expect("could not read stub scheduler address")
                    .to_string();
                addr_tx.send(address).expect("stub address channel closed");

                let client: scheduler::Client =
                    capnp_rpc::new_client(StubImpl { events: event_tx });
                drover_capnp::serve(listener, client.clone().client).await;
            }));
        });

        let address = addr_rx.recv().expect("stub scheduler did not start");
        SchedulerStub {
            address,
            events: event_rx,
        }
    }

    /// Wait up to `secs` seconds for the next recorded scheduler call.
    pub fn next_event(&self, secs: u64) -> SchedulerEvent {
        self.events
            .recv_timeout(Duration::from_secs(secs))
            .expect("no scheduler event arrived in time")
    }

    /// Wait up to `secs` seconds for an event satisfying `pred`, discarding
    /// the others (heartbeat re-registrations, for example).
    pub fn wait_for(
        &self,
        secs: u64,
        pred: impl Fn(&SchedulerEvent) -> bool,
    ) -> SchedulerEvent {
        let deadline = std::time::Instant::now() + Duration::from_secs(secs);
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            match self.events.recv_timeout(remaining) {
                Ok(event) if pred(&event) => return event,
                Ok(_) => {}
                Err(_) => panic!("no matching scheduler event arrived within {secs}s"),
            }
        }
    }
}
