// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use tokio::runtime::Runtime;

    use drover_lib::test_env::*;

    /// Create a TestEnvironment for a test.
    ///
    /// The path to the worker binary needs to be determined here and passed
    /// into the TestEnvironment constructor because the environment variable
    /// is only defined when compiling tests.
    fn test_env_helper(test_id: &str) -> TestEnvironment {
        TestEnvironment::new(test_id.to_string(), env!("CARGO_BIN_EXE_drover_worker"))
    }

    #[test]
    fn direct_worker_lifecycle() {
        let env = test_env_helper("direct");
        let scheduler = SchedulerStub::start();

        let ready = env.private_path("worker.ready");
        let pid_file = env.private_path("worker.pid");

        let mut worker = env.spawn_worker(&[
            &scheduler.address,
            "--no-nanny",
            "--host",
            "127.0.0.1",
            "--local-directory",
            &env.private_path("work"),
            "--temp-filename",
            &ready,
            "--pid-file",
            &pid_file,
            "--name",
            "direct-test",
            "--resources",
            "GPU=2",
        ]);

        let msg = env.wait_for_ready(&ready, 30);
        assert!(msg.port > 0);

        match scheduler.next_event(30) {
            SchedulerEvent::Register {
                address,
                name,
                resources,
                ..
            } => {
                assert_eq!(address, format!("127.0.0.1:{}", msg.port));
                assert_eq!(name, "direct-test");
                assert_eq!(resources, vec![("GPU".to_string(), 2.0)]);
            }
            other => panic!("expected a registration, got {other:?}"),
        }

        let pid = std::fs::read_to_string(&pid_file)
            .expect("pid file should exist while the worker runs");
        assert_eq!(pid.trim().parse::<u32>().unwrap(), worker.handle.id());

        // The worker's own RPC listener answers liveness probes.
        let rt = Runtime::new().unwrap();
        rt.block_on(tokio::task::LocalSet::new().run_until(async {
            drover_lib::drover_capnp::ping_worker(&format!("127.0.0.1:{}", msg.port))
                .await
                .expect("worker should answer ping");
        }));

        send_sigterm(&worker);
        let status = env
            .wait_for_exit(&mut worker, 15)
            .expect("worker did not exit after SIGTERM");
        assert!(status.success());
        assert!(!std::path::Path::new(&pid_file).exists());
    }

    #[test]
    fn nanny_unregisters_on_sigterm() {
        let env = test_env_helper("nanny");
        let scheduler = SchedulerStub::start();

        let ready = env.private_path("nanny.ready");

        let mut worker = env.spawn_worker(&[
            &scheduler.address,
            "--host",
            "127.0.0.1",
            "--local-directory",
            &env.private_path("work"),
            "--temp-filename",
            &ready,
        ]);

        // In nanny mode the readiness record names the nanny's own port and
        // the supervised worker's private directory.
        let msg = env.wait_for_ready(&ready, 60);
        assert!(msg.port > 0);
        assert!(std::path::Path::new(&msg.local_directory).exists());

        let registered =
            scheduler.wait_for(30, |e| matches!(e, SchedulerEvent::Register { .. }));
        let SchedulerEvent::Register { address, .. } = registered else {
            unreachable!()
        };

        send_sigterm(&worker);

        let unregistered =
            scheduler.wait_for(15, |e| matches!(e, SchedulerEvent::Unregister { .. }));
        let SchedulerEvent::Unregister {
            address: unregistered_address,
            close,
        } = unregistered
        else {
            unreachable!()
        };
        assert_eq!(unregistered_address, address);
        assert!(close);

        let status = env
            .wait_for_exit(&mut worker, 15)
            .expect("launcher did not exit after SIGTERM");
        assert!(status.success());

        // The supervised worker's directory is cleaned up on the way out.
        assert!(!std::path::Path::new(&msg.local_directory).exists());
    }

    #[test]
    fn lifetime_retires_then_exits() {
        let env = test_env_helper("lifetime");
        let scheduler = SchedulerStub::start();

        let ready = env.private_path("worker.ready");

        let mut worker = env.spawn_worker(&[
            &scheduler.address,
            "--no-nanny",
            "--host",
            "127.0.0.1",
            "--local-directory",
            &env.private_path("work"),
            "--temp-filename",
            &ready,
            "--lifetime",
            "s=1",
        ]);

        let _ = env.wait_for_ready(&ready, 30);

        // Retirement is advisory: the scheduler keeps the worker in its
        // bookkeeping (remove = false) while in-flight tasks migrate.
        let retire = scheduler.wait_for(30, |e| matches!(e, SchedulerEvent::Retire { .. }));
        let SchedulerEvent::Retire { workers, remove } = retire else {
            unreachable!()
        };
        assert_eq!(workers.len(), 1);
        assert!(!remove);

        // The wait loop exits on the retirement flag even though the worker
        // never reached Closed.
        let status = env
            .wait_for_exit(&mut worker, 15)
            .expect("worker did not exit after retiring");
        assert!(status.success());
    }

    #[test]
    fn nprocs_conflicts_exit_nonzero() {
        let env = test_env_helper("conflicts");

        let mut worker = env.spawn_worker(&[
            "127.0.0.1:8786",
            "--nprocs",
            "2",
            "--worker-port",
            "9123",
        ]);
        let status = env
            .wait_for_exit(&mut worker, 15)
            .expect("conflicting flags should fail fast");
        assert_eq!(status.code(), Some(1));

        let mut worker =
            env.spawn_worker(&["127.0.0.1:8786", "--nprocs", "2", "--name", "alias"]);
        let status = env
            .wait_for_exit(&mut worker, 15)
            .expect("conflicting flags should fail fast");
        assert_eq!(status.code(), Some(1));
    }

    #[test]
    #[cfg(feature = "slow_tests")]
    fn two_direct_workers_register() {
        let env = test_env_helper("nprocs");
        let scheduler = SchedulerStub::start();

        let ready = env.private_path("worker.ready");

        let mut worker = env.spawn_worker(&[
            &scheduler.address,
            "--no-nanny",
            "--host",
            "127.0.0.1",
            "--nprocs",
            "2",
            "--local-directory",
            &env.private_path("work"),
            "--temp-filename",
            &ready,
        ]);

        let _ = env.wait_for_ready(&ready, 30);

        let first = scheduler.wait_for(30, |e| matches!(e, SchedulerEvent::Register { .. }));
        let SchedulerEvent::Register { address: first, .. } = first else {
            unreachable!()
        };
        let second = scheduler.wait_for(30, |e| {
            matches!(e, SchedulerEvent::Register { address, .. } if *address != first)
        });
        let SchedulerEvent::Register {
            address: second, ..
        } = second
        else {
            unreachable!()
        };
        assert_ne!(first, second);

        send_sigterm(&worker);
        let status = env
            .wait_for_exit(&mut worker, 15)
            .expect("launcher did not exit after SIGTERM");
        assert!(status.success());
    }
}
