use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use sandbox_engine::engine::cmd::{Cmd, ExecDefaults, ExecRequest, PipeSpec, RequestFile};
use sandbox_engine::engine::status::Status;
use sandbox_engine::filestore::{FileStore, MemoryStore};
use sandbox_engine::metrics::MetricsRegistry;
use sandbox_engine::worker::{SubmitError, Worker, WorkerConfig};

fn test_worker() -> Arc<Worker> {
    let root = std::env::temp_dir().join(format!("sbx-exec-{}", uuid::Uuid::new_v4()));
    Worker::new(
        WorkerConfig {
            parallelism: 4,
            container_root: root,
            cgroup_prefix: "sandbox-engine-test".to_string(),
            enable_cpu_rate: false,
            cpu_cfs_period_us: 100_000,
            tick_interval: Duration::from_millis(20),
            extra_memory_limit: 16 << 10,
            defaults: ExecDefaults {
                output_limit: 1 << 20,
                copy_out_limit: 1 << 20,
            },
        },
        Arc::new(MemoryStore::new()),
        Arc::new(MetricsRegistry::new()),
    )
}

fn shell(script: &str) -> Cmd {
    Cmd {
        args: vec!["/bin/sh".into(), "-c".into(), script.into()],
        env: vec!["PATH=/usr/local/bin:/usr/bin:/bin".into()],
        files: vec![None, None, None],
        cpu_limit: 5_000_000_000,
        clock_limit: 10_000_000_000,
        ..Cmd::default()
    }
}

fn stdout_collector(max: u64) -> Option<RequestFile> {
    Some(RequestFile::Collector {
        name: "stdout".into(),
        max: Some(max),
    })
}

#[tokio::test]
async fn echo_is_accepted_and_collected() {
    let worker = test_worker();
    let mut cmd = shell("echo hi");
    cmd.files[1] = stdout_collector(64);

    let results = worker
        .submit(ExecRequest {
            cmd: vec![cmd],
            pipe_mapping: Vec::new(),
        })
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert_eq!(result.status, Status::Accepted, "error: {}", result.error);
    assert_eq!(result.files["stdout"], "hi\n");
    assert_eq!(result.exit_status, 0);
    assert!(result.memory > 0, "peak memory should be observed");
    assert!(result.time < 1_000_000_000);
    assert!(result.run_time > 0);
}

#[tokio::test]
async fn busy_loop_hits_the_time_limit() {
    let worker = test_worker();
    let mut cmd = shell("while :; do :; done");
    cmd.cpu_limit = 500_000_000;
    cmd.clock_limit = 2_000_000_000;

    let results = worker
        .submit(ExecRequest {
            cmd: vec![cmd],
            pipe_mapping: Vec::new(),
        })
        .await
        .unwrap();

    let result = &results[0];
    assert_eq!(result.status, Status::TimeLimitExceeded);
    assert!(
        result.run_time >= 200_000_000 && result.run_time <= 3_000_000_000,
        "wall time {} out of range",
        result.run_time
    );
}

#[tokio::test]
async fn pipe_wires_source_to_sink() {
    let worker = test_worker();

    let mut sink = Cmd {
        args: vec!["/bin/cat".into()],
        env: vec!["PATH=/usr/bin:/bin".into()],
        files: vec![None, None, None],
        cpu_limit: 5_000_000_000,
        ..Cmd::default()
    };
    sink.files[1] = stdout_collector(16);

    let source = shell("printf abc");

    let results = worker
        .submit(ExecRequest {
            cmd: vec![sink, source],
            pipe_mapping: vec![PipeSpec {
                from_index: 1,
                from_fd: 1,
                to_index: 0,
                to_fd: 0,
            }],
        })
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].status, Status::Accepted, "{}", results[0].error);
    assert_eq!(results[1].status, Status::Accepted, "{}", results[1].error);
    assert_eq!(results[0].files["stdout"], "abc");
}

#[tokio::test]
async fn verbose_output_overflows_the_collector() {
    let worker = test_worker();
    let mut cmd = shell("yes | head -c 1048576");
    cmd.files[1] = stdout_collector(1024);

    let results = worker
        .submit(ExecRequest {
            cmd: vec![cmd],
            pipe_mapping: Vec::new(),
        })
        .await
        .unwrap();

    let result = &results[0];
    assert_eq!(result.status, Status::OutputLimitExceeded);
    assert!(result.files["stdout"].len() <= 1024);
}

#[tokio::test]
async fn cached_blob_copies_in() {
    let worker = test_worker();
    let blob_id = worker
        .store()
        .put("in", Bytes::from_static(&[0x00, 0x01, 0x02]))
        .await
        .unwrap();

    let mut cmd = Cmd {
        args: vec!["/bin/cat".into(), "in".into()],
        env: vec!["PATH=/usr/bin:/bin".into()],
        files: vec![None, None, None],
        cpu_limit: 5_000_000_000,
        ..Cmd::default()
    };
    cmd.files[1] = stdout_collector(16);
    cmd.copy_in.insert(
        "/w/in".to_string(),
        RequestFile::Cached { file_id: blob_id },
    );

    let results = worker
        .submit(ExecRequest {
            cmd: vec![cmd],
            pipe_mapping: Vec::new(),
        })
        .await
        .unwrap();

    let result = &results[0];
    assert_eq!(result.status, Status::Accepted, "{}", result.error);
    assert_eq!(
        result.files["stdout"],
        String::from_utf8_lossy(&[0x00, 0x01, 0x02])
    );
}

#[tokio::test]
async fn copy_out_round_trips_and_caches() {
    let worker = test_worker();
    let mut cmd = shell("cat in > out");
    cmd.copy_in.insert(
        "/w/in".to_string(),
        RequestFile::Memory {
            content: "roundtrip".into(),
        },
    );
    cmd.copy_out = vec!["out".into()];
    cmd.copy_out_cached = vec!["out".into()];

    let results = worker
        .submit(ExecRequest {
            cmd: vec![cmd],
            pipe_mapping: Vec::new(),
        })
        .await
        .unwrap();

    let result = &results[0];
    assert_eq!(result.status, Status::Accepted, "{}", result.error);
    assert_eq!(result.files["out"], "roundtrip");

    let cached_id = &result.file_ids["out"];
    let (_, bytes) = worker.store().get(cached_id).await.unwrap();
    assert_eq!(bytes.as_ref(), b"roundtrip");
}

#[tokio::test]
async fn missing_copy_out_file_is_a_file_error_in_strict_mode() {
    let worker = test_worker();
    let mut cmd = shell("true");
    cmd.copy_out = vec!["does-not-exist".into()];
    cmd.strict = true;

    let results = worker
        .submit(ExecRequest {
            cmd: vec![cmd],
            pipe_mapping: Vec::new(),
        })
        .await
        .unwrap();

    assert_eq!(results[0].status, Status::FileError);
    assert!(results[0].error.contains("does-not-exist"));
}

#[tokio::test]
async fn early_exiting_sink_breaks_the_source_pipe() {
    let worker = test_worker();

    let sink = Cmd {
        args: vec!["/bin/sh".into(), "-c".into(), "exit 0".into()],
        env: vec!["PATH=/usr/bin:/bin".into()],
        files: vec![None, None, None],
        cpu_limit: 5_000_000_000,
        ..Cmd::default()
    };
    let source = shell("while :; do echo spam; done");

    let results = worker
        .submit(ExecRequest {
            cmd: vec![sink, source],
            pipe_mapping: vec![PipeSpec {
                from_index: 1,
                from_fd: 1,
                to_index: 0,
                to_fd: 0,
            }],
        })
        .await
        .unwrap();

    assert_eq!(results[0].status, Status::Accepted);
    // the writer dies from SIGPIPE once the reader is gone
    assert_eq!(results[1].status, Status::Signalled, "{}", results[1].error);
    assert_eq!(
        results[1].exit_status,
        nix::sys::signal::Signal::SIGPIPE as i32
    );
}

#[tokio::test]
async fn nonzero_exit_is_reported() {
    let worker = test_worker();
    let results = worker
        .submit(ExecRequest {
            cmd: vec![shell("exit 42")],
            pipe_mapping: Vec::new(),
        })
        .await
        .unwrap();

    assert_eq!(results[0].status, Status::NonzeroExit);
    assert_eq!(results[0].exit_status, 42);
}

#[tokio::test]
async fn empty_requests_are_rejected() {
    let worker = test_worker();
    match worker.submit(ExecRequest::default()).await {
        Err(SubmitError::Invalid(_)) => {}
        other => panic!("expected an invalid-request error, got {other:?}"),
    }
}

#[tokio::test]
async fn shutdown_leaves_no_pool_items_behind() {
    let worker = test_worker();
    for _ in 0..3 {
        let mut cmd = shell("echo leak-check");
        cmd.files[1] = stdout_collector(64);
        worker
            .submit(ExecRequest {
                cmd: vec![cmd],
                pipe_mapping: Vec::new(),
            })
            .await
            .unwrap();
    }

    worker.shutdown().await;
    assert_eq!(worker.live_counts(), (0, 0));

    match worker.submit(ExecRequest::default()).await {
        Err(SubmitError::ShuttingDown) | Err(SubmitError::Invalid(_)) => {}
        other => panic!("expected rejection after shutdown, got {other:?}"),
    }
}

#[tokio::test]
async fn results_preserve_request_order() {
    let worker = test_worker();
    let mut cmds = Vec::new();
    for i in 0..4 {
        let mut cmd = shell(&format!("printf {i}"));
        cmd.files[1] = stdout_collector(8);
        cmds.push(cmd);
    }

    let results = worker
        .submit(ExecRequest {
            cmd: cmds,
            pipe_mapping: Vec::new(),
        })
        .await
        .unwrap();

    assert_eq!(results.len(), 4);
    for (i, result) in results.iter().enumerate() {
        assert_eq!(result.files["stdout"], i.to_string());
    }
}
