//! End-to-end tests driving a real guest process (the stub runtime)
//! through spawn, invoke, and shutdown.
//!
//! Everything here runs under the unsandboxed flavor, which is what it
//! exists for: the tests configure it explicitly. The isolation probes
//! for the privileged flavors are at the bottom, `#[ignore]`d because
//! they need a host with unprivileged user namespaces (or macOS).

#![cfg(unix)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tempfile::TempDir;

use formbox::{FlavorConfig, HandleState, PipeSide, SandboxConfig, SandboxError};

fn stub_config(grace_ms: u64, args: &[&str]) -> (SandboxConfig, TempDir) {
    let root = tempfile::tempdir().unwrap();
    let config = SandboxConfig {
        interpreter: PathBuf::from(env!("CARGO_BIN_EXE_stub_runtime")),
        interpreter_args: args.iter().map(|s| s.to_string()).collect(),
        sandbox_root: root.path().to_path_buf(),
        shutdown_grace_ms: grace_ms,
        flavor: FlavorConfig::Unsandboxed,
    };
    (config, root)
}

#[tokio::test]
async fn echo_round_trips_structured_values() {
    let (config, _root) = stub_config(2000, &[]);
    let handle = formbox::spawn(config).await.unwrap();

    for value in [
        json!(null),
        json!(42),
        json!("hello"),
        json!({"nested": {"list": [1, 2, 3], "flag": true}}),
    ] {
        let result = handle.invoke("echo", vec![value.clone()]).await.unwrap();
        assert_eq!(result, value);
    }

    handle.shutdown().await;
    assert_eq!(handle.state(), HandleState::Exited);
}

#[tokio::test]
async fn echo_round_trips_a_megabyte_in_linear_time() {
    let (config, _root) = stub_config(2000, &[]);
    let handle = formbox::spawn(config).await.unwrap();
    let payload = json!("x".repeat(1_000_000));

    let started = Instant::now();
    let result = handle.invoke("echo", vec![payload.clone()]).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(result, payload);
    // Moving ~1 MB through two pipes takes tens of milliseconds; the
    // generous bound only catches quadratic copying, not slow CI.
    assert!(
        elapsed < Duration::from_secs(2),
        "1 MB round trip took {elapsed:?}"
    );

    handle.shutdown().await;
}

#[tokio::test]
async fn uppercase_returns_transformed_string() {
    let (config, _root) = stub_config(2000, &[]);
    let handle = formbox::spawn(config).await.unwrap();
    let result = handle
        .invoke("uppercase", vec![json!("hello")])
        .await
        .unwrap();
    assert_eq!(result, json!("HELLO"));
    handle.shutdown().await;
}

#[tokio::test]
async fn remote_raise_surfaces_message_and_traceback() {
    let (config, _root) = stub_config(2000, &[]);
    let handle = formbox::spawn(config).await.unwrap();

    match handle.invoke("raise", vec![json!("ka-boom")]).await {
        Err(SandboxError::Remote { message, traceback }) => {
            assert!(message.contains("ka-boom"));
            assert!(traceback.contains("Traceback"));
            assert!(traceback.contains("ka-boom"));
        }
        other => panic!("expected remote failure, got {other:?}"),
    }

    // Recoverable: the handle keeps working.
    let result = handle.invoke("echo", vec![json!(1)]).await.unwrap();
    assert_eq!(result, json!(1));
    handle.shutdown().await;
}

#[tokio::test]
async fn remote_error_includes_diagnostic_output_captured_before_it() {
    let (config, _root) = stub_config(2000, &[]);
    let handle = formbox::spawn(config).await.unwrap();

    let result = handle.invoke("chatter", vec![]).await.unwrap();
    assert_eq!(result, json!(true));
    // The capture tasks run concurrently with the reply; give them a
    // moment to drain the guest's streams.
    tokio::time::sleep(Duration::from_millis(200)).await;

    match handle.invoke("raise", vec![json!("after chatter")]).await {
        Err(SandboxError::Remote { traceback, .. }) => {
            assert!(traceback.contains("captured sandbox output"));
            assert!(traceback.contains("chatter on stderr"));
            assert!(traceback.contains("chatter on stdout"));
        }
        other => panic!("expected remote failure, got {other:?}"),
    }
    handle.shutdown().await;
}

#[tokio::test]
async fn unknown_function_is_a_remote_error_not_a_channel_fault() {
    let (config, _root) = stub_config(2000, &[]);
    let handle = formbox::spawn(config).await.unwrap();
    match handle.invoke("no_such_function", vec![]).await {
        Err(SandboxError::Remote { message, .. }) => {
            assert!(message.contains("no_such_function"))
        }
        other => panic!("expected remote failure, got {other:?}"),
    }
    handle.shutdown().await;
}

#[tokio::test]
async fn invoke_after_shutdown_fails_fast_without_a_write() {
    let (config, _root) = stub_config(2000, &[]);
    let handle = formbox::spawn(config).await.unwrap();
    handle.shutdown().await;
    assert_eq!(handle.state(), HandleState::Exited);

    let outcome = tokio::time::timeout(
        Duration::from_secs(1),
        handle.invoke("echo", vec![json!(1)]),
    )
    .await
    .expect("fail-fast invoke must not hang");

    match outcome {
        Err(SandboxError::ChannelClosed { side }) => assert_eq!(side, PipeSide::ToSandbox),
        other => panic!("expected closed channel, got {other:?}"),
    }
}

#[tokio::test]
async fn stalled_guest_is_killed_after_the_grace_window() {
    let (config, _root) = stub_config(300, &["--ignore-term"]);
    let handle = Arc::new(formbox::spawn(config).await.unwrap());

    let stalled = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.invoke("stall", vec![]).await })
    };
    // Let the stall call reach the guest.
    tokio::time::sleep(Duration::from_millis(150)).await;

    let started = Instant::now();
    handle.shutdown().await;
    let elapsed = started.elapsed();

    assert_eq!(handle.state(), HandleState::Exited);
    assert!(
        elapsed < Duration::from_secs(3),
        "shutdown hung past the grace window: {elapsed:?}"
    );

    // The call outstanding at the kill fails like a crash, not with a
    // timeout-specific error.
    match stalled.await.unwrap() {
        Err(SandboxError::ChannelClosed { .. }) => {}
        other => panic!("expected closed channel, got {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_shutdown_is_idempotent() {
    let (config, _root) = stub_config(2000, &[]);
    let handle = Arc::new(formbox::spawn(config).await.unwrap());

    let (a, b) = {
        let (h1, h2) = (handle.clone(), handle.clone());
        tokio::join!(
            tokio::spawn(async move { h1.shutdown().await }),
            tokio::spawn(async move { h2.shutdown().await }),
        )
    };
    a.unwrap();
    b.unwrap();
    assert_eq!(handle.state(), HandleState::Exited);

    // And a third call is still a no-op that resolves immediately.
    tokio::time::timeout(Duration::from_secs(1), handle.shutdown())
        .await
        .expect("repeated shutdown must not hang");
}

#[tokio::test]
async fn killed_out_of_band_then_respawn_scenario() {
    let (config, _root) = stub_config(2000, &[]);
    let handle = formbox::spawn(config).await.unwrap();

    let result = handle
        .invoke("uppercase", vec![json!("hello")])
        .await
        .unwrap();
    assert_eq!(result, json!("HELLO"));

    // Kill the guest behind the handle's back.
    let pid = handle.pid().expect("live guest has a pid");
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGKILL,
    )
    .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    // The next call rejects promptly with a closed channel, whichever
    // side was observed first.
    let outcome = tokio::time::timeout(
        Duration::from_secs(1),
        handle.invoke("uppercase", vec![json!("again")]),
    )
    .await
    .expect("invoke against a dead sandbox must not hang");
    assert!(matches!(
        outcome,
        Err(SandboxError::ChannelClosed { .. })
    ));

    // A fresh spawn of the same flavor works normally.
    let (config, _root2) = stub_config(2000, &[]);
    let fresh = formbox::spawn(config).await.unwrap();
    let result = fresh.invoke("uppercase", vec![json!("again")]).await.unwrap();
    assert_eq!(result, json!("AGAIN"));
    fresh.shutdown().await;

    // Shutting down the dead handle still resolves.
    tokio::time::timeout(Duration::from_secs(3), handle.shutdown())
        .await
        .expect("shutdown of a dead handle must resolve");
    assert_eq!(handle.state(), HandleState::Exited);
}

#[tokio::test]
async fn calls_issued_while_one_is_outstanding_all_complete() {
    let (config, _root) = stub_config(2000, &[]);
    let handle = Arc::new(formbox::spawn(config).await.unwrap());

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let handle = handle.clone();
            tokio::spawn(async move { handle.invoke("echo", vec![json!(i)]).await })
        })
        .collect();

    for (i, task) in tasks.into_iter().enumerate() {
        assert_eq!(task.await.unwrap().unwrap(), json!(i));
    }
    handle.shutdown().await;
}

#[tokio::test]
async fn spawn_failure_reports_no_handle() {
    let root = tempfile::tempdir().unwrap();
    let config = SandboxConfig {
        interpreter: PathBuf::from("/nonexistent/formula-interp"),
        interpreter_args: vec![],
        sandbox_root: root.path().to_path_buf(),
        shutdown_grace_ms: 500,
        flavor: FlavorConfig::Unsandboxed,
    };
    match formbox::spawn(config).await {
        Err(SandboxError::Spawn(detail)) => {
            assert!(!detail.is_empty());
        }
        other => panic!("expected spawn failure, got {other:?}"),
    }
}

#[tokio::test]
async fn fs_view_reports_the_standard_policy() {
    let (config, root) = stub_config(2000, &[]);
    let handle = formbox::spawn(config).await.unwrap();

    let view = handle.fs_view();
    assert_eq!(view.sandbox_root(), root.path());
    assert!(view
        .mounts()
        .iter()
        .any(|m| m.mode == formbox::MountMode::WritableEphemeral));

    handle.shutdown().await;
}

// ── Isolation probes for privileged flavors ─────────────────────────
//
// These need a Linux host with unprivileged user namespaces enabled
// (or macOS for the seatbelt flavor), so they are opt-in:
//     cargo test -- --ignored

#[cfg(target_os = "linux")]
#[tokio::test]
#[ignore = "requires a Linux host with unprivileged user namespaces"]
async fn namespace_flavor_denies_writes_into_the_code_directory() {
    let stub = PathBuf::from(env!("CARGO_BIN_EXE_stub_runtime"));
    let code_dir = stub.parent().unwrap().to_path_buf();
    let root = tempfile::tempdir().unwrap();

    let config = SandboxConfig {
        interpreter: stub,
        interpreter_args: vec![],
        sandbox_root: root.path().to_path_buf(),
        shutdown_grace_ms: 2000,
        flavor: FlavorConfig::Namespace {
            hidden_paths: vec![],
            fork_budget: 16,
        },
    };
    let handle = formbox::spawn(config).await.unwrap();

    let probe_target = code_dir.join("write-probe.txt");
    let result = handle
        .invoke(
            "write_probe",
            vec![json!(probe_target.to_str().unwrap()), json!("tampered")],
        )
        .await
        .unwrap();
    assert_eq!(result["written"], json!(false));
    // From outside the sandbox the host filesystem is untouched.
    assert!(!probe_target.exists());

    handle.shutdown().await;
}

#[cfg(target_os = "linux")]
#[tokio::test]
#[ignore = "requires a Linux host with unprivileged user namespaces"]
async fn namespace_flavor_leaves_sockets_nothing_to_bind() {
    let (mut config, _root) = stub_config(2000, &[]);
    config.flavor = FlavorConfig::Namespace {
        hidden_paths: vec![],
        fork_budget: 16,
    };
    let handle = formbox::spawn(config).await.unwrap();

    let result = handle.invoke("socket_probe", vec![]).await.unwrap();
    assert_eq!(result["bound"], json!(false));

    handle.shutdown().await;
}

#[cfg(target_os = "linux")]
#[tokio::test]
#[ignore = "requires a Linux host with unprivileged user namespaces"]
async fn namespace_flavor_masks_hidden_paths() {
    let secret_dir = tempfile::tempdir().unwrap();
    let secret = secret_dir.path().join("secret.txt");
    std::fs::write(&secret, "do not read").unwrap();

    let (mut config, _root) = stub_config(2000, &[]);
    config.flavor = FlavorConfig::Namespace {
        hidden_paths: vec![secret_dir.path().to_path_buf()],
        fork_budget: 16,
    };
    let handle = formbox::spawn(config).await.unwrap();

    let result = handle
        .invoke("read_probe", vec![json!(secret.to_str().unwrap())])
        .await
        .unwrap();
    assert_eq!(result["read"], json!(false));

    handle.shutdown().await;
}

#[cfg(target_os = "macos")]
#[tokio::test]
#[ignore = "requires macOS with sandbox-exec"]
async fn seatbelt_flavor_denies_writes_outside_scratch() {
    let stub = PathBuf::from(env!("CARGO_BIN_EXE_stub_runtime"));
    let code_dir = stub.parent().unwrap().to_path_buf();
    let root = tempfile::tempdir().unwrap();

    let config = SandboxConfig {
        interpreter: stub,
        interpreter_args: vec![],
        sandbox_root: root.path().to_path_buf(),
        shutdown_grace_ms: 2000,
        flavor: FlavorConfig::Seatbelt {
            extra_read_only: vec![],
            fork_budget: 16,
        },
    };
    let handle = formbox::spawn(config).await.unwrap();

    let probe_target = code_dir.join("write-probe.txt");
    let result = handle
        .invoke(
            "write_probe",
            vec![json!(probe_target.to_str().unwrap()), json!("tampered")],
        )
        .await
        .unwrap();
    assert_eq!(result["written"], json!(false));
    assert!(!probe_target.exists());

    let result = handle.invoke("socket_probe", vec![]).await.unwrap();
    assert_eq!(result["bound"], json!(false));

    handle.shutdown().await;
}
