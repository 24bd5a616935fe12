//
// kernel_manager_tests.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//

//! Tests for the kernel lifecycle

#[path = "common/mod.rs"]
mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{test_config, FakeProcessController, StaticKernelSpecs, FAKE_KERNEL};
use kgserver::{
    config::GatewayConfig,
    connection_file::ConnectionFile,
    error::KSError,
    kernel_manager::{KernelManager, KernelState, StartupCoordinator},
    port_allocator::PortAllocator,
    process_controller::KillOutcome,
};
use kgshared::kernel_model::LifecycleState;

struct Fixture {
    _dir: tempfile::TempDir,
    kernel: KernelManager,
    ports: Arc<PortAllocator>,
    processes: Arc<FakeProcessController>,
}

fn fixture_with(config: impl FnOnce(&mut GatewayConfig)) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let mut gateway_config = test_config(dir.path());
    config(&mut gateway_config);

    let ports = Arc::new(PortAllocator::new(
        gateway_config.ip,
        gateway_config.port_range.clone(),
        gateway_config.port_attempts,
    ));
    let processes = Arc::new(FakeProcessController::new());
    let specs = StaticKernelSpecs::new().with(
        FAKE_KERNEL,
        vec!["fake-kernel", "--connection-file={connection_file}"],
    );
    let kernel = KernelManager::new(
        uuid::Uuid::new_v4().to_string(),
        FAKE_KERNEL.to_string(),
        Arc::new(gateway_config),
        ports.clone(),
        Arc::new(specs),
        processes.clone(),
    )
    .unwrap();

    Fixture {
        _dir: dir,
        kernel,
        ports,
        processes,
    }
}

fn fixture() -> Fixture {
    fixture_with(|_| {})
}

async fn wait_for_lifecycle(kernel: &KernelManager, expected: LifecycleState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while kernel.lifecycle().await != expected {
        assert!(
            tokio::time::Instant::now() < deadline,
            "kernel never reached {}",
            expected
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[test]
fn test_state_only_moves_forward() {
    let mut state = KernelState::new(String::from("k"));
    assert_eq!(state.lifecycle, LifecycleState::Unstarted);

    // Ready needs a process
    assert!(!state.advance(LifecycleState::Ready, "test"));
    assert!(state.advance(LifecycleState::Starting, "test"));
    assert!(!state.advance(LifecycleState::Unstarted, "test"));
    assert!(!state.advance(LifecycleState::Starting, "test"));

    state.process_id = Some(1234);
    assert!(state.advance(LifecycleState::Ready, "test"));
    assert!(state.advance(LifecycleState::ShuttingDown, "test"));
    assert!(!state.advance(LifecycleState::Ready, "test"));
    assert!(state.advance(LifecycleState::Dead, "test"));

    assert_eq!(state.process_id, None);
    assert_eq!(state.execution_state, "dead");
    for next in [
        LifecycleState::Unstarted,
        LifecycleState::Starting,
        LifecycleState::Ready,
        LifecycleState::ShuttingDown,
        LifecycleState::Dead,
    ] {
        assert!(!state.advance(next, "test"));
    }
}

#[test]
fn test_execution_state_is_frozen_once_dead() {
    let mut state = KernelState::new(String::from("k"));
    state.set_execution_state("busy");
    assert_eq!(state.execution_state, "busy");

    state.advance(LifecycleState::Dead, "test");
    state.set_execution_state("idle");
    assert_eq!(state.execution_state, "dead");
}

#[tokio::test]
async fn test_start_launches_with_connection_file() {
    let f = fixture();
    f.kernel.start().await.unwrap();

    assert_eq!(f.kernel.lifecycle().await, LifecycleState::Ready);
    let pid = f.kernel.process_id().await.unwrap();
    assert!(pid >= 40000);

    let path = f.kernel.connection_file_path();
    assert!(path.is_file());
    let on_disk = ConnectionFile::from_file(&path).unwrap();
    assert_eq!(Some(on_disk.clone()), f.kernel.connection_file().await);
    assert_eq!(on_disk.key, f.kernel.session.key);
    assert_eq!(on_disk.kernel_name, FAKE_KERNEL);
    for port in on_disk.ports().to_vec() {
        assert!(f.ports.is_reserved(port));
    }

    let launched = f.processes.launched();
    assert_eq!(launched.len(), 1);
    assert_eq!(
        launched[0][1],
        format!("--connection-file={}", path.to_string_lossy())
    );
}

#[tokio::test]
async fn test_start_twice_fails() {
    let f = fixture();
    f.kernel.start().await.unwrap();

    let second = f.kernel.start().await;
    assert!(matches!(second, Err(KSError::ProcessLaunch(_))));
    assert_eq!(f.kernel.lifecycle().await, LifecycleState::Ready);
    assert_eq!(f.processes.launched().len(), 1);
}

#[tokio::test]
async fn test_failed_start_releases_everything() {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(test_config(dir.path()));
    let ports = Arc::new(PortAllocator::new(
        config.ip,
        config.port_range.clone(),
        config.port_attempts,
    ));
    let kernel = KernelManager::new(
        String::from("no-such-spec"),
        String::from("missing"),
        config,
        ports,
        Arc::new(StaticKernelSpecs::new()),
        Arc::new(FakeProcessController::new()),
    )
    .unwrap();

    let result = kernel.start().await;
    assert!(matches!(result, Err(KSError::KernelSpecNotFound(_))));
    assert_eq!(kernel.lifecycle().await, LifecycleState::Dead);
    assert!(kernel.state.read().await.reserved_ports.is_none());
    assert!(!kernel.connection_file_path().exists());
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let f = fixture();
    f.kernel.start().await.unwrap();
    let pid = f.kernel.process_id().await.unwrap();
    let reserved = f.kernel.connection_file().await.unwrap().ports();

    f.kernel.stop().await.unwrap();
    f.kernel.stop().await.unwrap();

    assert_eq!(f.processes.killed(), vec![pid]);
    assert_eq!(f.kernel.lifecycle().await, LifecycleState::Dead);
    assert_eq!(f.kernel.process_id().await, None);
    assert!(!f.kernel.connection_file_path().exists());
    for port in reserved.to_vec() {
        assert!(!f.ports.is_reserved(port));
    }
}

#[tokio::test]
async fn test_stop_before_start() {
    let f = fixture();
    f.kernel.stop().await.unwrap();

    assert_eq!(f.kernel.lifecycle().await, LifecycleState::Dead);
    assert!(f.processes.killed().is_empty());
    assert!(f.kernel.start().await.is_err());
}

#[tokio::test]
async fn test_stop_reports_permission_denied() {
    let f = fixture();
    f.kernel.start().await.unwrap();
    let pid = f.kernel.process_id().await.unwrap();
    f.processes.set_kill_outcome(KillOutcome::PermissionDenied);

    let result = f.kernel.stop().await;
    assert!(matches!(result, Err(KSError::ProcessTermination(p, _)) if p == pid));
    assert_eq!(f.kernel.lifecycle().await, LifecycleState::Dead);

    // Already dead; nothing more to do
    assert!(f.kernel.stop().await.is_ok());
}

#[tokio::test]
async fn test_process_exit_marks_kernel_dead() {
    let f = fixture();
    f.kernel.start().await.unwrap();
    let pid = f.kernel.process_id().await.unwrap();
    let reserved = f.kernel.connection_file().await.unwrap().ports();

    let listener = f.kernel.exit_event.listen();
    f.processes.exit(pid, Some(3));
    tokio::time::timeout(Duration::from_secs(5), listener)
        .await
        .unwrap();

    wait_for_lifecycle(&f.kernel, LifecycleState::Dead).await;
    assert_eq!(f.kernel.state.read().await.exit_code, Some(3));
    assert!(!f.kernel.connection_file_path().exists());
    for port in reserved.to_vec() {
        assert!(!f.ports.is_reserved(port));
    }

    // Nothing left to kill
    f.kernel.stop().await.unwrap();
    assert!(f.processes.killed().is_empty());
}

#[tokio::test]
async fn test_uncached_ports_are_not_reserved() {
    let f = fixture_with(|config| config.cache_ports = false);
    f.kernel.start().await.unwrap();

    assert!(f.kernel.state.read().await.reserved_ports.is_none());
    let ports = f.kernel.connection_file().await.unwrap().ports();
    for port in ports.to_vec() {
        assert_ne!(port, 0);
        assert!(!f.ports.is_reserved(port));
    }
}

#[tokio::test]
async fn test_model_tracks_activity_and_connections() {
    let f = fixture();
    f.kernel.start().await.unwrap();

    let before = f.kernel.to_model().await;
    assert_eq!(before.state, LifecycleState::Ready);
    assert_eq!(before.execution_state, "starting");
    assert_eq!(before.connection_count, 0);

    tokio::time::sleep(Duration::from_millis(5)).await;
    f.kernel.set_execution_state("busy").await;
    assert_eq!(f.kernel.connection_opened().await, 1);
    assert_eq!(f.kernel.connection_opened().await, 2);
    assert_eq!(f.kernel.connection_closed().await, 1);

    let after = f.kernel.to_model().await;
    assert_eq!(after.execution_state, "busy");
    assert_eq!(after.connection_count, 1);
    assert!(after.last_activity > before.last_activity);
}

fn argv(args: &[&str]) -> Vec<String> {
    args.iter().map(|arg| arg.to_string()).collect()
}

fn coordinator(candidates: &[&str]) -> StartupCoordinator {
    StartupCoordinator::new(String::from("startup-test"), argv(candidates))
}

#[cfg(unix)]
#[tokio::test]
async fn test_python_is_replaced_by_first_working_interpreter() {
    let startup = coordinator(&["/definitely/not/python", "true"]);

    for python in ["python", "python3"] {
        let resolved = startup
            .resolve_argv(&argv(&[python, "-m", "ipykernel_launcher", "-f", "{connection_file}"]))
            .await
            .unwrap();
        assert_eq!(
            resolved,
            argv(&["true", "-m", "ipykernel_launcher", "-f", "{connection_file}"])
        );
    }
}

#[cfg(unix)]
#[tokio::test]
async fn test_python_is_kept_when_no_interpreter_runs() {
    let startup = coordinator(&["/definitely/not/python", "/also/not/python3", "false"]);
    let original = argv(&["python3", "-m", "ipykernel_launcher", "-f", "{connection_file}"]);

    let resolved = startup.resolve_argv(&original).await.unwrap();
    assert_eq!(resolved, original);
}

#[cfg(unix)]
#[tokio::test]
async fn test_other_commands_are_untouched() {
    let startup = coordinator(&["true"]);
    for command in ["fake-kernel", "/usr/bin/python3", "python3.12", "ir"] {
        let original = argv(&[command, "-f", "{connection_file}"]);
        assert_eq!(startup.resolve_argv(&original).await.unwrap(), original);
    }
}

#[tokio::test]
async fn test_empty_argv_is_rejected() {
    let startup = coordinator(&[]);
    assert!(matches!(
        startup.resolve_argv(&[]).await,
        Err(KSError::ProcessLaunch(_))
    ));
}
