//
// mod.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

//! The lifecycle of a single kernel.

mod startup;
mod state;

pub use startup::StartupCoordinator;
pub use state::KernelState;

use std::path::PathBuf;
use std::sync::Arc;

use event_listener::Event;
use kgshared::kernel_model::{KernelModel, LifecycleState};
use tokio::sync::RwLock;

use crate::{
    config::GatewayConfig,
    connection_file::ConnectionFile,
    error::KSError,
    kernel_session::KernelSession,
    kernel_spec::KernelSpecProvider,
    port_allocator::PortAllocator,
    process_controller::{KillOutcome, ProcessController, ProcessHandle},
};

/// A Jupyter kernel managed by the gateway.
///
/// The immutable parts of the kernel live directly on this object; everything
/// that changes over the kernel's life lives in `KernelState`.
pub struct KernelManager {
    /// The unique ID of the kernel
    pub kernel_id: String,

    /// The name of the kernelspec the kernel is started from
    pub kernel_name: String,

    /// The signing identity used for every message to and from the kernel
    pub session: KernelSession,

    /// The current state of the kernel
    pub state: Arc<RwLock<KernelState>>,

    /// Fires when the kernel process exits or is stopped
    pub exit_event: Arc<Event>,

    /// The gateway configuration
    pub config: Arc<GatewayConfig>,

    ports: Arc<PortAllocator>,
    specs: Arc<dyn KernelSpecProvider>,
    processes: Arc<dyn ProcessController>,
}

impl KernelManager {
    pub fn new(
        kernel_id: String,
        kernel_name: String,
        config: Arc<GatewayConfig>,
        ports: Arc<PortAllocator>,
        specs: Arc<dyn KernelSpecProvider>,
        processes: Arc<dyn ProcessController>,
    ) -> Result<Self, anyhow::Error> {
        let session = KernelSession::generate()?;
        Ok(Self {
            state: Arc::new(RwLock::new(KernelState::new(kernel_id.clone()))),
            kernel_id,
            kernel_name,
            session,
            exit_event: Arc::new(Event::new()),
            config,
            ports,
            specs,
            processes,
        })
    }

    /// Start the kernel: resolve its kernelspec, pick its ports, write its
    /// connection file, and launch its process.
    ///
    /// A failure leaves the kernel `Dead` with its resources released.
    pub async fn start(&self) -> Result<(), KSError> {
        {
            let mut state = self.state.write().await;
            if state.lifecycle != LifecycleState::Unstarted {
                return Err(KSError::ProcessLaunch(anyhow::anyhow!(
                    "Kernel {} has already been started (state: {})",
                    self.kernel_id,
                    state.lifecycle
                )));
            }
            state.advance(LifecycleState::Starting, "start requested");
        }

        log::info!(
            "[kernel {}] Starting kernel '{}'",
            self.kernel_id,
            self.kernel_name
        );

        let handle = match self.launch().await {
            Ok(handle) => handle,
            Err(err) => return Err(self.fail_start(err).await),
        };
        let pid = handle.pid;

        {
            let mut state = self.state.write().await;
            if state.lifecycle != LifecycleState::Starting {
                // Stopped while the process was being launched
                drop(state);
                let _ = self.processes.kill(pid).await;
                return Err(self.fail_start(KSError::ProcessLaunch(anyhow::anyhow!(
                    "Kernel {} was stopped during startup",
                    self.kernel_id
                )))
                .await);
            }
            state.process_id = Some(pid);
            state.advance(LifecycleState::Ready, "process launched");
        }

        log::info!(
            "[kernel {}] Kernel '{}' is running with pid {}",
            self.kernel_id,
            self.kernel_name,
            pid
        );

        self.monitor_exit(handle);
        Ok(())
    }

    /// The body of `start` that can fail.
    async fn launch(&self) -> Result<ProcessHandle, KSError> {
        let spec = self.specs.get(&self.kernel_name)?;

        let coordinator = StartupCoordinator::new(
            self.kernel_id.clone(),
            self.config.python_candidates.clone(),
        );
        let argv = coordinator.resolve_argv(&spec.argv).await?;

        let ports = if self.config.cache_ports {
            let ports = self.ports.allocate()?;
            self.state.write().await.reserved_ports = Some(ports);
            ports
        } else {
            self.ports.ephemeral()?
        };

        let connection_file = ConnectionFile::new(
            ports,
            self.config.ip.to_string(),
            self.config.transport.clone(),
            &self.session,
            self.kernel_name.clone(),
        );
        let path = self.connection_file_path();
        connection_file
            .to_file(&path)
            .map_err(|e| KSError::DescriptorWrite(path.clone(), e))?;
        log::debug!(
            "[kernel {}] Wrote connection file at {:?}",
            self.kernel_id,
            path
        );
        {
            let mut state = self.state.write().await;
            state.connection_file = Some(connection_file);
            state.connection_file_path = Some(path.clone());
        }

        self.processes.launch(&argv, &spec.env, &path).await
    }

    /// Record a startup failure: log it, mark the kernel dead and give back
    /// its resources.
    async fn fail_start(&self, err: KSError) -> KSError {
        log::error!("[kernel {}] {}", self.kernel_id, err);
        {
            let mut state = self.state.write().await;
            state.advance(LifecycleState::Dead, "startup failed");
            state.release_resources(&self.ports);
        }
        self.exit_event.notify(usize::MAX);
        err
    }

    /// Wait in the background for the kernel process to exit.
    fn monitor_exit(&self, handle: ProcessHandle) {
        let kernel_id = self.kernel_id.clone();
        let state = self.state.clone();
        let exit_event = self.exit_event.clone();
        let ports = self.ports.clone();

        tokio::spawn(async move {
            let code = handle.exit.await.unwrap_or(None);
            {
                let mut state = state.write().await;
                state.exit_code = code;
                if state.advance(LifecycleState::Dead, "process exited") {
                    log::warn!(
                        "[kernel {}] Kernel process exited unexpectedly (code: {:?})",
                        kernel_id,
                        code
                    );
                }
                state.release_resources(&ports);
            }

            // Notify anyone listening that the kernel has exited
            exit_event.notify(usize::MAX);
        });
    }

    /// Stop the kernel, terminating its process. Stopping a kernel that is
    /// already stopping or stopped does nothing.
    pub async fn stop(&self) -> Result<(), KSError> {
        let pid = {
            let mut state = self.state.write().await;
            if state.lifecycle >= LifecycleState::ShuttingDown {
                return Ok(());
            }
            if state.lifecycle == LifecycleState::Unstarted {
                state.advance(LifecycleState::Dead, "stopped before start");
                return Ok(());
            }
            state.advance(LifecycleState::ShuttingDown, "stop requested");
            state.process_id
        };

        log::info!("[kernel {}] Stopping kernel", self.kernel_id);

        let outcome = match pid {
            Some(pid) => self.processes.kill(pid).await,
            None => KillOutcome::AlreadyGone,
        };

        {
            let mut state = self.state.write().await;
            state.advance(LifecycleState::Dead, "stopped");
            state.release_resources(&self.ports);
        }
        self.exit_event.notify(usize::MAX);

        match (pid, outcome) {
            (_, KillOutcome::Killed) | (_, KillOutcome::AlreadyGone) => Ok(()),
            (Some(pid), KillOutcome::PermissionDenied) => Err(KSError::ProcessTermination(
                pid,
                String::from("permission denied"),
            )),
            (Some(pid), KillOutcome::Failed(reason)) => {
                Err(KSError::ProcessTermination(pid, reason))
            }
            (None, _) => Ok(()),
        }
    }

    pub async fn lifecycle(&self) -> LifecycleState {
        self.state.read().await.lifecycle
    }

    pub async fn process_id(&self) -> Option<u32> {
        self.state.read().await.process_id
    }

    /// The kernel's connection file, once it has been written.
    pub async fn connection_file(&self) -> Option<ConnectionFile> {
        self.state.read().await.connection_file.clone()
    }

    /// Where the kernel's connection file is written.
    pub fn connection_file_path(&self) -> PathBuf {
        self.config
            .connection_dir
            .join(format!("kernel-{}.json", self.kernel_id))
    }

    pub async fn record_activity(&self) {
        self.state.write().await.record_activity();
    }

    pub async fn set_execution_state(&self, execution_state: &str) {
        let mut state = self.state.write().await;
        state.set_execution_state(execution_state);
        state.record_activity();
    }

    pub async fn connection_opened(&self) -> u32 {
        let mut state = self.state.write().await;
        state.connections += 1;
        state.connections
    }

    pub async fn connection_closed(&self) -> u32 {
        let mut state = self.state.write().await;
        state.connections = state.connections.saturating_sub(1);
        state.connections
    }

    /// Describe the kernel for the kernel API.
    pub async fn to_model(&self) -> KernelModel {
        let state = self.state.read().await;
        KernelModel {
            id: self.kernel_id.clone(),
            name: self.kernel_name.clone(),
            last_activity: state.last_activity,
            execution_state: state.execution_state.clone(),
            state: state.lifecycle,
            connection_count: state.connections,
        }
    }
}
