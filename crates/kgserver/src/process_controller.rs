//
// process_controller.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

//! Launching and terminating kernel processes.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;

use crate::error::KSError;

/// A running process started by a `ProcessController`.
pub struct ProcessHandle {
    /// The OS process ID
    pub pid: u32,

    /// Resolves with the exit code once the process exits. The code is None
    /// when the process was terminated by a signal.
    pub exit: oneshot::Receiver<Option<i32>>,
}

/// The result of asking the OS to terminate a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillOutcome {
    /// The process was signalled
    Killed,

    /// There was no such process; it had already exited
    AlreadyGone,

    /// The gateway isn't allowed to signal the process
    PermissionDenied,

    /// Any other failure
    Failed(String),
}

impl KillOutcome {
    /// Whether the process can be considered gone.
    pub fn is_success(&self) -> bool {
        matches!(self, KillOutcome::Killed | KillOutcome::AlreadyGone)
    }
}

/// Starts and stops the OS processes that host kernels.
#[async_trait]
pub trait ProcessController: Send + Sync {
    /// Launch a process. Occurrences of `{connection_file}` in `argv` are
    /// replaced with `connection_file`; `env` is added to the gateway's own
    /// environment.
    async fn launch(
        &self,
        argv: &[String],
        env: &HashMap<String, String>,
        connection_file: &Path,
    ) -> Result<ProcessHandle, KSError>;

    /// Forcibly terminate a process.
    async fn kill(&self, pid: u32) -> KillOutcome;
}

/// Substitute the connection file path in argv.
pub fn substitute_connection_file(argv: &[String], connection_file: &Path) -> Vec<String> {
    let path = connection_file.to_string_lossy();
    argv.iter()
        .map(|arg| {
            if arg.contains("{connection_file}") {
                arg.replace("{connection_file}", &path)
            } else {
                arg.clone()
            }
        })
        .collect()
}

/// Runs kernels as child processes of the gateway.
#[derive(Default)]
pub struct LocalProcessController;

impl LocalProcessController {
    pub fn new() -> Self {
        Self
    }

    /// Copy a child's output stream, line by line, to one of the gateway's own
    /// standard streams.
    fn relay_output<R, W>(pid: u32, stream: R, mut sink: W)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let mut reader = tokio::io::BufReader::new(stream);
            let mut buffer = String::new();
            loop {
                buffer.clear();
                match reader.read_line(&mut buffer).await {
                    Ok(0) => {
                        log::debug!("End of output stream for process {}", pid);
                        break;
                    }
                    Ok(_) => {
                        if let Err(e) = sink.write_all(buffer.as_bytes()).await {
                            log::warn!("Failed to relay output of process {}: {}", pid, e);
                            break;
                        }
                        let _ = sink.flush().await;
                    }
                    Err(e) => {
                        log::error!("Failed to read output of process {}: {}", pid, e);
                        break;
                    }
                }
            }
        });
    }
}

#[async_trait]
impl ProcessController for LocalProcessController {
    async fn launch(
        &self,
        argv: &[String],
        env: &HashMap<String, String>,
        connection_file: &Path,
    ) -> Result<ProcessHandle, KSError> {
        let argv = substitute_connection_file(argv, connection_file);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| KSError::ProcessLaunch(anyhow::anyhow!("No arguments provided")))?;

        let mut child = tokio::process::Command::new(program)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| KSError::ProcessLaunch(anyhow::anyhow!("{}: {}", program, e)))?;

        let pid = child
            .id()
            .ok_or_else(|| KSError::ProcessLaunch(anyhow::anyhow!("{} exited at once", program)))?;
        log::debug!("Started process {}: {}", pid, argv.join(" "));

        if let Some(stdout) = child.stdout.take() {
            Self::relay_output(pid, stdout, tokio::io::stdout());
        }
        if let Some(stderr) = child.stderr.take() {
            Self::relay_output(pid, stderr, tokio::io::stderr());
        }

        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            // Hold the kernel's stdin open for as long as it runs
            let _stdin = child.stdin.take();
            let code = match child.wait().await {
                Ok(status) => {
                    log::info!("Process {} exited with status: {}", pid, status);
                    status.code()
                }
                Err(e) => {
                    log::error!("Failed to wait on process {}: {}", pid, e);
                    None
                }
            };
            let _ = exit_tx.send(code);
        });

        Ok(ProcessHandle { pid, exit: exit_rx })
    }

    async fn kill(&self, pid: u32) -> KillOutcome {
        let outcome = kill_process(pid);
        match outcome {
            KillOutcome::Killed => log::debug!("Killed process {}", pid),
            KillOutcome::AlreadyGone => {
                log::debug!("Process {} was already gone", pid)
            }
            KillOutcome::PermissionDenied => {
                log::warn!("Not permitted to kill process {}", pid)
            }
            KillOutcome::Failed(ref reason) => {
                log::error!("Failed to kill process {}: {}", pid, reason)
            }
        }
        outcome
    }
}

#[cfg(unix)]
fn kill_process(pid: u32) -> KillOutcome {
    let pid = match libc::pid_t::try_from(pid) {
        Ok(pid) if pid > 0 => pid,
        _ => return KillOutcome::Failed(format!("invalid pid {}", pid)),
    };

    // SAFETY: kill() has no memory safety requirements
    let ret = unsafe { libc::kill(pid, libc::SIGKILL) };
    if ret == 0 {
        return KillOutcome::Killed;
    }

    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => KillOutcome::AlreadyGone,
        Some(libc::EPERM) => KillOutcome::PermissionDenied,
        _ => KillOutcome::Failed(err.to_string()),
    }
}

#[cfg(not(unix))]
fn kill_process(pid: u32) -> KillOutcome {
    use sysinfo::{Pid, System};

    let mut system = System::new();
    let pid = Pid::from_u32(pid);
    system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]));
    match system.process(pid) {
        Some(process) => {
            if process.kill() {
                KillOutcome::Killed
            } else {
                KillOutcome::Failed(String::from("the OS refused to terminate the process"))
            }
        }
        None => KillOutcome::AlreadyGone,
    }
}
