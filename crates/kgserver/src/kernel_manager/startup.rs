//
// startup.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

//! Kernel startup logic and coordination.

use std::process::Stdio;
use std::time::Duration;

use crate::error::KSError;

/// How long an interpreter gets to answer `--version`
const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Coordinates the kernel startup process.
pub struct StartupCoordinator {
    /// Kernel ID for logging
    pub kernel_id: String,

    /// Interpreters to try in place of a bare `python`/`python3`
    pub python_candidates: Vec<String>,
}

impl StartupCoordinator {
    pub fn new(kernel_id: String, python_candidates: Vec<String>) -> Self {
        Self {
            kernel_id,
            python_candidates,
        }
    }

    /// Resolve a kernelspec's argv into the command line to launch.
    ///
    /// A leading `python` or `python3` is replaced with the first configured
    /// interpreter that runs. If none does, the argv is left as is.
    pub async fn resolve_argv(&self, argv: &[String]) -> Result<Vec<String>, KSError> {
        let mut argv = argv.to_vec();
        let first = match argv.first() {
            Some(first) => first.clone(),
            None => {
                return Err(KSError::ProcessLaunch(anyhow::anyhow!(
                    "Kernelspec has an empty argv"
                )));
            }
        };

        if first != "python" && first != "python3" {
            return Ok(argv);
        }

        for candidate in &self.python_candidates {
            if Self::interpreter_runs(candidate).await {
                log::debug!(
                    "[kernel {}] Using interpreter '{}' for '{}'",
                    self.kernel_id,
                    candidate,
                    first
                );
                argv[0] = candidate.clone();
                return Ok(argv);
            }
            log::trace!(
                "[kernel {}] Interpreter '{}' is not usable",
                self.kernel_id,
                candidate
            );
        }

        log::warn!(
            "[kernel {}] None of the interpreters {:?} could be run; launching '{}' as is",
            self.kernel_id,
            self.python_candidates,
            first
        );
        Ok(argv)
    }

    /// Check that an interpreter exists and runs by asking for its version.
    async fn interpreter_runs(candidate: &str) -> bool {
        let status = tokio::process::Command::new(candidate)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();
        matches!(
            tokio::time::timeout(VERSION_CHECK_TIMEOUT, status).await,
            Ok(Ok(status)) if status.success()
        )
    }
}
