//
// state.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use kgshared::kernel_model::LifecycleState;

use crate::connection_file::{ChannelPorts, ConnectionFile};
use crate::port_allocator::PortAllocator;

/// The mutable state of the kernel.
///
/// Does not implement the Clone trait; only one instance of the kernel state
/// should exist at a time.
#[derive(Debug)]
pub struct KernelState {
    /// The ID of the kernel this state belongs to
    pub kernel_id: String,

    /// Where the kernel is in its lifecycle
    pub lifecycle: LifecycleState,

    /// The current process ID of the kernel, or None if the kernel is not running.
    pub process_id: Option<u32>,

    /// The exit code of the kernel process, once it has exited
    pub exit_code: Option<i32>,

    /// The most recent execution state the kernel reported on iopub
    pub execution_state: String,

    /// The last time a message was exchanged with the kernel
    pub last_activity: DateTime<Utc>,

    /// The number of clients currently attached
    pub connections: u32,

    /// The kernel's connection file, once written
    pub connection_file: Option<ConnectionFile>,

    /// Where the connection file was written. Cleared once the file is removed.
    pub connection_file_path: Option<PathBuf>,

    /// Ports reserved for the kernel. Cleared once they are released.
    pub reserved_ports: Option<ChannelPorts>,
}

impl KernelState {
    pub fn new(kernel_id: String) -> Self {
        KernelState {
            kernel_id,
            lifecycle: LifecycleState::Unstarted,
            process_id: None,
            exit_code: None,
            execution_state: String::from("starting"),
            last_activity: Utc::now(),
            connections: 0,
            connection_file: None,
            connection_file_path: None,
            reserved_ports: None,
        }
    }

    /// Move the kernel to a later lifecycle state.
    ///
    /// Returns false, leaving the state unchanged, if `next` is not after the
    /// current state, or if `next` is `Ready` and no process ID is recorded.
    pub fn advance(&mut self, next: LifecycleState, reason: &str) -> bool {
        if next <= self.lifecycle {
            log::trace!(
                "[kernel {}] ignoring transition '{}' => '{}' ({})",
                self.kernel_id,
                self.lifecycle,
                next,
                reason
            );
            return false;
        }
        if next == LifecycleState::Ready && self.process_id.is_none() {
            log::warn!(
                "[kernel {}] refusing to mark kernel ready without a process ID",
                self.kernel_id
            );
            return false;
        }

        log::debug!(
            "[kernel {}] state '{}' => '{}' ({})",
            self.kernel_id,
            self.lifecycle,
            next,
            reason
        );
        self.lifecycle = next;

        if next == LifecycleState::Dead {
            self.process_id = None;
            self.execution_state = String::from("dead");
        }
        true
    }

    pub fn record_activity(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn set_execution_state(&mut self, execution_state: &str) {
        if self.lifecycle == LifecycleState::Dead || self.execution_state == execution_state {
            return;
        }
        log::trace!(
            "[kernel {}] execution state '{}' => '{}'",
            self.kernel_id,
            self.execution_state,
            execution_state
        );
        self.execution_state = execution_state.to_string();
    }

    /// Give back the kernel's ports and delete its connection file. Safe to
    /// call more than once.
    pub fn release_resources(&mut self, ports: &PortAllocator) {
        if let Some(reserved) = self.reserved_ports.take() {
            ports.release(&reserved);
        }
        if let Some(path) = self.connection_file_path.take() {
            match std::fs::remove_file(&path) {
                Ok(_) => {
                    log::trace!(
                        "[kernel {}] Removed connection file {:?}",
                        self.kernel_id,
                        path
                    );
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    log::warn!(
                        "[kernel {}] Failed to remove connection file {:?}: {}",
                        self.kernel_id,
                        path,
                        e
                    );
                }
            }
        }
    }
}
