//
// kernel_message.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

use serde::{Deserialize, Serialize};

/// A superset of Jupyter kernel statuses, as reported to connected clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelStatus {
    /// The kernel is in the process of starting
    Starting,
    /// The kernel is idle
    Idle,
    /// The kernel is busy
    Busy,
    /// The kernel is offline (it has not responded to a heartbeat message in the expected time)
    Offline,
    /// The kernel has exited
    Exited,
}

/// Messages that are sent from the gateway to the client about the kernel
/// itself. For messages bridging the Jupyter protocol, see `JupyterMessage`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelMessage {
    /// The kernel's status has changed
    Status(KernelStatus),

    /// The kernel has exited, with the given exit code if one is known
    Exited(Option<i32>),

    /// The gateway could not deliver every message to the client and dropped
    /// this many iopub messages
    Dropped(u64),
}
