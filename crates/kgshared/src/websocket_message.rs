//
// websocket_message.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

use serde::{Deserialize, Serialize};

use crate::{jupyter_message::JupyterMessage, kernel_message::KernelMessage};

/// A message sent over a WebSocket connection. This message can be either a
/// Jupyter message (conforming roughly to the Jupyter kernel protocol) or a
/// kernel message (sent from the gateway concerning the kernel itself).
///
/// On the wire both are JSON objects tagged with a `kind` field. A Jupyter
/// message keeps the standard fields (`header`, `parent_header`, `channel`,
/// `content`, `metadata`, `buffers`) at the top level, so clients that ignore
/// unknown fields read it as a plain Jupyter message:
///
/// ```json
/// {"kind": "jupyter", "header": {...}, "parent_header": {...},
///  "channel": "iopub", "content": {...}, "metadata": {}, "buffers": []}
/// ```
///
/// Kernel messages have no `header` or `channel`. Clients that only speak the
/// Jupyter protocol should skip any message whose `kind` is `"kernel"`:
///
/// ```json
/// {"kind": "kernel", "status": "offline"}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum WebsocketMessage {
    /// Kernel messages are messages about the kernel itself that are outside
    /// the bounds of the Jupyter protocol, such as exit and heartbeat
    /// notifications.
    #[serde(rename = "kernel")]
    Kernel(KernelMessage),

    /// Jupyter messages are messages that conform to the Jupyter protocol. They
    /// are not interpreted by the gateway, but are passed through to the
    /// client.
    #[serde(rename = "jupyter")]
    Jupyter(JupyterMessage),
}
