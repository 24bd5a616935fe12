//
// jupyter_message.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

use serde::{Deserialize, Serialize};

/// The header of a Jupyter message.
///
/// Clients may omit everything but the message type; the server fills in the
/// remaining fields from the kernel's signing session before the message is
/// put on the wire.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct JupyterMessageHeader {
    /// The message ID
    #[serde(default)]
    pub msg_id: String,

    /// The type of the message
    pub msg_type: String,

    /// The user who sent the message
    #[serde(default)]
    pub username: String,

    /// The signing session that sent the message
    #[serde(default)]
    pub session: String,

    /// The date/time the message was created, as an ISO 8601 string in UTC
    #[serde(default)]
    pub date: String,

    /// The version of the Jupyter protocol
    #[serde(default)]
    pub version: String,
}

/// The set of all Jupyter sockets ("channels") over which messages are sent and
/// received.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JupyterChannel {
    /// The shell channel
    Shell,

    /// The control channel
    Control,

    /// The stdin channel
    Stdin,

    /// The iopub channel
    IOPub,

    /// The heartbeat channel
    Heartbeat,
}

impl JupyterChannel {
    /// The name of the channel as it appears on the wire and in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            JupyterChannel::Shell => "shell",
            JupyterChannel::Control => "control",
            JupyterChannel::Stdin => "stdin",
            JupyterChannel::IOPub => "iopub",
            JupyterChannel::Heartbeat => "heartbeat",
        }
    }
}

impl std::fmt::Display for JupyterChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A serialized Jupyter message.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct JupyterMessage {
    /// The header of the message
    pub header: JupyterMessageHeader,

    /// The header of the message's parent (the message that caused this message)
    pub parent_header: Option<JupyterMessageHeader>,

    /// The channel on which the message was sent (or is to be sent)
    pub channel: JupyterChannel,

    /// The message payload
    pub content: serde_json::Value,

    /// Additional metadata
    pub metadata: serde_json::Value,

    /// The message buffers, hex encoded
    #[serde(default)]
    pub buffers: Vec<String>,
}
