//
// jupyter_messages.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

use kgshared::jupyter_message::JupyterMessage;
use serde::Deserialize;

/// An enum of message types we know how to handle from Jupyter. This is in no
/// way exhaustive; it just includes the types the gateway looks inside.
pub enum JupyterMsg {
    KernelInfoReply(serde_json::Value),
    ExecuteRequest(JupyterExecuteRequest),
    ShutdownRequest,
    Status(JupyterStatus),
    Other,
}

/// Convert a JupyterMessage (generic type) into a JupyterMsg (specific type)
impl From<&JupyterMessage> for JupyterMsg {
    fn from(msg: &JupyterMessage) -> Self {
        match msg.header.msg_type.as_str() {
            "kernel_info_reply" => JupyterMsg::KernelInfoReply(msg.content.clone()),
            "execute_request" => {
                match serde_json::from_value::<JupyterExecuteRequest>(msg.content.clone()) {
                    Ok(content) => JupyterMsg::ExecuteRequest(content),
                    Err(_) => JupyterMsg::Other,
                }
            }
            "status" => match serde_json::from_value::<JupyterStatus>(msg.content.clone()) {
                Ok(content) => JupyterMsg::Status(content),
                Err(_) => JupyterMsg::Other,
            },
            "shutdown_request" => JupyterMsg::ShutdownRequest,
            _ => JupyterMsg::Other,
        }
    }
}

#[derive(Deserialize)]
pub struct JupyterExecuteRequest {
    pub code: String,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Starting,
    Busy,
    Idle,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Starting => "starting",
            ExecutionState::Busy => "busy",
            ExecutionState::Idle => "idle",
        }
    }
}

#[derive(Deserialize)]
pub struct JupyterStatus {
    pub execution_state: ExecutionState,
}
