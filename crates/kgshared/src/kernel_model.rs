//
// kernel_model.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The lifecycle state of a kernel process as seen by the gateway.
///
/// States are declared in lifecycle order; a kernel only ever moves forward
/// through them, so the derived ordering doubles as the transition rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// The kernel has been created but not started
    Unstarted,
    /// The kernel's descriptor is being prepared and its process launched
    Starting,
    /// The kernel process has been spawned
    Ready,
    /// The kernel process is being terminated
    ShuttingDown,
    /// The kernel process is gone
    Dead,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LifecycleState::Unstarted => "unstarted",
            LifecycleState::Starting => "starting",
            LifecycleState::Ready => "ready",
            LifecycleState::ShuttingDown => "shutting_down",
            LifecycleState::Dead => "dead",
        };
        f.write_str(name)
    }
}

/// A kernel, as listed by the gateway's kernel API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelModel {
    /// The unique ID of the kernel
    pub id: String,

    /// The name of the kernelspec the kernel was started from
    pub name: String,

    /// The last time a message was exchanged with the kernel
    pub last_activity: DateTime<Utc>,

    /// The kernel's most recently reported execution state ("starting",
    /// "idle", "busy", ...)
    pub execution_state: String,

    /// The kernel's lifecycle state
    pub state: LifecycleState,

    /// The number of clients currently attached to the kernel
    pub connection_count: u32,
}

/// The body of a request to start a new kernel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartKernelRequest {
    /// The name of the kernelspec to start
    pub name: String,
}

/// An error returned by the gateway's kernel API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    /// A short error code, e.g. "KS-7"
    pub code: String,

    /// A human-readable description of the error
    pub message: String,
}

/// A kernelspec, as read from a `kernel.json` file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct KernelSpec {
    /// The command line used to start the kernel. May contain the
    /// `{connection_file}` placeholder.
    pub argv: Vec<String>,

    /// The kernel's human-readable name
    #[serde(default)]
    pub display_name: String,

    /// The language the kernel runs
    #[serde(default)]
    pub language: String,

    /// Environment variables to set for the kernel process
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// How the kernel expects to be interrupted ("signal" or "message")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupt_mode: Option<String>,

    /// The directory the kernelspec was read from
    #[serde(skip)]
    pub resource_dir: PathBuf,
}

/// A kernelspec as served by the kernelspec API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelSpecModel {
    /// The name the kernelspec is started by
    pub name: String,

    /// The kernelspec itself
    pub spec: KernelSpec,

    /// URLs of the resource files shipped with the kernelspec (logos,
    /// `kernel.js`, `kernel.css`), keyed by resource name
    pub resources: BTreeMap<String, String>,
}

/// Every available kernelspec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelSpecList {
    /// The kernelspec started when a client doesn't name one
    pub default: String,

    /// The kernelspecs, keyed by name
    pub kernelspecs: BTreeMap<String, KernelSpecModel>,
}
