//
// error.rs
//
// Copyright (C) 2024 Posit Software, PBC. All rights reserved.
//
//

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use kgshared::kernel_model::{ApiError, LifecycleState};
use log::error;

#[derive(Debug)]
pub enum KSError {
    ProcessLaunch(anyhow::Error),
    Signature(String),
    Decode(String),
    PortAllocation(String, u32),
    ProcessTermination(u32, String),
    NudgeTimeout(Duration),
    NotFound(String),
    KernelSpecNotFound(String),
    KernelNotReady(String, LifecycleState),
    ChannelConnect(String, anyhow::Error),
    DescriptorWrite(PathBuf, anyhow::Error),
}

impl fmt::Display for KSError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Error KS-{}: ", self.code())?;
        match self {
            KSError::ProcessLaunch(err) => {
                write!(f, "Failed to launch kernel process: {}", err)
            }
            KSError::Signature(reason) => {
                write!(f, "Message signature rejected: {}", reason)
            }
            KSError::Decode(reason) => {
                write!(f, "Failed to decode message: {}", reason)
            }
            KSError::PortAllocation(channel, attempts) => {
                write!(
                    f,
                    "Failed to allocate a port for the {} channel after {} attempts",
                    channel, attempts
                )
            }
            KSError::ProcessTermination(pid, reason) => {
                write!(f, "Failed to terminate process {}: {}", pid, reason)
            }
            KSError::NudgeTimeout(timeout) => {
                write!(
                    f,
                    "Kernel did not respond to the initial request within {:?}",
                    timeout
                )
            }
            KSError::NotFound(kernel_id) => {
                write!(f, "Kernel {} not found", kernel_id)
            }
            KSError::KernelSpecNotFound(name) => {
                write!(f, "No kernelspec named '{}'", name)
            }
            KSError::KernelNotReady(kernel_id, state) => {
                write!(f, "Kernel {} is not ready (state: {})", kernel_id, state)
            }
            KSError::ChannelConnect(channel, err) => {
                write!(f, "Failed to connect to the {} channel: {}", channel, err)
            }
            KSError::DescriptorWrite(path, err) => {
                write!(
                    f,
                    "Failed to write connection file {}: {}",
                    path.display(),
                    err
                )
            }
        }
    }
}

impl std::error::Error for KSError {}

impl KSError {
    /// The stable numeric code of the error, reported as `KS-<code>`.
    pub fn code(&self) -> u8 {
        match self {
            KSError::ProcessLaunch(_) => 1,
            KSError::Signature(_) => 2,
            KSError::Decode(_) => 3,
            KSError::PortAllocation(_, _) => 4,
            KSError::ProcessTermination(_, _) => 5,
            KSError::NudgeTimeout(_) => 6,
            KSError::NotFound(_) => 7,
            KSError::KernelSpecNotFound(_) => 8,
            KSError::KernelNotReady(_, _) => 9,
            KSError::ChannelConnect(_, _) => 10,
            KSError::DescriptorWrite(_, _) => 11,
        }
    }

    pub fn to_json(&self) -> ApiError {
        ApiError {
            code: format!("KS-{}", self.code()),
            message: self.to_string(),
        }
    }

    pub fn log(&self) {
        error!("{}", self.to_string());
    }
}
