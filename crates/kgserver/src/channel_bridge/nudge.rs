//
// nudge.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

//! The readiness check run when a client attaches to a kernel.

use std::time::Duration;

use kgshared::jupyter_message::JupyterChannel;
use tokio::select;
use zeromq::{DealerSocket, Socket, SocketRecv, SocketSend, SubSocket};

use crate::{error::KSError, jupyter_messages::JupyterMsg};

use super::channel::{connect_socket, ChannelContext};

/// How a nudge ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NudgeOutcome {
    /// The kernel answered the `kernel_info_request`
    ShellReply,

    /// The kernel published something on iopub
    IOPubActivity,

    /// Neither happened in time
    TimedOut,
}

/// Send a `kernel_info_request` on a transient shell socket and wait up to
/// `wait` for a reply there or any message on `iopub`.
///
/// An iopub message received while waiting is forwarded to the client. A
/// timeout is logged and reported, not treated as an error.
pub async fn nudge(
    ctx: &ChannelContext,
    iopub: &mut SubSocket,
    shell_endpoint: &str,
    wait: Duration,
    connect_timeout: Duration,
) -> Result<NudgeOutcome, KSError> {
    let session = &ctx.kernel.session;

    let mut shell = DealerSocket::new();
    connect_socket(&mut shell, JupyterChannel::Shell, shell_endpoint, connect_timeout).await?;

    let request = session.make_request("kernel_info_request", JupyterChannel::Shell);
    let request_id = request.header.msg_id.clone();
    let wire = session.encode(&request)?;
    if let Err(e) = shell.send(wire.into()).await {
        let _ = shell.close().await;
        return Err(KSError::ChannelConnect(
            JupyterChannel::Shell.to_string(),
            anyhow::anyhow!("failed to send kernel_info_request: {}", e),
        ));
    }
    log::debug!(
        "[client {}] Sent kernel_info_request {}; waiting up to {:?} for the kernel",
        ctx.client_id,
        request_id,
        wait
    );

    let deadline = tokio::time::sleep(wait);
    tokio::pin!(deadline);

    let outcome = loop {
        select! {
            _ = &mut deadline => break NudgeOutcome::TimedOut,
            reply = shell.recv() => {
                let reply = match reply {
                    Ok(reply) => reply,
                    Err(e) => {
                        log::warn!("[client {}] Failed to receive kernel_info_reply: {}", ctx.client_id, e);
                        break NudgeOutcome::TimedOut;
                    }
                };
                match session.decode(reply, JupyterChannel::Shell) {
                    Ok(reply) => {
                        let answers_request = reply
                            .parent_header
                            .as_ref()
                            .map(|parent| parent.msg_id == request_id)
                            .unwrap_or(false);
                        if answers_request {
                            if let JupyterMsg::KernelInfoReply(info) = JupyterMsg::from(&reply) {
                                log::debug!(
                                    "[client {}] Kernel implementation: {}",
                                    ctx.client_id,
                                    info["implementation"].as_str().unwrap_or("unknown")
                                );
                            }
                            break NudgeOutcome::ShellReply;
                        }
                        log::debug!(
                            "[client {}] Ignoring unexpected {} on nudge socket",
                            ctx.client_id,
                            reply.header.msg_type
                        );
                    }
                    Err(err) => {
                        log::warn!("[client {}] Dropping reply on nudge socket: {}", ctx.client_id, err);
                    }
                }
            },
            published = iopub.recv() => {
                match published {
                    Ok(message) => {
                        ctx.forward(JupyterChannel::IOPub, message).await;
                        break NudgeOutcome::IOPubActivity;
                    }
                    Err(e) => {
                        let _ = shell.close().await;
                        return Err(KSError::ChannelConnect(
                            JupyterChannel::IOPub.to_string(),
                            anyhow::anyhow!("{}", e),
                        ));
                    }
                }
            },
        }
    };

    let _ = shell.close().await;

    match outcome {
        NudgeOutcome::TimedOut => {
            log::warn!(
                "[client {}] {}; proceeding anyway",
                ctx.client_id,
                KSError::NudgeTimeout(wait)
            );
        }
        _ => {
            log::debug!(
                "[client {}] Kernel is responsive ({:?})",
                ctx.client_id,
                outcome
            );
        }
    }
    Ok(outcome)
}
