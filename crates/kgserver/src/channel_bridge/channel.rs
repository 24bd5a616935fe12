//
// channel.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

//! The per-channel loops that move messages between a kernel's sockets and
//! a client.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_channel::Receiver;
use kgshared::{jupyter_message::JupyterChannel, websocket_message::WebsocketMessage};
use tokio::select;
use zeromq::{
    util::PeerIdentity, DealerSocket, Socket, SocketOptions, SocketRecv, SocketSend, ZmqMessage,
};

use crate::{
    error::KSError,
    jupyter_messages::JupyterMsg,
    kernel_manager::KernelManager,
};

use super::{cancel::CancelToken, delivery_queue::DeliveryQueue};

/// What every channel loop of one client connection shares.
#[derive(Clone)]
pub struct ChannelContext {
    /// The ID of the client connection, for logging
    pub client_id: String,

    /// The kernel the client is attached to
    pub kernel: Arc<KernelManager>,

    /// Messages waiting to be written to the client
    pub queue: Arc<DeliveryQueue>,

    /// Stops the connection
    pub cancel: CancelToken,
}

impl ChannelContext {
    /// Decode a message received from the kernel and queue it for the client.
    /// Messages that fail to verify or decode are logged and dropped.
    pub async fn forward(&self, channel: JupyterChannel, message: ZmqMessage) {
        let message = match self.kernel.session.decode(message, channel) {
            Ok(message) => message,
            Err(err) => {
                log::warn!(
                    "[client {}] Dropping message from {} socket: {}",
                    self.client_id,
                    channel,
                    err
                );
                return;
            }
        };

        match JupyterMsg::from(&message) {
            JupyterMsg::Status(status) => {
                self.kernel
                    .set_execution_state(status.execution_state.as_str())
                    .await;
            }
            _ => {
                self.kernel.record_activity().await;
            }
        }

        log::trace!(
            "[client {}] Got {} message {} from {} socket",
            self.client_id,
            message.header.msg_type,
            message.header.msg_id,
            channel
        );

        if !self.queue.push(WebsocketMessage::Jupyter(message)) {
            log::trace!(
                "[client {}] Delivery queue is full; dropped {} message",
                self.client_id,
                channel
            );
        }
    }
}

/// Creates the socket options for DEALER sockets to set the peer identity
/// to the given identity.
pub fn dealer_peer_opts(identity: &str) -> Result<SocketOptions, KSError> {
    let mut peer_opts = SocketOptions::default();
    let peer_id = PeerIdentity::from_str(identity).map_err(|e| {
        KSError::ChannelConnect(
            String::from("shell"),
            anyhow::anyhow!("invalid peer identity '{}': {}", identity, e),
        )
    })?;
    peer_opts.peer_identity(peer_id);
    Ok(peer_opts)
}

/// Connect a socket to a kernel endpoint, giving up after `timeout`.
pub async fn connect_socket<S: Socket>(
    socket: &mut S,
    channel: JupyterChannel,
    endpoint: &str,
    timeout: Duration,
) -> Result<(), KSError> {
    match tokio::time::timeout(timeout, socket.connect(endpoint)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(KSError::ChannelConnect(
            channel.to_string(),
            anyhow::anyhow!("{}: {}", endpoint, e),
        )),
        Err(_) => Err(KSError::ChannelConnect(
            channel.to_string(),
            anyhow::anyhow!("{}: timed out after {:?}", endpoint, timeout),
        )),
    }
}

enum LoopEvent {
    Received(zeromq::ZmqResult<ZmqMessage>),
    Outbound(Option<ZmqMessage>),
}

async fn next_outbound(outbound: &Option<Receiver<ZmqMessage>>) -> Option<ZmqMessage> {
    match outbound {
        Some(rx) => rx.recv().await.ok(),
        None => std::future::pending().await,
    }
}

/// Run a request/reply channel (shell, control, stdin): forward everything
/// the kernel sends to the client, and send the client's requests from
/// `outbound` to the kernel. Returns the socket once the connection is
/// cancelled.
pub async fn request_loop(
    ctx: ChannelContext,
    channel: JupyterChannel,
    mut socket: DealerSocket,
    mut outbound: Option<Receiver<ZmqMessage>>,
) -> DealerSocket {
    log::debug!("[client {}] Starting {} loop", ctx.client_id, channel);
    loop {
        let event = select! {
            _ = ctx.cancel.cancelled() => break,
            received = socket.recv() => LoopEvent::Received(received),
            message = next_outbound(&outbound) => LoopEvent::Outbound(message),
        };

        match event {
            LoopEvent::Received(Ok(message)) => {
                ctx.forward(channel, message).await;
            }
            LoopEvent::Received(Err(e)) => {
                log::error!(
                    "[client {}] Failed to receive message from {} socket: {}",
                    ctx.client_id,
                    channel,
                    e
                );
                ctx.cancel.cancel();
                break;
            }
            LoopEvent::Outbound(Some(message)) => {
                if let Err(e) = socket.send(message).await {
                    log::error!(
                        "[client {}] Failed to send message to {} socket: {}",
                        ctx.client_id,
                        channel,
                        e
                    );
                    ctx.cancel.cancel();
                    break;
                }
                log::trace!("[client {}] Sent message to {} socket", ctx.client_id, channel);
            }
            LoopEvent::Outbound(None) => {
                // Every sender is gone; nothing more will be sent
                outbound = None;
            }
        }
    }
    log::debug!("[client {}] Ending {} loop", ctx.client_id, channel);
    socket
}

/// Run a receive-only channel (iopub): forward everything the kernel
/// publishes to the client. Returns the socket once the connection is
/// cancelled.
pub async fn receive_loop<S: SocketRecv + Send>(
    ctx: ChannelContext,
    channel: JupyterChannel,
    mut socket: S,
) -> S {
    log::debug!("[client {}] Starting {} loop", ctx.client_id, channel);
    loop {
        let received = select! {
            _ = ctx.cancel.cancelled() => break,
            received = socket.recv() => received,
        };

        match received {
            Ok(message) => ctx.forward(channel, message).await,
            Err(e) => {
                log::error!(
                    "[client {}] Failed to receive message from {} socket: {}",
                    ctx.client_id,
                    channel,
                    e
                );
                ctx.cancel.cancel();
                break;
            }
        }
    }
    log::debug!("[client {}] Ending {} loop", ctx.client_id, channel);
    socket
}
