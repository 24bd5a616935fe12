//
// heartbeat.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

use kgshared::{
    jupyter_message::JupyterChannel,
    kernel_message::{KernelMessage, KernelStatus},
    websocket_message::WebsocketMessage,
};
use tokio::time::{timeout, Duration};
use zeromq::{ReqSocket, Socket, SocketRecv, SocketSend};

use super::channel::{connect_socket, ChannelContext};

const HB_PAYLOAD: &str = "kernelgate-heartbeat";

/// A heartbeat monitor for one client connection. Lost and recovered
/// heartbeats are announced to the client as kernel status messages.
pub struct HeartbeatMonitor {
    ctx: ChannelContext,
    address: String,
    interval: Duration,
    timeout: Duration,
    connect_timeout: Duration,
}

impl HeartbeatMonitor {
    /// Create a new heartbeat monitor.
    ///
    /// # Arguments
    ///
    /// - `ctx`: The connection the monitor reports to.
    /// - `address`: The address of the heartbeat socket.
    pub fn new(ctx: ChannelContext, address: String) -> Self {
        let config = ctx.kernel.config.clone();
        Self {
            ctx,
            address,
            interval: config.heartbeat_interval,
            timeout: config.heartbeat_timeout,
            connect_timeout: config.connect_timeout,
        }
    }

    /// Monitor the kernel's heartbeat until the connection is cancelled.
    /// Returns the heartbeat socket, if one is still open.
    ///
    /// Every wait on the socket also waits on the connection's cancel token,
    /// so a client going away is never held up by an unresponsive kernel.
    pub async fn run(self, socket: ReqSocket) -> Option<ReqSocket> {
        let client_id = self.ctx.client_id.clone();
        let mut socket = Some(socket);
        let mut offline = false;
        let mut initial = true;

        loop {
            let mut hb_socket = match socket.take() {
                Some(hb_socket) => hb_socket,
                None => {
                    let reconnected = tokio::select! {
                        _ = self.ctx.cancel.cancelled() => break,
                        reconnected = self.reconnect() => reconnected,
                    };
                    match reconnected {
                        Some(hb_socket) => hb_socket,
                        None => {
                            self.mark_offline(&mut offline, "the heartbeat socket could not be reconnected");
                            if self.wait_or_exit().await {
                                break;
                            }
                            continue;
                        }
                    }
                }
            };

            log::trace!("[client {}] Sending heartbeat to kernel.", client_id);
            let sent = tokio::select! {
                _ = self.ctx.cancel.cancelled() => None,
                sent = timeout(self.timeout, hb_socket.send(HB_PAYLOAD.into())) => Some(sent),
            };
            match sent {
                None => {
                    socket = Some(hb_socket);
                    break;
                }
                Some(Ok(Ok(_))) => {}
                Some(failed) => {
                    match failed {
                        Ok(Err(e)) => {
                            log::warn!("[client {}] Failed to send heartbeat: {}", client_id, e)
                        }
                        _ => log::warn!("[client {}] Timed out sending heartbeat", client_id),
                    }
                    self.mark_offline(&mut offline, "the heartbeat could not be sent");
                    let _ = hb_socket.close().await;
                    if self.wait_or_exit().await {
                        break;
                    }
                    continue;
                }
            }

            let result = tokio::select! {
                _ = self.ctx.cancel.cancelled() => None,
                result = timeout(self.timeout, hb_socket.recv()) => Some(result),
            };
            let result = match result {
                Some(result) => result,
                None => {
                    socket = Some(hb_socket);
                    break;
                }
            };

            match result {
                Ok(Ok(_)) => {
                    if offline {
                        offline = false;
                        log::info!(
                            "[client {}] Heartbeat detected after offline; marking kernel online.",
                            client_id
                        );
                        self.announce(KernelStatus::Idle);
                    }
                    if initial {
                        initial = false;
                        log::info!(
                            "[client {}] Received initial heartbeat from kernel",
                            client_id
                        );
                    }
                    socket = Some(hb_socket);
                }
                Ok(Err(e)) => {
                    log::info!(
                        "[client {}] Error receiving heartbeat response: {:?}",
                        client_id,
                        e
                    );
                    self.mark_offline(&mut offline, "the heartbeat socket failed");
                    let _ = hb_socket.close().await;
                }
                Err(_) => {
                    self.mark_offline(&mut offline, "no heartbeat response arrived in time");
                    // A REQ socket can't send again until it gets a reply;
                    // start over with a new one
                    let _ = hb_socket.close().await;
                }
            }

            if self.wait_or_exit().await {
                break;
            }
        }

        log::debug!("[client {}] Stopping heartbeat monitor.", client_id);
        socket
    }

    fn announce(&self, status: KernelStatus) {
        self.ctx
            .queue
            .push(WebsocketMessage::Kernel(KernelMessage::Status(status)));
    }

    /// Tell the client the kernel is offline, unless it already knows.
    fn mark_offline(&self, offline: &mut bool, reason: &str) {
        if *offline {
            return;
        }
        *offline = true;
        log::error!(
            "[client {}] Lost the kernel's heartbeat ({}; timeout {:?}), marking kernel as offline.",
            self.ctx.client_id,
            reason,
            self.timeout
        );
        self.announce(KernelStatus::Offline);
    }

    async fn reconnect(&self) -> Option<ReqSocket> {
        let mut hb_socket = ReqSocket::new();
        match connect_socket(
            &mut hb_socket,
            JupyterChannel::Heartbeat,
            &self.address,
            self.connect_timeout,
        )
        .await
        {
            Ok(_) => Some(hb_socket),
            Err(err) => {
                log::warn!("[client {}] {}", self.ctx.client_id, err);
                None
            }
        }
    }

    /// Wait for the next heartbeat interval. Returns true if the connection
    /// was cancelled in the meantime.
    async fn wait_or_exit(&self) -> bool {
        tokio::select! {
            _ = self.ctx.cancel.cancelled() => true,
            _ = tokio::time::sleep(self.interval) => false,
        }
    }
}
