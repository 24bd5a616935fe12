//
// mod.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

//! Bridges a client's WebSocket to the ZeroMQ sockets of a kernel.

pub mod binary;
pub mod cancel;
pub mod channel;
pub mod delivery_queue;
pub mod heartbeat;
pub mod nudge;

use std::sync::Arc;

use async_channel::Sender;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use kgshared::{
    jupyter_message::{JupyterChannel, JupyterMessage, JupyterMessageHeader},
    kernel_message::{KernelMessage, KernelStatus},
    kernel_model::LifecycleState,
    websocket_message::WebsocketMessage,
};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use zeromq::{DealerSocket, ReqSocket, Socket, SubSocket, ZmqMessage};

use crate::{
    error::KSError,
    jupyter_messages::JupyterMsg,
    kernel_manager::KernelManager,
    kernel_session::make_message_id,
};

use self::{
    binary::{decode_binary_message, encode_binary_message},
    cancel::CancelToken,
    channel::{connect_socket, dealer_peer_opts, receive_loop, request_loop, ChannelContext},
    delivery_queue::DeliveryQueue,
    heartbeat::HeartbeatMonitor,
    nudge::{nudge, NudgeOutcome},
};

/// The interval between WebSocket pings sent to the client
const PING_INTERVAL: tokio::time::Duration = tokio::time::Duration::from_secs(10);

/// The sockets of one client connection, opened but not yet serving.
struct ChannelSockets {
    shell: DealerSocket,
    control: DealerSocket,
    stdin: DealerSocket,
    iopub: SubSocket,
    heartbeat: ReqSocket,
}

impl ChannelSockets {
    async fn close(self) {
        let _ = self.shell.close().await;
        let _ = self.control.close().await;
        let _ = self.stdin.close().await;
        let _ = self.iopub.close().await;
        let _ = self.heartbeat.close().await;
    }
}

/// One client's connection to a kernel, attached and ready to run.
pub struct ChannelBridge {
    ctx: ChannelContext,
    sockets: ChannelSockets,
    hb_address: String,
    nudge: NudgeOutcome,
}

/// The fields of a client message. Everything but the header's message type
/// may be omitted.
#[derive(Deserialize)]
struct ClientMessage {
    header: JupyterMessageHeader,
    #[serde(default)]
    parent_header: Option<serde_json::Value>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    content: serde_json::Value,
    #[serde(default)]
    metadata: serde_json::Value,
    #[serde(default)]
    buffers: Vec<String>,
}

/// Parse a message from the client and decide which kernel channel it goes
/// to: stdin if it is tagged "stdin", shell otherwise.
pub fn route_client_message(data: &str) -> Result<JupyterMessage, serde_json::Error> {
    let message: ClientMessage = serde_json::from_str(data)?;

    let channel = match message.channel.as_deref() {
        Some("stdin") => JupyterChannel::Stdin,
        _ => JupyterChannel::Shell,
    };

    let parent_header = match message.parent_header {
        Some(serde_json::Value::Object(map)) if !map.is_empty() => {
            Some(serde_json::from_value(serde_json::Value::Object(map))?)
        }
        _ => None,
    };

    let or_empty = |value: serde_json::Value| match value {
        serde_json::Value::Null => serde_json::json!({}),
        value => value,
    };

    Ok(JupyterMessage {
        header: message.header,
        parent_header,
        channel,
        content: or_empty(message.content),
        metadata: or_empty(message.metadata),
        buffers: message.buffers,
    })
}

/// Parse a binary frame from the client: the message JSON followed by its
/// buffers. Buffers carried in the frame replace any listed in the JSON.
pub fn route_binary_client_message(frame: &[u8]) -> Result<JupyterMessage, KSError> {
    let (json, buffers) = decode_binary_message(frame)?;
    let json = std::str::from_utf8(json)
        .map_err(|e| KSError::Decode(format!("message JSON is not UTF-8: {}", e)))?;
    let mut message =
        route_client_message(json).map_err(|e| KSError::Decode(e.to_string()))?;
    message.buffers = buffers.iter().map(hex::encode).collect();
    Ok(message)
}

impl ChannelBridge {
    /// Attach to a kernel: open its sockets and make sure it is responsive.
    ///
    /// The kernel must be `Ready`. The shell, control and stdin sockets are
    /// identified to the kernel by `session_id`.
    pub async fn attach(kernel: Arc<KernelManager>, session_id: &str) -> Result<Self, KSError> {
        let lifecycle = kernel.lifecycle().await;
        if lifecycle != LifecycleState::Ready {
            return Err(KSError::KernelNotReady(kernel.kernel_id.clone(), lifecycle));
        }
        let connection_file = match kernel.connection_file().await {
            Some(connection_file) => connection_file,
            None => {
                return Err(KSError::KernelNotReady(kernel.kernel_id.clone(), lifecycle));
            }
        };

        let identity = if session_id.is_empty() {
            make_message_id()
        } else {
            session_id.to_string()
        };
        let client_id = format!("{}/{}", kernel.kernel_id, identity);
        let config = kernel.config.clone();
        let connect_timeout = config.connect_timeout;

        let ctx = ChannelContext {
            client_id: client_id.clone(),
            queue: Arc::new(DeliveryQueue::new(config.delivery_queue_capacity)),
            cancel: CancelToken::new(),
            kernel,
        };

        // Subscribe first, so nothing published during the nudge is missed
        let mut iopub = SubSocket::new();
        connect_socket(
            &mut iopub,
            JupyterChannel::IOPub,
            &connection_file.channel_endpoint(JupyterChannel::IOPub),
            connect_timeout,
        )
        .await?;
        if let Err(e) = iopub.subscribe("").await {
            return Err(KSError::ChannelConnect(
                JupyterChannel::IOPub.to_string(),
                anyhow::anyhow!("failed to subscribe: {}", e),
            ));
        }

        let mut shell = DealerSocket::with_options(dealer_peer_opts(&identity)?);
        connect_socket(
            &mut shell,
            JupyterChannel::Shell,
            &connection_file.channel_endpoint(JupyterChannel::Shell),
            connect_timeout,
        )
        .await?;

        let mut control = DealerSocket::with_options(dealer_peer_opts(&identity)?);
        connect_socket(
            &mut control,
            JupyterChannel::Control,
            &connection_file.channel_endpoint(JupyterChannel::Control),
            connect_timeout,
        )
        .await?;

        let mut stdin = DealerSocket::with_options(dealer_peer_opts(&identity)?);
        connect_socket(
            &mut stdin,
            JupyterChannel::Stdin,
            &connection_file.channel_endpoint(JupyterChannel::Stdin),
            connect_timeout,
        )
        .await?;

        let mut heartbeat = ReqSocket::new();
        connect_socket(
            &mut heartbeat,
            JupyterChannel::Heartbeat,
            &connection_file.channel_endpoint(JupyterChannel::Heartbeat),
            connect_timeout,
        )
        .await?;

        log::debug!(
            "[client {}] Connected to kernel sockets ({}:{})",
            client_id,
            connection_file.ip,
            connection_file
                .ports()
                .to_vec()
                .iter()
                .map(|port| port.to_string())
                .collect::<Vec<_>>()
                .join(",")
        );

        let nudged = nudge(
            &ctx,
            &mut iopub,
            &connection_file.channel_endpoint(JupyterChannel::Shell),
            config.nudge_timeout,
            connect_timeout,
        )
        .await?;

        Ok(Self {
            ctx,
            sockets: ChannelSockets {
                shell,
                control,
                stdin,
                iopub,
                heartbeat,
            },
            hb_address: connection_file.channel_endpoint(JupyterChannel::Heartbeat),
            nudge: nudged,
        })
    }

    /// How the readiness check ended.
    pub fn nudge_outcome(&self) -> NudgeOutcome {
        self.nudge
    }

    /// Relay messages between the kernel and the client until the client
    /// disconnects, the kernel exits, or the connection is cancelled.
    pub async fn run<S>(self, ws_stream: WebSocketStream<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let ChannelBridge {
            ctx,
            sockets,
            hb_address,
            ..
        } = self;
        let client_id = ctx.client_id.clone();
        let kernel = ctx.kernel.clone();

        let connections = kernel.connection_opened().await;
        log::info!(
            "[client {}] Client attached ({} connection(s) to kernel)",
            client_id,
            connections
        );

        let (ws_sink, mut ws_read) = ws_stream.split();
        let ws_sink = Arc::new(Mutex::new(ws_sink));

        let (shell_tx, shell_rx) = async_channel::unbounded::<ZmqMessage>();
        let (stdin_tx, stdin_rx) = async_channel::unbounded::<ZmqMessage>();

        let ChannelSockets {
            shell,
            control,
            stdin,
            iopub,
            heartbeat,
        } = sockets;

        let shell_loop = tokio::spawn(request_loop(
            ctx.clone(),
            JupyterChannel::Shell,
            shell,
            Some(shell_rx),
        ));
        let control_loop = tokio::spawn(request_loop(
            ctx.clone(),
            JupyterChannel::Control,
            control,
            None,
        ));
        let stdin_loop = tokio::spawn(request_loop(
            ctx.clone(),
            JupyterChannel::Stdin,
            stdin,
            Some(stdin_rx),
        ));
        let iopub_loop = tokio::spawn(receive_loop(ctx.clone(), JupyterChannel::IOPub, iopub));
        let heartbeat_loop =
            tokio::spawn(HeartbeatMonitor::new(ctx.clone(), hb_address).run(heartbeat));
        let writer = tokio::spawn(write_loop(ctx.clone(), ws_sink.clone()));
        let exit_watch = tokio::spawn(watch_exit(ctx.clone()));

        read_loop(&ctx, &mut ws_read, &ws_sink, &shell_tx, &stdin_tx).await;

        // Teardown: stop everything, wait for every loop to finish, and only
        // then close the sockets
        ctx.cancel.cancel();
        ctx.queue.close();
        shell_tx.close();
        stdin_tx.close();

        let mut sockets_closed = 0;
        for handle in [shell_loop, control_loop, stdin_loop] {
            if let Some(socket) = join(&client_id, handle).await {
                let _ = socket.close().await;
                sockets_closed += 1;
            }
        }
        if let Some(socket) = join(&client_id, iopub_loop).await {
            let _ = socket.close().await;
            sockets_closed += 1;
        }
        if let Some(Some(socket)) = join(&client_id, heartbeat_loop).await {
            let _ = socket.close().await;
            sockets_closed += 1;
        }
        join(&client_id, writer).await;
        join(&client_id, exit_watch).await;
        log::trace!("[client {}] Closed {} kernel sockets", client_id, sockets_closed);

        {
            let mut sink = ws_sink.lock().await;
            if let Err(e) = sink.close().await {
                log::trace!("[client {}] Error closing websocket: {}", client_id, e);
            }
        }

        let connections = kernel.connection_closed().await;
        log::info!(
            "[client {}] Client detached ({} connection(s) to kernel remain)",
            client_id,
            connections
        );
    }

    /// Close the kernel sockets without running the bridge.
    pub async fn close(self) {
        self.ctx.cancel.cancel();
        self.sockets.close().await;
    }
}

async fn join<T>(client_id: &str, handle: JoinHandle<T>) -> Option<T> {
    match handle.await {
        Ok(value) => Some(value),
        Err(e) => {
            log::error!("[client {}] Connection task failed: {}", client_id, e);
            None
        }
    }
}

type WsSink<S> = Arc<Mutex<SplitSink<WebSocketStream<S>, Message>>>;

/// Read messages from the client and hand them to the kernel, pinging the
/// client periodically. Returns when the client goes away or the connection
/// is cancelled.
async fn read_loop<S>(
    ctx: &ChannelContext,
    ws_read: &mut futures::stream::SplitStream<WebSocketStream<S>>,
    ws_sink: &WsSink<S>,
    shell_tx: &Sender<ZmqMessage>,
    stdin_tx: &Sender<ZmqMessage>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let client_id = &ctx.client_id;

    // Interval timer for client pings
    let mut tick = tokio::time::interval(PING_INTERVAL);
    tick.tick().await;

    // Ping counters
    let mut ping_outbound: u64 = 0;
    let mut pong_inbound: u64 = 0;

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                log::debug!("[client {}] Connection cancelled", client_id);
                break;
            },
            from_socket = ws_read.next() => {
                let message = match from_socket {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        log::error!("[client {}] Failed to read data from websocket: {}", client_id, e);
                        break;
                    }
                    None => {
                        log::info!("[client {}] No data from websocket; closing", client_id);
                        break;
                    }
                };
                match message {
                    Message::Text(data) => {
                        match route_client_message(&data) {
                            Ok(message) => send_to_kernel(ctx, message, shell_tx, stdin_tx).await,
                            Err(e) => {
                                log::error!(
                                    "[client {}] Failed to parse Jupyter message: {}. Raw message: {:?}",
                                    client_id,
                                    e,
                                    data
                                );
                            }
                        }
                    },
                    Message::Ping(data) => {
                        // Tungstenite queues the pong; it goes out with the
                        // next write
                        log::trace!("[client {}] Got ping from websocket ({} bytes)", client_id, data.len());
                    },
                    Message::Pong(data) => {
                        let counter: Result<[u8; 8], _> = data.as_slice().try_into();
                        match counter {
                            Ok(counter) => {
                                pong_inbound = u64::from_be_bytes(counter);
                                log::trace!("[client {}] Got pong {} from websocket", client_id, pong_inbound);
                            }
                            Err(_) => {
                                log::warn!("[client {}] Got pong with invalid data size ({} bytes); ignoring", client_id, data.len());
                            }
                        }
                    },
                    Message::Binary(data) => {
                        match route_binary_client_message(&data) {
                            Ok(message) => send_to_kernel(ctx, message, shell_tx, stdin_tx).await,
                            Err(e) => {
                                log::error!(
                                    "[client {}] Failed to parse binary message ({} bytes): {}",
                                    client_id,
                                    data.len(),
                                    e
                                );
                            }
                        }
                    },
                    Message::Frame(_) => {
                        // Not produced by socket reads
                    },
                    Message::Close(_) => {
                        log::info!("[client {}] Websocket closed by client", client_id);
                        break;
                    },
                }
            },
            _ = tick.tick() => {
                // Check to see how far behind the pong counter is
                let diff = ping_outbound.saturating_sub(pong_inbound);
                if diff > 3 {
                    log::warn!("[client {}] Lost connection with client; websocket pong counter is behind by {} pings", client_id, diff);
                    break;
                }

                ping_outbound += 1;
                let ping_data = ping_outbound.to_be_bytes().to_vec();
                let sent = ws_sink.lock().await.send(Message::Ping(ping_data)).await;
                if let Err(e) = sent {
                    log::error!("[client {}] Failed to send ping to websocket: {}", client_id, e);
                    break;
                }
            },
        }
    }
}

/// Sign a message from the client and queue it for the channel it is routed
/// to.
async fn send_to_kernel(
    ctx: &ChannelContext,
    mut message: JupyterMessage,
    shell_tx: &Sender<ZmqMessage>,
    stdin_tx: &Sender<ZmqMessage>,
) {
    let session = &ctx.kernel.session;
    session.complete_header(&mut message.header);

    match JupyterMsg::from(&message) {
        JupyterMsg::ExecuteRequest(request) => {
            log::debug!(
                "[client {}] Executing {} bytes of code",
                ctx.client_id,
                request.code.len()
            );
        }
        JupyterMsg::ShutdownRequest => {
            log::debug!("[client {}] Client requested kernel shutdown", ctx.client_id);
        }
        _ => {}
    }

    log::info!(
        "[client {}] Got message {} of type {}; sending to {} socket",
        ctx.client_id,
        message.header.msg_id,
        message.header.msg_type,
        message.channel
    );

    let wire = match session.encode(&message) {
        Ok(wire) => wire,
        Err(err) => {
            log::error!("[client {}] {}", ctx.client_id, err);
            return;
        }
    };

    let tx = match message.channel {
        JupyterChannel::Stdin => stdin_tx,
        _ => shell_tx,
    };
    if let Err(e) = tx.send(wire.into()).await {
        log::error!(
            "[client {}] Failed to queue message for {} socket: {}",
            ctx.client_id,
            message.channel,
            e
        );
    }
    ctx.kernel.record_activity().await;
}

/// Drain the delivery queue to the client.
async fn write_loop<S>(ctx: ChannelContext, ws_sink: WsSink<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let message = tokio::select! {
            biased;
            message = ctx.queue.pop() => message,
            _ = ctx.cancel.cancelled() => break,
        };
        let message = match message {
            Some(message) => message,
            None => {
                // The queue was closed and drained
                ctx.cancel.cancel();
                break;
            }
        };

        let dropped = ctx.queue.take_dropped();
        if dropped > 0 {
            log::warn!(
                "[client {}] Client is not keeping up; dropped {} iopub message(s)",
                ctx.client_id,
                dropped
            );
            if send_message(&ctx, &ws_sink, WebsocketMessage::Kernel(KernelMessage::Dropped(dropped)))
                .await
                .is_err()
            {
                ctx.cancel.cancel();
                break;
            }
        }

        if send_message(&ctx, &ws_sink, message).await.is_err() {
            ctx.cancel.cancel();
            break;
        }
    }
}

/// Write a message to the client: as JSON text, or as a binary frame when it
/// carries buffers.
async fn send_message<S>(
    ctx: &ChannelContext,
    ws_sink: &WsSink<S>,
    message: WebsocketMessage,
) -> Result<(), anyhow::Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let frame = match message {
        WebsocketMessage::Jupyter(mut msg) if !msg.buffers.is_empty() => {
            let buffers = std::mem::take(&mut msg.buffers)
                .iter()
                .map(hex::decode)
                .collect::<Result<Vec<_>, _>>()?;
            let json = serde_json::to_vec(&WebsocketMessage::Jupyter(msg))?;
            Message::Binary(encode_binary_message(&json, &buffers))
        }
        message => Message::text(serde_json::to_string(&message)?),
    };

    let mut sink = ws_sink.lock().await;
    if let Err(e) = sink.send(frame).await {
        log::error!(
            "[client {}] Failed to send message to websocket: {}",
            ctx.client_id,
            e
        );
        return Err(e.into());
    }
    Ok(())
}

/// Wait for the kernel to exit; then tell the client and wind the connection
/// down once everything queued has been written.
async fn watch_exit(ctx: ChannelContext) {
    let kernel = ctx.kernel.clone();
    loop {
        let listener = kernel.exit_event.listen();
        if kernel.lifecycle().await >= LifecycleState::ShuttingDown {
            break;
        }
        tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            _ = listener => {},
        }
    }

    let exit_code = kernel.state.read().await.exit_code;
    log::info!(
        "[client {}] Kernel exited (code: {:?}); closing connection",
        ctx.client_id,
        exit_code
    );
    ctx.queue
        .push(WebsocketMessage::Kernel(KernelMessage::Status(KernelStatus::Exited)));
    ctx.queue
        .push(WebsocketMessage::Kernel(KernelMessage::Exited(exit_code)));
    ctx.queue.close();
}
