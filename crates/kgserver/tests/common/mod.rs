//
// mod.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! Test doubles shared by the integration tests: a process controller that
//! launches nothing, a fixed set of kernelspecs, a ZeroMQ kernel that speaks
//! just enough of the protocol, and an HTTP server wrapper.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use kgserver::{
    channel_bridge::binary::decode_binary_message,
    config::GatewayConfig,
    connection_file::ConnectionFile,
    error::KSError,
    kernel_registry::KernelRegistry,
    kernel_session::KernelSession,
    kernel_spec::{KernelSpec, KernelSpecProvider},
    process_controller::{substitute_connection_file, KillOutcome, ProcessController, ProcessHandle},
    server,
};
use kgshared::{
    jupyter_message::{JupyterChannel, JupyterMessage},
    websocket_message::WebsocketMessage,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use zeromq::{PubSocket, RepSocket, RouterSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

/// The name of the kernelspec every fake registry knows about
pub const FAKE_KERNEL: &str = "fake";

/// Gateway settings suited to tests: short timeouts and a wide port range.
pub fn test_config(connection_dir: &Path) -> GatewayConfig {
    GatewayConfig {
        connection_dir: connection_dir.to_path_buf(),
        port_range: 20000..60000,
        python_candidates: vec![],
        nudge_timeout: Duration::from_millis(500),
        connect_timeout: Duration::from_secs(2),
        heartbeat_interval: Duration::from_millis(200),
        heartbeat_timeout: Duration::from_secs(1),
        ..GatewayConfig::default()
    }
}

/// A registry whose kernels are launched by a `FakeProcessController`.
pub fn fake_registry(connection_dir: &Path) -> (Arc<KernelRegistry>, Arc<FakeProcessController>) {
    fake_registry_with(test_config(connection_dir))
}

pub fn fake_registry_with(config: GatewayConfig) -> (Arc<KernelRegistry>, Arc<FakeProcessController>) {
    let processes = Arc::new(FakeProcessController::new());
    let specs = StaticKernelSpecs::new().with(
        FAKE_KERNEL,
        vec!["fake-kernel", "-f", "{connection_file}"],
    );
    let registry = KernelRegistry::new(config, Arc::new(specs), processes.clone());
    (Arc::new(registry), processes)
}

/// Kernelspecs held in memory.
#[derive(Default)]
pub struct StaticKernelSpecs {
    specs: HashMap<String, KernelSpec>,
}

impl StaticKernelSpecs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, name: &str, argv: Vec<&str>) -> Self {
        let spec = KernelSpec {
            argv: argv.into_iter().map(String::from).collect(),
            display_name: name.to_string(),
            language: String::from("test"),
            env: HashMap::new(),
            interrupt_mode: None,
            resource_dir: PathBuf::new(),
        };
        self.with_spec(name, spec)
    }

    pub fn with_spec(mut self, name: &str, spec: KernelSpec) -> Self {
        self.specs.insert(name.to_string(), spec);
        self
    }
}

impl KernelSpecProvider for StaticKernelSpecs {
    fn get(&self, name: &str) -> Result<KernelSpec, KSError> {
        self.specs
            .get(name)
            .cloned()
            .ok_or_else(|| KSError::KernelSpecNotFound(name.to_string()))
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.specs.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Pretends to launch processes. Each launch gets a new pid; the "process"
/// runs until it is killed or `exit` is called.
pub struct FakeProcessController {
    next_pid: AtomicU32,
    launched: Mutex<Vec<Vec<String>>>,
    killed: Mutex<Vec<u32>>,
    exits: Mutex<HashMap<u32, oneshot::Sender<Option<i32>>>>,
    kill_outcome: Mutex<KillOutcome>,
}

impl FakeProcessController {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(40000),
            launched: Mutex::new(Vec::new()),
            killed: Mutex::new(Vec::new()),
            exits: Mutex::new(HashMap::new()),
            kill_outcome: Mutex::new(KillOutcome::Killed),
        }
    }

    /// The argv of every launch, with the connection file substituted.
    pub fn launched(&self) -> Vec<Vec<String>> {
        self.launched.lock().unwrap().clone()
    }

    /// The pids passed to `kill`, in order.
    pub fn killed(&self) -> Vec<u32> {
        self.killed.lock().unwrap().clone()
    }

    /// Make subsequent kills report the given outcome.
    pub fn set_kill_outcome(&self, outcome: KillOutcome) {
        *self.kill_outcome.lock().unwrap() = outcome;
    }

    /// Simulate the process exiting on its own.
    pub fn exit(&self, pid: u32, code: Option<i32>) {
        if let Some(tx) = self.exits.lock().unwrap().remove(&pid) {
            let _ = tx.send(code);
        }
    }
}

#[async_trait]
impl ProcessController for FakeProcessController {
    async fn launch(
        &self,
        argv: &[String],
        _env: &HashMap<String, String>,
        connection_file: &Path,
    ) -> Result<ProcessHandle, KSError> {
        assert!(
            connection_file.is_file(),
            "connection file must exist before launch"
        );
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.launched
            .lock()
            .unwrap()
            .push(substitute_connection_file(argv, connection_file));

        let (tx, rx) = oneshot::channel();
        self.exits.lock().unwrap().insert(pid, tx);
        Ok(ProcessHandle { pid, exit: rx })
    }

    async fn kill(&self, pid: u32) -> KillOutcome {
        self.killed.lock().unwrap().push(pid);
        let outcome = self.kill_outcome.lock().unwrap().clone();
        if outcome == KillOutcome::Killed {
            self.exit(pid, None);
        }
        outcome
    }
}

/// How a `FakeKernel` behaves.
#[derive(Clone, Copy)]
pub struct FakeKernelBehavior {
    /// Whether kernel_info_request is answered
    pub answer_kernel_info: bool,

    /// Whether a kernel_info_request makes the kernel publish a stream
    /// message on iopub shortly after it arrives
    pub publish_on_kernel_info: bool,
}

impl Default for FakeKernelBehavior {
    fn default() -> Self {
        Self {
            answer_kernel_info: true,
            publish_on_kernel_info: false,
        }
    }
}

/// A kernel bound to the ports of a connection file.
///
/// It answers kernel_info_request, runs execute_request by echoing the code
/// to iopub, echoes comm_msg (buffers included) to iopub, echoes heartbeats,
/// and records every request it receives.
pub struct FakeKernel {
    received: Arc<Mutex<Vec<JupyterMessage>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl FakeKernel {
    pub async fn start(connection_file: &ConnectionFile) -> Self {
        Self::start_with(connection_file, FakeKernelBehavior::default()).await
    }

    pub async fn start_with(connection_file: &ConnectionFile, behavior: FakeKernelBehavior) -> Self {
        let session = KernelSession::with_key(connection_file.key.clone()).unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let (iopub_tx, iopub_rx) = mpsc::unbounded_channel();

        let mut iopub = PubSocket::new();
        iopub
            .bind(&connection_file.channel_endpoint(JupyterChannel::IOPub))
            .await
            .unwrap();
        let mut heartbeat = RepSocket::new();
        heartbeat
            .bind(&connection_file.channel_endpoint(JupyterChannel::Heartbeat))
            .await
            .unwrap();

        let mut tasks = vec![
            tokio::spawn(publish(iopub, session.clone(), iopub_rx)),
            tokio::spawn(echo(heartbeat)),
        ];
        for channel in [
            JupyterChannel::Shell,
            JupyterChannel::Control,
            JupyterChannel::Stdin,
        ] {
            let mut socket = RouterSocket::new();
            socket
                .bind(&connection_file.channel_endpoint(channel))
                .await
                .unwrap();
            tasks.push(tokio::spawn(serve(
                socket,
                channel,
                session.clone(),
                behavior,
                received.clone(),
                iopub_tx.clone(),
            )));
        }

        Self { received, tasks }
    }

    /// Every request received so far.
    pub fn received(&self) -> Vec<JupyterMessage> {
        self.received.lock().unwrap().clone()
    }

    /// Wait for a request of the given type to arrive.
    pub async fn wait_for_request(&self, msg_type: &str, wait: Duration) -> Option<JupyterMessage> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let found = self
                .received()
                .into_iter()
                .find(|msg| msg.header.msg_type == msg_type);
            if found.is_some() {
                return found;
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl Drop for FakeKernel {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn reply_to(
    session: &KernelSession,
    request: &JupyterMessage,
    msg_type: &str,
    channel: JupyterChannel,
    content: serde_json::Value,
) -> JupyterMessage {
    let mut reply = session.make_request(msg_type, channel);
    reply.parent_header = Some(request.header.clone());
    reply.content = content;
    reply
}

async fn serve(
    mut socket: RouterSocket,
    channel: JupyterChannel,
    session: KernelSession,
    behavior: FakeKernelBehavior,
    received: Arc<Mutex<Vec<JupyterMessage>>>,
    iopub: mpsc::UnboundedSender<JupyterMessage>,
) {
    while let Ok(message) = socket.recv().await {
        let (identities, request) = match session.decode_frames(message.into_vec(), channel) {
            Ok(decoded) => decoded,
            Err(_) => continue,
        };
        received.lock().unwrap().push(request.clone());

        if request.header.msg_type == "kernel_info_request" && behavior.publish_on_kernel_info {
            let output = reply_to(
                &session,
                &request,
                "stream",
                JupyterChannel::IOPub,
                serde_json::json!({ "name": "stdout", "text": "starting up" }),
            );
            let iopub = iopub.clone();
            tokio::spawn(async move {
                // Give the subscriber time to join
                tokio::time::sleep(Duration::from_millis(100)).await;
                let _ = iopub.send(output);
            });
        }

        let reply = match request.header.msg_type.as_str() {
            "kernel_info_request" if behavior.answer_kernel_info => Some(reply_to(
                &session,
                &request,
                "kernel_info_reply",
                channel,
                serde_json::json!({
                    "status": "ok",
                    "protocol_version": "5.3",
                    "implementation": "fake",
                }),
            )),
            "execute_request" => {
                let code = request.content["code"].as_str().unwrap_or_default().to_string();
                let status = |state: &str| {
                    reply_to(
                        &session,
                        &request,
                        "status",
                        JupyterChannel::IOPub,
                        serde_json::json!({ "execution_state": state }),
                    )
                };
                let _ = iopub.send(status("busy"));
                let _ = iopub.send(reply_to(
                    &session,
                    &request,
                    "stream",
                    JupyterChannel::IOPub,
                    serde_json::json!({ "name": "stdout", "text": code }),
                ));
                let _ = iopub.send(status("idle"));
                Some(reply_to(
                    &session,
                    &request,
                    "execute_reply",
                    channel,
                    serde_json::json!({ "status": "ok", "execution_count": 1 }),
                ))
            }
            "comm_msg" => {
                let mut echo = reply_to(
                    &session,
                    &request,
                    "comm_msg",
                    JupyterChannel::IOPub,
                    request.content.clone(),
                );
                echo.buffers = request.buffers.clone();
                let _ = iopub.send(echo);
                None
            }
            _ => None,
        };

        if let Some(reply) = reply {
            let wire = session.encode(&reply).unwrap().with_identities(identities);
            let message: ZmqMessage = wire.into();
            if socket.send(message).await.is_err() {
                break;
            }
        }
    }
}

async fn publish(
    mut socket: PubSocket,
    session: KernelSession,
    mut messages: mpsc::UnboundedReceiver<JupyterMessage>,
) {
    while let Some(message) = messages.recv().await {
        let wire = session.encode(&message).unwrap();
        if socket.send(wire.into()).await.is_err() {
            break;
        }
    }
}

async fn echo(mut socket: RepSocket) {
    while let Ok(message) = socket.recv().await {
        if socket.send(message).await.is_err() {
            break;
        }
    }
}

/// The gateway's HTTP server, running on an OS-assigned port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub registry: Arc<KernelRegistry>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    pub async fn start(registry: Arc<KernelRegistry>) -> Self {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let server_registry = registry.clone();
        let handle = tokio::spawn(async move {
            server::serve(listener, server_registry, async {
                let _ = rx.await;
            })
            .await
            .unwrap();
        });

        Self {
            addr,
            registry,
            shutdown: Some(tx),
            handle: Some(handle),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    /// Stop serving and shut down every kernel.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
        self.registry.cleanup().await;
    }
}

/// Read from a client WebSocket until a gateway message matching `pred`
/// arrives, or `wait` elapses.
pub async fn wait_for_message<S, F>(ws: &mut S, wait: Duration, mut pred: F) -> Option<WebsocketMessage>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
    F: FnMut(&WebsocketMessage) -> bool,
{
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let next = match tokio::time::timeout_at(deadline, ws.next()).await {
            Ok(Some(Ok(next))) => next,
            _ => return None,
        };
        let message = match next {
            Message::Text(text) => serde_json::from_str::<WebsocketMessage>(&text).unwrap(),
            Message::Binary(frame) => {
                let (json, buffers) = decode_binary_message(&frame).unwrap();
                let mut message: WebsocketMessage = serde_json::from_slice(json).unwrap();
                if let WebsocketMessage::Jupyter(ref mut msg) = message {
                    msg.buffers = buffers.iter().map(hex::encode).collect();
                }
                message
            }
            _ => continue,
        };
        if pred(&message) {
            return Some(message);
        }
    }
}

/// Whether a gateway message is a Jupyter message of the given type.
pub fn is_jupyter(message: &WebsocketMessage, msg_type: &str) -> bool {
    matches!(message, WebsocketMessage::Jupyter(msg) if msg.header.msg_type == msg_type)
}
