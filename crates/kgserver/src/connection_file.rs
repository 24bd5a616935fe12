//
// connection_file.rs
//
// Copyright (C) 2024 Posit Software, PBC. All rights reserved.
//
//

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use kgshared::jupyter_message::JupyterChannel;
use serde::Deserialize;
use serde::Serialize;

use crate::kernel_session::KernelSession;

/// The five ports a kernel listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelPorts {
    pub shell: u16,
    pub iopub: u16,
    pub stdin: u16,
    pub control: u16,
    pub hb: u16,
}

impl ChannelPorts {
    pub fn to_vec(&self) -> Vec<u16> {
        vec![self.shell, self.iopub, self.stdin, self.control, self.hb]
    }
}

/// The contents of the Connection File as listed in the Jupyter specfication;
/// directly parsed from JSON.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConnectionFile {
    /// ZeroMQ port: Control channel (kernel interrupts)
    pub control_port: u16,

    /// ZeroMQ port: Shell channel (execution, completion)
    pub shell_port: u16,

    /// ZeroMQ port: Standard input channel (prompts)
    pub stdin_port: u16,

    /// ZeroMQ port: IOPub channel (broadcasts input/output)
    pub iopub_port: u16,

    /// ZeroMQ port: Heartbeat messages (echo)
    pub hb_port: u16,

    /// The transport type to use for ZeroMQ; generally "tcp"
    pub transport: String,

    /// The signature scheme to use for messages; generally "hmac-sha256"
    pub signature_scheme: String,

    /// The IP address to bind to
    pub ip: String,

    /// The HMAC-256 signing key, or an empty string for an unauthenticated
    /// connection
    pub key: String,

    /// The name of the kernelspec the kernel was started from
    #[serde(default)]
    pub kernel_name: String,
}

impl ConnectionFile {
    /// Create a ConnectionFile for a kernel that will sign with the given
    /// session's key.
    pub fn new(
        ports: ChannelPorts,
        ip: String,
        transport: String,
        session: &KernelSession,
        kernel_name: String,
    ) -> Self {
        Self {
            control_port: ports.control,
            shell_port: ports.shell,
            stdin_port: ports.stdin,
            iopub_port: ports.iopub,
            hb_port: ports.hb,
            transport,
            signature_scheme: session.signature_scheme.clone(),
            ip,
            key: session.key.clone(),
            kernel_name,
        }
    }

    /// Create a ConnectionFile by parsing the contents of a connection file.
    pub fn from_file<P: AsRef<Path>>(connection_file: P) -> Result<Self, anyhow::Error> {
        let file = File::open(connection_file)?;
        let reader = BufReader::new(file);
        let control = serde_json::from_reader(reader)?;

        Ok(control)
    }

    pub fn to_file<P: AsRef<Path>>(&self, connection_file: P) -> Result<(), anyhow::Error> {
        let file = File::create(connection_file)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    pub fn ports(&self) -> ChannelPorts {
        ChannelPorts {
            shell: self.shell_port,
            iopub: self.iopub_port,
            stdin: self.stdin_port,
            control: self.control_port,
            hb: self.hb_port,
        }
    }

    /// The port the kernel listens on for the given channel.
    pub fn port(&self, channel: JupyterChannel) -> u16 {
        match channel {
            JupyterChannel::Shell => self.shell_port,
            JupyterChannel::Control => self.control_port,
            JupyterChannel::Stdin => self.stdin_port,
            JupyterChannel::IOPub => self.iopub_port,
            JupyterChannel::Heartbeat => self.hb_port,
        }
    }

    /// Given a port, return a URI-like string that can be used to connect to
    /// the port, given the other parameters in the connection file.
    ///
    /// Example: `32` => `"tcp://127.0.0.1:32"`; for other transports the port
    /// is joined to the address with a dash (`"ipc://kernel-32"`).
    pub fn endpoint(&self, port: u16) -> String {
        if self.transport == "tcp" {
            format!("tcp://{}:{}", self.ip, port)
        } else {
            format!("{}://{}-{}", self.transport, self.ip, port)
        }
    }

    /// The endpoint of the given channel.
    pub fn channel_endpoint(&self, channel: JupyterChannel) -> String {
        self.endpoint(self.port(channel))
    }
}
