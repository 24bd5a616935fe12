//
// kernel_session.rs
//
// Copyright (C) 2024 Posit Software, PBC. All rights reserved.
//
//

//! The signing identity the gateway uses when talking to a kernel.

use bytes::Bytes;
use hmac::{Hmac, Mac};
use kgshared::jupyter_message::{JupyterChannel, JupyterMessage, JupyterMessageHeader};
use rand::Rng;
use sha2::Sha256;
use zeromq::ZmqMessage;

use crate::{error::KSError, wire_message::WireMessage};

/// The version of the Jupyter protocol spoken by the gateway
pub const PROTOCOL_VERSION: &str = "5.3";

/// The only signature scheme the gateway supports
pub const SIGNATURE_SCHEME: &str = "hmac-sha256";

#[derive(Debug, Clone)]
pub struct KernelSession {
    /// The signing session ID placed in the header of every message
    pub session_id: String,

    /// The username of the user who owns the kernel
    pub username: String,

    /// The signing key, as a string
    pub key: String,

    /// The signature scheme named in the connection file
    pub signature_scheme: String,

    /// The Jupyter protocol version
    pub protocol_version: String,

    /// The HMAC key used to sign messages; None when the key is empty, which
    /// disables signing
    hmac_key: Option<Hmac<Sha256>>,
}

impl KernelSession {
    /// Create a session with a freshly generated signing key (32 hex
    /// characters derived from 16 random bytes).
    pub fn generate() -> Result<Self, anyhow::Error> {
        let key_bytes = rand::thread_rng().gen::<[u8; 16]>();
        Self::with_key(hex::encode(key_bytes))
    }

    /// Create a session that signs with the given key.
    pub fn with_key(key: String) -> Result<Self, anyhow::Error> {
        let hmac_key = if key.is_empty() {
            None
        } else {
            Some(Hmac::<Sha256>::new_from_slice(key.as_bytes())?)
        };

        Ok(Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            username: current_username(),
            key,
            signature_scheme: String::from(SIGNATURE_SCHEME),
            protocol_version: String::from(PROTOCOL_VERSION),
            hmac_key,
        })
    }

    pub fn hmac_key(&self) -> Option<&Hmac<Sha256>> {
        self.hmac_key.as_ref()
    }

    /// Create a header for a new message originated by the gateway.
    pub fn make_header(&self, msg_type: &str) -> JupyterMessageHeader {
        JupyterMessageHeader {
            msg_id: make_message_id(),
            msg_type: msg_type.to_string(),
            username: self.username.clone(),
            session: self.session_id.clone(),
            date: now_iso8601(),
            version: self.protocol_version.clone(),
        }
    }

    /// Create a new request with empty content and metadata.
    pub fn make_request(&self, msg_type: &str, channel: JupyterChannel) -> JupyterMessage {
        JupyterMessage {
            header: self.make_header(msg_type),
            parent_header: None,
            channel,
            content: serde_json::json!({}),
            metadata: serde_json::json!({}),
            buffers: vec![],
        }
    }

    /// Fill in any header fields a client left empty. A message ID supplied
    /// by the client is kept so the client can match replies to it.
    pub fn complete_header(&self, header: &mut JupyterMessageHeader) {
        if header.msg_id.is_empty() {
            header.msg_id = make_message_id();
        }
        if header.session.is_empty() {
            header.session = self.session_id.clone();
        }
        if header.username.is_empty() {
            header.username = self.username.clone();
        }
        if header.date.is_empty() {
            header.date = now_iso8601();
        }
        if header.version.is_empty() {
            header.version = self.protocol_version.clone();
        }
    }

    /// Sign and frame a message for the wire.
    pub fn encode(&self, msg: &JupyterMessage) -> Result<WireMessage, KSError> {
        WireMessage::from_jupyter(msg, self.hmac_key())
    }

    /// Verify and decode a message received on the given channel.
    pub fn decode(
        &self,
        message: ZmqMessage,
        channel: JupyterChannel,
    ) -> Result<JupyterMessage, KSError> {
        WireMessage::from_zmq(message)?.to_jupyter(channel, self.hmac_key())
    }

    /// Verify and decode a message from raw frames, returning the routing
    /// identities that preceded it alongside the message.
    pub fn decode_frames(
        &self,
        frames: Vec<Bytes>,
        channel: JupyterChannel,
    ) -> Result<(Vec<Bytes>, JupyterMessage), KSError> {
        let wire = WireMessage::from_frames(frames)?;
        let message = wire.to_jupyter(channel, self.hmac_key())?;
        Ok((wire.identities, message))
    }
}

/// Generate a unique, UUID-shaped message ID.
pub fn make_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// The current time as an ISO 8601 string with millisecond precision.
pub fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// The name of the user running the gateway, from `USER` or `USERNAME`.
fn current_username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| String::from("kernelgate"))
}
