//
// wire_message.rs
//
// Copyright (C) 2024 Posit Software, PBC. All rights reserved.
//
//

use bytes::Bytes;
use hmac::{Hmac, Mac};
use kgshared::jupyter_message::{JupyterChannel, JupyterMessage, JupyterMessageHeader};
use serde::Serialize;
use sha2::Sha256;
use zeromq::ZmqMessage;

use crate::error::KSError;

/// The frame separating routing identities from the signed message body
pub const DELIMITER: &[u8] = b"<IDS|MSG>";

/// The number of frames that follow the delimiter in every message: the
/// signature, header, parent header, metadata and content.
const SIGNED_FRAMES: usize = 5;

pub struct WireMessage {
    /// The routing identities that preceded the delimiter, if any
    pub identities: Vec<Bytes>,

    /// The parts of the message that follow the delimiter: the signature, the
    /// four signed frames, and any buffers
    pub parts: Vec<Bytes>,
}

impl WireMessage {
    /// Create a new wire message from a Jupyter message, signing it with the
    /// given key. A `None` key produces an empty signature.
    ///
    /// The parent slot carries the parent header when there is one; otherwise
    /// it repeats the message's own header. Writing the real parent departs
    /// from gateways that always repeat the header: replies and outputs keep
    /// their link to the request that caused them. Either way, the four signed
    /// frames are hashed in wire order, so kernels verify both forms alike.
    pub fn from_jupyter(
        msg: &JupyterMessage,
        hmac_key: Option<&Hmac<Sha256>>,
    ) -> Result<Self, KSError> {
        let header = encode(&msg.header)?;
        let parent = match msg.parent_header {
            Some(ref parent) => encode(parent)?,
            None => header.clone(),
        };
        let metadata = encode(&msg.metadata)?;
        let content = encode(&msg.content)?;

        let signature = match hmac_key {
            Some(key) => {
                let mut mac = key.clone();
                mac.update(&header);
                mac.update(&parent);
                mac.update(&metadata);
                mac.update(&content);
                hex::encode(mac.finalize().into_bytes())
            }
            None => String::new(),
        };

        let mut parts = vec![Bytes::from(signature), header, parent, metadata, content];
        for buffer in &msg.buffers {
            let buffer = hex::decode(buffer)
                .map_err(|e| KSError::Decode(format!("buffer is not hex encoded: {}", e)))?;
            parts.push(Bytes::from(buffer));
        }

        Ok(WireMessage {
            identities: Vec::new(),
            parts,
        })
    }

    /// Split raw frames received from a socket into routing identities and
    /// message parts.
    pub fn from_frames(frames: Vec<Bytes>) -> Result<Self, KSError> {
        let delimiter = frames
            .iter()
            .position(|frame| frame.as_ref() == DELIMITER)
            .ok_or_else(|| KSError::Signature(String::from("no <IDS|MSG> delimiter")))?;

        let mut identities = frames;
        let parts = identities.split_off(delimiter + 1);
        identities.truncate(delimiter);

        Ok(WireMessage { identities, parts })
    }

    /// Convert a message received from a ZeroMQ socket.
    pub fn from_zmq(message: ZmqMessage) -> Result<Self, KSError> {
        Self::from_frames(message.into_vec())
    }

    /// Address this message to the given routing identities.
    pub fn with_identities(mut self, identities: Vec<Bytes>) -> Self {
        self.identities = identities;
        self
    }

    /// Verify the signature and decode the message into a Jupyter message
    /// tagged with the channel it arrived on.
    pub fn to_jupyter(
        &self,
        channel: JupyterChannel,
        hmac_key: Option<&Hmac<Sha256>>,
    ) -> Result<JupyterMessage, KSError> {
        if self.parts.len() < SIGNED_FRAMES {
            return Err(KSError::Signature(format!(
                "expected at least {} frames after the delimiter, got {}",
                SIGNED_FRAMES,
                self.parts.len()
            )));
        }

        if let Some(key) = hmac_key {
            let signature = hex::decode(&self.parts[0])
                .map_err(|_| KSError::Signature(String::from("signature is not hex encoded")))?;
            let mut mac = key.clone();
            for part in &self.parts[1..SIGNED_FRAMES] {
                mac.update(part);
            }
            mac.verify_slice(&signature)
                .map_err(|_| KSError::Signature(String::from("signature mismatch")))?;
        }

        let header: JupyterMessageHeader = serde_json::from_slice(&self.parts[1])
            .map_err(|e| KSError::Decode(format!("header: {}", e)))?;

        let parent: serde_json::Value = serde_json::from_slice(&self.parts[2])
            .map_err(|e| KSError::Decode(format!("parent header: {}", e)))?;
        let parent_header = match parent {
            serde_json::Value::Object(ref map) if map.is_empty() => None,
            parent => {
                let parent: JupyterMessageHeader = serde_json::from_value(parent)
                    .map_err(|e| KSError::Decode(format!("parent header: {}", e)))?;
                if parent.msg_id == header.msg_id {
                    None
                } else {
                    Some(parent)
                }
            }
        };

        let metadata = serde_json::from_slice(&self.parts[3])
            .map_err(|e| KSError::Decode(format!("metadata: {}", e)))?;
        let content = serde_json::from_slice(&self.parts[4])
            .map_err(|e| KSError::Decode(format!("content: {}", e)))?;

        Ok(JupyterMessage {
            header,
            parent_header,
            channel,
            content,
            metadata,
            buffers: self.parts[SIGNED_FRAMES..].iter().map(hex::encode).collect(),
        })
    }

    /// All frames of the message in wire order.
    pub fn into_frames(self) -> Vec<Bytes> {
        let mut frames = self.identities;
        frames.push(Bytes::from_static(DELIMITER));
        frames.extend(self.parts);
        frames
    }
}

impl From<WireMessage> for ZmqMessage {
    fn from(message: WireMessage) -> Self {
        let mut frames = message.into_frames().into_iter();
        // There is always at least the delimiter
        let mut zmq_message = ZmqMessage::from(frames.next().unwrap_or_default());
        for frame in frames {
            zmq_message.push_back(frame);
        }
        zmq_message
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Bytes, KSError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| KSError::Decode(e.to_string()))
}
