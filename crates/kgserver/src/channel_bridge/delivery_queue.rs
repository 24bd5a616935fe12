//
// delivery_queue.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

//! The queue of messages waiting to be written to a client.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use event_listener::Event;
use kgshared::{jupyter_message::JupyterChannel, websocket_message::WebsocketMessage};

/// A bounded queue of messages on their way to one client.
///
/// When the queue is full, iopub messages give way: the oldest queued iopub
/// message is evicted to make room, and a new iopub message is dropped if no
/// queued one can be evicted. Replies on the other channels and the gateway's
/// own kernel messages are always queued, even past capacity.
pub struct DeliveryQueue {
    capacity: usize,
    inner: Mutex<QueueInner>,
    event: Event,
}

#[derive(Default)]
struct QueueInner {
    messages: VecDeque<WebsocketMessage>,

    /// iopub messages discarded since the count was last taken
    dropped: u64,

    /// No further messages will be accepted
    closed: bool,
}

fn is_iopub(message: &WebsocketMessage) -> bool {
    matches!(message, WebsocketMessage::Jupyter(msg) if msg.channel == JupyterChannel::IOPub)
}

impl DeliveryQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(QueueInner::default()),
            event: Event::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Queue a message. Returns false if the message was dropped.
    pub fn push(&self, message: WebsocketMessage) -> bool {
        let accepted = {
            let mut inner = self.lock();
            if inner.closed {
                return false;
            }

            if inner.messages.len() >= self.capacity {
                match inner.messages.iter().position(is_iopub) {
                    Some(oldest) => {
                        inner.messages.remove(oldest);
                        inner.dropped += 1;
                        inner.messages.push_back(message);
                        true
                    }
                    None if is_iopub(&message) => {
                        inner.dropped += 1;
                        false
                    }
                    None => {
                        inner.messages.push_back(message);
                        true
                    }
                }
            } else {
                inner.messages.push_back(message);
                true
            }
        };

        if accepted {
            self.event.notify(1);
        }
        accepted
    }

    /// Wait for the next message. Returns None once the queue is closed and
    /// empty.
    ///
    /// Cancel safe: a message is only removed from the queue when the
    /// returned future completes.
    pub async fn pop(&self) -> Option<WebsocketMessage> {
        loop {
            if let Some(message) = self.try_pop() {
                return message;
            }
            let listener = self.event.listen();
            if let Some(message) = self.try_pop() {
                return message;
            }
            listener.await;
        }
    }

    /// Outer None: nothing available yet. Inner None: closed and drained.
    fn try_pop(&self) -> Option<Option<WebsocketMessage>> {
        let mut inner = self.lock();
        match inner.messages.pop_front() {
            Some(message) => Some(Some(message)),
            None if inner.closed => Some(None),
            None => None,
        }
    }

    /// Stop accepting messages. Messages already queued can still be popped.
    pub fn close(&self) {
        self.lock().closed = true;
        self.event.notify(usize::MAX);
    }

    /// The number of iopub messages dropped since the last call, resetting
    /// the count.
    pub fn take_dropped(&self) -> u64 {
        std::mem::take(&mut self.lock().dropped)
    }

    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
