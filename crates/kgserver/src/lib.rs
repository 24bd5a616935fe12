//! A WebSocket gateway and supervisor for Jupyter kernels.

#![allow(missing_docs)]

pub mod channel_bridge;
pub mod config;
pub mod connection_file;
pub mod error;
pub mod jupyter_messages;
pub mod kernel_manager;
pub mod kernel_registry;
pub mod kernel_session;
pub mod kernel_spec;
pub mod port_allocator;
pub mod process_controller;
pub mod server;
pub mod wire_message;
