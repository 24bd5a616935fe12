//! Shared types and utilities for the Kernelgate server and its clients.

/// Jupyter message types
pub mod jupyter_message;

/// Kernel message types
pub mod kernel_message;

/// Kernel listing types
pub mod kernel_model;

/// TCP port probing
pub mod port_picker;

/// WebSocket message types
pub mod websocket_message;
