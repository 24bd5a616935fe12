//
// port_picker.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

use std::net::{IpAddr, SocketAddr, TcpListener};

/// Try to bind a transient TCP listener to the given address and port.
///
/// Returns true if the bind succeeded. The listener is dropped (and the port
/// released) before this function returns, so a `true` result only means the
/// port was free at the moment of the check.
pub fn test_bind_tcp(ip: IpAddr, port: u16) -> bool {
    TcpListener::bind(SocketAddr::new(ip, port)).is_ok()
}

/// Asks the OS for a free port on the given address.
///
/// Binds to port 0, which lets the OS pick an available port. Returns the port
/// number if successful, or None if no port is available.
pub fn ask_free_tcp_port(ip: IpAddr) -> Option<u16> {
    Some(
        TcpListener::bind(SocketAddr::new(ip, 0))
            .ok()?
            .local_addr()
            .ok()?
            .port(),
    )
}
