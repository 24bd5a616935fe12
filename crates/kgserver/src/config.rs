//
// config.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

use std::net::{IpAddr, Ipv4Addr};
use std::ops::Range;
use std::path::PathBuf;
use std::time::Duration;

/// Settings that govern how kernels are launched and how clients are bridged
/// to them.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// The address kernels listen on
    pub ip: IpAddr,

    /// The ZeroMQ transport kernels listen on; generally "tcp"
    pub transport: String,

    /// The directory connection files are written to
    pub connection_dir: PathBuf,

    /// Directories searched for kernelspecs before the standard Jupyter ones
    pub kernel_spec_dirs: Vec<PathBuf>,

    /// The kernelspec advertised as the default
    pub default_kernel: String,

    /// Whether the gateway picks and reserves kernel ports itself. When false,
    /// the OS picks them and they are not tracked.
    pub cache_ports: bool,

    /// The range kernel ports are drawn from
    pub port_range: Range<u16>,

    /// How many candidates to try for each port
    pub port_attempts: u32,

    /// Interpreters tried, in order, in place of a bare `python`/`python3` in
    /// a kernelspec's argv
    pub python_candidates: Vec<String>,

    /// How long to wait for a kernel to answer the first request on a new
    /// connection
    pub nudge_timeout: Duration,

    /// How long to wait when connecting to each of a kernel's sockets
    pub connect_timeout: Duration,

    /// The time between heartbeats
    pub heartbeat_interval: Duration,

    /// How long to wait for a heartbeat before declaring the kernel offline
    pub heartbeat_timeout: Duration,

    /// How many messages may wait for delivery to a slow client before iopub
    /// messages start being dropped
    pub delivery_queue_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            transport: String::from("tcp"),
            connection_dir: std::env::temp_dir(),
            kernel_spec_dirs: Vec::new(),
            default_kernel: String::from("python3"),
            cache_ports: true,
            port_range: 5000..6000,
            port_attempts: 100,
            python_candidates: vec![String::from("python3"), String::from("python")],
            nudge_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(2),
            heartbeat_timeout: Duration::from_secs(5),
            delivery_queue_capacity: 1024,
        }
    }
}
