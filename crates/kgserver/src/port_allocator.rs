//
// port_allocator.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

//! Picks the ports new kernels listen on, and tracks which ones are taken.

use std::collections::HashSet;
use std::net::IpAddr;
use std::ops::Range;
use std::sync::Mutex;

use kgshared::port_picker;
use rand::Rng;

use crate::{connection_file::ChannelPorts, error::KSError};

pub struct PortAllocator {
    /// The address candidate ports are tried on
    ip: IpAddr,

    /// The range candidate ports are drawn from
    range: Range<u16>,

    /// How many candidates to try for each port before giving up
    attempts: u32,

    /// Ports handed out to kernels that are still alive
    reserved: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(ip: IpAddr, range: Range<u16>, attempts: u32) -> Self {
        Self {
            ip,
            range,
            attempts,
            reserved: Mutex::new(HashSet::new()),
        }
    }

    /// Pick and reserve a port for each of the five channels.
    ///
    /// On failure nothing stays reserved.
    pub fn allocate(&self) -> Result<ChannelPorts, KSError> {
        let mut picked: Vec<u16> = Vec::with_capacity(5);
        for name in ["shell", "iopub", "stdin", "control", "hb"] {
            match self.find_port(name) {
                Ok(port) => picked.push(port),
                Err(err) => {
                    self.release_all(&picked);
                    return Err(err);
                }
            }
        }

        Ok(ChannelPorts {
            shell: picked[0],
            iopub: picked[1],
            stdin: picked[2],
            control: picked[3],
            hb: picked[4],
        })
    }

    /// Pick five ports chosen by the OS without reserving them. Used when port
    /// caching is disabled.
    pub fn ephemeral(&self) -> Result<ChannelPorts, KSError> {
        let mut picked: Vec<u16> = Vec::with_capacity(5);
        for name in ["shell", "iopub", "stdin", "control", "hb"] {
            let port = port_picker::ask_free_tcp_port(self.ip)
                .ok_or_else(|| KSError::PortAllocation(name.to_string(), 1))?;
            picked.push(port);
        }

        Ok(ChannelPorts {
            shell: picked[0],
            iopub: picked[1],
            stdin: picked[2],
            control: picked[3],
            hb: picked[4],
        })
    }

    /// Return a kernel's ports to the pool.
    pub fn release(&self, ports: &ChannelPorts) {
        self.release_all(&ports.to_vec());
    }

    /// Whether the given port is currently reserved.
    pub fn is_reserved(&self, port: u16) -> bool {
        match self.reserved.lock() {
            Ok(reserved) => reserved.contains(&port),
            Err(poisoned) => poisoned.into_inner().contains(&port),
        }
    }

    fn release_all(&self, ports: &[u16]) {
        let mut reserved = match self.reserved.lock() {
            Ok(reserved) => reserved,
            Err(poisoned) => poisoned.into_inner(),
        };
        for port in ports {
            reserved.remove(port);
        }
        log::trace!(
            "Released ports {:?} ({} ports reserved)",
            ports,
            reserved.len()
        );
    }

    /// Find a free port that is not reserved, and reserve it.
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the port to find. This is used for logging.
    fn find_port(&self, name: &str) -> Result<u16, KSError> {
        if self.range.is_empty() {
            return Err(KSError::PortAllocation(name.to_string(), 0));
        }
        let mut rng = rand::thread_rng();
        for attempt in 1..=self.attempts {
            let candidate = rng.gen_range(self.range.clone());

            // Hold the lock across the check so two kernels starting at once
            // can't both claim the same candidate
            let mut reserved = match self.reserved.lock() {
                Ok(reserved) => reserved,
                Err(poisoned) => poisoned.into_inner(),
            };
            if reserved.contains(&candidate) {
                log::trace!(
                    "Port {} is reserved; trying again (attempt {})",
                    candidate,
                    attempt
                );
                continue;
            }
            if !port_picker::test_bind_tcp(self.ip, candidate) {
                log::trace!(
                    "Port {} is in use; trying again (attempt {})",
                    candidate,
                    attempt
                );
                continue;
            }

            reserved.insert(candidate);
            log::trace!(
                "Picked {} port: {} ({} ports reserved)",
                name,
                candidate,
                reserved.len()
            );
            return Ok(candidate);
        }

        Err(KSError::PortAllocation(name.to_string(), self.attempts))
    }
}
