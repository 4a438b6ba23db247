// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Port layout and endpoint formatting.
//!
//! A deployment is configured with a single base port; every socket derives
//! its own port from a fixed offset. Offsets that would push a port past
//! 65535 are a configuration error at construction time, never a runtime
//! fault.

use crate::error::{RegistryError, RegistryResult};

/// Snapshot rendezvous (ROUTER/DEALER), base + 0.
pub const SNAPSHOT_OFFSET: u16 = 0;
/// Live update stream (PUB/SUB), base + 1.
pub const PUBLISH_OFFSET: u16 = 1;
/// Submission collector (SUB bound server-side), base + 2.
pub const COLLECT_OFFSET: u16 = 2;
/// Data stream forwarder fan-in, base + 10.
pub const FORWARDER_FRONTEND_OFFSET: u16 = 10;
/// Data stream forwarder fan-out, base + 11.
pub const FORWARDER_BACKEND_OFFSET: u16 = 11;

fn offset_port(base: u16, offset: u16) -> RegistryResult<u16> {
    base.checked_add(offset)
        .ok_or(RegistryError::InvalidPort { base, offset })
}

/// Ports used by the registry hub and its clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortLayout {
    pub snapshot: u16,
    pub publish: u16,
    pub collect: u16,
}

impl PortLayout {
    pub fn new(base: u16) -> RegistryResult<Self> {
        Ok(Self {
            snapshot: offset_port(base, SNAPSHOT_OFFSET)?,
            publish: offset_port(base, PUBLISH_OFFSET)?,
            collect: offset_port(base, COLLECT_OFFSET)?,
        })
    }
}

/// Ports used by the stream forwarder device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ForwarderPorts {
    pub frontend: u16,
    pub backend: u16,
}

impl ForwarderPorts {
    pub fn new(base: u16) -> RegistryResult<Self> {
        Ok(Self {
            frontend: offset_port(base, FORWARDER_FRONTEND_OFFSET)?,
            backend: offset_port(base, FORWARDER_BACKEND_OFFSET)?,
        })
    }
}

/// Endpoint for a socket bound on all interfaces.
pub fn bind_uri(port: u16) -> String {
    format!("tcp://*:{}", port)
}

/// Endpoint for a socket connecting to a remote host.
pub fn connect_uri(host: &str, port: u16) -> String {
    format!("tcp://{}:{}", host, port)
}
