// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Clustered hashmap registry over ZeroMQ.
//!
//! One authoritative [`RegistryHub`] replicates a key/value map to any
//! number of [`RegistryClient`] mirrors: new clients bootstrap through a
//! ROUTER/DEALER snapshot handshake, then follow a sequenced PUB/SUB update
//! stream guarded by a heartbeat watchdog. Client writes are fire-and-forget
//! submissions, retransmitted until they are observed echoing back on the
//! update stream.
//!
//! ```text
//!   client submit (PUB) ──> collector (SUB) ──> store ──> publisher (PUB)
//!                                                              │
//!   snapshot (DEALER) <──────── responder (ROUTER)             ▼
//!        │                                         subscribers (SUB) ──> mirror
//!        └──> mirror (bootstrap merge)
//! ```

pub mod client;
pub mod endpoints;
pub mod error;
pub mod forwarder;
pub mod frame;
pub mod hub;
pub mod mirror;
pub mod origin;
pub mod store;


// Transport context callers create and inject into every component.
pub use tmq::Context;

// Errors
pub use error::{RegistryError, RegistryResult};

// Wire protocol
pub use frame::{UpdateFrame, HEARTBEAT, SNAPSHOT_END, SNAPSHOT_REQUEST};
pub use origin::OriginId;

// Server
pub use hub::{RegistryHub, DEFAULT_PUBLISH_INTERVAL};
pub use store::RegistryStore;

// Client
pub use client::{RegistryClient, DEFAULT_RECONCILE_INTERVAL};
pub use mirror::{ApplyOutcome, MirrorStore};

// Endpoints & devices
pub use endpoints::{ForwarderPorts, PortLayout};
pub use forwarder::Forwarder;
