// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Client origin identifiers.
//!
//! Every client instance carries a fixed 16-byte id that binds the keys it
//! registers to that instance. The wire carries either the 16 raw bytes or an
//! empty frame (server-originated entries with no known owner).

use std::fmt;

use uuid::Uuid;

/// Number of bytes an origin id occupies on the wire.
pub const ORIGIN_LEN: usize = 16;

/// Fixed 16-byte identifier of the client instance that registered a key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct OriginId([u8; ORIGIN_LEN]);

impl OriginId {
    /// Generate a fresh random origin id.
    pub fn random() -> Self {
        Self(*Uuid::new_v4().as_bytes())
    }

    pub fn from_bytes(bytes: [u8; ORIGIN_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse an origin frame. Empty means "no origin"; exactly 16 bytes is an
    /// id; anything else is rejected by the caller as a protocol violation.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; ORIGIN_LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; ORIGIN_LEN] {
        &self.0
    }
}

impl fmt::Display for OriginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0).hyphenated())
    }
}

impl fmt::Debug for OriginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OriginId({})", self)
    }
}
