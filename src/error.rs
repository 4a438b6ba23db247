// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Error types for the clustered hashmap registry.

use thiserror::Error;

/// Errors surfaced by registry components.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Base port leaves no room for the component's port offsets.
    #[error("invalid base port {base}: offset +{offset} exceeds 65535")]
    InvalidPort { base: u16, offset: u16 },

    /// A component was started before `init` injected the transport context.
    #[error("{component} started before initialized")]
    NotInitialized { component: &'static str },

    /// `start` called on a component that is already running.
    #[error("{component} is already running")]
    AlreadyRunning { component: &'static str },

    /// `stop` (or a submission) called on a component that is not running.
    #[error("{component} is not running")]
    NotRunning { component: &'static str },

    /// A multipart message did not match the five-frame CHP shape.
    #[error("malformed frame: expected {expected}, got {got}")]
    MalformedFrame {
        expected: &'static str,
        got: String,
    },

    /// Socket setup or IO failure.
    #[error("transport error in {context}: {message}")]
    Transport {
        context: &'static str,
        message: String,
    },

    /// A socket task failed to report readiness within the startup budget.
    #[error("{role} task failed to start within the timeout")]
    StartTimeout { role: &'static str },

    /// A socket task failed to exit within the shutdown budget.
    #[error("{role} task did not stop within the timeout")]
    ShutdownTimeout { role: &'static str },
}

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;
