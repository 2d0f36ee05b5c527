// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunneld Contributors

// Tunneld common library
// Shared types, the error taxonomy, and network helpers

pub mod error;
pub mod network;
pub mod types;

pub use error::{Error, FieldIssue, Result};
pub use network::{format_host_port, is_loopback_address, is_valid_host, split_host_port};
pub use types::{
    default_bind_address, default_keep_alive, default_max_retries, AuthMethod, HostKeyMode, Hop,
    TunnelEvent, TunnelSpec, TunnelState, TunnelStatus, TunnelType,
};

// Re-export commonly used external types
pub use chrono::{DateTime, Utc};
pub use uuid::Uuid;
