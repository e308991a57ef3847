// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 tunnel9 Contributors

// tunnel9 - Supervisor Library
// Tunnel lifecycle, retry policy and the russh-backed connector

pub mod connector;
pub mod error;
pub mod known_hosts;
pub mod ssh;
pub mod supervisor;

pub use connector::{Connector, TunnelConnection};
pub use error::{SupervisorError, TunnelError};
pub use ssh::SshConnector;
pub use supervisor::{ShutdownReport, SupervisorOptions, TunnelSnapshot, TunnelSupervisor};
