// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 tunnel9 Contributors

// tunnel9 - Common Library
// Tunnel specs, runtime types, config storage and auto-start selection

pub mod auto_start;
pub mod config;
pub mod config_store;
pub mod error;
pub mod network;
pub mod types;

pub use auto_start::{parse_tags, select as select_auto_start, ALL_TAG};
pub use config::{
    ConfigFile, HostKeyPolicy, RetryPolicy, Settings, SshConfig, TagMatch, TunnelSpec,
    CONFIG_VERSION,
};
pub use config_store::{default_config_path, ConfigStore, TomlConfigStore};
pub use error::{Error, Result};
pub use network::{expand_path, format_host_port, is_loopback_address};
pub use types::{TunnelEvent, TunnelId, TunnelState, TunnelStatus};

// Re-export commonly used external types
pub use chrono::{DateTime, Utc};
