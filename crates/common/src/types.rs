// Common types for tunnel9

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable identity of a tunnel within one config
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TunnelId(String);

impl TunnelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh id for a tunnel created interactively
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("t-{}", &uuid[..12]))
    }

    /// Derive an id from a display name: lower-cased, runs of other characters become `-`
    pub fn from_name(name: &str) -> Self {
        let mut slug = String::with_capacity(name.len());
        for c in name.trim().chars() {
            if c.is_ascii_alphanumeric() {
                slug.push(c.to_ascii_lowercase());
            } else if !slug.ends_with('-') {
                slug.push('-');
            }
        }
        Self(slug.trim_matches('-').to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TunnelId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Lifecycle status of a tunnel
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum TunnelStatus {
    /// No task, no connection
    #[default]
    Idle,
    /// TCP + SSH handshake + authentication + local bind in progress
    Starting,
    /// Port forwarding running
    Connected,
    /// Waiting out a backoff delay before the next attempt
    Retrying,
    /// Gave up; needs a manual start
    Failed,
    /// Teardown requested, waiting for the task to finish
    Stopping,
}

impl TunnelStatus {
    /// Whether the lifecycle allows moving from `self` to `next`
    pub fn can_transition_to(self, next: TunnelStatus) -> bool {
        use TunnelStatus::*;
        matches!(
            (self, next),
            (Idle, Starting)
                | (Starting, Connected)
                | (Starting, Retrying)
                | (Starting, Failed)
                | (Starting, Stopping)
                | (Connected, Retrying)
                | (Connected, Stopping)
                | (Retrying, Starting)
                | (Retrying, Idle)
                | (Stopping, Idle)
                | (Failed, Starting)
        )
    }

    /// Statuses in which a tunnel owns a live connection task
    pub fn holds_handle(self) -> bool {
        matches!(
            self,
            TunnelStatus::Starting
                | TunnelStatus::Connected
                | TunnelStatus::Retrying
                | TunnelStatus::Stopping
        )
    }

    /// Statuses from which a Start begins a new run
    pub fn can_start(self) -> bool {
        matches!(self, TunnelStatus::Idle | TunnelStatus::Failed)
    }

    /// Statuses in which a Stop has something to tear down
    pub fn can_stop(self) -> bool {
        matches!(
            self,
            TunnelStatus::Starting | TunnelStatus::Connected | TunnelStatus::Retrying
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            TunnelStatus::Idle => "idle",
            TunnelStatus::Starting => "starting",
            TunnelStatus::Connected => "connected",
            TunnelStatus::Retrying => "retrying",
            TunnelStatus::Failed => "failed",
            TunnelStatus::Stopping => "stopping",
        }
    }
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Runtime record paired with a tunnel spec
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelState {
    pub status: TunnelStatus,
    pub last_error: Option<String>,
    pub retry_count: u32,
    pub connected_since: Option<DateTime<Utc>>,
}

/// Events emitted by the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// A tunnel moved to a new status
    StatusChanged {
        id: TunnelId,
        status: TunnelStatus,
        error: Option<String>,
        retry_count: u32,
        connected_since: Option<DateTime<Utc>>,
    },
    /// A tunnel released its connection task (now Idle or Failed)
    Exited { id: TunnelId },
}
