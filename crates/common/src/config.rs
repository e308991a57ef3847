// Configuration structures for tunnel9

use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::TunnelId;

/// Current on-disk config format version
pub const CONFIG_VERSION: u32 = 1;

/// A configured forwarding route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelSpec {
    /// Unique tunnel identifier (derived from the name when omitted)
    #[serde(default, skip_serializing_if = "TunnelId::is_empty")]
    pub id: TunnelId,
    /// Human-readable tunnel name
    pub name: String,
    /// Local bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Local port to bind
    pub local_port: u16,
    /// Host to forward to, as seen from the SSH server
    pub remote_host: String,
    /// Port to forward to
    pub remote_port: u16,
    /// Labels for bulk selection
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    /// SSH server to tunnel through
    pub ssh: SshConfig,
    /// Per-tunnel retry policy override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

/// SSH connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshConfig {
    /// SSH server hostname or IP
    pub host: String,
    /// SSH server port (default: 22)
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// SSH username (default: the local user)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Path to SSH private key; `~` is expanded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
    /// Environment variable holding the key passphrase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase_env: Option<String>,
}

/// Exponential backoff between reconnect attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Growth factor applied per attempt
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Upper bound for a single delay in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Maximum consecutive retries (0 = unlimited)
    #[serde(default)]
    pub max_attempts: u32,
    /// Fraction of the delay that may be shaved off at random (0.0 - 1.0)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

/// How auto-start compares requested tags with tunnel tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TagMatch {
    #[default]
    Exact,
    IgnoreCase,
}

/// What to do with a host key that is not in known_hosts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Refuse unknown hosts
    Strict,
    /// Trust and record unknown hosts on first use
    #[default]
    AcceptNew,
}

/// Global behaviour settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    #[serde(default = "default_quit_timeout_ms")]
    pub quit_timeout_ms: u64,
    #[serde(default)]
    pub tag_match: TagMatch,
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,
    /// Path to known_hosts (default: ~/.ssh/known_hosts)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_hosts_path: Option<String>,
    /// Default retry policy for tunnels without an override
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Whole config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub tunnels: Vec<TunnelSpec>,
}

// Default value functions
fn default_version() -> u32 {
    CONFIG_VERSION
}

fn default_ssh_port() -> u16 {
    22
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_jitter() -> f64 {
    0.2
}

fn default_connect_timeout_ms() -> u64 {
    15_000
}

fn default_stop_timeout_ms() -> u64 {
    3_000
}

fn default_shutdown_timeout_ms() -> u64 {
    5_000
}

fn default_quit_timeout_ms() -> u64 {
    8_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: 0,
            jitter: default_jitter(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            quit_timeout_ms: default_quit_timeout_ms(),
            tag_match: TagMatch::default(),
            host_key_policy: HostKeyPolicy::default(),
            known_hosts_path: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            settings: Settings::default(),
            tunnels: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay before retry number `attempt` (1-based)
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = if millis.is_finite() {
            millis.min(self.max_delay_ms as f64)
        } else {
            self.max_delay_ms as f64
        };
        Duration::from_millis(capped as u64)
    }

    /// Delay before retry number `attempt` with jitter drawn from `rng`
    pub fn delay_with<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let shave = rng.gen_range(0.0..=self.jitter.min(1.0));
        base.mul_f64(1.0 - shave)
    }

    /// Delay before retry number `attempt` using the thread-local RNG
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    /// Whether retry number `attempt` (1-based) is within budget
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt <= self.max_attempts
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.multiplier >= 1.0) {
            return Err(Error::Config(
                "Retry multiplier must be at least 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(Error::Config(
                "Retry jitter must be between 0.0 and 1.0".to_string(),
            ));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(Error::Config(
                "Retry max delay must not be below the base delay".to_string(),
            ));
        }
        Ok(())
    }
}

impl Settings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn quit_timeout(&self) -> Duration {
        Duration::from_millis(self.quit_timeout_ms)
    }

    /// Resolved known_hosts path
    pub fn known_hosts_path(&self) -> PathBuf {
        match &self.known_hosts_path {
            Some(path) => crate::expand_path(path),
            None => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".ssh")
                .join("known_hosts"),
        }
    }
}

impl TunnelSpec {
    /// Create a tunnel spec with default bind address and no tags
    pub fn new(
        name: impl Into<String>,
        local_port: u16,
        remote_host: impl Into<String>,
        remote_port: u16,
        ssh_host: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            id: TunnelId::from_name(&name),
            name,
            bind_address: default_bind_address(),
            local_port,
            remote_host: remote_host.into(),
            remote_port,
            tags: BTreeSet::new(),
            ssh: SshConfig {
                host: ssh_host.into(),
                port: default_ssh_port(),
                user: None,
                key_path: None,
                passphrase_env: None,
            },
            retry: None,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Retry policy for this tunnel, falling back to the global one
    pub fn retry_policy<'a>(&'a self, default: &'a RetryPolicy) -> &'a RetryPolicy {
        self.retry.as_ref().unwrap_or(default)
    }

    /// "127.0.0.1:5432"
    pub fn local_endpoint(&self) -> String {
        crate::format_host_port(&self.bind_address, self.local_port)
    }

    /// "db.internal:5432"
    pub fn remote_endpoint(&self) -> String {
        crate::format_host_port(&self.remote_host, self.remote_port)
    }

    /// "deploy@bastion:22" or "bastion:22"
    pub fn ssh_endpoint(&self) -> String {
        let host = crate::format_host_port(&self.ssh.host, self.ssh.port);
        match &self.ssh.user {
            Some(user) => format!("{}@{}", user, host),
            None => host,
        }
    }

    /// Validate the tunnel configuration
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| Error::InvalidSpec {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name cannot be empty"));
        }
        if self.id.is_empty() {
            return Err(invalid("id cannot be empty"));
        }
        if self.local_port == 0 {
            return Err(invalid("local port must be greater than 0"));
        }
        if self.bind_address.trim().is_empty() {
            return Err(invalid("bind address cannot be empty"));
        }
        if self.remote_host.trim().is_empty() {
            return Err(invalid("remote host cannot be empty"));
        }
        if self.remote_port == 0 {
            return Err(invalid("remote port must be greater than 0"));
        }
        if self.ssh.host.trim().is_empty() {
            return Err(invalid("SSH host cannot be empty"));
        }
        if self.ssh.port == 0 {
            return Err(invalid("SSH port must be greater than 0"));
        }
        if self.tags.iter().any(|t| t.trim().is_empty() || t.contains(',')) {
            return Err(invalid("tags must be non-empty and must not contain commas"));
        }
        if let Some(retry) = &self.retry {
            retry.validate().map_err(|e| invalid(&e.to_string()))?;
        }
        Ok(())
    }
}

impl ConfigFile {
    /// Fill in derived ids and validate the whole file
    pub fn normalize(&mut self) -> Result<()> {
        self.settings.retry.validate()?;

        let mut seen = HashSet::new();
        for spec in &mut self.tunnels {
            if spec.id.is_empty() {
                spec.id = TunnelId::from_name(&spec.name);
            }
            spec.validate()?;
            if !seen.insert(spec.id.clone()) {
                return Err(Error::DuplicateId(spec.id.clone()));
            }
        }
        Ok(())
    }
}

/// Check that ids in a tunnel list are unique
pub fn ensure_unique_ids(tunnels: &[TunnelSpec]) -> Result<()> {
    let mut seen = HashSet::new();
    for spec in tunnels {
        if !seen.insert(&spec.id) {
            return Err(Error::DuplicateId(spec.id.clone()));
        }
    }
    Ok(())
}
