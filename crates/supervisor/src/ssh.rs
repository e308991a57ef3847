// tunnel9 - SSH Module
// Local port forwarding over russh, plugged into the supervisor as a Connector

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, AuthResult, Config, Handle};
use russh::keys::{load_secret_key, PrivateKey, PrivateKeyWithHashAlg};
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use tunnel9_common::{
    expand_path, format_host_port, is_loopback_address, HostKeyPolicy, Settings, TunnelSpec,
};

use crate::connector::{Connector, TunnelConnection};
use crate::error::TunnelError;
use crate::known_hosts::{KnownHosts, VerifyResult};

/// Keys tried in order when a tunnel does not name one
const DEFAULT_KEY_NAMES: &[&str] = &["id_ed25519", "id_ecdsa", "id_rsa"];

/// Consecutive channel-open failures after which the session is considered dead
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// How often the forward loop checks that the SSH session is still up
const LIVENESS_INTERVAL: Duration = Duration::from_secs(1);

/// Opens SSH sessions and runs local port forwards
#[derive(Debug, Clone)]
pub struct SshConnector {
    host_key_policy: HostKeyPolicy,
    known_hosts_path: PathBuf,
}

impl SshConnector {
    pub fn new(settings: &Settings) -> Self {
        Self {
            host_key_policy: settings.host_key_policy,
            known_hosts_path: settings.known_hosts_path(),
        }
    }

    fn client_config() -> Arc<Config> {
        let mut cfg = Config::default();
        // disable nagle for lower latency
        cfg.nodelay = true;
        // keepalives so a dead peer is noticed
        cfg.keepalive_interval = Some(Duration::from_secs(30));
        cfg.keepalive_max = 3;
        Arc::new(cfg)
    }
}

/// SSH client handler: host key verification only
struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    known_hosts_path: PathBuf,
    /// Why the host key was refused, read back after a failed handshake
    rejection: Arc<Mutex<Option<TunnelError>>>,
}

impl ClientHandler {
    fn reject(&self, error: TunnelError) -> Result<bool, russh::Error> {
        if let Ok(mut slot) = self.rejection.lock() {
            *slot = Some(error);
        }
        Ok(false)
    }
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        let mut known_hosts = match KnownHosts::load_from(&self.known_hosts_path) {
            Ok(known_hosts) => known_hosts,
            Err(e) => {
                return self.reject(TunnelError::ConfigMismatch(format!(
                    "cannot read {}: {}",
                    self.known_hosts_path.display(),
                    e
                )))
            }
        };

        let host = self.host.clone();
        let port = self.port;

        match known_hosts.verify(&host, port, server_public_key) {
            VerifyResult::Trusted => {
                debug!("Host key verified for {}:{}", host, port);
                Ok(true)
            }

            VerifyResult::Unknown => match self.policy {
                HostKeyPolicy::Strict => {
                    warn!("Unknown host key for {}:{} refused", host, port);
                    self.reject(TunnelError::Auth(format!(
                        "host key for {} is not in {}",
                        format_host_port(&host, port),
                        known_hosts.path().display()
                    )))
                }
                HostKeyPolicy::AcceptNew => {
                    if let Err(e) = known_hosts.learn(&host, port, server_public_key) {
                        warn!("Failed to record host key for {}:{}: {}", host, port, e);
                    }
                    Ok(true)
                }
            },

            VerifyResult::Mismatch {
                actual_fingerprint,
                line_number,
            } => {
                error!("@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@");
                error!("@    WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED!     @");
                error!("@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@");
                error!("Host: {}:{}", host, port);
                error!("Actual fingerprint: {}", actual_fingerprint);
                error!(
                    "Offending entry: line {} of {}",
                    line_number,
                    known_hosts.path().display()
                );

                self.reject(TunnelError::Auth(format!(
                    "host key for {} changed (known_hosts line {})",
                    format_host_port(&host, port),
                    line_number
                )))
            }
        }
    }
}

/// A live SSH session with its forward loop
struct SshConnection {
    session: Arc<Handle<ClientHandler>>,
    forward_task: JoinHandle<TunnelError>,
}

impl Drop for SshConnection {
    fn drop(&mut self) {
        // Relays live inside the forward task; aborting it closes them and the listener
        self.forward_task.abort();
    }
}

#[async_trait]
impl TunnelConnection for SshConnection {
    async fn closed(&mut self) -> TunnelError {
        match (&mut self.forward_task).await {
            Ok(error) => error,
            Err(e) => TunnelError::Connection(format!("forward task ended: {}", e)),
        }
    }

    async fn close(self: Box<Self>) {
        self.forward_task.abort();
        if let Err(e) = self
            .session
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            debug!("Failed to disconnect gracefully: {}", e);
        }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, spec: &TunnelSpec) -> Result<Box<dyn TunnelConnection>, TunnelError> {
        // Local problems first, before touching the network
        let user = resolve_user(spec)?;
        let keys = load_keys(spec)?;

        let addr = format_host_port(&spec.ssh.host, spec.ssh.port);
        info!("Connecting to SSH server: {}", addr);

        let rejection = Arc::new(Mutex::new(None));
        let handler = ClientHandler {
            host: spec.ssh.host.clone(),
            port: spec.ssh.port,
            policy: self.host_key_policy,
            known_hosts_path: self.known_hosts_path.clone(),
            rejection: rejection.clone(),
        };

        let mut session = match client::connect(
            Self::client_config(),
            (spec.ssh.host.as_str(), spec.ssh.port),
            handler,
        )
        .await
        {
            Ok(session) => session,
            Err(e) => {
                let refused = rejection.lock().ok().and_then(|mut slot| slot.take());
                return Err(refused.unwrap_or_else(|| {
                    TunnelError::Connection(format!("Failed to connect to {}: {}", addr, e))
                }));
            }
        };

        authenticate(&mut session, &user, keys).await?;
        info!("SSH authentication successful for {}", spec.ssh_endpoint());

        let listener = TcpListener::bind((spec.bind_address.as_str(), spec.local_port))
            .await
            .map_err(|e| classify_bind_error(&spec.local_endpoint(), e))?;
        info!(
            "Listening on {} -> {}",
            spec.local_endpoint(),
            spec.remote_endpoint()
        );
        if !is_loopback_address(&spec.bind_address) {
            warn!(
                "Tunnel {} listens on {}, reachable from other hosts",
                spec.id,
                spec.local_endpoint()
            );
        }

        let session = Arc::new(session);
        let forward_task = tokio::spawn(run_local_forward(
            session.clone(),
            listener,
            spec.remote_host.clone(),
            spec.remote_port,
        ));

        Ok(Box::new(SshConnection {
            session,
            forward_task,
        }))
    }
}

/// SSH user from the spec, else the local user
fn resolve_user(spec: &TunnelSpec) -> Result<String, TunnelError> {
    spec.ssh
        .user
        .clone()
        .filter(|user| !user.trim().is_empty())
        .or_else(|| std::env::var("USER").ok())
        .or_else(|| std::env::var("USERNAME").ok())
        .ok_or_else(|| TunnelError::ConfigMismatch("no SSH user configured".to_string()))
}

/// Private keys to offer, in order
fn load_keys(spec: &TunnelSpec) -> Result<Vec<PrivateKey>, TunnelError> {
    let passphrase = match &spec.ssh.passphrase_env {
        Some(var) => Some(Zeroizing::new(std::env::var(var).map_err(|_| {
            TunnelError::ConfigMismatch(format!(
                "passphrase variable {} is not set",
                var
            ))
        })?)),
        None => None,
    };
    let passphrase = passphrase.as_ref().map(|p| p.as_str());

    if let Some(key_path) = &spec.ssh.key_path {
        let path = expand_path(key_path);
        let key = load_secret_key(&path, passphrase).map_err(|e| {
            TunnelError::ConfigMismatch(format!(
                "Failed to load SSH key from {}: {}",
                path.display(),
                e
            ))
        })?;
        return Ok(vec![key]);
    }

    Ok(default_key_paths()
        .into_iter()
        .filter(|path| path.exists())
        .filter_map(|path| match load_secret_key(&path, passphrase) {
            Ok(key) => Some(key),
            Err(e) => {
                debug!("Skipping key {}: {}", path.display(), e);
                None
            }
        })
        .collect())
}

fn default_key_paths() -> Vec<PathBuf> {
    let ssh_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ssh");
    DEFAULT_KEY_NAMES.iter().map(|name| ssh_dir.join(name)).collect()
}

/// Offer each key until the server accepts one
async fn authenticate(
    session: &mut Handle<ClientHandler>,
    user: &str,
    keys: Vec<PrivateKey>,
) -> Result<(), TunnelError> {
    if keys.is_empty() {
        return Err(TunnelError::Auth("no usable SSH key found".to_string()));
    }

    let hash = session
        .best_supported_rsa_hash()
        .await
        .map_err(|e| TunnelError::Connection(format!("SSH negotiation failed: {}", e)))?
        .flatten();

    for key in keys {
        let algorithm = key.algorithm();
        let auth_result = session
            .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash))
            .await
            .map_err(|e| TunnelError::Connection(format!("Public key authentication failed: {}", e)))?;

        match auth_result {
            AuthResult::Success => return Ok(()),
            AuthResult::Failure { .. } => {
                debug!("Server rejected {} key for {}", algorithm.as_str(), user);
            }
        }
    }

    Err(TunnelError::Auth(format!(
        "public key authentication rejected for user {}",
        user
    )))
}

/// Map a local bind failure onto the tunnel error classes
fn classify_bind_error(endpoint: &str, e: io::Error) -> TunnelError {
    match e.kind() {
        io::ErrorKind::PermissionDenied => TunnelError::ConfigMismatch(format!(
            "Permission denied binding to {} (privileged port?)",
            endpoint
        )),
        io::ErrorKind::AddrNotAvailable | io::ErrorKind::InvalidInput => {
            TunnelError::ConfigMismatch(format!("Cannot bind to {}: {}", endpoint, e))
        }
        io::ErrorKind::AddrInUse => {
            TunnelError::Connection(format!("{} is already in use", endpoint))
        }
        _ => TunnelError::Connection(format!("Failed to bind to {}: {}", endpoint, e)),
    }
}

/// Accept local clients and relay each through its own SSH channel
///
/// Returns when the SSH session dies. Relays run in a JoinSet owned by this
/// future, so aborting it tears every relay down.
async fn run_local_forward(
    session: Arc<Handle<ClientHandler>>,
    listener: TcpListener,
    remote_host: String,
    remote_port: u16,
) -> TunnelError {
    let mut relays = JoinSet::new();
    let mut liveness = tokio::time::interval(LIVENESS_INTERVAL);
    let mut consecutive_failures = 0;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                };
                debug!("Accepted connection from {}", peer_addr);

                let channel = match session
                    .channel_open_direct_tcpip(
                        remote_host.as_str(),
                        remote_port.into(),
                        peer_addr.ip().to_string(),
                        peer_addr.port().into(),
                    )
                    .await
                {
                    Ok(channel) => {
                        consecutive_failures = 0;
                        channel
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        error!(
                            "Failed to open channel ({}/{}): {}",
                            consecutive_failures, MAX_CONSECUTIVE_FAILURES, e
                        );
                        if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                            return TunnelError::Connection(format!(
                                "SSH session appears dead after {} consecutive channel failures",
                                MAX_CONSECUTIVE_FAILURES
                            ));
                        }
                        continue;
                    }
                };

                relays.spawn(relay(stream, channel));
            }
            Some(finished) = relays.join_next(), if !relays.is_empty() => {
                if let Err(e) = finished {
                    debug!("Relay task ended abnormally: {}", e);
                }
            }
            _ = liveness.tick() => {
                if session.is_closed() {
                    return TunnelError::Connection("SSH session closed".to_string());
                }
            }
        }
    }
}

/// Copy bytes between a local client and its SSH channel until either side closes
async fn relay(mut tcp_stream: TcpStream, channel: russh::Channel<client::Msg>) {
    let mut channel_stream = channel.into_stream();
    match copy_bidirectional(&mut tcp_stream, &mut channel_stream).await {
        Ok((from_tcp, from_ssh)) => debug!(
            "Forward connection closed: {} bytes from TCP, {} bytes from SSH",
            from_tcp, from_ssh
        ),
        Err(e) => debug!("Forward connection ended: {}", e),
    }
}
