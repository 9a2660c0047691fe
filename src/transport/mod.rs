//! The seam between chain orchestration and the SSH protocol.
//!
//! Everything above this module talks to [`SshTransport`] and [`SshClient`];
//! [`libssh2::Libssh2Transport`] is the production implementation.

pub mod libssh2;
pub mod socks;

use std::net::SocketAddr;

use thiserror::Error;

use crate::keys::KeyMaterial;
use crate::resolve::Hop;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyStatus {
    /// Present in known_hosts and matching.
    Known,
    /// Not in known_hosts.
    Unknown,
    /// In known_hosts with a different key.
    Changed,
}

impl std::fmt::Display for HostKeyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostKeyStatus::Known => write!(f, "known"),
            HostKeyStatus::Unknown => write!(f, "unknown"),
            HostKeyStatus::Changed => write!(f, "changed"),
        }
    }
}

/// What the transport saw during the handshake, handed to a [`HostKeyVerifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKeyInfo {
    pub host: String,
    pub port: u16,
    pub key_type: String,
    /// `SHA256:<base64>`, as printed by OpenSSH.
    pub fingerprint: String,
    pub status: HostKeyStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyDecision {
    Reject,
    AcceptOnce,
    AcceptAndRemember,
}

/// Called on the connecting thread while the handshake is paused; the
/// answer is awaited synchronously.
pub trait HostKeyVerifier: Send + Sync {
    fn verify(&self, info: &HostKeyInfo) -> HostKeyDecision;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPrompt {
    pub text: String,
    pub echo: bool,
}

/// Answers keyboard-interactive, password and passphrase prompts.
/// `None` abandons the method.
pub trait InteractiveAuth: Send + Sync {
    fn respond(&self, hop: &Hop, instructions: &str, prompts: &[AuthPrompt]) -> Option<Vec<String>>;
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Ssh(#[from] ssh2::Error),
    #[error("cannot resolve {host}:{port}")]
    Resolve { host: String, port: u16 },
    #[error("timed out {0}")]
    Timeout(&'static str),
    #[error("host key for {host} rejected ({status})")]
    HostKeyRejected { host: String, status: HostKeyStatus },
    #[error("server sent no host key")]
    NoHostKey,
    #[error("authentication failed for {user}@{host}")]
    AuthFailed { user: String, host: String },
    #[error(transparent)]
    Socks(#[from] socks::SocksError),
}

/// One connection attempt.
pub struct ConnectRequest<'a> {
    pub hop: &'a Hop,
    /// Dial this local endpoint instead of the hop's own address.
    pub via: Option<SocketAddr>,
    pub key: Option<&'a KeyMaterial>,
}

pub trait SshTransport: Send + Sync {
    fn connect(
        &self,
        request: &ConnectRequest<'_>,
        verifier: &dyn HostKeyVerifier,
        auth: &dyn InteractiveAuth,
    ) -> Result<Box<dyn SshClient>, TransportError>;
}

/// An authenticated connection to one hop.
pub trait SshClient: Send + Sync {
    fn label(&self) -> &str;

    fn open_local_forward(
        &mut self,
        bind: &str,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<Box<dyn ForwardListener>, TransportError>;

    fn open_remote_forward(
        &mut self,
        bind: &str,
        remote_port: u16,
        target_host: &str,
        local_port: u16,
    ) -> Result<Box<dyn ForwardListener>, TransportError>;

    fn open_dynamic_forward(
        &mut self,
        bind: &str,
        local_port: u16,
    ) -> Result<Box<dyn ForwardListener>, TransportError>;

    /// Close the connection. Calling it twice is harmless.
    fn disconnect(&mut self) -> Result<(), TransportError>;
}

/// A running forward.
pub trait ForwardListener: Send + Sync {
    /// Port actually bound (differs from the request when it asked for 0).
    fn bound_port(&self) -> u16;

    fn stop(&mut self) -> Result<(), TransportError>;
}

/// Verifier that only trusts keys already in known_hosts.
#[derive(Debug, Default, Clone, Copy)]
pub struct KnownHostsOnly;

impl HostKeyVerifier for KnownHostsOnly {
    fn verify(&self, info: &HostKeyInfo) -> HostKeyDecision {
        match info.status {
            HostKeyStatus::Known => HostKeyDecision::AcceptOnce,
            status => {
                tracing::warn!(host = %info.host, %status, "host key not trusted and no terminal to ask");
                HostKeyDecision::Reject
            }
        }
    }
}

/// Auth handler for unattended runs: answers nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoInteraction;

impl InteractiveAuth for NoInteraction {
    fn respond(&self, _: &Hop, _: &str, _: &[AuthPrompt]) -> Option<Vec<String>> {
        None
    }
}
