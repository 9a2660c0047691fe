use std::path::PathBuf;

use crate::tunnel::ForwardDirective;

pub const DEFAULT_SSH_PORT: u16 = 22;

/// One SSH-reachable host as known to the host store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRecord {
    pub id: String,
    pub hostname: String,
    pub port: u16,
    pub user: String,
    pub identity_file: Option<PathBuf>,
    /// Raw ProxyJump value, expanded by the jump-chain resolver.
    pub proxy_jump: Option<String>,
    /// Forwards declared directly on the host.
    pub forwards: Vec<ForwardDirective>,
}

impl HostRecord {
    pub fn new(id: impl Into<String>, hostname: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            hostname: hostname.into(),
            port: DEFAULT_SSH_PORT,
            user: user.into(),
            identity_file: None,
            proxy_jump: None,
            forwards: Vec::new(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_proxy_jump(mut self, jump: impl Into<String>) -> Self {
        self.proxy_jump = Some(jump.into());
        self
    }

    pub fn with_forward(mut self, forward: ForwardDirective) -> Self {
        self.forwards.push(forward);
        self
    }
}

/// Read-only host lookup.
pub trait HostStore: Send + Sync {
    fn get_by_id(&self, id: &str) -> Option<HostRecord>;
}

/// An in-memory host store, as produced by the ssh_config parser.
#[derive(Debug, Clone, Default)]
pub struct HostCatalog {
    hosts: Vec<HostRecord>,
}

impl HostCatalog {
    pub fn new(hosts: Vec<HostRecord>) -> Self {
        Self { hosts }
    }

    pub fn iter(&self) -> impl Iterator<Item = &HostRecord> {
        self.hosts.iter()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

impl HostStore for HostCatalog {
    fn get_by_id(&self, id: &str) -> Option<HostRecord> {
        // First match wins, as in OpenSSH.
        self.hosts.iter().find(|h| h.id == id).cloned()
    }
}
