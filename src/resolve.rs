use std::path::PathBuf;

use thiserror::Error;

use crate::graph::{Adjacency, NodeId, NodeType, TunnelNode, TunnelProfile};
use crate::hosts::{HostRecord, HostStore};
use crate::tunnel::{DynamicForward, ForwardDirective, LocalForward, RemoteForward};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("{node} has no host_id")]
    MissingHostId { node: NodeId },
    #[error("{node} refers to unknown host '{host_id}'")]
    UnknownHost { node: NodeId, host_id: String },
}

/// Connection parameters for one hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hop {
    /// Host store id, when the hop came from one.
    pub host_id: Option<String>,
    pub hostname: String,
    pub port: u16,
    pub user: String,
    pub identity_file: Option<PathBuf>,
}

impl Hop {
    pub fn from_record(record: &HostRecord) -> Self {
        Self {
            host_id: Some(record.id.clone()),
            hostname: record.hostname.clone(),
            port: record.port,
            user: record.user.clone(),
            identity_file: record.identity_file.clone(),
        }
    }

    /// Name shown in logs and listings: the host id if known, else the hostname.
    pub fn label(&self) -> &str {
        self.host_id.as_deref().unwrap_or(&self.hostname)
    }
}

impl std::fmt::Display for Hop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.hostname.contains(':') {
            write!(f, "{}@[{}]:{}", self.user, self.hostname, self.port)
        } else {
            write!(f, "{}@{}:{}", self.user, self.hostname, self.port)
        }
    }
}

/// Ordered hops; the last one is the target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionChain {
    hops: Vec<Hop>,
}

impl ConnectionChain {
    pub fn new(hops: Vec<Hop>) -> Self {
        Self { hops }
    }

    pub fn hops(&self) -> &[Hop] {
        &self.hops
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    pub fn target(&self) -> Option<&Hop> {
        self.hops.last()
    }

    /// Every hop before the target.
    pub fn jumps(&self) -> &[Hop] {
        match self.hops.split_last() {
            Some((_, jumps)) => jumps,
            None => &[],
        }
    }

    pub fn labels(&self) -> Vec<String> {
        self.hops.iter().map(|h| h.label().to_string()).collect()
    }
}

/// A profile reduced to a single hop path plus the forwarding nodes hanging off it.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedChain {
    /// Winning path, root first.
    pub path: Vec<TunnelNode>,
    /// Target and forwarding nodes that are not on `path`.
    pub side: Vec<TunnelNode>,
    /// Forwarding directives in declaration order, with destinations resolved.
    pub directives: Vec<ForwardDirective>,
}

impl ResolvedChain {
    pub fn ssh_hops(&self) -> impl Iterator<Item = &TunnelNode> {
        self.path.iter().filter(|n| n.is(NodeType::SshHost))
    }

    /// A chain without SSH hosts has nothing to connect.
    pub fn has_hops(&self) -> bool {
        self.ssh_hops().next().is_some()
    }

    /// Look up every SSH hop in the host store.
    pub fn materialize(&self, hosts: &dyn HostStore) -> Result<ConnectionChain, ResolveError> {
        let mut hops = Vec::new();
        for node in self.ssh_hops() {
            let host_id = node
                .host_id
                .as_deref()
                .filter(|h| !h.is_empty())
                .ok_or_else(|| ResolveError::MissingHostId {
                    node: node.id.clone(),
                })?;
            let record = hosts
                .get_by_id(host_id)
                .ok_or_else(|| ResolveError::UnknownHost {
                    node: node.id.clone(),
                    host_id: host_id.to_string(),
                })?;
            hops.push(Hop::from_record(&record));
        }
        Ok(ConnectionChain::new(hops))
    }
}

/// Reduce `profile` to the path from `root` with the most SSH hosts, ties
/// going to the longer path. Terminates on cyclic input.
pub fn resolve(profile: &TunnelProfile, root: &NodeId) -> ResolvedChain {
    let adj = Adjacency::build(profile);

    let best = match adj.index_of(root) {
        Some(start) => {
            let mut search = PathSearch {
                adj: &adj,
                on_path: vec![false; adj.len()],
                path: Vec::new(),
                best: Vec::new(),
                best_score: (0, 0),
            };
            search.visit(start);
            search.best
        }
        None => Vec::new(),
    };

    let mut on_path = vec![false; adj.len()];
    for &i in &best {
        on_path[i] = true;
    }

    let path = best.iter().map(|&i| adj.node(i).clone()).collect();
    let side = profile
        .nodes
        .iter()
        .enumerate()
        .filter(|(i, n)| {
            !on_path[*i] && (n.node_type.is_directive() || n.is(NodeType::TargetHost))
        })
        .map(|(_, n)| n.clone())
        .collect();
    let directives = profile
        .nodes
        .iter()
        .enumerate()
        .filter_map(|(i, n)| directive_for(&adj, i, n))
        .collect();

    ResolvedChain {
        path,
        side,
        directives,
    }
}

struct PathSearch<'a, 'p> {
    adj: &'a Adjacency<'p>,
    on_path: Vec<bool>,
    path: Vec<usize>,
    best: Vec<usize>,
    best_score: (usize, usize),
}

impl PathSearch<'_, '_> {
    fn visit(&mut self, node: usize) {
        self.on_path[node] = true;
        self.path.push(node);

        let ssh = self
            .path
            .iter()
            .filter(|&&i| self.adj.node(i).is(NodeType::SshHost))
            .count();
        let score = (ssh, self.path.len());
        if self.best.is_empty() || score > self.best_score {
            self.best_score = score;
            self.best = self.path.clone();
        }

        for &next in self.adj.outgoing(node) {
            if !self.on_path[next] {
                self.visit(next);
            }
        }

        self.path.pop();
        self.on_path[node] = false;
    }
}

/// First TargetHost adjacent to `index`, outgoing edges before incoming.
fn connected_target<'p>(adj: &Adjacency<'p>, index: usize) -> Option<&'p TunnelNode> {
    adj.neighbours(index)
        .map(|n| adj.node(n))
        .find(|n| n.is(NodeType::TargetHost))
}

/// Destination host for a forwarding node: connected target, then its own
/// `remote_host`, then localhost.
fn destination_host(adj: &Adjacency<'_>, index: usize, node: &TunnelNode) -> String {
    connected_target(adj, index)
        .and_then(|t| t.remote_host.clone())
        .or_else(|| node.remote_host.clone())
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Ports always come from the node itself; a connected target only supplies the host.
fn directive_for(adj: &Adjacency<'_>, index: usize, node: &TunnelNode) -> Option<ForwardDirective> {
    match node.node_type {
        NodeType::LocalPort => Some(ForwardDirective::Local(LocalForward {
            bind_address: node.bind_address.clone(),
            local_port: node.local_port.unwrap_or(0),
            remote_host: destination_host(adj, index, node),
            remote_port: node.remote_port.unwrap_or(0),
        })),
        NodeType::RemotePort => Some(ForwardDirective::Remote(RemoteForward {
            bind_address: node.bind_address.clone(),
            remote_port: node.remote_port.unwrap_or(0),
            target_host: destination_host(adj, index, node),
            local_port: node.local_port.unwrap_or(0),
        })),
        NodeType::DynamicProxy => Some(ForwardDirective::Dynamic(DynamicForward {
            bind_address: node.bind_address.clone(),
            local_port: node.local_port.unwrap_or(0),
        })),
        _ => None,
    }
}
