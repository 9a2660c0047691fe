use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Opaque node handle, unique within one profile.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    LocalMachine,
    SshHost,
    TargetHost,
    LocalPort,
    RemotePort,
    DynamicProxy,
}

impl NodeType {
    /// Node types that become forwarding directives rather than hops.
    pub fn is_directive(self) -> bool {
        matches!(
            self,
            NodeType::LocalPort | NodeType::RemotePort | NodeType::DynamicProxy
        )
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeType::LocalMachine => "local machine",
            NodeType::SshHost => "ssh host",
            NodeType::TargetHost => "target host",
            NodeType::LocalPort => "local port",
            NodeType::RemotePort => "remote port",
            NodeType::DynamicProxy => "dynamic proxy",
        };
        f.write_str(s)
    }
}

/// A vertex of the tunnel graph. Which optional fields matter depends on `node_type`:
///
/// * `SshHost`: `host_id`
/// * `TargetHost`: `remote_host`, optionally `remote_port`
/// * `LocalPort`: `local_port` -> `remote_host:remote_port`, `bind_address`
/// * `RemotePort`: remote `remote_port` -> `remote_host:local_port`, `bind_address`
/// * `DynamicProxy`: `local_port`, `bind_address`
///
/// Ports are kept wide so out-of-range values survive parsing and reach the validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelNode {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,
}

impl TunnelNode {
    pub fn new(id: impl Into<String>, node_type: NodeType) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id: NodeId(id),
            node_type,
            host_id: None,
            local_port: None,
            remote_port: None,
            remote_host: None,
            bind_address: None,
        }
    }

    pub fn with_host_id(mut self, host_id: impl Into<String>) -> Self {
        self.host_id = Some(host_id.into());
        self
    }

    pub fn with_local_port(mut self, port: u32) -> Self {
        self.local_port = Some(port);
        self
    }

    pub fn with_remote_port(mut self, port: u32) -> Self {
        self.remote_port = Some(port);
        self
    }

    pub fn with_remote_host(mut self, host: impl Into<String>) -> Self {
        self.remote_host = Some(host.into());
        self
    }

    pub fn with_bind_address(mut self, addr: impl Into<String>) -> Self {
        self.bind_address = Some(addr.into());
        self
    }

    pub fn is(&self, node_type: NodeType) -> bool {
        self.node_type == node_type
    }
}

/// Directed edge `source -> target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelEdge {
    #[serde(rename = "from")]
    pub source: NodeId,
    #[serde(rename = "to")]
    pub target: NodeId,
}

impl TunnelEdge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: NodeId(source.into()),
            target: NodeId(target.into()),
        }
    }
}

/// A user-authored tunnel graph. Nodes and edges are flat collections; all
/// traversal goes through [`Adjacency`], never through references between nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelProfile {
    /// Defaults to the file stem when loaded from disk.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub nodes: Vec<TunnelNode>,
    #[serde(default)]
    pub edges: Vec<TunnelEdge>,
}

impl TunnelProfile {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn node(mut self, node: TunnelNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn edge(mut self, source: &str, target: &str) -> Self {
        self.edges.push(TunnelEdge::new(source, target));
        self
    }

    pub fn name(&self) -> &str {
        if self.display_name.is_empty() {
            &self.id
        } else {
            &self.display_name
        }
    }

    pub fn find(&self, id: &NodeId) -> Option<&TunnelNode> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    pub fn nodes_of(&self, node_type: NodeType) -> impl Iterator<Item = &TunnelNode> {
        self.nodes.iter().filter(move |n| n.node_type == node_type)
    }

    /// The conceptual root, if exactly one LocalMachine node exists.
    pub fn root(&self) -> Option<&TunnelNode> {
        let mut roots = self.nodes_of(NodeType::LocalMachine);
        let first = roots.next()?;
        if roots.next().is_some() {
            return None;
        }
        Some(first)
    }
}

/// Index-based adjacency over a profile's arena of nodes.
///
/// Edges that reference unknown nodes, and self-loops, are dropped here; the
/// validator reports them separately.
pub struct Adjacency<'a> {
    pub nodes: &'a [TunnelNode],
    index: HashMap<&'a NodeId, usize>,
    outgoing: Vec<Vec<usize>>,
    incoming: Vec<Vec<usize>>,
}

impl<'a> Adjacency<'a> {
    pub fn build(profile: &'a TunnelProfile) -> Self {
        let nodes = profile.nodes.as_slice();
        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            // First declaration wins on duplicate ids.
            index.entry(&node.id).or_insert(i);
        }

        let mut outgoing = vec![Vec::new(); nodes.len()];
        let mut incoming = vec![Vec::new(); nodes.len()];
        for edge in &profile.edges {
            let (Some(&s), Some(&t)) = (index.get(&edge.source), index.get(&edge.target)) else {
                continue;
            };
            if s == t {
                continue;
            }
            outgoing[s].push(t);
            incoming[t].push(s);
        }

        Self {
            nodes,
            index,
            outgoing,
            incoming,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn index_of(&self, id: &NodeId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn node(&self, i: usize) -> &'a TunnelNode {
        &self.nodes[i]
    }

    pub fn outgoing(&self, i: usize) -> &[usize] {
        &self.outgoing[i]
    }

    pub fn incoming(&self, i: usize) -> &[usize] {
        &self.incoming[i]
    }

    /// Neighbours in either direction, outgoing first.
    pub fn neighbours(&self, i: usize) -> impl Iterator<Item = usize> + '_ {
        self.outgoing[i]
            .iter()
            .chain(self.incoming[i].iter())
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TunnelProfile {
        TunnelProfile::new("p", "Sample")
            .node(TunnelNode::new("local", NodeType::LocalMachine))
            .node(TunnelNode::new("a", NodeType::SshHost).with_host_id("bastion"))
            .node(TunnelNode::new("db", NodeType::LocalPort).with_local_port(5432))
            .edge("local", "a")
            .edge("a", "db")
    }

    #[test]
    fn adjacency_follows_edges() {
        let profile = sample();
        let adj = Adjacency::build(&profile);
        let a = adj.index_of(&NodeId::new("a")).unwrap();
        assert_eq!(adj.outgoing(a), &[2]);
        assert_eq!(adj.incoming(a), &[0]);
        assert_eq!(adj.neighbours(a).collect::<Vec<_>>(), vec![2, 0]);
    }

    #[test]
    fn adjacency_drops_dangling_and_self_edges() {
        let profile = sample().edge("a", "ghost").edge("a", "a");
        let adj = Adjacency::build(&profile);
        let a = adj.index_of(&NodeId::new("a")).unwrap();
        assert_eq!(adj.outgoing(a), &[2]);
    }

    #[test]
    fn root_requires_exactly_one_local_machine() {
        assert_eq!(sample().root().unwrap().id.as_str(), "local");
        let two = sample().node(TunnelNode::new("local2", NodeType::LocalMachine));
        assert!(two.root().is_none());
    }

    #[test]
    fn profile_parses_from_toml() {
        let text = r#"
id = "prod-db"
display_name = "Prod DB"

[[nodes]]
id = "me"
type = "local_machine"

[[nodes]]
id = "bastion"
type = "ssh_host"
host_id = "bastion"

[[edges]]
from = "me"
to = "bastion"
"#;
        let profile: TunnelProfile = toml::from_str(text).unwrap();
        assert_eq!(profile.name(), "Prod DB");
        assert_eq!(profile.nodes[1].node_type, NodeType::SshHost);
        assert_eq!(profile.edges[0], TunnelEdge::new("me", "bastion"));
    }
}
