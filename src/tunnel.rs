/// Loopback bind used whenever a directive does not name one.
pub const LOOPBACK: &str = "127.0.0.1";

/// A local forward: `bind_address:local_port` -> `remote_host:remote_port` (as seen from the far end).
///
/// Ports stay wide until the forwarding manager checks them, since directives
/// from ssh_config hosts never pass through graph validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalForward {
    pub bind_address: Option<String>,
    pub local_port: u32,
    pub remote_host: String,
    pub remote_port: u32,
}

impl std::fmt::Display for LocalForward {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L:{}:{}:{}", self.local_port, self.remote_host, self.remote_port)
    }
}

/// A remote (reverse) forward: remote `bind_address:remote_port` -> local `target_host:local_port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteForward {
    pub bind_address: Option<String>,
    pub remote_port: u32,
    pub target_host: String,
    pub local_port: u32,
}

impl std::fmt::Display for RemoteForward {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "R:{}→{}:{}", self.remote_port, self.target_host, self.local_port)
    }
}

/// A dynamic (SOCKS proxy) forward listening on `bind_address:local_port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicForward {
    pub bind_address: Option<String>,
    pub local_port: u32,
}

impl std::fmt::Display for DynamicForward {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "D:{}", self.local_port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardDirective {
    Local(LocalForward),
    Remote(RemoteForward),
    Dynamic(DynamicForward),
}

impl ForwardDirective {
    /// Ports a local health probe can reach once the directive is live.
    pub fn local_listen_port(&self) -> Option<u16> {
        match self {
            ForwardDirective::Local(f) => u16::try_from(f.local_port).ok(),
            ForwardDirective::Dynamic(f) => u16::try_from(f.local_port).ok(),
            ForwardDirective::Remote(_) => None,
        }
    }
}

impl std::fmt::Display for ForwardDirective {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForwardDirective::Local(d) => d.fmt(f),
            ForwardDirective::Remote(d) => d.fmt(f),
            ForwardDirective::Dynamic(d) => d.fmt(f),
        }
    }
}

/// Join the display form of several directives, as shown in listings.
pub fn describe(directives: &[ForwardDirective]) -> String {
    directives
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_forms() {
        let l = ForwardDirective::Local(LocalForward {
            bind_address: None,
            local_port: 8080,
            remote_host: "web".into(),
            remote_port: 80,
        });
        let r = ForwardDirective::Remote(RemoteForward {
            bind_address: None,
            remote_port: 9090,
            target_host: "localhost".into(),
            local_port: 3000,
        });
        let d = ForwardDirective::Dynamic(DynamicForward {
            bind_address: None,
            local_port: 1080,
        });
        assert_eq!(describe(&[l, r, d]), "L:8080:web:80, R:9090→localhost:3000, D:1080");
    }

    #[test]
    fn remote_forwards_have_no_local_probe() {
        let r = ForwardDirective::Remote(RemoteForward {
            bind_address: None,
            remote_port: 9090,
            target_host: "localhost".into(),
            local_port: 3000,
        });
        assert_eq!(r.local_listen_port(), None);
        let d = ForwardDirective::Dynamic(DynamicForward {
            bind_address: None,
            local_port: 70000,
        });
        assert_eq!(d.local_listen_port(), None);
    }
}
