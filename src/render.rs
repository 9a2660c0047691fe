use thiserror::Error;

use crate::hosts::HostStore;
use crate::resolve::{ConnectionChain, Hop, ResolveError, ResolvedChain};
use crate::tunnel::ForwardDirective;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("{field} '{value}' contains characters that are not allowed in a command")]
    UnsafeIdentifier { field: &'static str, value: String },
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("profile has no SSH hosts to connect")]
    NoHops,
    #[error("{directive}: port {value} is out of range")]
    InvalidPort { directive: String, value: u32 },
}

fn allowed(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '@' | ':' | '[' | ']')
}

/// Reject anything outside the identifier allow-list. Values are never stripped.
pub fn sanitize<'a>(field: &'static str, value: &'a str) -> Result<&'a str, RenderError> {
    if value.is_empty() || !value.chars().all(allowed) {
        return Err(RenderError::UnsafeIdentifier {
            field,
            value: value.to_string(),
        });
    }
    Ok(value)
}

/// Render a resolved profile as an equivalent `ssh` invocation.
pub fn render(chain: &ResolvedChain, hosts: &dyn HostStore) -> Result<String, RenderError> {
    if !chain.has_hops() {
        return Err(RenderError::NoHops);
    }
    let connection = chain.materialize(hosts)?;
    render_command(&connection, &chain.directives)
}

pub fn render_command(
    chain: &ConnectionChain,
    directives: &[ForwardDirective],
) -> Result<String, RenderError> {
    let target = chain.target().ok_or(RenderError::NoHops)?;
    let mut parts = vec!["ssh".to_string(), "-N".to_string()];

    if !chain.jumps().is_empty() {
        let jumps = chain
            .jumps()
            .iter()
            .map(jump_spec)
            .collect::<Result<Vec<_>, _>>()?;
        parts.push("-J".to_string());
        parts.push(jumps.join(","));
    }

    for directive in directives {
        let (flag, spec) = forward_flag(directive)?;
        parts.push(flag.to_string());
        parts.push(spec);
    }

    parts.push("-p".to_string());
    parts.push(target.port.to_string());
    let user = sanitize("user", &target.user)?;
    let host = sanitize("hostname", &target.hostname)?;
    parts.push(format!("{user}@{host}"));

    Ok(parts.join(" "))
}

fn bracket(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

fn jump_spec(hop: &Hop) -> Result<String, RenderError> {
    let user = sanitize("user", &hop.user)?;
    let host = sanitize("hostname", &hop.hostname)?;
    Ok(format!("{user}@{}:{}", bracket(host), hop.port))
}

fn port(directive: &ForwardDirective, value: u32) -> Result<u32, RenderError> {
    if (1..=65535).contains(&value) {
        Ok(value)
    } else {
        Err(RenderError::InvalidPort {
            directive: directive.to_string(),
            value,
        })
    }
}

fn bind_prefix(bind: &Option<String>) -> Result<String, RenderError> {
    match bind.as_deref() {
        None => Ok(String::new()),
        Some("*") => Ok("0.0.0.0:".to_string()),
        Some(addr) => Ok(format!("{}:", bracket(sanitize("bind address", addr)?))),
    }
}

fn forward_flag(directive: &ForwardDirective) -> Result<(&'static str, String), RenderError> {
    match directive {
        ForwardDirective::Local(f) => {
            let host = sanitize("remote host", &f.remote_host)?;
            Ok((
                "-L",
                format!(
                    "{}{}:{}:{}",
                    bind_prefix(&f.bind_address)?,
                    port(directive, f.local_port)?,
                    bracket(host),
                    port(directive, f.remote_port)?
                ),
            ))
        }
        ForwardDirective::Remote(f) => {
            let host = sanitize("target host", &f.target_host)?;
            Ok((
                "-R",
                format!(
                    "{}{}:{}:{}",
                    bind_prefix(&f.bind_address)?,
                    port(directive, f.remote_port)?,
                    bracket(host),
                    port(directive, f.local_port)?
                ),
            ))
        }
        ForwardDirective::Dynamic(f) => Ok((
            "-D",
            format!(
                "{}{}",
                bind_prefix(&f.bind_address)?,
                port(directive, f.local_port)?
            ),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{NodeId, NodeType, TunnelNode, TunnelProfile};
    use crate::hosts::{HostCatalog, HostRecord};
    use crate::resolve::resolve;
    use crate::tunnel::{DynamicForward, RemoteForward};
    use pretty_assertions::assert_eq;

    fn three_hop_profile() -> TunnelProfile {
        TunnelProfile::new("p", "db via bastions")
            .node(TunnelNode::new("local", NodeType::LocalMachine))
            .node(TunnelNode::new("a", NodeType::SshHost).with_host_id("bastion"))
            .node(TunnelNode::new("b", NodeType::SshHost).with_host_id("inner"))
            .node(TunnelNode::new("c", NodeType::SshHost).with_host_id("app"))
            .node(
                TunnelNode::new("fwd", NodeType::LocalPort)
                    .with_local_port(8080)
                    .with_remote_port(80)
                    .with_remote_host("db.internal"),
            )
            .edge("local", "a")
            .edge("a", "b")
            .edge("b", "c")
            .edge("c", "fwd")
    }

    fn hosts() -> HostCatalog {
        HostCatalog::new(vec![
            HostRecord::new("bastion", "bastion.example.com", "ops"),
            HostRecord::new("inner", "10.0.0.2", "ops").with_port(2222),
            HostRecord::new("app", "app.internal", "deploy"),
        ])
    }

    #[test]
    fn renders_three_hop_chain() {
        let chain = resolve(&three_hop_profile(), &NodeId::new("local"));
        let cmd = render(&chain, &hosts()).unwrap();
        assert_eq!(
            cmd,
            "ssh -N -J ops@bastion.example.com:22,ops@10.0.0.2:2222 -L 8080:db.internal:80 -p 22 deploy@app.internal"
        );
        let jump = cmd.split(" -J ").nth(1).unwrap().split(' ').next().unwrap();
        assert_eq!(jump.split(',').count(), 2);
        assert!(!jump.contains("app.internal"));
    }

    #[test]
    fn single_hop_has_no_jump_clause() {
        let chain = ConnectionChain::new(vec![Hop::from_record(&HostRecord::new("h", "h.example", "me"))]);
        let directives = vec![
            ForwardDirective::Dynamic(DynamicForward {
                bind_address: Some("*".into()),
                local_port: 1080,
            }),
            ForwardDirective::Remote(RemoteForward {
                bind_address: None,
                remote_port: 9000,
                target_host: "::1".into(),
                local_port: 3000,
            }),
        ];
        assert_eq!(
            render_command(&chain, &directives).unwrap(),
            "ssh -N -D 0.0.0.0:1080 -R 9000:[::1]:3000 -p 22 me@h.example"
        );
    }

    #[test]
    fn rejects_shell_metacharacters() {
        for bad in ["evil;rm", "`id`", "$HOME", "a b", ""] {
            assert!(
                matches!(sanitize("user", bad), Err(RenderError::UnsafeIdentifier { .. })),
                "{bad:?} accepted"
            );
        }
        assert_eq!(sanitize("hostname", "[fe80::1]"), Ok("[fe80::1]"));
    }

    #[test]
    fn unsafe_user_fails_render() {
        let catalog = HostCatalog::new(vec![
            HostRecord::new("bastion", "bastion.example.com", "ops;reboot"),
            HostRecord::new("inner", "10.0.0.2", "ops"),
            HostRecord::new("app", "app.internal", "deploy"),
        ]);
        let chain = resolve(&three_hop_profile(), &NodeId::new("local"));
        assert_eq!(
            render(&chain, &catalog),
            Err(RenderError::UnsafeIdentifier {
                field: "user",
                value: "ops;reboot".into()
            })
        );
    }

    #[test]
    fn no_hops_is_an_error() {
        let profile = TunnelProfile::new("p", "")
            .node(TunnelNode::new("local", NodeType::LocalMachine))
            .node(TunnelNode::new("d", NodeType::DynamicProxy).with_local_port(1080))
            .edge("local", "d");
        let chain = resolve(&profile, &NodeId::new("local"));
        assert_eq!(render(&chain, &hosts()), Err(RenderError::NoHops));
    }
}
