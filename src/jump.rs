//! ProxyJump expansion for hosts used directly, without a profile graph.

use thiserror::Error;

use crate::hosts::{DEFAULT_SSH_PORT, HostRecord, HostStore};
use crate::resolve::{ConnectionChain, Hop};
use crate::tunnel::ForwardDirective;

pub const DEFAULT_MAX_JUMP_DEPTH: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JumpError {
    #[error("unknown host '{0}'")]
    UnknownHost(String),
    #[error("jump cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },
    #[error("jump chain is {depth} hops deep, limit is {limit}")]
    TooDeep { depth: usize, limit: usize },
    #[error("invalid jump reference '{0}'")]
    InvalidReference(String),
}

/// One `[user@]host[:port]` entry of a ProxyJump list.
#[derive(Debug, Clone, PartialEq, Eq)]
struct JumpRef {
    user: Option<String>,
    host: String,
    port: Option<u16>,
}

impl JumpRef {
    fn parse(raw: &str) -> Result<Self, JumpError> {
        let raw = raw.trim();
        let invalid = || JumpError::InvalidReference(raw.to_string());
        let body = raw.strip_prefix("ssh://").unwrap_or(raw);

        let (user, rest) = match body.rsplit_once('@') {
            Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
            Some(_) => return Err(invalid()),
            None => (None, body),
        };

        let (host, port) = if let Some(inner) = rest.strip_prefix('[') {
            let (host, tail) = inner.split_once(']').ok_or_else(invalid)?;
            match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if tail.is_empty() => (host, None),
                None => return Err(invalid()),
            }
        } else if rest.matches(':').count() == 1 {
            let (host, port) = rest.split_once(':').ok_or_else(invalid)?;
            (host, Some(port))
        } else {
            (rest, None)
        };

        if host.is_empty() || host.chars().any(char::is_whitespace) {
            return Err(invalid());
        }
        let port = match port {
            Some(p) => Some(p.parse::<u16>().ok().filter(|p| *p != 0).ok_or_else(invalid)?),
            None => None,
        };
        Ok(Self {
            user,
            host: host.to_string(),
            port,
        })
    }
}

pub struct JumpResolver<'a> {
    hosts: &'a dyn HostStore,
    max_depth: usize,
}

impl<'a> JumpResolver<'a> {
    pub fn new(hosts: &'a dyn HostStore, max_depth: usize) -> Self {
        Self { hosts, max_depth }
    }

    /// Expand `host_id`'s jump hosts (nested first) followed by the host itself.
    pub fn resolve(&self, host_id: &str) -> Result<ConnectionChain, JumpError> {
        let target = self
            .hosts
            .get_by_id(host_id)
            .ok_or_else(|| JumpError::UnknownHost(host_id.to_string()))?;
        let mut hops = Vec::new();
        let mut stack = vec![target.id.clone()];
        self.expand(&target, &mut stack, &mut hops)?;
        hops.push(Hop::from_record(&target));
        self.check_depth(hops.len())?;
        Ok(ConnectionChain::new(hops))
    }

    /// The directives declared on the host itself.
    pub fn forwards_for(&self, host_id: &str) -> Result<Vec<ForwardDirective>, JumpError> {
        self.hosts
            .get_by_id(host_id)
            .map(|h| h.forwards)
            .ok_or_else(|| JumpError::UnknownHost(host_id.to_string()))
    }

    fn check_depth(&self, depth: usize) -> Result<(), JumpError> {
        if depth > self.max_depth {
            return Err(JumpError::TooDeep {
                depth,
                limit: self.max_depth,
            });
        }
        Ok(())
    }

    fn expand(
        &self,
        record: &HostRecord,
        stack: &mut Vec<String>,
        hops: &mut Vec<Hop>,
    ) -> Result<(), JumpError> {
        let Some(jumps) = record.proxy_jump.as_deref().map(str::trim) else {
            return Ok(());
        };
        if jumps.is_empty() || jumps.eq_ignore_ascii_case("none") {
            return Ok(());
        }

        for raw in jumps.split(',') {
            let reference = JumpRef::parse(raw)?;
            match self.hosts.get_by_id(&reference.host) {
                Some(jump) => {
                    if stack.contains(&jump.id) {
                        let mut path = stack.clone();
                        path.push(jump.id.clone());
                        return Err(JumpError::Cycle { path });
                    }
                    self.check_depth(stack.len() + 1)?;
                    stack.push(jump.id.clone());
                    self.expand(&jump, stack, hops)?;
                    stack.pop();

                    let mut hop = Hop::from_record(&jump);
                    if let Some(user) = reference.user {
                        hop.user = user;
                    }
                    if let Some(port) = reference.port {
                        hop.port = port;
                    }
                    hops.push(hop);
                }
                None => hops.push(Hop {
                    host_id: None,
                    hostname: reference.host,
                    port: reference.port.unwrap_or(DEFAULT_SSH_PORT),
                    user: reference.user.unwrap_or_else(|| record.user.clone()),
                    identity_file: None,
                }),
            }
            self.check_depth(hops.len() + 1)?;
        }
        Ok(())
    }
}
