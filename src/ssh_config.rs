use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::hosts::{DEFAULT_SSH_PORT, HostCatalog, HostRecord};
use crate::tunnel::{DynamicForward, ForwardDirective, LocalForward, RemoteForward};

/// Default OpenSSH client config, `~/.ssh/config`.
pub fn default_config_path() -> Result<PathBuf> {
    Ok(ssh_dir()?.join("config"))
}

fn ssh_dir() -> Result<PathBuf> {
    Ok(dirs::home_dir()
        .context("cannot determine home directory")?
        .join(".ssh"))
}

/// Parse an ssh config file (and included files) into a host catalog.
/// Hosts without a `User` get `default_user`.
pub fn load_hosts(path: &Path, default_user: &str) -> Result<HostCatalog> {
    if !path.exists() {
        anyhow::bail!(
            "{} not found. If you are using a custom SSH config path, set it in ~/.warren/config.toml under ssh_config.",
            path.display()
        );
    }
    let base = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let mut hosts = Vec::new();
    parse_file(path, &base, default_user, &mut hosts)?;
    Ok(HostCatalog::new(hosts))
}

/// Hosts currently being filled in by a `Host` line with several aliases.
#[derive(Default)]
struct Pending {
    aliases: Vec<String>,
    hostname: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    identity_file: Option<PathBuf>,
    proxy_jump: Option<String>,
    forwards: Vec<ForwardDirective>,
}

impl Pending {
    fn flush(&mut self, default_user: &str, hosts: &mut Vec<HostRecord>) {
        let pending = std::mem::take(self);
        for alias in pending.aliases {
            hosts.push(HostRecord {
                hostname: pending.hostname.clone().unwrap_or_else(|| alias.clone()),
                port: pending.port.unwrap_or(DEFAULT_SSH_PORT),
                user: pending
                    .user
                    .clone()
                    .unwrap_or_else(|| default_user.to_string()),
                identity_file: pending.identity_file.clone(),
                proxy_jump: pending.proxy_jump.clone(),
                forwards: pending.forwards.clone(),
                id: alias,
            });
        }
    }

    fn active(&self) -> bool {
        !self.aliases.is_empty()
    }
}

fn parse_file(path: &Path, ssh_dir: &Path, default_user: &str, hosts: &mut Vec<HostRecord>) -> Result<()> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    let mut current = Pending::default();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = match split_directive(line) {
            Some(pair) => pair,
            None => continue,
        };

        match key.to_lowercase().as_str() {
            "include" => {
                current.flush(default_user, hosts);
                process_include(value, ssh_dir, default_user, hosts)?;
            }
            "host" => {
                current.flush(default_user, hosts);
                // Wildcard patterns are defaults, not hosts.
                current.aliases = value
                    .split_whitespace()
                    .filter(|name| !name.contains('*') && !name.contains('?') && !name.starts_with('!'))
                    .map(str::to_string)
                    .collect();
            }
            "match" => current.flush(default_user, hosts),
            _ if !current.active() => {}
            "hostname" => current.hostname = Some(value.to_string()),
            "port" => current.port = value.parse().ok(),
            "user" => current.user = Some(value.to_string()),
            "identityfile" => {
                // OpenSSH uses the first IdentityFile it sees.
                if current.identity_file.is_none() {
                    current.identity_file = Some(expand_tilde(unquote(value))?);
                }
            }
            "proxyjump" => {
                if current.proxy_jump.is_none() {
                    current.proxy_jump = Some(value.to_string());
                }
            }
            "localforward" => {
                if let Some(fwd) = parse_local_forward(value) {
                    current.forwards.push(ForwardDirective::Local(fwd));
                }
            }
            "remoteforward" => {
                if let Some(fwd) = parse_remote_forward(value) {
                    current.forwards.push(ForwardDirective::Remote(fwd));
                }
            }
            "dynamicforward" => {
                if let Some(fwd) = parse_dynamic_forward(value) {
                    current.forwards.push(ForwardDirective::Dynamic(fwd));
                }
            }
            _ => {}
        }
    }

    current.flush(default_user, hosts);
    Ok(())
}

fn split_directive(line: &str) -> Option<(&str, &str)> {
    // SSH config directives can use whitespace or '=' as separator
    let line = line.trim();
    let mut parts = line.splitn(2, |c: char| c.is_whitespace() || c == '=');
    let key = parts.next()?.trim();
    let value = parts
        .next()?
        .trim_start_matches(|c: char| c.is_whitespace() || c == '=')
        .trim();
    if key.is_empty() || value.is_empty() {
        return None;
    }
    Some((key, value))
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

fn expand_tilde(path: &str) -> Result<PathBuf> {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = dirs::home_dir().context("cannot determine home directory")?;
        Ok(home.join(rest))
    } else {
        Ok(PathBuf::from(path))
    }
}

fn process_include(pattern: &str, ssh_dir: &Path, default_user: &str, hosts: &mut Vec<HostRecord>) -> Result<()> {
    for pattern in pattern.split_whitespace() {
        let expanded = if pattern.starts_with('~') {
            expand_tilde(pattern)?
        } else if pattern.starts_with('/') {
            PathBuf::from(pattern)
        } else {
            ssh_dir.join(pattern)
        };

        let pattern_str = expanded.to_string_lossy().to_string();
        let entries = match glob::glob(&pattern_str) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(pattern = %pattern_str, error = %e, "ignoring malformed Include pattern");
                continue;
            }
        };
        for path in entries.flatten() {
            if path.is_file() {
                parse_file(&path, ssh_dir, default_user, hosts)?;
            }
        }
    }
    Ok(())
}

/// Split `[bind:]port` into its parts. Bracketed IPv6 binds are accepted.
fn split_bind_port(value: &str) -> Option<(Option<String>, u32)> {
    match value.rfind(':') {
        Some(pos) => {
            let bind = value[..pos].trim_start_matches('[').trim_end_matches(']');
            let port = value[pos + 1..].parse().ok()?;
            let bind = if bind.is_empty() { None } else { Some(bind.to_string()) };
            Some((bind, port))
        }
        None => Some((None, value.parse().ok()?)),
    }
}

/// Split `host:port`, stripping IPv6 brackets from the host.
fn split_host_port(value: &str) -> Option<(String, u32)> {
    let colon_pos = value.rfind(':')?;
    let host = value[..colon_pos].trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    let port = value[colon_pos + 1..].parse().ok()?;
    Some((host.to_string(), port))
}

/// Parse a LocalForward value like "16443 localhost:6443" or "127.0.0.1:8080 10.0.0.1:80"
fn parse_local_forward(value: &str) -> Option<LocalForward> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    if parts.len() != 2 {
        return None;
    }
    let (bind_address, local_port) = split_bind_port(parts[0])?;
    let (remote_host, remote_port) = split_host_port(parts[1])?;
    Some(LocalForward {
        bind_address,
        local_port,
        remote_host,
        remote_port,
    })
}

/// Parse a RemoteForward value like "9090 localhost:3000"
fn parse_remote_forward(value: &str) -> Option<RemoteForward> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    if parts.len() != 2 {
        return None;
    }
    let (bind_address, remote_port) = split_bind_port(parts[0])?;
    let (target_host, local_port) = split_host_port(parts[1])?;
    Some(RemoteForward {
        bind_address,
        remote_port,
        target_host,
        local_port,
    })
}

/// Parse a DynamicForward value like "1080" or "127.0.0.1:1080"
fn parse_dynamic_forward(value: &str) -> Option<DynamicForward> {
    let (bind_address, local_port) = split_bind_port(value.trim())?;
    Some(DynamicForward {
        bind_address,
        local_port,
    })
}
