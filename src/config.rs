use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::connector::ConnectorSettings;
use crate::forward::ForwardSettings;
use crate::service::ServiceSettings;
use crate::transport::libssh2::TransportSettings;

fn warren_dir() -> Result<PathBuf> {
    let dir = dirs::home_dir()
        .context("cannot determine home directory")?
        .join(".warren");
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn config_path() -> Result<PathBuf> {
    Ok(warren_dir()?.join("config.toml"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Shell for completions (bash, zsh, fish)
    pub shell: Option<String>,
    /// Editor for `warren config` (overrides $VISUAL/$EDITOR)
    pub editor: Option<String>,
    /// SSH config used as the host store (defaults to ~/.ssh/config)
    pub ssh_config: Option<String>,
    /// Directory of profile files (defaults to ~/.warren/profiles)
    pub profiles_dir: Option<String>,
    /// known_hosts file checked and updated on connect (defaults to ~/.ssh/known_hosts)
    pub known_hosts: Option<String>,
    /// Per-hop connect and handshake timeout in seconds
    pub connect_timeout: u64,
    /// SSH keepalive interval in seconds, 0 disables
    pub keepalive_interval: u64,
    /// Seconds to wait for a tunnel to tear down before detaching it
    pub stop_grace_period: u64,
    /// Health check timeout in seconds
    pub health_timeout: u64,
    /// Longest expanded ProxyJump chain
    pub max_jump_depth: usize,
    /// Largest profile graph accepted
    pub max_graph_nodes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shell: None,
            editor: None,
            ssh_config: None,
            profiles_dir: None,
            known_hosts: None,
            connect_timeout: 15,
            keepalive_interval: 30,
            stop_grace_period: 30,
            health_timeout: 5,
            max_jump_depth: crate::jump::DEFAULT_MAX_JUMP_DEPTH,
            max_graph_nodes: crate::validate::DEFAULT_MAX_NODES,
        }
    }
}

impl Config {
    /// Load config from ~/.warren/config.toml, falling back to defaults.
    pub fn load() -> Self {
        match config_path() {
            Ok(path) => Self::load_from(&path),
            Err(_) => Self::default(),
        }
    }

    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "ignoring invalid config");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Resolve which editor to use: config > $VISUAL > $EDITOR > vi
    pub fn resolve_editor(&self) -> String {
        if let Some(ref e) = self.editor {
            return e.clone();
        }
        std::env::var("VISUAL")
            .or_else(|_| std::env::var("EDITOR"))
            .unwrap_or_else(|_| "vi".to_string())
    }

    /// Write a default config file if none exists. Returns the path.
    pub fn init() -> Result<PathBuf> {
        let path = config_path()?;
        Self::init_at(&path)?;
        Ok(path)
    }

    fn init_at(path: &Path) -> Result<()> {
        if path.exists() {
            return Ok(());
        }
        let content = toml::to_string_pretty(&Self::default())
            .context("failed to serialize default config")?;
        fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))
    }

    pub fn ssh_config_path(&self) -> Result<PathBuf> {
        match self.ssh_config {
            Some(ref p) => expand_home(p),
            None => crate::ssh_config::default_config_path(),
        }
    }

    pub fn profiles_dir(&self) -> Result<PathBuf> {
        match self.profiles_dir {
            Some(ref p) => expand_home(p),
            None => crate::profiles::default_profiles_dir().context("cannot determine home directory"),
        }
    }

    pub fn known_hosts_path(&self) -> Option<PathBuf> {
        match self.known_hosts {
            Some(ref p) => expand_home(p).ok(),
            None => TransportSettings::default().known_hosts,
        }
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout)
    }

    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            connect_timeout: Duration::from_secs(self.connect_timeout.max(1)),
            keepalive_interval: Duration::from_secs(self.keepalive_interval),
            known_hosts: self.known_hosts_path(),
        }
    }

    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            connector: ConnectorSettings::default(),
            forwarding: ForwardSettings::default(),
            max_nodes: self.max_graph_nodes,
            max_jump_depth: self.max_jump_depth,
            stop_grace: Duration::from_secs(self.stop_grace_period),
        }
    }
}

fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => Ok(dirs::home_dir()
            .context("cannot determine home directory")?
            .join(rest)),
        None => Ok(PathBuf::from(path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "connect_timeout = 3\nprofiles_dir = \"/srv/warren\"\n").unwrap();

        let cfg = Config::load_from(&path);
        assert_eq!(cfg.connect_timeout, 3);
        assert_eq!(cfg.stop_grace_period, 30);
        assert_eq!(cfg.profiles_dir().unwrap(), PathBuf::from("/srv/warren"));
    }

    #[test]
    fn invalid_or_missing_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        assert_eq!(Config::load_from(&path), Config::default());
        fs::write(&path, "connect_timeout = \"soon\"").unwrap();
        assert_eq!(Config::load_from(&path), Config::default());
    }

    #[test]
    fn init_writes_loadable_defaults_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        Config::init_at(&path).unwrap();
        assert_eq!(Config::load_from(&path), Config::default());

        fs::write(&path, "health_timeout = 9\n").unwrap();
        Config::init_at(&path).unwrap();
        assert_eq!(Config::load_from(&path).health_timeout, 9);
    }

    #[test]
    fn settings_follow_config() {
        let cfg = Config {
            connect_timeout: 0,
            keepalive_interval: 0,
            stop_grace_period: 2,
            max_graph_nodes: 8,
            known_hosts: Some("/tmp/kh".into()),
            ..Config::default()
        };
        let transport = cfg.transport_settings();
        assert_eq!(transport.connect_timeout, Duration::from_secs(1));
        assert_eq!(transport.keepalive_interval, Duration::ZERO);
        assert_eq!(transport.known_hosts, Some(PathBuf::from("/tmp/kh")));

        let service = cfg.service_settings();
        assert_eq!(service.max_nodes, 8);
        assert_eq!(service.stop_grace, Duration::from_secs(2));
    }
}
