use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::connector::{ChainConnector, ConnectorSettings};
use crate::forward::{ForwardSettings, ForwardingManager};
use crate::graph::TunnelProfile;
use crate::hosts::HostStore;
use crate::jump::{DEFAULT_MAX_JUMP_DEPTH, JumpResolver};
use crate::registry::{ActiveTunnel, DEFAULT_STOP_GRACE, StopOutcome, TunnelRegistry, TunnelStatus};
use crate::resolve::{ConnectionChain, resolve};
use crate::transport::{HostKeyVerifier, InteractiveAuth, SshTransport};
use crate::tunnel::ForwardDirective;
use crate::validate::{DEFAULT_MAX_NODES, Validator};

/// Registry key for a tunnel started from a host rather than a profile.
pub fn host_key(host_id: &str) -> String {
    format!("host:{host_id}")
}

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub connector: ConnectorSettings,
    pub forwarding: ForwardSettings,
    pub max_nodes: usize,
    pub max_jump_depth: usize,
    pub stop_grace: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            connector: ConnectorSettings::default(),
            forwarding: ForwardSettings::default(),
            max_nodes: DEFAULT_MAX_NODES,
            max_jump_depth: DEFAULT_MAX_JUMP_DEPTH,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecuteResult {
    pub success: bool,
    pub session_id: Option<Uuid>,
    /// Why it failed, or which forwards failed when none started.
    pub error: Option<String>,
    pub warnings: Vec<String>,
}

impl ExecuteResult {
    fn failed(error: impl Into<String>, warnings: Vec<String>) -> Self {
        Self {
            success: false,
            session_id: None,
            error: Some(error.into()),
            warnings,
        }
    }
}

pub struct TunnelService {
    connector: ChainConnector,
    forwarding: ForwardingManager,
    validator: Validator,
    hosts: Arc<dyn HostStore>,
    registry: TunnelRegistry,
    verifier: Arc<dyn HostKeyVerifier>,
    auth: Arc<dyn InteractiveAuth>,
    max_jump_depth: usize,
    stop_grace: Duration,
}

impl TunnelService {
    pub fn new(
        transport: Arc<dyn SshTransport>,
        hosts: Arc<dyn HostStore>,
        verifier: Arc<dyn HostKeyVerifier>,
        auth: Arc<dyn InteractiveAuth>,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            connector: ChainConnector::new(transport, settings.connector),
            forwarding: ForwardingManager::new(settings.forwarding),
            validator: Validator::new(settings.max_nodes),
            hosts,
            registry: TunnelRegistry::new(),
            verifier,
            auth,
            max_jump_depth: settings.max_jump_depth,
            stop_grace: settings.stop_grace,
        }
    }

    pub fn registry(&self) -> &TunnelRegistry {
        &self.registry
    }

    /// Validate, resolve, connect and start forwards for `profile`.
    pub fn execute(&self, profile: &TunnelProfile, cancel: &CancellationToken) -> ExecuteResult {
        if self.registry.is_active(&profile.id) {
            return ExecuteResult::failed(format!("{} is already active", profile.name()), Vec::new());
        }

        let report = self.validator.validate(profile);
        let warnings: Vec<String> = report.warnings.iter().map(|w| w.to_string()).collect();
        if !report.is_valid() {
            let errors: Vec<String> = report.errors.iter().map(|e| e.to_string()).collect();
            return ExecuteResult::failed(errors.join("; "), warnings);
        }
        let Some(root) = profile.root() else {
            return ExecuteResult::failed("profile has no local machine node", warnings);
        };

        let resolved = resolve(profile, &root.id);
        if !resolved.has_hops() {
            return ExecuteResult::failed("profile has no SSH hosts to connect", warnings);
        }
        let chain = match resolved.materialize(self.hosts.as_ref()) {
            Ok(chain) => chain,
            Err(e) => return ExecuteResult::failed(e.to_string(), warnings),
        };

        self.launch(&profile.id, profile.name(), &chain, &resolved.directives, warnings, cancel)
    }

    /// Connect to a host through its ProxyJump chain and start its configured forwards.
    pub fn execute_host(&self, host_id: &str, cancel: &CancellationToken) -> ExecuteResult {
        let key = host_key(host_id);
        if self.registry.is_active(&key) {
            return ExecuteResult::failed(format!("{host_id} is already active"), Vec::new());
        }
        let resolver = JumpResolver::new(self.hosts.as_ref(), self.max_jump_depth);
        let (chain, directives) = match resolver
            .resolve(host_id)
            .and_then(|chain| Ok((chain, resolver.forwards_for(host_id)?)))
        {
            Ok(resolved) => resolved,
            Err(e) => return ExecuteResult::failed(e.to_string(), Vec::new()),
        };
        self.launch(&key, host_id, &chain, &directives, Vec::new(), cancel)
    }

    fn launch(
        &self,
        id: &str,
        display_name: &str,
        chain: &ConnectionChain,
        directives: &[ForwardDirective],
        mut warnings: Vec<String>,
        cancel: &CancellationToken,
    ) -> ExecuteResult {
        let mut connection =
            match self
                .connector
                .connect(chain, self.verifier.as_ref(), self.auth.as_ref(), cancel)
            {
                Ok(connection) => connection,
                Err(e) => return ExecuteResult::failed(e.to_string(), warnings),
            };

        let Some(client) = connection.client() else {
            return ExecuteResult::failed("connection closed before forwarding", warnings);
        };
        let outcome = match self.forwarding.start_all(client, directives, cancel) {
            Ok(outcome) => outcome,
            Err(e) => {
                connection.shutdown();
                return ExecuteResult::failed(e.to_string(), warnings);
            }
        };

        let error = if outcome.all_failed() {
            outcome.failure_summary()
        } else {
            warnings.extend(outcome.failures.iter().map(|f| f.to_string()));
            None
        };

        let tunnel = ActiveTunnel::new(id, display_name, connection, outcome.handles);
        let session_id = tunnel.session_id;
        match self.registry.try_add(tunnel) {
            Ok(()) => {
                info!(profile_id = id, %session_id, "tunnel active");
                ExecuteResult {
                    success: true,
                    session_id: Some(session_id),
                    error,
                    warnings,
                }
            }
            Err(tunnel) => {
                warn!(profile_id = id, "lost start race, tearing down duplicate");
                tunnel.teardown();
                ExecuteResult::failed(format!("{display_name} is already active"), warnings)
            }
        }
    }

    pub fn stop(&self, id: &str, cancel: &CancellationToken) -> StopOutcome {
        self.registry.stop(id, self.stop_grace, cancel)
    }

    pub fn stop_all(&self, cancel: &CancellationToken) -> Vec<(String, StopOutcome)> {
        self.registry.stop_all(self.stop_grace, cancel)
    }

    pub fn status(&self) -> BTreeMap<String, TunnelStatus> {
        self.registry.snapshot()
    }
}
