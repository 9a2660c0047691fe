use std::net::{Ipv4Addr, SocketAddr};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::health::probe_ephemeral_port;
use crate::keys::KeyMaterial;
use crate::resolve::{ConnectionChain, Hop};
use crate::transport::{
    ConnectRequest, ForwardListener, HostKeyVerifier, InteractiveAuth, SshClient, SshTransport,
    TransportError,
};

pub const DEFAULT_MAX_HOPS: usize = 16;

#[derive(Debug, Clone)]
pub struct ConnectorSettings {
    /// Address the inter-hop forwards listen on.
    pub ephemeral_bind: Ipv4Addr,
    pub max_hops: usize,
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self {
            ephemeral_bind: Ipv4Addr::LOCALHOST,
            max_hops: DEFAULT_MAX_HOPS,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connection chain is empty")]
    EmptyChain,
    #[error("chain has {len} hops, limit is {limit}")]
    TooManyHops { len: usize, limit: usize },
    #[error("cancelled")]
    Cancelled,
    #[error("cannot allocate a local port")]
    PortProbe(#[source] std::io::Error),
    #[error("cannot forward to the next hop")]
    Forward(#[source] TransportError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A chain failed at `hop_index`; everything built before it has been torn down.
#[derive(Debug, Error)]
#[error("hop {hop_index} ({host}): {cause}")]
pub struct ConnectionError {
    pub hop_index: usize,
    pub host: String,
    pub cause: ConnectError,
}

impl ConnectionError {
    fn at(hop_index: usize, hop: &Hop, cause: ConnectError) -> Self {
        Self {
            hop_index,
            host: hop.label().to_string(),
            cause,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.cause, ConnectError::Cancelled)
    }
}

/// A cleanup step that failed. Logged and collected, never raised.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{resource}: {message}")]
pub struct TeardownError {
    pub resource: String,
    pub message: String,
}

/// Run one cleanup step, catching both errors and panics.
pub(crate) fn guarded<F>(errors: &mut Vec<TeardownError>, resource: String, step: F)
where
    F: FnOnce() -> Result<(), TransportError>,
{
    let message = match catch_unwind(AssertUnwindSafe(step)) {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e.to_string(),
        Err(panic) => panic
            .downcast_ref::<String>()
            .cloned()
            .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
            .unwrap_or_else(|| "panicked".to_string()),
    };
    warn!(%resource, error = %message, "teardown step failed");
    errors.push(TeardownError { resource, message });
}

/// Everything one chain owns.
#[derive(Default)]
struct ChainResources {
    target: Option<Box<dyn SshClient>>,
    forwards: Vec<Box<dyn ForwardListener>>,
    intermediates: Vec<Box<dyn SshClient>>,
    keys: Vec<KeyMaterial>,
}

impl ChainResources {
    /// Target client, then forwards and intermediates newest first, then keys.
    fn teardown(&mut self) -> Vec<TeardownError> {
        let mut errors = Vec::new();

        if let Some(mut target) = self.target.take() {
            let resource = format!("client {}", target.label());
            guarded(&mut errors, resource, move || {
                let result = target.disconnect();
                drop(target);
                result
            });
        }
        while let Some(mut forward) = self.forwards.pop() {
            let resource = format!("forward :{}", forward.bound_port());
            guarded(&mut errors, resource, move || {
                let result = forward.stop();
                drop(forward);
                result
            });
        }
        while let Some(mut client) = self.intermediates.pop() {
            let resource = format!("client {}", client.label());
            guarded(&mut errors, resource, move || {
                let result = client.disconnect();
                drop(client);
                result
            });
        }
        self.keys.clear();

        errors
    }
}

/// The chain as one connection to the final hop.
pub struct LogicalConnection {
    resources: ChainResources,
    path: Vec<String>,
    closed: bool,
}

impl LogicalConnection {
    /// The final-hop client, until shutdown.
    pub fn client(&mut self) -> Option<&mut (dyn SshClient + 'static)> {
        self.resources.target.as_deref_mut()
    }

    pub fn hop_count(&self) -> usize {
        self.path.len()
    }

    /// Hop labels, first to last.
    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// Tear the chain down. Only the first call does anything.
    pub fn shutdown(&mut self) -> Vec<TeardownError> {
        if self.closed {
            return Vec::new();
        }
        self.closed = true;
        let errors = self.resources.teardown();
        debug!(path = ?self.path, failures = errors.len(), "chain closed");
        errors
    }
}

impl Drop for LogicalConnection {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Connects hop by hop, each hop reached through a loopback forward on the one before.
pub struct ChainConnector {
    transport: Arc<dyn SshTransport>,
    settings: ConnectorSettings,
}

impl ChainConnector {
    pub fn new(transport: Arc<dyn SshTransport>, settings: ConnectorSettings) -> Self {
        Self {
            transport,
            settings,
        }
    }

    pub fn connect(
        &self,
        chain: &ConnectionChain,
        verifier: &dyn HostKeyVerifier,
        auth: &dyn InteractiveAuth,
        cancel: &CancellationToken,
    ) -> Result<LogicalConnection, ConnectionError> {
        let hops = chain.hops();
        let Some(first) = hops.first() else {
            return Err(ConnectionError {
                hop_index: 0,
                host: String::new(),
                cause: ConnectError::EmptyChain,
            });
        };
        if hops.len() > self.settings.max_hops {
            return Err(ConnectionError::at(
                0,
                first,
                ConnectError::TooManyHops {
                    len: hops.len(),
                    limit: self.settings.max_hops,
                },
            ));
        }

        let mut resources = ChainResources::default();
        match self.establish(hops, verifier, auth, cancel, &mut resources) {
            Ok(()) => {
                info!(path = ?chain.labels(), "chain established");
                Ok(LogicalConnection {
                    resources,
                    path: chain.labels(),
                    closed: false,
                })
            }
            Err(e) => {
                warn!(hop_index = e.hop_index, host = %e.host, error = %e.cause, "chain failed, rolling back");
                resources.teardown();
                Err(e)
            }
        }
    }

    fn establish(
        &self,
        hops: &[Hop],
        verifier: &dyn HostKeyVerifier,
        auth: &dyn InteractiveAuth,
        cancel: &CancellationToken,
        resources: &mut ChainResources,
    ) -> Result<(), ConnectionError> {
        let last = hops.len() - 1;
        let mut via: Option<SocketAddr> = None;

        for (i, hop) in hops.iter().enumerate() {
            let fail = |cause: ConnectError| ConnectionError::at(i, hop, cause);
            if cancel.is_cancelled() {
                return Err(fail(ConnectError::Cancelled));
            }

            // Like OpenSSH, an unreadable identity file is skipped; agent and
            // interactive auth still get their turn.
            let key = match &hop.identity_file {
                Some(path) => match KeyMaterial::load(path) {
                    Ok(key) => Some(key),
                    Err(e) => {
                        warn!(hop_index = i, path = %path.display(), error = %e, "skipping unreadable identity file");
                        None
                    }
                },
                None => None,
            };

            debug!(hop_index = i, hop = %hop, ?via, "connecting");
            let request = ConnectRequest {
                hop,
                via,
                key: key.as_ref(),
            };
            let client = self
                .transport
                .connect(&request, verifier, auth)
                .map_err(|e| fail(e.into()))?;
            resources.keys.extend(key);

            if i == last {
                resources.target = Some(client);
                break;
            }
            resources.intermediates.push(client);

            if cancel.is_cancelled() {
                return Err(fail(ConnectError::Cancelled));
            }
            let next = &hops[i + 1];
            let port = probe_ephemeral_port().map_err(|e| fail(ConnectError::PortProbe(e)))?;
            let bind = self.settings.ephemeral_bind.to_string();
            let Some(client) = resources.intermediates.last_mut() else {
                break;
            };
            let listener = client
                .open_local_forward(&bind, port, &next.hostname, next.port)
                .map_err(|e| fail(ConnectError::Forward(e)))?;
            let port = listener.bound_port();
            resources.forwards.push(listener);
            debug!(hop_index = i, port, next = %next, "inter-hop forward ready");

            via = Some(SocketAddr::from((self.settings.ephemeral_bind, port)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{AcceptAll, Event, MockTransport, hop};
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn chain(labels: &[&str]) -> ConnectionChain {
        ConnectionChain::new(labels.iter().map(|l| hop(l)).collect())
    }

    fn connector(mock: &MockTransport) -> ChainConnector {
        ChainConnector::new(Arc::new(mock.clone()), ConnectorSettings::default())
    }

    fn forward_ports(events: &[Event]) -> Vec<u16> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::Forward { port, .. } => Some(*port),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn single_hop_connects_directly() {
        let mock = MockTransport::new();
        let mut conn = connector(&mock)
            .connect(&chain(&["A"]), &AcceptAll, &AcceptAll, &CancellationToken::new())
            .unwrap();
        assert_eq!(conn.hop_count(), 1);
        assert_eq!(conn.client().unwrap().label(), "A");
        assert_eq!(
            mock.events(),
            vec![Event::Connect {
                hop: "A".into(),
                via: None
            }]
        );
    }

    #[test]
    fn each_hop_goes_through_previous_forward() {
        let mock = MockTransport::new();
        let conn = connector(&mock)
            .connect(&chain(&["A", "B", "C"]), &AcceptAll, &AcceptAll, &CancellationToken::new())
            .unwrap();
        assert_eq!(conn.path(), ["A", "B", "C"]);

        let events = mock.events();
        let ports = forward_ports(&events);
        assert_eq!(ports.len(), 2);
        assert_eq!(
            events,
            vec![
                Event::Connect { hop: "A".into(), via: None },
                Event::Forward { on: "A".into(), kind: 'L', bind: "127.0.0.1".into(), port: ports[0] },
                Event::Connect { hop: "B".into(), via: Some(ports[0]) },
                Event::Forward { on: "B".into(), kind: 'L', bind: "127.0.0.1".into(), port: ports[1] },
                Event::Connect { hop: "C".into(), via: Some(ports[1]) },
            ]
        );
    }

    #[test]
    fn failure_at_hop_two_rolls_back_once_in_reverse() {
        let mock = MockTransport::new().fail_connect("C");
        let err = connector(&mock)
            .connect(&chain(&["A", "B", "C"]), &AcceptAll, &AcceptAll, &CancellationToken::new())
            .err()
            .unwrap();
        assert_eq!(err.hop_index, 2);
        assert_eq!(err.host, "C");
        assert!(matches!(err.cause, ConnectError::Transport(_)));

        let events = mock.events();
        let ports = forward_ports(&events);
        assert_eq!(
            events[5..],
            [
                Event::StopForward { on: "B".into(), port: ports[1] },
                Event::StopForward { on: "A".into(), port: ports[0] },
                Event::Disconnect("B".into()),
                Event::Disconnect("A".into()),
            ]
        );
        assert_eq!(mock.count(&Event::Disconnect("A".into())), 1);
        assert_eq!(
            mock.count(&Event::StopForward { on: "A".into(), port: ports[0] }),
            1
        );
    }

    #[test]
    fn cancellation_between_hops_rolls_back() {
        let cancel = CancellationToken::new();
        let mock = MockTransport::new().cancel_after_connect("B", cancel.clone());
        let err = connector(&mock)
            .connect(&chain(&["A", "B", "C"]), &AcceptAll, &AcceptAll, &cancel)
            .err()
            .unwrap();
        assert!(err.is_cancelled());
        assert_eq!(err.hop_index, 1);
        assert_eq!(mock.count(&Event::Disconnect("A".into())), 1);
        assert_eq!(mock.count(&Event::Disconnect("B".into())), 1);
        assert!(!mock.events().iter().any(|e| matches!(e, Event::Connect { hop, .. } if hop == "C")));
    }

    #[test]
    fn cancelled_before_start_touches_nothing() {
        let mock = MockTransport::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = connector(&mock)
            .connect(&chain(&["A"]), &AcceptAll, &AcceptAll, &cancel)
            .err()
            .unwrap();
        assert_eq!(err.hop_index, 0);
        assert!(mock.events().is_empty());
    }

    #[test]
    fn empty_and_oversized_chains_are_rejected() {
        let mock = MockTransport::new();
        let err = connector(&mock)
            .connect(&ConnectionChain::default(), &AcceptAll, &AcceptAll, &CancellationToken::new())
            .err()
            .unwrap();
        assert!(matches!(err.cause, ConnectError::EmptyChain));

        let small = ChainConnector::new(
            Arc::new(mock.clone()),
            ConnectorSettings {
                max_hops: 1,
                ..ConnectorSettings::default()
            },
        );
        let err = small
            .connect(&chain(&["A", "B"]), &AcceptAll, &AcceptAll, &CancellationToken::new())
            .err()
            .unwrap();
        assert!(matches!(err.cause, ConnectError::TooManyHops { len: 2, limit: 1 }));
        assert!(mock.events().is_empty());
    }

    #[test]
    fn shutdown_continues_past_failing_and_panicking_steps() {
        let mock = MockTransport::new()
            .fail_disconnect("C")
            .panic_on_disconnect("B");
        let mut conn = connector(&mock)
            .connect(&chain(&["A", "B", "C"]), &AcceptAll, &AcceptAll, &CancellationToken::new())
            .unwrap();
        mock.clear();

        let errors = conn.shutdown();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].resource, "client C");
        assert!(errors[1].message.contains("blew up"));
        assert_eq!(mock.count(&Event::Disconnect("A".into())), 1);
        assert!(conn.client().is_none());

        assert!(conn.shutdown().is_empty());
        drop(conn);
        assert_eq!(mock.count(&Event::Disconnect("A".into())), 1);
        assert_eq!(mock.events().len(), 5);
    }

    #[test]
    fn missing_key_file_falls_back_to_other_auth() {
        let mock = MockTransport::new();
        let mut hops = vec![hop("A"), hop("B")];
        hops[1].identity_file = Some(PathBuf::from("/nonexistent/id_ed25519"));
        let mut conn = connector(&mock)
            .connect(&ConnectionChain::new(hops), &AcceptAll, &AcceptAll, &CancellationToken::new())
            .unwrap();
        assert_eq!(conn.client().unwrap().label(), "B");
        assert_eq!(
            mock.events()
                .iter()
                .filter(|e| matches!(e, Event::Connect { .. }))
                .count(),
            2
        );
    }
}
