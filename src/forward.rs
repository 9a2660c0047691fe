use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::transport::{ForwardListener, SshClient, TransportError};
use crate::tunnel::{ForwardDirective, LOOPBACK};

#[derive(Debug, Clone)]
pub struct ForwardSettings {
    /// Bind for local and dynamic forwards without one.
    pub default_bind: String,
    /// Bind requested on the far end for remote forwards without one.
    pub remote_default_bind: String,
}

impl Default for ForwardSettings {
    fn default() -> Self {
        Self {
            default_bind: LOOPBACK.to_string(),
            remote_default_bind: LOOPBACK.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ForwardingError {
    #[error("{directive}: {field} {value} is outside 1-65535")]
    PortOutOfRange {
        directive: String,
        field: &'static str,
        value: u32,
    },
    #[error("{directive}: destination host is empty")]
    EmptyHost { directive: String },
    #[error("{directive}: {source}")]
    Transport {
        directive: String,
        #[source]
        source: TransportError,
    },
    #[error("cancelled before {directive}")]
    Cancelled { directive: String },
}

/// A started forward. Dropping the handle stops it.
pub struct ForwardHandle {
    directive: ForwardDirective,
    listener: Option<Box<dyn ForwardListener>>,
}

impl ForwardHandle {
    pub fn directive(&self) -> &ForwardDirective {
        &self.directive
    }

    pub fn bound_port(&self) -> Option<u16> {
        self.listener.as_ref().map(|l| l.bound_port())
    }

    pub fn stop(mut self) -> Result<(), TransportError> {
        match self.listener.take() {
            Some(mut listener) => listener.stop(),
            None => Ok(()),
        }
    }
}

impl Drop for ForwardHandle {
    fn drop(&mut self) {
        if let Some(mut listener) = self.listener.take() {
            if let Err(e) = listener.stop() {
                warn!(directive = %self.directive, error = %e, "forward did not stop cleanly");
            }
        }
    }
}

impl std::fmt::Debug for ForwardHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardHandle")
            .field("directive", &self.directive)
            .field("bound_port", &self.bound_port())
            .finish()
    }
}

/// What [`ForwardingManager::start_all`] managed to start.
#[derive(Debug, Default)]
pub struct ForwardOutcome {
    pub handles: Vec<ForwardHandle>,
    pub failures: Vec<ForwardingError>,
}

impl ForwardOutcome {
    /// At least one directive was expected and none started.
    pub fn all_failed(&self) -> bool {
        self.handles.is_empty() && !self.failures.is_empty()
    }

    pub fn failure_summary(&self) -> Option<String> {
        if self.failures.is_empty() {
            return None;
        }
        Some(
            self.failures
                .iter()
                .map(|f| f.to_string())
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

pub struct ForwardingManager {
    settings: ForwardSettings,
}

fn checked_port(directive: &ForwardDirective, field: &'static str, value: u32) -> Result<u16, ForwardingError> {
    match u16::try_from(value) {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(ForwardingError::PortOutOfRange {
            directive: directive.to_string(),
            field,
            value,
        }),
    }
}

fn checked_host<'a>(directive: &ForwardDirective, host: &'a str) -> Result<&'a str, ForwardingError> {
    let host = host.trim();
    if host.is_empty() {
        return Err(ForwardingError::EmptyHost {
            directive: directive.to_string(),
        });
    }
    Ok(host)
}

impl ForwardingManager {
    pub fn new(settings: ForwardSettings) -> Self {
        Self { settings }
    }

    fn bind_for(bind: &Option<String>, default: &str) -> String {
        match bind.as_deref().map(str::trim) {
            None | Some("") => default.to_string(),
            Some("*") => "0.0.0.0".to_string(),
            Some(addr) => addr.trim_start_matches('[').trim_end_matches(']').to_string(),
        }
    }

    /// Start one directive on `client`. Ports are checked before the transport sees them.
    pub fn start(
        &self,
        client: &mut dyn SshClient,
        directive: &ForwardDirective,
    ) -> Result<ForwardHandle, ForwardingError> {
        let listener = match directive {
            ForwardDirective::Local(f) => {
                let local = checked_port(directive, "local port", f.local_port)?;
                let remote = checked_port(directive, "remote port", f.remote_port)?;
                let host = checked_host(directive, &f.remote_host)?;
                let bind = Self::bind_for(&f.bind_address, &self.settings.default_bind);
                client.open_local_forward(&bind, local, host, remote)
            }
            ForwardDirective::Remote(f) => {
                let remote = checked_port(directive, "remote port", f.remote_port)?;
                let local = checked_port(directive, "local port", f.local_port)?;
                let host = checked_host(directive, &f.target_host)?;
                let bind = Self::bind_for(&f.bind_address, &self.settings.remote_default_bind);
                client.open_remote_forward(&bind, remote, host, local)
            }
            ForwardDirective::Dynamic(f) => {
                let local = checked_port(directive, "local port", f.local_port)?;
                let bind = Self::bind_for(&f.bind_address, &self.settings.default_bind);
                client.open_dynamic_forward(&bind, local)
            }
        }
        .map_err(|source| ForwardingError::Transport {
            directive: directive.to_string(),
            source,
        })?;

        info!(%directive, on = client.label(), port = listener.bound_port(), "forward started");
        Ok(ForwardHandle {
            directive: directive.clone(),
            listener: Some(listener),
        })
    }

    /// Start every directive, skipping the ones that fail. Cancellation stops
    /// whatever already started and returns the error.
    pub fn start_all(
        &self,
        client: &mut dyn SshClient,
        directives: &[ForwardDirective],
        cancel: &CancellationToken,
    ) -> Result<ForwardOutcome, ForwardingError> {
        let mut outcome = ForwardOutcome::default();
        for directive in directives {
            if cancel.is_cancelled() {
                return Err(ForwardingError::Cancelled {
                    directive: directive.to_string(),
                });
            }
            match self.start(client, directive) {
                Ok(handle) => outcome.handles.push(handle),
                Err(e) => {
                    warn!(%directive, error = %e, "forward skipped");
                    outcome.failures.push(e);
                }
            }
        }
        Ok(outcome)
    }

    pub fn stop(&self, handle: ForwardHandle) -> Result<(), ForwardingError> {
        let directive = handle.directive().to_string();
        handle
            .stop()
            .map_err(|source| ForwardingError::Transport { directive, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{AcceptAll, Event, MockTransport, hop};
    use crate::transport::{ConnectRequest, SshTransport};
    use crate::tunnel::{DynamicForward, LocalForward, RemoteForward};
    use pretty_assertions::assert_eq;

    fn client(mock: &MockTransport) -> Box<dyn SshClient> {
        let target = hop("T");
        let request = ConnectRequest {
            hop: &target,
            via: None,
            key: None,
        };
        mock.connect(&request, &AcceptAll, &AcceptAll).unwrap()
    }

    fn local(port: u32, remote_port: u32) -> ForwardDirective {
        ForwardDirective::Local(LocalForward {
            bind_address: None,
            local_port: port,
            remote_host: "db".into(),
            remote_port,
        })
    }

    #[test]
    fn out_of_range_ports_never_reach_transport() {
        let mock = MockTransport::new();
        let mut c = client(&mock);
        let manager = ForwardingManager::new(ForwardSettings::default());
        mock.clear();

        for d in [local(0, 80), local(70000, 80), local(8080, 0)] {
            assert!(matches!(
                manager.start(c.as_mut(), &d),
                Err(ForwardingError::PortOutOfRange { .. })
            ));
        }
        assert!(mock.events().is_empty());
    }

    #[test]
    fn fail_open_keeps_going() {
        let mock = MockTransport::new().fail_forward(8081);
        let mut c = client(&mock);
        let manager = ForwardingManager::new(ForwardSettings::default());
        let directives = vec![
            local(8080, 80),
            local(8081, 80),
            ForwardDirective::Remote(RemoteForward {
                bind_address: None,
                remote_port: 9000,
                target_host: "localhost".into(),
                local_port: 3000,
            }),
            ForwardDirective::Dynamic(DynamicForward {
                bind_address: Some("*".into()),
                local_port: 1080,
            }),
        ];
        let outcome = manager
            .start_all(c.as_mut(), &directives, &CancellationToken::new())
            .unwrap();
        assert_eq!(outcome.handles.len(), 3);
        assert_eq!(outcome.failures.len(), 1);
        assert!(!outcome.all_failed());
        assert!(outcome.failure_summary().unwrap().contains("L:8081:db:80"));
    }

    #[test]
    fn all_failed_is_reported() {
        let mock = MockTransport::new();
        let mut c = client(&mock);
        let manager = ForwardingManager::new(ForwardSettings::default());
        let outcome = manager
            .start_all(c.as_mut(), &[local(0, 80)], &CancellationToken::new())
            .unwrap();
        assert!(outcome.all_failed());

        let empty = manager
            .start_all(c.as_mut(), &[], &CancellationToken::new())
            .unwrap();
        assert!(!empty.all_failed());
    }

    #[test]
    fn dropping_a_handle_stops_it_once() {
        let mock = MockTransport::new();
        let mut c = client(&mock);
        let manager = ForwardingManager::new(ForwardSettings::default());
        let handle = manager.start(c.as_mut(), &local(8080, 80)).unwrap();
        assert_eq!(handle.bound_port(), Some(8080));
        manager.stop(handle).unwrap();

        let handle = manager.start(c.as_mut(), &local(8082, 80)).unwrap();
        drop(handle);

        let stops = mock
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::StopForward { .. }))
            .count();
        assert_eq!(stops, 2);
    }

    #[test]
    fn cancellation_stops_started_forwards() {
        let mock = MockTransport::new();
        let mut c = client(&mock);
        let manager = ForwardingManager::new(ForwardSettings::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = manager.start_all(c.as_mut(), &[local(8080, 80)], &cancel);
        assert!(matches!(result, Err(ForwardingError::Cancelled { .. })));
    }

    #[test]
    fn remote_forwards_bind_loopback_unless_asked() {
        let mock = MockTransport::new();
        let mut c = client(&mock);
        let manager = ForwardingManager::new(ForwardSettings::default());
        mock.clear();

        let remote = |bind: Option<&str>, port: u32| {
            ForwardDirective::Remote(RemoteForward {
                bind_address: bind.map(str::to_string),
                remote_port: port,
                target_host: "localhost".into(),
                local_port: 3000,
            })
        };
        manager.start(c.as_mut(), &remote(None, 9000)).unwrap();
        manager.start(c.as_mut(), &remote(Some("*"), 9001)).unwrap();

        let binds: Vec<(u16, String)> = mock
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Forward { kind: 'R', bind, port, .. } => Some((port, bind)),
                _ => None,
            })
            .collect();
        assert_eq!(
            binds,
            vec![(9000, "127.0.0.1".to_string()), (9001, "0.0.0.0".to_string())]
        );
    }

    #[test]
    fn bind_defaults() {
        assert_eq!(ForwardingManager::bind_for(&None, LOOPBACK), "127.0.0.1");
        assert_eq!(ForwardingManager::bind_for(&Some("*".into()), LOOPBACK), "0.0.0.0");
        assert_eq!(ForwardingManager::bind_for(&Some("[::1]".into()), LOOPBACK), "::1");
    }
}
