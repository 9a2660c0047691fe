use std::collections::BTreeMap;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::connector::{LogicalConnection, TeardownError, guarded};
use crate::forward::ForwardHandle;

pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(30);

/// A running tunnel. Owns its connection and forwards until stopped.
pub struct ActiveTunnel {
    pub profile_id: String,
    pub session_id: Uuid,
    pub display_name: String,
    pub started_at: SystemTime,
    connection: LogicalConnection,
    forwards: Vec<ForwardHandle>,
}

impl ActiveTunnel {
    pub fn new(
        profile_id: impl Into<String>,
        display_name: impl Into<String>,
        connection: LogicalConnection,
        forwards: Vec<ForwardHandle>,
    ) -> Self {
        Self {
            profile_id: profile_id.into(),
            session_id: Uuid::new_v4(),
            display_name: display_name.into(),
            started_at: SystemTime::now(),
            connection,
            forwards,
        }
    }

    pub fn status(&self) -> TunnelStatus {
        TunnelStatus {
            session_id: self.session_id,
            display_name: self.display_name.clone(),
            started_at: self.started_at,
            hops: self.connection.path().to_vec(),
            forwards: self.forwards.iter().map(|f| f.directive().to_string()).collect(),
            local_ports: self
                .forwards
                .iter()
                .filter_map(|f| f.directive().local_listen_port())
                .collect(),
        }
    }

    /// Forwards newest first, then the chain.
    pub fn teardown(mut self) -> Vec<TeardownError> {
        let mut errors = Vec::new();
        while let Some(forward) = self.forwards.pop() {
            let resource = format!("forward {}", forward.directive());
            guarded(&mut errors, resource, move || forward.stop());
        }
        errors.extend(self.connection.shutdown());
        errors
    }
}

/// Point-in-time view of one active tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelStatus {
    pub session_id: Uuid,
    pub display_name: String,
    pub started_at: SystemTime,
    pub hops: Vec<String>,
    pub forwards: Vec<String>,
    pub local_ports: Vec<u16>,
}

impl TunnelStatus {
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    Stopped,
    /// Teardown outlived the grace period and was left running in the background.
    TimedOut,
}

/// Profile id to running tunnel. Presence in the map is what "active" means.
#[derive(Default)]
pub struct TunnelRegistry {
    tunnels: DashMap<String, ActiveTunnel>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless the profile already has a tunnel; the rejected tunnel is handed back.
    pub fn try_add(&self, tunnel: ActiveTunnel) -> Result<(), ActiveTunnel> {
        match self.tunnels.entry(tunnel.profile_id.clone()) {
            Entry::Occupied(_) => Err(tunnel),
            Entry::Vacant(slot) => {
                slot.insert(tunnel);
                Ok(())
            }
        }
    }

    pub fn remove(&self, profile_id: &str) -> Option<ActiveTunnel> {
        self.tunnels.remove(profile_id).map(|(_, tunnel)| tunnel)
    }

    pub fn is_active(&self, profile_id: &str) -> bool {
        self.tunnels.contains_key(profile_id)
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tunnels.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn snapshot(&self) -> BTreeMap<String, TunnelStatus> {
        self.tunnels
            .iter()
            .map(|e| (e.key().clone(), e.value().status()))
            .collect()
    }

    /// Remove the tunnel, then tear it down on its own thread, waiting at most
    /// `grace` (or until `cancel`). A second call finds nothing and returns
    /// [`StopOutcome::NotRunning`].
    pub fn stop(&self, profile_id: &str, grace: Duration, cancel: &CancellationToken) -> StopOutcome {
        let Some(teardown) = self.detach(profile_id) else {
            return StopOutcome::NotRunning;
        };
        teardown.wait(Instant::now() + grace, cancel)
    }

    /// Start every teardown at once, then wait for all of them against one deadline.
    pub fn stop_all(&self, grace: Duration, cancel: &CancellationToken) -> Vec<(String, StopOutcome)> {
        let pending: Vec<(String, Option<Teardown>)> = self
            .ids()
            .into_iter()
            .map(|id| {
                let teardown = self.detach(&id);
                (id, teardown)
            })
            .collect();
        let deadline = Instant::now() + grace;
        pending
            .into_iter()
            .map(|(id, teardown)| {
                let outcome = match teardown {
                    Some(t) => t.wait(deadline, cancel),
                    None => StopOutcome::NotRunning,
                };
                (id, outcome)
            })
            .collect()
    }

    fn detach(&self, profile_id: &str) -> Option<Teardown> {
        let tunnel = self.remove(profile_id)?;
        let session_id = tunnel.session_id;
        let (tx, rx) = mpsc::channel();

        let spawned = thread::Builder::new()
            .name(format!("teardown-{profile_id}"))
            .spawn(move || {
                let _ = tx.send(tunnel.teardown());
            });
        if let Err(e) = spawned {
            // The closure and the tunnel inside it were dropped, which tore it down.
            warn!(profile_id, error = %e, "teardown thread unavailable");
        }
        Some(Teardown {
            profile_id: profile_id.to_string(),
            session_id,
            rx,
        })
    }
}

/// A teardown running on its own thread.
struct Teardown {
    profile_id: String,
    session_id: Uuid,
    rx: mpsc::Receiver<Vec<TeardownError>>,
}

impl Teardown {
    fn wait(self, deadline: Instant, cancel: &CancellationToken) -> StopOutcome {
        let profile_id = self.profile_id.as_str();
        let session_id = self.session_id;
        loop {
            let slice = deadline
                .saturating_duration_since(Instant::now())
                .min(Duration::from_millis(100));
            match self.rx.recv_timeout(slice) {
                Ok(errors) => {
                    if errors.is_empty() {
                        info!(profile_id, %session_id, "tunnel stopped");
                    } else {
                        warn!(profile_id, %session_id, failures = errors.len(), "tunnel stopped with teardown errors");
                    }
                    return StopOutcome::Stopped;
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    // Sender dropped without a result: the thread panicked or never started.
                    return StopOutcome::Stopped;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if cancel.is_cancelled() || Instant::now() >= deadline {
                        warn!(profile_id, %session_id, "teardown still running, detaching");
                        return StopOutcome::TimedOut;
                    }
                }
            }
        }
    }
}
