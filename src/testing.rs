//! Scripted in-memory transport that records everything done to it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::resolve::Hop;
use crate::transport::{
    AuthPrompt, ConnectRequest, ForwardListener, HostKeyDecision, HostKeyInfo, HostKeyVerifier,
    InteractiveAuth, SshClient, SshTransport, TransportError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connect { hop: String, via: Option<u16> },
    Forward { on: String, kind: char, bind: String, port: u16 },
    StopForward { on: String, port: u16 },
    Disconnect(String),
}

#[derive(Default)]
struct Script {
    fail_connect: HashSet<String>,
    fail_forward: HashSet<u16>,
    fail_disconnect: HashSet<String>,
    panic_disconnect: HashSet<String>,
    hang_disconnect: HashMap<String, Duration>,
    cancel_after: HashMap<String, CancellationToken>,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    events: Arc<Mutex<Vec<Event>>>,
    script: Arc<Mutex<Script>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_connect(self, hop: &str) -> Self {
        self.script.lock().fail_connect.insert(hop.to_string());
        self
    }

    pub fn fail_forward(self, port: u16) -> Self {
        self.script.lock().fail_forward.insert(port);
        self
    }

    pub fn fail_disconnect(self, hop: &str) -> Self {
        self.script.lock().fail_disconnect.insert(hop.to_string());
        self
    }

    pub fn panic_on_disconnect(self, hop: &str) -> Self {
        self.script.lock().panic_disconnect.insert(hop.to_string());
        self
    }

    pub fn hang_on_disconnect(self, hop: &str, delay: Duration) -> Self {
        self.script.lock().hang_disconnect.insert(hop.to_string(), delay);
        self
    }

    /// Cancel `token` right after `hop` connects.
    pub fn cancel_after_connect(self, hop: &str, token: CancellationToken) -> Self {
        self.script.lock().cancel_after.insert(hop.to_string(), token);
        self
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn count(&self, event: &Event) -> usize {
        self.events.lock().iter().filter(|e| *e == event).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    fn record(&self, event: Event) {
        self.events.lock().push(event);
    }
}

impl SshTransport for MockTransport {
    fn connect(
        &self,
        request: &ConnectRequest<'_>,
        _verifier: &dyn HostKeyVerifier,
        _auth: &dyn InteractiveAuth,
    ) -> Result<Box<dyn SshClient>, TransportError> {
        let label = request.hop.label().to_string();
        self.record(Event::Connect {
            hop: label.clone(),
            via: request.via.map(|a| a.port()),
        });
        let script = self.script.lock();
        if script.fail_connect.contains(&label) {
            return Err(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused").into());
        }
        if let Some(token) = script.cancel_after.get(&label) {
            token.cancel();
        }
        Ok(Box::new(MockClient {
            label,
            transport: self.clone(),
        }))
    }
}

pub struct MockClient {
    label: String,
    transport: MockTransport,
}

impl MockClient {
    fn listener(&self, kind: char, bind: &str, port: u16) -> Result<Box<dyn ForwardListener>, TransportError> {
        self.transport.record(Event::Forward {
            on: self.label.clone(),
            kind,
            bind: bind.to_string(),
            port,
        });
        if self.transport.script.lock().fail_forward.contains(&port) {
            return Err(std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use").into());
        }
        Ok(Box::new(MockListener {
            on: self.label.clone(),
            port,
            transport: self.transport.clone(),
        }))
    }
}

impl SshClient for MockClient {
    fn label(&self) -> &str {
        &self.label
    }

    fn open_local_forward(
        &mut self,
        bind: &str,
        local_port: u16,
        _remote_host: &str,
        _remote_port: u16,
    ) -> Result<Box<dyn ForwardListener>, TransportError> {
        self.listener('L', bind, local_port)
    }

    fn open_remote_forward(
        &mut self,
        bind: &str,
        remote_port: u16,
        _target_host: &str,
        _local_port: u16,
    ) -> Result<Box<dyn ForwardListener>, TransportError> {
        self.listener('R', bind, remote_port)
    }

    fn open_dynamic_forward(
        &mut self,
        bind: &str,
        local_port: u16,
    ) -> Result<Box<dyn ForwardListener>, TransportError> {
        self.listener('D', bind, local_port)
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        self.transport.record(Event::Disconnect(self.label.clone()));
        let (panics, fails, hang) = {
            let script = self.transport.script.lock();
            (
                script.panic_disconnect.contains(&self.label),
                script.fail_disconnect.contains(&self.label),
                script.hang_disconnect.get(&self.label).copied(),
            )
        };
        if let Some(delay) = hang {
            std::thread::sleep(delay);
        }
        if panics {
            panic!("disconnect of {} blew up", self.label);
        }
        if fails {
            return Err(std::io::Error::other("disconnect failed").into());
        }
        Ok(())
    }
}

pub struct MockListener {
    on: String,
    port: u16,
    transport: MockTransport,
}

impl ForwardListener for MockListener {
    fn bound_port(&self) -> u16 {
        self.port
    }

    fn stop(&mut self) -> Result<(), TransportError> {
        self.transport.record(Event::StopForward {
            on: self.on.clone(),
            port: self.port,
        });
        Ok(())
    }
}

pub struct AcceptAll;

impl HostKeyVerifier for AcceptAll {
    fn verify(&self, _: &HostKeyInfo) -> HostKeyDecision {
        HostKeyDecision::AcceptOnce
    }
}

impl InteractiveAuth for AcceptAll {
    fn respond(&self, _: &Hop, _: &str, prompts: &[AuthPrompt]) -> Option<Vec<String>> {
        Some(prompts.iter().map(|_| String::new()).collect())
    }
}

pub fn hop(label: &str) -> Hop {
    Hop {
        host_id: Some(label.to_string()),
        hostname: format!("{}.example.com", label.to_lowercase()),
        port: 22,
        user: "ops".to_string(),
        identity_file: None,
    }
}
