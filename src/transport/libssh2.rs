use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use ssh2::{
    Channel, CheckResult, ErrorCode, HashType, KeyboardInteractivePrompt, KnownHostFileKind,
    Session,
};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::socks::{self, Reply};
use super::{
    AuthPrompt, ConnectRequest, ForwardListener, HostKeyDecision, HostKeyInfo, HostKeyStatus,
    HostKeyVerifier, InteractiveAuth, SshClient, SshTransport, TransportError,
};
use crate::keys::KeyMaterial;
use crate::resolve::Hop;

const LIBSSH2_ERROR_EAGAIN: i32 = -37;
const POLL: Duration = Duration::from_millis(5);
const ACCEPT_POLL: Duration = Duration::from_millis(50);
const BUFFER_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
    /// OpenSSH known_hosts file; `None` means nothing is ever known.
    pub known_hosts: Option<PathBuf>,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            keepalive_interval: Duration::from_secs(30),
            known_hosts: dirs::home_dir().map(|h| h.join(".ssh").join("known_hosts")),
        }
    }
}

/// [`SshTransport`] backed by libssh2 through the `ssh2` crate.
///
/// Sessions are switched to non-blocking mode after authentication so that
/// every forward on a session can share it from its own thread.
#[derive(Debug, Clone, Default)]
pub struct Libssh2Transport {
    settings: TransportSettings,
}

impl Libssh2Transport {
    pub fn new(settings: TransportSettings) -> Self {
        Self { settings }
    }

    fn check_host_key(
        &self,
        session: &Session,
        hop: &Hop,
        verifier: &dyn HostKeyVerifier,
    ) -> Result<(), TransportError> {
        let (key, host_key_type) = session
            .host_key()
            .map(|(key, kind)| (key.to_vec(), kind))
            .ok_or(TransportError::NoHostKey)?;
        let fingerprint = session
            .host_key_hash(HashType::Sha256)
            .map(fingerprint)
            .unwrap_or_default();

        let mut known = session.known_hosts()?;
        if let Some(path) = self.settings.known_hosts.as_deref().filter(|p| p.exists()) {
            if let Err(e) = known.read_file(path, KnownHostFileKind::OpenSSH) {
                warn!(path = %path.display(), error = %e, "cannot read known_hosts");
            }
        }
        let status = match known.check_port(&hop.hostname, hop.port, &key) {
            CheckResult::Match => HostKeyStatus::Known,
            CheckResult::Mismatch => HostKeyStatus::Changed,
            CheckResult::NotFound | CheckResult::Failure => HostKeyStatus::Unknown,
        };

        let info = HostKeyInfo {
            host: hop.hostname.clone(),
            port: hop.port,
            key_type: key_type_name(&key),
            fingerprint,
            status,
        };
        debug!(host = %info.host, status = %info.status, fingerprint = %info.fingerprint, "host key received");

        match verifier.verify(&info) {
            HostKeyDecision::Reject => Err(TransportError::HostKeyRejected {
                host: info.host,
                status,
            }),
            HostKeyDecision::AcceptOnce => Ok(()),
            HostKeyDecision::AcceptAndRemember => {
                if let Some(path) = self.settings.known_hosts.as_deref() {
                    remember(&mut known, path, hop, &key, host_key_type)?;
                    info!(host = %hop.hostname, path = %path.display(), "host key saved");
                }
                Ok(())
            }
        }
    }
}

impl SshTransport for Libssh2Transport {
    fn connect(
        &self,
        request: &ConnectRequest<'_>,
        verifier: &dyn HostKeyVerifier,
        auth: &dyn InteractiveAuth,
    ) -> Result<Box<dyn SshClient>, TransportError> {
        let hop = request.hop;
        let addr = match request.via {
            Some(addr) => addr,
            None => resolve_addr(hop)?,
        };
        debug!(hop = %hop, %addr, "dialing");

        let tcp = TcpStream::connect_timeout(&addr, self.settings.connect_timeout)?;
        let _ = tcp.set_nodelay(true);

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.set_timeout(millis(self.settings.connect_timeout));
        session.handshake()?;

        self.check_host_key(&session, hop, verifier)?;
        authenticate(&session, hop, request.key, auth)?;

        let interval = self.settings.keepalive_interval.as_secs();
        session.set_keepalive(false, u32::try_from(interval).unwrap_or(u32::MAX));
        session.set_blocking(false);
        info!(hop = %hop, "authenticated");

        Ok(Box::new(Libssh2Client::start(
            session,
            hop.label().to_string(),
            &self.settings,
        )?))
    }
}

pub struct Libssh2Client {
    label: String,
    session: Session,
    channel_timeout: Duration,
    stop: Arc<AtomicBool>,
    keepalive: Option<JoinHandle<()>>,
    connected: bool,
}

impl Libssh2Client {
    fn start(session: Session, label: String, settings: &TransportSettings) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let keepalive = spawn_keepalive(
            session.clone(),
            Arc::clone(&stop),
            settings.keepalive_interval,
            &label,
        )?;
        Ok(Self {
            label,
            session,
            channel_timeout: settings.connect_timeout,
            stop,
            keepalive: Some(keepalive),
            connected: true,
        })
    }
}

impl SshClient for Libssh2Client {
    fn label(&self) -> &str {
        &self.label
    }

    fn open_local_forward(
        &mut self,
        bind: &str,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<Box<dyn ForwardListener>, TransportError> {
        let listener = TcpListener::bind((bind, local_port))?;
        let session = self.session.clone();
        let remote_host = remote_host.to_string();
        let timeout = self.channel_timeout;
        let handle = serve_local(listener, format!("L{local_port}"), move |stream, stop| {
            let _ = stream.set_nonblocking(false);
            match open_channel(&session, &remote_host, remote_port, timeout) {
                Ok(channel) => pump(channel, stream, &stop),
                Err(e) => {
                    debug!(target_host = %remote_host, remote_port, error = %e, "channel open failed");
                    let _ = stream.shutdown(Shutdown::Both);
                }
            }
        })?;
        Ok(Box::new(handle))
    }

    fn open_remote_forward(
        &mut self,
        bind: &str,
        remote_port: u16,
        target_host: &str,
        local_port: u16,
    ) -> Result<Box<dyn ForwardListener>, TransportError> {
        let (mut listener, bound) = retry(self.channel_timeout, "requesting remote forward", || {
            self.session.channel_forward_listen(remote_port, Some(bind), None)
        })?;
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let target_host = target_host.to_string();

        let thread = thread::Builder::new()
            .name(format!("fwd-R{bound}"))
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    let channel = match listener.accept() {
                        Ok(channel) => channel,
                        Err(e) if would_block(&e) => {
                            thread::sleep(ACCEPT_POLL);
                            continue;
                        }
                        Err(e) => {
                            debug!(error = %e, "remote accept failed");
                            thread::sleep(ACCEPT_POLL);
                            continue;
                        }
                    };
                    let target_host = target_host.clone();
                    let flag = Arc::clone(&flag);
                    thread::spawn(move || match TcpStream::connect((target_host.as_str(), local_port)) {
                        Ok(stream) => pump(channel, stream, &flag),
                        Err(e) => {
                            debug!(%target_host, local_port, error = %e, "local connect failed");
                            let mut channel = channel;
                            let _ = channel.close();
                        }
                    });
                }
            })?;

        Ok(Box::new(ListenerHandle {
            port: bound,
            stop,
            thread: Some(thread),
        }))
    }

    fn open_dynamic_forward(
        &mut self,
        bind: &str,
        local_port: u16,
    ) -> Result<Box<dyn ForwardListener>, TransportError> {
        let listener = TcpListener::bind((bind, local_port))?;
        let session = self.session.clone();
        let timeout = self.channel_timeout;
        let handle = serve_local(listener, format!("D{local_port}"), move |mut stream, stop| {
            let _ = stream.set_nonblocking(false);
            let _ = stream.set_read_timeout(Some(socks::HANDSHAKE_TIMEOUT));
            let (host, port) = match socks::negotiate(&mut stream) {
                Ok(dest) => dest,
                Err(e) => {
                    debug!(error = %e, "socks negotiation failed");
                    let _ = stream.shutdown(Shutdown::Both);
                    return;
                }
            };
            let _ = stream.set_read_timeout(None);
            match open_channel(&session, &host, port, timeout) {
                Ok(channel) => {
                    if socks::reply(&mut stream, Reply::Succeeded).is_ok() {
                        pump(channel, stream, &stop);
                    }
                }
                Err(e) => {
                    debug!(%host, port, error = %e, "socks destination unreachable");
                    let _ = socks::reply(&mut stream, Reply::HostUnreachable);
                    let _ = stream.shutdown(Shutdown::Both);
                }
            }
        })?;
        Ok(Box::new(handle))
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        self.stop.store(true, Ordering::Relaxed);
        if let Some(keepalive) = self.keepalive.take() {
            let _ = keepalive.join();
        }
        self.session.set_blocking(true);
        self.session.set_timeout(2_000);
        self.session.disconnect(None, "closing", None)?;
        debug!(hop = %self.label, "disconnected");
        Ok(())
    }
}

impl Drop for Libssh2Client {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}

/// A forward listener running on its own accept thread.
pub struct ListenerHandle {
    port: u16,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ForwardListener for ListenerHandle {
    fn bound_port(&self) -> u16 {
        self.port
    }

    fn stop(&mut self) -> Result<(), TransportError> {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| std::io::Error::other("forward thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

fn serve_local<F>(listener: TcpListener, name: String, handler: F) -> std::io::Result<ListenerHandle>
where
    F: Fn(TcpStream, Arc<AtomicBool>) + Send + Sync + 'static,
{
    listener.set_nonblocking(true)?;
    let port = listener.local_addr()?.port();
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    let handler = Arc::new(handler);

    let thread = thread::Builder::new()
        .name(format!("fwd-{name}"))
        .spawn(move || {
            while !flag.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        debug!(%peer, port, "accepted");
                        let handler = Arc::clone(&handler);
                        let flag = Arc::clone(&flag);
                        thread::spawn(move || handler(stream, flag));
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                    Err(e) => {
                        warn!(port, error = %e, "listener failed");
                        break;
                    }
                }
            }
        })?;

    Ok(ListenerHandle {
        port,
        stop,
        thread: Some(thread),
    })
}

fn spawn_keepalive(
    session: Session,
    stop: Arc<AtomicBool>,
    interval: Duration,
    label: &str,
) -> std::io::Result<JoinHandle<()>> {
    let label = label.to_string();
    thread::Builder::new()
        .name(format!("keepalive-{label}"))
        .spawn(move || {
            let mut last = Instant::now();
            while !stop.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(200));
                if interval.is_zero() || last.elapsed() < interval {
                    continue;
                }
                last = Instant::now();
                if let Err(e) = session.keepalive_send() {
                    if !would_block(&e) {
                        warn!(hop = %label, error = %e, "keepalive failed");
                    }
                }
            }
        })
}

/// A rejected key is retried with a passphrase only if it is encrypted, or
/// libssh2 reports it could not decode it.
fn needs_passphrase(key: &KeyMaterial, error: &str) -> bool {
    let error = error.to_ascii_lowercase();
    key.is_encrypted() || error.contains("decrypt") || error.contains("passphrase")
}

fn authenticate(
    session: &Session,
    hop: &Hop,
    key: Option<&KeyMaterial>,
    auth: &dyn InteractiveAuth,
) -> Result<(), TransportError> {
    let user = hop.user.as_str();
    let methods = session
        .auth_methods(user)
        .map(str::to_string)
        .unwrap_or_default();
    if session.authenticated() {
        return Ok(());
    }

    if let Some(key) = key {
        let public = key.public_key();
        let rejected = session
            .userauth_pubkey_memory(user, public.as_deref(), key.private_key(), None)
            .err();
        if let Some(e) = rejected.filter(|e| needs_passphrase(key, e.message())) {
            debug!(hop = %hop, error = %e, "key needs a passphrase");
            let prompt = AuthPrompt {
                text: format!("Passphrase for {}: ", key.path().display()),
                echo: false,
            };
            if let Some(answers) = auth.respond(hop, "", &[prompt]) {
                if let Some(passphrase) = answers.into_iter().next().map(Zeroizing::new) {
                    let _ = session.userauth_pubkey_memory(
                        user,
                        public.as_deref(),
                        key.private_key(),
                        Some(passphrase.as_str()),
                    );
                }
            }
        }
        if session.authenticated() {
            return Ok(());
        }
    }

    if session.userauth_agent(user).is_ok() && session.authenticated() {
        return Ok(());
    }

    if methods.contains("keyboard-interactive") {
        let mut prompter = Prompter { hop, auth };
        if session
            .userauth_keyboard_interactive(user, &mut prompter)
            .is_ok()
            && session.authenticated()
        {
            return Ok(());
        }
    }

    if methods.contains("password") {
        let prompt = AuthPrompt {
            text: format!("{hop} password: "),
            echo: false,
        };
        if let Some(password) = auth
            .respond(hop, "", &[prompt])
            .and_then(|a| a.into_iter().next())
            .map(Zeroizing::new)
        {
            let _ = session.userauth_password(user, &password);
        }
        if session.authenticated() {
            return Ok(());
        }
    }

    Err(TransportError::AuthFailed {
        user: hop.user.clone(),
        host: hop.hostname.clone(),
    })
}

struct Prompter<'a> {
    hop: &'a Hop,
    auth: &'a dyn InteractiveAuth,
}

impl KeyboardInteractivePrompt for Prompter<'_> {
    fn prompt<'a>(
        &mut self,
        _username: &str,
        instructions: &str,
        prompts: &[ssh2::Prompt<'a>],
    ) -> Vec<String> {
        let prompts: Vec<AuthPrompt> = prompts
            .iter()
            .map(|p| AuthPrompt {
                text: p.text.to_string(),
                echo: p.echo,
            })
            .collect();
        self.auth
            .respond(self.hop, instructions, &prompts)
            .unwrap_or_default()
    }
}

fn remember(
    known: &mut ssh2::KnownHosts,
    path: &Path,
    hop: &Hop,
    key: &[u8],
    key_type: ssh2::HostKeyType,
) -> Result<(), TransportError> {
    let entry = if hop.port == 22 {
        hop.hostname.clone()
    } else {
        format!("[{}]:{}", hop.hostname, hop.port)
    };
    for stale in known.iter()? {
        if stale.name() == Some(entry.as_str()) {
            known.remove(&stale)?;
        }
    }
    known.add(&entry, key, "", key_type.into())?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    known.write_file(path, KnownHostFileKind::OpenSSH)?;
    Ok(())
}

fn resolve_addr(hop: &Hop) -> Result<SocketAddr, TransportError> {
    (hop.hostname.as_str(), hop.port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| TransportError::Resolve {
            host: hop.hostname.clone(),
            port: hop.port,
        })
}

fn millis(d: Duration) -> u32 {
    u32::try_from(d.as_millis()).unwrap_or(u32::MAX)
}

/// OpenSSH-style fingerprint text for a raw SHA-256 digest.
fn fingerprint(digest: &[u8]) -> String {
    format!("SHA256:{}", STANDARD_NO_PAD.encode(digest))
}

/// Algorithm name from the length-prefixed string at the start of a key blob.
fn key_type_name(blob: &[u8]) -> String {
    let Some(len) = blob.get(..4) else {
        return "unknown".to_string();
    };
    let len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;
    blob.get(4..4 + len)
        .and_then(|name| std::str::from_utf8(name).ok())
        .unwrap_or("unknown")
        .to_string()
}

fn would_block(err: &ssh2::Error) -> bool {
    matches!(err.code(), ErrorCode::Session(code) if code == LIBSSH2_ERROR_EAGAIN)
}

/// Repeat a non-blocking libssh2 call until it stops returning EAGAIN.
fn retry<T>(
    timeout: Duration,
    what: &'static str,
    mut op: impl FnMut() -> Result<T, ssh2::Error>,
) -> Result<T, TransportError> {
    let deadline = Instant::now() + timeout;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if would_block(&e) => {
                if Instant::now() >= deadline {
                    return Err(TransportError::Timeout(what));
                }
                thread::sleep(POLL);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn open_channel(
    session: &Session,
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<Channel, TransportError> {
    retry(timeout, "opening channel", || {
        session.channel_direct_tcpip(host, port, None)
    })
}

/// Bytes read from one side that the other side has not accepted yet.
#[derive(Default)]
struct Carry {
    buf: Vec<u8>,
    pos: usize,
}

impl Carry {
    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn pending(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    fn load(&mut self, data: &[u8]) {
        self.buf.clear();
        self.buf.extend_from_slice(data);
        self.pos = 0;
    }
}

/// Move at most one read's worth of data from `src` to `dst` without blocking.
/// Returns whether anything moved.
fn step(
    src: &mut impl Read,
    dst: &mut impl Write,
    carry: &mut Carry,
    scratch: &mut [u8],
    open: &mut bool,
) -> std::io::Result<bool> {
    let mut moved = false;
    if carry.is_empty() && *open {
        match src.read(scratch) {
            Ok(0) => *open = false,
            Ok(n) => {
                carry.load(&scratch[..n]);
                moved = true;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }
    }
    while !carry.is_empty() {
        match dst.write(carry.pending()) {
            Ok(0) => return Err(ErrorKind::WriteZero.into()),
            Ok(n) => {
                carry.pos += n;
                moved = true;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }
    Ok(moved)
}

/// Shuttle bytes between a TCP stream and a channel until either side closes
/// or `stop` is set.
fn pump(mut channel: Channel, mut stream: TcpStream, stop: &AtomicBool) {
    if stream.set_nonblocking(true).is_err() {
        return;
    }
    let mut scratch = vec![0u8; BUFFER_SIZE];
    let mut upstream = Carry::default();
    let mut downstream = Carry::default();
    let mut local_open = true;
    let mut remote_open = true;
    let mut eof_sent = false;

    while !stop.load(Ordering::Relaxed) {
        let up = step(&mut stream, &mut channel, &mut upstream, &mut scratch, &mut local_open);
        let down = step(&mut channel, &mut stream, &mut downstream, &mut scratch, &mut remote_open);
        let (Ok(up), Ok(down)) = (up, down) else {
            break;
        };
        if !local_open && upstream.is_empty() && !eof_sent {
            let _ = channel.send_eof();
            eof_sent = true;
        }
        if !remote_open && downstream.is_empty() {
            break;
        }
        if !up && !down {
            thread::sleep(POLL);
        }
    }

    let _ = stream.shutdown(Shutdown::Both);
    let _ = channel.close();
}
