// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunneld Contributors

// Tunneld - Forwarding Module
// Three data planes (local, remote-reverse, dynamic SOCKS5) sharing one
// lifecycle contract: start, stop-with-drain, atomic stats

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use tunneld_common::{format_host_port, Error, Result, TunnelSpec, TunnelType};

use super::session::ForwardedStream;

/// Time allowed for in-flight connections to finish during Stop
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Anything that can carry forwarded bytes
pub trait StreamLike: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin {}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin> StreamLike for T {}

pub type BoxedStream = Box<dyn StreamLike>;

/// The narrow session surface forwarders depend on. Both single sessions
/// and multi-hop chains satisfy it; tests use in-process mocks.
#[async_trait::async_trait]
pub trait SessionDialer: Send + Sync {
    /// Open a stream from the remote side of the session to host:port
    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream>;
    async fn is_connected(&self) -> bool;
}

/// Inbound streams for one remote binding
pub struct RemoteIncoming {
    /// Port the server actually bound (may differ from the request)
    pub bound_port: u16,
    pub incoming: mpsc::UnboundedReceiver<ForwardedStream>,
}

/// Remote-listen capability: ask the SSH peer to bind a port and hand back
/// the stream of inbound connections. For chains this reaches the last hop.
#[async_trait::async_trait]
pub trait RemoteBind: Send + Sync {
    async fn bind_remote(&self, address: &str, port: u16) -> Result<RemoteIncoming>;
    async fn cancel_remote(&self, address: &str, port: u16);
    async fn is_connected(&self) -> bool;
}

/// Shared counters; individual reads are consistent, the set is not
/// jointly snapshottable.
#[derive(Debug)]
pub struct ForwarderStats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    connections: AtomicU64,
    active_conns: AtomicU64,
    errors: AtomicU64,
    started_at: DateTime<Utc>,
    last_activity: StdMutex<DateTime<Utc>>,
}

impl ForwarderStats {
    fn new() -> Arc<Self> {
        let now = Utc::now();
        Arc::new(Self {
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            connections: AtomicU64::new(0),
            active_conns: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            started_at: now,
            last_activity: StdMutex::new(now),
        })
    }

    fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn touch(&self) {
        *self.last_activity.lock().expect("stats lock poisoned") = Utc::now();
    }

    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
            active_conns: self.active_conns.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            started_at: self.started_at,
            last_activity: *self.last_activity.lock().expect("stats lock poisoned"),
        }
    }
}

/// Point-in-time stats reading
#[derive(Debug, Clone, Copy)]
pub struct StatsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub connections: u64,
    pub active_conns: u64,
    pub errors: u64,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Common lifecycle contract of the three data planes
#[async_trait::async_trait]
pub trait Forwarder: Send + Sync {
    async fn start(&self) -> Result<()>;
    /// Exactly-once; repeated calls return Ok
    async fn stop(&self) -> Result<()>;
    fn stats(&self) -> StatsSnapshot;
    /// Bound listen address, once started (local and dynamic planes)
    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Shared start/stop bookkeeping
struct Lifecycle {
    started: AtomicBool,
    stopped: AtomicBool,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    fn begin_start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Conflict("forwarder already started".into()));
        }
        Ok(())
    }

    /// First caller wins; everyone else gets a clean Ok
    async fn stop_and_drain(&self, what: &str) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel.cancel();
        self.tracker.close();

        if tokio::time::timeout(DRAIN_TIMEOUT, self.tracker.wait())
            .await
            .is_err()
        {
            return Err(Error::Timeout(format!(
                "{}: timeout waiting for connections to close",
                what
            )));
        }
        Ok(())
    }
}

/// Bidirectional copy, recording both directions into the stats
async fn proxy<A, B>(mut a: A, mut b: B, stats: &ForwarderStats)
where
    A: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    B: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    match tokio::io::copy_bidirectional(&mut a, &mut b).await {
        Ok((sent, received)) => {
            stats.bytes_sent.fetch_add(sent, Ordering::Relaxed);
            stats.bytes_received.fetch_add(received, Ordering::Relaxed);
            stats.touch();
            debug!("connection closed: {} bytes out, {} bytes in", sent, received);
        }
        Err(e) => {
            // Half-closed teardown is normal; count it but keep serving
            stats.record_error();
            stats.touch();
            debug!("connection ended with error: {}", e);
        }
    }
}

fn listener_bind_error(addr: &str, e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::PermissionDenied {
        Error::Resource(format!(
            "permission denied binding {} (privileged port?)",
            addr
        ))
    } else if e.kind() == std::io::ErrorKind::AddrInUse {
        Error::Resource(format!("address {} already in use", addr))
    } else {
        Error::Resource(format!("failed to bind {}: {}", addr, e))
    }
}

// ---------------------------------------------------------------------------
// Local forwarding
// ---------------------------------------------------------------------------

/// Listens locally; every accepted connection is dialed through the session
/// to a fixed remote destination.
pub struct LocalForwarder {
    bind_address: String,
    local_port: u16,
    remote_host: String,
    remote_port: u16,
    session: Arc<dyn SessionDialer>,
    stats: Arc<ForwarderStats>,
    local_addr: StdMutex<Option<SocketAddr>>,
    lifecycle: Lifecycle,
}

impl LocalForwarder {
    pub fn new(spec: &TunnelSpec, session: Arc<dyn SessionDialer>) -> Result<Self> {
        if spec.tunnel_type != TunnelType::Local {
            return Err(Error::Internal(format!(
                "invalid tunnel type for local forwarder: {}",
                spec.tunnel_type
            )));
        }
        if spec.remote_host.is_empty() || spec.remote_port == 0 {
            return Err(Error::validation(
                "remote host and port are required for local forwarding",
                vec![
                    tunneld_common::FieldIssue::new("remoteHost", "required"),
                    tunneld_common::FieldIssue::new("remotePort", "must be between 1 and 65535"),
                ],
            ));
        }

        Ok(Self {
            bind_address: spec.local_bind_address.clone(),
            local_port: spec.local_port,
            remote_host: spec.remote_host.clone(),
            remote_port: spec.remote_port,
            session,
            stats: ForwarderStats::new(),
            local_addr: StdMutex::new(None),
            lifecycle: Lifecycle::new(),
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        session: Arc<dyn SessionDialer>,
        remote_host: String,
        remote_port: u16,
        stats: Arc<ForwarderStats>,
        lifecycle_cancel: CancellationToken,
        tracker: TaskTracker,
    ) {
        loop {
            let (stream, peer) = tokio::select! {
                _ = lifecycle_cancel.cancelled() => return,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        if lifecycle_cancel.is_cancelled() {
                            return;
                        }
                        stats.record_error();
                        warn!("accept failed: {}", e);
                        continue;
                    }
                },
            };
            debug!("accepted {} for {}:{}", peer, remote_host, remote_port);

            let session = session.clone();
            let stats = stats.clone();
            let host = remote_host.clone();
            tracker.spawn(async move {
                stats.connections.fetch_add(1, Ordering::Relaxed);
                stats.active_conns.fetch_add(1, Ordering::Relaxed);

                handle_local_connection(stream, session, host, remote_port, &stats).await;

                stats.active_conns.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }
}

async fn handle_local_connection(
    local: TcpStream,
    session: Arc<dyn SessionDialer>,
    remote_host: String,
    remote_port: u16,
    stats: &ForwarderStats,
) {
    if !session.is_connected().await {
        stats.record_error();
        return;
    }

    let remote = match session.dial(&remote_host, remote_port).await {
        Ok(stream) => stream,
        Err(e) => {
            stats.record_error();
            debug!("dial {}:{} failed: {}", remote_host, remote_port, e);
            return;
        }
    };

    proxy(local, remote, stats).await;
}

#[async_trait::async_trait]
impl Forwarder for LocalForwarder {
    async fn start(&self) -> Result<()> {
        self.lifecycle.begin_start()?;

        let addr = format_host_port(&self.bind_address, self.local_port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| listener_bind_error(&addr, e))?;
        let bound = listener
            .local_addr()
            .map_err(|e| Error::Internal(format!("local_addr: {}", e)))?;
        *self.local_addr.lock().expect("addr lock poisoned") = Some(bound);

        info!(
            "local forward listening on {} -> {}:{}",
            bound, self.remote_host, self.remote_port
        );

        let session = self.session.clone();
        let stats = self.stats.clone();
        let remote_host = self.remote_host.clone();
        let remote_port = self.remote_port;
        let cancel = self.lifecycle.cancel.clone();
        let tracker = self.lifecycle.tracker.clone();
        tokio::spawn(Self::accept_loop(
            listener,
            session,
            remote_host,
            remote_port,
            stats,
            cancel,
            tracker,
        ));

        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.lifecycle.stop_and_drain("local forwarder").await
    }

    fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("addr lock poisoned")
    }
}

// ---------------------------------------------------------------------------
// Remote (reverse) forwarding
// ---------------------------------------------------------------------------

/// Asks the SSH peer to listen; each inbound stream is paired with a fresh
/// TCP connection to the local target.
pub struct RemoteForwarder {
    remote_port: u16,
    local_port: u16,
    session: Arc<dyn RemoteBind>,
    stats: Arc<ForwarderStats>,
    lifecycle: Lifecycle,
}

/// All-interfaces bind on the peer, matching `ssh -R 0.0.0.0:...`
const REMOTE_BIND_ADDR: &str = "0.0.0.0";

impl RemoteForwarder {
    pub fn new(spec: &TunnelSpec, session: Arc<dyn RemoteBind>) -> Result<Self> {
        if spec.tunnel_type != TunnelType::Remote {
            return Err(Error::Internal(format!(
                "invalid tunnel type for remote forwarder: {}",
                spec.tunnel_type
            )));
        }
        if spec.remote_port == 0 || spec.local_port == 0 {
            return Err(Error::validation(
                "remote and local ports are required for remote forwarding",
                vec![
                    tunneld_common::FieldIssue::new("remotePort", "must be between 1 and 65535"),
                    tunneld_common::FieldIssue::new("localPort", "must be between 1 and 65535"),
                ],
            ));
        }

        Ok(Self {
            remote_port: spec.remote_port,
            local_port: spec.local_port,
            session,
            stats: ForwarderStats::new(),
            lifecycle: Lifecycle::new(),
        })
    }

    async fn accept_loop(
        mut incoming: mpsc::UnboundedReceiver<ForwardedStream>,
        local_port: u16,
        stats: Arc<ForwarderStats>,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) {
        loop {
            let forwarded = tokio::select! {
                _ = cancel.cancelled() => return,
                received = incoming.recv() => match received {
                    Some(f) => f,
                    // Sender dropped: the session rebuilt or closed its wire
                    None => return,
                },
            };
            debug!(
                "inbound remote-forward connection from {}",
                forwarded.originator
            );

            let stats = stats.clone();
            tracker.spawn(async move {
                stats.connections.fetch_add(1, Ordering::Relaxed);
                stats.active_conns.fetch_add(1, Ordering::Relaxed);

                let target = format!("127.0.0.1:{}", local_port);
                match TcpStream::connect(&target).await {
                    Ok(local) => proxy(forwarded.stream, local, &stats).await,
                    Err(e) => {
                        stats.record_error();
                        debug!("dial local target {} failed: {}", target, e);
                    }
                }

                stats.active_conns.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }
}

#[async_trait::async_trait]
impl Forwarder for RemoteForwarder {
    async fn start(&self) -> Result<()> {
        self.lifecycle.begin_start()?;

        if !self.session.is_connected().await {
            return Err(Error::Connection("session not connected".into()));
        }

        let remote = self
            .session
            .bind_remote(REMOTE_BIND_ADDR, self.remote_port)
            .await?;
        if remote.bound_port != self.remote_port {
            warn!(
                "requested remote port {} but server bound {}",
                self.remote_port, remote.bound_port
            );
        }

        info!(
            "remote forward bound on peer {}:{} -> 127.0.0.1:{}",
            REMOTE_BIND_ADDR, remote.bound_port, self.local_port
        );

        let stats = self.stats.clone();
        let local_port = self.local_port;
        let cancel = self.lifecycle.cancel.clone();
        let tracker = self.lifecycle.tracker.clone();
        tokio::spawn(Self::accept_loop(
            remote.incoming,
            local_port,
            stats,
            cancel,
            tracker,
        ));

        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let first = !self.lifecycle.stopped.load(Ordering::SeqCst);
        let result = self.lifecycle.stop_and_drain("remote forwarder").await;
        if first {
            self.session
                .cancel_remote(REMOTE_BIND_ADDR, self.remote_port)
                .await;
        }
        result
    }

    fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

// ---------------------------------------------------------------------------
// Dynamic (SOCKS5) forwarding
// ---------------------------------------------------------------------------

mod socks5 {
    pub const VERSION: u8 = 0x05;
    pub const METHOD_NO_AUTH: u8 = 0x00;
    pub const CMD_CONNECT: u8 = 0x01;
    pub const ATYP_IPV4: u8 = 0x01;
    pub const ATYP_DOMAIN: u8 = 0x03;
    pub const ATYP_IPV6: u8 = 0x04;
    pub const REP_SUCCESS: u8 = 0x00;
    pub const REP_HOST_UNREACHABLE: u8 = 0x04;
    pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
    pub const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;
}

/// Local SOCKS5 proxy; the destination is chosen per client request and
/// dialed through the session.
pub struct DynamicForwarder {
    bind_address: String,
    local_port: u16,
    session: Arc<dyn SessionDialer>,
    stats: Arc<ForwarderStats>,
    local_addr: StdMutex<Option<SocketAddr>>,
    lifecycle: Lifecycle,
}

impl DynamicForwarder {
    pub fn new(spec: &TunnelSpec, session: Arc<dyn SessionDialer>) -> Result<Self> {
        if spec.tunnel_type != TunnelType::Dynamic {
            return Err(Error::Internal(format!(
                "invalid tunnel type for dynamic forwarder: {}",
                spec.tunnel_type
            )));
        }

        Ok(Self {
            bind_address: spec.local_bind_address.clone(),
            local_port: spec.local_port,
            session,
            stats: ForwarderStats::new(),
            local_addr: StdMutex::new(None),
            lifecycle: Lifecycle::new(),
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        session: Arc<dyn SessionDialer>,
        stats: Arc<ForwarderStats>,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) {
        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => return,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        if cancel.is_cancelled() {
                            return;
                        }
                        stats.record_error();
                        warn!("accept failed: {}", e);
                        continue;
                    }
                },
            };
            debug!("accepted SOCKS5 client {}", peer);

            let session = session.clone();
            let stats = stats.clone();
            tracker.spawn(async move {
                stats.connections.fetch_add(1, Ordering::Relaxed);
                stats.active_conns.fetch_add(1, Ordering::Relaxed);

                if let Err(e) = handle_socks5(stream, session, &stats).await {
                    stats.record_error();
                    debug!("SOCKS5 connection from {} failed: {}", peer, e);
                }

                stats.active_conns.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }
}

async fn handle_socks5(
    mut client: TcpStream,
    session: Arc<dyn SessionDialer>,
    stats: &ForwarderStats,
) -> Result<()> {
    if !session.is_connected().await {
        return Err(Error::Connection("session not connected".into()));
    }

    let (host, port) = socks5_handshake(&mut client).await?;

    let remote = match session.dial(&host, port).await {
        Ok(stream) => stream,
        Err(e) => {
            socks5_reply(&mut client, socks5::REP_HOST_UNREACHABLE).await?;
            return Err(e);
        }
    };

    socks5_reply(&mut client, socks5::REP_SUCCESS).await?;
    proxy(client, remote, stats).await;
    Ok(())
}

/// Run the server side of the SOCKS5 handshake and return the requested
/// destination. Each protocol field is read with an exact-size read.
async fn socks5_handshake(client: &mut TcpStream) -> Result<(String, u16)> {
    // Greeting: VER | NMETHODS | METHODS...
    let mut greeting = [0u8; 2];
    client
        .read_exact(&mut greeting)
        .await
        .map_err(|e| Error::Protocol(format!("read greeting: {}", e)))?;
    if greeting[0] != socks5::VERSION {
        return Err(Error::Protocol(format!(
            "unsupported SOCKS version: {}",
            greeting[0]
        )));
    }
    let mut methods = vec![0u8; greeting[1] as usize];
    client
        .read_exact(&mut methods)
        .await
        .map_err(|e| Error::Protocol(format!("read methods: {}", e)))?;

    // No authentication
    client
        .write_all(&[socks5::VERSION, socks5::METHOD_NO_AUTH])
        .await
        .map_err(|e| Error::Protocol(format!("write method selection: {}", e)))?;

    // Request: VER | CMD | RSV | ATYP
    let mut request = [0u8; 4];
    client
        .read_exact(&mut request)
        .await
        .map_err(|e| Error::Protocol(format!("read request: {}", e)))?;
    if request[0] != socks5::VERSION {
        return Err(Error::Protocol(format!(
            "invalid SOCKS version in request: {}",
            request[0]
        )));
    }
    if request[1] != socks5::CMD_CONNECT {
        socks5_reply(client, socks5::REP_CMD_NOT_SUPPORTED).await?;
        return Err(Error::Protocol(format!(
            "unsupported command: {}",
            request[1]
        )));
    }

    let host = match request[3] {
        socks5::ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            client
                .read_exact(&mut octets)
                .await
                .map_err(|e| Error::Protocol(format!("read IPv4 address: {}", e)))?;
            std::net::Ipv4Addr::from(octets).to_string()
        }
        socks5::ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            client
                .read_exact(&mut len)
                .await
                .map_err(|e| Error::Protocol(format!("read domain length: {}", e)))?;
            let mut domain = vec![0u8; len[0] as usize];
            client
                .read_exact(&mut domain)
                .await
                .map_err(|e| Error::Protocol(format!("read domain: {}", e)))?;
            String::from_utf8_lossy(&domain).into_owned()
        }
        socks5::ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            client
                .read_exact(&mut octets)
                .await
                .map_err(|e| Error::Protocol(format!("read IPv6 address: {}", e)))?;
            std::net::Ipv6Addr::from(octets).to_string()
        }
        other => {
            socks5_reply(client, socks5::REP_ATYP_NOT_SUPPORTED).await?;
            return Err(Error::Protocol(format!(
                "unsupported address type: {}",
                other
            )));
        }
    };

    let mut port_bytes = [0u8; 2];
    client
        .read_exact(&mut port_bytes)
        .await
        .map_err(|e| Error::Protocol(format!("read port: {}", e)))?;

    Ok((host, u16::from_be_bytes(port_bytes)))
}

/// VER | REP | RSV | ATYP=IPv4 | BND.ADDR 0.0.0.0 | BND.PORT 0
async fn socks5_reply(client: &mut TcpStream, code: u8) -> Result<()> {
    let reply = [
        socks5::VERSION,
        code,
        0x00,
        socks5::ATYP_IPV4,
        0,
        0,
        0,
        0,
        0,
        0,
    ];
    client
        .write_all(&reply)
        .await
        .map_err(|e| Error::Protocol(format!("write reply: {}", e)))
}

#[async_trait::async_trait]
impl Forwarder for DynamicForwarder {
    async fn start(&self) -> Result<()> {
        self.lifecycle.begin_start()?;

        let addr = format_host_port(&self.bind_address, self.local_port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| listener_bind_error(&addr, e))?;
        let bound = listener
            .local_addr()
            .map_err(|e| Error::Internal(format!("local_addr: {}", e)))?;
        *self.local_addr.lock().expect("addr lock poisoned") = Some(bound);

        info!("SOCKS5 proxy listening on {}", bound);

        let session = self.session.clone();
        let stats = self.stats.clone();
        let cancel = self.lifecycle.cancel.clone();
        let tracker = self.lifecycle.tracker.clone();
        tokio::spawn(Self::accept_loop(listener, session, stats, cancel, tracker));

        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.lifecycle.stop_and_drain("dynamic forwarder").await
    }

    fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("addr lock poisoned")
    }
}
