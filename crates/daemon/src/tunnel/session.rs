// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunneld Contributors

// Tunneld - Session Module
// SSH client state machines: dial, authenticate, keep-alive, reconnect,
// and dial-through for multi-hop chains

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use russh::client::{self, Handle, Msg};
use russh::keys::PublicKey;
use russh::Channel;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tunneld_common::{format_host_port, Error, HostKeyMode, Hop, Result};

use super::authenticator::MultiAuthenticator;
use super::forward::{BoxedStream, RemoteBind, RemoteIncoming, SessionDialer};
use crate::known_hosts::{fingerprint, KnownHosts, VerifyResult};

/// Exponential backoff parameters for reconnection
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

/// Next sleep after a failed attempt, capped at the configured maximum
fn next_backoff(current: Duration, config: &BackoffConfig) -> Duration {
    let next = current.mul_f64(config.multiplier);
    next.min(config.max)
}

/// Called from the keep-alive task when the connection is lost
pub type DisconnectCallback = Arc<dyn Fn(&str) + Send + Sync>;
/// Called after a successful background reconnect
pub type ReconnectCallback = Arc<dyn Fn() + Send + Sync>;

/// Configuration for one SSH session
#[derive(Clone)]
pub struct SessionConfig {
    pub keep_alive: Duration,
    pub auto_reconnect: bool,
    pub max_retries: u32,
    /// Dial timeout for the TCP + SSH handshake
    pub timeout: Duration,
    pub backoff: BackoffConfig,
    pub on_disconnect: Option<DisconnectCallback>,
    pub on_reconnect: Option<ReconnectCallback>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(30),
            auto_reconnect: false,
            max_retries: 3,
            timeout: Duration::from_secs(10),
            backoff: BackoffConfig::default(),
            on_disconnect: None,
            on_reconnect: None,
        }
    }
}

/// An inbound stream delivered by the SSH peer for a remote forward
pub struct ForwardedStream {
    pub stream: BoxedStream,
    pub connected_port: u16,
    pub originator: String,
}

type SharedHandle = Arc<Mutex<Handle<ClientHandler>>>;

struct SessionState {
    connected: bool,
    client: Option<SharedHandle>,
    connected_at: Option<DateTime<Utc>>,
    retry_count: u32,
    last_error: Option<String>,
    /// Token owned by the currently-running keep-alive task
    keepalive_stop: Option<CancellationToken>,
}

/// Snapshot of a session's connection state
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub connected: bool,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub retry_count: u32,
    pub host: String,
    pub port: u16,
    pub user: String,
}

/// One SSH wire connection to one hop
pub struct Session {
    hop: Hop,
    config: SessionConfig,
    known_hosts_path: PathBuf,
    state: Mutex<SessionState>,
    /// Receiver side of the peer's forwarded-tcpip channels; taken by a
    /// RemoteForwarder via bind_remote
    forwarded: Mutex<Option<mpsc::UnboundedReceiver<ForwardedStream>>>,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(hop: Hop, config: SessionConfig, known_hosts_path: PathBuf) -> Arc<Self> {
        Self::with_cancel(hop, config, known_hosts_path, CancellationToken::new())
    }

    pub fn with_cancel(
        hop: Hop,
        config: SessionConfig,
        known_hosts_path: PathBuf,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            hop,
            config,
            known_hosts_path,
            state: Mutex::new(SessionState {
                connected: false,
                client: None,
                connected_at: None,
                retry_count: 0,
                last_error: None,
                keepalive_stop: None,
            }),
            forwarded: Mutex::new(None),
            cancel,
        })
    }

    pub fn hop(&self) -> &Hop {
        &self.hop
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.connected
    }

    fn ssh_config(&self) -> Arc<client::Config> {
        let mut cfg = client::Config::default();
        // The keep-alive loop below owns liveness probing
        cfg.keepalive_interval = None;
        cfg.nodelay = true;
        Arc::new(cfg)
    }

    fn new_handler(&self) -> (ClientHandler, mpsc::UnboundedReceiver<ForwardedStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ClientHandler {
                host: self.hop.host.clone(),
                port: self.hop.port,
                mode: self.hop.host_key,
                known_hosts_path: self.known_hosts_path.clone(),
                forwarded_tx: tx,
            },
            rx,
        )
    }

    /// Dial and authenticate. A no-op when already connected.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Connection("session is closed".into()));
        }
        if self.is_connected().await {
            return Ok(());
        }

        let addr = format_host_port(&self.hop.host, self.hop.port);
        let (handler, forwarded_rx) = self.new_handler();

        debug!("connecting to {}", addr);
        let handle = match tokio::time::timeout(
            self.config.timeout,
            client::connect(self.ssh_config(), &addr, handler),
        )
        .await
        {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => return Err(self.record_error(map_connect_error(e, &addr)).await),
            Err(_) => {
                return Err(self
                    .record_error(Error::Timeout(format!(
                        "dial {} timed out after {:?}",
                        addr, self.config.timeout
                    )))
                    .await)
            }
        };

        self.finish_connect(handle, forwarded_rx).await
    }

    /// Same as `connect`, but over an already-established stream. This is
    /// how hop N+1 rides on hop N's wire.
    pub async fn connect_over_stream<S>(self: &Arc<Self>, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return Err(Error::Connection("session is closed".into()));
        }
        if self.is_connected().await {
            return Ok(());
        }

        let addr = format_host_port(&self.hop.host, self.hop.port);
        let (handler, forwarded_rx) = self.new_handler();

        debug!("establishing ssh over existing stream to {}", addr);
        let handle = match tokio::time::timeout(
            self.config.timeout,
            client::connect_stream(self.ssh_config(), stream, handler),
        )
        .await
        {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => return Err(self.record_error(map_connect_error(e, &addr)).await),
            Err(_) => {
                return Err(self
                    .record_error(Error::Timeout(format!(
                        "ssh handshake with {} timed out after {:?}",
                        addr, self.config.timeout
                    )))
                    .await)
            }
        };

        self.finish_connect(handle, forwarded_rx).await
    }

    async fn finish_connect(
        self: &Arc<Self>,
        mut handle: Handle<ClientHandler>,
        forwarded_rx: mpsc::UnboundedReceiver<ForwardedStream>,
    ) -> Result<()> {
        let auth = MultiAuthenticator::for_hop(&self.hop)?;
        if let Err(e) = auth
            .authenticate(&mut handle, &self.hop.user, &self.hop.host)
            .await
        {
            return Err(self.record_error(e).await);
        }

        let keepalive_stop = self.cancel.child_token();
        {
            let mut state = self.state.lock().await;
            if let Some(stale) = state.keepalive_stop.take() {
                stale.cancel();
            }
            state.client = Some(Arc::new(Mutex::new(handle)));
            state.connected = true;
            state.connected_at = Some(Utc::now());
            state.retry_count = 0;
            state.last_error = None;
            state.keepalive_stop = Some(keepalive_stop.clone());
        }
        *self.forwarded.lock().await = Some(forwarded_rx);

        info!(
            "ssh session established to {}@{}",
            self.hop.user,
            format_host_port(&self.hop.host, self.hop.port)
        );

        let session = self.clone();
        tokio::spawn(async move { session.keep_alive_loop(keepalive_stop).await });

        Ok(())
    }

    /// Connect with exponential backoff, up to max_retries + 1 attempts.
    /// Aborts early when the session is closed.
    pub async fn connect_with_retry(self: &Arc<Self>) -> Result<()> {
        let mut backoff = self.config.backoff.initial;
        let mut last_error: Option<Error> = None;

        for attempt in 0..=self.config.max_retries {
            if self.cancel.is_cancelled() {
                return Err(Error::Connection("session is closed".into()));
            }

            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    {
                        let mut state = self.state.lock().await;
                        state.retry_count = attempt + 1;
                    }
                    warn!(
                        "connect attempt {}/{} to {} failed: {}",
                        attempt + 1,
                        self.config.max_retries + 1,
                        self.hop.host,
                        e
                    );
                    last_error = Some(e);
                }
            }

            if attempt < self.config.max_retries {
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {
                        backoff = next_backoff(backoff, &self.config.backoff);
                    }
                    _ = self.cancel.cancelled() => {
                        return Err(Error::Connection("session is closed".into()));
                    }
                }
            }
        }

        Err(Error::Connection(format!(
            "connection failed after {} attempts: {}",
            self.config.max_retries + 1,
            last_error.map_or_else(|| "unknown error".to_string(), |e| e.to_string())
        )))
    }

    /// Stop the keep-alive loop and close the wire connection
    pub async fn disconnect(&self) -> Result<()> {
        let client = {
            let mut state = self.state.lock().await;
            if let Some(stop) = state.keepalive_stop.take() {
                stop.cancel();
            }
            state.connected = false;
            state.connected_at = None;
            state.client.take()
        };

        if let Some(client) = client {
            let handle = client.lock().await;
            if let Err(e) = handle
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await
            {
                debug!("graceful disconnect from {} failed: {}", self.hop.host, e);
            }
        }
        Ok(())
    }

    /// Disconnect and cancel the session's background tasks for good
    pub async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        self.disconnect().await
    }

    pub async fn status(&self) -> SessionStatus {
        let state = self.state.lock().await;
        SessionStatus {
            connected: state.connected,
            connected_at: state.connected_at,
            last_error: state.last_error.clone(),
            retry_count: state.retry_count,
            host: self.hop.host.clone(),
            port: self.hop.port,
            user: self.hop.user.clone(),
        }
    }

    async fn record_error(&self, err: Error) -> Error {
        let mut state = self.state.lock().await;
        state.last_error = Some(err.to_string());
        err
    }

    async fn current_client(&self) -> Option<SharedHandle> {
        self.state.lock().await.client.clone()
    }

    /// Open a stream from the remote side of this session to host:port
    pub async fn dial_remote(&self, host: &str, port: u16) -> Result<BoxedStream> {
        let client = self
            .current_client()
            .await
            .ok_or_else(|| Error::Connection("session not connected".into()))?;

        let channel = {
            let handle = client.lock().await;
            handle
                .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
                .await
                .map_err(|e| {
                    Error::Connection(format!("open channel to {}:{}: {}", host, port, e))
                })?
        };

        Ok(Box::new(channel.into_stream()))
    }

    /// Keep-alive loop: one wire-level probe per interval. On failure the
    /// disconnect callback fires and, when enabled, a reconnect is spawned.
    async fn keep_alive_loop(self: Arc<Self>, stop: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.keep_alive);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // interval fires immediately; the first probe should wait a full period
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(reason) = self.probe().await {
                        self.on_keepalive_failure(reason).await;
                        return;
                    }
                }
            }
        }
    }

    async fn probe(&self) -> std::result::Result<(), String> {
        let client = self
            .current_client()
            .await
            .ok_or_else(|| "client not connected".to_string())?;

        let handle = client.lock().await;
        if handle.is_closed() {
            return Err("session closed by peer".to_string());
        }
        handle
            .send_keepalive(true)
            .await
            .map_err(|e| format!("keep-alive failed: {}", e))
    }

    async fn on_keepalive_failure(self: &Arc<Self>, reason: String) {
        warn!("keep-alive lost for {}: {}", self.hop.host, reason);
        {
            let mut state = self.state.lock().await;
            state.connected = false;
            state.last_error = Some(reason.clone());
        }

        if let Some(cb) = &self.config.on_disconnect {
            cb(&reason);
        }

        if self.config.auto_reconnect {
            let session = self.clone();
            tokio::spawn(async move { session.reconnect().await });
        }
    }

    /// Guarded reconnect: returns immediately when already connected or when
    /// another reconnect is underway (retry_count > 0).
    async fn reconnect(self: Arc<Self>) {
        let old_client = {
            let mut state = self.state.lock().await;
            if state.connected || state.retry_count > 0 {
                return;
            }
            state.client.take()
        };

        if let Some(client) = old_client {
            let handle = client.lock().await;
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await;
        }

        match self.connect_with_retry().await {
            Ok(()) => {
                info!("reconnected to {}", self.hop.host);
                if let Some(cb) = &self.config.on_reconnect {
                    cb();
                }
            }
            Err(e) => {
                let msg = format!("reconnect failed: {}", e);
                {
                    let mut state = self.state.lock().await;
                    state.last_error = Some(msg.clone());
                }
                if let Some(cb) = &self.config.on_disconnect {
                    cb(&msg);
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl SessionDialer for Session {
    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream> {
        self.dial_remote(host, port).await
    }

    async fn is_connected(&self) -> bool {
        Session::is_connected(self).await
    }
}

#[async_trait::async_trait]
impl RemoteBind for Session {
    async fn bind_remote(&self, address: &str, port: u16) -> Result<RemoteIncoming> {
        let client = self
            .current_client()
            .await
            .ok_or_else(|| Error::Connection("session not connected".into()))?;

        let bound = {
            let mut handle = client.lock().await;
            handle
                .tcpip_forward(address, u32::from(port))
                .await
                .map_err(|e| match e {
                    russh::Error::RequestDenied => Error::Resource(format!(
                        "remote bind {}:{} denied (port in use or server policy)",
                        address, port
                    )),
                    other => Error::Connection(format!(
                        "tcpip-forward {}:{}: {}",
                        address, port, other
                    )),
                })?
        };

        let incoming = self
            .forwarded
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Internal("forwarded stream already claimed".into()))?;

        // The server may assign its own port when 0 was requested
        let bound_port = u16::try_from(bound).ok().filter(|p| *p != 0).unwrap_or(port);
        Ok(RemoteIncoming {
            bound_port,
            incoming,
        })
    }

    async fn cancel_remote(&self, address: &str, port: u16) {
        if let Some(client) = self.current_client().await {
            let mut handle = client.lock().await;
            if let Err(e) = handle.cancel_tcpip_forward(address, u32::from(port)).await {
                debug!("cancel-tcpip-forward {}:{}: {}", address, port, e);
            }
        }
    }

    async fn is_connected(&self) -> bool {
        Session::is_connected(self).await
    }
}

/// Map a russh connect error onto the wire taxonomy
fn map_connect_error(err: russh::Error, addr: &str) -> Error {
    match err {
        russh::Error::UnknownKey => Error::HostKey {
            host: addr.to_string(),
            reason: "server key rejected by verification policy".into(),
        },
        russh::Error::NoAuthMethod | russh::Error::NotAuthenticated => {
            Error::Authentication(format!("no usable authentication for {}", addr))
        }
        other => Error::Connection(format!("dial {}: {}", addr, other)),
    }
}

/// russh client handler: host-key policy plus forwarded-tcpip intake
pub struct ClientHandler {
    host: String,
    port: u16,
    mode: HostKeyMode,
    known_hosts_path: PathBuf,
    forwarded_tx: mpsc::UnboundedSender<ForwardedStream>,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        match self.mode {
            HostKeyMode::Insecure => Ok(true),
            HostKeyMode::Strict | HostKeyMode::KnownHosts => {
                let mut known_hosts =
                    KnownHosts::load(&self.known_hosts_path).map_err(|e| {
                        russh::Error::from(std::io::Error::other(format!(
                            "failed to load known_hosts: {}",
                            e
                        )))
                    })?;

                match known_hosts.verify(&self.host, self.port, server_public_key) {
                    VerifyResult::Trusted => Ok(true),
                    VerifyResult::Unknown => {
                        if self.mode == HostKeyMode::Strict {
                            warn!(
                                "unknown host key for {}:{} ({}), refusing under strict mode",
                                self.host,
                                self.port,
                                fingerprint(server_public_key)
                            );
                            return Ok(false);
                        }
                        // known-hosts mode records first-seen keys
                        known_hosts.add(&self.host, self.port, server_public_key);
                        known_hosts.save().map_err(|e| {
                            russh::Error::from(std::io::Error::other(format!(
                                "failed to save known_hosts: {}",
                                e
                            )))
                        })?;
                        info!(
                            "recorded new host key for {}:{} ({})",
                            self.host,
                            self.port,
                            fingerprint(server_public_key)
                        );
                        Ok(true)
                    }
                    VerifyResult::Mismatch {
                        actual_fingerprint,
                        line_number,
                    } => {
                        warn!(
                            "HOST KEY MISMATCH for {}:{}: presented {}, known_hosts line {} disagrees",
                            self.host, self.port, actual_fingerprint, line_number
                        );
                        Ok(false)
                    }
                }
            }
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        debug!(
            "inbound forwarded stream for {}:{} from {}:{}",
            connected_address, connected_port, originator_address, originator_port
        );
        let forwarded = ForwardedStream {
            stream: Box::new(channel.into_stream()),
            connected_port: connected_port as u16,
            originator: format_host_port(originator_address, originator_port as u16),
        };
        // A dropped receiver means no forwarder is listening; discard
        let _ = self.forwarded_tx.send(forwarded);
        Ok(())
    }
}

/// Chain of sessions where hop i+1 is dialed through hop i
pub struct MultiHopSession {
    hops: Vec<Arc<Session>>,
    cancel: CancellationToken,
}

impl MultiHopSession {
    pub fn new(
        hops: &[Hop],
        config: SessionConfig,
        known_hosts_path: PathBuf,
    ) -> Result<Arc<Self>> {
        if hops.is_empty() {
            return Err(Error::validation(
                "at least one hop is required",
                vec![tunneld_common::FieldIssue::new("hops", "must not be empty")],
            ));
        }

        let cancel = CancellationToken::new();
        let sessions = hops
            .iter()
            .map(|hop| {
                Session::with_cancel(
                    hop.clone(),
                    config.clone(),
                    known_hosts_path.clone(),
                    cancel.child_token(),
                )
            })
            .collect();

        Ok(Arc::new(Self {
            hops: sessions,
            cancel,
        }))
    }

    /// Connect hop 0 directly, then each further hop through its predecessor.
    /// On failure, everything already opened is closed before returning.
    pub async fn connect(&self) -> Result<()> {
        if let Err(e) = self.connect_chain().await {
            let _ = self.close_sessions().await;
            return Err(e);
        }
        Ok(())
    }

    async fn connect_chain(&self) -> Result<()> {
        self.hops[0].connect_with_retry().await.map_err(|e| {
            Error::Connection(format!("hop 0 ({}): {}", self.hops[0].hop().host, e))
        })?;

        for i in 1..self.hops.len() {
            let prev = &self.hops[i - 1];
            let current = &self.hops[i];
            let hop = current.hop();

            let stream = prev.dial_remote(&hop.host, hop.port).await.map_err(|e| {
                Error::Connection(format!("dial hop {} through hop {}: {}", i, i - 1, e))
            })?;

            current.connect_over_stream(stream).await.map_err(|e| {
                Error::Connection(format!("hop {} ({}): {}", i, hop.host, e))
            })?;
        }

        Ok(())
    }

    /// The final hop's session, the chain's exit point
    pub fn last_hop(&self) -> Arc<Session> {
        self.hops[self.hops.len() - 1].clone()
    }

    pub async fn all_connected(&self) -> bool {
        for session in &self.hops {
            if !session.is_connected().await {
                return false;
            }
        }
        true
    }

    pub async fn status(&self) -> Vec<SessionStatus> {
        let mut statuses = Vec::with_capacity(self.hops.len());
        for session in &self.hops {
            statuses.push(session.status().await);
        }
        statuses
    }

    async fn close_sessions(&self) -> Result<()> {
        let mut errors = Vec::new();
        for (i, session) in self.hops.iter().enumerate() {
            if let Err(e) = session.close().await {
                errors.push(format!("hop {}: {}", i, e));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Connection(format!(
                "errors closing chain: {}",
                errors.join("; ")
            )))
        }
    }

    pub async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        self.close_sessions().await
    }
}

#[async_trait::async_trait]
impl SessionDialer for MultiHopSession {
    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream> {
        // The chain is already wired hop to hop; the last hop reaches the
        // destination and the bytes ride back through every predecessor.
        self.last_hop().dial_remote(host, port).await
    }

    async fn is_connected(&self) -> bool {
        self.all_connected().await
    }
}

#[async_trait::async_trait]
impl RemoteBind for MultiHopSession {
    async fn bind_remote(&self, address: &str, port: u16) -> Result<RemoteIncoming> {
        RemoteBind::bind_remote(self.last_hop().as_ref(), address, port).await
    }

    async fn cancel_remote(&self, address: &str, port: u16) {
        RemoteBind::cancel_remote(self.last_hop().as_ref(), address, port).await;
    }

    async fn is_connected(&self) -> bool {
        self.all_connected().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunneld_common::AuthMethod;

    fn test_hop() -> Hop {
        Hop {
            host: "127.0.0.1".into(),
            port: 1,
            user: "nobody".into(),
            auth_method: AuthMethod::Password,
            key_id: None,
            password: Some("x".into()),
            host_key: HostKeyMode::Insecure,
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let config = BackoffConfig::default();
        let b1 = next_backoff(config.initial, &config);
        assert_eq!(b1, Duration::from_secs(2));
        let b2 = next_backoff(b1, &config);
        assert_eq!(b2, Duration::from_secs(4));

        let capped = next_backoff(Duration::from_secs(50), &config);
        assert_eq!(capped, Duration::from_secs(60));
        assert_eq!(next_backoff(capped, &config), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn dial_before_connect_fails_deterministically() {
        let session = Session::new(test_hop(), SessionConfig::default(), PathBuf::from("/dev/null"));
        let err = session.dial_remote("10.0.0.1", 80).await.unwrap_err();
        assert_eq!(err.code(), "CONNECTION_FAILED");
        assert!(err.to_string().contains("not connected"));
    }

    #[tokio::test]
    async fn connect_to_closed_port_reports_connection_error() {
        // Port 1 is essentially always closed; refusal is immediate
        let config = SessionConfig {
            max_retries: 0,
            timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let session = Session::new(test_hop(), config, PathBuf::from("/dev/null"));
        let err = session.connect_with_retry().await.unwrap_err();
        assert!(err.to_string().contains("connection"));

        let status = session.status().await;
        assert!(!status.connected);
        assert_eq!(status.retry_count, 1);
    }

    #[tokio::test]
    async fn close_aborts_pending_retries() {
        let config = SessionConfig {
            max_retries: 50,
            timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let session = Session::new(test_hop(), config, PathBuf::from("/dev/null"));

        let runner = {
            let session = session.clone();
            tokio::spawn(async move { session.connect_with_retry().await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        session.close().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("retry loop did not observe close")
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn multi_hop_requires_hops() {
        let err =
            MultiHopSession::new(&[], SessionConfig::default(), PathBuf::from("/dev/null"))
                .err()
                .expect("empty chain must be rejected");
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn multi_hop_partial_failure_closes_chain() {
        let chain = MultiHopSession::new(
            &[test_hop(), test_hop()],
            SessionConfig {
                max_retries: 0,
                ..Default::default()
            },
            PathBuf::from("/dev/null"),
        )
        .unwrap();

        let err = chain.connect().await.unwrap_err();
        assert!(err.to_string().contains("hop 0"));
        assert!(!chain.all_connected().await);
    }
}
