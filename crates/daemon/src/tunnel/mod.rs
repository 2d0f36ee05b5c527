// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunneld Contributors

// Tunneld - Tunnel Module
// Tunnel lifecycle and the manager registry coordinating sessions,
// forwarders, circuit breakers, persistence, and status push

pub mod authenticator;
pub mod circuit;
pub mod forward;
pub mod session;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tunneld_common::{Error, Result, TunnelEvent, TunnelSpec, TunnelState, TunnelStatus, TunnelType};

use crate::storage::SqliteStore;
use circuit::{BreakerConfig, TunnelBreakers};
use forward::{DynamicForwarder, Forwarder, LocalForwarder, RemoteBind, RemoteForwarder, SessionDialer};
use session::{BackoffConfig, MultiHopSession, Session, SessionConfig};

/// Dial timeout used for every tunnel connect
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

struct TunnelShared {
    spec: TunnelSpec,
    status: TunnelStatus,
    session: Option<Arc<Session>>,
    multi: Option<Arc<MultiHopSession>>,
    forwarder: Option<Arc<dyn Forwarder>>,
}

/// One live tunnel: its spec, status, and data-plane references,
/// all guarded by a single per-tunnel lock.
pub struct Tunnel {
    pub created_at: DateTime<Utc>,
    /// The spec originally asked for an ephemeral port; each start binds anew
    ephemeral_port: bool,
    shared: StdMutex<TunnelShared>,
}

impl Tunnel {
    fn new(spec: TunnelSpec) -> Arc<Self> {
        let status = TunnelStatus::new(&spec.id);
        let ephemeral_port = spec.local_port == 0;
        Arc::new(Self {
            created_at: Utc::now(),
            ephemeral_port,
            shared: StdMutex::new(TunnelShared {
                status,
                spec,
                session: None,
                multi: None,
                forwarder: None,
            }),
        })
    }

    fn from_storage(spec: TunnelSpec) -> Arc<Self> {
        let tunnel = Self::new(spec);
        tunnel
            .shared
            .lock()
            .expect("tunnel lock poisoned")
            .status
            .state = TunnelState::Stopped;
        tunnel
    }

    pub fn id(&self) -> String {
        self.lock().spec.id.clone()
    }

    pub fn spec(&self) -> TunnelSpec {
        self.lock().spec.clone()
    }

    /// Status snapshot with byte counters refreshed from the forwarder
    pub fn status(&self) -> TunnelStatus {
        let mut shared = self.lock();
        if let Some(forwarder) = &shared.forwarder {
            let stats = forwarder.stats();
            shared.status.bytes_sent = stats.bytes_sent;
            shared.status.bytes_received = stats.bytes_received;
        }
        shared.status.clone()
    }

    /// Active-connection count from the forwarder, when one is running
    pub fn active_connections(&self) -> u64 {
        self.lock()
            .forwarder
            .as_ref()
            .map(|f| f.stats().active_conns)
            .unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TunnelShared> {
        self.shared.lock().expect("tunnel lock poisoned")
    }

    /// Serialize a state change under the tunnel lock. The connected-at
    /// timestamp is set once on the first Active and cleared only by Stop.
    fn update_status(&self, state: TunnelState, error: &str) -> TunnelStatus {
        let mut shared = self.lock();
        shared.status.state = state;
        shared.status.last_error = error.to_string();

        match state {
            TunnelState::Active if shared.status.connected_at.is_none() => {
                shared.status.connected_at = Some(Utc::now());
            }
            TunnelState::Stopped => {
                shared.status.connected_at = None;
            }
            _ => {}
        }

        if let Some(forwarder) = &shared.forwarder {
            let stats = forwarder.stats();
            shared.status.bytes_sent = stats.bytes_sent;
            shared.status.bytes_received = stats.bytes_received;
        }

        shared.status.clone()
    }

    fn set_retry_count(&self, count: u32) {
        self.lock().status.retry_count = count;
    }

    fn set_session(&self, session: Arc<Session>) {
        self.lock().session = Some(session);
    }

    fn set_multi(&self, multi: Arc<MultiHopSession>) {
        self.lock().multi = Some(multi);
    }

    fn set_forwarder(&self, forwarder: Arc<dyn Forwarder>) {
        self.lock().forwarder = Some(forwarder);
    }

    fn set_bound_port(&self, port: u16) {
        let mut shared = self.lock();
        shared.spec.local_port = port;
        shared.spec.updated_at = Utc::now();
    }

    /// When the original request was for an ephemeral port, each start
    /// binds a fresh one
    fn bind_port(&self) -> u16 {
        if self.ephemeral_port {
            0
        } else {
            self.lock().spec.local_port
        }
    }

    /// Close and clear the data-plane references. Safe to call repeatedly
    /// and from any task; later callers find nothing left to close.
    async fn teardown(&self) -> Result<()> {
        let (forwarder, session, multi) = {
            let mut shared = self.lock();
            (
                shared.forwarder.take(),
                shared.session.take(),
                shared.multi.take(),
            )
        };

        let mut first_error: Option<Error> = None;

        if let Some(forwarder) = forwarder {
            if let Err(e) = forwarder.stop().await {
                first_error.get_or_insert(e);
            }
        }
        if let Some(session) = session {
            if let Err(e) = session.close().await {
                first_error.get_or_insert(e);
            }
        }
        if let Some(multi) = multi {
            if let Err(e) = multi.close().await {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Registry of tunnels: asynchronous create, stop/start/delete, background
/// reconnection propagation, persistence hooks, status push.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    tunnels: RwLock<HashMap<String, Arc<Tunnel>>>,
    storage: Option<Arc<SqliteStore>>,
    breakers: TunnelBreakers,
    event_tx: broadcast::Sender<TunnelEvent>,
    known_hosts_path: PathBuf,
    cancel: CancellationToken,
}

/// Counts reported by the health endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthCounts {
    pub total: usize,
    pub active: usize,
    pub failed: usize,
}

impl Manager {
    pub fn new(storage: Option<Arc<SqliteStore>>, known_hosts_path: PathBuf) -> Self {
        Self::with_breaker_config(storage, known_hosts_path, BreakerConfig::default())
    }

    pub fn with_breaker_config(
        storage: Option<Arc<SqliteStore>>,
        known_hosts_path: PathBuf,
        breaker_config: BreakerConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(ManagerInner {
                tunnels: RwLock::new(HashMap::new()),
                storage,
                breakers: TunnelBreakers::new(breaker_config),
                event_tx,
                known_hosts_path,
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Subscribe to status-change events
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Register a tunnel and kick off the background connect. Returns
    /// immediately; no network I/O happens on this path.
    pub async fn create(&self, spec: TunnelSpec) -> Result<()> {
        if spec.hops.is_empty() {
            return Err(Error::validation(
                "at least one hop is required",
                vec![tunneld_common::FieldIssue::new("hops", "must not be empty")],
            ));
        }

        let tunnel = {
            let mut tunnels = self.inner.tunnels.write().await;

            if tunnels.contains_key(&spec.id) {
                return Err(Error::Conflict(format!("tunnel {} already exists", spec.id)));
            }
            if tunnels.values().any(|t| t.lock().spec.name == spec.name) {
                return Err(Error::Conflict(format!(
                    "tunnel name '{}' already exists",
                    spec.name
                )));
            }

            // Storage first: a concurrent create with the same name hits the
            // unique constraint here instead of racing for the map slot
            if let Some(storage) = &self.inner.storage {
                storage.save(&spec, TunnelState::Pending.as_str())?;
            }

            let tunnel = Tunnel::new(spec);
            tunnels.insert(tunnel.id(), tunnel.clone());
            tunnel
        };

        info!("tunnel {} created, connecting in background", tunnel.id());
        self.publish(tunnel.status());

        let manager = self.clone();
        tokio::spawn(async move { manager.connect_tunnel(tunnel).await });

        Ok(())
    }

    /// Background connect path: circuit breaker gate, session build,
    /// forwarder build/start, then the Active (or Failed) transition.
    async fn connect_tunnel(&self, tunnel: Arc<Tunnel>) {
        let spec = tunnel.spec();
        let breaker = self.inner.breakers.get(&spec.id);

        if let Err(e) = breaker.allow() {
            warn!("tunnel {} refused by circuit breaker: {}", spec.id, e);
            self.transition(&tunnel, TunnelState::Failed, &e.to_string());
            return;
        }

        match self.initialize_tunnel(&tunnel, &spec).await {
            Ok(()) => {
                breaker.record_success();
                self.transition(&tunnel, TunnelState::Active, "");
                info!("tunnel {} is active", spec.id);
            }
            Err(e) => {
                breaker.record_failure();
                if let Err(teardown_err) = tunnel.teardown().await {
                    debug!("teardown after failed connect: {}", teardown_err);
                }
                error!("tunnel {} failed to connect: {}", spec.id, e);
                self.transition(&tunnel, TunnelState::Failed, &format!("Failed to connect: {}", e));
            }
        }
    }

    async fn initialize_tunnel(&self, tunnel: &Arc<Tunnel>, spec: &TunnelSpec) -> Result<()> {
        let session_config = self.session_config(spec, Arc::downgrade(tunnel));

        // Single hop gets a plain session; longer chains are dialed
        // hop-through-hop
        let dialer: Arc<dyn SessionDialer>;
        let remote_bind: Arc<dyn RemoteBind>;

        if spec.hops.len() == 1 {
            let session = Session::with_cancel(
                spec.hops[0].clone(),
                session_config,
                self.inner.known_hosts_path.clone(),
                self.inner.cancel.child_token(),
            );
            tunnel.set_session(session.clone());
            session.connect_with_retry().await?;
            dialer = session.clone();
            remote_bind = session;
        } else {
            let multi = MultiHopSession::new(
                &spec.hops,
                session_config,
                self.inner.known_hosts_path.clone(),
            )?;
            tunnel.set_multi(multi.clone());
            multi.connect().await?;
            dialer = multi.clone();
            remote_bind = multi;
        }

        let mut bind_spec = spec.clone();
        bind_spec.local_port = tunnel.bind_port();

        let forwarder: Arc<dyn Forwarder> = match spec.tunnel_type {
            TunnelType::Local => Arc::new(LocalForwarder::new(&bind_spec, dialer)?),
            TunnelType::Remote => Arc::new(RemoteForwarder::new(&bind_spec, remote_bind)?),
            TunnelType::Dynamic => Arc::new(DynamicForwarder::new(&bind_spec, dialer)?),
        };

        forwarder.start().await?;

        // Ephemeral bind resolved; write the real port back to the spec
        if let Some(addr) = forwarder.local_addr() {
            if addr.port() != spec.local_port {
                tunnel.set_bound_port(addr.port());
                if let Some(storage) = &self.inner.storage {
                    if let Err(e) = storage.save(&tunnel.spec(), TunnelState::Pending.as_str()) {
                        warn!("failed to persist bound port for {}: {}", spec.id, e);
                    }
                }
            }
        }

        tunnel.set_forwarder(forwarder);
        Ok(())
    }

    /// Session config derived from the spec, with the disconnect/reconnect
    /// callbacks marshalling state changes back onto the tunnel.
    fn session_config(&self, spec: &TunnelSpec, tunnel: Weak<Tunnel>) -> SessionConfig {
        let keep_alive = if spec.keep_alive == 0 {
            tunneld_common::default_keep_alive()
        } else {
            spec.keep_alive
        };

        let on_disconnect = {
            let manager = self.clone();
            let tunnel = tunnel.clone();
            Arc::new(move |err: &str| {
                let Some(tunnel) = tunnel.upgrade() else { return };
                let message = format!("connection lost: {}", err);
                manager.transition(&tunnel, TunnelState::Failed, &message);
            }) as session::DisconnectCallback
        };

        let on_reconnect = {
            let manager = self.clone();
            Arc::new(move || {
                let Some(tunnel) = tunnel.upgrade() else { return };
                manager.transition(&tunnel, TunnelState::Active, "");
            }) as session::ReconnectCallback
        };

        SessionConfig {
            keep_alive: Duration::from_secs(keep_alive),
            auto_reconnect: spec.auto_reconnect,
            max_retries: spec.max_retries,
            timeout: CONNECT_TIMEOUT,
            backoff: BackoffConfig::default(),
            on_disconnect: Some(on_disconnect),
            on_reconnect: Some(on_reconnect),
        }
    }

    /// Apply a state change, mirror it to storage, and push it out.
    /// Callable from callbacks; never blocks on network I/O.
    fn transition(&self, tunnel: &Arc<Tunnel>, state: TunnelState, error: &str) {
        let status = tunnel.update_status(state, error);

        if let Some(storage) = &self.inner.storage {
            if let Err(e) = storage.update_status(&status.tunnel_id, state.as_str()) {
                debug!("status not persisted for {}: {}", status.tunnel_id, e);
            }
        }

        self.publish(status);
    }

    fn publish(&self, status: TunnelStatus) {
        let event = TunnelEvent::TunnelUpdate {
            tunnel_id: status.tunnel_id.clone(),
            status,
        };
        // No subscribers is fine
        let _ = self.inner.event_tx.send(event);
    }

    pub async fn get(&self, tunnel_id: &str) -> Result<Arc<Tunnel>> {
        self.inner
            .tunnels
            .read()
            .await
            .get(tunnel_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("tunnel {}", tunnel_id)))
    }

    /// All tunnels, newest first
    pub async fn list(&self) -> Vec<Arc<Tunnel>> {
        let tunnels = self.inner.tunnels.read().await;
        let mut list: Vec<Arc<Tunnel>> = tunnels.values().cloned().collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list
    }

    pub async fn len(&self) -> usize {
        self.inner.tunnels.read().await.len()
    }

    pub async fn health(&self) -> HealthCounts {
        let tunnels = self.inner.tunnels.read().await;
        let mut counts = HealthCounts {
            total: tunnels.len(),
            active: 0,
            failed: 0,
        };
        for tunnel in tunnels.values() {
            match tunnel.status().state {
                TunnelState::Active => counts.active += 1,
                TunnelState::Failed => counts.failed += 1,
                _ => {}
            }
        }
        counts
    }

    /// Stop a tunnel, keeping its spec in the registry and in storage.
    /// Idempotent; stopping a failed tunnel succeeds.
    pub async fn stop(&self, tunnel_id: &str) -> Result<()> {
        let tunnel = self.get(tunnel_id).await?;

        if let Err(e) = tunnel.teardown().await {
            warn!("tunnel {} teardown reported: {}", tunnel_id, e);
        }
        self.transition(&tunnel, TunnelState::Stopped, "");
        info!("tunnel {} stopped", tunnel_id);
        Ok(())
    }

    /// Restart a stopped or failed tunnel
    pub async fn start(&self, tunnel_id: &str) -> Result<()> {
        let tunnel = self.get(tunnel_id).await?;

        {
            let current = tunnel.status().state;
            if current == TunnelState::Active {
                return Err(Error::Conflict(format!(
                    "tunnel {} is already active",
                    tunnel_id
                )));
            }
        }

        tunnel.set_retry_count(0);
        self.transition(&tunnel, TunnelState::Pending, "");

        let manager = self.clone();
        tokio::spawn(async move { manager.connect_tunnel(tunnel).await });
        Ok(())
    }

    /// Remove a tunnel entirely. Stop errors are logged, never surfaced;
    /// a failed tunnel must still be deletable.
    pub async fn delete(&self, tunnel_id: &str) -> Result<()> {
        let tunnel = self.get(tunnel_id).await?;

        if let Err(e) = tunnel.teardown().await {
            warn!("tunnel {} teardown during delete: {}", tunnel_id, e);
        }

        // Storage first, mirroring the create ordering in reverse
        if let Some(storage) = &self.inner.storage {
            match storage.delete(tunnel_id) {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(e) => warn!("tunnel {} not removed from storage: {}", tunnel_id, e),
            }
        }

        self.inner.tunnels.write().await.remove(tunnel_id);
        self.inner.breakers.remove(tunnel_id);
        info!("tunnel {} deleted", tunnel_id);
        Ok(())
    }

    /// Populate the registry from storage. Every loaded tunnel starts
    /// Stopped; nothing reconnects on boot.
    pub async fn load_from_storage(&self) -> Result<usize> {
        let Some(storage) = &self.inner.storage else {
            return Ok(0);
        };

        let specs = storage.list()?;
        let mut loaded = 0;
        let mut tunnels = self.inner.tunnels.write().await;

        for spec in specs {
            if tunnels.contains_key(&spec.id) {
                continue;
            }
            let id = spec.id.clone();
            if let Err(e) = storage.update_status(&id, TunnelState::Stopped.as_str()) {
                debug!("boot status for {}: {}", id, e);
            }
            tunnels.insert(id, Tunnel::from_storage(spec));
            loaded += 1;
        }

        info!("loaded {} tunnels from storage", loaded);
        Ok(loaded)
    }

    /// Stop everything and clear the registry. The first error is surfaced
    /// after every tunnel has been given its chance to close.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.cancel.cancel();

        let tunnels: Vec<Arc<Tunnel>> = {
            let mut map = self.inner.tunnels.write().await;
            map.drain().map(|(_, t)| t).collect()
        };

        let mut first_error: Option<Error> = None;
        for tunnel in tunnels {
            if let Err(e) = tunnel.teardown().await {
                warn!("shutdown: tunnel {} teardown: {}", tunnel.id(), e);
                first_error.get_or_insert(e);
            }
            tunnel.update_status(TunnelState::Stopped, "");
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tunneld_common::{AuthMethod, HostKeyMode, Hop};

    fn unreachable_spec(id: &str, name: &str) -> TunnelSpec {
        TunnelSpec {
            id: id.into(),
            name: name.into(),
            owner: "tests".into(),
            tunnel_type: TunnelType::Local,
            hops: vec![Hop {
                // Port 1 refuses immediately on loopback
                host: "127.0.0.1".into(),
                port: 1,
                user: "nobody".into(),
                auth_method: AuthMethod::Password,
                key_id: None,
                password: Some("x".into()),
                host_key: HostKeyMode::Insecure,
            }],
            local_port: 0,
            local_bind_address: "127.0.0.1".into(),
            remote_host: "127.0.0.1".into(),
            remote_port: 8080,
            auto_reconnect: false,
            keep_alive: 30,
            max_retries: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn manager() -> Manager {
        Manager::new(None, PathBuf::from("/nonexistent/known_hosts"))
    }

    async fn wait_for_state(manager: &Manager, id: &str, state: TunnelState) -> TunnelStatus {
        for _ in 0..150 {
            let tunnel = manager.get(id).await.unwrap();
            let status = tunnel.status();
            if status.state == state {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("tunnel {} never reached {:?}", id, state);
    }

    #[tokio::test]
    async fn create_returns_without_touching_the_network() {
        let manager = manager();
        let started = Instant::now();
        manager.create(unreachable_spec("t-1", "one")).await.unwrap();
        assert!(
            started.elapsed() < Duration::from_millis(50),
            "create must not block on connect"
        );
        assert_eq!(manager.len().await, 1);
        // The background connect races this assertion; Pending or an
        // already-recorded failure are both legitimate here
        let state = manager.get("t-1").await.unwrap().status().state;
        assert!(matches!(state, TunnelState::Pending | TunnelState::Failed));
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let manager = manager();
        manager.create(unreachable_spec("dup", "first")).await.unwrap();
        let err = manager
            .create(unreachable_spec("dup", "second"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
        assert_eq!(manager.len().await, 1);
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let manager = manager();
        manager.create(unreachable_spec("t-1", "same")).await.unwrap();
        let err = manager
            .create(unreachable_spec("t-2", "same"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[tokio::test]
    async fn empty_hops_fail_validation() {
        let manager = manager();
        let mut spec = unreachable_spec("t-1", "one");
        spec.hops.clear();
        assert_eq!(
            manager.create(spec).await.unwrap_err().code(),
            "VALIDATION_ERROR"
        );
    }

    #[tokio::test]
    async fn unreachable_host_fails_then_deletes() {
        let manager = manager();
        manager
            .create(unreachable_spec("t-bad", "bad"))
            .await
            .unwrap();

        let status = wait_for_state(&manager, "t-bad", TunnelState::Failed).await;
        assert!(
            status.last_error.to_lowercase().contains("connect"),
            "error should describe the connection failure: {}",
            status.last_error
        );

        manager.delete("t-bad").await.unwrap();
        assert_eq!(manager.len().await, 0);
        assert!(manager.get("t-bad").await.is_err());
    }

    #[tokio::test]
    async fn stop_on_failed_tunnel_reaches_stopped() {
        let manager = manager();
        manager.create(unreachable_spec("t-1", "one")).await.unwrap();
        wait_for_state(&manager, "t-1", TunnelState::Failed).await;

        manager.stop("t-1").await.unwrap();
        let status = manager.get("t-1").await.unwrap().status();
        assert_eq!(status.state, TunnelState::Stopped);
        assert!(status.connected_at.is_none());

        // Stop is idempotent
        manager.stop("t-1").await.unwrap();
    }

    #[tokio::test]
    async fn start_moves_stopped_tunnel_back_to_pending() {
        let manager = manager();
        manager.create(unreachable_spec("t-1", "one")).await.unwrap();
        wait_for_state(&manager, "t-1", TunnelState::Failed).await;
        manager.stop("t-1").await.unwrap();

        manager.start("t-1").await.unwrap();
        // The unreachable hop fails again, but only after passing Pending
        wait_for_state(&manager, "t-1", TunnelState::Failed).await;
    }

    #[tokio::test]
    async fn circuit_breaker_short_circuits_repeat_failures() {
        let manager = Manager::with_breaker_config(
            None,
            PathBuf::from("/nonexistent/known_hosts"),
            BreakerConfig {
                max_failures: 1,
                recovery_timeout: Duration::from_secs(300),
            },
        );
        manager.create(unreachable_spec("t-cb", "cb")).await.unwrap();
        wait_for_state(&manager, "t-cb", TunnelState::Failed).await;

        // Breaker is now open; the next start fails fast without dialing
        manager.start("t-cb").await.unwrap();
        let status = wait_for_state(&manager, "t-cb", TunnelState::Failed).await;
        assert!(
            status.last_error.contains("circuit"),
            "expected circuit-breaker refusal, got: {}",
            status.last_error
        );
    }

    #[tokio::test]
    async fn connected_at_is_set_once_and_survives_failures() {
        let tunnel = Tunnel::new(unreachable_spec("t-1", "one"));

        let first = tunnel.update_status(TunnelState::Active, "");
        let connected_at = first.connected_at.expect("set on first Active");

        let failed = tunnel.update_status(TunnelState::Failed, "connection lost");
        assert_eq!(failed.connected_at, Some(connected_at));
        assert_eq!(failed.last_error, "connection lost");

        let active_again = tunnel.update_status(TunnelState::Active, "");
        assert_eq!(active_again.connected_at, Some(connected_at));

        let stopped = tunnel.update_status(TunnelState::Stopped, "");
        assert!(stopped.connected_at.is_none());
    }

    #[tokio::test]
    async fn status_events_are_published() {
        let manager = manager();
        let mut events = manager.subscribe();

        manager.create(unreachable_spec("t-ev", "ev")).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("event expected")
            .unwrap();
        match event {
            TunnelEvent::TunnelUpdate { tunnel_id, status } => {
                assert_eq!(tunnel_id, "t-ev");
                assert_eq!(status.state, TunnelState::Pending);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn storage_round_trip_through_manager() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open(&dir.path().join("t.db")).unwrap());

        {
            let manager = Manager::new(Some(store.clone()), PathBuf::from("/nonexistent"));
            manager.create(unreachable_spec("t-1", "one")).await.unwrap();
            manager.create(unreachable_spec("t-2", "two")).await.unwrap();
            wait_for_state(&manager, "t-1", TunnelState::Failed).await;
            manager.delete("t-2").await.unwrap();
            manager.shutdown().await.unwrap();
        }

        // A fresh manager boots from the persisted state, everything Stopped
        let manager = Manager::new(Some(store.clone()), PathBuf::from("/nonexistent"));
        let loaded = manager.load_from_storage().await.unwrap();
        assert_eq!(loaded, 1);
        let tunnel = manager.get("t-1").await.unwrap();
        assert_eq!(tunnel.status().state, TunnelState::Stopped);
        assert_eq!(tunnel.spec().name, "one");

        assert_eq!(store.get("t-1").unwrap().id, "t-1");
        assert!(store.get("t-2").is_err());
    }

    #[tokio::test]
    async fn shutdown_clears_the_registry() {
        let manager = manager();
        manager.create(unreachable_spec("t-1", "one")).await.unwrap();
        manager.create(unreachable_spec("t-2", "two")).await.unwrap();

        manager.shutdown().await.unwrap();
        assert_eq!(manager.len().await, 0);
    }

    #[tokio::test]
    async fn health_counts_states() {
        let manager = manager();
        manager.create(unreachable_spec("t-1", "one")).await.unwrap();
        wait_for_state(&manager, "t-1", TunnelState::Failed).await;

        let health = manager.health().await;
        assert_eq!(health.total, 1);
        assert_eq!(health.active, 0);
        assert_eq!(health.failed, 1);
    }
}
