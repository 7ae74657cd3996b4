//! Signal server: the single-writer actor and the TCP listener feeding it.
//!
//! The [`ServerActor`] is the only owner of the [`SessionDatabase`], the set
//! of pending (not logged in) connections and the map of online peers. Every
//! connection task talks to it through [`ActorEvent`]s, so no lock guards any
//! of this state.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{RelayError, RelayResult};
use crate::handler::serve_connection;
use crate::protocol::{
    Action, Request, Response, DEFAULT_SIGNAL_ADDR, KEY_ICE_CANDIDATE, KEY_ICE_PWD, KEY_ICE_UFRAG,
};
use crate::state::{SessionDatabase, SnapshotStore};

/// Depth of the actor's inbound event queue.
const EVENT_QUEUE: usize = 1024;

/// Identifies one transport connection for its whole lifetime.
pub type ConnectionId = u64;

/// Everything the actor reacts to, besides its persist timer.
#[derive(Debug)]
pub enum ActorEvent {
    Opened {
        id: ConnectionId,
        addr: SocketAddr,
        outbound: mpsc::Sender<Response>,
    },
    Closed {
        id: ConnectionId,
    },
    Request {
        id: ConnectionId,
        request: Request,
    },
    /// Persist and stop.
    Shutdown,
}

/// The actor's view of one connection.
#[derive(Debug)]
struct ConnectionHandle {
    id: ConnectionId,
    addr: SocketAddr,
    outbound: mpsc::Sender<Response>,
}

impl ConnectionHandle {
    /// Queue a response without ever blocking the actor.
    fn push(&self, response: Response) {
        if let Err(e) = self.outbound.try_send(response) {
            warn!(conn = self.id, addr = %self.addr, "Dropping outbound response: {}", e);
        }
    }
}

/// A response destined for a peer other than the requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forward {
    pub target: String,
    pub response: Response,
}

/// Outcome of a successful handler: the caller's payload and, optionally,
/// one more response for another peer.
#[derive(Debug, Default)]
pub struct Handled {
    pub reply: Response,
    pub forward: Option<Forward>,
}

impl Handled {
    fn ack() -> Self {
        Self::default()
    }

    fn with_reply(reply: Response) -> Self {
        Self {
            reply,
            forward: None,
        }
    }
}

/// Server settings, usually filled from the command line.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Snapshot file; `None` keeps everything in memory.
    pub db_path: Option<PathBuf>,
    pub persist_interval: Duration,
    /// Per-connection outbound queue depth.
    pub outbound_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_SIGNAL_ADDR
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 9527))),
            db_path: None,
            persist_interval: Duration::from_secs(10),
            outbound_queue: 64,
        }
    }
}

/// Single-threaded owner of all protocol state.
pub struct ServerActor {
    db: SessionDatabase,
    store: Option<SnapshotStore>,
    dirty: bool,
    pending: HashMap<ConnectionId, ConnectionHandle>,
    online: HashMap<String, ConnectionHandle>,
    identities: HashMap<ConnectionId, String>,
    events: mpsc::Receiver<ActorEvent>,
    persist_interval: Duration,
}

impl ServerActor {
    pub fn new(
        db: SessionDatabase,
        store: Option<SnapshotStore>,
        events: mpsc::Receiver<ActorEvent>,
        persist_interval: Duration,
    ) -> Self {
        Self {
            db,
            store,
            dirty: false,
            pending: HashMap::new(),
            online: HashMap::new(),
            identities: HashMap::new(),
            events,
            persist_interval,
        }
    }

    pub fn db(&self) -> &SessionDatabase {
        &self.db
    }

    pub fn is_online(&self, id: &str) -> bool {
        self.online.contains_key(id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn online_count(&self) -> usize {
        self.online.len()
    }

    /// Process events until shutdown or until every sender is gone.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.persist_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(ActorEvent::Shutdown) | None => break,
                    Some(event) => {
                        self.handle_event(event);
                        self.flush().await;
                    }
                },
                // Retries writes that failed.
                _ = ticker.tick() => self.flush().await,
            }
        }
        self.flush().await;
        info!("Server actor stopped");
    }

    /// True when a mutation has not reached the snapshot file yet.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Write the snapshot if anything changed. The file I/O runs on the
    /// blocking pool; the actor waits for it so writes never reorder.
    pub async fn flush(&mut self) {
        if !self.dirty {
            return;
        }
        let Some(store) = self.store.clone() else {
            self.dirty = false;
            return;
        };
        let bytes = match self.db.snapshot() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to serialize session database: {}", e);
                return;
            }
        };
        match tokio::task::spawn_blocking(move || store.write(&bytes)).await {
            Ok(Ok(())) => self.dirty = false,
            Ok(Err(e)) => error!("Failed to persist session database: {}", e),
            Err(e) => error!("Snapshot writer panicked: {}", e),
        }
    }

    pub fn handle_event(&mut self, event: ActorEvent) {
        match event {
            ActorEvent::Opened { id, addr, outbound } => {
                debug!(conn = id, %addr, "Connection opened");
                self.pending
                    .insert(id, ConnectionHandle { id, addr, outbound });
            }
            ActorEvent::Closed { id } => {
                if self.pending.remove(&id).is_none() {
                    if let Some(peer_id) = self.identities.remove(&id) {
                        self.online.remove(&peer_id);
                        info!(conn = id, %peer_id, "Peer went offline");
                    }
                }
                debug!(conn = id, "Connection closed");
            }
            ActorEvent::Request { id, request } => self.handle_request(id, request),
            ActorEvent::Shutdown => {}
        }
    }

    fn handle_request(&mut self, conn: ConnectionId, request: Request) {
        let sequence = request.sequence.clone();
        debug!(conn, action = %request.action, %sequence, "Request");

        let mut reply = match self.dispatch(conn, request) {
            Ok(handled) => {
                if let Some(forward) = handled.forward {
                    self.deliver(&forward.target, forward.response);
                }
                handled.reply
            }
            Err(e) => {
                debug!(conn, "Request rejected: {}", e);
                Response {
                    error: e.to_string(),
                    ..Default::default()
                }
            }
        };
        reply.sequence = sequence;

        match self.connection(conn) {
            Some(handle) => handle.push(reply),
            None => warn!(conn, "Reply for unknown connection dropped"),
        }
    }

    fn connection(&self, conn: ConnectionId) -> Option<&ConnectionHandle> {
        self.pending.get(&conn).or_else(|| {
            self.identities
                .get(&conn)
                .and_then(|peer_id| self.online.get(peer_id))
        })
    }

    fn deliver(&self, target: &str, response: Response) {
        match self.online.get(target) {
            Some(handle) => handle.push(response),
            None => warn!(%target, "Forward target went offline"),
        }
    }

    fn dispatch(&mut self, conn: ConnectionId, req: Request) -> RelayResult<Handled> {
        let action = req.action()?;
        match action {
            Action::Register => self.handle_register(&req),
            Action::Login => self.handle_login(conn, &req),
            Action::Logout => {
                self.demote(conn);
                Ok(Handled::ack())
            }
            _ => {
                let caller = self.check_online(conn, &req)?;
                match action {
                    Action::Services => Ok(self.handle_services()),
                    Action::MyServices => Ok(self.handle_my_services(&caller)),
                    Action::ShowService => self.handle_show_service(&req),
                    Action::CreateService => self.handle_create_service(&caller, &req),
                    Action::RemoveService => self.handle_remove_service(&caller, &req),
                    Action::EnableService => self.handle_toggle_service(&caller, &req, true),
                    Action::DisableService => self.handle_toggle_service(&caller, &req, false),
                    Action::JoinService => self.handle_join_service(&caller, &req),
                    Action::LeaveService => self.handle_leave_service(&caller, &req),
                    Action::ConnectService => {
                        self.handle_session(&caller, &req, Action::IceOpen)
                    }
                    Action::DisconnectService => {
                        self.handle_session(&caller, &req, Action::IceClose)
                    }
                    Action::IceOpen
                    | Action::IceClose
                    | Action::IceOpenAck
                    | Action::IceCloseAck
                    | Action::IceAuth
                    | Action::IceCandidate => self.forward_service_data(&caller, action, &req),
                    Action::Register | Action::Login | Action::Logout => {
                        unreachable!("handled before the login check")
                    }
                }
            }
        }
    }

    /// The authenticated id of `conn`; the client-supplied `from_id` is
    /// never trusted for anything but error text.
    fn check_online(&self, conn: ConnectionId, req: &Request) -> RelayResult<String> {
        self.identities
            .get(&conn)
            .cloned()
            .ok_or_else(|| RelayError::PeerNotLogin(req.from_id.clone()))
    }

    fn handle_register(&mut self, req: &Request) -> RelayResult<Handled> {
        self.db.register_peer(
            &req.from_id,
            req.pwd_digest.as_deref().unwrap_or_default(),
            req.salt.as_deref().unwrap_or_default(),
        )?;
        info!(peer_id = %req.from_id, "Peer registered");
        self.dirty = true;
        Ok(Handled::ack())
    }

    fn handle_login(&mut self, conn: ConnectionId, req: &Request) -> RelayResult<Handled> {
        let peer_id = req.from_id.as_str();
        self.db
            .authenticate(peer_id, req.pwd_digest.as_deref().unwrap_or_default())?;

        let current = self.identities.get(&conn).cloned();
        if current.as_deref() == Some(peer_id) {
            return Ok(Handled::ack());
        }

        // Nothing changes until the login is certain to succeed.
        let previous = self.online.get(peer_id).map(|h| h.id);
        if previous.is_some() && !req.force {
            return Err(RelayError::PeerAlreadyOnline(peer_id.to_string()));
        }
        if current.is_none() && !self.pending.contains_key(&conn) {
            warn!(conn, "Login from unknown connection");
            return Err(RelayError::PeerNotLogin(peer_id.to_string()));
        }

        if current.is_some() {
            self.demote(conn);
        }
        if let Some(previous) = previous {
            info!(%peer_id, old_conn = previous, new_conn = conn, "Taking over online identity");
            self.demote(previous);
            if let Some(handle) = self.pending.get(&previous) {
                handle.push(Response::event(Action::Logout));
            }
        }

        let Some(handle) = self.pending.remove(&conn) else {
            return Err(RelayError::PeerNotLogin(peer_id.to_string()));
        };
        info!(conn, %peer_id, addr = %handle.addr, "Peer logged in");
        self.online.insert(peer_id.to_string(), handle);
        self.identities.insert(conn, peer_id.to_string());
        Ok(Handled::ack())
    }

    /// Move an online connection back to the pending set.
    fn demote(&mut self, conn: ConnectionId) {
        let Some(peer_id) = self.identities.remove(&conn) else {
            return;
        };
        if let Some(handle) = self.online.remove(&peer_id) {
            self.pending.insert(conn, handle);
        }
        info!(conn, %peer_id, "Peer logged out");
    }

    fn handle_services(&self) -> Handled {
        let (names, owners) = self.db.list_services();
        Handled::with_reply(Response {
            result_list: names,
            result_map: owners,
            ..Default::default()
        })
    }

    fn handle_my_services(&self, caller: &str) -> Handled {
        let mut reply = Response::default();
        for (name, relation) in self.db.my_services(caller) {
            reply
                .result_list
                .push(format!("{} ({})", name, relation.as_str()));
            reply
                .result_map
                .insert(name, relation.as_str().to_string());
        }
        Handled::with_reply(reply)
    }

    fn handle_show_service(&self, req: &Request) -> RelayResult<Handled> {
        let name = req.require_service_name()?;
        let owner_online = self
            .db
            .service(name)
            .is_some_and(|s| self.online.contains_key(&s.owner));
        let info = self.db.service_info(name, owner_online)?;
        let json = serde_json::to_string(&info)
            .map_err(|e| RelayError::InvalidParameters(e.to_string()))?;
        Ok(Handled::with_reply(Response {
            result_list: vec![json],
            result_map: info.to_map(),
            ..Default::default()
        }))
    }

    fn handle_create_service(&mut self, caller: &str, req: &Request) -> RelayResult<Handled> {
        let name = req.service_name.as_deref().unwrap_or_default();
        self.db.create_service(
            caller,
            name,
            req.service_pwd(),
            req.service_salt.as_deref().unwrap_or_default(),
            req.service_desc.as_deref().unwrap_or_default(),
        )?;
        info!(owner = %caller, service = %name, "Service created");
        self.dirty = true;
        Ok(Handled::ack())
    }

    fn handle_remove_service(&mut self, caller: &str, req: &Request) -> RelayResult<Handled> {
        let name = req.require_service_name()?;
        self.db.remove_owned_service(caller, name, req.service_pwd())?;
        info!(owner = %caller, service = %name, "Service removed");
        self.dirty = true;
        Ok(Handled::ack())
    }

    fn handle_toggle_service(
        &mut self,
        caller: &str,
        req: &Request,
        enabled: bool,
    ) -> RelayResult<Handled> {
        let name = req.require_service_name()?;
        self.db
            .set_service_enabled(caller, name, req.service_pwd(), enabled)?;
        info!(owner = %caller, service = %name, enabled, "Service toggled");
        self.dirty = true;
        Ok(Handled::ack())
    }

    fn handle_join_service(&mut self, caller: &str, req: &Request) -> RelayResult<Handled> {
        let name = req.require_service_name()?;
        self.db.join_service(caller, name, req.service_pwd())?;
        info!(peer_id = %caller, service = %name, "Joined service");
        self.dirty = true;
        Ok(Handled::ack())
    }

    fn handle_leave_service(&mut self, caller: &str, req: &Request) -> RelayResult<Handled> {
        let name = req.require_service_name()?;
        self.db
            .leave_service(caller, name, req.service_pwd_digest.as_deref())?;
        info!(peer_id = %caller, service = %name, "Left service");
        self.dirty = true;
        Ok(Handled::ack())
    }

    /// connect-service / disconnect-service: check access, then relay as
    /// `ice-open` / `ice-close` to the owner.
    fn handle_session(
        &mut self,
        caller: &str,
        req: &Request,
        relayed: Action,
    ) -> RelayResult<Handled> {
        let name = req.require_service_name()?;
        self.db
            .check_session_access(caller, name, req.service_pwd())?;
        self.forward_service_data(caller, relayed, req)
    }

    fn forward_service_data(
        &self,
        caller: &str,
        action: Action,
        req: &Request,
    ) -> RelayResult<Handled> {
        let name = req.require_service_name()?;

        let mut event = Response::event(action);
        match action {
            Action::IceCandidate => {
                let candidate = required(&req.ice_candidate, "ice candidate")?;
                event
                    .result_map
                    .insert(KEY_ICE_CANDIDATE.to_string(), candidate.to_string());
            }
            Action::IceAuth => {
                let ufrag = required(&req.ice_ufrag, "ice ufrag")?;
                let pwd = required(&req.ice_pwd, "ice pwd")?;
                event
                    .result_map
                    .insert(KEY_ICE_UFRAG.to_string(), ufrag.to_string());
                event
                    .result_map
                    .insert(KEY_ICE_PWD.to_string(), pwd.to_string());
            }
            _ => {}
        }

        let target = self
            .db
            .forward_target(caller, name, req.to_id.as_deref())?;
        if !self.online.contains_key(&target) {
            return Err(RelayError::PeerNotLogin(target));
        }

        event.from_id = Some(caller.to_string());
        event.service_name = Some(name.to_string());
        debug!(from = %caller, to = %target, service = %name, %action, "Forwarding");
        Ok(Handled {
            reply: Response::default(),
            forward: Some(Forward {
                target,
                response: event,
            }),
        })
    }
}

fn required<'a>(value: &'a Option<String>, what: &str) -> RelayResult<&'a str> {
    match value.as_deref() {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(RelayError::InvalidParameters(format!("missing {}", what))),
    }
}

/// TCP front end of the actor.
pub struct SignalServer {
    listener: TcpListener,
    events: mpsc::Sender<ActorEvent>,
    actor: JoinHandle<()>,
    outbound_queue: usize,
    next_id: AtomicU64,
}

impl SignalServer {
    /// Load the database, bind the listener and start the actor.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let (db, store) = match &config.db_path {
            Some(path) => {
                let store = SnapshotStore::new(path);
                let db = store.load().context("Failed to load session database")?;
                (db, Some(store))
            }
            None => (SessionDatabase::new(), None),
        };

        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("Failed to bind {}", config.listen))?;
        info!("Signal server listening on {}", listener.local_addr()?);

        let (events, events_rx) = mpsc::channel(EVENT_QUEUE);
        let actor = ServerActor::new(db, store, events_rx, config.persist_interval);
        let actor = tokio::spawn(actor.run());

        Ok(Self {
            listener,
            events,
            actor,
            outbound_queue: config.outbound_queue,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the listener fails.
    pub async fn run(&self) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    info!(conn = id, %addr, "Client connected");
                    let events = self.events.clone();
                    let queue = self.outbound_queue;
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, addr, id, events, queue).await {
                            debug!(conn = id, "Connection ended: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }

    /// Stop the actor after it persisted the database.
    pub async fn shutdown(self) {
        let SignalServer { events, actor, .. } = self;
        if events.send(ActorEvent::Shutdown).await.is_err() {
            warn!("Server actor already stopped");
        }
        if let Err(e) = actor.await {
            error!("Server actor panicked: {}", e);
        }
    }
}

/// Run a signal server until the listener fails.
pub async fn run_signal_server(config: ServerConfig) -> Result<()> {
    SignalServer::bind(config).await?.run().await
}
