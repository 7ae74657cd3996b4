//! Signal client.
//!
//! [`SignalClient`] keeps one background task that dials the server and
//! redials it after a fixed delay whenever the connection drops. Requests go
//! out through a bounded queue and are matched to replies by the
//! [`RequestCorrelator`]; pushed events (forwarded ICE messages, forced
//! logout) are published on a separate channel.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::auth::{digest_password, generate_salt};
use crate::codec::{decode_response, encode_request, read_frame, write_frame, CodecError};
use crate::correlator::{RequestCorrelator, REQUEST_TIMEOUT};
use crate::error::{ClientError, RelayError};
use crate::protocol::{Action, Request, Response};
use crate::service::ServiceInfo;

/// Delay between reconnect attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// How long `connect` waits for the first successful dial.
pub const CONNECT_WAIT: Duration = Duration::from_secs(3);

const OUTBOUND_QUEUE: usize = 32;
const EVENT_QUEUE: usize = 64;

/// Connection state as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    Unknown,
    Connecting,
    Connected,
    Disconnected,
}

impl std::fmt::Display for NetworkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NetworkStatus::Unknown => "unknown",
            NetworkStatus::Connecting => "connecting",
            NetworkStatus::Connected => "connected",
            NetworkStatus::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// State shared between the client handle and its background tasks.
#[derive(Debug)]
struct Shared {
    correlator: RequestCorrelator,
    status: watch::Sender<NetworkStatus>,
    events: mpsc::Sender<Response>,
    outbound: tokio::sync::Mutex<mpsc::Receiver<Request>>,
    /// Id this client is logged in as, if any.
    session: Mutex<Option<String>>,
}

impl Shared {
    fn session(&self) -> MutexGuard<'_, Option<String>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_status(&self, status: NetworkStatus) {
        self.status.send_replace(status);
    }
}

/// Handle to one signal server connection.
#[derive(Debug)]
pub struct SignalClient {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Request>,
    events: Mutex<Option<mpsc::Receiver<Response>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Default for SignalClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalClient {
    pub fn new() -> Self {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (status, _) = watch::channel(NetworkStatus::Unknown);
        Self {
            shared: Arc::new(Shared {
                correlator: RequestCorrelator::new(),
                status,
                events: events_tx,
                outbound: tokio::sync::Mutex::new(outbound_rx),
                session: Mutex::new(None),
            }),
            outbound,
            events: Mutex::new(Some(events_rx)),
            task: Mutex::new(None),
        }
    }

    pub fn status(&self) -> NetworkStatus {
        *self.shared.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<NetworkStatus> {
        self.shared.status.subscribe()
    }

    /// The id this client is logged in as.
    pub fn peer_id(&self) -> Option<String> {
        self.shared.session().clone()
    }

    /// Take the receiver of pushed events. Only the first call gets it.
    pub fn take_events(&self) -> Option<mpsc::Receiver<Response>> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    fn task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start the connect/reconnect loop and wait briefly for the first dial.
    pub async fn connect(&self, addr: SocketAddr) -> Result<(), ClientError> {
        if self.status() == NetworkStatus::Connected {
            return Err(ClientError::AlreadyConnected);
        }
        if let Some(old) = self.task().take() {
            old.abort();
        }
        let handle = tokio::spawn(connection_loop(self.shared.clone(), addr));
        *self.task() = Some(handle);
        self.wait_connected(CONNECT_WAIT).await
    }

    /// Stop the background task and drop the connection.
    pub fn disconnect(&self) {
        if let Some(task) = self.task().take() {
            task.abort();
        }
        self.shared.correlator.cancel_all();
        self.shared.session().take();
        self.shared.set_status(NetworkStatus::Disconnected);
        info!("Disconnected from signal server");
    }

    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), ClientError> {
        let mut status = self.subscribe_status();
        let connected = matches!(
            tokio::time::timeout(timeout, status.wait_for(|s| *s == NetworkStatus::Connected))
                .await,
            Ok(Ok(_))
        );
        if connected {
            Ok(())
        } else {
            Err(ClientError::NotConnected)
        }
    }

    /// Send one request and wait for its reply.
    pub async fn send_request(&self, mut request: Request) -> Result<Response, ClientError> {
        if self.status() != NetworkStatus::Connected {
            return Err(ClientError::NotConnected);
        }
        let action = request.action()?;
        let (sequence, waiter) = self.shared.correlator.register(action);
        request.sequence = sequence.clone();
        if request.from_id.is_empty() {
            if let Some(id) = self.peer_id() {
                request.from_id = id;
            }
        }

        let exchange = async {
            self.outbound
                .send(request)
                .await
                .map_err(|_| ClientError::ConnectionClosed)?;
            waiter.await.map_err(|_| ClientError::ConnectionClosed)
        };

        let response = match tokio::time::timeout(REQUEST_TIMEOUT, exchange).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.shared.correlator.abandon(&sequence);
                return Err(e);
            }
            Err(_) => {
                self.shared.correlator.abandon(&sequence);
                debug!(%action, %sequence, "Request timed out");
                return Err(ClientError::RequestTimeout);
            }
        };

        if response.error.is_empty() {
            Ok(response)
        } else {
            Err(ClientError::Remote(response.error))
        }
    }

    pub async fn register(&self, id: &str, pwd: &str) -> Result<(), ClientError> {
        let mut req = Request::new(Action::Register);
        req.from_id = id.to_string();
        req.pwd_digest = Some(digest_password(pwd));
        req.salt = Some(generate_salt());
        self.send_request(req).await?;
        Ok(())
    }

    pub async fn login(&self, id: &str, pwd: &str, force: bool) -> Result<(), ClientError> {
        let mut req = Request::new(Action::Login);
        req.from_id = id.to_string();
        req.pwd_digest = Some(digest_password(pwd));
        req.force = force;
        self.send_request(req).await?;
        *self.shared.session() = Some(id.to_string());
        info!(peer_id = %id, "Logged in");
        Ok(())
    }

    pub async fn logout(&self) -> Result<(), ClientError> {
        self.send_request(Request::new(Action::Logout)).await?;
        self.shared.session().take();
        Ok(())
    }

    /// All service names and their owners.
    pub async fn services(&self) -> Result<Response, ClientError> {
        self.send_request(Request::new(Action::Services)).await
    }

    pub async fn my_services(&self) -> Result<Response, ClientError> {
        self.send_request(Request::new(Action::MyServices)).await
    }

    pub async fn show_service(&self, name: &str) -> Result<ServiceInfo, ClientError> {
        let mut req = Request::new(Action::ShowService);
        req.service_name = Some(name.to_string());
        let resp = self.send_request(req).await?;
        let json = resp.result_list.first().ok_or_else(|| {
            ClientError::Relay(RelayError::InvalidParameters("empty show-service reply".into()))
        })?;
        let info = serde_json::from_str::<ServiceInfo>(json).map_err(CodecError::from)?;
        Ok(info)
    }

    pub async fn create_service(&self, name: &str, pwd: &str, desc: &str) -> Result<(), ClientError> {
        let mut req = service_request(Action::CreateService, name, Some(pwd));
        req.service_salt = Some(generate_salt());
        req.service_desc = Some(desc.to_string());
        self.send_request(req).await?;
        Ok(())
    }

    pub async fn remove_service(&self, name: &str, pwd: &str) -> Result<(), ClientError> {
        self.send_request(service_request(Action::RemoveService, name, Some(pwd)))
            .await?;
        Ok(())
    }

    pub async fn enable_service(&self, name: &str, pwd: &str) -> Result<(), ClientError> {
        self.send_request(service_request(Action::EnableService, name, Some(pwd)))
            .await?;
        Ok(())
    }

    pub async fn disable_service(&self, name: &str, pwd: &str) -> Result<(), ClientError> {
        self.send_request(service_request(Action::DisableService, name, Some(pwd)))
            .await?;
        Ok(())
    }

    pub async fn join_service(&self, name: &str, pwd: &str) -> Result<(), ClientError> {
        self.send_request(service_request(Action::JoinService, name, Some(pwd)))
            .await?;
        Ok(())
    }

    pub async fn leave_service(&self, name: &str, pwd: Option<&str>) -> Result<(), ClientError> {
        self.send_request(service_request(Action::LeaveService, name, pwd))
            .await?;
        Ok(())
    }

    /// Ask the owner of `name` to open an ICE session with us.
    pub async fn connect_service(&self, name: &str, pwd: &str) -> Result<(), ClientError> {
        self.send_request(service_request(Action::ConnectService, name, Some(pwd)))
            .await?;
        Ok(())
    }

    pub async fn disconnect_service(&self, name: &str, pwd: &str) -> Result<(), ClientError> {
        self.send_request(service_request(Action::DisconnectService, name, Some(pwd)))
            .await?;
        Ok(())
    }

    /// Relay a payload-free session event (`ice-open-ack`, `ice-close`, ...).
    pub async fn forward(
        &self,
        action: Action,
        service: &str,
        to_id: Option<&str>,
    ) -> Result<(), ClientError> {
        if !action.is_ice_relay() {
            return Err(RelayError::InvalidParameters(format!("{} is not relayable", action)).into());
        }
        let mut req = service_request(action, service, None);
        req.to_id = to_id.map(str::to_string);
        self.send_request(req).await?;
        Ok(())
    }

    pub async fn send_ice_auth(
        &self,
        service: &str,
        to_id: Option<&str>,
        ufrag: &str,
        pwd: &str,
    ) -> Result<(), ClientError> {
        let mut req = service_request(Action::IceAuth, service, None);
        req.to_id = to_id.map(str::to_string);
        req.ice_ufrag = Some(ufrag.to_string());
        req.ice_pwd = Some(pwd.to_string());
        self.send_request(req).await?;
        Ok(())
    }

    pub async fn send_ice_candidate(
        &self,
        service: &str,
        to_id: Option<&str>,
        candidate: &str,
    ) -> Result<(), ClientError> {
        let mut req = service_request(Action::IceCandidate, service, None);
        req.to_id = to_id.map(str::to_string);
        req.ice_candidate = Some(candidate.to_string());
        self.send_request(req).await?;
        Ok(())
    }

    /// Run one shell command and return the lines to print.
    pub async fn execute(&self, command: &str, params: &[&str]) -> Result<Vec<String>, ClientError> {
        match command {
            "status" => {
                expect_params(command, params, 0, 0)?;
                let mut lines = vec![format!("network: {}", self.status())];
                if let Some(id) = self.peer_id() {
                    lines.push(format!("logged in as: {}", id));
                }
                Ok(lines)
            }
            "connect" => {
                expect_params(command, params, 1, 1)?;
                let addr = params[0].parse::<SocketAddr>().map_err(|e| {
                    RelayError::InvalidParameters(format!("bad address {:?}: {}", params[0], e))
                })?;
                self.connect(addr).await?;
                Ok(vec!["ok".to_string()])
            }
            "disconnect" => {
                expect_params(command, params, 0, 0)?;
                self.disconnect();
                Ok(vec!["ok".to_string()])
            }
            _ => {
                let action = command.parse::<Action>()?;
                self.execute_action(action, params).await
            }
        }
    }

    async fn execute_action(
        &self,
        action: Action,
        params: &[&str],
    ) -> Result<Vec<String>, ClientError> {
        let name = action.as_str();
        match action {
            Action::Register => {
                expect_params(name, params, 2, 2)?;
                self.register(params[0], params[1]).await?;
            }
            Action::Login => {
                expect_params(name, params, 2, 3)?;
                let force = match params.get(2) {
                    None => false,
                    Some(&"force") => true,
                    Some(other) => {
                        return Err(RelayError::InvalidParameters(format!(
                            "expected \"force\", got {:?}",
                            other
                        ))
                        .into())
                    }
                };
                self.login(params[0], params[1], force).await?;
            }
            Action::Logout => {
                expect_params(name, params, 0, 0)?;
                self.logout().await?;
            }
            Action::Services => {
                expect_params(name, params, 0, 0)?;
                return Ok(owner_lines(&self.services().await?));
            }
            Action::MyServices => {
                expect_params(name, params, 0, 0)?;
                return Ok(self.my_services().await?.result_list);
            }
            Action::ShowService => {
                expect_params(name, params, 1, 1)?;
                let info = self.show_service(params[0]).await?;
                return Ok(info
                    .to_map()
                    .into_iter()
                    .map(|(k, v)| format!("{}: {}", k, v))
                    .collect());
            }
            Action::CreateService => {
                expect_params(name, params, 3, 3)?;
                self.create_service(params[0], params[1], params[2]).await?;
            }
            Action::LeaveService => {
                expect_params(name, params, 1, 2)?;
                self.leave_service(params[0], params.get(1).copied()).await?;
            }
            Action::RemoveService
            | Action::EnableService
            | Action::DisableService
            | Action::JoinService
            | Action::ConnectService
            | Action::DisconnectService => {
                expect_params(name, params, 2, 2)?;
                self.send_request(service_request(action, params[0], Some(params[1])))
                    .await?;
            }
            _ => {
                return Err(RelayError::UnknownAction(name.to_string()).into());
            }
        }
        Ok(vec!["ok".to_string()])
    }
}

impl Drop for SignalClient {
    fn drop(&mut self) {
        if let Some(task) = self.task().take() {
            task.abort();
        }
    }
}

fn service_request(action: Action, name: &str, pwd: Option<&str>) -> Request {
    let mut req = Request::new(action);
    req.service_name = Some(name.to_string());
    req.service_pwd_digest = pwd.map(digest_password);
    req
}

/// `name (owner: id)` for each entry of a services reply.
fn owner_lines(resp: &Response) -> Vec<String> {
    resp.result_list
        .iter()
        .map(|name| format!("{} (owner: {})", name, resp.get(name).unwrap_or("unknown")))
        .collect()
}

fn expect_params(command: &str, params: &[&str], min: usize, max: usize) -> Result<(), ClientError> {
    if params.len() < min || params.len() > max {
        let expected = if min == max {
            min.to_string()
        } else {
            format!("{}-{}", min, max)
        };
        return Err(RelayError::InvalidParameters(format!(
            "{} takes {} parameter(s), got {}",
            command,
            expected,
            params.len()
        ))
        .into());
    }
    Ok(())
}

/// Dial, serve, wait, repeat. Only aborting the task ends it.
async fn connection_loop(shared: Arc<Shared>, addr: SocketAddr) {
    let mut outbound = shared.outbound.lock().await;
    loop {
        shared.set_status(NetworkStatus::Connecting);
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                let mut stale = 0;
                while outbound.try_recv().is_ok() {
                    stale += 1;
                }
                if stale > 0 {
                    debug!(stale, "Discarded stale outbound requests");
                }

                info!(%addr, "Connected to signal server");
                shared.set_status(NetworkStatus::Connected);
                if let Err(e) = serve(&shared, stream, &mut outbound).await {
                    warn!(%addr, "Connection lost: {}", e);
                }

                let failed = shared.correlator.cancel_all();
                if failed > 0 {
                    debug!(failed, "Failed pending requests");
                }
                shared.session().take();
                shared.set_status(NetworkStatus::Disconnected);
            }
            Err(e) => {
                warn!(%addr, "Failed to connect: {}", e);
                shared.set_status(NetworkStatus::Disconnected);
            }
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn serve(
    shared: &Arc<Shared>,
    stream: TcpStream,
    outbound: &mut mpsc::Receiver<Request>,
) -> Result<(), CodecError> {
    let (mut reader, mut writer) = stream.into_split();

    // Dropping the set aborts the reader, also when this future is cancelled.
    let mut reader_task = JoinSet::new();
    let read_shared = shared.clone();
    reader_task.spawn(async move {
        loop {
            let frame = match read_frame(&mut reader).await {
                Ok(frame) => frame,
                Err(e) => return e,
            };
            match decode_response(&frame) {
                Ok(response) => read_shared.dispatch(response),
                Err(e) => warn!("Invalid response: {}", e),
            }
        }
    });

    let result = loop {
        tokio::select! {
            request = outbound.recv() => {
                let Some(request) = request else {
                    break Ok(());
                };
                let bytes = match encode_request(&request) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(action = %request.action, "Failed to encode request: {}", e);
                        shared.correlator.abandon(&request.sequence);
                        continue;
                    }
                };
                if let Err(e) = write_frame(&mut writer, &bytes).await {
                    break Err(e);
                }
            }

            ended = reader_task.join_next() => {
                break match ended {
                    Some(Ok(e)) if e.is_eof() => Err(CodecError::Io(std::io::Error::new(
                        std::io::ErrorKind::ConnectionAborted,
                        "closed by server",
                    ))),
                    Some(Ok(e)) => Err(e),
                    _ => Ok(()),
                };
            }
        }
    };

    reader_task.abort_all();
    result
}

impl Shared {
    /// Route one inbound response to its waiter or to the event channel.
    fn dispatch(&self, response: Response) {
        if !response.is_event() {
            self.correlator.resolve(response);
            return;
        }
        if response.event_action() == Some(Action::Logout) {
            info!("Session taken over by another login");
            self.session().take();
        }
        if let Err(e) = self.events.try_send(response) {
            warn!("Dropping pushed event: {}", e);
        }
    }
}
