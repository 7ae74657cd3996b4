//! Client-side service sessions.
//!
//! The [`Endpoint`] consumes events pushed by the signal server and keeps one
//! local ICE session per `(service, peer)` pair. The ICE engine itself lives
//! behind [`IceAgent`] / [`IceAgentFactory`]; whatever it produces (local
//! credentials, gathered candidates) comes back as [`AgentEvent`]s and is
//! relayed to the remote peer.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client::SignalClient;
use crate::protocol::{Action, Response, KEY_ICE_CANDIDATE, KEY_ICE_PWD, KEY_ICE_UFRAG};

/// Identifies one ICE session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub service: String,
    pub peer: String,
}

impl SessionKey {
    pub fn new(service: impl Into<String>, peer: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            peer: peer.into(),
        }
    }
}

/// Callbacks from a local ICE engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    AuthReady { ufrag: String, pwd: String },
    CandidateGathered { candidate: String },
}

/// Handed to each agent so it can report back to its endpoint.
#[derive(Debug, Clone)]
pub struct IceEventSink {
    key: SessionKey,
    tx: mpsc::UnboundedSender<(SessionKey, AgentEvent)>,
}

impl IceEventSink {
    pub fn on_auth_ready(&self, ufrag: &str, pwd: &str) {
        self.emit(AgentEvent::AuthReady {
            ufrag: ufrag.to_string(),
            pwd: pwd.to_string(),
        });
    }

    pub fn on_candidate_gathered(&self, candidate: &str) {
        self.emit(AgentEvent::CandidateGathered {
            candidate: candidate.to_string(),
        });
    }

    fn emit(&self, event: AgentEvent) {
        if self.tx.send((self.key.clone(), event)).is_err() {
            debug!(service = %self.key.service, peer = %self.key.peer, "Endpoint gone, dropping agent event");
        }
    }
}

/// A local ICE engine instance.
pub trait IceAgent: Send {
    fn set_remote_credentials(&mut self, ufrag: &str, pwd: &str) -> Result<()>;
    fn add_remote_candidate(&mut self, candidate: &str) -> Result<()>;
    fn close(&mut self);
}

pub trait IceAgentFactory: Send + Sync {
    /// The owner side is controlled, the joining side controlling.
    fn create(
        &self,
        key: &SessionKey,
        controlling: bool,
        events: IceEventSink,
    ) -> Result<Box<dyn IceAgent>>;
}

/// A signal the endpoint wants sent to a remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Forward {
        action: Action,
        key: SessionKey,
    },
    Auth {
        key: SessionKey,
        ufrag: String,
        pwd: String,
    },
    Candidate {
        key: SessionKey,
        candidate: String,
    },
}

struct Session {
    agent: Box<dyn IceAgent>,
    controlling: bool,
}

pub struct Endpoint<F> {
    factory: F,
    sessions: HashMap<SessionKey, Session>,
    agent_tx: mpsc::UnboundedSender<(SessionKey, AgentEvent)>,
    agent_rx: mpsc::UnboundedReceiver<(SessionKey, AgentEvent)>,
}

impl<F: IceAgentFactory> Endpoint<F> {
    pub fn new(factory: F) -> Self {
        let (agent_tx, agent_rx) = mpsc::unbounded_channel();
        Self {
            factory,
            sessions: HashMap::new(),
            agent_tx,
            agent_rx,
        }
    }

    pub fn has_session(&self, key: &SessionKey) -> bool {
        self.sessions.contains_key(key)
    }

    pub fn is_controlling(&self, key: &SessionKey) -> Option<bool> {
        self.sessions.get(key).map(|s| s.controlling)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn open_session(&mut self, key: SessionKey, controlling: bool) -> bool {
        self.close_session(&key);
        let sink = IceEventSink {
            key: key.clone(),
            tx: self.agent_tx.clone(),
        };
        match self.factory.create(&key, controlling, sink) {
            Ok(agent) => {
                info!(service = %key.service, peer = %key.peer, controlling, "ICE session opened");
                self.sessions.insert(key, Session { agent, controlling });
                true
            }
            Err(e) => {
                warn!(service = %key.service, peer = %key.peer, "Failed to create ICE agent: {}", e);
                false
            }
        }
    }

    fn close_session(&mut self, key: &SessionKey) -> bool {
        match self.sessions.remove(key) {
            Some(mut session) => {
                session.agent.close();
                info!(service = %key.service, peer = %key.peer, "ICE session closed");
                true
            }
            None => false,
        }
    }

    pub fn close_all(&mut self) {
        for (_, mut session) in self.sessions.drain() {
            session.agent.close();
        }
    }

    /// React to one pushed event; returns the signals to send back.
    pub fn handle_event(&mut self, event: &Response) -> Vec<Outgoing> {
        let Some(action) = event.event_action() else {
            warn!(event = %event.event, "Unknown pushed event");
            return Vec::new();
        };

        if action == Action::Logout {
            info!("Logged out by server, closing all sessions");
            self.close_all();
            return Vec::new();
        }

        let (Some(peer), Some(service)) = (event.from_id.as_deref(), event.service_name.as_deref())
        else {
            warn!(%action, "Pushed event without origin");
            return Vec::new();
        };
        let key = SessionKey::new(service, peer);

        match action {
            Action::IceOpen => {
                if self.open_session(key.clone(), false) {
                    vec![Outgoing::Forward {
                        action: Action::IceOpenAck,
                        key,
                    }]
                } else {
                    vec![Outgoing::Forward {
                        action: Action::IceClose,
                        key,
                    }]
                }
            }
            Action::IceOpenAck => {
                self.open_session(key, true);
                Vec::new()
            }
            Action::IceClose => {
                self.close_session(&key);
                vec![Outgoing::Forward {
                    action: Action::IceCloseAck,
                    key,
                }]
            }
            Action::IceCloseAck => {
                self.close_session(&key);
                Vec::new()
            }
            Action::IceAuth => {
                let (Some(ufrag), Some(pwd)) = (event.get(KEY_ICE_UFRAG), event.get(KEY_ICE_PWD))
                else {
                    warn!(%service, %peer, "ice-auth without credentials");
                    return Vec::new();
                };
                self.with_agent(&key, |agent| agent.set_remote_credentials(ufrag, pwd));
                Vec::new()
            }
            Action::IceCandidate => {
                let Some(candidate) = event.get(KEY_ICE_CANDIDATE) else {
                    warn!(%service, %peer, "ice-candidate without candidate");
                    return Vec::new();
                };
                self.with_agent(&key, |agent| agent.add_remote_candidate(candidate));
                Vec::new()
            }
            other => {
                debug!(action = %other, "Ignoring pushed event");
                Vec::new()
            }
        }
    }

    fn with_agent<T>(&mut self, key: &SessionKey, f: impl FnOnce(&mut Box<dyn IceAgent>) -> Result<T>) {
        let Some(session) = self.sessions.get_mut(key) else {
            warn!(service = %key.service, peer = %key.peer, "No ICE session for event");
            return;
        };
        if let Err(e) = f(&mut session.agent) {
            warn!(service = %key.service, peer = %key.peer, "ICE agent rejected remote data: {}", e);
        }
    }

    /// Turn a local agent callback into a signal for the remote peer.
    pub fn handle_agent_event(&self, key: SessionKey, event: AgentEvent) -> Option<Outgoing> {
        if !self.sessions.contains_key(&key) {
            debug!(service = %key.service, peer = %key.peer, "Agent event for closed session");
            return None;
        }
        Some(match event {
            AgentEvent::AuthReady { ufrag, pwd } => Outgoing::Auth { key, ufrag, pwd },
            AgentEvent::CandidateGathered { candidate } => Outgoing::Candidate { key, candidate },
        })
    }

    /// Drive the endpoint from a client's pushed events until they end.
    pub async fn run(mut self, client: Arc<SignalClient>, mut events: mpsc::Receiver<Response>) {
        loop {
            let outgoing = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(&event),
                    None => break,
                },
                Some((key, event)) = self.agent_rx.recv() => {
                    self.handle_agent_event(key, event).into_iter().collect()
                }
            };
            for signal in outgoing {
                if let Err(e) = send_signal(&client, &signal).await {
                    warn!(?signal, "Failed to relay signal: {}", e);
                }
            }
        }
        self.close_all();
    }
}

async fn send_signal(client: &SignalClient, signal: &Outgoing) -> Result<(), crate::error::ClientError> {
    match signal {
        Outgoing::Forward { action, key } => {
            client
                .forward(*action, &key.service, Some(&key.peer))
                .await
        }
        Outgoing::Auth { key, ufrag, pwd } => {
            client
                .send_ice_auth(&key.service, Some(&key.peer), ufrag, pwd)
                .await
        }
        Outgoing::Candidate { key, candidate } => {
            client
                .send_ice_candidate(&key.service, Some(&key.peer), candidate)
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct AgentLog {
        created: Vec<(SessionKey, bool)>,
        credentials: Vec<(String, String)>,
        candidates: Vec<String>,
        closed: usize,
    }

    struct FakeAgent {
        log: Arc<Mutex<AgentLog>>,
    }

    impl IceAgent for FakeAgent {
        fn set_remote_credentials(&mut self, ufrag: &str, pwd: &str) -> Result<()> {
            self.log
                .lock()
                .unwrap()
                .credentials
                .push((ufrag.to_string(), pwd.to_string()));
            Ok(())
        }

        fn add_remote_candidate(&mut self, candidate: &str) -> Result<()> {
            anyhow::ensure!(candidate.starts_with("candidate:"), "bad candidate");
            self.log.lock().unwrap().candidates.push(candidate.to_string());
            Ok(())
        }

        fn close(&mut self) {
            self.log.lock().unwrap().closed += 1;
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        log: Arc<Mutex<AgentLog>>,
        sinks: Mutex<Vec<IceEventSink>>,
    }

    impl IceAgentFactory for Arc<FakeFactory> {
        fn create(
            &self,
            key: &SessionKey,
            controlling: bool,
            events: IceEventSink,
        ) -> Result<Box<dyn IceAgent>> {
            self.log
                .lock()
                .unwrap()
                .created
                .push((key.clone(), controlling));
            self.sinks.lock().unwrap().push(events);
            Ok(Box::new(FakeAgent {
                log: self.log.clone(),
            }))
        }
    }

    fn pushed(action: Action, from: &str, service: &str) -> Response {
        let mut event = Response::event(action);
        event.from_id = Some(from.to_string());
        event.service_name = Some(service.to_string());
        event
    }

    #[test]
    fn test_open_then_close_as_owner() {
        let factory = Arc::new(FakeFactory::default());
        let mut endpoint = Endpoint::new(factory.clone());
        let key = SessionKey::new("ssh-box", "carol12345");

        let out = endpoint.handle_event(&pushed(Action::IceOpen, "carol12345", "ssh-box"));
        assert_eq!(
            out,
            vec![Outgoing::Forward {
                action: Action::IceOpenAck,
                key: key.clone()
            }]
        );
        assert_eq!(endpoint.is_controlling(&key), Some(false));

        let out = endpoint.handle_event(&pushed(Action::IceClose, "carol12345", "ssh-box"));
        assert_eq!(
            out,
            vec![Outgoing::Forward {
                action: Action::IceCloseAck,
                key: key.clone()
            }]
        );
        assert!(!endpoint.has_session(&key));
        assert_eq!(factory.log.lock().unwrap().closed, 1);
    }

    #[test]
    fn test_open_ack_creates_controlling_session() {
        let factory = Arc::new(FakeFactory::default());
        let mut endpoint = Endpoint::new(factory.clone());
        let out = endpoint.handle_event(&pushed(Action::IceOpenAck, "bob1234567", "ssh-box"));
        assert!(out.is_empty());
        let key = SessionKey::new("ssh-box", "bob1234567");
        assert_eq!(endpoint.is_controlling(&key), Some(true));

        endpoint.handle_event(&pushed(Action::IceCloseAck, "bob1234567", "ssh-box"));
        assert_eq!(endpoint.session_count(), 0);
    }

    #[test]
    fn test_remote_auth_and_candidates_reach_agent() {
        let factory = Arc::new(FakeFactory::default());
        let mut endpoint = Endpoint::new(factory.clone());
        endpoint.handle_event(&pushed(Action::IceOpen, "carol12345", "ssh-box"));

        let mut auth = pushed(Action::IceAuth, "carol12345", "ssh-box");
        auth.result_map
            .insert(KEY_ICE_UFRAG.to_string(), "uf01".to_string());
        auth.result_map
            .insert(KEY_ICE_PWD.to_string(), "pw01".to_string());
        endpoint.handle_event(&auth);

        let mut cand = pushed(Action::IceCandidate, "carol12345", "ssh-box");
        cand.result_map.insert(
            KEY_ICE_CANDIDATE.to_string(),
            "candidate:1 1 udp 1 10.0.0.9 5000 typ host".to_string(),
        );
        endpoint.handle_event(&cand);

        // Bad candidate is logged and dropped; no session for dave.
        cand.result_map
            .insert(KEY_ICE_CANDIDATE.to_string(), "junk".to_string());
        endpoint.handle_event(&cand);
        cand.from_id = Some("dave123456".to_string());
        endpoint.handle_event(&cand);

        let log = factory.log.lock().unwrap();
        assert_eq!(log.credentials, vec![("uf01".to_string(), "pw01".to_string())]);
        assert_eq!(log.candidates.len(), 1);
    }

    #[tokio::test]
    async fn test_agent_callbacks_become_signals() {
        let factory = Arc::new(FakeFactory::default());
        let mut endpoint = Endpoint::new(factory.clone());
        endpoint.handle_event(&pushed(Action::IceOpenAck, "bob1234567", "ssh-box"));

        let sink = factory.sinks.lock().unwrap()[0].clone();
        sink.on_auth_ready("lufrag", "lpwd");
        sink.on_candidate_gathered("candidate:2");

        let key = SessionKey::new("ssh-box", "bob1234567");
        let (k, ev) = endpoint.agent_rx.recv().await.unwrap();
        assert_eq!(
            endpoint.handle_agent_event(k, ev),
            Some(Outgoing::Auth {
                key: key.clone(),
                ufrag: "lufrag".to_string(),
                pwd: "lpwd".to_string()
            })
        );
        let (k, ev) = endpoint.agent_rx.recv().await.unwrap();
        assert_eq!(
            endpoint.handle_agent_event(k, ev),
            Some(Outgoing::Candidate {
                key: key.clone(),
                candidate: "candidate:2".to_string()
            })
        );

        // Events from a closed session go nowhere.
        endpoint.handle_event(&pushed(Action::IceCloseAck, "bob1234567", "ssh-box"));
        sink.on_candidate_gathered("candidate:3");
        let (k, ev) = endpoint.agent_rx.recv().await.unwrap();
        assert_eq!(endpoint.handle_agent_event(k, ev), None);
    }

    #[test]
    fn test_forced_logout_closes_everything() {
        let factory = Arc::new(FakeFactory::default());
        let mut endpoint = Endpoint::new(factory.clone());
        endpoint.handle_event(&pushed(Action::IceOpen, "carol12345", "ssh-box"));
        endpoint.handle_event(&pushed(Action::IceOpen, "dave123456", "ssh-box"));
        assert_eq!(endpoint.session_count(), 2);

        endpoint.handle_event(&Response::event(Action::Logout));
        assert_eq!(endpoint.session_count(), 0);
        assert_eq!(factory.log.lock().unwrap().closed, 2);
    }
}
