//! Protocol message types for the signaling relay.
//!
//! Every frame carries exactly one [`Request`] (client to server) or one
//! [`Response`] (server to client). Responses to a request echo its
//! `sequence`; responses pushed on behalf of another peer have an empty
//! sequence and a non-empty `event`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// Default address the server listens on and the client connects to.
pub const DEFAULT_SIGNAL_ADDR: &str = "127.0.0.1:9527";

/// Result-map key holding a forwarded ICE candidate.
pub const KEY_ICE_CANDIDATE: &str = "ice-candidate";
/// Result-map key holding a forwarded ICE username fragment.
pub const KEY_ICE_UFRAG: &str = "ice-ufrag";
/// Result-map key holding a forwarded ICE password.
pub const KEY_ICE_PWD: &str = "ice-pwd";

/// Every action the server understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Register,
    Login,
    Logout,
    Services,
    MyServices,
    ShowService,
    JoinService,
    LeaveService,
    CreateService,
    RemoveService,
    EnableService,
    DisableService,
    ConnectService,
    DisconnectService,
    IceOpen,
    IceClose,
    IceOpenAck,
    IceCloseAck,
    IceAuth,
    IceCandidate,
}

impl Action {
    pub const ALL: [Action; 20] = [
        Action::Register,
        Action::Login,
        Action::Logout,
        Action::Services,
        Action::MyServices,
        Action::ShowService,
        Action::JoinService,
        Action::LeaveService,
        Action::CreateService,
        Action::RemoveService,
        Action::EnableService,
        Action::DisableService,
        Action::ConnectService,
        Action::DisconnectService,
        Action::IceOpen,
        Action::IceClose,
        Action::IceOpenAck,
        Action::IceCloseAck,
        Action::IceAuth,
        Action::IceCandidate,
    ];

    /// The wire name of this action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Register => "register",
            Action::Login => "login",
            Action::Logout => "logout",
            Action::Services => "services",
            Action::MyServices => "myservices",
            Action::ShowService => "show-service",
            Action::JoinService => "join-service",
            Action::LeaveService => "leave-service",
            Action::CreateService => "create-service",
            Action::RemoveService => "remove-service",
            Action::EnableService => "enable-service",
            Action::DisableService => "disable-service",
            Action::ConnectService => "connect-service",
            Action::DisconnectService => "disconnect-service",
            Action::IceOpen => "ice-open",
            Action::IceClose => "ice-close",
            Action::IceOpenAck => "ice-open-ack",
            Action::IceCloseAck => "ice-close-ack",
            Action::IceAuth => "ice-auth",
            Action::IceCandidate => "ice-candidate",
        }
    }

    /// Actions relayed verbatim between the two ends of a service session.
    pub fn is_ice_relay(&self) -> bool {
        matches!(
            self,
            Action::IceOpen
                | Action::IceClose
                | Action::IceOpenAck
                | Action::IceCloseAck
                | Action::IceAuth
                | Action::IceCandidate
        )
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .iter()
            .copied()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| RelayError::UnknownAction(s.to_string()))
    }
}

/// A request sent from a client to the server.
///
/// `action` stays a plain string on the wire so that an unknown action can
/// still be answered with the request's sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub sequence: String,
    pub action: String,
    #[serde(default)]
    pub from_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pwd_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
    /// Take over an identity that is already online elsewhere.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub force: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_pwd_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_desc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_salt: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ice_candidate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ice_ufrag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ice_pwd: Option<String>,
}

impl Request {
    pub fn new(action: Action) -> Self {
        Self {
            action: action.as_str().to_string(),
            ..Default::default()
        }
    }

    /// Parse the action name.
    pub fn action(&self) -> Result<Action, RelayError> {
        self.action.parse()
    }

    /// The service name, rejecting missing or empty values.
    pub fn require_service_name(&self) -> Result<&str, RelayError> {
        match self.service_name.as_deref() {
            Some(name) if !name.is_empty() => Ok(name),
            other => Err(RelayError::InvalidServiceName(
                other.unwrap_or_default().to_string(),
            )),
        }
    }

    /// The service password digest, or an empty string when absent.
    pub fn service_pwd(&self) -> &str {
        self.service_pwd_digest.as_deref().unwrap_or_default()
    }
}

/// A response sent from the server to a client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub sequence: String,
    /// Set when this is a forwarded notification rather than a direct reply.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub event: String,
    /// The peer a forwarded event originates from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_id: Option<String>,
    /// The service a forwarded event belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub result_list: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub result_map: BTreeMap<String, String>,
    /// Empty on success.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl Response {
    /// A direct reply to the request with the given sequence.
    pub fn reply(sequence: impl Into<String>) -> Self {
        Self {
            sequence: sequence.into(),
            ..Default::default()
        }
    }

    /// A pushed event with no sequence.
    pub fn event(action: Action) -> Self {
        Self {
            event: action.as_str().to_string(),
            ..Default::default()
        }
    }

    pub fn is_event(&self) -> bool {
        !self.event.is_empty()
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_empty()
    }

    /// Parse the event name, if any.
    pub fn event_action(&self) -> Option<Action> {
        if self.event.is_empty() {
            return None;
        }
        self.event.parse().ok()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.result_map.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_names_roundtrip() {
        for action in Action::ALL {
            assert_eq!(action.as_str().parse::<Action>().unwrap(), action);
        }
        assert_eq!("myservices".parse::<Action>().unwrap(), Action::MyServices);
        assert_eq!(
            "reboot".parse::<Action>(),
            Err(RelayError::UnknownAction("reboot".to_string()))
        );
    }

    #[test]
    fn test_ice_relay_actions() {
        let relayed: Vec<_> = Action::ALL.iter().filter(|a| a.is_ice_relay()).collect();
        assert_eq!(relayed.len(), 6);
        assert!(!Action::ConnectService.is_ice_relay());
    }

    #[test]
    fn test_require_service_name() {
        let mut req = Request::new(Action::JoinService);
        assert!(matches!(
            req.require_service_name(),
            Err(RelayError::InvalidServiceName(_))
        ));
        req.service_name = Some(String::new());
        assert!(req.require_service_name().is_err());
        req.service_name = Some("ssh-box".to_string());
        assert_eq!(req.require_service_name().unwrap(), "ssh-box");
    }

    #[test]
    fn test_unset_fields_are_omitted() {
        let json = serde_json::to_string(&Request::new(Action::Services)).unwrap();
        assert_eq!(json, r#"{"sequence":"","action":"services","from_id":""}"#);

        let json = serde_json::to_string(&Response::reply("abc")).unwrap();
        assert_eq!(json, r#"{"sequence":"abc"}"#);
    }
}
