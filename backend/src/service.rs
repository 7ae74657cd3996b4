//! Authorization and state-transition rules for peers and services.
//!
//! These methods only touch the [`SessionDatabase`]; whether a peer is online
//! is known to the server actor alone, so callers pass that in where needed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::auth::{is_valid_credential, salted_digest, verify_digest, MIN_ID_LEN};
use crate::error::{RelayError, RelayResult};
use crate::state::{Peer, Service, SessionDatabase};

/// Public view of a service, as returned by `show-service`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub owner: String,
    pub description: String,
    pub enabled: bool,
    pub created_at: u64,
    /// Enabled and the owner is online.
    pub active: bool,
}

impl ServiceInfo {
    pub fn to_map(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("name".to_string(), self.name.clone()),
            ("owner".to_string(), self.owner.clone()),
            ("description".to_string(), self.description.clone()),
            ("enabled".to_string(), self.enabled.to_string()),
            ("created_at".to_string(), self.created_at.to_string()),
            ("active".to_string(), self.active.to_string()),
        ])
    }
}

/// How a peer relates to a service in `myservices` output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    Owner,
    Joined,
    Left,
}

impl Relation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Relation::Owner => "owner",
            Relation::Joined => "joined",
            Relation::Left => "left",
        }
    }
}

impl SessionDatabase {
    /// Create a peer storing the re-hashed client digest.
    pub fn register_peer(&mut self, id: &str, pwd_digest: &str, salt: &str) -> RelayResult<()> {
        if id.len() < MIN_ID_LEN {
            return Err(RelayError::InvalidId(id.to_string()));
        }
        if !is_valid_credential(pwd_digest, salt) {
            return Err(RelayError::InvalidPassword);
        }
        if self.has_peer(id) {
            return Err(RelayError::PeerExists(id.to_string()));
        }
        self.insert_peer(Peer::new(
            id,
            salted_digest(pwd_digest, salt),
            salt.to_string(),
        ));
        Ok(())
    }

    /// Check a login attempt against the stored credentials.
    pub fn authenticate(&self, id: &str, pwd_digest: &str) -> RelayResult<()> {
        let peer = self
            .peer(id)
            .ok_or_else(|| RelayError::PeerNotFound(id.to_string()))?;
        if !verify_digest(pwd_digest, &peer.salt, &peer.password_digest) {
            return Err(RelayError::WrongPassword);
        }
        Ok(())
    }

    pub fn create_service(
        &mut self,
        owner: &str,
        name: &str,
        pwd_digest: &str,
        salt: &str,
        description: &str,
    ) -> RelayResult<()> {
        if name.is_empty() {
            return Err(RelayError::InvalidServiceName(name.to_string()));
        }
        if !is_valid_credential(pwd_digest, salt) {
            return Err(RelayError::InvalidPassword);
        }
        if self.has_service(name) {
            return Err(RelayError::ServiceExists(name.to_string()));
        }
        self.insert_service(Service::new(
            name,
            owner,
            salted_digest(pwd_digest, salt),
            salt.to_string(),
            description.to_string(),
        ));
        Ok(())
    }

    /// Look up a service and verify its password.
    fn unlock_service(&self, name: &str, pwd_digest: &str) -> RelayResult<&Service> {
        let service = self.lookup_service(name)?;
        if !verify_digest(pwd_digest, &service.salt, &service.password_digest) {
            return Err(RelayError::WrongPassword);
        }
        Ok(service)
    }

    fn lookup_service(&self, name: &str) -> RelayResult<&Service> {
        self.service(name)
            .ok_or_else(|| RelayError::ServiceNotFound(name.to_string()))
    }

    /// Owner-only removal; cascades to every membership map.
    pub fn remove_owned_service(
        &mut self,
        caller: &str,
        name: &str,
        pwd_digest: &str,
    ) -> RelayResult<Service> {
        let service = self.unlock_service(name, pwd_digest)?;
        if !service.is_owner(caller) {
            return Err(RelayError::ServiceNotOwner(caller.to_string()));
        }
        self.remove_service(name)
            .ok_or_else(|| RelayError::ServiceNotFound(name.to_string()))
    }

    /// Owner-only toggle of the `enabled` flag.
    pub fn set_service_enabled(
        &mut self,
        caller: &str,
        name: &str,
        pwd_digest: &str,
        enabled: bool,
    ) -> RelayResult<()> {
        let service = self.unlock_service(name, pwd_digest)?;
        if !service.is_owner(caller) {
            return Err(RelayError::ServiceNotOwner(caller.to_string()));
        }
        if let Some(service) = self.service_mut(name) {
            service.enabled = enabled;
        }
        Ok(())
    }

    pub fn join_service(&mut self, caller: &str, name: &str, pwd_digest: &str) -> RelayResult<()> {
        // Owners never join their own service, whatever password they give.
        if self.lookup_service(name)?.is_owner(caller) {
            return Err(RelayError::ServiceIsOwner(caller.to_string()));
        }
        self.unlock_service(name, pwd_digest)?;
        self.set_membership(caller, name, true)
    }

    /// Mark the caller as having left. The membership key is kept.
    pub fn leave_service(
        &mut self,
        caller: &str,
        name: &str,
        pwd_digest: Option<&str>,
    ) -> RelayResult<()> {
        let service = self.lookup_service(name)?;
        if service.is_owner(caller) {
            return Err(RelayError::ServiceIsOwner(caller.to_string()));
        }
        if let Some(pwd) = pwd_digest.filter(|p| !p.is_empty()) {
            self.unlock_service(name, pwd)?;
        }
        let joined_once = self
            .peer(caller)
            .is_some_and(|p| p.memberships.contains_key(name));
        if !joined_once {
            return Err(RelayError::ServiceNotJoined(name.to_string()));
        }
        self.set_membership(caller, name, false)
    }

    fn set_membership(&mut self, caller: &str, name: &str, joined: bool) -> RelayResult<()> {
        let peer = self
            .peer_mut(caller)
            .ok_or_else(|| RelayError::PeerNotFound(caller.to_string()))?;
        peer.memberships.insert(name.to_string(), joined);
        Ok(())
    }

    /// Preconditions of connect-service / disconnect-service.
    pub fn check_session_access(
        &self,
        caller: &str,
        name: &str,
        pwd_digest: &str,
    ) -> RelayResult<()> {
        if self.lookup_service(name)?.is_owner(caller) {
            return Err(RelayError::ServiceIsOwner(caller.to_string()));
        }
        if !self.peer(caller).is_some_and(|p| p.is_member(name)) {
            return Err(RelayError::ServiceNotJoined(name.to_string()));
        }
        self.unlock_service(name, pwd_digest)?;
        Ok(())
    }

    /// Resolve who receives a forwarded ICE message.
    ///
    /// The owner addresses a member explicitly through `to_id`; a member
    /// always talks to the owner.
    pub fn forward_target(
        &self,
        caller: &str,
        name: &str,
        to_id: Option<&str>,
    ) -> RelayResult<String> {
        let service = self.lookup_service(name)?;
        if service.is_owner(caller) {
            let target = to_id
                .filter(|id| !id.is_empty())
                .ok_or_else(|| RelayError::InvalidParameters("missing target peer".into()))?;
            if !self.has_peer(target) {
                return Err(RelayError::PeerNotFound(target.to_string()));
            }
            return Ok(target.to_string());
        }
        if !self.peer(caller).is_some_and(|p| p.is_member(name)) {
            return Err(RelayError::ServiceNotJoined(name.to_string()));
        }
        Ok(service.owner.clone())
    }

    /// All service names, plus a name to owner map.
    pub fn list_services(&self) -> (Vec<String>, BTreeMap<String, String>) {
        let names = self.services().map(|s| s.name.clone()).collect();
        let owners = self
            .services()
            .map(|s| (s.name.clone(), s.owner.clone()))
            .collect();
        (names, owners)
    }

    /// Services the caller owns, has joined, or has left.
    pub fn my_services(&self, caller: &str) -> Vec<(String, Relation)> {
        let mut out: Vec<(String, Relation)> = self
            .services()
            .filter(|s| s.is_owner(caller))
            .map(|s| (s.name.clone(), Relation::Owner))
            .collect();
        if let Some(peer) = self.peer(caller) {
            for (name, joined) in &peer.memberships {
                let relation = if *joined {
                    Relation::Joined
                } else {
                    Relation::Left
                };
                out.push((name.clone(), relation));
            }
        }
        out
    }

    pub fn service_info(&self, name: &str, owner_online: bool) -> RelayResult<ServiceInfo> {
        let service = self.lookup_service(name)?;
        Ok(ServiceInfo {
            name: service.name.clone(),
            owner: service.owner.clone(),
            description: service.description.clone(),
            enabled: service.enabled,
            created_at: service.created_at,
            active: service.enabled && owner_online,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::digest_password;

    const BOB: &str = "bob1234567";
    const CAROL: &str = "carol12345";
    const DAVE: &str = "dave123456";

    fn setup() -> (SessionDatabase, String) {
        let mut db = SessionDatabase::new();
        for id in [BOB, CAROL, DAVE] {
            db.register_peer(id, &digest_password("secret"), "salty")
                .unwrap();
        }
        let p1 = digest_password("p1");
        db.create_service(BOB, "ssh-box", &p1, "svcsalt", "ssh on the home box")
            .unwrap();
        (db, p1)
    }

    #[test]
    fn test_register_validation() {
        let mut db = SessionDatabase::new();
        let digest = digest_password("pwd");
        assert_eq!(
            db.register_peer("short", &digest, "salt"),
            Err(RelayError::InvalidId("short".into()))
        );
        assert_eq!(
            db.register_peer("alice12345", "tooshort", "salt"),
            Err(RelayError::InvalidPassword)
        );
        assert_eq!(
            db.register_peer("alice12345", &digest, "s"),
            Err(RelayError::InvalidPassword)
        );
        db.register_peer("alice12345", &digest, "salt").unwrap();
        assert_eq!(
            db.register_peer("alice12345", &digest, "salt"),
            Err(RelayError::PeerExists("alice12345".into()))
        );
    }

    #[test]
    fn test_login_uses_salted_digest() {
        let mut db = SessionDatabase::new();
        let d = digest_password("correct horse");
        db.register_peer("alice12345", &d, "S1S1").unwrap();

        let stored = db.peer("alice12345").unwrap();
        assert_eq!(stored.password_digest, salted_digest(&d, "S1S1"));
        assert_ne!(stored.password_digest, d);

        assert!(db.authenticate("alice12345", &d).is_ok());
        assert_eq!(
            db.authenticate("alice12345", &digest_password("wrong")),
            Err(RelayError::WrongPassword)
        );
        assert_eq!(
            db.authenticate("nobody12345", &d),
            Err(RelayError::PeerNotFound("nobody12345".into()))
        );
    }

    #[test]
    fn test_create_service_validation() {
        let (mut db, p1) = setup();
        assert!(matches!(
            db.create_service(CAROL, "", &p1, "salt", ""),
            Err(RelayError::InvalidServiceName(_))
        ));
        assert_eq!(
            db.create_service(CAROL, "other", "x", "salt", ""),
            Err(RelayError::InvalidPassword)
        );
        assert_eq!(
            db.create_service(CAROL, "ssh-box", &p1, "salt", ""),
            Err(RelayError::ServiceExists("ssh-box".into()))
        );
        let service = db.service("ssh-box").unwrap();
        assert!(!service.enabled);
        assert_eq!(service.owner, BOB);
    }

    #[test]
    fn test_owner_never_joins() {
        let (mut db, p1) = setup();
        assert_eq!(
            db.join_service(BOB, "ssh-box", &p1),
            Err(RelayError::ServiceIsOwner(BOB.into()))
        );
        assert_eq!(
            db.join_service(BOB, "ssh-box", &digest_password("wrong")),
            Err(RelayError::ServiceIsOwner(BOB.into()))
        );
        assert!(db.peer(BOB).unwrap().memberships.is_empty());
    }

    #[test]
    fn test_join_then_leave_keeps_key() {
        let (mut db, p1) = setup();
        assert_eq!(
            db.join_service(CAROL, "ssh-box", &digest_password("p2")),
            Err(RelayError::WrongPassword)
        );
        assert_eq!(
            db.join_service(CAROL, "nope", &p1),
            Err(RelayError::ServiceNotFound("nope".into()))
        );

        db.join_service(CAROL, "ssh-box", &p1).unwrap();
        assert_eq!(
            db.peer(CAROL).unwrap().memberships.get("ssh-box"),
            Some(&true)
        );

        db.leave_service(CAROL, "ssh-box", None).unwrap();
        assert_eq!(
            db.peer(CAROL).unwrap().memberships.get("ssh-box"),
            Some(&false)
        );
    }

    #[test]
    fn test_leave_requires_prior_join() {
        let (mut db, p1) = setup();
        assert_eq!(
            db.leave_service(DAVE, "ssh-box", Some(&p1)),
            Err(RelayError::ServiceNotJoined("ssh-box".into()))
        );
        db.join_service(DAVE, "ssh-box", &p1).unwrap();
        assert_eq!(
            db.leave_service(DAVE, "ssh-box", Some(&digest_password("bad"))),
            Err(RelayError::WrongPassword)
        );
        db.leave_service(DAVE, "ssh-box", Some(&p1)).unwrap();
    }

    #[test]
    fn test_remove_service_owner_only() {
        let (mut db, p1) = setup();
        db.join_service(CAROL, "ssh-box", &p1).unwrap();

        assert_eq!(
            db.remove_owned_service(CAROL, "ssh-box", &p1),
            Err(RelayError::ServiceNotOwner(CAROL.into()))
        );
        assert_eq!(
            db.remove_owned_service(BOB, "ssh-box", &digest_password("bad")),
            Err(RelayError::WrongPassword)
        );

        db.remove_owned_service(BOB, "ssh-box", &p1).unwrap();
        assert!(db.peers().all(|p| !p.memberships.contains_key("ssh-box")));
        let (names, _) = db.list_services();
        assert!(!names.contains(&"ssh-box".to_string()));
    }

    #[test]
    fn test_enable_disable_owner_only() {
        let (mut db, p1) = setup();
        assert_eq!(
            db.set_service_enabled(CAROL, "ssh-box", &p1, true),
            Err(RelayError::ServiceNotOwner(CAROL.into()))
        );
        db.set_service_enabled(BOB, "ssh-box", &p1, true).unwrap();
        assert!(db.service("ssh-box").unwrap().enabled);
        assert!(db.service_info("ssh-box", true).unwrap().active);
        assert!(!db.service_info("ssh-box", false).unwrap().active);

        db.set_service_enabled(BOB, "ssh-box", &p1, false).unwrap();
        assert!(!db.service_info("ssh-box", true).unwrap().active);
    }

    #[test]
    fn test_session_access_rules() {
        let (mut db, p1) = setup();
        assert_eq!(
            db.check_session_access(BOB, "ssh-box", &p1),
            Err(RelayError::ServiceIsOwner(BOB.into()))
        );
        assert_eq!(
            db.check_session_access(CAROL, "ssh-box", &p1),
            Err(RelayError::ServiceNotJoined("ssh-box".into()))
        );
        db.join_service(CAROL, "ssh-box", &p1).unwrap();
        assert_eq!(
            db.check_session_access(CAROL, "ssh-box", &digest_password("p2")),
            Err(RelayError::WrongPassword)
        );
        assert!(db.check_session_access(CAROL, "ssh-box", &p1).is_ok());

        db.leave_service(CAROL, "ssh-box", None).unwrap();
        assert_eq!(
            db.check_session_access(CAROL, "ssh-box", &p1),
            Err(RelayError::ServiceNotJoined("ssh-box".into()))
        );
    }

    #[test]
    fn test_forward_target_resolution() {
        let (mut db, p1) = setup();
        db.join_service(CAROL, "ssh-box", &p1).unwrap();

        // Member to owner, whatever to_id says.
        assert_eq!(
            db.forward_target(CAROL, "ssh-box", Some(DAVE)).unwrap(),
            BOB
        );
        // Owner to an explicit peer.
        assert_eq!(
            db.forward_target(BOB, "ssh-box", Some(CAROL)).unwrap(),
            CAROL
        );
        assert!(matches!(
            db.forward_target(BOB, "ssh-box", None),
            Err(RelayError::InvalidParameters(_))
        ));
        assert_eq!(
            db.forward_target(BOB, "ssh-box", Some("ghost123456")),
            Err(RelayError::PeerNotFound("ghost123456".into()))
        );
        // Non-members are refused.
        assert_eq!(
            db.forward_target(DAVE, "ssh-box", None),
            Err(RelayError::ServiceNotJoined("ssh-box".into()))
        );
        assert_eq!(
            db.forward_target(CAROL, "gone", None),
            Err(RelayError::ServiceNotFound("gone".into()))
        );
    }

    #[test]
    fn test_my_services_relations() {
        let (mut db, p1) = setup();
        let p2 = digest_password("p2");
        db.create_service(CAROL, "carol-web", &p2, "salt", "").unwrap();
        db.create_service(BOB, "bob-ftp", &p2, "salt", "").unwrap();
        db.join_service(CAROL, "ssh-box", &p1).unwrap();
        db.join_service(CAROL, "bob-ftp", &p2).unwrap();
        db.leave_service(CAROL, "bob-ftp", None).unwrap();

        let mine = db.my_services(CAROL);
        assert_eq!(
            mine,
            vec![
                ("carol-web".to_string(), Relation::Owner),
                ("bob-ftp".to_string(), Relation::Left),
                ("ssh-box".to_string(), Relation::Joined),
            ]
        );
    }

    #[test]
    fn test_list_services_with_owner() {
        let (db, _) = setup();
        let (names, owners) = db.list_services();
        assert_eq!(names, vec!["ssh-box".to_string()]);
        assert_eq!(owners.get("ssh-box").map(String::as_str), Some(BOB));
    }
}
