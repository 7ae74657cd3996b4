//! Peer and service records.
//!
//! The [`SessionDatabase`] is owned exclusively by the server actor. It can be
//! serialized into a single snapshot blob and reloaded from one; the
//! [`SnapshotStore`] keeps that blob in a file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Current time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// A registered identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: String,
    /// `salted_digest(client_digest, salt)`.
    pub password_digest: String,
    pub salt: String,
    /// Service name to "currently joined". A `false` entry means the peer
    /// joined once and left.
    #[serde(default)]
    pub memberships: BTreeMap<String, bool>,
}

impl Peer {
    pub fn new(id: impl Into<String>, password_digest: String, salt: String) -> Self {
        Self {
            id: id.into(),
            password_digest,
            salt,
            memberships: BTreeMap::new(),
        }
    }

    pub fn is_member(&self, service: &str) -> bool {
        self.memberships.get(service).copied().unwrap_or(false)
    }
}

/// A named rendezvous point owned by one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub owner: String,
    pub password_digest: String,
    pub salt: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub enabled: bool,
    pub created_at: u64,
}

impl Service {
    pub fn new(
        name: impl Into<String>,
        owner: impl Into<String>,
        password_digest: String,
        salt: String,
        description: String,
    ) -> Self {
        Self {
            name: name.into(),
            owner: owner.into(),
            password_digest,
            salt,
            description,
            enabled: false,
            created_at: now_ms(),
        }
    }

    pub fn is_owner(&self, id: &str) -> bool {
        self.owner == id
    }
}

/// All persistent protocol state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDatabase {
    #[serde(default)]
    peers: BTreeMap<String, Peer>,
    #[serde(default)]
    services: BTreeMap<String, Service>,
}

impl SessionDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peer(&self, id: &str) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn peer_mut(&mut self, id: &str) -> Option<&mut Peer> {
        self.peers.get_mut(id)
    }

    pub fn has_peer(&self, id: &str) -> bool {
        self.peers.contains_key(id)
    }

    pub fn insert_peer(&mut self, peer: Peer) {
        self.peers.insert(peer.id.clone(), peer);
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.get(name)
    }

    pub fn service_mut(&mut self, name: &str) -> Option<&mut Service> {
        self.services.get_mut(name)
    }

    pub fn has_service(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    pub fn insert_service(&mut self, service: Service) {
        self.services.insert(service.name.clone(), service);
    }

    /// Remove a service and drop it from every peer's memberships.
    pub fn remove_service(&mut self, name: &str) -> Option<Service> {
        let removed = self.services.remove(name)?;
        for peer in self.peers.values_mut() {
            peer.memberships.remove(name);
        }
        Some(removed)
    }

    /// Services in name order.
    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.services.values()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    /// Serialize the whole database into one blob.
    pub fn snapshot(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    /// Rebuild a database from a blob produced by [`snapshot`](Self::snapshot).
    pub fn restore(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("snapshot I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("corrupt snapshot: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// File holding the latest database snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot; a missing file yields an empty database.
    pub fn load(&self) -> Result<SessionDatabase, StoreError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => {
                let db = SessionDatabase::restore(&bytes)?;
                info!(
                    path = ?self.path,
                    peers = db.peer_count(),
                    services = db.service_count(),
                    "Loaded session database"
                );
                Ok(db)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = ?self.path, "No snapshot found, starting empty");
                Ok(SessionDatabase::new())
            }
            Err(source) => Err(StoreError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Replace the snapshot file atomically.
    pub fn save(&self, db: &SessionDatabase) -> Result<(), StoreError> {
        self.write(&db.snapshot()?)
    }

    /// Replace the snapshot file with already serialized bytes.
    pub fn write(&self, bytes: &[u8]) -> Result<(), StoreError> {
        let tmp = self.path.with_extension("tmp");
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        std::fs::write(&tmp, bytes).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)?;
        debug!(path = ?self.path, bytes = bytes.len(), "Saved session database");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_db() -> SessionDatabase {
        let mut db = SessionDatabase::new();
        db.insert_peer(Peer::new("bob1234567", "d1".into(), "salt".into()));
        let mut carol = Peer::new("carol12345", "d2".into(), "salt".into());
        carol.memberships.insert("ssh-box".to_string(), true);
        carol.memberships.insert("web".to_string(), false);
        db.insert_peer(carol);
        db.insert_service(Service::new(
            "ssh-box",
            "bob1234567",
            "sd".into(),
            "ssalt".into(),
            "ssh".into(),
        ));
        db.insert_service(Service::new(
            "web",
            "bob1234567",
            "sd".into(),
            "ssalt".into(),
            String::new(),
        ));
        db
    }

    #[test]
    fn test_remove_service_cascades() {
        let mut db = sample_db();
        assert!(db.peer("carol12345").unwrap().is_member("ssh-box"));

        let removed = db.remove_service("ssh-box").unwrap();
        assert_eq!(removed.owner, "bob1234567");
        assert!(!db.has_service("ssh-box"));
        assert!(db
            .peers()
            .all(|p| !p.memberships.contains_key("ssh-box")));
        // Unrelated membership survives.
        assert_eq!(
            db.peer("carol12345").unwrap().memberships.get("web"),
            Some(&false)
        );
        assert!(db.remove_service("ssh-box").is_none());
    }

    #[test]
    fn test_snapshot_restore() {
        let db = sample_db();
        let blob = db.snapshot().unwrap();
        let restored = SessionDatabase::restore(&blob).unwrap();
        assert_eq!(restored, db);
    }

    #[test]
    fn test_store_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("missing.json"));
        let db = store.load().unwrap();
        assert_eq!(db.peer_count(), 0);
        assert_eq!(db.service_count(), 0);
    }

    #[test]
    fn test_store_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("db.json"));
        let db = sample_db();
        store.save(&db).unwrap();
        assert!(!dir.path().join("db.tmp").exists());
        assert_eq!(store.load().unwrap(), db);
    }

    #[test]
    fn test_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");
        std::fs::write(&path, b"not a snapshot").unwrap();
        let store = SnapshotStore::new(path);
        assert!(matches!(store.load(), Err(StoreError::Corrupt(_))));
    }
}
