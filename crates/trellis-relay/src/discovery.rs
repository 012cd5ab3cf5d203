//! Directory client — how clients find servers and each other.
//!
//! The directory is an external service mapping public keys to relay
//! servers. This module defines the consumed interface plus an in-memory
//! implementation used by tests and demos. The production HTTP client
//! lives outside this repo.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use trellis_core::keys::{Keypair, PublicKey};

/// A relay server as advertised in the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntry {
    /// The server's long-term static public key.
    pub static_pk: PublicKey,
    /// Address clients can reach the server at, `host:port`.
    pub address: String,
}

/// A client as advertised in the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientEntry {
    /// The owning client's public key.
    pub public_key: PublicKey,
    /// Monotonic update counter. The directory rejects stale updates.
    pub sequence: u64,
    /// Servers this client keeps a link to, in preference order.
    pub delegated_servers: Vec<PublicKey>,
}

impl ClientEntry {
    pub fn new(public_key: PublicKey, delegated_servers: Vec<PublicKey>) -> Self {
        Self {
            public_key,
            sequence: 0,
            delegated_servers,
        }
    }
}

/// The directory operations the relay layer consumes.
///
/// `update_entry` takes the caller's keypair because real directory
/// implementations require the update to be signed by the entry's owner.
#[async_trait]
pub trait Directory: Send + Sync {
    /// All servers currently advertising themselves.
    async fn available_servers(&self) -> Result<Vec<ServerEntry>, DirectoryError>;

    /// A client's entry by public key.
    async fn entry(&self, pk: PublicKey) -> Result<ClientEntry, DirectoryError>;

    /// Create a client entry. Fails if one already exists for the key.
    async fn set_entry(&self, entry: ClientEntry) -> Result<(), DirectoryError>;

    /// Replace an existing client entry. The sequence number must be
    /// strictly greater than the stored one.
    async fn update_entry(&self, keys: &Keypair, entry: ClientEntry) -> Result<(), DirectoryError>;

    /// Advertise a relay server. Re-registering the same key replaces the
    /// stored address.
    async fn register_server(&self, entry: ServerEntry) -> Result<(), DirectoryError>;
}

// ── In-memory implementation ──────────────────────────────────────────────────

/// Directory backed by process memory. One instance shared by every node
/// in a test cluster plays the role of the external service.
#[derive(Default)]
pub struct MemoryDirectory {
    servers: Mutex<Vec<ServerEntry>>,
    clients: Mutex<HashMap<PublicKey, ClientEntry>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn available_servers(&self) -> Result<Vec<ServerEntry>, DirectoryError> {
        Ok(self.servers.lock().unwrap().clone())
    }

    async fn entry(&self, pk: PublicKey) -> Result<ClientEntry, DirectoryError> {
        self.clients
            .lock()
            .unwrap()
            .get(&pk)
            .cloned()
            .ok_or(DirectoryError::NotFound(pk))
    }

    async fn set_entry(&self, entry: ClientEntry) -> Result<(), DirectoryError> {
        let mut clients = self.clients.lock().unwrap();
        if clients.contains_key(&entry.public_key) {
            return Err(DirectoryError::AlreadyExists(entry.public_key));
        }
        clients.insert(entry.public_key, entry);
        Ok(())
    }

    async fn update_entry(&self, keys: &Keypair, entry: ClientEntry) -> Result<(), DirectoryError> {
        if keys.public != entry.public_key {
            return Err(DirectoryError::NotOwner);
        }
        let mut clients = self.clients.lock().unwrap();
        match clients.get(&entry.public_key) {
            Some(stored) if stored.sequence >= entry.sequence => {
                Err(DirectoryError::StaleSequence {
                    stored: stored.sequence,
                    offered: entry.sequence,
                })
            }
            Some(_) => {
                clients.insert(entry.public_key, entry);
                Ok(())
            }
            None => Err(DirectoryError::NotFound(entry.public_key)),
        }
    }

    async fn register_server(&self, entry: ServerEntry) -> Result<(), DirectoryError> {
        let mut servers = self.servers.lock().unwrap();
        if let Some(existing) = servers.iter_mut().find(|s| s.static_pk == entry.static_pk) {
            *existing = entry;
        } else {
            servers.push(entry);
        }
        Ok(())
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("no entry for {0}")]
    NotFound(PublicKey),

    #[error("entry for {0} already exists")]
    AlreadyExists(PublicKey),

    #[error("update not signed by the entry owner")]
    NotOwner,

    #[error("stale sequence: stored {stored}, offered {offered}")]
    StaleSequence { stored: u64, offered: u64 },

    #[error("directory unreachable: {0}")]
    Unavailable(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_entry_roundtrips() {
        let dir = MemoryDirectory::new();
        let keys = Keypair::generate();
        let entry = ClientEntry::new(keys.public, vec![]);
        dir.set_entry(entry.clone()).await.unwrap();
        assert_eq!(dir.entry(keys.public).await.unwrap(), entry);
    }

    #[tokio::test]
    async fn set_twice_fails() {
        let dir = MemoryDirectory::new();
        let keys = Keypair::generate();
        dir.set_entry(ClientEntry::new(keys.public, vec![])).await.unwrap();
        assert!(matches!(
            dir.set_entry(ClientEntry::new(keys.public, vec![])).await,
            Err(DirectoryError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn update_enforces_monotonic_sequence() {
        let dir = MemoryDirectory::new();
        let keys = Keypair::generate();
        dir.set_entry(ClientEntry::new(keys.public, vec![])).await.unwrap();

        let mut next = ClientEntry::new(keys.public, vec![]);
        next.sequence = 1;
        dir.update_entry(&keys, next.clone()).await.unwrap();

        // Replaying the same sequence is stale.
        assert!(matches!(
            dir.update_entry(&keys, next).await,
            Err(DirectoryError::StaleSequence { .. })
        ));
    }

    #[tokio::test]
    async fn update_rejects_non_owner() {
        let dir = MemoryDirectory::new();
        let owner = Keypair::generate();
        let thief = Keypair::generate();
        dir.set_entry(ClientEntry::new(owner.public, vec![])).await.unwrap();

        let mut forged = ClientEntry::new(owner.public, vec![]);
        forged.sequence = 1;
        assert!(matches!(
            dir.update_entry(&thief, forged).await,
            Err(DirectoryError::NotOwner)
        ));
    }

    #[tokio::test]
    async fn register_server_replaces_by_key() {
        let dir = MemoryDirectory::new();
        let keys = Keypair::generate();
        dir.register_server(ServerEntry {
            static_pk: keys.public,
            address: "127.0.0.1:1000".into(),
        })
        .await
        .unwrap();
        dir.register_server(ServerEntry {
            static_pk: keys.public,
            address: "127.0.0.1:2000".into(),
        })
        .await
        .unwrap();

        let servers = dir.available_servers().await.unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].address, "127.0.0.1:2000");
    }
}
