//! Client façade — maintains links to relay servers and hands out
//! channels.
//!
//! The client owns one link per server it is connected to, a shared accept
//! queue fed by every link's demultiplexer, and a short-lived cache of
//! directory lookups.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use trellis_core::keys::{Keypair, PublicKey};

use crate::channel::Channel;
use crate::config::ClientConfig;
use crate::discovery::{ClientEntry, Directory, DirectoryError, ServerEntry};
use crate::error::{Error, Result};
use crate::link::{self, ClientLink, LinkMap};

/// A relay client. Cheap to share behind `Arc`; `accept` serializes
/// internally.
pub struct Client {
    shared: Arc<Shared>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Channel>>,
}

struct Shared {
    keys: Arc<Keypair>,
    dir: Arc<dyn Directory>,
    links: Arc<LinkMap>,
    accept_tx: mpsc::Sender<Channel>,
    cfg: ClientConfig,
    closed: AtomicBool,
    close_tx: broadcast::Sender<()>,
    cache: Mutex<DirCache>,
}

struct DirCache {
    servers: Option<(Instant, Vec<ServerEntry>)>,
    entries: HashMap<PublicKey, (Instant, ClientEntry)>,
}

impl Client {
    pub fn new(keys: Keypair, dir: Arc<dyn Directory>, cfg: ClientConfig) -> Self {
        let (accept_tx, accept_rx) = mpsc::channel(cfg.accept_queue);
        let (close_tx, _) = broadcast::channel(1);
        Self {
            shared: Arc::new(Shared {
                keys: Arc::new(keys),
                dir,
                links: Arc::new(DashMap::new()),
                accept_tx,
                cfg,
                closed: AtomicBool::new(false),
                close_tx,
                cache: Mutex::new(DirCache {
                    servers: None,
                    entries: HashMap::new(),
                }),
            }),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
        }
    }

    /// This client's public key.
    pub fn local_pk(&self) -> PublicKey {
        self.shared.keys.public
    }

    /// Number of live server links.
    pub fn link_count(&self) -> usize {
        self.shared.links.len()
    }

    /// Connect to up to `n` servers from the directory and publish this
    /// client's entry listing them. Returns the number of live links.
    pub async fn connect_initial(&self, n: usize) -> Result<usize> {
        self.check_open()?;
        let servers = self.shared.dir.available_servers().await?;

        for entry in servers {
            if self.shared.links.len() >= n {
                break;
            }
            if self.shared.links.contains_key(&entry.static_pk) {
                continue;
            }
            match self.connect_link(&entry).await {
                Ok(link) => {
                    self.shared.links.insert(entry.static_pk, link);
                }
                Err(e) => {
                    tracing::warn!(
                        server = %entry.static_pk.short(),
                        addr = %entry.address,
                        error = %e,
                        "failed to connect to server"
                    );
                }
            }
        }

        if self.shared.links.is_empty() {
            return Err(Error::NoAvailableServers);
        }
        self.publish_entry().await?;
        Ok(self.shared.links.len())
    }

    /// Open a channel to `remote` through one of its delegated servers.
    pub async fn dial(&self, remote: PublicKey) -> Result<Channel> {
        self.check_open()?;
        let entry = self.cached_entry(remote).await?;
        if entry.delegated_servers.is_empty() {
            return Err(Error::NoDelegatedServer);
        }

        // Prefer a server we already hold a link to.
        for server_pk in &entry.delegated_servers {
            if let Some(link) = self.live_link(server_pk) {
                return link.core.dial(remote, self.shared.cfg.dial_timeout()).await;
            }
        }

        // Otherwise bring up a fresh link to the first reachable one.
        for server_pk in &entry.delegated_servers {
            let Some(server) = self.resolve_server(*server_pk).await? else {
                tracing::debug!(server = %server_pk.short(), "delegated server not in directory");
                continue;
            };
            match self.connect_link(&server).await {
                Ok(link) => {
                    self.shared.links.insert(server.static_pk, link.clone());
                    return link.core.dial(remote, self.shared.cfg.dial_timeout()).await;
                }
                Err(e) => {
                    tracing::warn!(
                        server = %server_pk.short(),
                        error = %e,
                        "failed to connect to delegated server"
                    );
                }
            }
        }
        Err(Error::NoDelegatedServer)
    }

    /// Wait for the next inbound channel from any link.
    pub async fn accept(&self) -> Result<Channel> {
        self.check_open()?;
        let mut close_rx = self.shared.close_tx.subscribe();
        let mut rx = self.accept_rx.lock().await;
        tokio::select! {
            channel = rx.recv() => channel.ok_or(Error::ClientClosed),
            _ = close_rx.recv() => Err(Error::ClientClosed),
        }
    }

    /// Close every link. Channels on them fail with `LinkClosed`; pending
    /// `accept` calls return `ClientClosed`. Idempotent.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let links: Vec<Arc<ClientLink>> = self
            .shared
            .links
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.shared.links.clear();
        for link in links {
            link.close().await;
        }
        let _ = self.shared.close_tx.send(());
        tracing::info!(client = %self.local_pk().short(), "client closed");
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn check_open(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::ClientClosed);
        }
        Ok(())
    }

    fn live_link(&self, server_pk: &PublicKey) -> Option<Arc<ClientLink>> {
        let link = self.shared.links.get(server_pk)?.clone();
        if link.core.is_closed() {
            // The reader task races us on removal; don't hand out corpses.
            self.shared
                .links
                .remove_if(server_pk, |_, l| Arc::ptr_eq(&l.core, &link.core));
            return None;
        }
        Some(link)
    }

    async fn connect_link(&self, server: &ServerEntry) -> Result<Arc<ClientLink>> {
        link::connect(
            &server.address,
            &self.shared.keys,
            server.static_pk,
            &self.shared.cfg,
            self.shared.accept_tx.clone(),
            Arc::downgrade(&self.shared.links),
        )
        .await
    }

    /// Publish (or refresh) this client's directory entry with the servers
    /// it currently holds links to.
    async fn publish_entry(&self) -> Result<()> {
        let delegated: Vec<PublicKey> = self
            .shared
            .links
            .iter()
            .map(|entry| *entry.key())
            .collect();

        match self.shared.dir.entry(self.local_pk()).await {
            Ok(mut entry) => {
                entry.sequence += 1;
                entry.delegated_servers = delegated;
                self.shared
                    .dir
                    .update_entry(&self.shared.keys, entry)
                    .await?;
            }
            Err(DirectoryError::NotFound(_)) => {
                self.shared
                    .dir
                    .set_entry(ClientEntry::new(self.local_pk(), delegated))
                    .await?;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn cached_entry(&self, pk: PublicKey) -> Result<ClientEntry> {
        let ttl = self.shared.cfg.directory_cache_ttl();
        if let Some(entry) = self.cache_lookup(pk, ttl) {
            return Ok(entry);
        }
        let entry = self.shared.dir.entry(pk).await?;
        self.shared
            .cache
            .lock()
            .unwrap()
            .entries
            .insert(pk, (Instant::now(), entry.clone()));
        Ok(entry)
    }

    fn cache_lookup(&self, pk: PublicKey, ttl: Duration) -> Option<ClientEntry> {
        let cache = self.shared.cache.lock().unwrap();
        let (when, entry) = cache.entries.get(&pk)?;
        (when.elapsed() < ttl).then(|| entry.clone())
    }

    async fn resolve_server(&self, pk: PublicKey) -> Result<Option<ServerEntry>> {
        let ttl = self.shared.cfg.directory_cache_ttl();
        {
            let cache = self.shared.cache.lock().unwrap();
            if let Some((when, servers)) = &cache.servers {
                if when.elapsed() < ttl {
                    return Ok(servers.iter().find(|s| s.static_pk == pk).cloned());
                }
            }
        }
        let servers = self.shared.dir.available_servers().await?;
        let found = servers.iter().find(|s| s.static_pk == pk).cloned();
        self.shared.cache.lock().unwrap().servers = Some((Instant::now(), servers));
        Ok(found)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("pk", &self.local_pk())
            .field("links", &self.link_count())
            .finish()
    }
}
