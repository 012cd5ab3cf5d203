//! Relay server — accepts client links and forwards frames between the
//! two links that make up each channel.
//!
//! The server never originates `Request`s. For every client it keeps one
//! link (a newer connection for the same key supersedes the older one) and
//! a relay table mapping local channel IDs to the paired ID on the peer
//! client's link.
//!
//! Forwards onto a peer link use `try_send` against that link's bounded
//! writer queue: a destination that stops draining costs the offending
//! channel a `Close(FlowExceeded)`, never a stalled reader.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use trellis_core::frame::{self, CloseReason, Frame, FrameType};
use trellis_core::keys::{Keypair, PublicKey};
use trellis_core::noise::NoiseStream;

use crate::config::ServerConfig;
use crate::discovery::{Directory, ServerEntry};
use crate::error::{Error, Result};
use crate::link::scan_free_id;

/// A rendezvous relay server.
pub struct Server {
    shared: Arc<Shared>,
    listener: tokio::sync::Mutex<Option<TcpListener>>,
}

struct Shared {
    keys: Arc<Keypair>,
    links: DashMap<PublicKey, Arc<SrvLink>>,
    closed: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    cfg: ServerConfig,
    local_addr: SocketAddr,
}

/// One connected client, server side.
struct SrvLink {
    client_pk: PublicKey,
    out_tx: mpsc::Sender<Frame>,
    relay: Mutex<RelayTable>,
    closed: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

struct RelayTable {
    entries: HashMap<u16, RelayEntry>,
    /// Allocation cursor. The server allocates odd IDs on client links.
    next_id: u16,
}

/// Half of a relay pair: frames on the local ID are rewritten to
/// `peer_id` and forwarded onto `peer`.
struct RelayEntry {
    peer: Weak<SrvLink>,
    peer_id: u16,
}

impl SrvLink {
    fn unpair(&self, id: u16) {
        self.relay.lock().unwrap().entries.remove(&id);
    }

    /// Drop every relay pair this link participates in, telling the far
    /// side of each pair, and stop the link's tasks.
    fn teardown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let entries: Vec<RelayEntry> = {
            let mut table = self.relay.lock().unwrap();
            table.entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            if let Some(peer) = entry.peer.upgrade() {
                peer.unpair(entry.peer_id);
                let _ = peer
                    .out_tx
                    .try_send(Frame::close(entry.peer_id, CloseReason::Normal));
            }
        }
        let _ = self.shutdown_tx.send(());
    }
}

impl Server {
    /// Bind the listener and advertise this server in the directory.
    pub async fn bind(
        keys: Keypair,
        addr: &str,
        dir: Arc<dyn Directory>,
        cfg: ServerConfig,
    ) -> Result<Server> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        dir.register_server(ServerEntry {
            static_pk: keys.public,
            address: local_addr.to_string(),
        })
        .await?;

        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Server {
            shared: Arc::new(Shared {
                keys: Arc::new(keys),
                links: DashMap::new(),
                closed: AtomicBool::new(false),
                shutdown_tx,
                cfg,
                local_addr,
            }),
            listener: tokio::sync::Mutex::new(Some(listener)),
        })
    }

    pub fn local_pk(&self) -> PublicKey {
        self.shared.keys.public
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Number of connected clients.
    pub fn link_count(&self) -> usize {
        self.shared.links.len()
    }

    /// Number of live relay pairs across all links.
    pub fn relay_pair_count(&self) -> usize {
        let halves: usize = self
            .shared
            .links
            .iter()
            .map(|link| link.value().relay.lock().unwrap().entries.len())
            .sum();
        halves / 2
    }

    /// Accept client connections until `close` is called. May be called
    /// once per server.
    pub async fn serve(&self) -> Result<()> {
        let listener = self.listener.lock().await.take().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "server is already running",
            ))
        })?;

        tracing::info!(
            addr = %self.shared.local_addr,
            server = %self.local_pk().short(),
            "relay server listening"
        );

        let mut shutdown_rx = self.shared.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        tokio::spawn(handle_conn(self.shared.clone(), stream, peer_addr));
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                },
            }
            if self.shared.closed.load(Ordering::SeqCst) {
                break;
            }
        }
        Ok(())
    }

    /// Stop accepting, tear down every link, and refuse further frames.
    /// Idempotent.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shared.shutdown_tx.send(());
        let links: Vec<Arc<SrvLink>> = self
            .shared
            .links
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.shared.links.clear();
        for link in links {
            link.teardown();
        }
        tracing::info!(server = %self.local_pk().short(), "relay server closed");
    }
}

// ── Per-connection tasks ──────────────────────────────────────────────────────

async fn handle_conn(shared: Arc<Shared>, stream: TcpStream, peer_addr: SocketAddr) {
    stream.set_nodelay(true).ok();
    let handshake = NoiseStream::respond(stream, &shared.keys, shared.cfg.handshake_timeout()).await;
    let (noise, client_pk) = match handshake {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(%peer_addr, error = %e, "client handshake failed");
            return;
        }
    };

    let (mut read_half, mut write_half) = tokio::io::split(noise);
    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(shared.cfg.send_queue_frames);
    let (shutdown_tx, _) = broadcast::channel(1);
    let link = Arc::new(SrvLink {
        client_pk,
        out_tx,
        relay: Mutex::new(RelayTable {
            entries: HashMap::new(),
            next_id: 1,
        }),
        closed: AtomicBool::new(false),
        shutdown_tx,
    });

    // Writer: ends after draining once the link's senders are gone.
    let writer_link = Arc::downgrade(&link);
    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = frame::write_frame(&mut write_half, &frame).await {
                tracing::debug!(error = %e, "client link write failed");
                if let Some(link) = writer_link.upgrade() {
                    link.teardown();
                }
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    // One live link per client key; a reconnect evicts the old link.
    if let Some(old) = shared.links.insert(client_pk, link.clone()) {
        tracing::info!(client = %client_pk.short(), "new connection supersedes old link");
        old.teardown();
    }
    tracing::info!(client = %client_pk.short(), %peer_addr, "client linked");

    let mut server_shutdown = shared.shutdown_tx.subscribe();
    let mut link_shutdown = link.shutdown_tx.subscribe();
    loop {
        tokio::select! {
            _ = server_shutdown.recv() => break,
            _ = link_shutdown.recv() => break,
            result = frame::read_frame(&mut read_half) => match result {
                Ok(Some(inbound)) => {
                    if let Err(e) = relay_frame(&shared, &link, inbound).await {
                        tracing::warn!(client = %client_pk.short(), error = %e, "dropping misbehaving link");
                        break;
                    }
                }
                Ok(None) => {
                    tracing::info!(client = %client_pk.short(), "client disconnected");
                    break;
                }
                Err(e) => {
                    tracing::warn!(client = %client_pk.short(), error = %e, "link read failed");
                    break;
                }
            },
        }
        if link.closed.load(Ordering::SeqCst) || shared.closed.load(Ordering::SeqCst) {
            break;
        }
    }

    link.teardown();
    shared
        .links
        .remove_if(&client_pk, |_, current| Arc::ptr_eq(current, &link));
}

// ── Relay demultiplexer ───────────────────────────────────────────────────────

/// Handle one frame from `src`. At most one frame is forwarded to a peer
/// link per inbound frame. `Err` means the source link is misbehaving
/// beyond per-channel recovery and must be dropped.
async fn relay_frame(shared: &Arc<Shared>, src: &Arc<SrvLink>, frame: Frame) -> Result<()> {
    let id = frame.channel_id;
    match frame.frame_type {
        FrameType::Request => relay_request(shared, src, id, frame).await,
        FrameType::Accept => {
            relay_forward(src, id, |peer_id| Frame::accept(peer_id), CloseReason::Rejected).await;
            Ok(())
        }
        FrameType::Data => {
            let payload = frame.payload;
            relay_forward(
                src,
                id,
                move |peer_id| Frame::data(peer_id, payload.clone()),
                CloseReason::FlowExceeded,
            )
            .await;
            Ok(())
        }
        FrameType::Close => {
            let reason = CloseReason::from_payload(&frame.payload);
            if let Some(entry) = src.relay.lock().unwrap().entries.remove(&id) {
                if let Some(peer) = entry.peer.upgrade() {
                    peer.unpair(entry.peer_id);
                    let _ = peer.out_tx.try_send(Frame::close(entry.peer_id, reason));
                }
                tracing::debug!(client = %src.client_pk.short(), id, ?reason, "relay pair closed");
            }
            Ok(())
        }
    }
}

async fn relay_request(
    shared: &Arc<Shared>,
    src: &Arc<SrvLink>,
    id: u16,
    frame: Frame,
) -> Result<()> {
    // Clients allocate even IDs on their own link.
    if id % 2 == 1 {
        reply_close(src, id, CloseReason::Protocol).await;
        return Ok(());
    }
    if src.relay.lock().unwrap().entries.contains_key(&id) {
        // Reusing a live ID poisons both halves of the pair; drop the link.
        return Err(Error::Protocol("request on an active relay id"));
    }

    let Some((initiator_pk, responder_pk)) = Frame::split_request(&frame.payload) else {
        reply_close(src, id, CloseReason::Protocol).await;
        return Ok(());
    };
    if initiator_pk != src.client_pk {
        // The request must come from the key that authenticated the link.
        reply_close(src, id, CloseReason::Protocol).await;
        return Ok(());
    }

    let Some(dst) = shared.links.get(&responder_pk).map(|entry| entry.value().clone()) else {
        tracing::debug!(
            from = %src.client_pk.short(),
            to = %responder_pk.short(),
            "dial target not linked, rejecting"
        );
        reply_close(src, id, CloseReason::Rejected).await;
        return Ok(());
    };
    if dst.closed.load(Ordering::SeqCst) {
        reply_close(src, id, CloseReason::Rejected).await;
        return Ok(());
    }

    // Allocate the responder-side ID and install both halves of the pair.
    let dst_id = {
        let mut table = dst.relay.lock().unwrap();
        match scan_free_id(table.next_id, |candidate| {
            table.entries.contains_key(&candidate)
        }) {
            Some((dst_id, next)) => {
                table.next_id = next;
                table.entries.insert(
                    dst_id,
                    RelayEntry {
                        peer: Arc::downgrade(src),
                        peer_id: id,
                    },
                );
                Some(dst_id)
            }
            None => None,
        }
    };
    let Some(dst_id) = dst_id else {
        reply_close(src, id, CloseReason::Rejected).await;
        return Ok(());
    };
    src.relay.lock().unwrap().entries.insert(
        id,
        RelayEntry {
            peer: Arc::downgrade(&dst),
            peer_id: dst_id,
        },
    );

    tracing::debug!(
        from = %src.client_pk.short(),
        to = %responder_pk.short(),
        src_id = id,
        dst_id,
        "relaying channel open"
    );

    if dst
        .out_tx
        .try_send(Frame::request(dst_id, &initiator_pk, &responder_pk))
        .is_err()
    {
        src.unpair(id);
        dst.unpair(dst_id);
        reply_close(src, id, CloseReason::Rejected).await;
    }
    Ok(())
}

/// Forward a frame across a relay pair. On a missing pair the source gets
/// a `Close` reply; on a congested or dead destination the pair is torn
/// down with `kill_reason`.
async fn relay_forward(
    src: &Arc<SrvLink>,
    id: u16,
    make_frame: impl FnOnce(u16) -> Frame,
    kill_reason: CloseReason,
) {
    let target = {
        let table = src.relay.lock().unwrap();
        table
            .entries
            .get(&id)
            .map(|entry| (entry.peer.clone(), entry.peer_id))
    };
    let Some((peer_weak, peer_id)) = target else {
        reply_close(src, id, CloseReason::Normal).await;
        return;
    };

    let Some(peer) = peer_weak.upgrade() else {
        src.unpair(id);
        reply_close(src, id, CloseReason::Normal).await;
        return;
    };

    match peer.out_tx.try_send(make_frame(peer_id)) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            // Destination writer is not draining: close this pair, leave
            // every other channel on both links alone.
            tracing::debug!(
                client = %src.client_pk.short(),
                id,
                peer_id,
                "destination congested, closing relay pair"
            );
            src.unpair(id);
            peer.unpair(peer_id);
            let _ = peer.out_tx.try_send(Frame::close(peer_id, kill_reason));
            reply_close(src, id, kill_reason).await;
        }
        Err(TrySendError::Closed(_)) => {
            src.unpair(id);
            reply_close(src, id, CloseReason::Normal).await;
        }
    }
}

/// Answer on the source link itself; this may suspend on the source's own
/// writer queue, which only ever stalls the source link.
async fn reply_close(src: &SrvLink, id: u16, reason: CloseReason) {
    if src.closed.load(Ordering::SeqCst) {
        return;
    }
    let _ = src.out_tx.send(Frame::close(id, reason)).await;
}
