//! A link — one TCP+noise connection from a client to a relay server,
//! multiplexing up to 2¹⁶ channels.
//!
//! The link is the concurrency hub. One reader task pulls frames in order
//! and demultiplexes them; one writer task drains a bounded queue of
//! outbound frames. Channels talk to the writer queue, never to the
//! socket.
//!
//! Flow policy: the reader never blocks on a slow channel. Inbound data is
//! handed off with `try_send` against a per-channel byte budget; a channel
//! whose backlog would exceed the budget is closed with `FlowExceeded`
//! instead of stalling every other channel on the link.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use trellis_core::frame::{self, CloseReason, Frame, FrameType};
use trellis_core::keys::{Keypair, PublicKey};
use trellis_core::noise::NoiseStream;

use crate::channel::{end_state, Channel, ChannelFlags};
use crate::config::ClientConfig;
use crate::error::{Error, Result};

/// Channel IDs per parity class.
pub(crate) const IDS_PER_SIDE: usize = 1 << 15;

/// Links a client holds, keyed by server public key.
pub(crate) type LinkMap = DashMap<PublicKey, Arc<ClientLink>>;

// ── ID allocation ─────────────────────────────────────────────────────────────

/// Scan for a free ID starting at `start`, stepping by 2 so the cursor's
/// parity is preserved. Returns `(id, next_cursor)`, or `None` once every
/// ID of this parity is occupied.
pub(crate) fn scan_free_id(start: u16, occupied: impl Fn(u16) -> bool) -> Option<(u16, u16)> {
    let mut cursor = start;
    for _ in 0..IDS_PER_SIDE {
        let id = cursor;
        cursor = cursor.wrapping_add(2);
        if !occupied(id) {
            return Some((id, cursor));
        }
    }
    None
}

// ── Channel table ─────────────────────────────────────────────────────────────

enum SlotState {
    /// Locally dialed, waiting for the remote's verdict.
    Handshaking(Option<oneshot::Sender<Result<()>>>),
    Open,
    /// Remote sent `Close`; the slot lingers until the local side emits
    /// its own `Close` (via `close()` or drop).
    Closing,
}

struct Slot {
    state: SlotState,
    data_tx: Option<mpsc::Sender<Bytes>>,
    flags: Arc<ChannelFlags>,
}

/// Slot state stripped of its payload, for borrow-free dispatch.
#[derive(Clone, Copy, PartialEq, Eq)]
enum SlotKind {
    Handshaking,
    Open,
    Closing,
}

fn slot_kind(slot: &Slot) -> SlotKind {
    match slot.state {
        SlotState::Handshaking(_) => SlotKind::Handshaking,
        SlotState::Open => SlotKind::Open,
        SlotState::Closing => SlotKind::Closing,
    }
}

struct ChannelTable {
    slots: HashMap<u16, Slot>,
    /// Allocation cursor. Clients allocate even IDs only.
    next_id: u16,
}

// ── Link core ─────────────────────────────────────────────────────────────────

/// State shared by the reader task, the writer queue, and channel handles.
pub(crate) struct LinkCore {
    pub(crate) local_pk: PublicKey,
    pub(crate) server_pk: PublicKey,
    /// Self-reference handed to channels; never upgraded internally.
    weak: Weak<LinkCore>,
    out_tx: mpsc::Sender<Frame>,
    table: Mutex<ChannelTable>,
    closed: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    recv_budget: usize,
    recv_queue: usize,
}

/// A live link plus its reader task handle, so closing can wait for the
/// reader to observe shutdown and exit.
pub(crate) struct ClientLink {
    pub(crate) core: Arc<LinkCore>,
    reader: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ClientLink {
    pub(crate) async fn close(&self) {
        self.core.close_graceful();
        if let Some(handle) = self.reader.lock().await.take() {
            let _ = handle.await;
        }
    }
}

/// Dial the server at `addr`, run the noise handshake as initiator, and
/// start the link tasks.
pub(crate) async fn connect(
    addr: &str,
    keys: &Keypair,
    server_pk: PublicKey,
    cfg: &ClientConfig,
    accept_tx: mpsc::Sender<Channel>,
    registry: Weak<LinkMap>,
) -> Result<Arc<ClientLink>> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true).ok();
    let noise = NoiseStream::initiate(stream, keys, &server_pk, cfg.handshake_timeout()).await?;
    tracing::info!(server = %server_pk.short(), addr, "link established");
    Ok(start(noise, keys.public, server_pk, cfg, accept_tx, registry))
}

/// Start the reader and writer tasks over an established noise stream.
pub(crate) fn start<S>(
    noise: NoiseStream<S>,
    local_pk: PublicKey,
    server_pk: PublicKey,
    cfg: &ClientConfig,
    accept_tx: mpsc::Sender<Channel>,
    registry: Weak<LinkMap>,
) -> Arc<ClientLink>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(cfg.send_queue_frames);
    let (shutdown_tx, _) = broadcast::channel(1);
    let core = Arc::new_cyclic(|weak| LinkCore {
        local_pk,
        server_pk,
        weak: weak.clone(),
        out_tx,
        table: Mutex::new(ChannelTable {
            slots: HashMap::new(),
            next_id: 0,
        }),
        closed: AtomicBool::new(false),
        shutdown_tx,
        recv_budget: cfg.recv_budget_bytes,
        recv_queue: cfg.recv_queue_frames,
    });

    let (mut read_half, mut write_half) = tokio::io::split(noise);

    // Writer: sole owner of the write half. Ends when the last sender
    // drops, after draining queued frames (best-effort goodbyes included).
    let writer_core = Arc::downgrade(&core);
    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = frame::write_frame(&mut write_half, &frame).await {
                tracing::warn!(error = %e, "link write failed");
                if let Some(core) = writer_core.upgrade() {
                    core.fail();
                }
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    // Reader: demultiplexes inbound frames until error or shutdown.
    let reader_core = core.clone();
    let reader = tokio::spawn(async move {
        let mut shutdown_rx = reader_core.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                result = frame::read_frame(&mut read_half) => match result {
                    Ok(Some(frame)) => reader_core.handle_frame(frame, &accept_tx).await,
                    Ok(None) => {
                        tracing::info!(server = %reader_core.server_pk.short(), "server closed the link");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(server = %reader_core.server_pk.short(), error = %e, "link read failed");
                        break;
                    }
                },
            }
            if reader_core.closed.load(Ordering::SeqCst) {
                break;
            }
        }
        reader_core.fail();
        if let Some(map) = registry.upgrade() {
            map.remove_if(&reader_core.server_pk, |_, link| {
                Arc::ptr_eq(&link.core, &reader_core)
            });
        }
    });

    Arc::new(ClientLink {
        core,
        reader: tokio::sync::Mutex::new(Some(reader)),
    })
}

impl LinkCore {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Queue a frame for the writer task. Suspends when the writer is
    /// congested; this is the back-pressure channels feel.
    pub(crate) async fn send_frame(&self, frame: Frame) -> Result<()> {
        if self.is_closed() {
            return Err(Error::LinkClosed);
        }
        self.out_tx.send(frame).await.map_err(|_| Error::LinkClosed)
    }

    async fn send_close(&self, id: u16, reason: CloseReason) {
        let _ = self.send_frame(Frame::close(id, reason)).await;
    }

    // ── Dial ──────────────────────────────────────────────────────────────────

    /// Open a channel to `remote` through this link's server.
    pub(crate) async fn dial(
        &self,
        remote: PublicKey,
        deadline: Duration,
    ) -> Result<Channel> {
        if self.is_closed() {
            return Err(Error::LinkClosed);
        }

        let flags = Arc::new(ChannelFlags::new());
        let (data_tx, data_rx) = mpsc::channel(self.recv_queue);
        let (ack_tx, ack_rx) = oneshot::channel();

        let id = {
            let mut table = self.table.lock().unwrap();
            let (id, next) = scan_free_id(table.next_id, |id| table.slots.contains_key(&id))
                .ok_or(Error::ExhaustedChannelIds)?;
            table.next_id = next;
            table.slots.insert(
                id,
                Slot {
                    state: SlotState::Handshaking(Some(ack_tx)),
                    data_tx: Some(data_tx),
                    flags: flags.clone(),
                },
            );
            id
        };

        tracing::debug!(id, remote = %remote.short(), "dialing channel");
        if let Err(e) = self
            .send_frame(Frame::request(id, &self.local_pk, &remote))
            .await
        {
            self.table.lock().unwrap().slots.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(deadline, ack_rx).await {
            Err(_elapsed) => {
                self.abort_dial(id);
                Err(Error::DeadlineExceeded)
            }
            Ok(Err(_sender_gone)) => Err(Error::LinkClosed),
            Ok(Ok(Ok(()))) => {
                tracing::debug!(id, remote = %remote.short(), "channel open");
                Ok(Channel::new(
                    id,
                    self.local_pk,
                    remote,
                    self.weak.clone(),
                    data_rx,
                    flags,
                ))
            }
            Ok(Ok(Err(e))) => Err(e),
        }
    }

    fn abort_dial(&self, id: u16) {
        self.table.lock().unwrap().slots.remove(&id);
        let _ = self.out_tx.try_send(Frame::close(id, CloseReason::Normal));
    }

    // ── Channel close paths ───────────────────────────────────────────────────

    /// Remove `id` from the table if it still belongs to `flags` (the ID
    /// may have been reused after a link-initiated close). Returns whether
    /// a `Close` frame still needs to go out.
    fn release_slot(&self, id: u16, flags: &Arc<ChannelFlags>) -> bool {
        let mut table = self.table.lock().unwrap();
        match table.slots.get(&id) {
            Some(slot) if Arc::ptr_eq(&slot.flags, flags) => {
                table.slots.remove(&id);
                true
            }
            _ => false,
        }
    }

    pub(crate) async fn finish_channel(&self, id: u16, flags: &Arc<ChannelFlags>) {
        if self.release_slot(id, flags) {
            self.send_close(id, CloseReason::Normal).await;
        }
    }

    /// Drop-path variant: must not await.
    pub(crate) fn finish_channel_sync(&self, id: u16, flags: &Arc<ChannelFlags>) {
        if self.release_slot(id, flags) {
            let _ = self.out_tx.try_send(Frame::close(id, CloseReason::Normal));
        }
    }

    // ── Demultiplexer ─────────────────────────────────────────────────────────

    async fn handle_frame(&self, frame: Frame, accept_tx: &mpsc::Sender<Channel>) {
        let id = frame.channel_id;
        match frame.frame_type {
            FrameType::Request => self.on_request(id, frame.payload, accept_tx).await,
            FrameType::Accept => self.on_accept(id).await,
            FrameType::Data => self.on_data(id, frame.payload).await,
            FrameType::Close => self.on_close(id, CloseReason::from_payload(&frame.payload)),
        }
    }

    async fn on_request(&self, id: u16, payload: Bytes, accept_tx: &mpsc::Sender<Channel>) {
        enum Verdict {
            Deliver(Channel),
            Reply(CloseReason),
        }

        let verdict = {
            let mut table = self.table.lock().unwrap();
            if let Some(mut slot) = table.slots.remove(&id) {
                // A request on an active ID invalidates whatever was there.
                if let SlotState::Handshaking(tx) = &mut slot.state {
                    if let Some(tx) = tx.take() {
                        let _ = tx.send(Err(Error::Protocol("request on an active channel id")));
                    }
                }
                slot.flags.set_end(end_state::PROTOCOL);
                Verdict::Reply(CloseReason::Protocol)
            } else if id % 2 == 0 {
                // Server-initiated channels carry odd IDs on a client link.
                Verdict::Reply(CloseReason::Protocol)
            } else {
                match Frame::split_request(&payload) {
                    Some((initiator_pk, responder_pk)) if responder_pk == self.local_pk => {
                        let flags = Arc::new(ChannelFlags::new());
                        let (data_tx, data_rx) = mpsc::channel(self.recv_queue);
                        table.slots.insert(
                            id,
                            Slot {
                                state: SlotState::Open,
                                data_tx: Some(data_tx),
                                flags: flags.clone(),
                            },
                        );
                        Verdict::Deliver(Channel::new(
                            id,
                            self.local_pk,
                            initiator_pk,
                            self.weak.clone(),
                            data_rx,
                            flags,
                        ))
                    }
                    _ => Verdict::Reply(CloseReason::Protocol),
                }
            }
        };

        match verdict {
            Verdict::Deliver(channel) => {
                tracing::debug!(id, remote = %channel.remote_pk().short(), "inbound channel");
                // The accept must be on the wire before any data we write
                // on this channel can follow it.
                if self.send_frame(Frame::accept(id)).await.is_err() {
                    return; // link is going down; channel drop cleans the slot
                }
                if accept_tx.try_send(channel).is_err() {
                    // Nobody is accepting; the dropped handle emits Close.
                    tracing::warn!(id, "accept queue full, rejecting inbound channel");
                }
            }
            Verdict::Reply(reason) => {
                tracing::debug!(id, ?reason, "rejecting inbound request");
                self.send_close(id, reason).await;
            }
        }
    }

    async fn on_accept(&self, id: u16) {
        enum Action {
            Wake(Option<oneshot::Sender<Result<()>>>),
            Kill,
            ReplyUnknown,
        }

        let action = {
            let mut table = self.table.lock().unwrap();
            match table.slots.get(&id).map(slot_kind) {
                None => Action::ReplyUnknown,
                Some(SlotKind::Handshaking) => {
                    let mut tx = None;
                    if let Some(slot) = table.slots.get_mut(&id) {
                        if let SlotState::Handshaking(pending) = &mut slot.state {
                            tx = pending.take();
                        }
                        slot.state = SlotState::Open;
                    }
                    Action::Wake(tx)
                }
                // Duplicate accept kills the channel.
                Some(_) => {
                    if let Some(slot) = table.slots.remove(&id) {
                        slot.flags.set_end(end_state::PROTOCOL);
                    }
                    Action::Kill
                }
            }
        };

        match action {
            Action::Wake(tx) => {
                if let Some(tx) = tx {
                    let _ = tx.send(Ok(()));
                }
            }
            Action::Kill => {
                tracing::debug!(id, "duplicate accept, killing channel");
                self.send_close(id, CloseReason::Protocol).await;
            }
            Action::ReplyUnknown => self.send_close(id, CloseReason::Normal).await,
        }
    }

    async fn on_data(&self, id: u16, payload: Bytes) {
        enum Action {
            Drop,
            Enqueue(mpsc::Sender<Bytes>, Arc<ChannelFlags>),
            KillHandshaking(Option<oneshot::Sender<Result<()>>>),
            ReplyUnknown,
        }

        let action = {
            let mut table = self.table.lock().unwrap();
            match table.slots.get(&id).map(slot_kind) {
                None => Action::ReplyUnknown,
                Some(SlotKind::Handshaking) => {
                    let mut tx = None;
                    if let Some(mut slot) = table.slots.remove(&id) {
                        if let SlotState::Handshaking(pending) = &mut slot.state {
                            tx = pending.take();
                        }
                    }
                    Action::KillHandshaking(tx)
                }
                Some(_) => {
                    let slot = &table.slots[&id];
                    if slot.flags.local_closed.load(Ordering::SeqCst) {
                        // Half-closed locally: drop silently.
                        Action::Drop
                    } else {
                        match &slot.data_tx {
                            Some(tx) => Action::Enqueue(tx.clone(), slot.flags.clone()),
                            None => Action::Drop,
                        }
                    }
                }
            }
        };

        match action {
            Action::Drop => {}
            Action::Enqueue(tx, flags) => {
                let len = payload.len();
                let reserved = flags.try_reserve(len, self.recv_budget);
                if reserved && tx.try_send(payload).is_ok() {
                    return;
                }
                if reserved {
                    flags.release(len);
                }
                // Slow reader: close this channel rather than stall the link.
                tracing::debug!(id, "inbound queue full, closing channel");
                flags.set_end(end_state::FLOW_EXCEEDED);
                self.release_slot(id, &flags);
                self.send_close(id, CloseReason::FlowExceeded).await;
            }
            Action::KillHandshaking(tx) => {
                if let Some(tx) = tx {
                    let _ = tx.send(Err(Error::Protocol("data before accept")));
                }
                self.send_close(id, CloseReason::Protocol).await;
            }
            Action::ReplyUnknown => self.send_close(id, CloseReason::Normal).await,
        }
    }

    fn on_close(&self, id: u16, reason: CloseReason) {
        enum Action {
            Ignore,
            FailDialer(Option<oneshot::Sender<Result<()>>>, CloseReason),
        }

        let action = {
            let mut table = self.table.lock().unwrap();
            match table.slots.get(&id).map(slot_kind) {
                None => Action::Ignore,
                Some(SlotKind::Handshaking) => {
                    let mut tx = None;
                    if let Some(mut slot) = table.slots.remove(&id) {
                        if let SlotState::Handshaking(pending) = &mut slot.state {
                            tx = pending.take();
                        }
                    }
                    Action::FailDialer(tx, reason)
                }
                Some(SlotKind::Open) => {
                    if let Some(slot) = table.slots.get_mut(&id) {
                        slot.flags.set_end(match reason {
                            CloseReason::Protocol => end_state::PROTOCOL,
                            CloseReason::FlowExceeded => end_state::FLOW_EXCEEDED,
                            _ => end_state::REMOTE_CLOSED,
                        });
                        slot.data_tx = None; // pending reads drain, then end
                        slot.state = SlotState::Closing;
                    }
                    Action::Ignore
                }
                // Duplicate close from the remote.
                Some(SlotKind::Closing) => Action::Ignore,
            }
        };

        if let Action::FailDialer(tx, reason) = action {
            tracing::debug!(id, ?reason, "dial answered with close");
            if let Some(tx) = tx {
                let _ = tx.send(Err(match reason {
                    CloseReason::Protocol => Error::Protocol("dial rejected as protocol violation"),
                    CloseReason::FlowExceeded => Error::FlowExceeded,
                    _ => Error::Rejected,
                }));
            }
        }
    }

    // ── Shutdown ──────────────────────────────────────────────────────────────

    /// Mark the link dead and fail every channel with `LinkClosed`.
    pub(crate) fn fail(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(server = %self.server_pk.short(), "link closed");
        let slots: Vec<Slot> = {
            let mut table = self.table.lock().unwrap();
            table.slots.drain().map(|(_, slot)| slot).collect()
        };
        for mut slot in slots {
            if let SlotState::Handshaking(tx) = &mut slot.state {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(Err(Error::LinkClosed));
                }
            }
            slot.flags.set_end(end_state::LINK_CLOSED);
            // data_tx drops with the slot, waking pending reads
        }
        let _ = self.shutdown_tx.send(());
    }

    /// Queue best-effort goodbyes for every open channel, then fail the
    /// link. The writer drains the queue before hanging up the socket, so
    /// channels observe `Closed` before the socket is gone.
    pub(crate) fn close_graceful(&self) {
        if self.is_closed() {
            return;
        }
        let ids: Vec<u16> = self.table.lock().unwrap().slots.keys().copied().collect();
        for id in ids {
            let _ = self.out_tx.try_send(Frame::close(id, CloseReason::Normal));
        }
        self.fail();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
