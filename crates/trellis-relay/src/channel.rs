//! A channel — one bidirectional byte stream between two clients.
//!
//! The user-facing handle owns the receive side of the channel's bounded
//! inbound queue. The link's demultiplexer owns the send side and the
//! table slot. The handle holds only a weak reference back to the link:
//! the link owns its channels, never the other way around.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Buf, Bytes};
use tokio::sync::mpsc;
use trellis_core::frame::{Frame, MAX_PAYLOAD};
use trellis_core::keys::PublicKey;

use crate::error::{Error, Result};
use crate::link::LinkCore;

// ── Shared channel state ──────────────────────────────────────────────────────

/// Why a channel's inbound stream ended. `None` means it has not.
pub(crate) mod end_state {
    pub const NONE: u8 = 0;
    pub const REMOTE_CLOSED: u8 = 1;
    pub const LINK_CLOSED: u8 = 2;
    pub const PROTOCOL: u8 = 3;
    pub const FLOW_EXCEEDED: u8 = 4;
}

/// State shared between a channel handle and its link table slot.
///
/// `queued_bytes` tracks unread inbound payload; the link refuses to
/// enqueue past the configured budget (see the flow policy in `link.rs`).
pub(crate) struct ChannelFlags {
    pub(crate) local_closed: AtomicBool,
    end: AtomicU8,
    queued_bytes: AtomicUsize,
}

impl ChannelFlags {
    pub(crate) fn new() -> Self {
        Self {
            local_closed: AtomicBool::new(false),
            end: AtomicU8::new(end_state::NONE),
            queued_bytes: AtomicUsize::new(0),
        }
    }

    pub(crate) fn end(&self) -> u8 {
        self.end.load(Ordering::SeqCst)
    }

    /// First end state wins; later transitions are ignored.
    pub(crate) fn set_end(&self, state: u8) {
        let _ = self.end.compare_exchange(
            end_state::NONE,
            state,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Reserve queue budget for an inbound payload. Fails when the unread
    /// backlog would exceed `budget`.
    pub(crate) fn try_reserve(&self, len: usize, budget: usize) -> bool {
        let prev = self.queued_bytes.fetch_add(len, Ordering::SeqCst);
        if prev + len > budget {
            self.queued_bytes.fetch_sub(len, Ordering::SeqCst);
            return false;
        }
        true
    }

    pub(crate) fn release(&self, len: usize) {
        self.queued_bytes.fetch_sub(len, Ordering::SeqCst);
    }
}

// ── Channel ───────────────────────────────────────────────────────────────────

/// One end-to-end bidirectional byte stream, identified by a 16-bit ID
/// within its link.
///
/// Byte order is preserved; message boundaries are not. All operations are
/// cancel-safe and may be raced against `tokio::time::timeout`.
pub struct Channel {
    id: u16,
    local_pk: PublicKey,
    remote_pk: PublicKey,
    link: Weak<LinkCore>,
    rx: mpsc::Receiver<Bytes>,
    leftover: Bytes,
    flags: Arc<ChannelFlags>,
}

impl Channel {
    pub(crate) fn new(
        id: u16,
        local_pk: PublicKey,
        remote_pk: PublicKey,
        link: Weak<LinkCore>,
        rx: mpsc::Receiver<Bytes>,
        flags: Arc<ChannelFlags>,
    ) -> Self {
        Self {
            id,
            local_pk,
            remote_pk,
            link,
            rx,
            leftover: Bytes::new(),
            flags,
        }
    }

    /// The channel's ID on its link.
    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn local_pk(&self) -> PublicKey {
        self.local_pk
    }

    /// The public key of the client on the far end.
    pub fn remote_pk(&self) -> PublicKey {
        self.remote_pk
    }

    /// Whether the channel can no longer carry data in either direction.
    pub fn is_closed(&self) -> bool {
        self.flags.local_closed.load(Ordering::SeqCst) || self.flags.end() != end_state::NONE
    }

    /// Read up to `buf.len()` bytes. `Ok(0)` means the remote closed the
    /// channel and the inbound queue is drained.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if !self.leftover.is_empty() {
                let n = self.leftover.len().min(buf.len());
                buf[..n].copy_from_slice(&self.leftover[..n]);
                self.leftover.advance(n);
                return Ok(n);
            }
            match self.rx.recv().await {
                Some(bytes) => {
                    self.flags.release(bytes.len());
                    self.leftover = bytes;
                }
                None => return self.end_of_stream(),
            }
        }
    }

    /// Write all of `buf`, chunked into data frames. Returns the number of
    /// bytes accepted by the link's writer.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let link = self.link.upgrade().ok_or(Error::LinkClosed)?;
        let mut written = 0;
        for chunk in buf.chunks(MAX_PAYLOAD) {
            self.check_writable()?;
            link.send_frame(Frame::data(self.id, Bytes::copy_from_slice(chunk)))
                .await?;
            written += chunk.len();
        }
        Ok(written)
    }

    /// Close the channel. Emits a `Close` frame, clears the table slot,
    /// and wakes any pending read. Idempotent.
    pub async fn close(&self) {
        if self.flags.local_closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(link) = self.link.upgrade() {
            link.finish_channel(self.id, &self.flags).await;
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.flags.local_closed.load(Ordering::SeqCst) {
            return Err(Error::ChannelClosed);
        }
        match self.flags.end() {
            end_state::NONE => Ok(()),
            end_state::REMOTE_CLOSED => Err(Error::ChannelClosed),
            end_state::LINK_CLOSED => Err(Error::LinkClosed),
            end_state::FLOW_EXCEEDED => Err(Error::FlowExceeded),
            _ => Err(Error::Protocol("channel killed by protocol violation")),
        }
    }

    fn end_of_stream(&self) -> Result<usize> {
        match self.flags.end() {
            end_state::NONE | end_state::REMOTE_CLOSED => Ok(0),
            end_state::LINK_CLOSED => Err(Error::LinkClosed),
            end_state::FLOW_EXCEEDED => Err(Error::FlowExceeded),
            _ => Err(Error::Protocol("channel killed by protocol violation")),
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // Best-effort goodbye for handles discarded without close().
        if self.flags.local_closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(link) = self.link.upgrade() {
            link.finish_channel_sync(self.id, &self.flags);
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("remote", &self.remote_pk)
            .field("closed", &self.is_closed())
            .finish()
    }
}
