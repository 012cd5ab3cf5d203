//! Error taxonomy for the relay layer.
//!
//! Link-fatal kinds (`Io`, `Crypto`, framing) fail every channel on the
//! link with `LinkClosed` on its next operation. `Protocol` kills only the
//! offending channel. The remaining kinds are per-operation.

use trellis_core::frame::FrameError;
use trellis_core::noise::NoiseError;

use crate::discovery::DirectoryError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("crypto failure: {0}")]
    Crypto(#[from] NoiseError),

    #[error("framing failure: {0}")]
    Frame(#[from] FrameError),

    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    #[error("channel open rejected by remote")]
    Rejected,

    #[error("channel is closed")]
    ChannelClosed,

    #[error("link is closed")]
    LinkClosed,

    #[error("client is closed")]
    ClientClosed,

    #[error("remote has no delegated servers")]
    NoDelegatedServer,

    #[error("no relay servers are reachable")]
    NoAvailableServers,

    #[error("all channel ids of local parity are in use")]
    ExhaustedChannelIds,

    #[error("inbound flow budget exceeded")]
    FlowExceeded,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("directory failure: {0}")]
    Directory(#[from] DirectoryError),
}

pub type Result<T> = std::result::Result<T, Error>;
