//! trellis-relay — rendezvous relay server and client library.
//!
//! Clients keep one noise-encrypted TCP link per relay server and
//! multiplex channels over it; servers pair up the two links of every
//! channel and forward frames between them. Peer discovery goes through
//! the [`discovery::Directory`] trait; everything above channels (routing,
//! application framing) lives outside this crate.

pub mod config;
pub mod discovery;
pub mod error;

mod channel;
mod client;
mod link;
mod server;

pub use channel::Channel;
pub use client::Client;
pub use config::{ClientConfig, ServerConfig};
pub use error::{Error, Result};
pub use server::Server;
