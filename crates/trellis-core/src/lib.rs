//! trellis-core — wire format, keys, and noise session for the Trellis
//! relay mesh. The relay protocol itself lives in `trellis-relay`; this
//! crate only knows about byte streams.

pub mod frame;
pub mod keys;
pub mod noise;

pub use frame::{CloseReason, Frame, FrameType};
pub use keys::{Keypair, PublicKey};
pub use noise::NoiseStream;
