//! Node identity keys.
//!
//! Every node in the mesh is identified by a 32-byte X25519 public key.
//! Keypairs are managed via x25519-dalek for explicit key control; snow
//! consumes the raw private bytes during the noise handshake.
//!
//! All private key material is ZeroizeOnDrop — wiped from memory when
//! dropped.

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use x25519_dalek::StaticSecret;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Length in bytes of public and secret keys.
pub const KEY_LEN: usize = 32;

// ── PublicKey ─────────────────────────────────────────────────────────────────

/// A node's long-term public key. Equality, ordering, and hashing are
/// byte-wise. Rendered as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PublicKey(pub [u8; KEY_LEN]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Parse from a byte slice. Fails unless exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| KeyError::BadLength(bytes.len()))?;
        Ok(Self(arr))
    }

    /// Short hex prefix for log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}..)", self.short())
    }
}

impl FromStr for PublicKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| KeyError::BadHex)?;
        Self::from_slice(&bytes)
    }
}

impl From<[u8; KEY_LEN]> for PublicKey {
    fn from(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

// The directory service speaks JSON; keys travel as hex strings there.

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ── Keypair ───────────────────────────────────────────────────────────────────

/// A node's long-term static X25519 keypair.
///
/// Generated once per node. The public key identifies the node everywhere;
/// the private key never leaves this struct.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Keypair {
    /// Private key — zeroized on drop, never exposed directly.
    private: Zeroizing<[u8; KEY_LEN]>,
    /// Public key — safe to copy around.
    #[zeroize(skip)]
    pub public: PublicKey,
}

impl Keypair {
    /// Generate a new random X25519 keypair.
    pub fn generate() -> Self {
        let mut seed = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut seed);
        let keypair = Self::from_private(seed);
        seed.zeroize();
        keypair
    }

    /// Reconstruct a keypair from stored private key bytes.
    /// The public key is derived deterministically from the private key.
    pub fn from_private(private_bytes: [u8; KEY_LEN]) -> Self {
        let secret = StaticSecret::from(private_bytes);
        let public = x25519_dalek::PublicKey::from(&secret);
        Self {
            private: Zeroizing::new(private_bytes),
            public: PublicKey(*public.as_bytes()),
        }
    }

    /// Serialize the private key for persistent storage.
    ///
    /// Store these bytes securely (mode 0600, ideally encrypted at rest).
    /// The public key need not be stored — it is always derived on load.
    pub fn private_bytes(&self) -> Zeroizing<[u8; KEY_LEN]> {
        Zeroizing::new(*self.private)
    }

    pub(crate) fn private(&self) -> &[u8; KEY_LEN] {
        &self.private
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keypair({}..)", self.public.short())
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("key must be {KEY_LEN} bytes, got {0}")]
    BadLength(usize),

    #[error("key is not valid hex")]
    BadHex,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
