//! Tunables for the relay client and server.
//!
//! Defaults are sized for the common case; tests shrink the receive budget
//! to provoke flow-control behaviour. Durations are carried as integer
//! milliseconds in the serialized form.

use std::time::Duration;

use serde::Deserialize;

/// Client-side knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Noise handshake deadline, in milliseconds.
    pub handshake_timeout_ms: u64,
    /// How long `dial` waits for the remote's `Accept`, in milliseconds.
    pub dial_timeout_ms: u64,
    /// Per-channel inbound budget in bytes. A channel whose unread inbound
    /// bytes exceed this is closed with `FlowExceeded`.
    pub recv_budget_bytes: usize,
    /// Per-channel inbound queue length in frames. Exceeding it is also
    /// treated as a flow violation (guards against tiny-frame floods).
    pub recv_queue_frames: usize,
    /// Outbound writer queue length in frames, per link.
    pub send_queue_frames: usize,
    /// Inbound channels buffered between the links and `accept()`.
    pub accept_queue: usize,
    /// Directory cache lifetime, in milliseconds.
    pub directory_cache_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
            dial_timeout_ms: 30_000,
            recv_budget_bytes: 64 * 1024,
            recv_queue_frames: 256,
            send_queue_frames: 64,
            accept_queue: 128,
            directory_cache_ms: 5_000,
        }
    }
}

impl ClientConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn directory_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.directory_cache_ms)
    }

    /// Parse from a TOML document. Missing fields take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}

/// Server-side knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Noise handshake deadline, in milliseconds.
    pub handshake_timeout_ms: u64,
    /// Outbound writer queue length in frames, per client link.
    pub send_queue_frames: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
            send_queue_frames: 64,
        }
    }
}

impl ServerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Parse from a TOML document. Missing fields take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = ClientConfig::default();
        assert_eq!(c.handshake_timeout(), Duration::from_secs(10));
        assert_eq!(c.recv_budget_bytes, 64 * 1024);
        let s = ServerConfig::default();
        assert_eq!(s.handshake_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let c = ClientConfig::from_toml_str("recv_budget_bytes = 4096").unwrap();
        assert_eq!(c.recv_budget_bytes, 4096);
        assert_eq!(c.dial_timeout_ms, ClientConfig::default().dial_timeout_ms);
    }

    #[test]
    fn bad_toml_is_an_error() {
        assert!(ServerConfig::from_toml_str("send_queue_frames = \"many\"").is_err());
    }
}
