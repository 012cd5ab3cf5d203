//! Noise_XK session establishment and the encrypted stream wrapper.
//!
//! Trellis links authenticate with Noise_XK: the initiator must already
//! know the responder's static key, and the responder learns (and
//! authenticates) the initiator's static key from message 3. snow drives
//! the handshake state machine using the keys from [`crate::keys`].
//!
//! After the handshake, [`NoiseStream`] presents a plain byte stream.
//! Plaintext is chunked into noise transport messages, each carried on the
//! wire as `len:u16-be | ciphertext`. A MAC failure surfaces as a fatal
//! `InvalidData` I/O error — callers must drop the connection.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use snow::{Builder, HandshakeState, TransportState};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::keys::{Keypair, PublicKey, KEY_LEN};

/// The noise pattern Trellis uses. XK: the server's static key is known to
/// the dialing client in advance, both sides end up mutually authenticated.
const NOISE_PATTERN: &str = "Noise_XK_25519_ChaChaPoly_BLAKE2s";

/// Poly1305 tag appended to every transport message.
const TAG_LEN: usize = 16;

/// Largest noise message, tag included (protocol-fixed).
const MAX_MESSAGE: usize = 65535;

/// Largest plaintext chunk per transport message.
const MAX_CHUNK: usize = MAX_MESSAGE - TAG_LEN;

/// Scratch size for handshake messages (XK messages are ≤ 64 bytes).
const HANDSHAKE_BUF: usize = 256;

/// Default handshake deadline.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

// ── Handshake ─────────────────────────────────────────────────────────────────

fn builder(keys: &Keypair) -> Result<Builder<'_>, NoiseError> {
    let params = NOISE_PATTERN.parse().map_err(|_| NoiseError::BadPattern)?;
    Ok(Builder::new(params).local_private_key(keys.private()))
}

impl<S> NoiseStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Run the XK handshake as the initiator and wrap `io`.
    ///
    /// `remote` must be the responder's static public key; the handshake
    /// fails if the far side cannot prove possession of it. The whole
    /// exchange is bounded by `deadline`.
    pub async fn initiate(
        io: S,
        keys: &Keypair,
        remote: &PublicKey,
        deadline: Duration,
    ) -> Result<Self, NoiseError> {
        match tokio::time::timeout(deadline, Self::initiate_inner(io, keys, remote)).await {
            Ok(result) => result,
            Err(_) => Err(NoiseError::Timeout),
        }
    }

    async fn initiate_inner(
        mut io: S,
        keys: &Keypair,
        remote: &PublicKey,
    ) -> Result<Self, NoiseError> {
        let mut state = builder(keys)?
            .remote_public_key(remote.as_bytes())
            .build_initiator()
            .map_err(NoiseError::Snow)?;

        let mut buf = vec![0u8; HANDSHAKE_BUF];

        // -> e, es
        let len = state.write_message(&[], &mut buf).map_err(NoiseError::Snow)?;
        send_handshake(&mut io, &buf[..len]).await?;

        // <- e, ee
        let msg2 = recv_handshake(&mut io).await?;
        let mut payload = vec![0u8; HANDSHAKE_BUF];
        state.read_message(&msg2, &mut payload).map_err(NoiseError::Snow)?;

        // -> s, se
        let len = state.write_message(&[], &mut buf).map_err(NoiseError::Snow)?;
        send_handshake(&mut io, &buf[..len]).await?;

        let transport = state.into_transport_mode().map_err(NoiseError::Snow)?;
        Ok(Self::from_transport(io, transport))
    }

    /// Run the XK handshake as the responder and wrap `io`.
    ///
    /// Returns the wrapped stream plus the initiator's authenticated
    /// static public key.
    pub async fn respond(
        io: S,
        keys: &Keypair,
        deadline: Duration,
    ) -> Result<(Self, PublicKey), NoiseError> {
        match tokio::time::timeout(deadline, Self::respond_inner(io, keys)).await {
            Ok(result) => result,
            Err(_) => Err(NoiseError::Timeout),
        }
    }

    async fn respond_inner(mut io: S, keys: &Keypair) -> Result<(Self, PublicKey), NoiseError> {
        let mut state: HandshakeState = builder(keys)?
            .build_responder()
            .map_err(NoiseError::Snow)?;

        let mut buf = vec![0u8; HANDSHAKE_BUF];
        let mut payload = vec![0u8; HANDSHAKE_BUF];

        // <- e, es
        let msg1 = recv_handshake(&mut io).await?;
        state.read_message(&msg1, &mut payload).map_err(NoiseError::Snow)?;

        // -> e, ee
        let len = state.write_message(&[], &mut buf).map_err(NoiseError::Snow)?;
        send_handshake(&mut io, &buf[..len]).await?;

        // <- s, se
        let msg3 = recv_handshake(&mut io).await?;
        state.read_message(&msg3, &mut payload).map_err(NoiseError::Snow)?;

        let remote = state
            .get_remote_static()
            .and_then(|bytes| <[u8; KEY_LEN]>::try_from(bytes).ok())
            .map(PublicKey::from)
            .ok_or(NoiseError::MissingRemoteStatic)?;

        let transport = state.into_transport_mode().map_err(NoiseError::Snow)?;
        Ok((Self::from_transport(io, transport), remote))
    }
}

async fn send_handshake<S: AsyncWrite + Unpin>(io: &mut S, msg: &[u8]) -> Result<(), NoiseError> {
    io.write_u16(msg.len() as u16).await?;
    io.write_all(msg).await?;
    io.flush().await?;
    Ok(())
}

async fn recv_handshake<S: AsyncRead + Unpin>(io: &mut S) -> Result<Vec<u8>, NoiseError> {
    let len = io.read_u16().await? as usize;
    let mut msg = vec![0u8; len];
    io.read_exact(&mut msg).await?;
    Ok(msg)
}

// ── Encrypted stream ──────────────────────────────────────────────────────────

/// An encrypted, mutually-authenticated byte stream over `S`.
///
/// Reads and writes are transparently chunked into noise transport
/// messages. The type is safe to `tokio::io::split`: snow keeps
/// independent cipher states per direction.
#[derive(Debug)]
pub struct NoiseStream<S> {
    io: S,
    transport: TransportState,
    /// Decrypted bytes not yet handed to the caller.
    read_plain: BytesMut,
    /// Raw wire bytes, possibly a partial length-prefixed message.
    read_raw: BytesMut,
    /// Ciphertext queued for the wire.
    write_raw: BytesMut,
}

impl<S> NoiseStream<S> {
    fn from_transport(io: S, transport: TransportState) -> Self {
        Self {
            io,
            transport,
            read_plain: BytesMut::new(),
            read_raw: BytesMut::new(),
            write_raw: BytesMut::new(),
        }
    }
}

impl<S> AsyncRead for NoiseStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.read_plain.is_empty() {
                let n = this.read_plain.len().min(buf.remaining());
                buf.put_slice(&this.read_plain.split_to(n));
                return Poll::Ready(Ok(()));
            }

            // Assemble the next length-prefixed ciphertext message.
            if this.read_raw.len() >= 2 {
                let msg_len = u16::from_be_bytes([this.read_raw[0], this.read_raw[1]]) as usize;
                if this.read_raw.len() >= 2 + msg_len {
                    this.read_raw.advance(2);
                    let cipher = this.read_raw.split_to(msg_len);
                    let mut plain = vec![0u8; msg_len];
                    let n = this
                        .transport
                        .read_message(&cipher, &mut plain)
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                    this.read_plain.extend_from_slice(&plain[..n]);
                    continue;
                }
            }

            // Need more wire bytes.
            let mut tmp = [0u8; 8192];
            let mut tmp_buf = ReadBuf::new(&mut tmp);
            match Pin::new(&mut this.io).poll_read(cx, &mut tmp_buf) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(())) => {
                    let filled = tmp_buf.filled();
                    if filled.is_empty() {
                        if this.read_raw.is_empty() {
                            return Poll::Ready(Ok(())); // clean end of stream
                        }
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "stream ended inside a noise message",
                        )));
                    }
                    this.read_raw.extend_from_slice(filled);
                }
            }
        }
    }
}

impl<S> AsyncWrite for NoiseStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        // Drain previously queued ciphertext before encrypting more, so the
        // internal buffer stays bounded by one message.
        while !this.write_raw.is_empty() {
            match Pin::new(&mut this.io).poll_write(cx, &this.write_raw) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                Poll::Ready(Ok(n)) => this.write_raw.advance(n),
            }
        }

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let chunk = &buf[..buf.len().min(MAX_CHUNK)];
        let mut cipher = vec![0u8; chunk.len() + TAG_LEN];
        let n = this
            .transport
            .write_message(chunk, &mut cipher)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        this.write_raw.extend_from_slice(&(n as u16).to_be_bytes());
        this.write_raw.extend_from_slice(&cipher[..n]);

        // Opportunistic drain; leftovers go out on the next write or flush.
        // The plaintext is already committed either way.
        while !this.write_raw.is_empty() {
            match Pin::new(&mut this.io).poll_write(cx, &this.write_raw) {
                Poll::Pending => break,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                Poll::Ready(Ok(n)) => this.write_raw.advance(n),
            }
        }

        Poll::Ready(Ok(chunk.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        while !this.write_raw.is_empty() {
            let n = ready!(Pin::new(&mut this.io).poll_write(cx, &this.write_raw))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            this.write_raw.advance(n);
        }
        Pin::new(&mut this.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.as_mut().poll_flush(cx))?;
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum NoiseError {
    #[error("invalid noise pattern string — this is a bug")]
    BadPattern,

    #[error("noise protocol error: {0}")]
    Snow(snow::Error),

    #[error("handshake i/o failure: {0}")]
    Io(#[from] io::Error),

    #[error("handshake timed out")]
    Timeout,

    #[error("responder completed handshake without a remote static key")]
    MissingRemoteStatic,
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn handshake_pair() -> (NoiseStream<tokio::io::DuplexStream>, NoiseStream<tokio::io::DuplexStream>, PublicKey) {
        let client = Keypair::generate();
        let server = Keypair::generate();
        let server_pk = server.public;

        let (a, b) = tokio::io::duplex(4096);
        let (initiated, responded) = tokio::join!(
            NoiseStream::initiate(a, &client, &server_pk, DEFAULT_HANDSHAKE_TIMEOUT),
            NoiseStream::respond(b, &server, DEFAULT_HANDSHAKE_TIMEOUT),
        );
        let (server_side, learned_pk) = responded.unwrap();
        assert_eq!(learned_pk, client.public);
        (initiated.unwrap(), server_side, client.public)
    }

    #[tokio::test]
    async fn handshake_completes_and_authenticates() {
        handshake_pair().await;
    }

    #[tokio::test]
    async fn both_directions_carry_data() {
        let (mut a, mut b, _) = handshake_pair().await;

        a.write_all(b"ping").await.unwrap();
        a.flush().await.unwrap();
        let mut got = [0u8; 4];
        b.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"ping");

        b.write_all(b"pong").await.unwrap();
        b.flush().await.unwrap();
        a.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"pong");
    }

    #[tokio::test]
    async fn large_transfer_crosses_message_boundaries() {
        let (mut a, mut b, _) = handshake_pair().await;
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            a.write_all(&payload).await.unwrap();
            a.flush().await.unwrap();
            a // keep the stream alive until the reader is done
        });

        let mut got = vec![0u8; expected.len()];
        b.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expected);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn initiator_with_wrong_server_key_fails() {
        let client = Keypair::generate();
        let server = Keypair::generate();
        let not_the_server = Keypair::generate().public;

        let (a, b) = tokio::io::duplex(4096);
        let (initiated, responded) = tokio::join!(
            NoiseStream::initiate(a, &client, &not_the_server, Duration::from_secs(2)),
            NoiseStream::respond(b, &server, Duration::from_secs(2)),
        );
        assert!(initiated.is_err());
        assert!(responded.is_err());
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let server = Keypair::generate();
        let (a, _b) = tokio::io::duplex(64);
        let err = NoiseStream::respond(a, &server, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, NoiseError::Timeout));
    }

    #[tokio::test]
    async fn split_halves_work_concurrently() {
        let (a, b, _) = handshake_pair().await;
        let (mut ar, mut aw) = tokio::io::split(a);
        let (mut br, mut bw) = tokio::io::split(b);

        let echo = tokio::spawn(async move {
            let mut buf = [0u8; 5];
            br.read_exact(&mut buf).await.unwrap();
            bw.write_all(&buf).await.unwrap();
            bw.flush().await.unwrap();
        });

        aw.write_all(b"hello").await.unwrap();
        aw.flush().await.unwrap();
        let mut got = [0u8; 5];
        ar.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello");
        echo.await.unwrap();
    }
}
