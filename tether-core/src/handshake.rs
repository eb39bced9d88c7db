//! Channel setup — the capability preamble and mode sentinels
//! exchanged before any command frame.
//!
//! Each side writes the ASCII marker `[TETHER-CAPS]`, a 32-hex-digit
//! token (16 digits of capability flags followed by 16 digits of
//! channel identity), a newline, and a 4-byte mode sentinel. The
//! identity half is what lets a serialized object reference find its
//! way home (see [`RemoteRef`]).
//!
//! A peer whose first bytes are not the marker is a legacy peer: the
//! consumed bytes are preserved for the frame decoder and the channel
//! falls back to legacy length-prefix framing with an empty capability
//! set.
//!
//! [`RemoteRef`]: crate::proxy::RemoteRef

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::capability::Capabilities;
use crate::codec::Framing;
use crate::error::TetherError;

/// ASCII marker opening a capability preamble.
pub const CAPS_MARKER: &[u8] = b"[TETHER-CAPS]";

/// Terminator of the capability token.
pub const CAPS_TERMINATOR: u8 = b'\n';

/// Total hex digits in the preamble token.
const TOKEN_DIGITS: usize = 32;

/// Sentinel: this side speaks binary frames.
pub const SENTINEL_BINARY: [u8; 4] = [0, 0, 0, 0];

/// Sentinel: this side defers mode selection to the peer.
pub const SENTINEL_NEGOTIATE: [u8; 4] = *b"NEG?";

/// How this side opens the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Transmit the binary sentinel.
    #[default]
    Binary,
    /// Defer to whichever side transmits a non-negotiate sentinel.
    /// Both sides negotiating is a setup error.
    Negotiate,
}

impl Mode {
    fn sentinel(self) -> [u8; 4] {
        match self {
            Mode::Binary => SENTINEL_BINARY,
            Mode::Negotiate => SENTINEL_NEGOTIATE,
        }
    }
}

/// What the preamble exchange concluded.
#[derive(Debug)]
pub(crate) struct HandshakeOutcome {
    /// The peer's advertised capabilities (empty for a legacy peer).
    pub remote_caps: Capabilities,
    /// The peer's channel identity (0 for a legacy peer).
    pub remote_token: u64,
    /// Framing both sides will speak.
    pub framing: Framing,
    /// Bytes consumed from the reader that belong to the frame stream
    /// (non-empty only on the legacy fallback path).
    pub leftover: Vec<u8>,
}

/// Run the preamble exchange over split transport halves.
///
/// Writing and reading proceed concurrently; the preamble is small
/// enough that neither side can stall the other.
pub(crate) async fn exchange<R, W>(
    reader: &mut R,
    writer: &mut W,
    local_caps: Capabilities,
    local_token: u64,
    mode: Mode,
) -> Result<HandshakeOutcome, TetherError>
where
    R: tokio::io::AsyncRead + Send + Unpin,
    W: tokio::io::AsyncWrite + Send + Unpin,
{
    let write_side = async {
        let mut preamble = Vec::with_capacity(CAPS_MARKER.len() + TOKEN_DIGITS + 5);
        preamble.extend_from_slice(CAPS_MARKER);
        preamble.extend_from_slice(local_caps.token().as_bytes());
        preamble.extend_from_slice(format!("{local_token:016x}").as_bytes());
        preamble.push(CAPS_TERMINATOR);
        preamble.extend_from_slice(&mode.sentinel());
        writer.write_all(&preamble).await?;
        writer.flush().await?;
        Ok::<(), TetherError>(())
    };

    let read_side = read_preamble(reader);
    let ((), peer) = tokio::try_join!(write_side, read_side)?;

    match peer {
        Peer::Legacy { consumed } => Ok(HandshakeOutcome {
            remote_caps: Capabilities::empty(),
            remote_token: 0,
            framing: Framing::Legacy,
            leftover: consumed,
        }),
        Peer::Preamble {
            caps: remote_caps,
            token: remote_token,
            sentinel,
        } => {
            match (mode, sentinel) {
                (_, SENTINEL_BINARY) => {}
                (Mode::Binary, SENTINEL_NEGOTIATE) => {}
                (Mode::Negotiate, SENTINEL_NEGOTIATE) => {
                    return Err(TetherError::ProtocolViolation(
                        "both peers deferred mode negotiation",
                    ));
                }
                _ => {
                    return Err(TetherError::ProtocolViolation("unknown mode sentinel"));
                }
            }

            let effective = local_caps.negotiate(remote_caps);
            let framing = if effective.contains(Capabilities::CHUNKED_ENCODING) {
                Framing::Chunked
            } else {
                Framing::Legacy
            };
            Ok(HandshakeOutcome {
                remote_caps,
                remote_token,
                framing,
                leftover: Vec::new(),
            })
        }
    }
}

enum Peer {
    Preamble {
        caps: Capabilities,
        token: u64,
        sentinel: [u8; 4],
    },
    Legacy {
        consumed: Vec<u8>,
    },
}

async fn read_preamble<R>(reader: &mut R) -> Result<Peer, TetherError>
where
    R: tokio::io::AsyncRead + Send + Unpin,
{
    // Match the marker byte by byte so a mismatch hands every consumed
    // byte back to the legacy frame stream.
    let mut consumed = Vec::with_capacity(CAPS_MARKER.len());
    for expected in CAPS_MARKER {
        let b = reader.read_u8().await?;
        consumed.push(b);
        if b != *expected {
            return Ok(Peer::Legacy { consumed });
        }
    }

    // Marker matched: a bounded token terminated by a newline follows.
    let mut token = Vec::with_capacity(TOKEN_DIGITS);
    loop {
        let b = reader.read_u8().await?;
        if b == CAPS_TERMINATOR {
            break;
        }
        token.push(b);
        if token.len() > TOKEN_DIGITS {
            return Err(TetherError::ProtocolViolation("preamble token too long"));
        }
    }
    if token.len() != TOKEN_DIGITS {
        return Err(TetherError::ProtocolViolation("preamble token too short"));
    }
    if !token.is_ascii() {
        return Err(TetherError::ProtocolViolation("preamble token is not ascii"));
    }
    let token = std::str::from_utf8(&token)
        .map_err(|_| TetherError::ProtocolViolation("preamble token is not ascii"))?;
    let caps = Capabilities::parse_token(&token[..16])?;
    let identity = u64::from_str_radix(&token[16..], 16)
        .map_err(|_| TetherError::ProtocolViolation("channel identity is not hex"))?;

    let mut sentinel = [0u8; 4];
    reader.read_exact(&mut sentinel).await?;

    Ok(Peer::Preamble {
        caps,
        token: identity,
        sentinel,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pair() -> (tokio::io::DuplexStream, tokio::io::DuplexStream) {
        tokio::io::duplex(4096)
    }

    #[tokio::test]
    async fn both_binary_negotiates_chunked() {
        let (a, b) = pair().await;
        let (mut ar, mut aw) = tokio::io::split(a);
        let (mut br, mut bw) = tokio::io::split(b);

        let left = exchange(&mut ar, &mut aw, Capabilities::current(), 11, Mode::Binary);
        let right = exchange(&mut br, &mut bw, Capabilities::current(), 22, Mode::Binary);
        let (left, right) = tokio::try_join!(left, right).unwrap();

        assert_eq!(left.framing, Framing::Chunked);
        assert_eq!(right.framing, Framing::Chunked);
        assert_eq!(left.remote_caps, Capabilities::current());
        assert_eq!(left.remote_token, 22);
        assert_eq!(right.remote_token, 11);
        assert!(left.leftover.is_empty());
    }

    #[tokio::test]
    async fn missing_chunked_capability_falls_back_to_legacy_framing() {
        let (a, b) = pair().await;
        let (mut ar, mut aw) = tokio::io::split(a);
        let (mut br, mut bw) = tokio::io::split(b);

        let left = exchange(&mut ar, &mut aw, Capabilities::current(), 1, Mode::Binary);
        let right = exchange(
            &mut br,
            &mut bw,
            Capabilities::PIPE_THROTTLING,
            2,
            Mode::Binary,
        );
        let (left, right) = tokio::try_join!(left, right).unwrap();

        assert_eq!(left.framing, Framing::Legacy);
        assert_eq!(right.framing, Framing::Legacy);
    }

    #[tokio::test]
    async fn negotiate_defers_to_binary_peer() {
        let (a, b) = pair().await;
        let (mut ar, mut aw) = tokio::io::split(a);
        let (mut br, mut bw) = tokio::io::split(b);

        let left = exchange(&mut ar, &mut aw, Capabilities::current(), 1, Mode::Negotiate);
        let right = exchange(&mut br, &mut bw, Capabilities::current(), 2, Mode::Binary);
        let (left, right) = tokio::try_join!(left, right).unwrap();

        assert_eq!(left.framing, Framing::Chunked);
        assert_eq!(right.framing, Framing::Chunked);
    }

    #[tokio::test]
    async fn both_negotiate_is_a_setup_error() {
        let (a, b) = pair().await;
        let (mut ar, mut aw) = tokio::io::split(a);
        let (mut br, mut bw) = tokio::io::split(b);

        let left = exchange(&mut ar, &mut aw, Capabilities::current(), 1, Mode::Negotiate);
        let right = exchange(&mut br, &mut bw, Capabilities::current(), 2, Mode::Negotiate);
        let (left, right) = tokio::join!(left, right);

        assert!(matches!(left, Err(TetherError::ProtocolViolation(_))));
        assert!(matches!(right, Err(TetherError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn non_preamble_peer_falls_back_with_bytes_preserved() {
        let (a, b) = pair().await;
        let (mut ar, mut aw) = tokio::io::split(a);
        let (_br, mut bw) = tokio::io::split(b);

        // The "peer" opens with a legacy length-prefixed frame instead
        // of a preamble.
        bw.write_all(&[0, 0, 0, 5, b'h', b'e', b'l', b'l', b'o'])
            .await
            .unwrap();
        bw.flush().await.unwrap();

        let outcome = exchange(&mut ar, &mut aw, Capabilities::current(), 1, Mode::Binary)
            .await
            .unwrap();
        assert_eq!(outcome.framing, Framing::Legacy);
        assert_eq!(outcome.remote_caps, Capabilities::empty());
        assert_eq!(outcome.remote_token, 0);
        // The mismatching byte is preserved for the decoder.
        assert_eq!(outcome.leftover, vec![0]);
    }

    #[tokio::test]
    async fn malformed_token_is_rejected() {
        let (a, b) = pair().await;
        let (mut ar, mut aw) = tokio::io::split(a);
        let (_br, mut bw) = tokio::io::split(b);

        bw.write_all(CAPS_MARKER).await.unwrap();
        bw.write_all(b"nothexnothexnothexnothexnothexno\n").await.unwrap();
        bw.write_all(&SENTINEL_BINARY).await.unwrap();
        bw.flush().await.unwrap();

        let err = exchange(&mut ar, &mut aw, Capabilities::current(), 1, Mode::Binary)
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn short_token_is_rejected() {
        let (a, b) = pair().await;
        let (mut ar, mut aw) = tokio::io::split(a);
        let (_br, mut bw) = tokio::io::split(b);

        bw.write_all(CAPS_MARKER).await.unwrap();
        bw.write_all(b"0000000000000003\n").await.unwrap();
        bw.write_all(&SENTINEL_BINARY).await.unwrap();
        bw.flush().await.unwrap();

        let err = exchange(&mut ar, &mut aw, Capabilities::current(), 1, Mode::Binary)
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::ProtocolViolation(_)));
    }
}
