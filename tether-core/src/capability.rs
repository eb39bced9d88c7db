//! Negotiated capability flags.
//!
//! Each peer advertises a 64-bit flag set in its handshake preamble;
//! the effective capabilities of a channel are the bit-wise AND of both
//! sides, so a feature is only used when both peers support it.

use bitflags::bitflags;

use crate::error::TetherError;

bitflags! {
    /// Optional protocol features a peer supports.
    ///
    /// The set is extensible; unknown bits received from a peer are
    /// retained (and ANDed away unless we also advertise them).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u64 {
        /// Multi-chunk framing of command payloads.
        const CHUNKED_ENCODING = 1 << 0;
        /// `Ack`/`NotifyDead` pipe flow control.
        const PIPE_THROTTLING = 1 << 1;
    }
}

impl Capabilities {
    /// The full capability set of this implementation.
    pub fn current() -> Self {
        Capabilities::CHUNKED_ENCODING | Capabilities::PIPE_THROTTLING
    }

    /// Render the ASCII wire token: 16 lowercase hex digits.
    pub fn token(&self) -> String {
        format!("{:016x}", self.bits())
    }

    /// Parse a wire token produced by [`Capabilities::token`].
    ///
    /// Unknown bits are preserved so future peers can extend the set.
    pub fn parse_token(token: &str) -> Result<Self, TetherError> {
        if token.len() != 16 {
            return Err(TetherError::ProtocolViolation(
                "capability token must be 16 hex digits",
            ));
        }
        let bits = u64::from_str_radix(token, 16)
            .map_err(|_| TetherError::ProtocolViolation("capability token is not hex"))?;
        Ok(Capabilities::from_bits_retain(bits))
    }

    /// Effective capabilities for a channel: the intersection of both
    /// peers' advertised sets.
    pub fn negotiate(&self, remote: Capabilities) -> Capabilities {
        *self & remote
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities::current()
    }
}
