//! Channel lifecycle state machine.
//!
//! ```text
//!           ┌──── Alive ───────┐
//!           │                  │
//!        close()         terminate(cause)
//!           │                  │
//!           ▼                  ▼
//!     CloseRequested ────► Terminated
//!       (Close received / transport down)
//! ```
//!
//! Both teardown paths converge on `Terminated`; transitions are
//! idempotent, so racing `close()` and `terminate()` callers are safe.

/// The lifecycle phase of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelPhase {
    /// Accepting outbound commands; inbound commands execute normally.
    #[default]
    Alive,

    /// Our half is closed: the `Close` command is the last thing we
    /// send. Inbound commands still execute until the reciprocal
    /// `Close` arrives.
    CloseRequested,

    /// Both halves closed. Terminal.
    Terminated,
}

impl ChannelPhase {
    /// Whether new outbound commands are accepted.
    pub fn outbound_open(&self) -> bool {
        matches!(self, Self::Alive)
    }

    /// Whether the channel reached its terminal state.
    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// Move to `CloseRequested`. Returns `true` if this call made the
    /// transition (the caller then owns sending the `Close` command).
    pub fn request_close(&mut self) -> bool {
        match self {
            Self::Alive => {
                *self = Self::CloseRequested;
                true
            }
            Self::CloseRequested | Self::Terminated => false,
        }
    }

    /// Move to `Terminated`. Returns `true` if this call made the
    /// transition (the caller then owns the teardown side effects).
    pub fn terminate(&mut self) -> bool {
        match self {
            Self::Terminated => false,
            _ => {
                *self = Self::Terminated;
                true
            }
        }
    }
}

impl std::fmt::Display for ChannelPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Alive => write!(f, "Alive"),
            Self::CloseRequested => write!(f, "CloseRequested"),
            Self::Terminated => write!(f, "Terminated"),
        }
    }
}
