//! # tether-core
//!
//! Symmetric, full-duplex remoting runtime: two peers execute
//! operations on each other's exported objects over a single
//! bidirectional byte stream. There is no client or server beyond who
//! initiated the transport; both ends are identical in capability.
//!
//! This crate contains:
//! - **Capabilities & handshake**: `Capabilities`, preamble exchange,
//!   mode sentinels, legacy fallback
//! - **Framing**: `FrameEncoder` / `FrameDecoder` (chunked and legacy)
//!   with a flight recorder for corruption diagnostics
//! - **Commands**: the `Command` catalog and its execution paths
//! - **Exports & proxies**: `ExportTable`, `RemoteObject`,
//!   `RemoteHandle`, `RemoteRef` round-tripping with object identity
//! - **RPC**: request/response pairing, `PendingCall`, cancellation on
//!   teardown
//! - **Pipes**: flow-controlled byte streams (`RemotePipeWriter`,
//!   `PipeReader`, `PipeWindow`) on a single-lane executor
//! - **Channel**: `Channel` / `ChannelBuilder` — lifecycle,
//!   properties, listeners, counters
//! - **Content**: the `ContentStore` contract for loaders built on top

pub mod capability;
pub mod channel;
pub mod codec;
pub mod command;
pub mod content;
pub mod dispatch;
pub mod error;
pub mod export;
pub mod handshake;
pub mod marshal;
pub mod pipe;
pub mod proxy;
pub mod transport;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use capability::Capabilities;
pub use channel::{
    CHANNEL_INTERFACE, Channel, ChannelBuilder, ChannelDiagnostics, ChannelListener, ChannelPhase,
};
pub use codec::{FlightRecorder, FrameDecoder, FrameEncoder, Framing};
pub use command::Command;
pub use content::{ContentKey, ContentStore, MemoryContentStore};
pub use dispatch::PendingCall;
pub use error::TetherError;
pub use export::{CHANNEL_OID, ExportRecording, ExportTable, Exported};
pub use handshake::Mode;
pub use marshal::{BincodeWire, WireFormat, current_channel, decode_value, encode_value};
pub use pipe::{PipeReader, PipeSink, PipeWindow, RemotePipeWriter};
pub use proxy::{CallPayload, RemoteHandle, RemoteObject, RemoteRef, Resolved};
