//! Wire framing — Decoder / Encoder for `tokio_util::codec::Framed`.
//!
//! The codec moves opaque serialized command payloads; it never looks
//! inside them. Two framings exist, chosen during the handshake:
//!
//! - **Chunked**: each chunk carries a 2-byte big-endian header whose
//!   low 15 bits are the chunk payload length (0..=32767) and whose top
//!   bit marks the final chunk of a logical command. Zero-length final
//!   chunks are legal.
//! - **Legacy**: one 4-byte big-endian length prefix per command.
//!
//! Every byte consumed on the read side passes through the
//! [`FlightRecorder`] so a corruption diagnostic can show the recent
//! wire history.

pub mod recorder;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::TetherError;

pub use recorder::{DEFAULT_RECORDER_CAPACITY, FlightRecorder};

/// Largest single chunk payload in chunked framing (15 bits).
pub const CHUNK_MAX: usize = 0x7FFF;

/// Final-chunk marker in the chunk header.
pub const FINAL_BIT: u16 = 0x8000;

/// Default cap on one logical command payload.
pub const DEFAULT_MAX_COMMAND: usize = 16 * 1024 * 1024;

/// Which on-wire framing a channel speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Multi-chunk framing (requires `CHUNKED_ENCODING` on both sides).
    Chunked,
    /// Single length-prefixed blob per command.
    Legacy,
}

// ── Encoder ──────────────────────────────────────────────────────

/// Splits serialized command payloads into wire frames.
#[derive(Debug)]
pub struct FrameEncoder {
    framing: Framing,
    max_command: usize,
}

impl FrameEncoder {
    pub fn new(framing: Framing, max_command: usize) -> Self {
        Self {
            framing,
            max_command,
        }
    }
}

impl Encoder<Bytes> for FrameEncoder {
    type Error = TetherError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_command {
            return Err(TetherError::FrameTooLarge {
                size: item.len(),
                max: self.max_command,
            });
        }

        match self.framing {
            Framing::Legacy => {
                dst.reserve(4 + item.len());
                dst.put_u32(item.len() as u32);
                dst.extend_from_slice(&item);
            }
            Framing::Chunked => {
                if item.is_empty() {
                    // A zero-length final chunk is a complete command.
                    dst.put_u16(FINAL_BIT);
                    return Ok(());
                }
                let mut rest = &item[..];
                dst.reserve(item.len() + 2 * item.len().div_ceil(CHUNK_MAX));
                while !rest.is_empty() {
                    let n = rest.len().min(CHUNK_MAX);
                    let mut header = n as u16;
                    if n == rest.len() {
                        header |= FINAL_BIT;
                    }
                    dst.put_u16(header);
                    dst.extend_from_slice(&rest[..n]);
                    rest = &rest[n..];
                }
            }
        }
        Ok(())
    }
}

// ── Decoder ──────────────────────────────────────────────────────

/// Reassembles wire frames into logical command payloads.
#[derive(Debug)]
pub struct FrameDecoder {
    framing: Framing,
    max_command: usize,
    recorder: FlightRecorder,
    /// Chunked mode: payload accumulated across non-final chunks.
    assembly: BytesMut,
}

impl FrameDecoder {
    pub fn new(framing: Framing, max_command: usize, recorder_capacity: usize) -> Self {
        Self {
            framing,
            max_command,
            recorder: FlightRecorder::new(recorder_capacity),
            assembly: BytesMut::new(),
        }
    }

    /// The flight recorder fed by this decoder.
    pub fn recorder(&self) -> &FlightRecorder {
        &self.recorder
    }

    fn decode_legacy(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, TetherError> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > self.max_command {
            self.recorder.record(&src[..4]);
            return Err(TetherError::FrameTooLarge {
                size: len,
                max: self.max_command,
            });
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }
        self.recorder.record(&src[..4 + len]);
        src.advance(4);
        Ok(Some(src.split_to(len).freeze()))
    }

    fn decode_chunked(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, TetherError> {
        loop {
            if src.len() < 2 {
                return Ok(None);
            }
            let header = u16::from_be_bytes([src[0], src[1]]);
            let len = (header & !FINAL_BIT) as usize;
            let last = header & FINAL_BIT != 0;

            if src.len() < 2 + len {
                src.reserve(2 + len - src.len());
                return Ok(None);
            }

            self.recorder.record(&src[..2 + len]);
            src.advance(2);
            let chunk = src.split_to(len);

            if self.assembly.len() + chunk.len() > self.max_command {
                return Err(TetherError::FrameTooLarge {
                    size: self.assembly.len() + chunk.len(),
                    max: self.max_command,
                });
            }
            self.assembly.extend_from_slice(&chunk);

            if last {
                return Ok(Some(self.assembly.split().freeze()));
            }
        }
    }
}

impl Decoder for FrameDecoder {
    type Item = Bytes;
    type Error = TetherError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.framing {
            Framing::Legacy => self.decode_legacy(src),
            Framing::Chunked => self.decode_chunked(src),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunked_pair() -> (FrameEncoder, FrameDecoder) {
        (
            FrameEncoder::new(Framing::Chunked, DEFAULT_MAX_COMMAND),
            FrameDecoder::new(Framing::Chunked, DEFAULT_MAX_COMMAND, 1024),
        )
    }

    #[test]
    fn chunked_roundtrip_small() {
        let (mut enc, mut dec) = chunked_pair();
        let mut buf = BytesMut::new();
        enc.encode(Bytes::from_static(b"hello"), &mut buf).unwrap();

        let out = dec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&out[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn chunked_roundtrip_multi_chunk() {
        let (mut enc, mut dec) = chunked_pair();
        let payload = vec![0xAB; CHUNK_MAX * 2 + 17];
        let mut buf = BytesMut::new();
        enc.encode(Bytes::from(payload.clone()), &mut buf).unwrap();

        let out = dec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(out.len(), payload.len());
        assert_eq!(&out[..], &payload[..]);
    }

    #[test]
    fn chunked_empty_payload() {
        let (mut enc, mut dec) = chunked_pair();
        let mut buf = BytesMut::new();
        enc.encode(Bytes::new(), &mut buf).unwrap();
        assert_eq!(&buf[..], &[0x80, 0x00]);

        let out = dec.decode(&mut buf).unwrap().unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn chunk_of_exactly_32767_is_not_final_by_itself() {
        let (mut enc, _) = chunked_pair();
        let payload = vec![1u8; CHUNK_MAX + 1];
        let mut buf = BytesMut::new();
        enc.encode(Bytes::from(payload), &mut buf).unwrap();

        // First chunk: full size, final bit clear.
        let header = u16::from_be_bytes([buf[0], buf[1]]);
        assert_eq!(header, CHUNK_MAX as u16);
        // Second chunk: 1 byte, final bit set.
        let second_at = 2 + CHUNK_MAX;
        let header2 = u16::from_be_bytes([buf[second_at], buf[second_at + 1]]);
        assert_eq!(header2, 1 | FINAL_BIT);
    }

    #[test]
    fn zero_length_final_chunk_terminates_accumulated_payload() {
        let mut dec = FrameDecoder::new(Framing::Chunked, DEFAULT_MAX_COMMAND, 1024);
        let mut buf = BytesMut::new();
        // Non-final 3-byte chunk, then a zero-length final chunk.
        buf.put_u16(3);
        buf.extend_from_slice(b"abc");
        buf.put_u16(FINAL_BIT);

        let out = dec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&out[..], b"abc");
    }

    #[test]
    fn chunked_incremental_feed() {
        let (mut enc, mut dec) = chunked_pair();
        let mut wire = BytesMut::new();
        enc.encode(Bytes::from_static(b"incremental"), &mut wire)
            .unwrap();

        // Feed one byte at a time; decoder must not yield early.
        let mut buf = BytesMut::new();
        let mut result = None;
        for b in wire.iter() {
            buf.put_u8(*b);
            if let Some(payload) = dec.decode(&mut buf).unwrap() {
                result = Some(payload);
            }
        }
        assert_eq!(&result.unwrap()[..], b"incremental");
    }

    #[test]
    fn two_commands_back_to_back() {
        let (mut enc, mut dec) = chunked_pair();
        let mut buf = BytesMut::new();
        enc.encode(Bytes::from_static(b"one"), &mut buf).unwrap();
        enc.encode(Bytes::from_static(b"two"), &mut buf).unwrap();

        assert_eq!(&dec.decode(&mut buf).unwrap().unwrap()[..], b"one");
        assert_eq!(&dec.decode(&mut buf).unwrap().unwrap()[..], b"two");
        assert!(dec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn legacy_roundtrip() {
        let mut enc = FrameEncoder::new(Framing::Legacy, DEFAULT_MAX_COMMAND);
        let mut dec = FrameDecoder::new(Framing::Legacy, DEFAULT_MAX_COMMAND, 1024);
        let mut buf = BytesMut::new();
        enc.encode(Bytes::from_static(b"legacy payload"), &mut buf)
            .unwrap();
        assert_eq!(&buf[..4], &(14u32.to_be_bytes())[..]);

        let out = dec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&out[..], b"legacy payload");
    }

    #[test]
    fn legacy_waits_for_full_frame() {
        let mut dec = FrameDecoder::new(Framing::Legacy, DEFAULT_MAX_COMMAND, 1024);
        let mut buf = BytesMut::new();
        buf.put_u32(10);
        buf.extend_from_slice(b"12345");
        assert!(dec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"67890");
        assert_eq!(&dec.decode(&mut buf).unwrap().unwrap()[..], b"1234567890");
    }

    #[test]
    fn oversized_command_rejected() {
        let mut enc = FrameEncoder::new(Framing::Chunked, 64);
        let mut buf = BytesMut::new();
        let err = enc.encode(Bytes::from(vec![0u8; 65]), &mut buf).unwrap_err();
        assert!(matches!(err, TetherError::FrameTooLarge { size: 65, max: 64 }));

        let mut dec = FrameDecoder::new(Framing::Legacy, 64, 1024);
        let mut buf = BytesMut::new();
        buf.put_u32(65);
        assert!(matches!(
            dec.decode(&mut buf),
            Err(TetherError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn recorder_sees_wire_bytes() {
        let (mut enc, mut dec) = chunked_pair();
        let mut buf = BytesMut::new();
        enc.encode(Bytes::from_static(b"observed"), &mut buf).unwrap();
        let wire = buf.clone();

        dec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(dec.recorder().snapshot(), &wire[..]);
    }
}
