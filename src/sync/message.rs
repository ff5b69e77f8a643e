//! Sync wire messages
//!
//! Every message on a peer link is a frame: a 4-byte big-endian payload
//! length followed by a CBOR-encoded [`SyncMessage`].

use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::convergent::{Change, ClockVector, DocumentId};

/// Protocol version carried in every message
pub const WIRE_VERSION: u8 = 1;

/// Largest frame accepted by default (16 MiB)
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Encoding failed: {0}")]
    Encode(String),
}

/// One unit of the sync protocol, scoped to a single document.
///
/// A message without changes advertises the sender's clock (and doubles as
/// a request for whatever the sender is missing). A message with changes is
/// a batch in dependency order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub version: u8,
    pub doc_id: DocumentId,
    pub clock: ClockVector,
    pub changes: Vec<Change>,
}

impl SyncMessage {
    pub fn advertise(doc_id: impl Into<DocumentId>, clock: ClockVector) -> Self {
        Self::batch(doc_id, clock, Vec::new())
    }

    pub fn batch(doc_id: impl Into<DocumentId>, clock: ClockVector, changes: Vec<Change>) -> Self {
        Self {
            version: WIRE_VERSION,
            doc_id: doc_id.into(),
            clock,
            changes,
        }
    }

    pub fn is_advertisement(&self) -> bool {
        self.changes.is_empty()
    }

    /// Serialize to CBOR bytes.
    pub fn to_cbor(&self) -> Result<Vec<u8>, WireError> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| WireError::Encode(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize from CBOR bytes, rejecting unknown protocol versions.
    pub fn from_cbor(data: &[u8]) -> Result<Self, WireError> {
        let msg: SyncMessage =
            ciborium::from_reader(data).map_err(|e| WireError::Malformed(e.to_string()))?;
        if msg.version != WIRE_VERSION {
            return Err(WireError::Malformed(format!(
                "unsupported protocol version {}",
                msg.version
            )));
        }
        Ok(msg)
    }

    /// CBOR payload with its length prefix, ready to hand to a transport
    pub fn encode_frame(&self) -> Result<Vec<u8>, WireError> {
        Ok(frame(&self.to_cbor()?))
    }
}

/// Prefix a payload with its 4-byte big-endian length.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Reassembles frames from an arbitrarily chunked byte stream.
///
/// An oversized frame is reported once and its body skipped as it arrives,
/// so the stream stays usable afterwards.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame: usize,
    /// Bytes of an oversized frame still to be discarded
    skip: usize,
}

impl FrameDecoder {
    pub fn new(max_frame: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame,
            skip: 0,
        }
    }

    /// Change the frame size limit, keeping anything already buffered
    pub fn set_max_frame(&mut self, max_frame: usize) {
        self.max_frame = max_frame;
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete frame payload, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, WireError> {
        if self.skip > 0 {
            let n = self.skip.min(self.buf.len());
            self.buf.advance(n);
            self.skip -= n;
            if self.skip > 0 {
                return Ok(None);
            }
        }

        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let size = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if size > self.max_frame {
            self.buf.advance(HEADER_LEN);
            self.skip = size;
            return Err(WireError::FrameTooLarge {
                size,
                max: self.max_frame,
            });
        }
        if self.buf.len() < HEADER_LEN + size {
            return Ok(None);
        }
        self.buf.advance(HEADER_LEN);
        Ok(Some(self.buf.split_to(size).freeze()))
    }

    /// Bytes held that do not yet form a complete frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.skip = 0;
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convergent::{Op, Value};

    fn sample() -> SyncMessage {
        let change = Change {
            actor: "A".into(),
            seq: 1,
            deps: ClockVector::new(),
            ops: vec![Op::Set {
                object: "t1".into(),
                field: "title".into(),
                value: Value::string("x"),
            }],
        };
        SyncMessage::batch("doc1", ClockVector::at("A", 1), vec![change])
    }

    #[test]
    fn test_cbor_roundtrip() {
        let msg = sample();
        let bytes = msg.to_cbor().unwrap();
        assert_eq!(SyncMessage::from_cbor(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_garbage_is_malformed() {
        let err = SyncMessage::from_cbor(&[0xff, 0x00, 0x13]).unwrap_err();
        assert!(matches!(err, WireError::Malformed(_)));
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let mut msg = SyncMessage::advertise("doc1", ClockVector::new());
        msg.version = 9;
        let bytes = msg.to_cbor().unwrap();
        assert!(matches!(
            SyncMessage::from_cbor(&bytes),
            Err(WireError::Malformed(_))
        ));
    }

    #[test]
    fn test_decoder_reassembles_split_frames() {
        let a = sample().encode_frame().unwrap();
        let b = SyncMessage::advertise("doc2", ClockVector::at("B", 3))
            .encode_frame()
            .unwrap();
        let stream: Vec<u8> = a.iter().chain(b.iter()).copied().collect();

        let mut decoder = FrameDecoder::default();
        let mut decoded = Vec::new();
        for chunk in stream.chunks(5) {
            decoder.extend(chunk);
            while let Some(payload) = decoder.next_frame().unwrap() {
                decoded.push(SyncMessage::from_cbor(&payload).unwrap());
            }
        }

        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0], sample());
        assert_eq!(decoded[1].doc_id, "doc2");
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_oversized_frame_is_skipped() {
        let mut decoder = FrameDecoder::new(8);
        let mut stream = frame(&[0u8; 20]);
        stream.extend(frame(b"ok"));

        decoder.extend(&stream[..10]);
        assert_eq!(
            decoder.next_frame(),
            Err(WireError::FrameTooLarge { size: 20, max: 8 })
        );
        assert_eq!(decoder.next_frame(), Ok(None));

        decoder.extend(&stream[10..]);
        assert_eq!(decoder.next_frame().unwrap().as_deref(), Some(&b"ok"[..]));
    }
}
