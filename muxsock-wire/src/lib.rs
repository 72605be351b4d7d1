//! Muxsock wire codec
//!
//! Length-prefixed framing over byte streams:
//! - `Frame`: one message, refcounted payload (`bytes::Bytes`)
//! - `Decoder`: stateful streaming decoder
//! - Fast path: entire frame present → zero-copy slice
//! - Slow path: fragmented frame → reassemble into `BytesMut`
//!
//! Wire format: 4-byte big-endian payload length, then the payload.
//! Lengths above [`MAX_FRAME_SIZE`] are a protocol violation.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

/// Length of the frame header on the wire.
pub const HEADER_LEN: usize = 4;

/// Upper bound on a single frame payload (64 MiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Wire protocol errors
#[derive(Debug, Error)]
pub enum WireError {
    #[error("Protocol violation: frame size {0} exceeds limit")]
    SizeTooLarge(usize),
}

/// Result type alias for wire operations
pub type Result<T> = std::result::Result<T, WireError>;

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    payload: Bytes,
}

impl Frame {
    /// Create a frame from a payload.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Payload bytes.
    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// True if the payload is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Total size of this frame on the wire (header + payload).
    #[inline]
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Encode the wire header for this frame.
    #[inline]
    pub fn header(&self) -> [u8; HEADER_LEN] {
        (self.payload.len() as u32).to_be_bytes()
    }

    /// Encode this frame to a contiguous byte buffer.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.wire_len());
        out.extend_from_slice(&self.header());
        out.extend_from_slice(&self.payload);
        out.freeze()
    }

    /// Consume the frame, returning its payload.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

impl From<Bytes> for Frame {
    fn from(payload: Bytes) -> Self {
        Self::new(payload)
    }
}

/// Stateful streaming frame decoder
///
/// Fast path:
/// - Entire frame present → zero-copy slice
///
/// Slow path:
/// - Fragmented frame → reassemble into `BytesMut`
#[derive(Debug, Default)]
pub struct Decoder {
    // Fragmentation state
    pending_len: Option<usize>,
    staging: BytesMut,
    // Header bytes seen so far when even the header is fragmented
    header: BytesMut,
}

impl Decoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending_len: None,
            staging: BytesMut::new(),
            header: BytesMut::new(),
        }
    }

    /// Decode a single frame from `src`, consuming the bytes used.
    ///
    /// Returns:
    /// - Ok(Some(frame)) → frame decoded
    /// - Ok(None) → need more data
    /// - Err → protocol violation; the stream is unusable afterwards
    pub fn decode(&mut self, src: &mut Bytes) -> Result<Option<Frame>> {
        // === Reassembly mode ===
        if let Some(body_len) = self.pending_len {
            let needed = body_len - self.staging.len();
            let take = needed.min(src.len());

            self.staging.extend_from_slice(&src.split_to(take));

            if self.staging.len() < body_len {
                return Ok(None);
            }

            let payload = self.staging.split().freeze();
            self.pending_len = None;

            return Ok(Some(Frame { payload }));
        }

        // === Header parsing ===
        // The header itself may span reads; accumulate it byte-wise.
        if !self.header.is_empty() || src.len() < HEADER_LEN {
            let take = (HEADER_LEN - self.header.len()).min(src.len());
            self.header.extend_from_slice(&src.split_to(take));
            if self.header.len() < HEADER_LEN {
                return Ok(None);
            }
            let mut hdr = &self.header[..];
            let body_len = hdr.get_u32() as usize;
            self.header.clear();
            return self.start_body(body_len, src);
        }

        let mut hdr = &src[..HEADER_LEN];
        let body_len = hdr.get_u32() as usize;
        src.advance(HEADER_LEN);
        self.start_body(body_len, src)
    }

    /// Drain every complete frame currently decodable from `src`.
    pub fn decode_all(&mut self, src: &mut Bytes) -> Result<Vec<Frame>> {
        let mut frames = Vec::new();
        while let Some(frame) = self.decode(src)? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn start_body(&mut self, body_len: usize, src: &mut Bytes) -> Result<Option<Frame>> {
        if body_len > MAX_FRAME_SIZE {
            return Err(WireError::SizeTooLarge(body_len));
        }

        // === Fast path: entire body present ===
        if src.len() >= body_len {
            let payload = src.split_to(body_len);
            return Ok(Some(Frame { payload }));
        }

        // === Slow path: fragmentation ===
        self.pending_len = Some(body_len);
        self.staging.clear();
        self.staging.extend_from_slice(&src.split_to(src.len()));

        Ok(None)
    }
}
