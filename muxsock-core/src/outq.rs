//! Outbound frame queue
//!
//! Per-connection list of pending frames, flushed with vectored writes.
//! Each frame tracks how many of its wire bytes are already out, so a
//! partial write resumes mid-frame on the next readiness cycle. The write
//! path snapshots the whole queue, flushes outside the lock, and splices
//! late arrivals back behind the unsent remainder, so arrival order is
//! never disturbed.

use muxsock_wire::{Frame, HEADER_LEN};

use bytes::Bytes;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::io::IoSlice;

/// Cap on the gather list handed to one vectored write.
const MAX_IOV: usize = 128;

#[derive(Debug)]
struct OutFrame {
    header: [u8; HEADER_LEN],
    payload: Bytes,
    /// Wire bytes (header + payload) already written.
    written: usize,
}

impl OutFrame {
    fn new(frame: Frame) -> Self {
        let header = frame.header();
        Self {
            header,
            payload: frame.into_payload(),
            written: 0,
        }
    }

    fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    fn remaining(&self) -> usize {
        self.wire_len() - self.written
    }
}

#[derive(Debug, Default)]
pub(crate) struct OutQueue {
    frames: VecDeque<OutFrame>,
}

impl OutQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: Frame) {
        self.frames.push_back(OutFrame::new(frame));
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Take the whole queue, leaving this one empty.
    pub fn take(&mut self) -> OutQueue {
        std::mem::take(self)
    }

    /// Append `newer` behind the frames still pending here.
    pub fn splice_back(&mut self, mut newer: OutQueue) {
        self.frames.append(&mut newer.frames);
    }

    /// Gather list over the unsent bytes, at most [`MAX_IOV`] slices.
    pub fn io_slices(&self) -> SmallVec<[IoSlice<'_>; 32]> {
        let mut slices = SmallVec::new();
        for frame in &self.frames {
            if slices.len() >= MAX_IOV {
                break;
            }
            if frame.written < HEADER_LEN {
                slices.push(IoSlice::new(&frame.header[frame.written..]));
                if slices.len() >= MAX_IOV {
                    break;
                }
                if !frame.payload.is_empty() {
                    slices.push(IoSlice::new(&frame.payload));
                }
            } else {
                let offset = frame.written - HEADER_LEN;
                if offset < frame.payload.len() {
                    slices.push(IoSlice::new(&frame.payload[offset..]));
                }
            }
        }
        slices
    }

    /// Record `n` wire bytes written, dropping fully-flushed frames.
    ///
    /// Returns how many frames completed.
    pub fn advance(&mut self, mut n: usize) -> usize {
        let mut completed = 0;
        while n > 0 {
            let Some(front) = self.frames.front_mut() else {
                debug_assert!(false, "write advanced past queued bytes");
                break;
            };
            let remaining = front.remaining();
            if n >= remaining {
                n -= remaining;
                self.frames.pop_front();
                completed += 1;
            } else {
                front.written += n;
                n = 0;
            }
        }
        completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(bytes: &'static [u8]) -> Frame {
        Frame::new(Bytes::from_static(bytes))
    }

    fn flat(slices: &[IoSlice<'_>]) -> Vec<u8> {
        slices.iter().flat_map(|s| s.iter().copied()).collect()
    }

    #[test]
    fn test_slices_cover_header_and_payload() {
        let mut q = OutQueue::new();
        q.push(frame(b"abc"));

        let bytes = flat(&q.io_slices());
        assert_eq!(bytes, [&[0, 0, 0, 3][..], &b"abc"[..]].concat());
    }

    #[test]
    fn test_partial_write_resumes_mid_header() {
        let mut q = OutQueue::new();
        q.push(frame(b"xy"));

        // Two bytes out: half the header.
        assert_eq!(q.advance(2), 0);
        let bytes = flat(&q.io_slices());
        assert_eq!(bytes, [&[0, 2][..], &b"xy"[..]].concat());
    }

    #[test]
    fn test_partial_write_resumes_mid_payload() {
        let mut q = OutQueue::new();
        q.push(frame(b"hello"));

        assert_eq!(q.advance(HEADER_LEN + 2), 0);
        assert_eq!(flat(&q.io_slices()), b"llo");
        assert_eq!(q.advance(3), 1);
        assert!(q.is_empty());
    }

    #[test]
    fn test_advance_spanning_frames() {
        let mut q = OutQueue::new();
        q.push(frame(b"aa"));
        q.push(frame(b"bbb"));

        // Finish the first frame and eat one byte of the second's header.
        let completed = q.advance(HEADER_LEN + 2 + 1);
        assert_eq!(completed, 1);
        assert_eq!(q.len(), 1);
        assert_eq!(flat(&q.io_slices()), [&[0, 0, 3][..], &b"bbb"[..]].concat());
    }

    #[test]
    fn test_splice_preserves_arrival_order() {
        let mut snapshot = OutQueue::new();
        snapshot.push(frame(b"one"));
        snapshot.push(frame(b"two"));
        snapshot.advance(HEADER_LEN + 3); // "one" fully out

        let mut newer = OutQueue::new();
        newer.push(frame(b"three"));

        snapshot.splice_back(newer);
        let bytes = flat(&snapshot.io_slices());
        assert_eq!(
            bytes,
            [&[0, 0, 0, 3][..], &b"two"[..], &[0, 0, 0, 5][..], &b"three"[..]].concat()
        );
    }

    #[test]
    fn test_gather_list_is_capped() {
        let mut q = OutQueue::new();
        for _ in 0..200 {
            q.push(frame(b"x"));
        }
        assert_eq!(q.io_slices().len(), MAX_IOV);
    }

    #[test]
    fn test_empty_payload_frame() {
        let mut q = OutQueue::new();
        q.push(Frame::new(Bytes::new()));
        assert_eq!(flat(&q.io_slices()), [0, 0, 0, 0]);
        assert_eq!(q.advance(HEADER_LEN), 1);
        assert!(q.is_empty());
    }
}
