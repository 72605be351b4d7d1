//! Delivery events
//!
//! Everything a socket delivers to its consumer arrives as one of these,
//! popped from the socket's inbound queue in FIFO order.

use muxsock_wire::Frame;

/// An event delivered on a socket's inbound queue.
///
/// Frame payloads are refcounted; dropping the event releases them.
#[derive(Debug)]
pub enum Event {
    /// A complete frame parsed off one of the socket's connections.
    NewFrame(Frame),
    /// A connection was accepted on one of the socket's binds. Carries the
    /// connection's socket-relative handle.
    NewConnection(usize),
}

impl Event {
    /// The frame payload, if this is a frame event.
    pub fn frame(&self) -> Option<&Frame> {
        match self {
            Event::NewFrame(frame) => Some(frame),
            Event::NewConnection(_) => None,
        }
    }
}
