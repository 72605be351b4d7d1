//! # Muxsock
//!
//! A socket-multiplexing messaging layer: raw TCP turned into a
//! frame-oriented, many-to-many communication primitive with bounded
//! queues and backpressure, driven by a fixed pool of event-loop worker
//! threads.
//!
//! ## Architecture
//!
//! - **`muxsock-wire`**: length-prefixed frame codec (streaming decoder,
//!   vectored-write friendly encoder)
//! - **`muxsock-core`**: handle tables, worker pool, ownership graph,
//!   queues, flow control
//! - **`muxsock`**: public API surface (this crate)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use muxsock::{Config, Context, Event, Frame, SendOptions};
//!
//! # fn main() -> muxsock::Result<()> {
//! let ctx = Context::new(Config::default());
//!
//! // A server socket listening on one address...
//! let server = ctx.open()?;
//! ctx.bind(server, "127.0.0.1".parse().unwrap(), 7700)?;
//!
//! // ...and a client socket connected to it.
//! let client = ctx.open()?;
//! let conn = ctx.connect(client, "127.0.0.1".parse().unwrap(), 7700)?;
//!
//! ctx.send(client, conn, Frame::new(&b"hello"[..]), SendOptions::default())?;
//!
//! // The server sees the accepted connection, then the frame.
//! while let Ok(event) = ctx.recv_event(server, true) {
//!     match event {
//!         Event::NewConnection(conn) => println!("peer attached: {conn}"),
//!         Event::NewFrame(frame) => println!("got {} bytes", frame.len()),
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Semantics
//!
//! - Frames on one connection arrive in send order; nothing is guaranteed
//!   across connections.
//! - A connection whose peer vanished turns into a **zombie**: excluded
//!   from sends, kept until explicitly closed.
//! - High-water marks bound both queues: a full inbound queue pauses
//!   reading on every connection of the socket, a full outbound queue
//!   pauses senders; both resume when the queue drains below the mark.

#![warn(missing_docs)]

pub use muxsock_core::{
    Config, Context, DistFilter, DistTarget, Error, Event, Frame, Result, SendOptions, WireError,
};

// The codec surface, for tooling that speaks the wire format directly.
pub use muxsock_wire::{Decoder, HEADER_LEN, MAX_FRAME_SIZE};

// Re-export core payload type
pub use bytes::Bytes;
