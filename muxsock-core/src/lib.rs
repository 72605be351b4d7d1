//! Muxsock Core
//!
//! This crate contains the socket-multiplexing messaging layer:
//! - Sparse reusable-slot handle table (`table`)
//! - Fixed worker-thread pool, one event loop per thread (`worker`)
//! - Socket/bind/connection ownership graph (`sock`)
//! - Per-socket inbound event queue with blocking receive (`event`, `sock`)
//! - Per-connection outbound frame queue with partial-write recovery
//!   (`outq`)
//! - High-water-mark flow control on both directions (`sock`)
//! - Distribution/fan-out send (`context`)
//! - Error types (`error`)
//!
//! A socket is a logical endpoint: it can listen on several addresses at
//! once, hold any number of accepted and outgoing connections, deliver
//! parsed frames to one consumer queue, and fan frames out to subsets of
//! its connections. All of it hangs off an explicit [`Context`], which owns
//! the registry and the worker pool.

#![cfg_attr(not(test), deny(unsafe_code))]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod table;

mod outq;
mod signal;
mod sock;
mod worker;

pub use config::Config;
pub use context::{Context, DistFilter, DistTarget, SendOptions};
pub use error::{Error, Result};
pub use event::Event;

// The codec types callers handle directly.
pub use muxsock_wire::{Frame, WireError};
