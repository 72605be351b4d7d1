//! Socket records and the ownership graph
//!
//! Three record types, one per role:
//! - `RootSock`: the user-facing socket. Owns the bind and connection
//!   tables, the inbound event queue, the wake signal, and the queue-size
//!   counters with their high-water marks.
//! - `BindSock`: a listening endpoint. Owns the subset of connections it
//!   accepted and a back-reference to its root.
//! - `ConnSock`: one TCP stream, incoming or outgoing. Owns its parser and
//!   outbound frame queue, plus back-references to its root, its parent
//!   bind (if accepted) and its assigned worker.
//!
//! Locking: each record has its own mutex. Nesting always proceeds
//! root → bind → connection, then worker queues (all workers, index order),
//! never the reverse. A connection's `state` (queues, flags) and `io`
//! (stream, parser) live behind separate mutexes that are never held at the
//! same time: callers touch only `state`, the owning worker thread is the
//! only one to touch `io`.

use crate::error::{Error, Result};
use crate::event::Event;
use crate::outq::OutQueue;
use crate::signal::WakeSignal;
use crate::table::HandleTable;
use crate::worker::{Task, WorkerHandle};
use crate::Config;

use mio::net::{TcpListener, TcpStream};
use mio::Token;
use muxsock_wire::Decoder;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;

/// Direction of a connection relative to its root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    /// Accepted on one of the root's binds.
    Incoming,
    /// Opened by an explicit connect.
    Outgoing,
}

/// Free-running vs. paused state of a root's read or write side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Gate {
    Running,
    Paused,
}

// ---------------------------------------------------------------------------
// Root socket
// ---------------------------------------------------------------------------

pub(crate) struct RootSock {
    /// Slot in the global registry.
    pub handle: usize,
    /// Randomized token detecting stale handle reuse by callers.
    pub uniq: u32,
    /// Pool snapshot, index order. Valid for this root's whole lifetime:
    /// the pool outlives every registered socket.
    pub workers: Vec<Arc<WorkerHandle>>,
    pub inner: Mutex<RootState>,
    /// Wakes a consumer blocked in `recv_event`.
    pub wake: WakeSignal,
    /// Wakes senders blocked on a paused write gate. Paired with `inner`.
    pub send_resume: Condvar,
}

pub(crate) struct RootState {
    pub binds: HandleTable<Arc<BindSock>>,
    /// Flat union of every connection of this root, accepted or outgoing.
    pub conns: HandleTable<Arc<ConnSock>>,
    pub events: VecDeque<Event>,
    /// Consumer parked on the wake signal; producers clear it on signal.
    pub want_wake: bool,
    /// Outstanding queued inbound events. Always equals `events.len()`.
    pub rcvqsz: usize,
    /// Outstanding queued outbound frames across all connections.
    pub sndqsz: usize,
    pub rcvhwm: usize,
    pub sndhwm: usize,
    pub reading: Gate,
    pub writing: Gate,
}

impl RootSock {
    pub fn new(handle: usize, workers: Vec<Arc<WorkerHandle>>, cfg: &Config) -> Self {
        Self {
            handle,
            uniq: rand::random(),
            workers,
            inner: Mutex::new(RootState {
                binds: HandleTable::new(10),
                conns: HandleTable::new(10),
                events: VecDeque::new(),
                want_wake: false,
                rcvqsz: 0,
                sndqsz: 0,
                rcvhwm: cfg.recv_hwm,
                sndhwm: cfg.send_hwm,
                reading: Gate::Running,
                writing: Gate::Running,
            }),
            wake: WakeSignal::new(),
            send_resume: Condvar::new(),
        }
    }

    /// Queue inbound events in order, waking a parked consumer and pausing
    /// reads when the queue crosses the high-water mark.
    ///
    /// Runs on worker threads; must be called with no other lock held.
    pub fn queue_events(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let mut st = self.inner.lock();
        for event in events {
            st.events.push_back(event);
            st.rcvqsz += 1;
        }
        debug_assert_eq!(st.rcvqsz, st.events.len());
        if st.want_wake {
            self.wake.signal();
            st.want_wake = false;
        }
        if st.rcvhwm > 0 && st.reading == Gate::Running && st.rcvqsz >= st.rcvhwm {
            st.reading = Gate::Paused;
            debug!(
                sock = self.handle,
                rcvqsz = st.rcvqsz,
                rcvhwm = st.rcvhwm,
                "receive queue reached high-water mark, pausing reads"
            );
            self.bulk_gate_reads(&st, Gate::Paused);
        }
    }

    /// Pop the next event, blocking on the wake signal if asked.
    ///
    /// Resumes reading across all connections when a paused queue drains
    /// back under the high-water mark.
    pub fn recv_event(&self, block: bool, timeout: Duration) -> Result<Event> {
        let mut st = self.inner.lock();
        loop {
            if let Some(event) = st.events.pop_front() {
                st.rcvqsz -= 1;
                debug_assert_eq!(st.rcvqsz, st.events.len());
                if st.rcvhwm > 0 && st.reading == Gate::Paused && st.rcvqsz < st.rcvhwm {
                    st.reading = Gate::Running;
                    debug!(
                        sock = self.handle,
                        rcvqsz = st.rcvqsz,
                        "receive queue drained below high-water mark, resuming reads"
                    );
                    self.bulk_gate_reads(&st, Gate::Running);
                }
                return Ok(event);
            }
            if !block {
                return Err(Error::WouldBlock);
            }
            st.want_wake = true;
            drop(st);
            if !self.wake.wait(timeout) {
                return Err(Error::Timeout);
            }
            st = self.inner.lock();
        }
    }

    /// Append one frame to `conn`'s outbound queue and account for it.
    ///
    /// The caller must hold this root's lock (`st`); the write gate must
    /// already have been passed. This is the reentrant inner half of the
    /// send path, shared by single sends and fan-out.
    pub fn send_locked(
        &self,
        st: &mut RootState,
        conn: &Arc<ConnSock>,
        frame: muxsock_wire::Frame,
    ) -> Result<()> {
        {
            let mut cs = conn.state.lock();
            if cs.zombie {
                return Err(Error::InvalidState);
            }
            cs.outq.push(frame);
            let was_writing = cs.writing;
            cs.writing = true;
            drop(cs);
            if !was_writing {
                conn.worker.schedule(Task::StartWrite(conn.clone()));
            }
        }
        st.sndqsz += 1;
        if st.sndhwm > 0 && st.writing == Gate::Running && st.sndqsz >= st.sndhwm {
            st.writing = Gate::Paused;
            debug!(
                sock = self.handle,
                sndqsz = st.sndqsz,
                sndhwm = st.sndhwm,
                "send queue reached high-water mark, pausing senders"
            );
        }
        Ok(())
    }

    /// Block until the write gate is open, or fail with `WouldBlock`.
    ///
    /// Waiting releases the root lock; the write path notifies
    /// `send_resume` when the queue drains below the mark.
    pub fn wait_send_gate(
        &self,
        st: &mut MutexGuard<'_, RootState>,
        dont_wait: bool,
    ) -> Result<()> {
        while st.writing == Gate::Paused {
            if dont_wait {
                return Err(Error::WouldBlock);
            }
            self.send_resume.wait(st);
        }
        Ok(())
    }

    /// Account for `n` outbound frames having fully reached the wire (or
    /// been dropped with their connection), reopening the write gate when
    /// the queue drains below the mark.
    pub fn frames_flushed(&self, n: usize) {
        if n == 0 {
            return;
        }
        let mut st = self.inner.lock();
        st.sndqsz = st.sndqsz.saturating_sub(n);
        if st.sndhwm > 0 && st.writing == Gate::Paused && st.sndqsz < st.sndhwm {
            st.writing = Gate::Running;
            debug!(
                sock = self.handle,
                sndqsz = st.sndqsz,
                "send queue drained below high-water mark, resuming senders"
            );
            self.send_resume.notify_all();
        }
    }

    /// Schedule a read-gate change for every connection of this root.
    ///
    /// Two-phase protocol: lock every worker queue in index order, push the
    /// per-connection tasks, unlock all, then wake all loops. No loop can
    /// observe a partially-applied gate change.
    fn bulk_gate_reads(&self, st: &RootState, gate: Gate) {
        let mut queues: Vec<_> = self.workers.iter().map(|w| w.lock_queue()).collect();
        for (_, conn) in st.conns.iter() {
            let task = match gate {
                Gate::Paused => Task::PauseReads(conn.clone()),
                Gate::Running => Task::ResumeReads(conn.clone()),
            };
            queues[conn.worker.index].push_back(task);
        }
        drop(queues);
        for worker in &self.workers {
            worker.wake();
        }
    }

    /// Tear down every owned bind and connection.
    ///
    /// Streams and listeners are released on their owning workers; this
    /// only empties the tables and schedules the close tasks.
    pub fn teardown(&self) {
        let (binds, conns) = {
            let mut st = self.inner.lock();
            st.events.clear();
            st.rcvqsz = 0;
            st.sndqsz = 0;
            (st.binds.drain(), st.conns.drain())
        };
        for conn in conns {
            conn.mark_zombie();
            conn.worker.schedule(Task::CloseConn(conn.clone()));
        }
        for bind in binds {
            bind.state.lock().conns.drain();
            bind.worker.schedule(Task::CloseBind(bind.clone()));
        }
        debug!(sock = self.handle, "socket torn down");
    }
}

// ---------------------------------------------------------------------------
// Bind socket
// ---------------------------------------------------------------------------

pub(crate) struct BindSock {
    pub owner: Weak<RootSock>,
    pub ctx: Weak<crate::context::ContextInner>,
    pub worker: Arc<WorkerHandle>,
    pub state: Mutex<BindState>,
    /// Listener; touched only by the owning worker thread.
    pub io: Mutex<BindIo>,
}

pub(crate) struct BindState {
    /// Slot in the root's bind table.
    pub local_handle: usize,
    /// The subset of the root's connections this bind accepted.
    pub conns: HandleTable<Arc<ConnSock>>,
    pub token: Option<Token>,
    pub registered: bool,
}

pub(crate) struct BindIo {
    pub listener: Option<TcpListener>,
}

impl BindSock {
    pub fn new(
        owner: Weak<RootSock>,
        ctx: Weak<crate::context::ContextInner>,
        worker: Arc<WorkerHandle>,
        listener: TcpListener,
    ) -> Self {
        Self {
            owner,
            ctx,
            worker,
            state: Mutex::new(BindState {
                local_handle: 0,
                conns: HandleTable::new(10),
                token: None,
                registered: false,
            }),
            io: Mutex::new(BindIo {
                listener: Some(listener),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Connection socket
// ---------------------------------------------------------------------------

pub(crate) struct ConnSock {
    pub direction: Direction,
    pub owner: Weak<RootSock>,
    /// Present for accepted connections: the bind whose subset table holds
    /// this connection under `local_handle`.
    pub parent_bind: Option<Weak<BindSock>>,
    pub worker: Arc<WorkerHandle>,
    pub state: Mutex<ConnState>,
    /// Stream and parser; touched only by the owning worker thread.
    pub io: Mutex<ConnIo>,
}

pub(crate) struct ConnState {
    /// Slot in the root's flat connection table.
    pub handle: usize,
    /// Slot in the parent bind's subset table; equals `handle` for
    /// outgoing connections.
    pub local_handle: usize,
    /// Peer disconnected or errored: excluded from sends, retained until
    /// explicitly closed.
    pub zombie: bool,
    /// A write cycle is scheduled or in flight.
    pub writing: bool,
    pub want_read: bool,
    pub want_write: bool,
    pub registered: bool,
    pub token: Option<Token>,
    pub outq: OutQueue,
}

pub(crate) struct ConnIo {
    pub stream: Option<TcpStream>,
    pub parser: Decoder,
}

impl ConnSock {
    pub fn new(
        direction: Direction,
        owner: Weak<RootSock>,
        parent_bind: Option<Weak<BindSock>>,
        worker: Arc<WorkerHandle>,
        stream: TcpStream,
    ) -> Self {
        Self::build(direction, owner, parent_bind, worker, Some(stream))
    }

    #[cfg(test)]
    pub fn stub(
        direction: Direction,
        owner: Weak<RootSock>,
        worker: Arc<WorkerHandle>,
    ) -> Self {
        Self::build(direction, owner, None, worker, None)
    }

    fn build(
        direction: Direction,
        owner: Weak<RootSock>,
        parent_bind: Option<Weak<BindSock>>,
        worker: Arc<WorkerHandle>,
        stream: Option<TcpStream>,
    ) -> Self {
        Self {
            direction,
            owner,
            parent_bind,
            worker,
            state: Mutex::new(ConnState {
                handle: 0,
                local_handle: 0,
                zombie: false,
                writing: false,
                want_read: false,
                want_write: false,
                registered: false,
                token: None,
                outq: OutQueue::new(),
            }),
            io: Mutex::new(ConnIo {
                stream,
                parser: Decoder::new(),
            }),
        }
    }

    /// Flag the connection as dead and drop readiness interest.
    ///
    /// Idempotent: returns `true` only on the first call, so the caller
    /// knows whether deregistration is still owed.
    pub fn mark_zombie(&self) -> bool {
        let mut cs = self.state.lock();
        if cs.zombie {
            return false;
        }
        cs.zombie = true;
        cs.writing = false;
        cs.want_read = false;
        cs.want_write = false;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zombie_marking_is_idempotent() {
        let conn = ConnSock::stub(
            Direction::Incoming,
            Weak::new(),
            crate::worker::WorkerHandle::detached(0),
        );
        assert!(conn.mark_zombie());
        assert!(!conn.mark_zombie());

        let cs = conn.state.lock();
        assert!(cs.zombie);
        assert!(!cs.writing && !cs.want_read && !cs.want_write);
    }
}
