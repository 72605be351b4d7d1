//! Context: registry, lifecycle, send paths
//!
//! The process-wide state (socket registry, worker pool, round-robin
//! cursor) lives in one explicit [`Context`] object behind a single mutex
//! (the global lock), constructed once and passed to every operation. The
//! pool starts lazily on the first `open` and is joined and torn down when
//! the last registered socket closes.
//!
//! Lock order everywhere: registry → root → bind/connection → worker
//! queues (all workers, index order). Never the reverse.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::sock::{BindSock, ConnSock, Direction, RootSock};
use crate::table::HandleTable;
use crate::worker::{Task, WorkerHandle, WorkerPool};

use mio::net::{TcpListener, TcpStream};
use muxsock_wire::Frame;
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Options for a send operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    /// Fail with `WouldBlock` instead of waiting on a paused send gate.
    pub dont_wait: bool,
    /// Stop a fan-out at the first failing connection.
    pub stop_on_error: bool,
}

impl SendOptions {
    /// Non-blocking send options.
    pub const fn dont_wait() -> Self {
        Self {
            dont_wait: true,
            stop_on_error: false,
        }
    }
}

/// Which connections a distributed send targets.
#[derive(Debug, Clone, Copy)]
pub enum DistTarget {
    /// Every connection of the socket.
    All,
    /// Every connection accepted by one bind, by bind handle.
    Bind(usize),
    /// One connection nested in one bind, by bind handle and the
    /// connection's bind-relative handle.
    BindConn(usize, usize),
}

/// Direction filter for a distributed send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistFilter {
    /// No filtering.
    Any,
    /// Accepted connections only.
    Incoming,
    /// Outgoing connections only.
    Outgoing,
}

impl DistFilter {
    fn matches(self, direction: Direction) -> bool {
        match self {
            DistFilter::Any => true,
            DistFilter::Incoming => direction == Direction::Incoming,
            DistFilter::Outgoing => direction == Direction::Outgoing,
        }
    }
}

/// Socket multiplexing context.
///
/// Cheap to clone; clones share the same registry and worker pool.
///
/// # Examples
///
/// ```no_run
/// use muxsock_core::{Config, Context, Frame, SendOptions};
///
/// # fn main() -> muxsock_core::Result<()> {
/// let ctx = Context::new(Config::default());
/// let server = ctx.open()?;
/// ctx.bind(server, "127.0.0.1".parse().unwrap(), 7700)?;
///
/// let client = ctx.open()?;
/// let conn = ctx.connect(client, "127.0.0.1".parse().unwrap(), 7700)?;
/// ctx.send(client, conn, Frame::new(&b"hello"[..]), SendOptions::default())?;
///
/// let event = ctx.recv_event(server, true)?; // the accepted connection
/// # drop(event);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

pub(crate) struct ContextInner {
    cfg: Config,
    state: Mutex<GlobalState>,
}

struct GlobalState {
    socks: HandleTable<Arc<RootSock>>,
    pool: Option<WorkerPool>,
}

impl Context {
    /// Create a context. No threads run until the first [`open`](Self::open).
    pub fn new(cfg: Config) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                cfg,
                state: Mutex::new(GlobalState {
                    socks: HandleTable::new(10),
                    pool: None,
                }),
            }),
        }
    }

    /// Open a socket, starting the worker pool on first use.
    pub fn open(&self) -> Result<usize> {
        self.inner.open()
    }

    /// Close a socket, tearing down its binds and connections. Closing the
    /// last registered socket stops and joins the worker pool.
    pub fn close(&self, sock: usize) -> Result<()> {
        self.inner.close(sock)
    }

    /// Start listening on `addr:port`. Returns the bind's handle.
    pub fn bind(&self, sock: usize, addr: IpAddr, port: u16) -> Result<usize> {
        let root = self.inner.resolve(sock)?;
        let Some(worker) = self.inner.choose_worker() else {
            return Err(Error::InvalidHandle(sock));
        };
        let listener = listen_socket(SocketAddr::new(addr, port)).map_err(Error::Address)?;
        let bind = Arc::new(BindSock::new(
            Arc::downgrade(&root),
            Arc::downgrade(&self.inner),
            worker,
            listener,
        ));
        let local = root.inner.lock().binds.insert(bind.clone())?;
        bind.state.lock().local_handle = local;
        bind.worker.schedule(Task::StartListen(bind.clone()));
        debug!(sock, bind = local, %addr, port, "listening");
        Ok(local)
    }

    /// Start a non-blocking connect to `addr:port`. Returns the
    /// connection's socket-relative handle.
    pub fn connect(&self, sock: usize, addr: IpAddr, port: u16) -> Result<usize> {
        self.inner.connect(sock, addr, port)
    }

    /// Queue one frame on one connection.
    pub fn send(&self, sock: usize, conn: usize, frame: Frame, opts: SendOptions) -> Result<()> {
        self.inner.send(sock, conn, frame, opts)
    }

    /// Fan one frame out to a subset of a socket's connections.
    pub fn send_dist(
        &self,
        sock: usize,
        target: DistTarget,
        frame: Frame,
        filter: DistFilter,
        opts: SendOptions,
    ) -> Result<()> {
        self.inner.send_dist(sock, target, frame, filter, opts)
    }

    /// Pop the next delivery event, blocking up to the configured receive
    /// timeout when `block` is set. Fails with `WouldBlock` (non-blocking,
    /// queue empty) or `Timeout` (blocking wait exhausted).
    pub fn recv_event(&self, sock: usize, block: bool) -> Result<Event> {
        let root = self.inner.resolve(sock)?;
        root.recv_event(block, self.inner.cfg.recv_timeout)
    }

    /// Reap one connection, typically a zombie: remove it from its tables
    /// and release its stream.
    pub fn close_connection(&self, sock: usize, conn: usize) -> Result<()> {
        self.inner.close_connection(sock, conn)
    }

    /// The socket's randomized uniq token, for stale-handle detection.
    pub fn uniq(&self, sock: usize) -> Result<u32> {
        Ok(self.inner.resolve(sock)?.uniq)
    }

    /// Set the socket's receive high-water mark (0 = unlimited).
    pub fn set_recv_hwm(&self, sock: usize, hwm: usize) -> Result<()> {
        let root = self.inner.resolve(sock)?;
        root.inner.lock().rcvhwm = hwm;
        Ok(())
    }

    /// Set the socket's send high-water mark (0 = unlimited).
    pub fn set_send_hwm(&self, sock: usize, hwm: usize) -> Result<()> {
        let root = self.inner.resolve(sock)?;
        root.inner.lock().sndhwm = hwm;
        Ok(())
    }

    /// Number of live sockets in the registry.
    pub fn socket_count(&self) -> usize {
        self.inner.state.lock().socks.len()
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<ContextInner> {
        &self.inner
    }
}

impl ContextInner {
    fn open(&self) -> Result<usize> {
        let mut st = self.state.lock();
        if st.pool.is_none() {
            st.pool = Some(WorkerPool::start(self.cfg.workers, self.cfg.read_chunk)?);
        }
        let workers = match &st.pool {
            Some(pool) => pool.handles().to_vec(),
            None => Vec::new(),
        };
        let cfg = &self.cfg;
        let handle = st
            .socks
            .insert_with(|handle| Arc::new(RootSock::new(handle, workers, cfg)))?;
        debug!(sock = handle, "socket opened");
        Ok(handle)
    }

    fn close(&self, sock: usize) -> Result<()> {
        let (root, pool) = {
            let mut st = self.state.lock();
            let root = st.socks.remove(sock).ok_or(Error::InvalidHandle(sock))?;
            // Last socket out turns off the lights. The pool is taken (not
            // stopped) under the lock; joining happens after release so
            // workers blocked on the registry can drain first.
            let pool = if st.socks.is_empty() {
                st.pool.take()
            } else {
                None
            };
            (root, pool)
        };
        root.teardown();
        if let Some(pool) = pool {
            debug!("last socket closed, stopping worker pool");
            pool.shutdown();
        }
        Ok(())
    }

    fn connect(&self, sock: usize, addr: IpAddr, port: u16) -> Result<usize> {
        let root = self.resolve(sock)?;
        let Some(worker) = self.choose_worker() else {
            return Err(Error::InvalidHandle(sock));
        };
        let target = SocketAddr::new(addr, port);
        let stream = TcpStream::connect(target).map_err(Error::Address)?;
        let conn = Arc::new(ConnSock::new(
            Direction::Outgoing,
            Arc::downgrade(&root),
            None,
            worker,
            stream,
        ));
        let handle = root.inner.lock().conns.insert(conn.clone())?;
        {
            let mut cs = conn.state.lock();
            cs.handle = handle;
            cs.local_handle = handle;
        }
        conn.worker.schedule(Task::StartConn(conn.clone()));
        debug!(sock, conn = handle, peer = %target, "connecting");
        Ok(handle)
    }

    fn send(&self, sock: usize, conn: usize, frame: Frame, opts: SendOptions) -> Result<()> {
        let root = self.resolve(sock)?;
        let mut st = root.inner.lock();
        let target = st.conns.get(conn).cloned().ok_or(Error::InvalidHandle(conn))?;
        // Zombie first: a dead connection is a hard error even when the
        // gate would have bounced the caller anyway.
        if target.state.lock().zombie {
            return Err(Error::InvalidState);
        }
        root.wait_send_gate(&mut st, opts.dont_wait)?;
        root.send_locked(&mut st, &target, frame)
    }

    fn send_dist(
        &self,
        sock: usize,
        target: DistTarget,
        frame: Frame,
        filter: DistFilter,
        opts: SendOptions,
    ) -> Result<()> {
        let root = self.resolve(sock)?;
        let mut st = root.inner.lock();
        root.wait_send_gate(&mut st, opts.dont_wait)?;
        let conns: Vec<Arc<ConnSock>> = match target {
            DistTarget::All => st.conns.iter().map(|(_, c)| c.clone()).collect(),
            DistTarget::Bind(b) => {
                let bind = st.binds.get(b).cloned().ok_or(Error::InvalidHandle(b))?;
                let bs = bind.state.lock();
                bs.conns.iter().map(|(_, c)| c.clone()).collect()
            }
            DistTarget::BindConn(b, c) => {
                let bind = st.binds.get(b).cloned().ok_or(Error::InvalidHandle(b))?;
                let conn = bind
                    .state
                    .lock()
                    .conns
                    .get(c)
                    .cloned()
                    .ok_or(Error::InvalidHandle(c))?;
                return root.send_locked(&mut st, &conn, frame);
            }
        };
        // Frames are refcounted; the fan-out clones are cheap.
        let mut last = Ok(());
        for conn in conns {
            if !filter.matches(conn.direction) {
                continue;
            }
            let result = root.send_locked(&mut st, &conn, frame.clone());
            if result.is_err() && opts.stop_on_error {
                return result;
            }
            last = result;
        }
        last
    }

    fn close_connection(&self, sock: usize, conn: usize) -> Result<()> {
        let root = self.resolve(sock)?;
        let removed = root.inner.lock().conns.remove(conn);
        let Some(conn) = removed else {
            return Err(Error::InvalidHandle(conn));
        };
        if let Some(bind) = conn.parent_bind.as_ref().and_then(Weak::upgrade) {
            let local = conn.state.lock().local_handle;
            bind.state.lock().conns.remove(local);
        }
        conn.mark_zombie();
        // Frames that never reached the wire leave the send queue with the
        // connection; the counter follows them out.
        let dropped = conn.state.lock().outq.len();
        root.frames_flushed(dropped);
        conn.worker.schedule(Task::CloseConn(conn.clone()));
        debug!(sock, "connection closed");
        Ok(())
    }

    /// Attach an accepted stream: allocate the connection, insert it into
    /// the bind's subset table and then the root's flat table (one lock at
    /// a time), pick a worker independently of the bind's, and hand the
    /// stream over. Runs on the accepting bind's worker.
    pub(crate) fn accept_connection(&self, bind: &Arc<BindSock>, stream: TcpStream) {
        let Some(root) = bind.owner.upgrade() else {
            return;
        };
        let Some(worker) = self.choose_worker() else {
            return;
        };
        let conn = Arc::new(ConnSock::new(
            Direction::Incoming,
            Arc::downgrade(&root),
            Some(Arc::downgrade(bind)),
            worker,
            stream,
        ));
        let local = match bind.state.lock().conns.insert(conn.clone()) {
            Ok(local) => local,
            Err(_) => {
                debug!("bind connection table full, dropping accepted stream");
                return;
            }
        };
        let handle = match root.inner.lock().conns.insert(conn.clone()) {
            Ok(handle) => handle,
            Err(_) => {
                bind.state.lock().conns.remove(local);
                debug!("socket connection table full, dropping accepted stream");
                return;
            }
        };
        {
            let mut cs = conn.state.lock();
            cs.handle = handle;
            cs.local_handle = local;
        }
        // Queue the event before arming the stream: frames parsed by the
        // connection's worker must never overtake the NewConnection event.
        root.queue_events(vec![Event::NewConnection(handle)]);
        conn.worker.schedule(Task::StartConn(conn.clone()));
    }

    fn resolve(&self, sock: usize) -> Result<Arc<RootSock>> {
        self.state
            .lock()
            .socks
            .get(sock)
            .cloned()
            .ok_or(Error::InvalidHandle(sock))
    }

    fn choose_worker(&self) -> Option<Arc<WorkerHandle>> {
        let mut st = self.state.lock();
        st.pool.as_mut().map(WorkerPool::choose)
    }
}

/// Non-blocking listener the way the original sets one up: reuse-addr,
/// backlog 1024.
fn listen_socket(addr: SocketAddr) -> std::io::Result<TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};

    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    Ok(TcpListener::from_std(socket.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sock::Gate;
    use std::thread;
    use std::time::Duration;

    fn ctx() -> Context {
        Context::new(Config::default().with_workers(2))
    }

    fn pool_running(ctx: &Context) -> bool {
        ctx.inner().state.lock().pool.is_some()
    }

    #[test]
    fn test_open_starts_pool_close_stops_it() {
        let ctx = ctx();
        assert!(!pool_running(&ctx));

        let sock = ctx.open().unwrap();
        assert!(pool_running(&ctx));
        assert_eq!(ctx.socket_count(), 1);

        ctx.close(sock).unwrap();
        assert_eq!(ctx.socket_count(), 0);
        assert!(!pool_running(&ctx));
    }

    #[test]
    fn test_pool_survives_while_sockets_remain() {
        let ctx = ctx();
        let a = ctx.open().unwrap();
        let b = ctx.open().unwrap();

        ctx.close(a).unwrap();
        assert!(pool_running(&ctx));

        ctx.close(b).unwrap();
        assert!(!pool_running(&ctx));
    }

    #[test]
    fn test_close_of_closed_handle_fails_cleanly() {
        let ctx = ctx();
        let sock = ctx.open().unwrap();
        ctx.close(sock).unwrap();

        assert!(matches!(ctx.close(sock), Err(Error::InvalidHandle(_))));
        // Registry stays usable afterwards.
        let again = ctx.open().unwrap();
        ctx.close(again).unwrap();
    }

    #[test]
    fn test_handles_are_reused_after_close() {
        let ctx = ctx();
        let a = ctx.open().unwrap();
        let uniq_a = ctx.uniq(a).unwrap();
        let keeper = ctx.open().unwrap();

        ctx.close(a).unwrap();
        let b = ctx.open().unwrap();
        assert_eq!(b, a);
        // Different incarnation, different uniq (with overwhelming odds).
        assert_ne!(ctx.uniq(b).unwrap(), uniq_a);

        ctx.close(b).unwrap();
        ctx.close(keeper).unwrap();
    }

    #[test]
    fn test_concurrent_open_close_leaves_consistent_state() {
        let ctx = ctx();
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let ctx = ctx.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        let sock = ctx.open().unwrap();
                        ctx.close(sock).unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        // Registry and pool must agree: everything closed, nothing running.
        assert_eq!(ctx.socket_count(), 0);
        assert!(!pool_running(&ctx));
    }

    #[test]
    fn test_recv_nonblocking_on_empty_queue() {
        let ctx = ctx();
        let sock = ctx.open().unwrap();
        assert!(matches!(
            ctx.recv_event(sock, false),
            Err(Error::WouldBlock)
        ));
        ctx.close(sock).unwrap();
    }

    #[test]
    fn test_recv_blocking_times_out() {
        let ctx = Context::new(
            Config::default()
                .with_workers(1)
                .with_recv_timeout(Duration::from_millis(50)),
        );
        let sock = ctx.open().unwrap();
        let start = std::time::Instant::now();
        assert!(matches!(ctx.recv_event(sock, true), Err(Error::Timeout)));
        assert!(start.elapsed() >= Duration::from_millis(50));
        ctx.close(sock).unwrap();
    }

    #[test]
    fn test_recv_hwm_gates_reading() {
        let ctx = ctx();
        let sock = ctx.open().unwrap();
        ctx.set_recv_hwm(sock, 2).unwrap();
        let root = ctx.inner().resolve(sock).unwrap();

        root.queue_events(vec![Event::NewConnection(0)]);
        assert_eq!(root.inner.lock().reading, Gate::Running);

        root.queue_events(vec![Event::NewConnection(1)]);
        assert_eq!(root.inner.lock().reading, Gate::Paused);

        // Draining one event below the mark reopens the gate.
        ctx.recv_event(sock, false).unwrap();
        assert_eq!(root.inner.lock().reading, Gate::Running);

        ctx.recv_event(sock, false).unwrap();
        ctx.close(sock).unwrap();
    }

    #[test]
    fn test_send_hwm_gates_senders() {
        let ctx = ctx();
        let sock = ctx.open().unwrap();
        ctx.set_send_hwm(sock, 1).unwrap();
        let root = ctx.inner().resolve(sock).unwrap();

        // A connection with no stream behind it: frames queue, nothing
        // flushes, so the counter only moves the way we drive it.
        let worker = root.workers[0].clone();
        let conn = Arc::new(ConnSock::stub(
            Direction::Outgoing,
            Arc::downgrade(&root),
            worker,
        ));
        let handle = root.inner.lock().conns.insert(conn.clone()).unwrap();
        conn.state.lock().handle = handle;

        ctx.send(sock, handle, Frame::new(&b"a"[..]), SendOptions::default())
            .unwrap();
        assert_eq!(root.inner.lock().writing, Gate::Paused);

        // Gate closed: non-blocking senders bounce.
        assert!(matches!(
            ctx.send(sock, handle, Frame::new(&b"b"[..]), SendOptions::dont_wait()),
            Err(Error::WouldBlock)
        ));

        // Draining below the mark reopens the gate and unblocks senders.
        root.frames_flushed(1);
        assert_eq!(root.inner.lock().writing, Gate::Running);
        ctx.send(sock, handle, Frame::new(&b"c"[..]), SendOptions::dont_wait())
            .unwrap();

        ctx.close(sock).unwrap();
    }

    #[test]
    fn test_send_to_zombie_is_invalid_state() {
        let ctx = ctx();
        let sock = ctx.open().unwrap();
        let root = ctx.inner().resolve(sock).unwrap();

        let worker = root.workers[0].clone();
        let conn = Arc::new(ConnSock::stub(
            Direction::Incoming,
            Arc::downgrade(&root),
            worker,
        ));
        let handle = root.inner.lock().conns.insert(conn.clone()).unwrap();
        conn.state.lock().handle = handle;
        conn.mark_zombie();

        assert!(matches!(
            ctx.send(sock, handle, Frame::new(&b"x"[..]), SendOptions::default()),
            Err(Error::InvalidState)
        ));

        // Reap it, then the handle is gone.
        ctx.close_connection(sock, handle).unwrap();
        assert!(matches!(
            ctx.close_connection(sock, handle),
            Err(Error::InvalidHandle(_))
        ));
        ctx.close(sock).unwrap();
    }

    #[test]
    fn test_blocked_sender_wakes_on_drain() {
        let ctx = ctx();
        let sock = ctx.open().unwrap();
        ctx.set_send_hwm(sock, 1).unwrap();
        let root = ctx.inner().resolve(sock).unwrap();

        let worker = root.workers[0].clone();
        let conn = Arc::new(ConnSock::stub(
            Direction::Outgoing,
            Arc::downgrade(&root),
            worker,
        ));
        let handle = root.inner.lock().conns.insert(conn.clone()).unwrap();
        conn.state.lock().handle = handle;

        ctx.send(sock, handle, Frame::new(&b"a"[..]), SendOptions::default())
            .unwrap();

        let blocked = {
            let ctx = ctx.clone();
            thread::spawn(move || {
                ctx.send(sock, handle, Frame::new(&b"b"[..]), SendOptions::default())
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!blocked.is_finished());

        root.frames_flushed(1);
        blocked.join().unwrap().unwrap();
        ctx.close(sock).unwrap();
    }
}
