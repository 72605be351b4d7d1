//! Worker thread pool
//!
//! A fixed set of threads, each driving an independent mio poll loop. New
//! binds and connections are assigned to workers round-robin; each worker
//! owns the streams assigned to it and is the only thread to touch them.
//!
//! Cross-thread scheduling: every worker has a lock-protected task queue
//! and a waker registered on its poll (token 0). `schedule` pushes a task
//! and wakes the loop. Bulk gate changes lock every queue in index order
//! before pushing, unlock all, then wake all; see the read-gate handling
//! on [`RootSock`](crate::sock::RootSock).

use crate::event::Event;
use crate::sock::{BindSock, ConnSock, Gate};

use bytes::Bytes;
use hashbrown::HashMap;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, trace, warn};

const WAKER_TOKEN: Token = Token(0);

/// Cross-thread work handed to a worker loop.
pub(crate) enum Task {
    /// Register a bind's listener for accept readiness.
    StartListen(Arc<BindSock>),
    /// Register a connection's stream for read/write readiness.
    StartConn(Arc<ConnSock>),
    /// Re-arm write readiness after frames were queued on an idle
    /// connection.
    StartWrite(Arc<ConnSock>),
    /// Flow control: drop read interest.
    PauseReads(Arc<ConnSock>),
    /// Flow control: restore read interest.
    ResumeReads(Arc<ConnSock>),
    /// Release a bind's listener.
    CloseBind(Arc<BindSock>),
    /// Release a connection's stream.
    CloseConn(Arc<ConnSock>),
    /// Exit the loop.
    Shutdown,
}

/// The shared half of a worker: what other threads schedule against.
pub(crate) struct WorkerHandle {
    pub index: usize,
    queue: Mutex<VecDeque<Task>>,
    waker: Waker,
}

impl WorkerHandle {
    /// Enqueue a task and wake the loop.
    pub fn schedule(&self, task: Task) {
        self.queue.lock().push_back(task);
        let _ = self.waker.wake();
    }

    /// Lock the task queue without waking; part of the bulk protocol.
    pub fn lock_queue(&self) -> MutexGuard<'_, VecDeque<Task>> {
        self.queue.lock()
    }

    pub fn wake(&self) {
        let _ = self.waker.wake();
    }

    /// A handle with a live waker but no loop behind it, for unit tests of
    /// state transitions that never reach the reactor.
    #[cfg(test)]
    pub fn detached(index: usize) -> Arc<WorkerHandle> {
        let poll = Poll::new().unwrap();
        let waker = Waker::new(poll.registry(), WAKER_TOKEN).unwrap();
        Arc::new(WorkerHandle {
            index,
            queue: Mutex::new(VecDeque::new()),
            waker,
        })
    }
}

/// The fixed worker pool. Round-robin assignment lives here; callers hold
/// the global registry lock across `choose`.
pub(crate) struct WorkerPool {
    workers: Vec<Arc<WorkerHandle>>,
    threads: Vec<JoinHandle<()>>,
    next: usize,
}

impl WorkerPool {
    /// Start `count` workers. Failure to start any of them stops the ones
    /// already running and surfaces the error: there is no partial-pool
    /// operation.
    pub fn start(count: usize, read_chunk: usize) -> io::Result<WorkerPool> {
        let mut workers = Vec::with_capacity(count);
        let mut threads = Vec::with_capacity(count);
        for index in 0..count {
            match Self::start_worker(index, read_chunk) {
                Ok((handle, thread)) => {
                    workers.push(handle);
                    threads.push(thread);
                }
                Err(e) => {
                    error!(worker = index, error = %e, "worker start failed, stopping pool");
                    let partial = WorkerPool {
                        workers,
                        threads,
                        next: 0,
                    };
                    partial.shutdown();
                    return Err(e);
                }
            }
        }
        debug!(count, "worker pool started");
        Ok(WorkerPool {
            workers,
            threads,
            next: 0,
        })
    }

    fn start_worker(
        index: usize,
        read_chunk: usize,
    ) -> io::Result<(Arc<WorkerHandle>, JoinHandle<()>)> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let handle = Arc::new(WorkerHandle {
            index,
            queue: Mutex::new(VecDeque::new()),
            waker,
        });
        let worker = Worker {
            index,
            poll,
            events: Events::with_capacity(1024),
            handle: handle.clone(),
            entries: HashMap::new(),
            next_token: 1,
            read_buf: vec![0; read_chunk],
            running: true,
        };
        let thread = thread::Builder::new()
            .name(format!("muxsock-worker-{index}"))
            .spawn(move || worker.run())?;
        Ok((handle, thread))
    }

    /// Round-robin next worker. Caller holds the global registry lock.
    pub fn choose(&mut self) -> Arc<WorkerHandle> {
        let worker = self.workers[self.next].clone();
        self.next = (self.next + 1) % self.workers.len();
        worker
    }

    /// Worker handles in index order.
    pub fn handles(&self) -> &[Arc<WorkerHandle>] {
        &self.workers
    }

    /// Stop and join every worker.
    pub fn shutdown(mut self) {
        for worker in &self.workers {
            worker.schedule(Task::Shutdown);
        }
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                error!("worker thread panicked during shutdown");
            }
        }
        debug!("worker pool stopped");
    }
}

#[derive(Clone)]
enum Entry {
    Bind(Arc<BindSock>),
    Conn(Arc<ConnSock>),
}

/// The thread-private half of a worker: the poll loop and its registry of
/// assigned listeners and streams.
struct Worker {
    index: usize,
    poll: Poll,
    events: Events,
    handle: Arc<WorkerHandle>,
    entries: HashMap<Token, Entry>,
    next_token: usize,
    read_buf: Vec<u8>,
    running: bool,
}

fn desired_interest(want_read: bool, want_write: bool) -> Option<Interest> {
    match (want_read, want_write) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

impl Worker {
    fn run(mut self) {
        debug!(worker = self.index, "worker loop started");
        while self.running {
            if let Err(e) = self.poll.poll(&mut self.events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(worker = self.index, error = %e, "poll failed, stopping worker");
                break;
            }
            let ready: SmallVec<[(Token, bool, bool); 32]> = self
                .events
                .iter()
                .map(|ev| (ev.token(), ev.is_readable(), ev.is_writable()))
                .collect();
            for (token, readable, writable) in ready {
                if token == WAKER_TOKEN {
                    self.run_tasks();
                    continue;
                }
                let Some(entry) = self.entries.get(&token).cloned() else {
                    continue;
                };
                match entry {
                    Entry::Bind(bind) => {
                        if readable {
                            self.handle_accept(&bind);
                        }
                    }
                    Entry::Conn(conn) => {
                        if readable {
                            self.handle_read(&conn);
                        }
                        if writable {
                            self.handle_write(&conn);
                        }
                    }
                }
            }
        }
        let orphaned = self.entries.len();
        self.entries.clear();
        debug!(worker = self.index, orphaned, "worker loop exited");
    }

    fn run_tasks(&mut self) {
        let tasks = std::mem::take(&mut *self.handle.queue.lock());
        for task in tasks {
            match task {
                Task::StartListen(bind) => self.start_listen(&bind),
                Task::StartConn(conn) => self.start_conn(&conn),
                Task::StartWrite(conn) => self.set_conn_gate(&conn, None, Some(true)),
                Task::PauseReads(conn) => self.set_conn_gate(&conn, Some(false), None),
                Task::ResumeReads(conn) => self.set_conn_gate(&conn, Some(true), None),
                Task::CloseBind(bind) => self.close_bind(&bind),
                Task::CloseConn(conn) => self.close_conn(&conn),
                Task::Shutdown => self.running = false,
            }
        }
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    fn start_listen(&mut self, bind: &Arc<BindSock>) {
        let token = self.alloc_token();
        let registered = {
            let mut io = bind.io.lock();
            match io.listener.as_mut() {
                Some(listener) => self
                    .poll
                    .registry()
                    .register(listener, token, Interest::READABLE)
                    .is_ok(),
                None => false,
            }
        };
        if !registered {
            warn!(worker = self.index, "could not register listener");
            return;
        }
        {
            let mut bs = bind.state.lock();
            bs.token = Some(token);
            bs.registered = true;
        }
        self.entries.insert(token, Entry::Bind(bind.clone()));
        trace!(worker = self.index, token = token.0, "listener registered");
    }

    fn start_conn(&mut self, conn: &Arc<ConnSock>) {
        // Respect a read gate that paused while this connection was in
        // flight between accept and registration.
        let gate_open = conn
            .owner
            .upgrade()
            .map(|root| root.inner.lock().reading == Gate::Running)
            .unwrap_or(false);
        let token = self.alloc_token();
        {
            let mut cs = conn.state.lock();
            if cs.zombie {
                return;
            }
            cs.token = Some(token);
            cs.want_read = gate_open;
            cs.want_write = true;
        }
        self.entries.insert(token, Entry::Conn(conn.clone()));
        self.apply_conn_interest(conn);
        trace!(worker = self.index, token = token.0, "connection registered");
    }

    /// Flip a connection's read/write wishes and reconcile its readiness
    /// registration. `None` leaves a side untouched.
    fn set_conn_gate(&mut self, conn: &Arc<ConnSock>, read: Option<bool>, write: Option<bool>) {
        {
            let mut cs = conn.state.lock();
            if cs.zombie {
                return;
            }
            if let Some(read) = read {
                cs.want_read = read;
            }
            if let Some(write) = write {
                cs.want_write = write;
            }
        }
        self.apply_conn_interest(conn);
    }

    /// Reconcile the stream's registration with the connection's wishes.
    fn apply_conn_interest(&mut self, conn: &Arc<ConnSock>) {
        let (token, registered, desired) = {
            let cs = conn.state.lock();
            (
                cs.token,
                cs.registered,
                desired_interest(cs.want_read, cs.want_write),
            )
        };
        let Some(token) = token else { return };
        let result = {
            let mut io = conn.io.lock();
            let Some(stream) = io.stream.as_mut() else {
                return;
            };
            match (registered, desired) {
                (false, Some(interest)) => self
                    .poll
                    .registry()
                    .register(stream, token, interest)
                    .map(|()| true),
                (true, Some(interest)) => self
                    .poll
                    .registry()
                    .reregister(stream, token, interest)
                    .map(|()| true),
                (true, None) => self.poll.registry().deregister(stream).map(|()| false),
                (false, None) => Ok(false),
            }
        };
        match result {
            Ok(now_registered) => conn.state.lock().registered = now_registered,
            Err(e) => warn!(worker = self.index, error = %e, "interest update failed"),
        }
    }

    fn handle_accept(&mut self, bind: &Arc<BindSock>) {
        loop {
            let accepted = {
                let mut io = bind.io.lock();
                match io.listener.as_mut() {
                    Some(listener) => listener.accept(),
                    None => return,
                }
            };
            match accepted {
                Ok((stream, peer)) => {
                    let Some(ctx) = bind.ctx.upgrade() else { return };
                    debug!(worker = self.index, peer = %peer, "accepted connection");
                    ctx.accept_connection(bind, stream);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(worker = self.index, error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn handle_read(&mut self, conn: &Arc<ConnSock>) {
        let mut parsed: Vec<Event> = Vec::new();
        let mut dead = false;
        {
            let mut io = conn.io.lock();
            if io.stream.is_none() {
                return;
            }
            loop {
                let read = match io.stream.as_mut() {
                    Some(stream) => stream.read(&mut self.read_buf),
                    None => break,
                };
                match read {
                    Ok(0) => {
                        dead = true;
                        break;
                    }
                    Ok(n) => {
                        let mut chunk = Bytes::copy_from_slice(&self.read_buf[..n]);
                        match io.parser.decode_all(&mut chunk) {
                            Ok(frames) => {
                                parsed.extend(frames.into_iter().map(Event::NewFrame));
                            }
                            Err(e) => {
                                warn!(worker = self.index, error = %e, "parse error, dropping connection");
                                dead = true;
                                break;
                            }
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!(worker = self.index, error = %e, "read failed");
                        dead = true;
                        break;
                    }
                }
            }
        }
        if !parsed.is_empty() {
            if let Some(root) = conn.owner.upgrade() {
                root.queue_events(parsed);
            }
        }
        if dead {
            self.zombify(conn);
        }
    }

    fn handle_write(&mut self, conn: &Arc<ConnSock>) {
        if conn.state.lock().zombie {
            return;
        }
        loop {
            // Snapshot the pending list and flush outside the lock, so
            // senders keep making progress during the writes.
            let mut snapshot = {
                let mut cs = conn.state.lock();
                if cs.outq.is_empty() {
                    cs.writing = false;
                    cs.want_write = false;
                    drop(cs);
                    self.apply_conn_interest(conn);
                    return;
                }
                cs.outq.take()
            };
            let mut completed = 0usize;
            loop {
                let written = {
                    let mut io = conn.io.lock();
                    let Some(stream) = io.stream.as_mut() else {
                        return;
                    };
                    let slices = snapshot.io_slices();
                    stream.write_vectored(&slices)
                };
                match written {
                    Ok(0) => {
                        self.stop_writer(conn);
                        self.settle_flushed(conn, completed);
                        return;
                    }
                    Ok(n) => {
                        trace!(worker = self.index, bytes = n, "flushed");
                        completed += snapshot.advance(n);
                        if snapshot.is_empty() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        // Splice frames that arrived during the flush onto
                        // the unsent tail; readiness will retry later.
                        {
                            let mut cs = conn.state.lock();
                            let newer = cs.outq.take();
                            snapshot.splice_back(newer);
                            cs.outq = snapshot;
                        }
                        self.settle_flushed(conn, completed);
                        return;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!(worker = self.index, error = %e, "write failed, stopping writer");
                        self.stop_writer(conn);
                        self.settle_flushed(conn, completed);
                        return;
                    }
                }
            }
            self.settle_flushed(conn, completed);
        }
    }

    fn stop_writer(&mut self, conn: &Arc<ConnSock>) {
        {
            let mut cs = conn.state.lock();
            cs.writing = false;
            cs.want_write = false;
        }
        self.apply_conn_interest(conn);
    }

    fn settle_flushed(&self, conn: &Arc<ConnSock>, completed: usize) {
        if completed == 0 {
            return;
        }
        if let Some(root) = conn.owner.upgrade() {
            root.frames_flushed(completed);
        }
    }

    fn zombify(&mut self, conn: &Arc<ConnSock>) {
        if !conn.mark_zombie() {
            return;
        }
        debug!(worker = self.index, "connection marked zombie");
        let token = conn.state.lock().token;
        self.apply_conn_interest(conn);
        if let Some(token) = token {
            self.entries.remove(&token);
        }
    }

    fn close_bind(&mut self, bind: &Arc<BindSock>) {
        let token = {
            let mut bs = bind.state.lock();
            bs.registered = false;
            bs.token.take()
        };
        if let Some(mut listener) = bind.io.lock().listener.take() {
            let _ = self.poll.registry().deregister(&mut listener);
        }
        if let Some(token) = token {
            self.entries.remove(&token);
        }
        trace!(worker = self.index, "listener released");
    }

    fn close_conn(&mut self, conn: &Arc<ConnSock>) {
        let token = {
            let mut cs = conn.state.lock();
            cs.registered = false;
            cs.want_read = false;
            cs.want_write = false;
            cs.token.take()
        };
        if let Some(mut stream) = conn.io.lock().stream.take() {
            let _ = self.poll.registry().deregister(&mut stream);
        }
        if let Some(token) = token {
            self.entries.remove(&token);
        }
        trace!(worker = self.index, "connection released");
    }
}
