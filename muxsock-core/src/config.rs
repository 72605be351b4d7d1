//! Context configuration
//!
//! The constants the original design hard-wired (pool size, blocking-receive
//! timeout, read chunk size) are configuration inputs here, with the original
//! values as defaults.

use std::time::Duration;

/// Configuration for a [`Context`](crate::Context).
///
/// # Examples
///
/// ```
/// use muxsock_core::Config;
/// use std::time::Duration;
///
/// let cfg = Config::default()
///     .with_workers(2)
///     .with_recv_timeout(Duration::from_secs(2));
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of worker threads, each driving one event loop.
    pub workers: usize,

    /// Maximum time a blocking receive waits before failing with `Timeout`.
    pub recv_timeout: Duration,

    /// Default receive high-water mark for new sockets (0 = unlimited).
    ///
    /// When the inbound event queue reaches this many entries, reading is
    /// paused on every connection of the socket until the queue drains
    /// below the mark.
    pub recv_hwm: usize,

    /// Default send high-water mark for new sockets (0 = unlimited).
    ///
    /// When this many outbound frames are queued across a socket's
    /// connections, further senders block (or fail with `WouldBlock`)
    /// until the queues drain below the mark.
    pub send_hwm: usize,

    /// Bytes read from a connection per `read` call.
    pub read_chunk: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 4,
            recv_timeout: Duration::from_secs(10),
            recv_hwm: 0,
            send_hwm: 0,
            read_chunk: 1400,
        }
    }
}

impl Config {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker thread count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Set the blocking-receive timeout.
    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = timeout;
        self
    }

    /// Set the default receive high-water mark (0 = unlimited).
    pub fn with_recv_hwm(mut self, hwm: usize) -> Self {
        self.recv_hwm = hwm;
        self
    }

    /// Set the default send high-water mark (0 = unlimited).
    pub fn with_send_hwm(mut self, hwm: usize) -> Self {
        self.send_hwm = hwm;
        self
    }

    /// Set the per-read chunk size.
    pub fn with_read_chunk(mut self, bytes: usize) -> Self {
        self.read_chunk = bytes.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.recv_timeout, Duration::from_secs(10));
        assert_eq!(cfg.recv_hwm, 0);
        assert_eq!(cfg.send_hwm, 0);
        assert_eq!(cfg.read_chunk, 1400);
    }

    #[test]
    fn test_builder_pattern() {
        let cfg = Config::new()
            .with_workers(2)
            .with_recv_timeout(Duration::from_millis(500))
            .with_recv_hwm(5)
            .with_send_hwm(8);

        assert_eq!(cfg.workers, 2);
        assert_eq!(cfg.recv_timeout, Duration::from_millis(500));
        assert_eq!(cfg.recv_hwm, 5);
        assert_eq!(cfg.send_hwm, 8);
    }

    #[test]
    fn test_degenerate_values_clamped() {
        let cfg = Config::new().with_workers(0).with_read_chunk(0);
        assert_eq!(cfg.workers, 1);
        assert_eq!(cfg.read_chunk, 1);
    }
}
