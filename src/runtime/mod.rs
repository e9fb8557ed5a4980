//! Server engines and the machinery they share.
//!
//! Three interchangeable engines serve the same protocol:
//! - `blocking`: a thread per connection plus an in-order responder thread
//! - `mio`: one read loop and one write loop over readiness polls
//! - `uring`: io_uring completion dispatchers (Linux only)
//!
//! All of them share:
//! - `GrowableBuffer`: the per-session reusable buffer
//! - `FrameCycle`: the frame state machine (reactor and async)
//! - `WorkerPool`: where decode/transform/encode always runs
//! - `Acceptor`: the blocking accept loop on the `start` thread

mod acceptor;
mod blocking;
mod buffer;
mod mio;
mod pool;
mod session;

#[cfg(target_os = "linux")]
mod uring;

#[cfg(test)]
mod scenarios;

pub(crate) use acceptor::{AcceptOutcome, Acceptor};
pub use buffer::{GrowableBuffer, DEFAULT_INITIAL_CAPACITY};
pub(crate) use pool::WorkerPool;
pub(crate) use session::{ReadProgress, Session, WriteProgress};

use crate::error::SessionEnd;
use crate::metrics::{EngineStats, MetricsSink, StatsSnapshot};
use crate::protocol::DEFAULT_MAX_FRAME_LEN;
use crate::transform::{QuadraticSort, Transform};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Which engine serves the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Blocking,
    Reactor,
    Async,
}

/// How many connections a run serves before shutting itself down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientLimit {
    Bounded(usize),
    Unbounded,
}

impl ClientLimit {
    /// Whether another connection may be accepted after `accepted` so far.
    pub fn admits(&self, accepted: u64) -> bool {
        match self {
            ClientLimit::Bounded(n) => accepted < *n as u64,
            ClientLimit::Unbounded => true,
        }
    }
}

impl From<Option<usize>> for ClientLimit {
    fn from(limit: Option<usize>) -> Self {
        limit.map_or(ClientLimit::Unbounded, ClientLimit::Bounded)
    }
}

/// Engine tuning shared by all engine kinds.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub addr: SocketAddr,
    /// Worker pool size.
    pub workers: usize,
    /// Starting capacity of each session buffer.
    pub initial_buffer: usize,
    /// Largest accepted frame payload.
    pub max_frame_len: usize,
    /// Readiness events fetched per poll (reactor).
    pub event_capacity: usize,
    /// Completion dispatcher threads (async).
    pub dispatchers: usize,
    /// Submission queue entries per ring (async).
    pub ring_entries: u32,
}

impl EngineSettings {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            workers: available_parallelism(),
            initial_buffer: DEFAULT_INITIAL_CAPACITY,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            event_capacity: 1024,
            dispatchers: 1,
            ring_entries: 256,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 4444))
    }
}

/// A running server engine.
pub trait Engine: Send + Sync {
    /// Address the listener is bound to.
    fn local_addr(&self) -> SocketAddr;

    /// Serve until `limit` connections have come and gone, or until
    /// [`shutdown`](Engine::shutdown). Blocks the calling thread, which
    /// acts as the acceptor.
    fn start(&self, limit: ClientLimit) -> io::Result<()>;

    /// Stop accepting, close sessions and retire all threads.
    fn shutdown(&self);

    fn stats(&self) -> StatsSnapshot;
}

/// Create an engine writing metrics to stdout and sorting payloads.
pub fn new_engine(kind: EngineKind, settings: EngineSettings) -> io::Result<Arc<dyn Engine>> {
    new_engine_with(
        kind,
        settings,
        Arc::new(MetricsSink::stdout()),
        Arc::new(QuadraticSort),
    )
}

/// Create an engine with an explicit metrics sink and transform.
pub fn new_engine_with(
    kind: EngineKind,
    settings: EngineSettings,
    metrics: Arc<MetricsSink>,
    transform: Arc<dyn Transform>,
) -> io::Result<Arc<dyn Engine>> {
    let ctx = EngineContext::new(settings, metrics, transform)?;
    match kind {
        EngineKind::Blocking => Ok(Arc::new(blocking::BlockingEngine::new(ctx)?)),
        EngineKind::Reactor => Ok(Arc::new(self::mio::ReactorEngine::new(ctx)?)),
        EngineKind::Async => new_async_engine(ctx),
    }
}

#[cfg(target_os = "linux")]
fn new_async_engine(ctx: EngineContext) -> io::Result<Arc<dyn Engine>> {
    Ok(Arc::new(uring::AsyncEngine::new(ctx)?))
}

#[cfg(not(target_os = "linux"))]
fn new_async_engine(_ctx: EngineContext) -> io::Result<Arc<dyn Engine>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "the async engine requires io_uring (Linux only)",
    ))
}

/// Whether this host can run the async engine.
pub fn async_supported() -> bool {
    #[cfg(target_os = "linux")]
    {
        uring::is_supported()
    }

    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

/// Remaining-clients counter and stop flag of one run.
#[derive(Debug, Default)]
pub struct Lifecycle {
    started: AtomicBool,
    bounded: AtomicBool,
    remaining: AtomicUsize,
    stopping: AtomicBool,
}

impl Lifecycle {
    /// Arm the counter for a run. Fails if a run was already started.
    pub fn arm(&self, limit: ClientLimit) -> io::Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "engine already started",
            ));
        }
        if let ClientLimit::Bounded(n) = limit {
            self.remaining.store(n, Ordering::Release);
            self.bounded.store(true, Ordering::Release);
        }
        Ok(())
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Flag the run as stopping. Returns `true` for the first caller.
    pub fn stop(&self) -> bool {
        !self.stopping.swap(true, Ordering::AcqRel)
    }

    /// Count a closed connection. Returns `true` when it was the last one
    /// of a bounded run.
    pub fn connection_closed(&self) -> bool {
        self.forfeit(1)
    }

    /// Give up `n` connections of a bounded run (closed, or never to be
    /// accepted). Returns `true` when nothing remains.
    pub fn forfeit(&self, n: usize) -> bool {
        if n == 0 || !self.bounded.load(Ordering::Acquire) {
            return false;
        }
        self.remaining.fetch_sub(n, Ordering::AcqRel) == n
    }

    /// Connections a bounded run is still waiting on.
    pub fn remaining(&self) -> Option<usize> {
        self.bounded
            .load(Ordering::Acquire)
            .then(|| self.remaining.load(Ordering::Acquire))
    }
}

/// State shared by every thread of one engine instance.
pub(crate) struct EngineContext {
    pub settings: EngineSettings,
    pub pool: WorkerPool,
    pub metrics: Arc<MetricsSink>,
    pub transform: Arc<dyn Transform>,
    pub stats: EngineStats,
    pub lifecycle: Lifecycle,
}

impl EngineContext {
    fn new(
        settings: EngineSettings,
        metrics: Arc<MetricsSink>,
        transform: Arc<dyn Transform>,
    ) -> io::Result<Self> {
        let pool = WorkerPool::new(settings.workers)?;
        Ok(Self {
            settings,
            pool,
            metrics,
            transform,
            stats: EngineStats::default(),
            lifecycle: Lifecycle::default(),
        })
    }

    /// Account for a closed session. Returns `true` if the run is now drained.
    pub fn session_closed(&self, conn_id: u64, end: SessionEnd) -> bool {
        match end {
            SessionEnd::Graceful => {
                self.stats.graceful_close();
                debug!(conn_id, remaining = ?self.lifecycle.remaining(), "Connection closed");
            }
            SessionEnd::Violation(e) => {
                self.stats.violation();
                warn!(
                    conn_id,
                    remaining = ?self.lifecycle.remaining(),
                    error = %e,
                    "Protocol violation, closing connection"
                );
            }
        }
        self.lifecycle.connection_closed()
    }

    /// Reconcile the run after the accept loop returned.
    ///
    /// Connections a bounded run will never accept are forfeited. An accept
    /// failure in an unbounded run ends the run. Returns `true` if the run
    /// should now be stopped.
    pub fn accept_finished(&self, limit: ClientLimit, outcome: &AcceptOutcome) -> bool {
        match limit {
            ClientLimit::Bounded(n) => {
                let unaccepted = (n as u64).saturating_sub(outcome.accepted) as usize;
                self.lifecycle.forfeit(unaccepted)
            }
            ClientLimit::Unbounded => outcome.error.is_some(),
        }
    }
}

fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_limit() {
        assert!(ClientLimit::Bounded(2).admits(1));
        assert!(!ClientLimit::Bounded(2).admits(2));
        assert!(ClientLimit::Unbounded.admits(u64::MAX));
        assert_eq!(ClientLimit::from(Some(3)), ClientLimit::Bounded(3));
        assert_eq!(ClientLimit::from(None), ClientLimit::Unbounded);
    }

    #[test]
    fn test_lifecycle_bounded() {
        let lifecycle = Lifecycle::default();
        lifecycle.arm(ClientLimit::Bounded(3)).unwrap();
        assert!(!lifecycle.connection_closed());
        assert!(!lifecycle.connection_closed());
        assert_eq!(lifecycle.remaining(), Some(1));
        assert!(lifecycle.connection_closed());
    }

    #[test]
    fn test_lifecycle_forfeit() {
        let lifecycle = Lifecycle::default();
        lifecycle.arm(ClientLimit::Bounded(5)).unwrap();
        assert!(!lifecycle.connection_closed());
        assert!(!lifecycle.forfeit(3));
        assert!(lifecycle.connection_closed());
    }

    #[test]
    fn test_lifecycle_unbounded_never_drains() {
        let lifecycle = Lifecycle::default();
        lifecycle.arm(ClientLimit::Unbounded).unwrap();
        assert!(!lifecycle.connection_closed());
        assert_eq!(lifecycle.remaining(), None);
    }

    #[test]
    fn test_lifecycle_single_start() {
        let lifecycle = Lifecycle::default();
        lifecycle.arm(ClientLimit::Unbounded).unwrap();
        let err = lifecycle.arm(ClientLimit::Unbounded).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_stop_once() {
        let lifecycle = Lifecycle::default();
        assert!(lifecycle.stop());
        assert!(!lifecycle.stop());
        assert!(lifecycle.is_stopping());
    }
}
