//! Completion engine over io_uring (Linux only).
//!
//! A configurable number of dispatcher threads each own a ring. A
//! dispatcher submits receive and send operations for its sessions and
//! reacts to their completions; decode/transform/encode still runs on the
//! worker pool. Sessions reach a dispatcher (fresh from the acceptor or
//! back from a worker) through a channel, followed by a write to the
//! dispatcher's eventfd, which the ring always has a read armed on.
//!
//! A session's buffer is only ever referenced by one in-flight operation,
//! and a session is never dropped while it has one.

mod event_loop;
mod token;

use crate::error::SessionEnd;
use crate::metrics::StatsSnapshot;
use crate::runtime::{Acceptor, ClientLimit, Engine, EngineContext, Session};
use crossbeam::channel::{unbounded, Receiver, Sender};
use event_loop::Dispatcher;
use io_uring::IoUring;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

type AsyncSession = Session<TcpStream>;

/// Whether io_uring is usable on this host (kernel support, seccomp).
pub fn is_supported() -> bool {
    IoUring::new(2).is_ok()
}

/// Counting eventfd used to wake a dispatcher blocked on its ring.
struct Notifier {
    fd: OwnedFd,
}

impl Notifier {
    fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: eventfd returned a fresh descriptor we exclusively own
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    fn notify(&self) {
        let one: u64 = 1;
        let rc = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if rc < 0 {
            debug!(error = %io::Error::last_os_error(), "Dispatcher wake failed");
        }
    }

    fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Sending side of a dispatcher.
struct DispatcherHandle {
    tx: Sender<AsyncSession>,
    notifier: Arc<Notifier>,
}

impl DispatcherHandle {
    /// Hand a session over. Dropped (and its socket closed) if the
    /// dispatcher already exited.
    fn deliver(&self, session: AsyncSession) {
        if self.tx.send(session).is_ok() {
            self.notifier.notify();
        }
    }

    fn wake(&self) {
        self.notifier.notify();
    }
}

/// Ring and inbox of a dispatcher that has not been started yet.
struct DispatcherParts {
    ring: IoUring,
    inbox: Receiver<AsyncSession>,
    notifier: Arc<Notifier>,
}

pub struct AsyncEngine {
    inner: Arc<Inner>,
}

struct Inner {
    ctx: EngineContext,
    acceptor: Acceptor,
    dispatchers: Vec<DispatcherHandle>,
    /// Taken by `start`.
    pending: Mutex<Option<Vec<DispatcherParts>>>,
}

impl AsyncEngine {
    pub(crate) fn new(ctx: EngineContext) -> io::Result<Self> {
        let count = ctx.settings.dispatchers.max(1);
        let mut dispatchers = Vec::with_capacity(count);
        let mut parts = Vec::with_capacity(count);

        for _ in 0..count {
            let ring = IoUring::new(ctx.settings.ring_entries.max(2))?;
            let notifier = Arc::new(Notifier::new()?);
            let (tx, inbox) = unbounded();
            dispatchers.push(DispatcherHandle {
                tx,
                notifier: Arc::clone(&notifier),
            });
            parts.push(DispatcherParts {
                ring,
                inbox,
                notifier,
            });
        }

        let acceptor = Acceptor::bind(ctx.settings.addr)?;
        Ok(Self {
            inner: Arc::new(Inner {
                ctx,
                acceptor,
                dispatchers,
                pending: Mutex::new(Some(parts)),
            }),
        })
    }
}

impl Engine for AsyncEngine {
    fn local_addr(&self) -> SocketAddr {
        self.inner.acceptor.local_addr()
    }

    fn start(&self, limit: ClientLimit) -> io::Result<()> {
        let inner = &self.inner;
        let ctx = &inner.ctx;
        ctx.lifecycle.arm(limit)?;

        let parts = lock(&inner.pending)
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::AlreadyExists, "engine already started"))?;
        ctx.metrics.write_header();

        let mut handles = Vec::with_capacity(parts.len());
        for (index, parts) in parts.into_iter().enumerate() {
            match spawn_dispatcher(inner, index, parts) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    inner.stop();
                    join_all(handles);
                    ctx.pool.join();
                    return Err(e);
                }
            }
        }

        info!(
            addr = %self.local_addr(),
            workers = ctx.pool.size(),
            dispatchers = inner.dispatchers.len(),
            limit = ?limit,
            "Async engine started"
        );

        if limit == ClientLimit::Bounded(0) {
            inner.stop();
        }

        let outcome = inner.acceptor.run(limit, &ctx.lifecycle, |stream, peer, conn_id| {
            ctx.stats.connection_accepted();
            debug!(conn_id, peer = %peer, "Accepted connection");
            inner.admit(conn_id, stream);
        });

        if ctx.accept_finished(limit, &outcome) {
            inner.stop();
        }

        join_all(handles);
        ctx.pool.shutdown();
        ctx.pool.join();
        info!("Async engine stopped");

        outcome.error.map_or(Ok(()), Err)
    }

    fn shutdown(&self) {
        self.inner.stop();
    }

    fn stats(&self) -> StatsSnapshot {
        self.inner.ctx.stats.snapshot()
    }
}

fn spawn_dispatcher(inner: &Arc<Inner>, index: usize, parts: DispatcherParts) -> io::Result<JoinHandle<()>> {
    let inner = Arc::clone(inner);
    thread::Builder::new()
        .name(format!("dispatcher-{index}"))
        .spawn(move || {
            let dispatcher = Dispatcher::new(index, parts, inner.ctx.settings.ring_entries as usize);
            if let Err(e) = dispatcher.run(&inner) {
                error!(dispatcher = index, error = %e, "Dispatcher failed");
                inner.stop();
            }
        })
}

fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if handle.join().is_err() {
            error!("Dispatcher thread panicked");
        }
    }
}

impl Inner {
    /// Stop the run: retire the pool, release the acceptor and wake every
    /// dispatcher so it can cancel its sessions.
    fn stop(&self) {
        self.ctx.lifecycle.stop();
        self.ctx.pool.shutdown();
        self.acceptor.wake();
        for dispatcher in &self.dispatchers {
            dispatcher.wake();
        }
    }

    /// Spread accepted sockets over the dispatchers round-robin.
    fn admit(&self, conn_id: u64, stream: TcpStream) {
        let settings = &self.ctx.settings;
        let index = (conn_id % self.dispatchers.len() as u64) as usize;
        self.dispatchers[index].deliver(Session::new(
            conn_id,
            stream,
            settings.initial_buffer,
            settings.max_frame_len,
        ));
    }

    /// Run the buffered request on a worker, then return the session to
    /// dispatcher `index` for its response write.
    fn dispatch(self: &Arc<Self>, index: usize, session: AsyncSession) {
        let inner = Arc::clone(self);
        let submitted = self.ctx.pool.submit(move || {
            let mut session = session;
            match session.cycle.process(inner.ctx.transform.as_ref()) {
                Ok(()) => inner.dispatchers[index].deliver(session),
                Err(e) => {
                    let conn_id = session.id;
                    drop(session);
                    inner.close(conn_id, SessionEnd::Violation(e));
                }
            }
        });
        if submitted.is_err() {
            debug!("Worker pool closed, dropping session");
        }
    }

    /// Account for a session whose socket has already been dropped.
    fn close(&self, conn_id: u64, end: SessionEnd) {
        if self.ctx.session_closed(conn_id, end) {
            self.stop();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notifier_counts_wakes() {
        let notifier = Notifier::new().unwrap();
        notifier.notify();
        notifier.notify();

        let mut value = [0u8; 8];
        let n = unsafe {
            libc::read(
                notifier.raw_fd(),
                value.as_mut_ptr() as *mut libc::c_void,
                value.len(),
            )
        };
        assert_eq!(n, 8);
        assert_eq!(u64::from_ne_bytes(value), 2);
    }
}
