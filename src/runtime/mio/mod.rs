//! Readiness engine over mio (epoll on Linux, kqueue on macOS).
//!
//! Two event loops split the work: the read loop watches sessions waiting
//! for a request, the write loop watches sessions with a response to flush.
//! A session is owned by exactly one of {read loop, worker, write loop} at
//! a time and moves between them through a [`Mailbox`], so no session state
//! is ever shared across threads.
//!
//! ```text
//! acceptor --> read loop --Ready--> worker --> write loop --Flushed--+
//!                  ^                                                 |
//!                  +-------------------------------------------------+
//! ```

mod event_loop;

use crate::error::SessionEnd;
use crate::metrics::StatsSnapshot;
use crate::runtime::{Acceptor, ClientLimit, Engine, EngineContext, Session};
use crossbeam::channel::{unbounded, Receiver, Sender};
use event_loop::{Direction, EventLoop};
use mio::{Poll, Token, Waker};
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

const WAKE_TOKEN: Token = Token(usize::MAX);

type ReactorSession = Session<mio::net::TcpStream>;

/// Hands sessions to an event loop and wakes its poll.
struct Mailbox {
    tx: Sender<ReactorSession>,
    waker: Arc<Waker>,
}

impl Mailbox {
    /// Deliver a session. If the loop already exited the session is dropped,
    /// which closes its socket.
    fn deliver(&self, session: ReactorSession) {
        if self.tx.send(session).is_ok() {
            self.wake();
        }
    }

    fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            debug!(error = %e, "Event loop wake failed");
        }
    }
}

/// Poll and inbox of a loop that has not been started yet.
struct LoopParts {
    poll: Poll,
    inbox: Receiver<ReactorSession>,
}

fn mailbox() -> io::Result<(Mailbox, LoopParts)> {
    let poll = Poll::new()?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
    let (tx, inbox) = unbounded();
    Ok((Mailbox { tx, waker }, LoopParts { poll, inbox }))
}

pub struct ReactorEngine {
    inner: Arc<Inner>,
}

struct Inner {
    ctx: EngineContext,
    acceptor: Acceptor,
    read_mailbox: Mailbox,
    write_mailbox: Mailbox,
    /// Taken by `start`.
    pending: Mutex<Option<(LoopParts, LoopParts)>>,
}

impl ReactorEngine {
    pub(crate) fn new(ctx: EngineContext) -> io::Result<Self> {
        let acceptor = Acceptor::bind(ctx.settings.addr)?;
        let (read_mailbox, read_parts) = mailbox()?;
        let (write_mailbox, write_parts) = mailbox()?;

        Ok(Self {
            inner: Arc::new(Inner {
                ctx,
                acceptor,
                read_mailbox,
                write_mailbox,
                pending: Mutex::new(Some((read_parts, write_parts))),
            }),
        })
    }
}

impl Engine for ReactorEngine {
    fn local_addr(&self) -> SocketAddr {
        self.inner.acceptor.local_addr()
    }

    fn start(&self, limit: ClientLimit) -> io::Result<()> {
        let inner = &self.inner;
        let ctx = &inner.ctx;
        ctx.lifecycle.arm(limit)?;

        let (read_parts, write_parts) = lock(&inner.pending)
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::AlreadyExists, "engine already started"))?;
        ctx.metrics.write_header();

        let loops = [
            spawn_loop(inner, Direction::Read, read_parts)?,
            spawn_loop(inner, Direction::Write, write_parts)?,
        ];

        info!(
            addr = %self.local_addr(),
            workers = ctx.pool.size(),
            limit = ?limit,
            "Reactor engine started"
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

        for handle in loops {
            if handle.join().is_err() {
                error!("Event loop thread panicked");
            }
        }

        ctx.pool.shutdown();
        ctx.pool.join();
        info!("Reactor engine stopped");

        outcome.error.map_or(Ok(()), Err)
    }

    fn shutdown(&self) {
        self.inner.stop();
    }

    fn stats(&self) -> StatsSnapshot {
        self.inner.ctx.stats.snapshot()
    }
}

fn spawn_loop(inner: &Arc<Inner>, direction: Direction, parts: LoopParts) -> io::Result<JoinHandle<()>> {
    let inner = Arc::clone(inner);
    thread::Builder::new()
        .name(direction.thread_name().to_string())
        .spawn(move || {
            let event_loop = EventLoop::new(direction, parts.poll, parts.inbox);
            if let Err(e) = event_loop.run(&inner) {
                error!(direction = ?direction, error = %e, "Event loop failed");
                inner.stop();
            }
        })
}

impl Inner {
    /// Stop the run: retire the pool, release the acceptor and wake both loops.
    fn stop(&self) {
        self.ctx.lifecycle.stop();
        self.ctx.pool.shutdown();
        self.acceptor.wake();
        self.read_mailbox.wake();
        self.write_mailbox.wake();
    }

    /// Make an accepted socket non-blocking and hand it to the read loop.
    fn admit(&self, conn_id: u64, stream: TcpStream) {
        if let Err(e) = stream.set_nonblocking(true) {
            self.close(conn_id, SessionEnd::Violation(e.into()));
            return;
        }
        let settings = &self.ctx.settings;
        let stream = mio::net::TcpStream::from_std(stream);
        self.read_mailbox.deliver(Session::new(
            conn_id,
            stream,
            settings.initial_buffer,
            settings.max_frame_len,
        ));
    }

    /// Run the buffered request on a worker, then pass the session to the
    /// write loop.
    fn dispatch(self: &Arc<Self>, session: ReactorSession) {
        let inner = Arc::clone(self);
        let submitted = self.ctx.pool.submit(move || {
            let mut session = session;
            match session.cycle.process(inner.ctx.transform.as_ref()) {
                Ok(()) => inner.write_mailbox.deliver(session),
                Err(e) => {
                    let conn_id = session.id;
                    drop(session);
                    inner.close(conn_id, SessionEnd::Violation(e));
                }
            }
        });
        // A closed pool means the run is stopping; the job and its session
        // were dropped with it.
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
    use std::time::Duration;

    #[test]
    fn test_mailbox_wakes_poll() {
        let (mailbox, mut parts) = mailbox().unwrap();
        let stream = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
            client.set_nonblocking(true).unwrap();
            mio::net::TcpStream::from_std(client)
        };
        mailbox.deliver(Session::new(7, stream, 16, 1024));

        let mut events = mio::Events::with_capacity(8);
        parts
            .poll
            .poll(&mut events, Some(Duration::from_secs(5)))
            .unwrap();
        assert!(events.iter().any(|event| event.token() == WAKE_TOKEN));
        assert_eq!(parts.inbox.try_recv().unwrap().id, 7);
    }
}
