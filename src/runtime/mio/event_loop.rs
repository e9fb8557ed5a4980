//! Read and write loops of the reactor engine.
//!
//! mio is edge-triggered: every readiness event is drained until
//! `WouldBlock`. Sessions are registered when they arrive in the loop's
//! inbox and deregistered before they leave it, so a fresh registration
//! always reports readiness that is already pending on the socket.

use super::{Inner, ReactorSession, WAKE_TOKEN};
use crate::error::{FrameError, SessionEnd};
use crate::runtime::{ReadProgress, WriteProgress};
use crossbeam::channel::Receiver;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::io::{self, Read, Write};
use std::sync::Arc;
use tracing::debug;

/// Which half of the frame cycle a loop drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Direction {
    Read,
    Write,
}

impl Direction {
    pub(super) fn thread_name(self) -> &'static str {
        match self {
            Direction::Read => "read-loop",
            Direction::Write => "write-loop",
        }
    }

    fn interest(self) -> Interest {
        match self {
            Direction::Read => Interest::READABLE,
            Direction::Write => Interest::WRITABLE,
        }
    }
}

pub(super) struct EventLoop {
    direction: Direction,
    poll: Poll,
    inbox: Receiver<ReactorSession>,
    sessions: Slab<ReactorSession>,
}

impl EventLoop {
    pub(super) fn new(direction: Direction, poll: Poll, inbox: Receiver<ReactorSession>) -> Self {
        Self {
            direction,
            poll,
            inbox,
            sessions: Slab::new(),
        }
    }

    /// Poll until the run is stopping. Sessions still held on exit are
    /// dropped, which closes their sockets.
    pub(super) fn run(mut self, inner: &Arc<Inner>) -> io::Result<()> {
        let mut events = Events::with_capacity(inner.ctx.settings.event_capacity.max(1));
        debug!(direction = ?self.direction, "Event loop started");

        loop {
            // Pick up sessions delivered before the first poll as well
            self.drain_inbox(inner);
            if inner.ctx.lifecycle.is_stopping() {
                break;
            }

            match self.poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            for event in events.iter() {
                match event.token() {
                    WAKE_TOKEN => {}
                    Token(key) => self.on_ready(key, inner),
                }
            }
        }

        debug!(
            direction = ?self.direction,
            dropped = self.sessions.len(),
            "Event loop exiting"
        );
        Ok(())
    }

    fn drain_inbox(&mut self, inner: &Arc<Inner>) {
        while let Ok(mut session) = self.inbox.try_recv() {
            let entry = self.sessions.vacant_entry();
            let token = Token(entry.key());
            match self
                .poll
                .registry()
                .register(&mut session.stream, token, self.direction.interest())
            {
                Ok(()) => {
                    entry.insert(session);
                }
                Err(e) => {
                    let conn_id = session.id;
                    drop(session);
                    inner.close(conn_id, SessionEnd::Violation(e.into()));
                }
            }
        }
    }

    fn on_ready(&mut self, key: usize, inner: &Arc<Inner>) {
        // Stale events for a slot reused in the same batch only cause a
        // spurious WouldBlock
        let Some(session) = self.sessions.get_mut(key) else {
            return;
        };

        match self.direction {
            Direction::Read => match fill(session) {
                Ok(ReadProgress::Pending) => {}
                Ok(ReadProgress::Ready) => {
                    let session = self.release(key);
                    inner.dispatch(session);
                }
                Ok(ReadProgress::Closed) => self.close(key, SessionEnd::Graceful, inner),
                Err(e) => self.close(key, SessionEnd::Violation(e), inner),
            },
            Direction::Write => match flush(session) {
                Ok(WriteProgress::Pending) => {}
                Ok(WriteProgress::Flushed(timings)) => {
                    inner.ctx.metrics.record(&timings);
                    inner.ctx.stats.request_completed();
                    let session = self.release(key);
                    inner.read_mailbox.deliver(session);
                }
                Err(e) => self.close(key, SessionEnd::Violation(e), inner),
            },
        }
    }

    /// Remove a session from this loop so it can move to another owner.
    fn release(&mut self, key: usize) -> ReactorSession {
        let mut session = self.sessions.remove(key);
        if let Err(e) = self.poll.registry().deregister(&mut session.stream) {
            debug!(conn_id = session.id, error = %e, "Deregister failed");
        }
        session
    }

    fn close(&mut self, key: usize, end: SessionEnd, inner: &Arc<Inner>) {
        let session = self.release(key);
        let conn_id = session.id;
        drop(session);
        inner.close(conn_id, end);
    }
}

/// Read until the socket would block or the cycle has a full request.
fn fill(session: &mut ReactorSession) -> Result<ReadProgress, FrameError> {
    loop {
        let n = match session.stream.read(session.cycle.read_buf()) {
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadProgress::Pending),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        match session.cycle.on_read(n)? {
            ReadProgress::Pending => continue,
            done => return Ok(done),
        }
    }
}

/// Write until the socket would block or the response is flushed.
fn flush(session: &mut ReactorSession) -> Result<WriteProgress, FrameError> {
    loop {
        let n = match session.stream.write(session.cycle.write_buf()) {
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(WriteProgress::Pending),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        match session.cycle.on_write(n)? {
            WriteProgress::Pending => continue,
            done => return Ok(done),
        }
    }
}
