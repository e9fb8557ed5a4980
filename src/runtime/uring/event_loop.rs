//! Dispatcher loop of the async engine.
//!
//! Each session in the slab has exactly one receive or send in flight.
//! Sessions leave the slab only after that operation completed: to a worker
//! when a request is buffered, or for good when they close.

use super::token::{OpType, TokenAllocator};
use super::{AsyncSession, DispatcherParts, Inner, Notifier};
use crate::error::{FrameError, SessionEnd};
use crate::runtime::session::Phase;
use crate::runtime::{ReadProgress, WriteProgress};
use crossbeam::channel::Receiver;
use io_uring::{opcode, squeue, types, IoUring};
use slab::Slab;
use std::io;
use std::net::Shutdown;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use tracing::{debug, warn};

pub(super) struct Dispatcher {
    index: usize,
    ring: IoUring,
    inbox: Receiver<AsyncSession>,
    notifier: Arc<Notifier>,
    sessions: Slab<AsyncSession>,
    tokens: TokenAllocator,
    /// Target of the armed eventfd read.
    wake_buf: Box<[u8; 8]>,
    /// Sockets were shut down after the run started stopping.
    cancelled: bool,
}

impl Dispatcher {
    pub(super) fn new(index: usize, parts: DispatcherParts, capacity: usize) -> Self {
        Self {
            index,
            ring: parts.ring,
            inbox: parts.inbox,
            notifier: parts.notifier,
            sessions: Slab::with_capacity(capacity),
            tokens: TokenAllocator::new(capacity),
            wake_buf: Box::new([0u8; 8]),
            cancelled: false,
        }
    }

    /// Run until the engine stops and every in-flight operation completed.
    pub(super) fn run(mut self, inner: &Arc<Inner>) -> io::Result<()> {
        self.arm_wake()?;
        debug!(dispatcher = self.index, "Dispatcher started");

        let mut completions = Vec::new();
        loop {
            let stopping = inner.ctx.lifecycle.is_stopping();
            self.drain_inbox(stopping)?;

            if stopping {
                self.cancel_all();
                if self.tokens.is_empty() {
                    break;
                }
            }

            match self.ring.submit_and_wait(1) {
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            completions.clear();
            completions.extend(
                self.ring
                    .completion()
                    .map(|cqe| (cqe.user_data(), cqe.result())),
            );

            for &(token, result) in &completions {
                match self.tokens.free(token) {
                    Some(OpType::Wake) => {
                        if !inner.ctx.lifecycle.is_stopping() {
                            self.arm_wake()?;
                        }
                    }
                    Some(OpType::Read { slot }) => self.on_read(slot, result, inner)?,
                    Some(OpType::Write { slot }) => self.on_write(slot, result, inner)?,
                    None => warn!(token, "Unknown token in completion"),
                }
            }
        }

        debug!(dispatcher = self.index, "Dispatcher exiting");
        Ok(())
    }

    /// Take in sessions from the acceptor and from workers.
    fn drain_inbox(&mut self, stopping: bool) -> io::Result<()> {
        while let Ok(session) = self.inbox.try_recv() {
            if stopping {
                // Closed without accounting, like every session cut off by a stop
                continue;
            }
            let writing = session.cycle.phase() == Phase::AwaitingWrite;
            let slot = self.sessions.insert(session);
            if writing {
                self.submit_write(slot)?;
            } else {
                self.submit_read(slot)?;
            }
        }
        Ok(())
    }

    /// Shut down every live socket once, so pending operations complete.
    fn cancel_all(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        for (_, session) in self.sessions.iter() {
            let _ = session.stream.shutdown(Shutdown::Both);
        }
    }

    fn on_read(&mut self, slot: usize, result: i32, inner: &Arc<Inner>) -> io::Result<()> {
        if self.cancelled {
            self.sessions.try_remove(slot);
            return Ok(());
        }
        let Some(session) = self.sessions.get_mut(slot) else {
            return Ok(());
        };

        let progress = if result >= 0 {
            session.cycle.on_read(result as usize)
        } else if session.cycle.at_frame_boundary() {
            // A failed header read between frames ends the session like EOF
            debug!(
                conn_id = session.id,
                error = %io::Error::from_raw_os_error(-result),
                "Header read failed"
            );
            Ok(ReadProgress::Closed)
        } else {
            Err(FrameError::Io(io::Error::from_raw_os_error(-result)))
        };

        match progress {
            Ok(ReadProgress::Pending) => self.submit_read(slot)?,
            Ok(ReadProgress::Ready) => {
                let session = self.sessions.remove(slot);
                inner.dispatch(self.index, session);
            }
            Ok(ReadProgress::Closed) => self.close(slot, SessionEnd::Graceful, inner),
            Err(e) => self.close(slot, SessionEnd::Violation(e), inner),
        }
        Ok(())
    }

    fn on_write(&mut self, slot: usize, result: i32, inner: &Arc<Inner>) -> io::Result<()> {
        if self.cancelled {
            self.sessions.try_remove(slot);
            return Ok(());
        }
        let Some(session) = self.sessions.get_mut(slot) else {
            return Ok(());
        };

        let progress = if result < 0 {
            Err(FrameError::Io(io::Error::from_raw_os_error(-result)))
        } else {
            session.cycle.on_write(result as usize)
        };

        match progress {
            Ok(WriteProgress::Pending) => self.submit_write(slot)?,
            Ok(WriteProgress::Flushed(timings)) => {
                inner.ctx.metrics.record(&timings);
                inner.ctx.stats.request_completed();
                self.submit_read(slot)?;
            }
            Err(e) => self.close(slot, SessionEnd::Violation(e), inner),
        }
        Ok(())
    }

    fn close(&mut self, slot: usize, end: SessionEnd, inner: &Arc<Inner>) {
        let conn_id = self.sessions.remove(slot).id;
        inner.close(conn_id, end);
    }

    fn arm_wake(&mut self) -> io::Result<()> {
        let token = self.tokens.alloc(OpType::Wake);
        let entry = opcode::Read::new(
            types::Fd(self.notifier.raw_fd()),
            self.wake_buf.as_mut_slice().as_mut_ptr(),
            self.wake_buf.len() as u32,
        )
        .build()
        .user_data(token);
        self.push(token, &entry)
    }

    fn submit_read(&mut self, slot: usize) -> io::Result<()> {
        let token = self.tokens.alloc(OpType::Read { slot });
        let session = &mut self.sessions[slot];
        let fd = types::Fd(session.stream.as_raw_fd());
        let buf = session.cycle.read_buf();
        let entry = opcode::Recv::new(fd, buf.as_mut_ptr(), clamp_len(buf.len()))
            .build()
            .user_data(token);
        self.push(token, &entry)
    }

    fn submit_write(&mut self, slot: usize) -> io::Result<()> {
        let token = self.tokens.alloc(OpType::Write { slot });
        let session = &self.sessions[slot];
        let buf = session.cycle.write_buf();
        let entry = opcode::Send::new(
            types::Fd(session.stream.as_raw_fd()),
            buf.as_ptr(),
            clamp_len(buf.len()),
        )
        .flags(libc::MSG_NOSIGNAL)
        .build()
        .user_data(token);
        self.push(token, &entry)
    }

    /// Queue an entry, flushing the submission queue if it is full.
    fn push(&mut self, token: u64, entry: &squeue::Entry) -> io::Result<()> {
        loop {
            // SAFETY: the buffer behind `entry` is a session buffer held in
            // the slab, or `wake_buf`; neither is freed or resized until the
            // completion for `token` has been reaped.
            if unsafe { self.ring.submission().push(entry) }.is_ok() {
                return Ok(());
            }
            if let Err(e) = self.ring.submit() {
                self.tokens.free(token);
                return Err(e);
            }
        }
    }
}

fn clamp_len(len: usize) -> u32 {
    len.min(u32::MAX as usize) as u32
}
