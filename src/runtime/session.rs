//! Per-connection frame cycle, independent of any I/O model.
//!
//! The reactor and async engines drive the same state machine; only the
//! source of "n bytes were transferred" differs (readiness + non-blocking
//! syscall vs. a completion entry).
//!
//! ```text
//! AwaitingHeader --4 bytes--> AwaitingBody --len bytes--> Processing
//!       ^                                                     |
//!       |                                               worker done
//!       +------------ response flushed ------- AwaitingWrite <+
//! ```
//!
//! One `GrowableBuffer` carries all three regions in turn, so the phase
//! tag also says what the buffer currently holds.

use crate::error::FrameError;
use crate::metrics::RequestTimings;
use crate::protocol::{frame, message, HEADER_LEN};
use crate::runtime::GrowableBuffer;
use crate::transform::Transform;
use std::time::Instant;

/// Where a session is in its frame cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Buffer holds a partially read 4-byte header.
    AwaitingHeader,
    /// Buffer holds a partially read body.
    AwaitingBody,
    /// Buffer is owned by a worker.
    Processing,
    /// Buffer holds a partially written response frame.
    AwaitingWrite,
}

/// Outcome of a read step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadProgress {
    /// Keep reading into [`FrameCycle::read_buf`].
    Pending,
    /// A full request body is buffered; hand the session to a worker.
    Ready,
    /// The peer ended the session at a frame boundary.
    Closed,
}

/// Outcome of a write step.
#[derive(Debug, Clone, Copy)]
pub enum WriteProgress {
    /// Keep writing from [`FrameCycle::write_buf`].
    Pending,
    /// Response fully written; the cycle is back to `AwaitingHeader`.
    Flushed(RequestTimings),
}

/// Frame state machine over a single reusable buffer.
#[derive(Debug)]
pub struct FrameCycle {
    buf: GrowableBuffer,
    phase: Phase,
    max_frame_len: usize,
    body_len: usize,
    received: Instant,
    processing_start: Instant,
    processing_finish: Instant,
}

impl FrameCycle {
    pub fn new(initial_capacity: usize, max_frame_len: usize) -> Self {
        let now = Instant::now();
        let mut cycle = Self {
            buf: GrowableBuffer::new(initial_capacity.max(HEADER_LEN)),
            phase: Phase::AwaitingHeader,
            max_frame_len,
            body_len: 0,
            received: now,
            processing_start: now,
            processing_finish: now,
        };
        cycle.await_header();
        cycle
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[cfg(test)]
    pub fn buffer(&self) -> &GrowableBuffer {
        &self.buf
    }

    /// Whether no byte of the next request has arrived yet.
    pub fn at_frame_boundary(&self) -> bool {
        self.phase == Phase::AwaitingHeader && self.buf.position() == 0
    }

    /// Region the next read should fill. Never empty in a read phase.
    pub fn read_buf(&mut self) -> &mut [u8] {
        debug_assert!(matches!(
            self.phase,
            Phase::AwaitingHeader | Phase::AwaitingBody
        ));
        self.buf.remaining_slice_mut()
    }

    /// Account for a read of `n` bytes; `0` means end of stream.
    pub fn on_read(&mut self, n: usize) -> Result<ReadProgress, FrameError> {
        if n == 0 {
            return match self.phase {
                _ if self.at_frame_boundary() => Ok(ReadProgress::Closed),
                Phase::AwaitingHeader => Err(FrameError::Truncated {
                    received: self.buf.position(),
                    expected: HEADER_LEN,
                }),
                _ => Err(FrameError::Truncated {
                    received: self.buf.position(),
                    expected: self.body_len,
                }),
            };
        }

        self.buf.advance(n);
        if !self.buf.is_full() {
            return Ok(ReadProgress::Pending);
        }

        match self.phase {
            Phase::AwaitingHeader => {
                let mut header = [0u8; HEADER_LEN];
                header.copy_from_slice(self.buf.filled());
                match frame::decode_length(header, self.max_frame_len)? {
                    Some(len) => {
                        self.received = Instant::now();
                        self.body_len = len;
                        self.buf.prepare(len);
                        self.phase = Phase::AwaitingBody;
                        Ok(ReadProgress::Pending)
                    }
                    None => Ok(ReadProgress::Closed),
                }
            }
            Phase::AwaitingBody => {
                self.phase = Phase::Processing;
                Ok(ReadProgress::Ready)
            }
            phase => unreachable!("read completed in {phase:?}"),
        }
    }

    /// Decode, transform and encode the buffered request in place.
    ///
    /// Runs on a worker thread; afterwards the buffer holds the response frame.
    pub fn process(&mut self, transform: &dyn Transform) -> Result<(), FrameError> {
        debug_assert_eq!(self.phase, Phase::Processing);
        self.processing_start = Instant::now();

        let mut request = message::decode(self.buf.filled())?;
        transform.apply(&mut request.values);
        frame::encode_frame_into(&request, &mut self.buf);

        self.processing_finish = Instant::now();
        self.phase = Phase::AwaitingWrite;
        Ok(())
    }

    /// Bytes still to be written.
    pub fn write_buf(&self) -> &[u8] {
        debug_assert_eq!(self.phase, Phase::AwaitingWrite);
        self.buf.remaining_slice()
    }

    /// Account for a write of `n` bytes.
    pub fn on_write(&mut self, n: usize) -> Result<WriteProgress, FrameError> {
        if n == 0 {
            return Err(FrameError::WriteZero);
        }
        self.buf.advance(n);
        if !self.buf.is_full() {
            return Ok(WriteProgress::Pending);
        }

        let timings = RequestTimings {
            received: self.received,
            processing_start: self.processing_start,
            processing_finish: self.processing_finish,
            sent: Instant::now(),
        };
        self.await_header();
        Ok(WriteProgress::Flushed(timings))
    }

    fn await_header(&mut self) {
        self.buf.prepare(HEADER_LEN);
        self.body_len = 0;
        self.phase = Phase::AwaitingHeader;
    }
}

/// A connection together with its frame cycle.
#[derive(Debug)]
pub struct Session<S> {
    /// Engine-wide connection number, for logs.
    pub id: u64,
    pub stream: S,
    pub cycle: FrameCycle,
}

impl<S> Session<S> {
    pub fn new(id: u64, stream: S, initial_capacity: usize, max_frame_len: usize) -> Self {
        Self {
            id,
            stream,
            cycle: FrameCycle::new(initial_capacity, max_frame_len),
        }
    }
}
