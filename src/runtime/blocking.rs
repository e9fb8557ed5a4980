//! Thread-per-connection engine.
//!
//! Each accepted connection gets a reader thread that blocks on the socket
//! and a responder thread that writes replies. The reader never waits for a
//! reply before reading the next request, so requests pipeline through the
//! worker pool. Per-connection order is kept by the reader queueing a reply
//! slot for every request; the responder drains slots strictly in queue
//! order no matter which worker finishes first.

use crate::error::{FrameError, SessionEnd};
use crate::metrics::{RequestTimings, StatsSnapshot};
use crate::protocol::{frame, message};
use crate::runtime::{Acceptor, ClientLimit, Engine, EngineContext, GrowableBuffer};
use crate::transform::Transform;
use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use slab::Slab;
use std::io::{self, BufReader, BufWriter, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info};

/// Encoded response plus the timestamps gathered so far.
struct Reply {
    payload: Vec<u8>,
    received: Instant,
    processing_start: Instant,
    processing_finish: Instant,
}

/// A reply slot, filled by a worker and drained by the responder.
type ReplySlot = Receiver<Result<Reply, FrameError>>;

pub struct BlockingEngine {
    inner: Arc<Inner>,
}

struct Inner {
    ctx: EngineContext,
    acceptor: Acceptor,
    /// Clones of live sockets, for shutting them down on stop.
    live: Mutex<Slab<TcpStream>>,
    connections: Mutex<Vec<JoinHandle<()>>>,
}

impl BlockingEngine {
    pub(crate) fn new(ctx: EngineContext) -> io::Result<Self> {
        let acceptor = Acceptor::bind(ctx.settings.addr)?;
        Ok(Self {
            inner: Arc::new(Inner {
                ctx,
                acceptor,
                live: Mutex::new(Slab::new()),
                connections: Mutex::new(Vec::new()),
            }),
        })
    }
}

impl Engine for BlockingEngine {
    fn local_addr(&self) -> SocketAddr {
        self.inner.acceptor.local_addr()
    }

    fn start(&self, limit: ClientLimit) -> io::Result<()> {
        let inner = &self.inner;
        let ctx = &inner.ctx;
        ctx.lifecycle.arm(limit)?;
        ctx.metrics.write_header();

        info!(
            addr = %self.local_addr(),
            workers = ctx.pool.size(),
            limit = ?limit,
            "Blocking engine started"
        );

        if limit == ClientLimit::Bounded(0) {
            inner.stop();
        }

        let outcome = inner.acceptor.run(limit, &ctx.lifecycle, |stream, peer, conn_id| {
            ctx.stats.connection_accepted();
            debug!(conn_id, peer = %peer, "Accepted connection");

            let conn = Arc::clone(inner);
            let spawned = thread::Builder::new()
                .name(format!("conn-{conn_id}"))
                .spawn(move || conn.serve(conn_id, stream));

            match spawned {
                Ok(handle) => {
                    let mut connections = lock(&inner.connections);
                    connections.retain(|h| !h.is_finished());
                    connections.push(handle);
                }
                Err(e) => {
                    error!(conn_id, error = %e, "Failed to spawn connection thread");
                    if ctx.session_closed(conn_id, SessionEnd::Violation(e.into())) {
                        inner.stop();
                    }
                }
            }
        });

        if ctx.accept_finished(limit, &outcome) {
            inner.stop();
        }

        // No new connection threads can appear once the acceptor returned
        let connections = std::mem::take(&mut *lock(&inner.connections));
        for handle in connections {
            if handle.join().is_err() {
                error!("Connection thread panicked");
            }
        }

        ctx.pool.shutdown();
        ctx.pool.join();
        info!("Blocking engine stopped");

        outcome.error.map_or(Ok(()), Err)
    }

    fn shutdown(&self) {
        self.inner.stop();
    }

    fn stats(&self) -> StatsSnapshot {
        self.inner.ctx.stats.snapshot()
    }
}

impl Inner {
    /// Stop the run: retire the pool, release the acceptor and unblock
    /// every connection thread.
    fn stop(&self) {
        self.ctx.lifecycle.stop();
        self.ctx.pool.shutdown();
        self.acceptor.wake();
        for (_, stream) in lock(&self.live).iter() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn serve(self: Arc<Self>, conn_id: u64, stream: TcpStream) {
        let key = stream.try_clone().ok().map(|clone| lock(&self.live).insert(clone));
        let end = self.run_session(conn_id, stream);
        if let Some(key) = key {
            lock(&self.live).try_remove(key);
        }

        if self.ctx.session_closed(conn_id, end) {
            self.stop();
        }
    }

    fn run_session(self: &Arc<Self>, conn_id: u64, stream: TcpStream) -> SessionEnd {
        let writer = match stream.try_clone() {
            Ok(writer) => writer,
            Err(e) => return SessionEnd::Violation(e.into()),
        };

        let (slots_tx, slots_rx) = unbounded();
        let responder = {
            let inner = Arc::clone(self);
            thread::Builder::new()
                .name(format!("responder-{conn_id}"))
                .spawn(move || inner.respond(writer, slots_rx))
        };
        let responder = match responder {
            Ok(handle) => handle,
            Err(e) => return SessionEnd::Violation(e.into()),
        };

        let read_result = self.read_requests(&stream, &slots_tx);
        drop(slots_tx);
        if read_result.is_err() {
            let _ = stream.shutdown(Shutdown::Both);
        }

        let write_result = responder.join().unwrap_or_else(|_| {
            Err(FrameError::Io(io::Error::new(
                io::ErrorKind::Other,
                "responder thread panicked",
            )))
        });

        match (read_result, write_result) {
            (Err(e), _) | (Ok(()), Err(e)) => SessionEnd::Violation(e),
            (Ok(()), Ok(())) => SessionEnd::Graceful,
        }
    }

    /// Read frames until the peer finishes, queueing one reply slot per request.
    fn read_requests(&self, stream: &TcpStream, slots: &Sender<ReplySlot>) -> Result<(), FrameError> {
        let settings = &self.ctx.settings;
        let mut reader = BufReader::new(stream);
        let mut buf = GrowableBuffer::new(settings.initial_buffer);

        while let Some(len) = frame::read_header(&mut reader, settings.max_frame_len)? {
            let received = Instant::now();
            frame::read_body(&mut reader, &mut buf, len)?;

            // The buffer is reused for the next read while the worker runs
            let payload = buf.filled().to_vec();
            let (reply_tx, reply_rx) = bounded(1);
            if slots.send(reply_rx).is_err() {
                // Responder already failed and reported it
                return Ok(());
            }

            let transform = Arc::clone(&self.ctx.transform);
            let submitted = self.ctx.pool.submit(move || {
                let _ = reply_tx.send(process(&payload, transform.as_ref(), received));
            });
            if submitted.is_err() {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Write replies in slot order.
    fn respond(&self, stream: TcpStream, slots: Receiver<ReplySlot>) -> Result<(), FrameError> {
        let mut writer = BufWriter::new(stream);

        for slot in slots.iter() {
            // A dropped sender means the pool shut down before running the job
            let Ok(reply) = slot.recv() else { break };

            let written = reply.and_then(|reply| {
                frame::write_frame(&mut writer, &reply.payload)?;
                writer.flush()?;
                Ok(reply)
            });

            match written {
                Ok(reply) => {
                    let timings = RequestTimings {
                        received: reply.received,
                        processing_start: reply.processing_start,
                        processing_finish: reply.processing_finish,
                        sent: Instant::now(),
                    };
                    self.ctx.metrics.record(&timings);
                    self.ctx.stats.request_completed();
                }
                Err(e) => {
                    let _ = writer.get_ref().shutdown(Shutdown::Both);
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

/// Decode, transform and re-encode one request payload.
fn process(payload: &[u8], transform: &dyn Transform, received: Instant) -> Result<Reply, FrameError> {
    let processing_start = Instant::now();
    let mut request = message::decode(payload)?;
    transform.apply(&mut request.values);
    let payload = prost::Message::encode_to_vec(&request);

    Ok(Reply {
        payload,
        received,
        processing_start,
        processing_finish: Instant::now(),
    })
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
    use crate::transform::QuadraticSort;

    #[test]
    fn test_process_sorts_payload() {
        let payload = message::encode(&[5, 3, 3, 1]);
        let received = Instant::now();
        let reply = process(&payload, &QuadraticSort, received).unwrap();

        assert_eq!(message::decode(&reply.payload).unwrap().values, vec![1, 3, 3, 5]);
        assert!(reply.received <= reply.processing_start);
        assert!(reply.processing_start <= reply.processing_finish);
    }

    #[test]
    fn test_process_rejects_malformed_payload() {
        let result = process(&[0x0a, 0x05, 0x01], &QuadraticSort, Instant::now());
        assert!(matches!(result, Err(FrameError::Decode(_))));
    }
}
