//! Blocking accept loop shared by all engines.
//!
//! The engine's `start` thread becomes the acceptor. It hands each accepted
//! socket to the engine and stops after the client limit is reached or when
//! the run is stopping. Stopping an acceptor parked in `accept` is done by
//! connecting to it from loopback; that socket is dropped unserved.

use crate::runtime::{ClientLimit, Lifecycle};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error};

const LISTEN_BACKLOG: i32 = 1024;

pub struct Acceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
    accepting: AtomicBool,
}

/// How the accept loop ended.
#[derive(Debug)]
pub struct AcceptOutcome {
    /// Connections handed to the engine.
    pub accepted: u64,
    /// Fatal listener error, if that is what ended the loop.
    pub error: Option<io::Error>,
}

impl Acceptor {
    /// Bind a listener on `addr`.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = create_listener(addr)?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            accepting: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept until `limit` connections were handed off, the run stops, or
    /// the listener fails.
    pub fn run<F>(&self, limit: ClientLimit, lifecycle: &Lifecycle, mut on_accept: F) -> AcceptOutcome
    where
        F: FnMut(TcpStream, SocketAddr, u64),
    {
        self.accepting.store(true, Ordering::Release);
        let mut accepted = 0u64;
        let mut failure = None;

        while limit.admits(accepted) && !lifecycle.is_stopping() {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if lifecycle.is_stopping() {
                        break;
                    }
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                    on_accept(stream, peer, accepted);
                    accepted += 1;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    failure = Some(e);
                    break;
                }
            }
        }

        self.accepting.store(false, Ordering::Release);
        AcceptOutcome {
            accepted,
            error: failure,
        }
    }

    /// Unblock a pending `accept` so the loop can observe a stop request.
    pub fn wake(&self) {
        if !self.accepting.load(Ordering::Acquire) {
            return;
        }
        let target = SocketAddr::new(loopback_for(self.local_addr.ip()), self.local_addr.port());
        if let Err(e) = TcpStream::connect_timeout(&target, Duration::from_secs(1)) {
            debug!(error = %e, "Acceptor wake-up connect failed");
        }
    }
}

fn loopback_for(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(v4) if v4.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(v6) if v6.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        other => other,
    }
}

/// Create a blocking TCP listener with address reuse.
fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}
